//! Fixed-capacity sliding window

/// Ring buffer that keeps the most recent `capacity` items
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    items: Vec<T>,
    head: usize,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        } else {
            self.items[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = self.items.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.head = 0;
    }
}
