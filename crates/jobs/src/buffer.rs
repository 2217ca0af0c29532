//! Append-only output buffer shared between one writer and many readers

use std::sync::{Arc, RwLock};

/// Shared byte buffer. Each chunk is appended under a single write lock, so a
/// reader always observes a prefix of everything written.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        let mut data = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        data.extend_from_slice(chunk);
    }

    /// Copy of everything written so far
    pub fn snapshot(&self) -> Vec<u8> {
        match self.inner.read() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(data) => data.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let buffer = OutputBuffer::new();
        assert!(buffer.is_empty());
        buffer.append(b"hello ");
        buffer.append(b"world");
        assert_eq!(buffer.snapshot(), b"hello world");
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.to_string_lossy(), "hello world");
    }

    #[test]
    fn test_clones_share_storage() {
        let writer = OutputBuffer::new();
        let reader = writer.clone();
        writer.append(b"abc");
        assert_eq!(reader.snapshot(), b"abc");
    }

    #[test]
    fn test_concurrent_readers_see_prefixes() {
        let buffer = OutputBuffer::new();
        let chunk: Vec<u8> = (0..64u8).collect();

        let mut expected = Vec::new();
        for _ in 0..500 {
            expected.extend_from_slice(&chunk);
        }
        let expected = Arc::new(expected);

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let buffer = buffer.clone();
                let expected = expected.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let seen = buffer.snapshot();
                        assert_eq!(seen.len() % chunk_len(), 0, "partial chunk observed");
                        assert_eq!(&expected[..seen.len()], &seen[..]);
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            buffer.append(&chunk);
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.snapshot(), *expected);
    }

    fn chunk_len() -> usize {
        64
    }
}
