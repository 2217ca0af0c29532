//! Task drift scoring

use std::collections::HashSet;

/// Scores how far recent actions have wandered from the task, 0.0 (on task) to 1.0
pub trait DriftStrategy: Send + Sync {
    fn divergence(&self, task: &str, actions: &[&str]) -> f64;

    fn name(&self) -> &str;
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "then", "than", "are", "was",
    "were", "will", "can", "should", "would", "could", "have", "has", "had", "not", "but", "all",
    "any", "you", "your", "our", "its", "use", "using", "make", "please", "need", "want", "also",
    "some", "there", "their", "them", "what", "when", "where", "which", "who", "how", "why",
];

/// Lowercase alphanumeric tokens of length >= 3, minus stop words
pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_ascii_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Divergence = 1 - |task ∩ actions| / |task|
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalOverlap;

impl DriftStrategy for LexicalOverlap {
    fn divergence(&self, task: &str, actions: &[&str]) -> f64 {
        let task_words = keywords(task);
        if task_words.is_empty() {
            return 0.0;
        }
        let mut action_words = HashSet::new();
        for action in actions {
            action_words.extend(keywords(action));
        }
        let shared = task_words.intersection(&action_words).count();
        1.0 - shared as f64 / task_words.len() as f64
    }

    fn name(&self) -> &str {
        "lexical_overlap"
    }
}
