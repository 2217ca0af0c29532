//! Similarity metrics for fuzzy edit matching

use std::collections::HashSet;

/// Similarity in `[0.0, 1.0]`, 1.0 meaning identical
pub trait SimilarityMetric: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;

    /// Cheap ceiling on `similarity(a, b)`; windows below the threshold are never scored
    fn upper_bound(&self, _a: &str, _b: &str) -> f64 {
        1.0
    }

    /// Exact score when it reaches `floor`, `None` otherwise
    fn similarity_at_least(&self, a: &str, b: &str, floor: f64) -> Option<f64> {
        let score = self.similarity(a, b);
        (score >= floor).then_some(score)
    }

    /// Work units one `similarity_at_least` call may spend
    fn cost(&self, a: &str, b: &str, _floor: f64) -> usize {
        a.len() + b.len()
    }

    fn name(&self) -> &str;
}

fn collapse_whitespace(s: &str) -> Vec<char> {
    let mut out = Vec::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars());
    }
    out
}

/// Normalised Levenshtein similarity over whitespace-collapsed text
#[derive(Debug, Default, Clone, Copy)]
pub struct Levenshtein;

/// Largest edit distance that still scores at least `floor`
fn allowed_edits(longest: usize, floor: f64) -> usize {
    let slack = (1.0 - floor.clamp(0.0, 1.0)) * longest as f64;
    (slack + 1e-9).floor() as usize
}

impl SimilarityMetric for Levenshtein {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = collapse_whitespace(a);
        let b = collapse_whitespace(b);
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 1.0;
        }
        1.0 - edit_distance(&a, &b) as f64 / longest as f64
    }

    fn upper_bound(&self, a: &str, b: &str) -> f64 {
        let a = collapse_whitespace(a);
        let b = collapse_whitespace(b);
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 1.0;
        }
        1.0 - distance_lower_bound(&a, &b) as f64 / longest as f64
    }

    fn similarity_at_least(&self, a: &str, b: &str, floor: f64) -> Option<f64> {
        let a = collapse_whitespace(a);
        let b = collapse_whitespace(b);
        let longest = a.len().max(b.len());
        if longest == 0 {
            return (1.0 >= floor).then_some(1.0);
        }
        let distance = bounded_edit_distance(&a, &b, allowed_edits(longest, floor))?;
        let score = 1.0 - distance as f64 / longest as f64;
        (score >= floor).then_some(score)
    }

    fn cost(&self, a: &str, b: &str, floor: f64) -> usize {
        let longest = a.len().max(b.len());
        longest.saturating_mul(2 * allowed_edits(longest, floor) + 1)
    }

    fn name(&self) -> &str {
        "levenshtein"
    }
}

/// Two-row dynamic programming edit distance
pub fn edit_distance(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit distance if it is at most `max`, computed inside a diagonal band
///
/// Stops as soon as every cell of a row exceeds `max`.
pub fn bounded_edit_distance(a: &[char], b: &[char], max: usize) -> Option<usize> {
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    if a.is_empty() || b.is_empty() {
        return Some(a.len().max(b.len()));
    }

    const FAR: usize = usize::MAX / 2;
    let width = b.len() + 1;
    let mut prev: Vec<usize> = (0..width).map(|j| if j <= max { j } else { FAR }).collect();
    let mut curr = vec![FAR; width];

    for (i, ca) in a.iter().enumerate() {
        let row = i + 1;
        let lo = row.saturating_sub(max).max(1);
        let hi = (row + max).min(b.len());

        curr[lo - 1] = if lo == 1 && row <= max { row } else { FAR };
        let mut row_min = curr[lo - 1];
        for j in lo..=hi {
            let substitution = prev[j - 1] + usize::from(*ca != b[j - 1]);
            let value = substitution.min(prev[j] + 1).min(curr[j - 1] + 1);
            curr[j] = value;
            row_min = row_min.min(value);
        }
        if hi < b.len() {
            curr[hi + 1] = FAR;
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let distance = prev[b.len()];
    (distance <= max).then_some(distance)
}

/// Character-count lower bound on the edit distance
///
/// Every edit removes at most one surplus and one missing character, so the
/// larger of the two totals bounds the distance from below.
fn distance_lower_bound(a: &[char], b: &[char]) -> usize {
    let mut counts = [0i64; 256];
    for c in a {
        counts[(*c as u32 % 256) as usize] += 1;
    }
    for c in b {
        counts[(*c as u32 % 256) as usize] -= 1;
    }
    let (surplus, missing) = counts.iter().fold((0i64, 0i64), |(s, m), &n| {
        if n > 0 {
            (s + n, m)
        } else {
            (s, m - n)
        }
    });
    surplus.max(missing) as usize
}

/// Jaccard overlap of whitespace-separated tokens
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenOverlap;

impl SimilarityMetric for TokenOverlap {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let left: HashSet<&str> = a.split_whitespace().collect();
        let right: HashSet<&str> = b.split_whitespace().collect();
        if left.is_empty() && right.is_empty() {
            return 1.0;
        }
        let shared = left.intersection(&right).count();
        let union = left.union(&right).count();
        shared as f64 / union as f64
    }

    fn name(&self) -> &str {
        "token_overlap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(edit_distance(&chars(""), &chars("abc")), 3);
        assert_eq!(edit_distance(&chars("same"), &chars("same")), 0);
    }

    #[test]
    fn test_bounded_distance_agrees_within_band() {
        let pairs = [
            ("kitten", "sitting"),
            ("flaw", "lawn"),
            ("abc", "abc"),
            ("retries: u32", "retires: u32"),
            ("abcdef", "azcedf"),
            ("", "xy"),
        ];
        for (a, b) in pairs {
            let (a, b) = (chars(a), chars(b));
            let exact = edit_distance(&a, &b);
            assert_eq!(bounded_edit_distance(&a, &b, exact), Some(exact));
            assert_eq!(bounded_edit_distance(&a, &b, exact + 3), Some(exact));
            if exact > 0 {
                assert_eq!(bounded_edit_distance(&a, &b, exact - 1), None);
            }
        }
    }

    #[test]
    fn test_bounded_distance_rejects_length_gap() {
        assert_eq!(bounded_edit_distance(&chars("a"), &chars("abcdef"), 2), None);
    }

    #[test]
    fn test_lower_bound_never_exceeds_distance() {
        let pairs = [("kitten", "sitting"), ("abc", "cba"), ("zzzz", "a"), ("", "abc")];
        for (a, b) in pairs {
            let (a, b) = (chars(a), chars(b));
            assert!(distance_lower_bound(&a, &b) <= edit_distance(&a, &b));
        }
        assert_eq!(distance_lower_bound(&chars("zzzz"), &chars("aaaa")), 4);
    }

    #[test]
    fn test_levenshtein_ignores_whitespace_runs() {
        let metric = Levenshtein;
        assert_eq!(metric.similarity("let  x =\n 1;", "let x = 1;"), 1.0);
        assert_eq!(metric.similarity("", ""), 1.0);
        let score = metric.similarity("fn main() {}", "fn mian() {}");
        assert!(score > 0.8 && score < 1.0);
    }

    #[test]
    fn test_levenshtein_floor_matches_full_score() {
        let metric = Levenshtein;
        let full = metric.similarity("value_c = 1", "value_a = 1");
        assert_eq!(metric.similarity_at_least("value_c = 1", "value_a = 1", 0.9), Some(full));
        assert_eq!(metric.similarity_at_least("value_c = 1", "value_a = 1", 0.95), None);
        // exactly on the floor
        assert_eq!(metric.similarity_at_least("abcdefghij", "abcdefghiX", 0.9), Some(0.9));
        assert!(metric.upper_bound("value_c = 1", "value_a = 1") >= full);
    }

    #[test]
    fn test_token_overlap() {
        let metric = TokenOverlap;
        assert_eq!(metric.similarity("a b c", "c b a"), 1.0);
        assert!((metric.similarity("a b", "b c") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(metric.similarity("x", "y"), 0.0);
        assert_eq!(metric.upper_bound("x", "y"), 1.0);
    }
}
