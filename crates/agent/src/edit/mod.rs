//! Self-healing edit resolution
//!
//! Resolves an `old_string -> new_string` replacement against file content
//! when the model's `old_string` is close to, but not byte-identical with,
//! the file. Strategies run cheapest first and stop at the first accepted
//! candidate:
//!
//! 1. exact substring (must be unique)
//! 2. normalised exact: display tab indicators, CRLF, non-breaking spaces
//! 3. line-trimmed match
//! 4. similarity-scored sliding windows
//! 5. remote assist
//!
//! Steps 3 and 4 are skipped for files above `max_fuzzy_bytes`. Step 4 scores
//! windows in order of the metric's cheap upper bound and stops once no
//! remaining window can reach the threshold or the work budget is spent.
//! Local matching runs on the blocking pool.

mod remote;
mod similarity;

pub use remote::{HttpRemoteAssist, RemoteAssist, RemoteError, RemoteRequest, RemoteResolution};
pub use similarity::{edit_distance, Levenshtein, SimilarityMetric, TokenOverlap};

use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use warden_config::EditConfig;

/// Confidence assigned to a line-trimmed match
pub const LINE_TRIMMED_CONFIDENCE: f64 = 0.95;

const REMOTE_ATTEMPTS: usize = 2;
const SCORE_EPSILON: f64 = 1e-9;

/// Metric work units one fuzzy scan may spend
pub const FUZZY_WORK_BUDGET: usize = 64_000_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error("◆ OLD STRING IS EMPTY")]
    EmptyOldString,

    #[error("◆ OLD STRING MATCHES {count} LOCATIONS; ADD SURROUNDING CONTEXT")]
    Ambiguous { count: usize },

    #[error("◆ EDIT UNRESOLVED (best score {score:.2}){}", candidate_hint(.best_candidate))]
    Unresolved {
        best_candidate: Option<String>,
        score: f64,
    },

    #[error("◆ EDIT MATCHING ABORTED: {0}")]
    Aborted(String),
}

fn candidate_hint(candidate: &Option<String>) -> String {
    match candidate {
        Some(text) => format!("\nClosest match:\n{}", text),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Normalized,
    LineTrimmed,
    Fuzzy,
    Remote,
}

impl std::fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::Normalized => "normalized",
            MatchStrategy::LineTrimmed => "line_trimmed",
            MatchStrategy::Fuzzy => "fuzzy",
            MatchStrategy::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// An accepted edit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub new_content: String,
    pub confidence: f64,
    pub strategy: MatchStrategy,
    /// Text of the file that was replaced
    pub matched: String,
    /// 1-based line where the replaced text starts
    pub line: usize,
}

/// Best rejected candidate, carried into `Unresolved`
#[derive(Debug, Clone, Default)]
struct BestCandidate {
    text: Option<String>,
    score: f64,
}

impl BestCandidate {
    fn offer(&mut self, text: &str, score: f64) {
        if self.text.is_none() || score > self.score {
            self.text = Some(text.to_string());
            self.score = score;
        }
    }

    fn into_error(self) -> EditError {
        EditError::Unresolved {
            best_candidate: self.text,
            score: self.score,
        }
    }
}

enum Local {
    Resolved(Resolution),
    Failed(EditError),
    Unmatched(BestCandidate),
}

pub struct EditResolver {
    matcher: LocalMatcher,
    remote: Option<Arc<dyn RemoteAssist>>,
    remote_timeout: Duration,
}

impl EditResolver {
    pub fn new(config: &EditConfig) -> Self {
        Self {
            matcher: LocalMatcher {
                threshold: config.confidence_threshold,
                max_fuzzy_bytes: config.max_fuzzy_bytes,
                work_budget: FUZZY_WORK_BUDGET,
                metric: Arc::new(Levenshtein),
            },
            remote: None,
            remote_timeout: Duration::from_millis(config.remote_timeout_ms),
        }
    }

    pub fn with_metric(mut self, metric: Box<dyn SimilarityMetric>) -> Self {
        self.matcher.metric = Arc::from(metric);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteAssist>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_work_budget(mut self, budget: usize) -> Self {
        self.matcher.work_budget = budget;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.matcher.threshold
    }

    pub async fn resolve(
        &self,
        content: &str,
        old_string: &str,
        new_string: &str,
    ) -> Result<Resolution, EditError> {
        let matcher = self.matcher.clone();
        let (owned_content, owned_old, owned_new) = (
            content.to_string(),
            old_string.to_string(),
            new_string.to_string(),
        );
        let local = tokio::task::spawn_blocking(move || {
            matcher.resolve_local(&owned_content, &owned_old, &owned_new)
        })
        .await
        .map_err(|e| EditError::Aborted(e.to_string()))?;

        let best = match local {
            Local::Resolved(resolution) => {
                info!(
                    strategy = %resolution.strategy,
                    confidence = resolution.confidence,
                    line = resolution.line,
                    "◆ EDIT RESOLVED"
                );
                return Ok(resolution);
            }
            Local::Failed(err) => return Err(err),
            Local::Unmatched(best) => best,
        };
        self.resolve_remote(content, old_string, new_string, best)
            .await
    }

    async fn resolve_remote(
        &self,
        content: &str,
        old_string: &str,
        new_string: &str,
        mut best: BestCandidate,
    ) -> Result<Resolution, EditError> {
        let Some(remote) = &self.remote else {
            return Err(best.into_error());
        };

        for attempt in 1..=REMOTE_ATTEMPTS {
            let call = remote.resolve_edit(content, old_string, new_string);
            let result = match tokio::time::timeout(self.remote_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };

            let resolution = match result {
                Ok(resolution) => resolution,
                Err(err) => {
                    warn!(attempt, error = %err, "◆ REMOTE ASSIST FAILED");
                    continue;
                }
            };

            let exact = resolution.exact_old_string.as_str();
            let occurrences = if exact.is_empty() {
                0
            } else {
                content.matches(exact).count()
            };
            if occurrences == 1 && resolution.confidence >= self.matcher.threshold {
                if let Some(start) = content.find(exact) {
                    let new = reindent(new_string, old_string, exact);
                    let accepted = splice(
                        content,
                        start..start + exact.len(),
                        &new,
                        resolution.confidence,
                        MatchStrategy::Remote,
                    );
                    info!(
                        confidence = accepted.confidence,
                        line = accepted.line,
                        "◆ EDIT RESOLVED BY REMOTE ASSIST"
                    );
                    return Ok(accepted);
                }
            }

            debug!(
                occurrences,
                confidence = resolution.confidence,
                "◆ REMOTE ASSIST RESULT REJECTED"
            );
            if occurrences == 1 {
                best.offer(exact, resolution.confidence);
            }
            break;
        }

        Err(best.into_error())
    }
}

/// Local strategies; cloned onto the blocking pool for each resolve
#[derive(Clone)]
struct LocalMatcher {
    threshold: f64,
    max_fuzzy_bytes: usize,
    work_budget: usize,
    metric: Arc<dyn SimilarityMetric>,
}

impl LocalMatcher {
    fn resolve_local(&self, content: &str, old_string: &str, new_string: &str) -> Local {
        if old_string.is_empty() {
            return Local::Failed(EditError::EmptyOldString);
        }

        match unique_match(content, old_string) {
            Ok(Some(start)) => {
                return Local::Resolved(splice(
                    content,
                    start..start + old_string.len(),
                    new_string,
                    1.0,
                    MatchStrategy::Exact,
                ))
            }
            Err(err) => return Local::Failed(err),
            Ok(None) => {}
        }

        for (old, new) in normalized_variants(content, old_string, new_string) {
            match unique_match(content, &old) {
                Ok(Some(start)) => {
                    return Local::Resolved(splice(
                        content,
                        start..start + old.len(),
                        &new,
                        1.0,
                        MatchStrategy::Normalized,
                    ))
                }
                Err(err) => return Local::Failed(err),
                Ok(None) => {}
            }
        }

        let mut best = BestCandidate::default();
        if content.len() >= self.max_fuzzy_bytes {
            debug!(
                bytes = content.len(),
                limit = self.max_fuzzy_bytes,
                "◆ FILE TOO LARGE FOR FUZZY MATCHING"
            );
            return Local::Unmatched(best);
        }

        let lines = line_spans(content);
        let (old_body, new_body) = strip_trailing_newline(old_string, new_string);

        match line_trimmed_match(content, &lines, old_body) {
            Ok(Some(range)) => {
                let matched = &content[range.clone()];
                if LINE_TRIMMED_CONFIDENCE >= self.threshold {
                    let new = reindent(new_body, old_body, matched);
                    return Local::Resolved(splice(
                        content,
                        range,
                        &new,
                        LINE_TRIMMED_CONFIDENCE,
                        MatchStrategy::LineTrimmed,
                    ));
                }
                best.offer(matched, LINE_TRIMMED_CONFIDENCE);
            }
            Err(err) => return Local::Failed(err),
            Ok(None) => {}
        }

        let scan = self.best_window(content, &lines, old_body);
        match scan.accepted {
            Some(window) if !window.tied => {
                let matched = &content[window.range.clone()];
                let new = reindent(new_body, old_body, matched);
                Local::Resolved(splice(
                    content,
                    window.range,
                    &new,
                    window.score,
                    MatchStrategy::Fuzzy,
                ))
            }
            Some(window) => {
                debug!(score = window.score, "◆ FUZZY TIE REJECTED");
                best.offer(&content[window.range], window.score);
                Local::Unmatched(best)
            }
            None => {
                if let Some((range, score)) = scan.nearest {
                    best.offer(&content[range], score);
                }
                Local::Unmatched(best)
            }
        }
    }

    /// Best window of `old`'s line count, give or take one line
    ///
    /// Windows are scored in descending order of the metric's upper bound.
    /// After one window reaches the threshold, only windows that could tie or
    /// beat it are scored.
    fn best_window(&self, content: &str, lines: &[Range<usize>], old: &str) -> WindowScan {
        let target_lines = old.lines().count().max(1);
        let min_size = target_lines.saturating_sub(1).max(1);
        let max_size = (target_lines + 1).min(lines.len());

        let mut candidates: Vec<(Range<usize>, f64)> = Vec::new();
        for size in min_size..=max_size {
            for start in 0..=(lines.len() - size) {
                let range = lines[start].start..lines[start + size - 1].end;
                let bound = self.metric.upper_bound(old, &content[range.clone()]);
                candidates.push((range, bound));
            }
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.start.cmp(&b.0.start)));

        let mut accepted: Option<Window> = None;
        let mut spent = 0usize;
        for (range, bound) in &candidates {
            let floor = match &accepted {
                Some(current) => current.score - SCORE_EPSILON,
                None => self.threshold,
            };
            if *bound < floor {
                break;
            }

            let window = &content[range.clone()];
            let cost = self.metric.cost(old, window, floor);
            if spent > 0 && spent.saturating_add(cost) > self.work_budget {
                debug!(spent, budget = self.work_budget, "◆ FUZZY WORK BUDGET SPENT");
                break;
            }
            spent = spent.saturating_add(cost);

            let Some(score) = self.metric.similarity_at_least(old, window, floor) else {
                continue;
            };
            match &mut accepted {
                Some(current) if score <= current.score + SCORE_EPSILON => {
                    if !overlaps(&current.range, range) {
                        current.tied = true;
                    }
                }
                _ => {
                    accepted = Some(Window {
                        range: range.clone(),
                        score,
                        tied: false,
                    })
                }
            }
        }

        let nearest = match &accepted {
            Some(_) => None,
            None => candidates.first().map(|(range, bound)| {
                let window = &content[range.clone()];
                let score = if self.metric.cost(old, window, 0.0) <= self.work_budget {
                    self.metric.similarity(old, window)
                } else {
                    *bound
                };
                (range.clone(), score)
            }),
        };
        WindowScan { accepted, nearest }
    }
}


struct Window {
    range: Range<usize>,
    score: f64,
    tied: bool,
}

struct WindowScan {
    /// Best window at or above the threshold
    accepted: Option<Window>,
    /// Most promising window when none was accepted, with its score
    nearest: Option<(Range<usize>, f64)>,
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Byte offset of the single occurrence; `Ambiguous` when there are several
fn unique_match(content: &str, needle: &str) -> Result<Option<usize>, EditError> {
    let mut found = content.match_indices(needle).map(|(i, _)| i);
    let Some(first) = found.next() else {
        return Ok(None);
    };
    let rest = found.count();
    if rest > 0 {
        return Err(EditError::Ambiguous { count: rest + 1 });
    }
    Ok(Some(first))
}

fn splice(
    content: &str,
    range: Range<usize>,
    replacement: &str,
    confidence: f64,
    strategy: MatchStrategy,
) -> Resolution {
    let line = content[..range.start].matches('\n').count() + 1;
    let mut new_content = String::with_capacity(content.len() + replacement.len());
    new_content.push_str(&content[..range.start]);
    new_content.push_str(replacement);
    new_content.push_str(&content[range.end..]);
    Resolution {
        new_content,
        confidence,
        strategy,
        matched: content[range].to_string(),
        line,
    }
}

/// Display tab arrows become tabs, NBSP becomes a space
fn normalize_display(text: &str) -> String {
    text.replace("→\t", "\t")
        .replace('→', "\t")
        .replace('\u{a0}', " ")
}

/// Candidate `(old, new)` pairs after formatting normalisation, most likely first
fn normalized_variants(content: &str, old: &str, new: &str) -> Vec<(String, String)> {
    let old_norm = normalize_display(old);
    let new_norm = normalize_display(new);
    let content_crlf = content.contains("\r\n");

    let mut variants = vec![(old_norm.clone(), new_norm.clone())];
    if content_crlf && !old_norm.contains("\r\n") {
        variants.push((
            old_norm.replace('\n', "\r\n"),
            new_norm.replace("\r\n", "\n").replace('\n', "\r\n"),
        ));
    }
    if !content_crlf && old_norm.contains("\r\n") {
        variants.push((old_norm.replace("\r\n", "\n"), new_norm.replace("\r\n", "\n")));
    }

    let mut seen: Vec<(String, String)> = Vec::new();
    for variant in variants {
        if variant.0 != old && !variant.0.is_empty() && !seen.iter().any(|s| s.0 == variant.0) {
            seen.push(variant);
        }
    }
    seen
}

/// Byte ranges of each line, line terminators excluded
fn line_spans(content: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for line in content.split_inclusive('\n') {
        let body = line.strip_suffix('\n').unwrap_or(line);
        let body = body.strip_suffix('\r').unwrap_or(body);
        spans.push(start..start + body.len());
        start += line.len();
    }
    spans
}

fn strip_trailing_newline<'a>(old: &'a str, new: &'a str) -> (&'a str, &'a str) {
    match old.strip_suffix('\n') {
        Some(old_body) => (old_body, new.strip_suffix('\n').unwrap_or(new)),
        None => (old, new),
    }
}

/// Unique run of lines equal to `old` after trimming each line
fn line_trimmed_match(
    content: &str,
    lines: &[Range<usize>],
    old: &str,
) -> Result<Option<Range<usize>>, EditError> {
    let target: Vec<&str> = old.lines().map(str::trim).collect();
    if target.is_empty() || target.len() > lines.len() || target.iter().all(|l| l.is_empty()) {
        return Ok(None);
    }

    let mut matches = Vec::new();
    for start in 0..=(lines.len() - target.len()) {
        let hit = target
            .iter()
            .enumerate()
            .all(|(j, want)| content[lines[start + j].clone()].trim() == *want);
        if hit {
            matches.push(lines[start].start..lines[start + target.len() - 1].end);
        }
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        count => Err(EditError::Ambiguous { count }),
    }
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

fn first_indent(text: &str) -> Option<&str> {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .map(leading_whitespace)
}

/// Shift `new`'s indentation by the difference between `old` and the matched text
fn reindent(new: &str, old: &str, matched: &str) -> String {
    let (Some(from), Some(to)) = (first_indent(old), first_indent(matched)) else {
        return new.to_string();
    };
    if from == to {
        return new.to_string();
    }

    let mut out = String::with_capacity(new.len());
    for (i, line) in new.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        match line.strip_prefix(from) {
            Some(rest) if !line.trim().is_empty() => {
                out.push_str(to);
                out.push_str(rest);
            }
            _ => out.push_str(line),
        }
    }
    out
}
