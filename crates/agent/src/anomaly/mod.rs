//! Loop, drift and repeated-failure detection over recent tool actions
//!
//! Recording never blocks dispatch: warnings are queued and drained by the
//! coordinator at the start of the next step.

mod drift;
mod failures;
mod fingerprint;
mod window;

pub use drift::{keywords, DriftStrategy, LexicalOverlap};
pub use failures::{EditFailure, FailureTracker, EDIT_TOOL};
pub use fingerprint::ActionFingerprint;
pub use window::SlidingWindow;

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use warden_config::AnomalyConfig;
use warden_provider::{Message, ToolCall};

/// Repetition shape found in the loop window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopPattern {
    Repeated(ActionFingerprint),
    Cycle(Vec<ActionFingerprint>),
}

impl LoopPattern {
    fn key(&self) -> String {
        match self {
            LoopPattern::Repeated(fp) => format!("repeat:{}", fp.hash),
            LoopPattern::Cycle(cycle) => {
                let hashes: Vec<&str> = cycle.iter().map(|fp| fp.hash.as_str()).collect();
                format!("cycle:{}", hashes.join(">"))
            }
        }
    }
}

impl std::fmt::Display for LoopPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopPattern::Repeated(fp) => write!(f, "{}", fp.tool),
            LoopPattern::Cycle(cycle) => {
                let tools: Vec<&str> = cycle.iter().map(|fp| fp.tool.as_str()).collect();
                write!(f, "{}", tools.join(" -> "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    Loop {
        pattern: LoopPattern,
        occurrences: usize,
    },
    Drift {
        score: f64,
        threshold: f64,
    },
    /// Same error on the same target, several failures in a row
    RepeatedFailure {
        target: String,
        occurrences: usize,
    },
    EditCircuitOpen {
        path: String,
        failures: usize,
        cause: EditFailure,
    },
}

impl Anomaly {
    /// Informational system message for the model
    pub fn to_message(&self) -> Message {
        let text = match self {
            Anomaly::Loop {
                pattern: LoopPattern::Repeated(_),
                occurrences,
            } => format!(
                "[LOOP DETECTED] The same `{}` call was made {} times in the last few actions. \
                 The result will not change. Try a different approach or explain what is blocking you.",
                self.pattern_label(),
                occurrences
            ),
            Anomaly::Loop { occurrences, .. } => format!(
                "[LOOP DETECTED] The action cycle `{}` repeated {} times. \
                 Break the cycle: change strategy or report the blocker.",
                self.pattern_label(),
                occurrences
            ),
            Anomaly::Drift { score, .. } => format!(
                "[DRIFT DETECTED] Recent actions have little to do with the original task \
                 (divergence {:.2}). Refocus on the task or explain the detour.",
                score
            ),
            Anomaly::RepeatedFailure {
                target,
                occurrences,
            } => format!(
                "[REPEATED FAILURE] `{}` failed {} times in a row with the same error. \
                 Retrying unchanged will fail again; read the error and change the approach.",
                target, occurrences
            ),
            Anomaly::EditCircuitOpen {
                path,
                failures,
                cause,
            } => edit_circuit_notice(path, *failures, *cause),
        };
        Message::system(text)
    }

    fn pattern_label(&self) -> String {
        match self {
            Anomaly::Loop { pattern, .. } => pattern.to_string(),
            _ => String::new(),
        }
    }
}

fn edit_circuit_notice(path: &str, failures: usize, cause: EditFailure) -> String {
    let mut text = format!(
        "[EDIT CIRCUIT OPEN] {} edits of `{}` failed. Stop retrying {} on it and switch strategy:\n\
         1. Read the file again with read_file and copy old_string exactly.\n\
         2. Replace the whole file with write_file.\n\
         3. Put more surrounding lines into old_string so it matches one place.",
        failures, path, EDIT_TOOL
    );
    match cause {
        EditFailure::NoMatch => {
            text.push_str("\nThe text you are matching has probably changed since you last read it.")
        }
        EditFailure::Ambiguous => {
            text.push_str("\nold_string matches several places; make it unique.")
        }
        EditFailure::Other => {}
    }
    text
}

/// What recording one action revealed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    /// The fingerprint was already in the loop window
    pub repeated: bool,
    /// A new warning was queued
    pub warned: bool,
}

struct LoopDetector {
    window: SlidingWindow<ActionFingerprint>,
    interval: usize,
    threshold: usize,
    since_eval: usize,
    last_pattern: Option<String>,
}

impl LoopDetector {
    fn new(capacity: usize, interval: usize, threshold: usize) -> Self {
        Self {
            window: SlidingWindow::new(capacity),
            interval: interval.max(1),
            threshold: threshold.max(2),
            since_eval: 0,
            last_pattern: None,
        }
    }

    fn record(&mut self, fp: ActionFingerprint) -> (bool, Option<Anomaly>) {
        let repeated = self.window.iter().any(|seen| seen == &fp);
        self.window.push(fp);
        self.since_eval += 1;
        if self.since_eval < self.interval {
            return (repeated, None);
        }
        self.since_eval = 0;
        (repeated, self.evaluate())
    }

    fn evaluate(&mut self) -> Option<Anomaly> {
        let items: Vec<&ActionFingerprint> = self.window.iter().collect();
        let found = find_cycle(&items, self.threshold).or_else(|| find_repeat(&items, self.threshold));

        let Some((pattern, occurrences)) = found else {
            self.last_pattern = None;
            return None;
        };
        let key = pattern.key();
        if self.last_pattern.as_deref() == Some(key.as_str()) {
            debug!(pattern = %pattern, "◆ LOOP PATTERN UNCHANGED");
            return None;
        }
        self.last_pattern = Some(key);
        Some(Anomaly::Loop {
            pattern,
            occurrences,
        })
    }

    fn clear(&mut self) {
        self.window.clear();
        self.since_eval = 0;
        self.last_pattern = None;
    }
}

/// Period 2 or 3 repeated at least `threshold` times at the tail
fn find_cycle(items: &[&ActionFingerprint], threshold: usize) -> Option<(LoopPattern, usize)> {
    for period in 2..=3 {
        let needed = period * threshold;
        if items.len() < needed {
            continue;
        }
        let tail = &items[items.len() - period..];
        if tail.iter().all(|fp| *fp == tail[0]) {
            continue;
        }
        let mut repeats = 0;
        let mut end = items.len();
        while end >= period && items[end - period..end] == *tail {
            repeats += 1;
            end -= period;
        }
        if repeats >= threshold {
            let cycle = tail.iter().map(|fp| (*fp).clone()).collect();
            return Some((LoopPattern::Cycle(cycle), repeats));
        }
    }
    None
}

/// Most frequent fingerprint when it reaches `threshold`
fn find_repeat(items: &[&ActionFingerprint], threshold: usize) -> Option<(LoopPattern, usize)> {
    let mut counts: HashMap<&ActionFingerprint, usize> = HashMap::new();
    for fp in items {
        *counts.entry(*fp).or_default() += 1;
    }
    // Latest occurrence wins ties
    items
        .iter()
        .map(|fp| (*fp, counts[*fp]))
        .filter(|(_, count)| *count >= threshold)
        .max_by_key(|(_, count)| *count)
        .map(|(fp, count)| (LoopPattern::Repeated(fp.clone()), count))
}

struct DriftDetector {
    window: SlidingWindow<String>,
    interval: usize,
    threshold: f64,
    since_eval: usize,
    armed: bool,
    strategy: Box<dyn DriftStrategy>,
}

impl DriftDetector {
    fn record(&mut self, task: &str, action: String) -> Option<Anomaly> {
        self.window.push(action);
        self.since_eval += 1;
        if self.since_eval < self.interval || task.trim().is_empty() {
            return None;
        }
        self.since_eval = 0;

        let actions: Vec<&str> = self.window.iter().map(String::as_str).collect();
        let score = self.strategy.divergence(task, &actions);
        debug!(score, strategy = self.strategy.name(), "◆ DRIFT EVALUATED");

        if score <= self.threshold {
            self.armed = true;
            return None;
        }
        if !self.armed {
            return None;
        }
        self.armed = false;
        Some(Anomaly::Drift {
            score,
            threshold: self.threshold,
        })
    }

    fn clear(&mut self) {
        self.window.clear();
        self.since_eval = 0;
        self.armed = true;
    }
}

/// Per-session anomaly state
pub struct AnomalyDetector {
    task: String,
    loops: LoopDetector,
    drift: DriftDetector,
    failures: FailureTracker,
    pending: Vec<Anomaly>,
}

impl AnomalyDetector {
    pub fn new(config: &AnomalyConfig) -> Self {
        Self::with_strategy(config, Box::new(LexicalOverlap))
    }

    pub fn with_strategy(config: &AnomalyConfig, strategy: Box<dyn DriftStrategy>) -> Self {
        Self {
            task: String::new(),
            loops: LoopDetector::new(config.loop_window, config.loop_interval, config.loop_threshold),
            drift: DriftDetector {
                window: SlidingWindow::new(config.drift_window),
                interval: config.drift_interval.max(1),
                threshold: config.drift_threshold,
                since_eval: 0,
                armed: true,
                strategy,
            },
            failures: FailureTracker::new(config.failure_threshold, config.edit_circuit_reset()),
            pending: Vec::new(),
        }
    }

    /// Task description drift is measured against
    pub fn set_task(&mut self, task: impl Into<String>) {
        self.task = task.into();
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn record(&mut self, call: &ToolCall) -> RecordOutcome {
        let fp = ActionFingerprint::of(call);
        let (repeated, loop_warning) = self.loops.record(fp);
        let drift_warning = self.drift.record(&self.task, describe_action(call));

        let mut outcome = RecordOutcome {
            repeated,
            warned: false,
        };
        for anomaly in [loop_warning, drift_warning].into_iter().flatten() {
            warn!(anomaly = ?anomaly, "◆ ANOMALY DETECTED");
            outcome.warned = true;
            self.pending.push(anomaly);
        }
        outcome
    }

    /// A dispatched call failed; returns whether a notice was queued
    pub fn record_failure(&mut self, call: &ToolCall, error: &str) -> bool {
        let found = self.failures.record_failure(call, error);
        let warned = !found.is_empty();
        for anomaly in found {
            warn!(anomaly = ?anomaly, "◆ ANOMALY DETECTED");
            self.pending.push(anomaly);
        }
        warned
    }

    pub fn record_success(&mut self, call: &ToolCall) {
        self.failures.record_success(call);
    }

    pub fn is_edit_circuit_open(&self, path: &str) -> bool {
        self.failures.is_circuit_open(path)
    }

    /// Drain queued warnings
    pub fn take_pending(&mut self) -> Vec<Anomaly> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forget windows and queued warnings
    pub fn clear(&mut self) {
        self.loops.clear();
        self.drift.clear();
        self.failures.clear();
        self.pending.clear();
    }
}

/// Tool name plus every string argument, as drift evidence
fn describe_action(call: &ToolCall) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut parts = vec![call.name.clone()];
    collect(&call.arguments, &mut parts);
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exec(command: &str) -> ToolCall {
        ToolCall::new("id", "exec", json!({ "command": command }))
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(&AnomalyConfig::default())
    }

    // ===== Loop Tests =====

    #[test]
    fn test_four_repeats_warn_once() {
        let mut detector = detector();
        detector.record(&exec("pwd"));
        for _ in 0..4 {
            detector.record(&exec("ls -la"));
        }
        let pending = detector.take_pending();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            &pending[0],
            Anomaly::Loop { pattern: LoopPattern::Repeated(fp), occurrences: 4 } if fp.tool == "exec"
        ));

        for _ in 0..5 {
            detector.record(&exec("ls -la"));
        }
        assert!(detector.take_pending().is_empty());
    }

    #[test]
    fn test_evaluates_only_on_interval() {
        let mut detector = detector();
        for _ in 0..4 {
            let outcome = detector.record(&exec("ls"));
            assert!(!outcome.warned);
        }
        assert!(!detector.has_pending());
        assert!(detector.record(&exec("ls")).warned);
    }

    #[test]
    fn test_repeated_flag() {
        let mut detector = detector();
        assert!(!detector.record(&exec("a")).repeated);
        assert!(!detector.record(&exec("b")).repeated);
        assert!(detector.record(&exec("a")).repeated);
    }

    #[test]
    fn test_cycle_detected_before_repeat() {
        let mut detector = detector();
        let calls = [exec("cargo build"), exec("cat log"), exec("git diff")];
        for i in 0..10 {
            detector.record(&calls[i % 3]);
        }
        let pending = detector.take_pending();
        assert_eq!(pending.len(), 1);
        match &pending[0] {
            Anomaly::Loop {
                pattern: LoopPattern::Cycle(cycle),
                occurrences,
            } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(*occurrences, 3);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_pattern_change_rearms() {
        let mut detector = detector();
        for _ in 0..5 {
            detector.record(&exec("ls"));
        }
        assert_eq!(detector.take_pending().len(), 1);
        for i in 0..5 {
            detector.record(&exec(&format!("step {}", i)));
        }
        for _ in 0..5 {
            detector.record(&exec("make"));
        }
        assert_eq!(detector.take_pending().len(), 1);
    }

    #[test]
    fn test_varied_actions_do_not_warn() {
        let mut detector = detector();
        for i in 0..20 {
            detector.record(&exec(&format!("echo {}", i)));
        }
        assert!(detector.take_pending().is_empty());
    }

    // ===== Drift Tests =====

    #[test]
    fn test_drift_warns_once_until_rearmed() {
        let mut detector = detector();
        detector.set_task("refactor parser tokenizer module");

        for _ in 0..10 {
            detector.record(&ToolCall::new(
                "x",
                "exec",
                json!({"command": "curl weather.example.com/forecast"}),
            ));
        }
        let pending = detector.take_pending();
        assert!(pending.iter().any(|a| matches!(a, Anomaly::Drift { .. })));

        for i in 0..10 {
            detector.record(&exec(&format!("wget news{}", i)));
        }
        assert!(!detector
            .take_pending()
            .iter()
            .any(|a| matches!(a, Anomaly::Drift { .. })));
    }

    #[test]
    fn test_on_task_actions_do_not_drift() {
        let mut detector = detector();
        detector.set_task("refactor parser tokenizer module");
        for i in 0..10 {
            detector.record(&ToolCall::new(
                "x",
                "edit_file",
                json!({"path": format!("src/parser/tokenizer{}.rs", i), "old_string": "module", "new_string": "refactor"}),
            ));
        }
        assert!(!detector
            .take_pending()
            .iter()
            .any(|a| matches!(a, Anomaly::Drift { .. })));
    }

    // ===== Failure Tests =====

    #[test]
    fn test_failed_edits_queue_circuit_notice() {
        let mut detector = detector();
        let call = ToolCall::new(
            "x",
            EDIT_TOOL,
            json!({"path": "src/lib.rs", "old_string": "fn old()", "new_string": "fn new()"}),
        );
        assert!(!detector.record_failure(&call, "◆ EDIT UNRESOLVED (best score 0.41)"));
        assert!(!detector.record_failure(&call, "◆ EDIT UNRESOLVED (best score 0.41)"));
        assert!(detector.record_failure(&call, "◆ EDIT UNRESOLVED (best score 0.41)"));
        assert!(detector.is_edit_circuit_open("src/lib.rs"));

        let pending = detector.take_pending();
        assert_eq!(pending.len(), 1);
        let text = pending[0].to_message().text();
        assert!(text.contains("EDIT CIRCUIT OPEN"));
        assert!(text.contains("write_file"));
        assert!(text.contains("changed since you last read it"));

        detector.clear();
        assert!(!detector.is_edit_circuit_open("src/lib.rs"));
    }

    #[test]
    fn test_repeated_command_failure_notice() {
        let mut detector = detector();
        for _ in 0..2 {
            assert!(!detector.record_failure(&exec("cargo test"), "exit status 101"));
        }
        assert!(detector.record_failure(&exec("cargo test"), "exit status 101"));
        let pending = detector.take_pending();
        assert!(matches!(
            &pending[..],
            [Anomaly::RepeatedFailure { target, occurrences: 3 }] if target == "cargo test"
        ));
        assert!(pending[0].to_message().text().contains("REPEATED FAILURE"));
    }

    #[test]
    fn test_warning_message_is_system() {
        let anomaly = Anomaly::Drift {
            score: 0.9,
            threshold: 0.85,
        };
        let message = anomaly.to_message();
        assert_eq!(message.role, warden_provider::Role::System);
        assert!(message.text().contains("DRIFT DETECTED"));
    }
}
