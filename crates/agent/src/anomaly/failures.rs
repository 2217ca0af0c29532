//! Repeated failure tracking
//!
//! Two checks over failed tool calls. A streak of identical failures (same
//! target, same error text) queues a notice once it reaches the threshold.
//! Failed edits are also counted per file; once a file collects enough of
//! them its edit circuit opens and the model is pointed at other ways to
//! make the change.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use warden_provider::ToolCall;

use super::Anomaly;

/// Tool whose failures feed the per-file edit circuit
pub const EDIT_TOOL: &str = "edit_file";

const TARGET_CHARS: usize = 50;

/// Why the edits of a file kept failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditFailure {
    NoMatch,
    Ambiguous,
    Other,
}

impl EditFailure {
    fn classify(error: &str) -> Self {
        let error = error.to_lowercase();
        if ["unresolved", "not found", "no match", "no file"]
            .iter()
            .any(|needle| error.contains(needle))
        {
            EditFailure::NoMatch
        } else if ["locations", "multiple", "ambiguous"]
            .iter()
            .any(|needle| error.contains(needle))
        {
            EditFailure::Ambiguous
        } else {
            EditFailure::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FailureKey {
    target: String,
    error_hash: String,
}

#[derive(Debug)]
struct EditCircuit {
    failures: usize,
    last_failure: Instant,
    open: bool,
}

pub struct FailureTracker {
    threshold: usize,
    reset_after: Duration,
    streak: Option<(FailureKey, usize)>,
    circuits: HashMap<String, EditCircuit>,
}

impl FailureTracker {
    pub fn new(threshold: usize, reset_after: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_after,
            streak: None,
            circuits: HashMap::new(),
        }
    }

    /// A call failed with `error`; returns the notices it triggered
    pub fn record_failure(&mut self, call: &ToolCall, error: &str) -> Vec<Anomaly> {
        let mut found = Vec::new();

        if call.name == EDIT_TOOL {
            if let Some(path) = string_arg(call, "path") {
                if let Some(anomaly) = self.fail_edit(path, error) {
                    found.push(anomaly);
                }
            }
        }

        let key = FailureKey {
            target: failure_target(call),
            error_hash: hash_error(error),
        };
        let count = match self.streak.take() {
            Some((previous, count)) if previous == key => count + 1,
            _ => 1,
        };
        debug!(failure_target = %key.target, count, "◆ FAILURE RECORDED");
        // An opened circuit already says everything the streak notice would
        if count == self.threshold && found.is_empty() {
            found.push(Anomaly::RepeatedFailure {
                target: key.target.clone(),
                occurrences: count,
            });
        }
        self.streak = Some((key, count));
        found
    }

    /// A call succeeded: the failure streak ends and an edited file's circuit closes
    pub fn record_success(&mut self, call: &ToolCall) {
        self.streak = None;
        if call.name == EDIT_TOOL {
            if let Some(path) = string_arg(call, "path") {
                self.circuits.remove(path);
            }
        }
    }

    pub fn is_circuit_open(&self, path: &str) -> bool {
        self.circuits
            .get(path)
            .map(|circuit| circuit.open && circuit.last_failure.elapsed() <= self.reset_after)
            .unwrap_or(false)
    }

    pub fn edit_failures(&self, path: &str) -> usize {
        self.circuits.get(path).map_or(0, |circuit| circuit.failures)
    }

    pub fn clear(&mut self) {
        self.streak = None;
        self.circuits.clear();
    }

    fn fail_edit(&mut self, path: &str, error: &str) -> Option<Anomaly> {
        let now = Instant::now();
        let circuit = self
            .circuits
            .entry(path.to_string())
            .or_insert_with(|| EditCircuit {
                failures: 0,
                last_failure: now,
                open: false,
            });
        if now.duration_since(circuit.last_failure) > self.reset_after {
            circuit.failures = 0;
            circuit.open = false;
        }
        circuit.failures += 1;
        circuit.last_failure = now;

        if circuit.failures < self.threshold || circuit.open {
            return None;
        }
        circuit.open = true;
        Some(Anomaly::EditCircuitOpen {
            path: path.to_string(),
            failures: circuit.failures,
            cause: EditFailure::classify(error),
        })
    }
}

fn string_arg<'a>(call: &'a ToolCall, key: &str) -> Option<&'a str> {
    call.arguments.get(key).and_then(|v| v.as_str())
}

/// File path when the call names one, else the head of its command, else the tool
fn failure_target(call: &ToolCall) -> String {
    if let Some(path) = string_arg(call, "path") {
        return path.to_string();
    }
    if let Some(command) = string_arg(call, "command") {
        return command.chars().take(TARGET_CHARS).collect();
    }
    call.name.clone()
}

fn hash_error(error: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(error.trim().as_bytes()));
    digest[..16].to_string()
}
