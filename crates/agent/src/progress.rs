//! Semantic progress tracking
//!
//! Counts what the tools actually did (files modified, commands executed,
//! tests run) and the failure streaks that feed `ProgressCheck`.

use serde::Serialize;
use std::collections::HashSet;

use crate::state::Phase;

/// Test run outcome reported by a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestOutcome {
    Passed,
    Failed,
}

/// Side effects of one tool execution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolEffects {
    pub files_modified: Vec<String>,
    pub command: Option<String>,
    pub test: Option<TestOutcome>,
}

impl ToolEffects {
    pub fn is_empty(&self) -> bool {
        self.files_modified.is_empty() && self.command.is_none() && self.test.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSummary {
    pub files_modified: usize,
    pub commands_executed: usize,
    pub tests_run: usize,
    pub tests_failed: usize,
    pub consecutive_errors: u32,
    pub no_progress_turns: u32,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    files: HashSet<String>,
    file_writes: usize,
    writes_at_validation: Option<usize>,
    commands_executed: usize,
    tests_run: usize,
    tests_failed: usize,
    consecutive_errors: u32,
    no_progress_turns: u32,
    turn_progressed: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tool succeeded; returns whether it produced semantic progress
    pub fn record_success(&mut self, effects: &ToolEffects) -> bool {
        self.consecutive_errors = 0;
        for file in &effects.files_modified {
            self.files.insert(file.clone());
            self.file_writes += 1;
        }
        if effects.command.is_some() {
            self.commands_executed += 1;
        }
        if let Some(outcome) = effects.test {
            self.tests_run += 1;
            if outcome == TestOutcome::Failed {
                self.tests_failed += 1;
            }
        }
        let progressed = !effects.is_empty();
        self.turn_progressed |= progressed;
        progressed
    }

    pub fn record_error(&mut self) {
        self.consecutive_errors += 1;
    }

    /// Close the turn; `stalled` marks it as non-progress regardless of effects
    pub fn finish_turn(&mut self, stalled: bool) {
        if self.turn_progressed && !stalled {
            self.no_progress_turns = 0;
        } else {
            self.no_progress_turns += 1;
        }
        self.turn_progressed = false;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn no_progress_turns(&self) -> u32 {
        self.no_progress_turns
    }

    /// Phase the session should move to, if the evidence supports it
    pub fn next_phase(&self, current: Phase) -> Option<Phase> {
        match current {
            Phase::Planning if !self.files.is_empty() => Some(Phase::Implementation),
            Phase::Implementation if self.tests_run > 0 => Some(Phase::Validation),
            Phase::Validation => match self.writes_at_validation {
                Some(mark) if self.file_writes > mark => Some(Phase::Refinement),
                _ => None,
            },
            _ => None,
        }
    }

    /// Note that the session entered `phase`
    pub fn entered_phase(&mut self, phase: Phase) {
        if phase == Phase::Validation {
            self.writes_at_validation = Some(self.file_writes);
        }
    }

    /// Forget error and stall streaks after an external reset
    pub fn reset_streaks(&mut self) {
        self.consecutive_errors = 0;
        self.no_progress_turns = 0;
        self.turn_progressed = false;
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            files_modified: self.files.len(),
            commands_executed: self.commands_executed,
            tests_run: self.tests_run,
            tests_failed: self.tests_failed,
            consecutive_errors: self.consecutive_errors,
            no_progress_turns: self.no_progress_turns,
        }
    }
}
