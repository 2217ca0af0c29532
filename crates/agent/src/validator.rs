//! Message sequence validation
//!
//! Every tool call opens an obligation that exactly one tool result must
//! close before the next user message. The validator walks a history in
//! order and reports the first violation.

use std::collections::HashSet;
use thiserror::Error;

use warden_provider::{ContentPart, Message, Role, ToolCall};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("◆ DUPLICATE TOOL CALL ID: {id} (message {index})")]
    DuplicateToolCall { id: String, index: usize },

    #[error("◆ TOOL CALL OUTSIDE ASSISTANT MESSAGE: {id} (message {index})")]
    ToolCallOutsideAssistant { id: String, index: usize },

    #[error("◆ RESULT FOR UNKNOWN TOOL CALL: {id} (message {index})")]
    UnknownToolResult { id: String, index: usize },

    #[error("◆ DUPLICATE RESULT FOR TOOL CALL: {id} (message {index})")]
    DuplicateToolResult { id: String, index: usize },

    #[error("◆ UNRESOLVED TOOL CALLS BEFORE USER MESSAGE {index}: {}", .ids.join(", "))]
    UnresolvedToolCalls { ids: Vec<String>, index: usize },
}

/// Open obligations in call order
#[derive(Default)]
struct Ledger {
    seen: HashSet<String>,
    closed: HashSet<String>,
    open: Vec<ToolCall>,
}

impl Ledger {
    fn open_ids(&self) -> Vec<String> {
        self.open.iter().map(|c| c.id.clone()).collect()
    }
}

fn walk(history: &[Message]) -> Result<Ledger, ValidationError> {
    let mut ledger = Ledger::default();

    for (index, message) in history.iter().enumerate() {
        if message.role == Role::User && !ledger.open.is_empty() {
            return Err(ValidationError::UnresolvedToolCalls {
                ids: ledger.open_ids(),
                index,
            });
        }

        for part in &message.parts {
            match part {
                ContentPart::ToolCall(call) => {
                    if message.role != Role::Assistant {
                        return Err(ValidationError::ToolCallOutsideAssistant {
                            id: call.id.clone(),
                            index,
                        });
                    }
                    if !ledger.seen.insert(call.id.clone()) {
                        return Err(ValidationError::DuplicateToolCall {
                            id: call.id.clone(),
                            index,
                        });
                    }
                    ledger.open.push(call.clone());
                }
                ContentPart::ToolResult(result) => {
                    let id = &result.tool_call_id;
                    if ledger.closed.contains(id) {
                        return Err(ValidationError::DuplicateToolResult {
                            id: id.clone(),
                            index,
                        });
                    }
                    let Some(pos) = ledger.open.iter().position(|c| &c.id == id) else {
                        return Err(ValidationError::UnknownToolResult {
                            id: id.clone(),
                            index,
                        });
                    };
                    ledger.open.remove(pos);
                    ledger.closed.insert(id.clone());
                }
                ContentPart::Text { .. } | ContentPart::Reasoning { .. } => {}
            }
        }
    }

    Ok(ledger)
}

/// Check the pairing invariant over a whole history
pub fn validate(history: &[Message]) -> Result<(), ValidationError> {
    walk(history).map(|_| ())
}

/// `validate` plus no obligation left open at the tail; required before a provider call
pub fn validate_outgoing(history: &[Message]) -> Result<(), ValidationError> {
    let ledger = walk(history)?;
    if ledger.open.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::UnresolvedToolCalls {
            ids: ledger.open_ids(),
            index: history.len(),
        })
    }
}

/// Cheap pre-check: does any tool call still await its result?
pub fn has_pending_tool_results(history: &[Message]) -> bool {
    let mut open: HashSet<&str> = HashSet::new();
    for message in history {
        for part in &message.parts {
            match part {
                ContentPart::ToolCall(call) => {
                    open.insert(call.id.as_str());
                }
                ContentPart::ToolResult(result) => {
                    open.remove(result.tool_call_id.as_str());
                }
                _ => {}
            }
        }
    }
    !open.is_empty()
}

/// Tool calls still awaiting a result, in call order
pub fn pending_tool_calls(history: &[Message]) -> Vec<ToolCall> {
    let mut open: Vec<ToolCall> = Vec::new();
    for message in history {
        for part in &message.parts {
            match part {
                ContentPart::ToolCall(call) => open.push(call.clone()),
                ContentPart::ToolResult(result) => {
                    open.retain(|c| c.id != result.tool_call_id);
                }
                _ => {}
            }
        }
    }
    open
}
