//! Action fingerprints
//!
//! Two tool calls share a fingerprint when their names match and their
//! arguments are equal after canonicalisation: object keys sorted and
//! string whitespace collapsed.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use warden_provider::ToolCall;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ActionFingerprint {
    pub tool: String,
    pub hash: String,
}

impl ActionFingerprint {
    pub fn of(call: &ToolCall) -> Self {
        Self::from_parts(&call.name, &call.arguments)
    }

    pub fn from_parts(tool: &str, arguments: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(arguments, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        Self {
            tool: tool.to_string(),
            hash: digest[..16].to_string(),
        }
    }
}

impl std::fmt::Display for ActionFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.tool, &self.hash[..8])
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            out.push_str(&Value::String(collapsed).to_string());
        }
        other => out.push_str(&other.to_string()),
    }
}
