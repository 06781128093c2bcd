//! Marker tokens of the wire protocol and how events are rendered back into
//! them.

use serde_json::{Value, json};
use storage::{ToolCall, ToolResult};

/// A semantic span delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Freeform model reasoning.
    Think,
    /// A JSON array of tool calls.
    Execute,
    /// End of turn. Has no closing token.
    End,
}

/// The concrete tokens for each marker.
///
/// Everything that knows about delimiter text goes through this type, so a
/// different syntax only needs a different `Syntax` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syntax {
    pub think_open: &'static str,
    pub think_close: &'static str,
    pub execute_open: &'static str,
    pub execute_close: &'static str,
    pub results_open: &'static str,
    pub results_close: &'static str,
    pub end: &'static str,
}

impl Syntax {
    /// XML-like markers wrapping JSON arrays.
    pub const XML: Syntax = Syntax {
        think_open: "<think>",
        think_close: "</think>",
        execute_open: "<execute>",
        execute_close: "</execute>",
        results_open: "<results>",
        results_close: "</results>",
        end: "<end>",
    };

    pub fn open(&self, marker: Marker) -> &'static str {
        match marker {
            Marker::Think => self.think_open,
            Marker::Execute => self.execute_open,
            Marker::End => self.end,
        }
    }

    pub fn close(&self, marker: Marker) -> Option<&'static str> {
        match marker {
            Marker::Think => Some(self.think_close),
            Marker::Execute => Some(self.execute_close),
            Marker::End => None,
        }
    }

    pub fn render_think(&self, text: &str) -> String {
        format!("{}{text}{}", self.think_open, self.think_close)
    }

    pub fn render_execute(&self, calls: &[ToolCall]) -> String {
        let batch: Vec<Value> = calls
            .iter()
            .map(|c| json!({ "name": c.name, "args": c.args }))
            .collect();
        format!(
            "{}\n{}\n{}",
            self.execute_open,
            Value::Array(batch),
            self.execute_close
        )
    }

    pub fn render_results(&self, results: &[ToolResult]) -> String {
        let batch: Vec<Value> = results
            .iter()
            .map(|r| json!({ "tool": r.tool, "status": r.status, "content": r.content }))
            .collect();
        format!(
            "{}\n{}\n{}",
            self.results_open,
            Value::Array(batch),
            self.results_close
        )
    }
}

impl Default for Syntax {
    fn default() -> Self {
        Self::XML
    }
}
