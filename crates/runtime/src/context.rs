//! Provider context assembly.
//!
//! Provider messages are a pure function of the stored log: there is no
//! mutable "current context" anywhere. Each pass rebuilds its messages from
//! the events the store returns.

use crate::protocol::Syntax;
use crate::tools::ToolSpec;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use storage::{Event, EventKind, ToolCall, ToolResult};

/// Role of a provider message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the provider's chat format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Rebuilds provider messages from stored events.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    system: String,
    syntax: Syntax,
    window: Option<usize>,
}

impl ContextAssembler {
    pub fn new(system: impl Into<String>, syntax: Syntax) -> Self {
        Self {
            system: system.into(),
            syntax,
            window: None,
        }
    }

    /// Only the last `window` events are used to rebuild context.
    pub fn with_window(mut self, window: Option<usize>) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> Option<usize> {
        self.window
    }

    pub fn syntax(&self) -> &Syntax {
        &self.syntax
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// The full provider context: system message, then the rendered log.
    pub fn to_messages(&self, events: &[Event]) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system.clone())];
        messages.extend(self.tail(events));
        messages
    }

    /// Render events without the system message.
    ///
    /// Leading `call`/`result` events are skipped so a windowed log never
    /// starts in the middle of a tool batch.
    pub fn tail(&self, events: &[Event]) -> Vec<Message> {
        let start = events
            .iter()
            .position(|e| !matches!(e.kind, EventKind::Call(_) | EventKind::Result(_)))
            .unwrap_or(events.len());
        let events = &events[start..];

        let mut messages = Vec::new();
        let mut i = 0;
        while i < events.len() {
            let (role, content, consumed) = match &events[i].kind {
                EventKind::User(text) => (Role::User, text.clone(), 1),
                EventKind::Think(text) => (Role::Assistant, self.syntax.render_think(text), 1),
                EventKind::Respond(text) => (Role::Assistant, text.clone(), 1),
                EventKind::Call(_) => {
                    let calls: Vec<ToolCall> = events[i..]
                        .iter()
                        .map_while(|e| match &e.kind {
                            EventKind::Call(call) => Some(call.clone()),
                            _ => None,
                        })
                        .collect();
                    (Role::Assistant, self.syntax.render_execute(&calls), calls.len())
                }
                EventKind::Result(_) => {
                    let results: Vec<ToolResult> = events[i..]
                        .iter()
                        .map_while(|e| match &e.kind {
                            EventKind::Result(result) => Some(result.clone()),
                            _ => None,
                        })
                        .collect();
                    (Role::User, self.syntax.render_results(&results), results.len())
                }
                _ => {
                    i += 1;
                    continue;
                }
            };
            push_merged(&mut messages, role, content);
            i += consumed;
        }
        messages
    }
}

/// Append a message, folding it into the previous one when the role repeats.
fn push_merged(messages: &mut Vec<Message>, role: Role, content: String) {
    match messages.last_mut() {
        Some(last) if last.role == role => {
            last.content.push('\n');
            last.content.push_str(&content);
        }
        _ => messages.push(Message { role, content }),
    }
}

/// Rough token estimate: a quarter of the character count, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Token estimate for a message list.
pub fn estimate_message_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Build the system prompt: protocol description, tool schemas and optional
/// caller instructions.
pub fn system_prompt(instructions: Option<&str>, tools: &[&ToolSpec], syntax: &Syntax) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You work in turns. Structure every reply with these markers:\n\
         - {think_open}...{think_close} for private reasoning.\n\
         - {exec_open}[{{\"name\": \"<tool>\", \"args\": {{...}}}}]{exec_close} to call tools. \
         The body is a JSON array; calls run in order and the results come back as \
         {results_open}[{{\"tool\", \"status\", \"content\"}}]{results_close}.\n\
         - Text outside markers is shown to the user.\n\
         - {end} once the request is fully answered.",
        think_open = syntax.think_open,
        think_close = syntax.think_close,
        exec_open = syntax.execute_open,
        exec_close = syntax.execute_close,
        results_open = syntax.results_open,
        results_close = syntax.results_close,
        end = syntax.end,
    );

    if tools.is_empty() {
        let _ = writeln!(prompt, "\nNo tools are available.");
    } else {
        let _ = writeln!(prompt, "\nAvailable tools:");
        for tool in tools {
            let _ = writeln!(
                prompt,
                "\n## {}\n{}\nArguments schema: {}",
                tool.name,
                tool.description,
                tool.input_schema()
            );
        }
    }

    if let Some(instructions) = instructions.map(str::trim).filter(|s| !s.is_empty()) {
        let _ = writeln!(prompt, "\n{instructions}");
    }
    prompt
}
