//! Event parser.
//!
//! Turns lexer spans into semantic events. Think and respond text is
//! coalesced per span; execute payloads are decoded into one `call` event per
//! array element followed by an `execute` boundary. A payload that is not a
//! valid call array is demoted to respond text so nothing the model wrote is
//! lost.

use super::lexer::{Lexer, Span};
use super::syntax::{Marker, Syntax};
use storage::{Event, EventKind, ToolCall};
use tracing::debug;

/// Which text span a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Think,
    Respond,
}

impl TextKind {
    pub fn event(self, text: impl Into<String>) -> Event {
        match self {
            Self::Think => Event::think(text),
            Self::Respond => Event::respond(text),
        }
    }
}

/// Parser output.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Text as soon as it arrives, for incremental display only.
    Delta { kind: TextKind, text: String },
    /// A complete event.
    Event(Event),
}

/// Streaming wire-protocol parser.
#[derive(Debug, Clone)]
pub struct Parser {
    lexer: Lexer,
    syntax: Syntax,
    open: Option<Marker>,
    text: String,
    payload: String,
    delta_started: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(Syntax::default())
    }
}

impl Parser {
    pub fn new(syntax: Syntax) -> Self {
        Self {
            lexer: Lexer::new(syntax.clone()),
            syntax,
            open: None,
            text: String::new(),
            payload: String::new(),
            delta_started: false,
        }
    }

    /// Feed one provider fragment.
    pub fn feed(&mut self, fragment: &str) -> Vec<Parsed> {
        let mut out = Vec::new();
        for span in self.lexer.push(fragment) {
            self.on_span(span, &mut out);
        }
        out
    }

    /// End of stream: flush everything still pending.
    ///
    /// An execute span left open is decoded as if it were closed, since
    /// providers often stop on the closing token.
    pub fn finish(&mut self) -> Vec<Parsed> {
        let mut out = Vec::new();
        for span in self.lexer.finish() {
            self.on_span(span, &mut out);
        }
        match self.open.take() {
            Some(Marker::Think) => self.flush_text(TextKind::Think, &mut out),
            Some(Marker::Execute) => self.decode_execute(false, &mut out),
            Some(Marker::End) | None => {}
        }
        self.flush_text(TextKind::Respond, &mut out);
        out
    }

    /// Abandon the stream after a transport failure.
    ///
    /// Pending text is flushed; a half-received execute payload is dropped
    /// since it can never be trusted as a complete batch.
    pub fn abort(&mut self) -> Vec<Parsed> {
        let mut out = Vec::new();
        for span in self.lexer.finish() {
            self.on_span(span, &mut out);
        }
        match self.open.take() {
            Some(Marker::Think) => self.flush_text(TextKind::Think, &mut out),
            Some(Marker::Execute) => {
                debug!(bytes = self.payload.len(), "dropping partial execute payload");
                self.payload.clear();
            }
            Some(Marker::End) | None => {}
        }
        self.flush_text(TextKind::Respond, &mut out);
        out
    }

    fn on_span(&mut self, span: Span, out: &mut Vec<Parsed>) {
        match span {
            Span::Payload(text) => match self.open {
                Some(Marker::Execute) => self.payload.push_str(&text),
                Some(Marker::Think) => self.push_text(TextKind::Think, &text, out),
                Some(Marker::End) | None => self.push_text(TextKind::Respond, &text, out),
            },
            Span::Open(Marker::End) => {
                self.flush_text(TextKind::Respond, out);
                out.push(Parsed::Event(Event::new(EventKind::End)));
            }
            Span::Open(Marker::Execute) => {
                // Preceding text is held until the payload decodes: a
                // malformed batch is folded back into it.
                self.open = Some(Marker::Execute);
            }
            Span::Open(marker) => {
                self.flush_text(TextKind::Respond, out);
                self.open = Some(marker);
            }
            Span::Close(Marker::Think) => {
                self.flush_text(TextKind::Think, out);
                self.open = None;
            }
            Span::Close(Marker::Execute) => {
                self.open = None;
                self.decode_execute(true, out);
            }
            Span::Close(Marker::End) => {}
        }
    }

    fn push_text(&mut self, kind: TextKind, text: &str, out: &mut Vec<Parsed>) {
        self.text.push_str(text);
        let delta = if self.delta_started {
            text
        } else {
            text.trim_start()
        };
        if !delta.is_empty() {
            self.delta_started = true;
            out.push(Parsed::Delta {
                kind,
                text: delta.to_string(),
            });
        }
    }

    fn flush_text(&mut self, kind: TextKind, out: &mut Vec<Parsed>) {
        let text = std::mem::take(&mut self.text);
        self.delta_started = false;
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(Parsed::Event(kind.event(trimmed)));
        }
    }

    fn decode_execute(&mut self, closed: bool, out: &mut Vec<Parsed>) {
        let payload = std::mem::take(&mut self.payload);
        match serde_json::from_str::<Vec<ToolCall>>(payload.trim()) {
            Ok(calls) => {
                self.flush_text(TextKind::Respond, out);
                out.extend(calls.into_iter().map(|c| Parsed::Event(Event::call(c))));
                out.push(Parsed::Event(Event::new(EventKind::Execute)));
            }
            Err(e) => {
                debug!(error = %e, "execute payload is not a call array; keeping it as text");
                let mut raw = format!("{}{payload}", self.syntax.execute_open);
                if closed {
                    raw.push_str(self.syntax.execute_close);
                }
                self.push_text(TextKind::Respond, &raw, out);
            }
        }
    }
}

/// Parse a complete response into its events, dropping display deltas.
pub fn parse(syntax: &Syntax, text: &str) -> Vec<Event> {
    let mut parser = Parser::new(syntax.clone());
    let mut parsed = parser.feed(text);
    parsed.extend(parser.finish());
    parsed
        .into_iter()
        .filter_map(|p| match p {
            Parsed::Event(event) => Some(event),
            Parsed::Delta { .. } => None,
        })
        .collect()
}
