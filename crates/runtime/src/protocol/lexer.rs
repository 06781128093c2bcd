//! Marker lexer.
//!
//! Splits incoming text fragments into marker boundaries and payload text.
//! Fragments may be cut anywhere, including in the middle of a marker token:
//! a possible token prefix at the end of a fragment is held back until the
//! next fragment decides it.

use super::syntax::{Marker, Syntax};

/// A lexical span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Open(Marker),
    Close(Marker),
    /// Text belonging to the currently open span, or plain text at top level.
    Payload(String),
}

/// Streaming marker lexer.
#[derive(Debug, Clone)]
pub struct Lexer {
    syntax: Syntax,
    buffer: String,
    open: Option<Marker>,
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new(Syntax::default())
    }
}

impl Lexer {
    pub fn new(syntax: Syntax) -> Self {
        Self {
            syntax,
            buffer: String::new(),
            open: None,
        }
    }

    /// The span the lexer is currently inside, if any.
    pub fn open_span(&self) -> Option<Marker> {
        self.open
    }

    /// Tokens that are meaningful in the current state.
    ///
    /// Inside a span only its closing token counts; at top level only the
    /// opening tokens and the terminal marker do.
    fn candidates(&self) -> Vec<(&'static str, Span)> {
        match self.open {
            Some(marker) => self
                .syntax
                .close(marker)
                .map(|token| vec![(token, Span::Close(marker))])
                .unwrap_or_default(),
            None => [Marker::Think, Marker::Execute, Marker::End]
                .into_iter()
                .map(|marker| (self.syntax.open(marker), Span::Open(marker)))
                .collect(),
        }
    }

    /// Feed one fragment and return every span it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<Span> {
        self.buffer.push_str(fragment);

        let mut spans = Vec::new();
        let mut payload = String::new();
        let mut pos = 0;

        while pos < self.buffer.len() {
            let candidates = self.candidates();
            let rest = &self.buffer[pos..];

            let Some(offset) = rest.find(|c: char| {
                candidates
                    .iter()
                    .any(|(token, _)| token.starts_with(c))
            }) else {
                payload.push_str(rest);
                pos = self.buffer.len();
                break;
            };

            payload.push_str(&rest[..offset]);
            pos += offset;
            let rest = &self.buffer[pos..];

            if let Some((token, span)) = candidates
                .iter()
                .find(|(token, _)| rest.starts_with(token))
            {
                if !payload.is_empty() {
                    spans.push(Span::Payload(std::mem::take(&mut payload)));
                }
                pos += token.len();
                self.open = match span {
                    Span::Open(Marker::End) | Span::Close(_) => None,
                    Span::Open(marker) => Some(*marker),
                    Span::Payload(_) => self.open,
                };
                spans.push(span.clone());
                continue;
            }

            if candidates.iter().any(|(token, _)| token.starts_with(rest)) {
                // Could still become a token; wait for more input.
                break;
            }

            let width = rest.chars().next().map_or(1, char::len_utf8);
            payload.push_str(&rest[..width]);
            pos += width;
        }

        self.buffer.drain(..pos);
        if !payload.is_empty() {
            spans.push(Span::Payload(payload));
        }
        spans
    }

    /// Flush held-back text at end of stream. Resets the lexer.
    pub fn finish(&mut self) -> Vec<Span> {
        self.open = None;
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![Span::Payload(std::mem::take(&mut self.buffer))]
        }
    }
}
