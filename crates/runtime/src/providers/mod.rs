//! Provider transports.
//!
//! A provider turns a message list into a stream of raw text fragments. Two
//! shapes are supported behind one trait:
//!
//! - **replay**: [`Provider::stream`] receives the full context every pass.
//! - **resume**: [`Provider::connect`] opens a [`ProviderSession`] that keeps
//!   context on the provider side; later passes only send what is new.
//!
//! Fragments may be split anywhere; the protocol parser reassembles them.

mod anthropic;
mod stdio;

pub use anthropic::{AnthropicAuth, AnthropicProvider, AnthropicProviderBuilder};
pub use stdio::StdioProvider;

use crate::context::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// A stream of raw text fragments.
pub type FragmentStream<'a> = BoxStream<'a, Result<String>>;

/// A model provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether [`Provider::connect`] is available.
    fn supports_sessions(&self) -> bool {
        false
    }

    /// Stream a reply to the full message list.
    async fn stream(&self, messages: &[Message]) -> Result<FragmentStream<'static>>;

    /// Open a persistent session seeded with `messages`.
    async fn connect(&self, messages: &[Message]) -> Result<Box<dyn ProviderSession>> {
        let _ = messages;
        Err(Error::Unsupported(format!(
            "{} does not support persistent sessions",
            self.name()
        )))
    }
}

/// A persistent provider session (resume mode).
#[async_trait]
pub trait ProviderSession: Send {
    /// Send an incremental message.
    async fn send(&mut self, content: &str) -> Result<()>;

    /// Stream the reply to everything sent so far.
    fn receive(&mut self) -> FragmentStream<'_>;

    async fn close(self: Box<Self>) -> Result<()>;
}
