#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use runtime::{
    Conversation, Error, FragmentStream, Message, ParamKind, Provider, ProviderSession, Result,
    RuntimeConfig, ToolError, ToolRegistry, ToolSpec,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use storage::{Event, EventKind, EventLog, EventStore, EventType};

/// One piece of a scripted reply.
#[derive(Debug, Clone)]
pub enum Chunk {
    Text(String),
    Fail(String),
}

pub fn text(s: &str) -> Chunk {
    Chunk::Text(s.to_string())
}

pub fn fail(s: &str) -> Chunk {
    Chunk::Fail(s.to_string())
}

/// Split a reply into single-character fragments.
pub fn chars(s: &str) -> Vec<Chunk> {
    s.chars().map(|c| Chunk::Text(c.to_string())).collect()
}

#[derive(Default)]
struct Shared {
    replies: Mutex<VecDeque<Vec<Chunk>>>,
    sent: Mutex<Vec<usize>>,
    connects: AtomicUsize,
}

impl Shared {
    fn record(&self, len: usize) {
        self.sent.lock().unwrap().push(len);
    }

    fn next_reply(&self) -> FragmentStream<'static> {
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        let items: Vec<Result<String>> = reply
            .into_iter()
            .map(|chunk| match chunk {
                Chunk::Text(s) => Ok(s),
                Chunk::Fail(msg) => Err(Error::Network(msg)),
            })
            .collect();
        futures_util::stream::iter(items).boxed()
    }
}

/// Provider that plays back canned replies, one per pass, and records the
/// serialized length of everything it was sent.
#[derive(Clone)]
pub struct Scripted {
    shared: Arc<Shared>,
    sessions: bool,
}

impl Scripted {
    pub fn new(sessions: bool, replies: Vec<Vec<Chunk>>) -> Self {
        let shared = Shared {
            replies: Mutex::new(replies.into()),
            ..Shared::default()
        };
        Self {
            shared: Arc::new(shared),
            sessions,
        }
    }

    pub fn replay(replies: Vec<Vec<Chunk>>) -> Self {
        Self::new(false, replies)
    }

    pub fn resume(replies: Vec<Vec<Chunk>>) -> Self {
        Self::new(true, replies)
    }

    /// Serialized length of each request, in order.
    pub fn sent(&self) -> Vec<usize> {
        self.shared.sent.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

fn serialized_len(messages: &[Message]) -> usize {
    serde_json::to_string(messages).unwrap().len()
}

#[async_trait]
impl Provider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    async fn stream(&self, messages: &[Message]) -> Result<FragmentStream<'static>> {
        self.shared.record(serialized_len(messages));
        Ok(self.shared.next_reply())
    }

    async fn connect(&self, messages: &[Message]) -> Result<Box<dyn ProviderSession>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.shared.record(serialized_len(messages));
        Ok(Box::new(ScriptedSession {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
}

#[async_trait]
impl ProviderSession for ScriptedSession {
    async fn send(&mut self, content: &str) -> Result<()> {
        self.shared.record(serde_json::to_string(content).unwrap().len());
        Ok(())
    }

    fn receive(&mut self) -> FragmentStream<'_> {
        self.shared.next_reply()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// `list` returns two files, `fail` always errors, `write` echoes its path.
pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_fn(ToolSpec::new("list", "List files"), |_| async {
            Ok::<_, ToolError>(json!(["a.txt", "b.txt"]))
        })
        .register_fn(ToolSpec::new("fail", "Always fails"), |_| async {
            Err::<Value, _>(ToolError::execution("disk on fire"))
        })
        .register_fn(
            ToolSpec::new("write", "Write a file").required("path", ParamKind::String, ""),
            |args| async move { Ok::<_, ToolError>(json!({ "written": args["path"] })) },
        );
    registry
}

pub fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 1;
    config
}

pub fn conversation(
    provider: &Scripted,
    registry: ToolRegistry,
    config: RuntimeConfig,
) -> (Conversation, Arc<EventStore>) {
    let store = Arc::new(EventStore::in_memory().unwrap());
    let log: Arc<dyn EventLog> = store.clone();
    let conversation = Conversation::new(
        log,
        Arc::new(provider.clone()),
        Arc::new(registry),
        config,
    );
    (conversation, store)
}

pub fn types(events: &[Event]) -> Vec<EventType> {
    events.iter().map(Event::event_type).collect()
}

pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind.clone()).collect()
}

/// Every call in the log is followed, in its batch, by exactly one result
/// for the same tool.
pub fn assert_no_orphan_calls(events: &[Event]) {
    let mut i = 0;
    while i < events.len() {
        let calls: Vec<_> = events[i..]
            .iter()
            .map_while(|e| match &e.kind {
                EventKind::Call(call) => Some(call.name.clone()),
                _ => None,
            })
            .collect();
        if calls.is_empty() {
            i += 1;
            continue;
        }
        let results: Vec<_> = events[i + calls.len()..]
            .iter()
            .map_while(|e| match &e.kind {
                EventKind::Result(result) => Some(result.tool.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(calls, results, "calls without matching results at {i}");
        i += calls.len() + results.len();
    }
}
