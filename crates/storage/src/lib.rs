//! SQLite-backed conversation log for skein.
//!
//! Every durable event of a conversation is appended here the moment it is
//! known, and the log is the only source of truth the runtime rebuilds
//! provider context from. Nothing is ever updated or deleted.
//!
//! # Core Concepts
//!
//! ## EventLog
//!
//! [`EventLog`] is the read/write contract: `append`, `load` (optionally the
//! last N events) and `list_conversations`. [`EventStore`] implements it on
//! SQLite; appends are serialized and ordered by an autoincrement sequence,
//! not by timestamp.
//!
//! ## Event
//!
//! An [`Event`] is an [`EventKind`] plus a timestamp. Only `user`, `think`,
//! `call`, `result` and `respond` are durable; the rest (`execute`, `end`,
//! `metric`, `error`, `interrupt`) are runtime signals and are rejected by
//! the store.
//!
//! # Example
//!
//! ```no_run
//! use storage::{ConversationId, Event, EventLog, EventStore};
//!
//! let store = EventStore::open("events.db")?;
//! let id = ConversationId::new();
//!
//! store.append(id, &Event::user("what files are here?"))?;
//! store.append(id, &Event::respond("Let me look."))?;
//!
//! for event in store.load(id, None)? {
//!     println!("{}: {:?}", event.timestamp, event.kind);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod event;
mod store;

pub use error::{Error, Result};
pub use event::{
    ConversationId, Event, EventKind, EventType, Metrics, ToolCall, ToolResult, ToolStatus, Usage,
};
pub use store::{ConversationSummary, EventLog, EventStore};
