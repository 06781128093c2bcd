//! SQLite event store implementation.

use crate::{ConversationId, Error, Event, EventType, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};

/// Read/write contract every log backend satisfies.
///
/// The log is append-only: there is no update or delete.
pub trait EventLog: Send + Sync {
    /// Append a durable event. Returns its sequence number once committed.
    fn append(&self, conversation: ConversationId, event: &Event) -> Result<i64>;

    /// Append several events atomically: either all are committed, in
    /// order, or none is.
    fn append_batch(&self, conversation: ConversationId, events: &[Event]) -> Result<Vec<i64>>;

    /// Load the log in append order, or only its last `window` events.
    fn load(&self, conversation: ConversationId, window: Option<usize>) -> Result<Vec<Event>>;

    /// Summaries of every stored conversation, most recently active first.
    fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
}

/// Summary of a stored conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub event_count: usize,
}

/// SQLite-backed event store.
///
/// Appends are serialized through a single connection.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_conversation
                ON events(conversation_id, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    fn insert(conn: &Connection, conversation: &str, event: &Event) -> Result<i64> {
        let content = event.encode_content()?;
        conn.execute(
            "INSERT INTO events (conversation_id, type, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation,
                event.event_type().as_str(),
                content,
                event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load only the events of one type, in append order.
    pub fn load_kind(&self, conversation: ConversationId, kind: EventType) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, type, content, timestamp FROM events
             WHERE conversation_id = ?1 AND type = ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![conversation.to_string(), kind.as_str()], read_row)?;
        rows.map(|row| decode_row(row?)).collect()
    }
}

type Row = (i64, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_row((seq, event_type, content, timestamp): Row) -> Result<Event> {
    let timestamp = parse_timestamp(seq, &timestamp)?;
    Event::decode(&event_type, content, timestamp)
        .map_err(|reason| Error::InvalidRow { seq, reason })
}

fn parse_timestamp(seq: i64, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::InvalidRow {
            seq,
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

impl EventLog for EventStore {
    #[instrument(
        skip(self, event),
        fields(conversation = %conversation, kind = %event.event_type())
    )]
    fn append(&self, conversation: ConversationId, event: &Event) -> Result<i64> {
        let conn = self.conn()?;
        let seq = Self::insert(&conn, &conversation.to_string(), event)?;
        debug!(seq, "event appended");
        Ok(seq)
    }

    #[instrument(skip(self, events), fields(conversation = %conversation, count = events.len()))]
    fn append_batch(&self, conversation: ConversationId, events: &[Event]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = conversation.to_string();
        // Dropping `tx` on an early return rolls back.
        let seqs = events
            .iter()
            .map(|event| Self::insert(&tx, &id, event))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        debug!(last = ?seqs.last(), "batch appended");
        Ok(seqs)
    }

    #[instrument(skip(self), fields(conversation = %conversation))]
    fn load(&self, conversation: ConversationId, window: Option<usize>) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let id = conversation.to_string();
        let rows: Vec<Row> = match window {
            None => {
                let mut stmt = conn.prepare(
                    "SELECT seq, type, content, timestamp FROM events
                     WHERE conversation_id = ?1 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([&id], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Some(n) => {
                let mut stmt = conn.prepare(
                    "SELECT seq, type, content, timestamp FROM events
                     WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2",
                )?;
                let limit = i64::try_from(n).unwrap_or(i64::MAX);
                let mut rows = stmt
                    .query_map(params![id, limit], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.reverse();
                rows
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, MIN(seq), MAX(seq), COUNT(*) FROM events
             GROUP BY conversation_id ORDER BY MAX(seq) DESC",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut timestamp_at = conn.prepare("SELECT timestamp FROM events WHERE seq = ?1")?;
        let mut summaries = Vec::with_capacity(groups.len());
        for (id, first, last, count) in groups {
            let id = id.parse().map_err(|e| Error::InvalidRow {
                seq: first,
                reason: format!("bad conversation id: {e}"),
            })?;
            let started: String = timestamp_at.query_row([first], |row| row.get(0))?;
            let ended: String = timestamp_at.query_row([last], |row| row.get(0))?;
            summaries.push(ConversationSummary {
                id,
                started_at: parse_timestamp(first, &started)?,
                last_event_at: parse_timestamp(last, &ended)?,
                event_count: usize::try_from(count).unwrap_or_default(),
            });
        }
        Ok(summaries)
    }
}
