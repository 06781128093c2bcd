//! End-to-end turns through a scripted provider.

mod common;

use common::*;
use async_trait::async_trait;
use runtime::{
    Conversation, Error, FragmentStream, Granularity, Message, Provider, ProviderSession, Role,
    RuntimeConfig, ToolError, ToolRegistry, ToolSpec,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storage::{
    ConversationId, ConversationSummary, Event, EventKind, EventLog, EventStore, EventType,
    ToolCall, ToolResult, ToolStatus,
};
use tokio_util::sync::CancellationToken;

const LIST_AND_THINK: &str =
    r#"<think>check files</think><execute>[{"name": "list", "args": {}}]</execute>"#;

#[tokio::test]
async fn think_execute_respond() {
    let provider = Scripted::replay(vec![
        vec![text(LIST_AND_THINK)],
        vec![text("Found two files.<end>")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry(), config());
    let mut emitted = Vec::new();

    let outcome = conversation
        .turn("what is here?", &mut emitted, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.response, "Found two files.");
    assert_eq!(outcome.iterations, 2);
    assert!(!outcome.interrupted);

    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        kinds(&stored),
        vec![
            EventKind::User("what is here?".into()),
            EventKind::Think("check files".into()),
            EventKind::Call(ToolCall::new("list", Default::default())),
            EventKind::Result(ToolResult::success("list", json!(["a.txt", "b.txt"]))),
            EventKind::Respond("Found two files.".into()),
        ]
    );

    let visible: Vec<_> = types(&emitted)
        .into_iter()
        .filter(|t| *t != EventType::Metric)
        .collect();
    assert_eq!(
        visible,
        vec![
            EventType::User,
            EventType::Think,
            EventType::Call,
            EventType::Execute,
            EventType::Result,
            EventType::Respond,
            EventType::End,
        ]
    );
    assert_eq!(
        types(&emitted).iter().filter(|t| **t == EventType::Metric).count(),
        2
    );
}

#[tokio::test]
async fn malformed_batch_is_shown_as_text() {
    let provider = Scripted::replay(vec![vec![text(
        r#"Let me look.<execute>[{"name": "list", "args": </execute>"#,
    )]]);
    let (mut conversation, store) = conversation(&provider, registry(), config());
    let mut emitted = Vec::new();

    let outcome = conversation
        .turn("look", &mut emitted, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.iterations, 1);
    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(types(&stored), vec![EventType::User, EventType::Respond]);
    let text = stored[1].text().unwrap();
    assert!(text.starts_with("Let me look."));
    assert!(text.contains(r#"<execute>[{"name": "list", "args": "#));
    assert!(!types(&emitted).contains(&EventType::Call));
}

#[tokio::test]
async fn failed_call_does_not_stop_the_batch() {
    let provider = Scripted::replay(vec![
        vec![text(
            r#"<execute>[{"name": "list", "args": {}}, {"name": "fail", "args": {}}, {"name": "write", "args": {"path": "x"}}]</execute>"#,
        )],
        vec![text("Done.")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry(), config());

    conversation
        .turn("go", &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        types(&stored),
        vec![
            EventType::User,
            EventType::Call,
            EventType::Call,
            EventType::Call,
            EventType::Result,
            EventType::Result,
            EventType::Result,
            EventType::Respond,
        ]
    );
    let statuses: Vec<_> = stored
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Result(r) => Some((r.tool.as_str(), r.status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("list", ToolStatus::Success),
            ("fail", ToolStatus::Failure),
            ("write", ToolStatus::Success),
        ]
    );
    assert_no_orphan_calls(&stored);
}

#[tokio::test]
async fn unknown_tool_and_bad_arguments_become_failed_results() {
    let provider = Scripted::replay(vec![
        vec![text(
            r#"<execute>[{"name": "nope", "args": {}}, {"name": "write", "args": {}}]</execute>"#,
        )],
        vec![text("ok")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry(), config());

    conversation
        .turn("go", &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    let results: Vec<_> = store
        .load_kind(conversation.id(), EventType::Result)
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Result(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ToolStatus::Failure));
}

#[tokio::test]
async fn interrupt_mid_batch_leaves_no_orphan_call() {
    let cancel = CancellationToken::new();
    let mut registry = registry();
    let trigger = cancel.clone();
    registry.register_fn(ToolSpec::new("stop", "Interrupts the turn"), move |_| {
        let trigger = trigger.clone();
        async move {
            trigger.cancel();
            Ok::<_, ToolError>(json!("stopping"))
        }
    });
    let provider = Scripted::replay(vec![
        vec![text(
            r#"<execute>[{"name": "stop", "args": {}}, {"name": "list", "args": {}}]</execute>"#,
        )],
        vec![text("never read")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry, config());
    let mut emitted = Vec::new();

    let outcome = conversation.turn("go", &mut emitted, &cancel).await.unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(emitted.last().unwrap().kind, EventKind::Interrupt);

    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        kinds(&stored),
        vec![
            EventKind::User("go".into()),
            EventKind::Call(ToolCall::new("stop", Default::default())),
            EventKind::Result(ToolResult::success("stop", json!("stopping"))),
        ]
    );
    assert_eq!(provider.sent().len(), 1);
}

/// Provider that never answers.
struct Stalled {
    sessions: bool,
}

#[async_trait]
impl Provider for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    async fn stream(&self, _messages: &[Message]) -> runtime::Result<FragmentStream<'static>> {
        std::future::pending().await
    }

    async fn connect(&self, _messages: &[Message]) -> runtime::Result<Box<dyn ProviderSession>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn interrupt_while_waiting_on_the_provider() {
    for sessions in [false, true] {
        let store = Arc::new(EventStore::in_memory().unwrap());
        let mut stalled = Conversation::new(
            store.clone(),
            Arc::new(Stalled { sessions }),
            Arc::new(registry()),
            config(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut emitted = Vec::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            stalled.turn("hello", &mut emitted, &cancel),
        )
        .await
        .expect("interrupt was not observed")
        .unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(emitted.last().unwrap().kind, EventKind::Interrupt);
        let stored = store.load(stalled.id(), None).unwrap();
        assert_eq!(types(&stored), [EventType::User]);
    }
}

#[tokio::test]
async fn text_after_a_batch_is_kept() {
    let provider = Scripted::replay(vec![
        vec![text(
            r#"<execute>[{"name": "list", "args": {}}]</execute>Trailing remark after the batch."#,
        )],
        vec![text("Done.<end>")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry(), config());
    let mut emitted = Vec::new();

    let outcome = conversation
        .turn("go", &mut emitted, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.response, "Trailing remark after the batch.\nDone.");
    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        types(&stored),
        [
            EventType::User,
            EventType::Call,
            EventType::Result,
            EventType::Respond,
            EventType::Respond,
        ]
    );
    let texts: Vec<_> = emitted.iter().filter_map(Event::text).collect();
    assert_eq!(texts, ["go", "Trailing remark after the batch.", "Done."]);
    assert_no_orphan_calls(&stored);
}

#[tokio::test]
async fn every_batch_in_a_pass_runs() {
    let provider = Scripted::resume(vec![
        vec![text(concat!(
            r#"<execute>[{"name": "list", "args": {}}]</execute>"#,
            "between",
            r#"<execute>[{"name": "write", "args": {"path": "b.txt"}}]</execute>"#,
        ))],
        vec![text("ok<end>")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry(), config());

    let outcome = conversation
        .turn("go", &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.iterations, 2);
    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        types(&stored),
        [
            EventType::User,
            EventType::Call,
            EventType::Result,
            EventType::Respond,
            EventType::Call,
            EventType::Result,
            EventType::Respond,
        ]
    );
    assert_no_orphan_calls(&stored);
    // Both batches' results went out in the one send after the pass.
    assert_eq!(provider.sent().len(), 2);
}

#[tokio::test]
async fn cancelled_before_the_turn_makes_no_pass() {
    let provider = Scripted::replay(vec![vec![text("hi")]]);
    let (mut conversation, store) = conversation(&provider, registry(), config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = conversation.turn("hello", &mut Vec::new(), &cancel).await.unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.iterations, 0);
    assert!(provider.sent().is_empty());
    assert_eq!(types(&store.load(conversation.id(), None).unwrap()), vec![EventType::User]);
}

fn ten_event_log(store: &EventStore) -> ConversationId {
    let id = ConversationId::new();
    let events = [
        Event::user("q1"),
        Event::think("t1"),
        Event::call(ToolCall::new("list", Default::default())),
        Event::result(ToolResult::success("list", json!([]))),
        Event::respond("r1"),
        Event::user("q2"),
        Event::think("t2"),
        Event::call(ToolCall::new("list", Default::default())),
        Event::result(ToolResult::success("list", json!(["a.txt"]))),
        Event::respond("r2"),
    ];
    for event in &events {
        store.append(id, event).unwrap();
    }
    id
}

fn open_windowed(store: &Arc<EventStore>, id: ConversationId, window: usize) -> Conversation {
    let log: Arc<dyn EventLog> = store.clone();
    let config = RuntimeConfig {
        window: Some(window),
        ..config()
    };
    Conversation::open(
        id,
        log,
        Arc::new(Scripted::replay(vec![])),
        Arc::new(registry()),
        config,
    )
}

#[test]
fn window_drops_a_dangling_batch_fragment() {
    let store = Arc::new(EventStore::in_memory().unwrap());
    let id = ten_event_log(&store);

    // The last two events are a result and a respond; the result has lost
    // its call.
    let messages = open_windowed(&store, id, 2).messages().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "r2");
}

#[test]
fn window_keeps_whole_batches() {
    let store = Arc::new(EventStore::in_memory().unwrap());
    let id = ten_event_log(&store);

    let messages = open_windowed(&store, id, 4).messages().unwrap();
    let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::Assistant, Role::User, Role::Assistant]
    );
    assert!(messages[1].content.contains("<think>t2</think>"));
    assert!(messages[1].content.contains("<execute>"));
    assert!(messages[2].content.starts_with("<results>"));
    assert!(messages[2].content.contains("a.txt"));

    let full = open_windowed(&store, id, 100).messages().unwrap();
    assert_eq!(full[1], runtime::Message::user("q1"));
}

#[tokio::test]
async fn fragmentation_does_not_change_the_log() {
    let whole = Scripted::replay(vec![vec![text(LIST_AND_THINK)], vec![text("Two files.")]]);
    let split = Scripted::replay(vec![chars(LIST_AND_THINK), chars("Two files.")]);

    let mut logs = Vec::new();
    for provider in [&whole, &split] {
        let (mut conversation, store) = conversation(provider, registry(), config());
        conversation
            .turn("go", &mut Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        logs.push(kinds(&store.load(conversation.id(), None).unwrap()));
    }
    assert_eq!(logs[0], logs[1]);
    assert!(logs[0].contains(&EventKind::Think("check files".into())));
}

#[tokio::test]
async fn token_granularity_streams_deltas() {
    let provider = Scripted::replay(vec![chars("<think>check files</think>Hello there")]);
    let config = RuntimeConfig {
        granularity: Granularity::Token,
        ..config()
    };
    let (mut conversation, store) = conversation(&provider, registry(), config);
    let mut emitted = Vec::new();

    conversation
        .turn("hi", &mut emitted, &CancellationToken::new())
        .await
        .unwrap();

    let deltas = |wanted: EventType| -> Vec<String> {
        emitted
            .iter()
            .filter(|e| e.event_type() == wanted)
            .filter_map(|e| e.text().map(str::to_string))
            .collect()
    };
    let think = deltas(EventType::Think);
    assert!(think.len() > 1);
    assert_eq!(think.concat(), "check files");
    assert_eq!(deltas(EventType::Respond).concat(), "Hello there");

    // The log still holds whole units.
    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        kinds(&stored),
        vec![
            EventKind::User("hi".into()),
            EventKind::Think("check files".into()),
            EventKind::Respond("Hello there".into()),
        ]
    );
}

#[tokio::test]
async fn iteration_limit_ends_the_turn() {
    let batch = r#"<execute>[{"name": "list", "args": {}}]</execute>"#;
    let provider = Scripted::replay(vec![vec![text(batch)]; 5]);
    let config = RuntimeConfig {
        max_iterations: 3,
        ..config()
    };
    let (mut conversation, store) = conversation(&provider, registry(), config);
    let mut emitted = Vec::new();

    let outcome = conversation
        .turn("loop", &mut emitted, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.iterations, 3);
    assert!(!outcome.interrupted);
    assert_eq!(
        emitted.last().unwrap().kind,
        EventKind::Error("iteration limit of 3 reached".into())
    );
    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(stored.len(), 1 + 3 * 2);
    assert_no_orphan_calls(&stored);
}

/// Store that refuses to persist one event type.
struct RefusingLog {
    store: EventStore,
    refused: EventType,
}

impl RefusingLog {
    fn new(refused: EventType) -> Self {
        Self {
            store: EventStore::in_memory().unwrap(),
            refused,
        }
    }
}

impl EventLog for RefusingLog {
    fn append(&self, conversation: ConversationId, event: &Event) -> storage::Result<i64> {
        if event.event_type() == self.refused {
            return Err(storage::Error::Poisoned);
        }
        self.store.append(conversation, event)
    }

    fn append_batch(
        &self,
        conversation: ConversationId,
        events: &[Event],
    ) -> storage::Result<Vec<i64>> {
        if events.iter().any(|e| e.event_type() == self.refused) {
            return Err(storage::Error::Poisoned);
        }
        self.store.append_batch(conversation, events)
    }

    fn load(
        &self,
        conversation: ConversationId,
        window: Option<usize>,
    ) -> storage::Result<Vec<Event>> {
        self.store.load(conversation, window)
    }

    fn list_conversations(&self) -> storage::Result<Vec<ConversationSummary>> {
        self.store.list_conversations()
    }
}

#[tokio::test]
async fn store_failure_ends_the_turn() {
    let provider = Scripted::replay(vec![vec![text("hello")], vec![text("again")]]);
    let log = Arc::new(RefusingLog::new(EventType::Respond));
    let mut conversation = Conversation::new(
        log,
        Arc::new(provider.clone()),
        Arc::new(ToolRegistry::new()),
        config(),
    );

    let err = conversation
        .turn("hi", &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Storage(storage::Error::Poisoned)));
    assert_eq!(provider.sent().len(), 1, "store errors are not retried");
}

#[tokio::test]
async fn refused_results_leave_no_orphan_calls() {
    let provider = Scripted::replay(vec![vec![text(LIST_AND_THINK)], vec![text("done")]]);
    let log = Arc::new(RefusingLog::new(EventType::Result));
    let mut conversation = Conversation::new(
        log.clone(),
        Arc::new(provider.clone()),
        Arc::new(registry()),
        config(),
    );

    let err = conversation
        .turn("go", &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Storage(storage::Error::Poisoned)));
    let stored = log.load(conversation.id(), None).unwrap();
    assert_eq!(types(&stored), [EventType::User, EventType::Think]);
    assert_no_orphan_calls(&stored);
}

#[tokio::test]
async fn transport_error_is_retried_from_the_log() {
    let provider = Scripted::resume(vec![
        vec![text("<think>hm"), fail("connection reset")],
        vec![text("Recovered.")],
    ]);
    let (mut conversation, store) = conversation(&provider, registry(), config());
    let mut emitted = Vec::new();

    let outcome = conversation
        .turn("hi", &mut emitted, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.response, "Recovered.");
    assert_eq!(provider.connects(), 2);
    let errors: Vec<_> = emitted
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Error(message) => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec!["network error: connection reset"]);

    let stored = store.load(conversation.id(), None).unwrap();
    assert_eq!(
        kinds(&stored),
        vec![
            EventKind::User("hi".into()),
            EventKind::Think("hm".into()),
            EventKind::Respond("Recovered.".into()),
        ]
    );
}

#[tokio::test]
async fn retries_give_up_eventually() {
    let provider = Scripted::replay(vec![vec![fail("down")]; 10]);
    let (mut conversation, _store) = conversation(&provider, registry(), config());
    let mut emitted = Vec::new();

    let err = conversation
        .turn("hi", &mut emitted, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    // One attempt plus three retries.
    assert_eq!(provider.sent().len(), 4);
    assert_eq!(
        types(&emitted).iter().filter(|t| **t == EventType::Error).count(),
        4
    );
}
