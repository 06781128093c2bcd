//! Accumulator: the bridge between parsed events, tools, the log and the
//! caller.
//!
//! Calls are buffered until their `execute` boundary, then the batch is
//! drained exactly once and handed to the executor. Think and respond units
//! are persisted as soon as they are complete. Calls are committed together
//! with their results in one atomic append after the batch ran, so the log
//! never holds a call without its result.

use crate::config::Granularity;
use crate::protocol::{Parsed, TextKind};
use crate::tools::ToolExecutor;
use crate::turn::TurnState;
use crate::Result;
use storage::{ConversationId, Event, EventKind, EventLog, ToolCall, ToolResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives events as the turn produces them.
pub trait EventSink: Send {
    fn emit(&mut self, event: &Event);
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: &Event) {
        self.push(event.clone());
    }
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn emit(&mut self, event: &Event) {
        // A receiver that went away only loses the display copy.
        let _ = self.send(event.clone());
    }
}

/// What the caller should do after an item was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// A batch ran; the model needs a new pass to see the results.
    Executed { executed: usize, skipped: usize },
    /// The model signalled end of turn.
    Ended,
}

/// Per-pass accumulator.
pub struct Accumulator<'a> {
    executor: &'a ToolExecutor,
    log: &'a dyn EventLog,
    conversation: ConversationId,
    granularity: Granularity,
    cancel: &'a CancellationToken,
    pending: Vec<ToolCall>,
    unit: Option<(TextKind, String)>,
    response: Vec<String>,
    results: Vec<ToolResult>,
    state: TurnState,
}

impl<'a> Accumulator<'a> {
    pub fn new(
        executor: &'a ToolExecutor,
        log: &'a dyn EventLog,
        conversation: ConversationId,
        granularity: Granularity,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            executor,
            log,
            conversation,
            granularity,
            cancel,
            pending: Vec::new(),
            unit: None,
            response: Vec::new(),
            results: Vec::new(),
            state: TurnState::AwaitingModel,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Respond text persisted during this pass.
    pub fn response(&self) -> &[String] {
        &self.response
    }

    /// Results produced during this pass.
    pub fn results(&self) -> &[ToolResult] {
        &self.results
    }

    /// Calls buffered but not yet executed.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub async fn accept(&mut self, item: Parsed, sink: &mut dyn EventSink) -> Result<Step> {
        let event = match item {
            Parsed::Delta { kind, text } => {
                if self.granularity == Granularity::Token {
                    sink.emit(&kind.event(text));
                }
                return Ok(Step::Continue);
            }
            Parsed::Event(event) => event,
        };

        match &event.kind {
            EventKind::Think(text) | EventKind::Respond(text) => {
                self.state.observe(&event.kind);
                self.log.append(self.conversation, &event)?;
                let kind = if matches!(event.kind, EventKind::Think(_)) {
                    TextKind::Think
                } else {
                    self.response.push(text.clone());
                    TextKind::Respond
                };
                if self.granularity == Granularity::Unit {
                    self.buffer_unit(kind, text, sink);
                }
                Ok(Step::Continue)
            }
            EventKind::Call(call) => {
                self.state.observe(&event.kind);
                self.flush_unit(sink);
                self.pending.push(call.clone());
                Ok(Step::Continue)
            }
            EventKind::Execute if self.pending.is_empty() => {
                debug!("empty execute boundary");
                Ok(Step::Continue)
            }
            EventKind::Execute => {
                self.state.observe(&event.kind);
                self.flush_unit(sink);
                self.execute(sink).await
            }
            EventKind::End => {
                self.flush_unit(sink);
                self.state.complete();
                sink.emit(&event);
                Ok(Step::Ended)
            }
            _ => {
                sink.emit(&event);
                Ok(Step::Continue)
            }
        }
    }

    async fn execute(&mut self, sink: &mut dyn EventSink) -> Result<Step> {
        let batch = std::mem::take(&mut self.pending);
        debug!(calls = batch.len(), "executing batch");
        let results = self.executor.execute_batch(&batch, self.cancel).await;

        let executed = results.len();
        let calls: Vec<Event> = batch[..executed].iter().cloned().map(Event::call).collect();
        let outputs: Vec<Event> = results.iter().cloned().map(Event::result).collect();
        let records: Vec<Event> = calls.iter().chain(&outputs).cloned().collect();
        self.log.append_batch(self.conversation, &records)?;

        for event in &calls {
            sink.emit(event);
        }
        sink.emit(&Event::new(EventKind::Execute));
        for event in &outputs {
            sink.emit(event);
        }
        self.results.extend(results);

        let skipped = batch.len() - executed;
        if skipped > 0 {
            warn!(executed, skipped, "batch interrupted; remaining calls dropped");
        }
        Ok(Step::Executed { executed, skipped })
    }

    fn buffer_unit(&mut self, kind: TextKind, text: &str, sink: &mut dyn EventSink) {
        match &mut self.unit {
            Some((current, buffered)) if *current == kind => {
                buffered.push('\n');
                buffered.push_str(text);
            }
            _ => {
                self.flush_unit(sink);
                self.unit = Some((kind, text.to_string()));
            }
        }
    }

    fn flush_unit(&mut self, sink: &mut dyn EventSink) {
        if let Some((kind, text)) = self.unit.take() {
            sink.emit(&kind.event(text));
        }
    }

    /// End of pass: flush buffered text and drop calls that never reached
    /// an execute boundary.
    pub fn finish(&mut self, sink: &mut dyn EventSink) {
        self.flush_unit(sink);
        if !self.pending.is_empty() {
            warn!(
                calls = self.pending.len(),
                "discarding calls without an execute boundary"
            );
            self.pending.clear();
        }
    }
}
