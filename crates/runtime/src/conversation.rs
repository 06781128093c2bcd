//! Conversation controller.
//!
//! Drives turns through the provider → parser → accumulator → store pipeline
//! and picks how the provider is addressed:
//!
//! - **Replay**: every pass rebuilds the context from the log and sends all
//!   of it.
//! - **Resume**: a persistent provider session holds the context; a pass
//!   only sends what the model has not seen yet (the user input or the last
//!   batch's results). A dropped session is rebuilt from the log.
//!
//! Callers observe the same events in both modes.

use crate::accumulator::{Accumulator, EventSink, Step};
use crate::config::{ModePreference, RuntimeConfig};
use crate::context::{
    ContextAssembler, Message, estimate_message_tokens, estimate_tokens, system_prompt,
};
use crate::protocol::{Parsed, Parser, Syntax};
use crate::providers::{FragmentStream, Provider, ProviderSession};
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::turn::TurnState;
use crate::{Error, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use storage::{ConversationId, Event, EventKind, EventLog, Metrics, ToolResult, Usage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PASS_CHANNEL_CAPACITY: usize = 64;

/// How the provider is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Resume,
    Replay,
}

impl ExecutionMode {
    pub fn resolve(preference: ModePreference, supports_sessions: bool) -> Self {
        match (preference, supports_sessions) {
            (ModePreference::Replay, _) => Self::Replay,
            (ModePreference::Auto | ModePreference::Resume, true) => Self::Resume,
            (ModePreference::Resume, false) => {
                warn!("provider has no sessions; falling back to replay");
                Self::Replay
            }
            (ModePreference::Auto, false) => Self::Replay,
        }
    }
}

/// Summary of a finished turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    /// Respond text of the turn, one unit per line.
    pub response: String,
    /// Model passes made.
    pub iterations: u32,
    pub interrupted: bool,
    pub usage: Usage,
}

/// Result of one model pass.
#[derive(Debug, Default)]
struct PassOutput {
    step: Option<Step>,
    response: Vec<String>,
    results: Vec<ToolResult>,
    state: TurnState,
    usage: Usage,
}

/// A conversation bound to a log, a provider and a tool set.
pub struct Conversation {
    id: ConversationId,
    log: Arc<dyn EventLog>,
    provider: Arc<dyn Provider>,
    executor: ToolExecutor,
    assembler: ContextAssembler,
    config: RuntimeConfig,
    mode: ExecutionMode,
    session: Option<Box<dyn ProviderSession>>,
    /// Messages the resume session has not seen yet.
    outbox: Vec<Message>,
    usage: Usage,
    state: TurnState,
}

impl Conversation {
    /// Start a new conversation.
    pub fn new(
        log: Arc<dyn EventLog>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self::open(ConversationId::new(), log, provider, tools, config)
    }

    /// Continue a stored conversation. Context is rebuilt from its log on
    /// the next pass.
    pub fn open(
        id: ConversationId,
        log: Arc<dyn EventLog>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let syntax = Syntax::default();
        let system = system_prompt(config.instructions.as_deref(), &tools.specs(), &syntax);
        let assembler = ContextAssembler::new(system, syntax).with_window(config.window);
        let executor = ToolExecutor::new(tools).with_timeout(config.tool_timeout());
        let mode = ExecutionMode::resolve(config.mode, provider.supports_sessions());
        debug!(conversation = %id, provider = provider.name(), ?mode, "conversation opened");
        Self {
            id,
            log,
            provider,
            executor,
            assembler,
            config,
            mode,
            session: None,
            outbox: Vec::new(),
            usage: Usage::default(),
            state: TurnState::AwaitingModel,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Usage accumulated over every turn of this handle.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The stored log.
    pub fn history(&self) -> Result<Vec<Event>> {
        Ok(self.log.load(self.id, None)?)
    }

    /// The context a fresh provider connection would receive.
    pub fn messages(&self) -> Result<Vec<Message>> {
        let events = self.log.load(self.id, self.assembler.window())?;
        Ok(self.assembler.to_messages(&events))
    }

    /// Run one turn: the user input, then model passes until the model stops
    /// asking for tools, the turn is interrupted, or the pass limit is hit.
    #[instrument(skip_all, fields(conversation = %self.id))]
    pub async fn turn(
        &mut self,
        input: &str,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let user = Event::user(input);
        self.log.append(self.id, &user)?;
        sink.emit(&user);
        self.outbox.push(Message::user(input));
        self.state = TurnState::AwaitingModel;

        let mut outcome = TurnOutcome::default();
        let mut response = Vec::new();
        let mut wants_more = false;

        while outcome.iterations < self.config.max_iterations && !cancel.is_cancelled() {
            outcome.iterations += 1;
            let pass = self.pass_with_retry(sink, cancel).await?;

            outcome.usage += pass.usage;
            self.usage += pass.usage;
            sink.emit(&Event::new(EventKind::Metric(Metrics {
                step: pass.usage,
                total: self.usage,
            })));
            response.extend(pass.response);
            self.state = pass.state;

            wants_more = matches!(pass.step, Some(Step::Executed { .. }));
            // Results the model has not seen travel with the next send, even
            // when the model already ended the turn.
            if !pass.results.is_empty() {
                let rendered = self.assembler.syntax().render_results(&pass.results);
                self.outbox.push(Message::user(rendered));
            }
            if !wants_more {
                break;
            }
            self.state.resume();
        }

        if cancel.is_cancelled() {
            info!(iterations = outcome.iterations, "turn interrupted");
            outcome.interrupted = true;
            sink.emit(&Event::new(EventKind::Interrupt));
        } else if wants_more {
            warn!(limit = self.config.max_iterations, "iteration limit reached");
            sink.emit(&Event::error(format!(
                "iteration limit of {} reached",
                self.config.max_iterations
            )));
        }

        self.state.complete();
        outcome.response = response.join("\n");
        Ok(outcome)
    }

    /// Close the provider session, if any.
    pub async fn close(mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    async fn pass_with_retry(
        &mut self,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<PassOutput> {
        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            let err = match self.run_pass(sink, cancel).await {
                Ok(pass) => return Ok(pass),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            sink.emit(&Event::error(err.to_string()));
            // Reconnect with the context rebuilt from the log.
            self.session = None;

            if attempt >= retry.max_retries {
                return Err(Error::Transport(format!(
                    "giving up after {attempt} retries: {err}"
                )));
            }
            let delay = retry.backoff(attempt);
            attempt += 1;
            warn!(attempt, error = %err, ?delay, "model pass failed; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(PassOutput::default()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_pass(
        &mut self,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<PassOutput> {
        let started = Instant::now();
        let prepared = tokio::select! {
            prepared = self.prepare_pass() => Some(prepared),
            _ = cancel.cancelled() => None,
        };
        let Some(prepared) = prepared else {
            debug!("interrupted while waiting on the provider");
            // A half-sent request leaves the session out of step with the log.
            self.session = None;
            return Ok(PassOutput::default());
        };
        let (replay, sent) = prepared?;
        let mut fragments = match replay {
            Some(stream) => stream,
            None => self
                .session
                .as_mut()
                .ok_or_else(|| Error::InvalidState("no provider session".into()))?
                .receive(),
        };

        let (tx, rx) = mpsc::channel::<Parsed>(PASS_CHANNEL_CAPACITY);
        let stop = cancel.child_token();
        let syntax = self.assembler.syntax().clone();

        let producer = async {
            let mut parser = Parser::new(syntax);
            let mut received: u64 = 0;
            let read = 'read: loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => None,
                    next = fragments.next() => Some(next),
                };
                let (items, outcome) = match next {
                    // Interrupted or the consumer is done.
                    None => (parser.abort(), Some(Ok(()))),
                    Some(Some(Ok(fragment))) => {
                        received += fragment.chars().count() as u64;
                        (parser.feed(&fragment), None)
                    }
                    Some(Some(Err(e))) => (parser.abort(), Some(Err(e))),
                    Some(None) => (parser.finish(), Some(Ok(()))),
                };
                for item in items {
                    if tx.send(item).await.is_err() {
                        break 'read outcome.unwrap_or(Ok(()));
                    }
                }
                if let Some(outcome) = outcome {
                    break outcome;
                }
            };
            drop(tx);
            (read, received)
        };

        let executor = &self.executor;
        let log = &*self.log;
        let id = self.id;
        let granularity = self.config.granularity;
        let consumer = async {
            let mut rx = rx;
            let _stop_producer = stop.clone().drop_guard();
            let mut acc = Accumulator::new(executor, log, id, granularity, cancel);
            let mut step = None;
            // Text after a batch belongs to this pass; only the end marker
            // or the end of the stream closes it.
            while let Some(item) = rx.recv().await {
                match (acc.accept(item, sink).await?, step) {
                    (Step::Continue, _) => {}
                    (Step::Ended, _) => {
                        step = Some(Step::Ended);
                        break;
                    }
                    (
                        Step::Executed { executed, skipped },
                        Some(Step::Executed {
                            executed: before,
                            skipped: dropped,
                        }),
                    ) => {
                        step = Some(Step::Executed {
                            executed: before + executed,
                            skipped: dropped + skipped,
                        });
                    }
                    (batch, _) => step = Some(batch),
                }
            }
            acc.finish(sink);
            Ok::<_, Error>(PassOutput {
                step,
                response: acc.response().to_vec(),
                results: acc.results().to_vec(),
                state: acc.state(),
                usage: Usage::default(),
            })
        };

        let ((read, received), consumed) = tokio::join!(producer, consumer);
        let mut pass = consumed?;
        match read {
            Err(e) if pass.step.is_none() => return Err(e),
            Err(e) => debug!(error = %e, "stream failed after the pass was decided"),
            Ok(()) => {}
        }

        pass.usage = Usage {
            input_tokens: sent,
            output_tokens: received.div_ceil(4),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        debug!(
            step = ?pass.step,
            input_tokens = pass.usage.input_tokens,
            output_tokens = pass.usage.output_tokens,
            "pass finished"
        );
        Ok(pass)
    }

    /// Get the provider ready for the next pass: send the full context
    /// (replay, new session) or only the outbox (live session).
    ///
    /// Returns the replay stream, if any, and an estimate of the tokens
    /// sent. In resume mode the reply is read from the session.
    async fn prepare_pass(&mut self) -> Result<(Option<FragmentStream<'static>>, u64)> {
        match self.mode {
            ExecutionMode::Replay => {
                let messages = self.messages()?;
                self.outbox.clear();
                let stream = self.provider.stream(&messages).await?;
                Ok((Some(stream), estimate_message_tokens(&messages)))
            }
            ExecutionMode::Resume => {
                let sent = match self.session.as_mut() {
                    Some(session) => {
                        let content = self
                            .outbox
                            .iter()
                            .map(|m| m.content.as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                        session.send(&content).await?;
                        estimate_tokens(&content)
                    }
                    None => {
                        let messages = self.messages()?;
                        self.session = Some(self.provider.connect(&messages).await?);
                        estimate_message_tokens(&messages)
                    }
                };
                self.outbox.clear();
                Ok((None, sent))
            }
        }
    }
}
