//! Child-process provider speaking newline-delimited JSON.
//!
//! Requests written to the child's stdin, one JSON object per line:
//!
//! ```text
//! {"type":"connect","messages":[{"role":"system","content":"..."}, ...]}
//! {"type":"send","content":"..."}
//! {"type":"close"}
//! ```
//!
//! Every `connect` and `send` is answered on stdout by zero or more
//! `{"type":"delta","text":"..."}` lines followed by `{"type":"done"}` or
//! `{"type":"error","message":"..."}`. The child keeps the conversation, so
//! this provider supports resume mode; replay mode spawns a short-lived child
//! per pass.

use super::{FragmentStream, Provider, ProviderSession};
use crate::context::Message;
use crate::{Error, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request<'a> {
    Connect { messages: &'a [Message] },
    Send { content: &'a str },
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Delta { text: String },
    Done,
    Error { message: String },
}

/// Provider backed by a child process.
#[derive(Debug, Clone)]
pub struct StdioProvider {
    command: String,
    args: Vec<String>,
}

impl StdioProvider {
    pub fn new(
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    async fn open(&self, messages: &[Message]) -> Result<StdioSession> {
        let mut process = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to capture stdin".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to capture stdout".into()))?;

        debug!(command = %self.command, "provider process spawned");
        let mut session = StdioSession {
            process,
            stdin,
            stdout: BufReader::new(stdout),
            unfinished: false,
        };
        session.write(&Request::Connect { messages }).await?;
        Ok(session)
    }
}

#[async_trait]
impl Provider for StdioProvider {
    fn name(&self) -> &str {
        "stdio"
    }

    fn supports_sessions(&self) -> bool {
        true
    }

    async fn stream(&self, messages: &[Message]) -> Result<FragmentStream<'static>> {
        let session = self.open(messages).await?;
        let fragments = stream! {
            let mut session = session;
            {
                let mut reply = session.receive();
                while let Some(fragment) = reply.next().await {
                    yield fragment;
                }
            }
            if let Err(e) = Box::new(session).close().await {
                debug!(error = %e, "closing replay process failed");
            }
        };
        Ok(Box::pin(fragments))
    }

    async fn connect(&self, messages: &[Message]) -> Result<Box<dyn ProviderSession>> {
        Ok(Box::new(self.open(messages).await?))
    }
}

/// A running provider process.
pub struct StdioSession {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// A reply was only partly read; its rest must be skipped.
    unfinished: bool,
}

impl StdioSession {
    async fn write(&mut self, request: &Request<'_>) -> Result<()> {
        let line = serde_json::to_string(request)?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next reply line, or `None` once the process closed stdout.
    async fn read_reply(&mut self) -> Result<Option<Reply>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| Error::Provider(format!("bad reply line: {e}")))
    }
}

#[async_trait]
impl ProviderSession for StdioSession {
    async fn send(&mut self, content: &str) -> Result<()> {
        self.write(&Request::Send { content }).await
    }

    fn receive(&mut self) -> FragmentStream<'_> {
        let this = self;
        Box::pin(stream! {
            if this.unfinished {
                loop {
                    match this.read_reply().await {
                        Ok(Some(Reply::Delta { .. })) => {}
                        Ok(Some(Reply::Done | Reply::Error { .. })) => break,
                        Ok(None) => {
                            yield Err(Error::Transport("provider process exited".into()));
                            return;
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                debug!("skipped rest of an abandoned reply");
            }

            this.unfinished = true;
            loop {
                match this.read_reply().await {
                    Ok(Some(Reply::Delta { text })) => yield Ok(text),
                    Ok(Some(Reply::Done)) => {
                        this.unfinished = false;
                        return;
                    }
                    Ok(Some(Reply::Error { message })) => {
                        this.unfinished = false;
                        yield Err(Error::Provider(message));
                        return;
                    }
                    Ok(None) => {
                        yield Err(Error::Transport("provider process exited".into()));
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.write(&Request::Close).await {
            debug!(error = %e, "close request not delivered");
        }
        match tokio::time::timeout(CLOSE_GRACE, self.process.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(%status, "provider process exited");
            }
            Err(_) => {
                warn!("provider process ignored close; killing it");
                self.process.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Answers every request except `close` with "hel" + "lo".
    const ECHO_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"close"'*) exit 0 ;;
    *) printf '%s\n' '{"type":"delta","text":"hel"}' '{"type":"delta","text":"lo"}' '{"type":"done"}' ;;
  esac
done
"#;

    fn provider() -> StdioProvider {
        StdioProvider::new("sh", ["-c", ECHO_SCRIPT])
    }

    async fn collect(mut stream: FragmentStream<'_>) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    #[tokio::test]
    async fn replay_stream() {
        let stream = provider().stream(&[Message::user("hi")]).await.unwrap();
        assert_eq!(collect(stream).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn session_round_trips() {
        let provider = provider();
        assert!(provider.supports_sessions());
        let mut session = provider.connect(&[Message::user("hi")]).await.unwrap();
        assert_eq!(collect(session.receive()).await.unwrap(), "hello");
        session.send("again").await.unwrap();
        assert_eq!(collect(session.receive()).await.unwrap(), "hello");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_reply_is_skipped() {
        let mut session = provider().connect(&[Message::user("hi")]).await.unwrap();
        {
            let mut reply = session.receive();
            assert_eq!(reply.next().await.unwrap().unwrap(), "hel");
        }
        session.send("again").await.unwrap();
        assert_eq!(collect(session.receive()).await.unwrap(), "hello");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_fails_the_stream() {
        let provider = StdioProvider::new(
            "sh",
            ["-c", r#"read -r line; echo '{"type":"error","message":"quota"}'"#],
        );
        let stream = provider.stream(&[]).await.unwrap();
        let err = collect(stream).await.unwrap_err();
        assert_eq!(err.to_string(), "provider error: quota");
    }
}
