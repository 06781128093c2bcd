mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use runtime::{Conversation, EventSink, Granularity, ToolRegistry};
use storage::{ConversationId, Event, EventKind, EventLog, EventStore, EventType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "skein.toml";

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "Streaming execution engine for tool-using agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat {
        /// Continue a stored conversation (ID prefix match supported)
        #[arg(short, long)]
        resume: Option<String>,
    },
    /// List stored conversations
    Conversations {
        /// Show only the last N conversations
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show the event log of a conversation
    Logs {
        /// Conversation ID (prefix match supported)
        #[arg(short, long)]
        conversation: String,
        /// Filter by event type (user, think, call, result, respond)
        #[arg(short, long)]
        kind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat { resume }) => cmd_chat(&cli.config, resume.as_deref()).await,
        None => cmd_chat(&cli.config, None).await,
        Some(Commands::Conversations { limit }) => cmd_conversations(limit),
        Some(Commands::Logs { conversation, kind }) => cmd_logs(&conversation, kind.as_deref()),
    }
}

async fn cmd_chat(config_path: &Path, resume: Option<&str>) -> Result<()> {
    println!("skein v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_or_default(config_path)?;
    let provider = config.build_provider(std::env::var("ANTHROPIC_API_KEY").ok())?;
    let provider_name = provider.name().to_string();
    let streaming = config.runtime.granularity == Granularity::Token;

    let data_dir = dirs_data_dir().unwrap_or_else(|| ".skein".into());
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("events.db");
    let store = Arc::new(EventStore::open(&db_path)?);
    debug!(path = %db_path.display(), "event store opened");
    println!("Conversation stored at: {}", db_path.display());

    // No tools ship with the binary; embedders register their own.
    let tools = Arc::new(ToolRegistry::new());
    let mut conversation = match resume {
        Some(prefix) => {
            let id = find_conversation(store.as_ref(), prefix)?;
            Conversation::open(id, store, provider, tools, config.runtime)
        }
        None => Conversation::new(store, provider, tools, config.runtime),
    };
    println!("Conversation ID: {}", conversation.id());
    println!("Provider: {provider_name} ({:?} mode)", conversation.mode());
    println!("Type 'quit' or Ctrl+D to exit; Ctrl+C interrupts a running turn.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });

        let mut printer = Printer::new(streaming);
        let result = conversation.turn(input, &mut printer, &cancel).await;
        interrupt.abort();
        if cancel.is_cancelled() {
            info!(conversation = %conversation.id(), "turn interrupted by user");
        }
        printer.break_line();

        match result {
            Ok(outcome) => {
                println!(
                    "\n[{} passes, {} tokens in / {} out]\n",
                    outcome.iterations, outcome.usage.input_tokens, outcome.usage.output_tokens
                );
            }
            Err(e) => {
                eprintln!("Error: {e}\n");
            }
        }
    }

    let id = conversation.id();
    conversation.close().await?;
    println!("\nConversation {id} saved.");
    Ok(())
}

/// Prints turn events as they arrive.
struct Printer {
    /// Text arrives as deltas rather than whole units.
    streaming: bool,
    open: Option<EventType>,
}

impl Printer {
    fn new(streaming: bool) -> Self {
        Self {
            streaming,
            open: None,
        }
    }

    fn text(&mut self, kind: EventType, text: &str) {
        if self.open != Some(kind) {
            self.break_line();
            if kind == EventType::Think {
                print!("(thinking) ");
            }
            self.open = Some(kind);
        }
        print!("{text}");
        if self.streaming {
            let _ = io::stdout().flush();
        } else {
            self.break_line();
        }
    }

    fn break_line(&mut self) {
        if self.open.take().is_some() {
            println!();
        }
    }
}

impl EventSink for Printer {
    fn emit(&mut self, event: &Event) {
        match &event.kind {
            EventKind::Think(text) => self.text(EventType::Think, text),
            EventKind::Respond(text) => self.text(EventType::Respond, text),
            EventKind::Call(call) => {
                self.break_line();
                println!("  -> {} {}", call.name, serde_json::Value::Object(call.args.clone()));
            }
            EventKind::Result(result) => {
                self.break_line();
                let status = if result.is_success() { "ok" } else { "failed" };
                println!(
                    "  <- {} [{status}] {}",
                    result.tool,
                    truncate(&result.content.to_string(), 200)
                );
            }
            EventKind::Error(message) => {
                self.break_line();
                eprintln!("  ! {message}");
            }
            EventKind::Interrupt => {
                self.break_line();
                println!("[interrupted]");
            }
            EventKind::User(_) | EventKind::Execute | EventKind::End | EventKind::Metric(_) => {}
        }
    }
}

fn cmd_conversations(limit: usize) -> Result<()> {
    let store = open_store()?;
    let conversations = store.list_conversations()?;

    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<16}  EVENTS",
        "CONVERSATION ID", "STARTED", "LAST ACTIVE"
    );
    println!("{}", "-".repeat(80));

    for summary in conversations.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&summary.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let last = Local
            .from_utc_datetime(&summary.last_event_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        println!(
            "{:<36}  {:<16}  {:<16}  {}",
            summary.id.to_string(),
            started.to_string(),
            last.to_string(),
            summary.event_count
        );
    }

    Ok(())
}

fn cmd_logs(prefix: &str, kind_filter: Option<&str>) -> Result<()> {
    let kind = kind_filter
        .map(|k| {
            k.parse::<EventType>()
                .map_err(|_| Error::UnknownEventType(k.to_string()))
        })
        .transpose()?;

    let store = open_store()?;
    let id = find_conversation(&store, prefix)?;

    let events = match kind {
        Some(kind) => store.load_kind(id, kind)?,
        None => store.load(id, None)?,
    };

    if events.is_empty() {
        println!("No events found for conversation {id}");
        return Ok(());
    }

    println!("Conversation: {id}\n");

    for event in events {
        print_event(&event);
    }

    Ok(())
}

/// Resolve an ID prefix to exactly one stored conversation.
fn find_conversation(store: &dyn EventLog, prefix: &str) -> Result<ConversationId> {
    let conversations = store.list_conversations()?;
    let matching: Vec<_> = conversations
        .iter()
        .filter(|c| c.id.to_string().starts_with(prefix))
        .collect();

    match matching.as_slice() {
        [] => Err(Error::ConversationNotFound {
            prefix: prefix.to_string(),
        }),
        [only] => Ok(only.id),
        _ => Err(Error::AmbiguousConversation {
            prefix: prefix.to_string(),
            matches: matching.iter().map(|c| c.id.to_string()).collect(),
        }),
    }
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    match &event.kind {
        EventKind::User(text) => println!("[{time}] USER: {}", truncate(text, 200)),
        EventKind::Think(text) => println!("[{time}] THINK: {}", truncate(text, 200)),
        EventKind::Respond(text) => println!("[{time}] RESPOND: {}", truncate(text, 200)),
        EventKind::Call(call) => {
            println!(
                "[{time}] TOOL CALL: {} {}",
                call.name,
                serde_json::Value::Object(call.args.clone())
            );
        }
        EventKind::Result(result) => {
            let status = if result.is_success() { "ok" } else { "failed" };
            println!(
                "[{time}] TOOL RESULT: {} [{status}] {}",
                result.tool,
                truncate(&result.content.to_string(), 200)
            );
        }
        _ => println!("[{time}] {}", event.event_type().as_str().to_uppercase()),
    }
}

/// Cut `text` to `max` characters for display.
fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn open_store() -> Result<EventStore> {
    let data_dir = dirs_data_dir().unwrap_or_else(|| ".skein".into());
    let db_path = data_dir.join("events.db");

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(EventStore::open(&db_path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/skein"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("skein"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("skein"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}
