use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use deckster::builder::{BuilderError, BuilderEvent, BuilderSession};
use deckster::cache::{CacheStore, MemoryStore};
use deckster::config::{Config, SyncTuning};
use deckster::reconcile::{DisplayBody, DisplayMessage, DisplayUnit, MessageReconciler};
use deckster::session::api::{CreateSessionRequest, SessionApi, SessionApiError};
use deckster::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use deckster::transport::{ConnectionState, SessionIdentity};
use director_proto::FrameBody;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    let config = Config::new(cli.director_url, cli.api_url);

    match cli.command {
        Some(Command::Connect(args)) => handle_connect(&config, args).await,
        Some(Command::Resume(args)) => handle_resume(&config, args).await,
        Some(Command::Delete(args)) => handle_delete(&config, args).await,
        None => handle_connect(&config, ConnectArgs::default()).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "deckster",
    about = "🎬 Drive a Deckster builder session against the Director service",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "DECKSTER_API_URL",
        default_value = "http://127.0.0.1:8700",
        help = "Base URL for the session store"
    )]
    api_url: String,

    #[arg(
        long,
        global = true,
        env = "DECKSTER_DIRECTOR_URL",
        default_value = "ws://127.0.0.1:8700/ws",
        help = "Director WebSocket endpoint"
    )]
    director_url: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        env = "DECKSTER_LOG_LEVEL",
        default_value = "warn",
        value_parser = parse_log_level,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "DECKSTER_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

fn parse_log_level(raw: &str) -> Result<LogLevel, String> {
    raw.parse()
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start or resume a live builder session (default when no subcommand given)
    Connect(ConnectArgs),
    /// Print the reconciled transcript of a persisted session
    Resume(ResumeArgs),
    /// Soft-delete a session
    Delete(DeleteArgs),
}

#[derive(Args, Debug, Default)]
struct ConnectArgs {
    #[arg(
        value_name = "SESSION",
        help = "Existing session id (a new session is created when omitted)"
    )]
    session: Option<String>,

    #[arg(
        long,
        env = "DECKSTER_USER_ID",
        help = "User id for the connection (generated when omitted)"
    )]
    user: Option<String>,

    #[arg(long, help = "Title for the session")]
    title: Option<String>,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[arg(value_name = "SESSION", help = "Session id to load")]
    session: String,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    #[arg(value_name = "SESSION", help = "Session id to soft-delete")]
    session: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("{0}")]
    Api(#[from] SessionApiError),
    #[error("{0}")]
    Builder(#[from] BuilderError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

async fn handle_connect(config: &Config, args: ConnectArgs) -> Result<(), CliError> {
    let api = SessionApi::new(&config.api_url)?;
    let user_id = args
        .user
        .unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));

    let session_id = match &args.session {
        Some(id) => id.clone(),
        None => {
            let record = api
                .create_session(&CreateSessionRequest {
                    user_id: user_id.clone(),
                    title: args.title.clone(),
                })
                .await?;
            record.session_id
        }
    };

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let (builder, mut events) = BuilderSession::new(
        &config.director_url,
        SyncTuning::default(),
        store,
        api.clone(),
        SessionIdentity {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
        },
    )?;

    match builder.open().await {
        Ok(()) => {}
        Err(BuilderError::SessionDeleted) => {
            println!("session {session_id} was deleted; start a new one with `deckster connect`");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }
    if let Some(title) = &args.title {
        if let Err(err) = builder.set_title(title).await {
            debug!(error = %err, "title update failed");
        }
    }

    println!("session {session_id}");
    println!("type a message and press enter; /quit to exit");

    let runner = builder.clone();
    let pump = tokio::spawn(async move { runner.run().await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if render_event(&builder, event, &mut printed) {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if text == "/quit" {
                        break;
                    }
                    builder.send_user_message(text, None).await;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    pump.abort();
    builder.shutdown().await;
    Ok(())
}

/// Returns `true` when the session loop should end.
fn render_event(builder: &BuilderSession, event: BuilderEvent, printed: &mut HashSet<String>) -> bool {
    match event {
        BuilderEvent::Connection(state) => {
            match state {
                ConnectionState::Connected => println!("· connected"),
                ConnectionState::Reconnecting => println!("· reconnecting…"),
                ConnectionState::Disconnected => println!("· disconnected"),
                ConnectionState::Connecting | ConnectionState::Failed => {}
            }
            false
        }
        BuilderEvent::ConnectionLost => {
            println!("· connection lost after repeated retries; run `deckster connect {}` to pick the session back up", builder.session_id());
            true
        }
        BuilderEvent::TranscriptUpdated => {
            for message in builder.reconciled() {
                if printed.insert(message.id.clone()) {
                    print_message(&message);
                }
            }
            false
        }
        BuilderEvent::StatusChanged => {
            if let Some(note) = builder.status() {
                if let Some(text) = note.text {
                    println!("… {text}");
                }
            }
            false
        }
        BuilderEvent::PreviewReady { url } => {
            println!("· preview ready → {url}");
            false
        }
        BuilderEvent::PresentationReady { url } => {
            println!("· presentation ready → {url}");
            false
        }
        BuilderEvent::StageChanged(_) => false,
        BuilderEvent::PersistenceError(error) => {
            debug!(%error, "persistence flush failed; will retry");
            false
        }
    }
}

fn print_message(message: &DisplayMessage) {
    match &message.body {
        DisplayBody::User { text } => println!("you › {text}"),
        DisplayBody::Agent(FrameBody::ChatMessage(chat)) => {
            println!("director › {}", chat.text);
        }
        DisplayBody::Agent(FrameBody::ActionRequest(action)) => {
            println!("director › {}", action.prompt_text);
            for option in &action.actions {
                println!("    [{}] {}", option.value, option.label);
            }
        }
        DisplayBody::Agent(FrameBody::SlideUpdate(_)) => {
            println!("director › slide structure updated");
        }
        DisplayBody::Agent(FrameBody::PresentationUrl(payload)) => {
            println!("director › presentation ready → {}", payload.url);
        }
        DisplayBody::Agent(FrameBody::StatusUpdate(_)) => {}
    }
}

fn print_unit(unit: &DisplayUnit) {
    match unit {
        DisplayUnit::Single(message) => print_message(message),
        DisplayUnit::Combined {
            slide,
            presentation,
            action,
        } => {
            print_message(slide);
            print_message(presentation);
            if let Some(action) = action {
                print_message(action);
            }
        }
    }
}

async fn handle_resume(config: &Config, args: ResumeArgs) -> Result<(), CliError> {
    let api = SessionApi::new(&config.api_url)?;
    match api.fetch_session(&args.session).await {
        Ok(record) => {
            if let Some(title) = &record.title {
                println!("{title}");
            }
            let mut reconciler = MessageReconciler::new();
            let reconciled = reconciler.reconcile(&record.user_history(), &record.history());
            for unit in MessageReconciler::group(&reconciled) {
                print_unit(&unit);
            }
            Ok(())
        }
        Err(SessionApiError::Gone) => {
            println!(
                "session {} was deleted; start a new one with `deckster connect`",
                args.session
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn handle_delete(config: &Config, args: DeleteArgs) -> Result<(), CliError> {
    let api = SessionApi::new(&config.api_url)?;
    api.soft_delete(&args.session).await?;
    println!("session {} deleted", args.session);
    Ok(())
}
