//! `persona-cli` – the `persona` binary.
//!
//! Serves exactly one chat request per run:
//!
//! 1. Loads `~/.persona/config.toml` (or `--config <path>`), applying
//!    `PERSONA_*` environment overrides; defaults apply when the file is
//!    absent.
//! 2. Reads one [`ChatInput`] JSON object from stdin.
//! 3. Produces the reply through a [`ChatSession`], racing it against
//!    Ctrl-C / SIGTERM.
//! 4. Writes a [`ChatOutput`][persona_types::ChatOutput] JSON object, or
//!    server-sent events in stream mode, to stdout.
//!
//! Failures print `{"error": "..."}` on stderr and exit non-zero:
//!
//! | Exit | Meaning |
//! |---|---|
//! | 2 | invalid request |
//! | 3 | every model failed |
//! | 4 | fatal backend failure |
//! | 130 | cancelled |
//! | 1 | anything else |

mod config;
mod output;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use persona_memory::{HistoryBackend, InMemoryHistory, MemoryStore, SqliteHistory};
use persona_runtime::{ChatSession, FailoverInvoker, LlmDriver, SessionConfig, Summarizer, telemetry};
use persona_types::{ChatError, ChatInput};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use config::{Config, StorageKind};

const USAGE: &str = "\
Usage: persona [OPTIONS] < request.json

Reads one chat request (JSON) from stdin and writes the reply to stdout.

Options:
  --config <PATH>   Config file (default: ~/.persona/config.toml)
  --init-config     Write a default config file and exit
  --schema          Print the JSON Schema of the request and exit
  -h, --help        Print this help and exit
  -V, --version     Print the version and exit
";

/// Parsed command line.
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    init_config: bool,
    schema: bool,
    help: bool,
    version: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, ChatError> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| ChatError::Input("--config needs a path".into()))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--init-config" => parsed.init_config = true,
            "--schema" => parsed.schema = true,
            "-h" | "--help" => parsed.help = true,
            "-V" | "--version" => parsed.version = true,
            other => match other.strip_prefix("--config=") {
                Some(path) if !path.is_empty() => parsed.config = Some(PathBuf::from(path)),
                _ => return Err(ChatError::Input(format!("unknown argument: {other}"))),
            },
        }
    }
    Ok(parsed)
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", output::error_payload(&e));
            eprint!("{USAGE}");
            return exit_code(&e);
        }
    };
    if args.help {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    if args.version {
        println!("persona {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    if args.schema {
        return print_schema();
    }
    let config_path = args.config.unwrap_or_else(config::config_path);
    if args.init_config {
        return init_config(&config_path);
    }

    // Tracing first: the OTLP exporter must not need a running runtime.
    let guard = telemetry::init_tracing("persona");
    let code = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(serve(&config_path)),
        Err(e) => fail(&ChatError::Config(format!("cannot start runtime: {e}")), false),
    };
    drop(guard);
    code
}

// ─────────────────────────────────────────────────────────────────────────────
// One request
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(config_path: &Path) -> ExitCode {
    let loaded = async {
        let cfg = config::load_or_default(config_path)?;
        cfg.validate()?;
        let input = read_input().await?;
        Ok::<_, ChatError>((cfg, input))
    }
    .await;
    let (cfg, input) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => return fail(&e, false),
    };

    let stream = input.stream.unwrap_or(cfg.stream);
    let session = build_session(&cfg, input.token.as_deref());
    info!(key = %input.conversation_key(), stream, "serving request");

    let outcome = tokio::select! {
        result = reply(&session, &input, stream) => result,
        () = shutdown_signal() => {
            warn!("interrupted before the reply completed; nothing persisted");
            Err(ChatError::Cancelled)
        }
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e, stream),
    }
}

async fn reply(session: &ChatSession, input: &ChatInput, stream: bool) -> Result<(), ChatError> {
    let stdout = io::stdout();
    if stream {
        let output = session
            .respond_streaming(input, |chunk| output::write_delta(&mut stdout.lock(), chunk))
            .await?;
        output::write_metadata(&mut stdout.lock(), &output).map_err(stdout_gone)?;
    } else {
        let output = session.respond(input).await?;
        output::write_output(&mut stdout.lock(), &output).map_err(stdout_gone)?;
    }
    Ok(())
}

async fn read_input() -> Result<ChatInput, ChatError> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .map_err(|e| ChatError::Input(format!("cannot read stdin: {e}")))?;
    parse_input(&raw)
}

fn parse_input(raw: &str) -> Result<ChatInput, ChatError> {
    if raw.trim().is_empty() {
        return Err(ChatError::Input("empty request".into()));
    }
    let input: ChatInput = serde_json::from_str(raw)
        .map_err(|e| ChatError::Input(format!("invalid request JSON: {e}")))?;
    input.validate()?;
    Ok(input)
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

/// Assemble the session for one request.  A request `token` replaces both
/// configured keys; the summary key falls back to the chat key.
fn build_session(cfg: &Config, token: Option<&str>) -> ChatSession {
    let token = token.map(str::trim).filter(|t| !t.is_empty());
    let chat_key = token.or(cfg.chat_api_key.expose()).map(str::to_string);
    let summary_key = token
        .or(cfg.summary_api_key.expose())
        .or(cfg.chat_api_key.expose())
        .map(str::to_string);
    let attempt_timeout = Duration::from_secs(cfg.attempt_timeout_secs.max(1));

    let replies = FailoverInvoker::new(
        Arc::new(LlmDriver::new(&cfg.api_base_url, chat_key)),
        cfg.models.clone(),
    )
    .with_policy(cfg.failure_policy)
    .with_attempt_timeout(attempt_timeout);
    let summaries = FailoverInvoker::new(
        Arc::new(LlmDriver::new(&cfg.api_base_url, summary_key)),
        cfg.summary_models(),
    )
    .with_policy(cfg.failure_policy)
    .with_attempt_timeout(attempt_timeout);

    let memory = MemoryStore::new(open_history(cfg), cfg.capacity)
        .with_recall_window(cfg.recall_window)
        .with_triggers(cfg.triggers.clone());
    let summarizer =
        Summarizer::new(Arc::new(summaries)).with_limits(cfg.summary_max_turns, cfg.summary_max_chars);
    let session_cfg = SessionConfig {
        history_limit: cfg.capacity,
        relevant_limit: cfg.relevant_limit,
        similarity_threshold: cfg.similarity_threshold,
        ..SessionConfig::default()
    };

    ChatSession::new(Arc::new(memory), Arc::new(replies), summarizer, session_cfg)
}

/// Open the configured history store, falling back to an in-memory one.
fn open_history(cfg: &Config) -> Arc<dyn HistoryBackend> {
    match cfg.storage {
        StorageKind::Memory => Arc::new(InMemoryHistory::new()),
        StorageKind::Sqlite => {
            let path = cfg.db_path_for_home(&config::home_dir());
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                warn!(path = %parent.display(), error = %e, "cannot create history directory");
            }
            match SqliteHistory::open(&path) {
                Ok(history) => Arc::new(history),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "cannot open history database; history will not outlive this run"
                    );
                    Arc::new(InMemoryHistory::new())
                }
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_schema() -> ExitCode {
    let schema = schemars::schema_for!(ChatInput);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => fail(&ChatError::Config(format!("cannot render schema: {e}")), false),
    }
}

fn init_config(path: &Path) -> ExitCode {
    if path.exists() {
        eprintln!("Config already exists at {}", path.display());
        return ExitCode::SUCCESS;
    }
    match config::save_to(&Config::default(), path) {
        Ok(()) => {
            println!("Config written to {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e, false),
    }
}

fn stdout_gone(e: io::Error) -> ChatError {
    warn!(error = %e, "stdout closed before the reply was written");
    ChatError::Cancelled
}

/// Report `err` on stderr (and as an `event: error` frame in stream mode).
fn fail(err: &ChatError, stream: bool) -> ExitCode {
    error!(error = %err, code = err.exit_code(), "request failed");
    if stream {
        let _ = output::write_error_event(&mut io::stdout().lock(), err);
    }
    eprintln!("{}", output::error_payload(err));
    exit_code(err)
}

fn exit_code(err: &ChatError) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}
