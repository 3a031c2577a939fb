//! Command-line front end for session-log reductions.
//!
//! Operates on a JSONL session log. Reads the API key from the
//! `OPENROUTER_KEY` environment variable for commands that call a model.
//!
//! # Examples
//!
//! ```sh
//! # Show what a compaction would summarize, without calling a model
//! cinch-context plan session.jsonl
//!
//! # Compact the current branch
//! cinch-context compact session.jsonl --instructions "keep the API design notes"
//!
//! # Move back to an earlier entry, summarizing the branch left behind
//! cinch-context navigate session.jsonl 1a2b3c4d0001 --summarize
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use cinch_context::agent::{
    ExternalHookRunner, LoggingHandler, NavigateOptions, ReductionConfig, ReductionSession,
    SettingsProvider,
};
use cinch_context::api::{OpenRouterTransport, SummaryModel};
use cinch_context::context::prepare_compaction;
use cinch_context::session::{EntryStore, SessionLog};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Compact and summarize agent session logs.
#[derive(Parser)]
#[command(name = "cinch-context")]
struct Cli {
    /// Reduction settings (JSON). Missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override hooks (JSON).
    #[arg(long, global = true)]
    hooks: Option<PathBuf>,

    /// Model for summarization calls, overriding the config.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the compaction plan for the current branch.
    Plan {
        /// Path to the session log.
        session: PathBuf,
    },
    /// Compact the current branch and save the log.
    Compact {
        session: PathBuf,

        /// Extra focus for the summary.
        #[arg(long)]
        instructions: Option<String>,
    },
    /// Move the leaf to another entry and save the log.
    Navigate {
        session: PathBuf,

        /// Entry id to move to.
        target: String,

        /// Summarize the branch being left.
        #[arg(long)]
        summarize: bool,

        /// Extra focus for the branch summary.
        #[arg(long)]
        instructions: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<ReductionConfig, String> {
    let mut config = match &cli.config {
        Some(path) => ReductionConfig::load(path).map_err(|e| e.to_string())?,
        None => ReductionConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    Ok(config)
}

fn api_key() -> Result<String, String> {
    std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())
}

/// A token that fires on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            on_signal.cancel();
        }
    });
    token
}

fn render_plan(log: &SessionLog, config: &ReductionConfig) -> String {
    let branch = log.branch_entries(None);
    let Some(plan) = prepare_compaction(
        &branch,
        &config.compaction_settings(),
        &config.estimator(),
    ) else {
        return "Nothing to compact.".into();
    };

    let (read_only, modified) = plan.file_ops.finalize();
    let mut out = format!(
        "first kept entry:   {}\n\
         split turn:         {}\n\
         records to summarize: {}\n\
         turn prefix records:  {}\n\
         tokens before:      ~{}\n\
         incremental:        {}\n",
        plan.first_kept_entry_id,
        plan.is_split_turn,
        plan.messages_to_summarize.len(),
        plan.turn_prefix_messages.len(),
        plan.tokens_before,
        plan.previous_summary.is_some(),
    );
    for path in &read_only {
        out.push_str(&format!("read:     {path}\n"));
    }
    for path in &modified {
        out.push_str(&format!("modified: {path}\n"));
    }
    out
}

fn build_session(
    cli: &Cli,
    config: ReductionConfig,
    log: SessionLog,
    needs_model: bool,
) -> Result<ReductionSession<SessionLog>, String> {
    let key = if needs_model { api_key()? } else { String::new() };
    let transport = OpenRouterTransport::with_headers(
        "https://crates.io/crates/cinch-context",
        "cinch-context",
    )
    .map_err(|e| format!("failed to create API client: {e}"))?;
    let model = SummaryModel::new(config.model.clone(), key);

    let mut session = ReductionSession::new(log, Arc::new(transport), config, model)
        .with_event_handler(LoggingHandler);
    if let Some(hooks) = &cli.hooks {
        let workdir = std::env::current_dir()
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_else(|_| ".".into());
        session = session.with_hook(ExternalHookRunner::load(hooks, workdir));
    }
    Ok(session)
}

async fn compact(
    session: &ReductionSession<SessionLog>,
    instructions: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Option<String>, String> {
    match session.compact(instructions, cancel).await {
        Ok(outcome) => Ok(Some(format!(
            "Compacted ~{} tokens into entry {} (first kept: {}{})\n",
            outcome.tokens_before,
            outcome.entry_id,
            outcome.first_kept_entry_id,
            if outcome.from_hook { ", from hook" } else { "" },
        ))),
        Err(e) if e.is_expected() => {
            eprintln!("{e}");
            Ok(None)
        }
        Err(e) => Err(e.to_string()),
    }
}

async fn navigate(
    session: &ReductionSession<SessionLog>,
    target: &str,
    options: NavigateOptions,
    cancel: &CancellationToken,
) -> Result<Option<String>, String> {
    match session.navigate_tree(target, options, cancel).await {
        Ok(outcome) => {
            let mut out = format!(
                "Leaf is now {}\n",
                outcome.new_leaf_id.as_deref().unwrap_or("(root)")
            );
            match &outcome.summary_entry_id {
                Some(id) => out.push_str(&format!("Branch summary: {id}\n")),
                // The JSONL log treats its last entry as the leaf.
                None => out.push_str("(no entry appended; the saved log keeps its old leaf)\n"),
            }
            if let Some(text) = &outcome.editor_text {
                out.push_str(&format!("Message to re-edit:\n{text}\n"));
            }
            Ok(Some(out))
        }
        Err(e) if e.is_expected() => {
            eprintln!("{e}");
            Ok(None)
        }
        Err(e) => Err(e.to_string()),
    }
}

async fn run(cli: &Cli) -> Result<String, String> {
    let config = load_config(cli)?;
    let cancel = ctrl_c_token();

    let (session_path, outcome) = match &cli.command {
        Command::Plan { session } => {
            let log = SessionLog::load(session).map_err(|e| e.to_string())?;
            return Ok(render_plan(&log, &config));
        }
        Command::Compact {
            session: path,
            instructions,
        } => {
            let log = SessionLog::load(path).map_err(|e| e.to_string())?;
            let session = build_session(cli, config, log, true)?;
            let message = compact(&session, instructions.as_deref(), &cancel).await?;
            (path, message.map(|m| (m, session)))
        }
        Command::Navigate {
            session: path,
            target,
            summarize,
            instructions,
        } => {
            let log = SessionLog::load(path).map_err(|e| e.to_string())?;
            let session = build_session(cli, config, log, *summarize)?;
            let options = NavigateOptions {
                summarize: *summarize,
                custom_instructions: instructions.clone(),
                allow_empty_summary: false,
            };
            let message = navigate(&session, target, options, &cancel).await?;
            (path, message.map(|m| (m, session)))
        }
    };

    // Expected no-ops leave the log untouched.
    let Some((message, session)) = outcome else {
        return Ok(String::new());
    };
    session
        .into_store()
        .save(session_path)
        .map_err(|e| e.to_string())?;
    Ok(message)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
