//! # localmind CLI
//!
//! Front end for the localmind library: manage indexed resources, query
//! the index, and chat with a local model grounded in those resources.
//!
//! ## Usage
//!
//! ```bash
//! localmind --config ./config/localmind.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `localmind index [<locator>...]` | Add files, folders or URLs and re-index everything |
//! | `localmind resources` | List indexed resources |
//! | `localmind remove <id>` | Remove a resource and its chunks |
//! | `localmind search "<query>"` | Semantic search over indexed chunks |
//! | `localmind chat ["<message>"]` | One grounded turn, or an interactive session |
//! | `localmind health` | Probe the model server's readiness |
//!
//! Streamed answers go to stdout; logs, progress and metrics go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use localmind::config::{self, Config};
use localmind::error::InferenceError;
use localmind::extract::{FsExtractor, TextExtractor};
use localmind::models::Source;
use localmind::progress::ProgressMode;
use localmind::session::{AppContext, ChatOptions, ChatSession, SessionEvent, TurnOutcome};
use localmind::tools::{DataType, FnTool, ToolParameter};

/// localmind: local LLM chat grounded in your own documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "localmind",
    about = "localmind: local LLM chat grounded in your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/localmind.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add resources and re-index.
    ///
    /// Each locator is a file, a folder, or an http(s) URL. With no
    /// locators, every existing resource is re-scanned; files that were
    /// moved or deleted are dropped.
    Index {
        locators: Vec<String>,

        /// Progress output: `human`, `json`, or `off`. Defaults to human
        /// when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// List indexed resources.
    Resources,

    /// Remove a resource by id.
    Remove { id: String },

    /// Semantic search over indexed chunks.
    Search {
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Chat with the local model.
    ///
    /// With a message, runs one turn and exits. Without one, reads turns
    /// from stdin until EOF. Ctrl-C stops the current answer.
    Chat {
        message: Option<String>,

        /// Include web search results.
        #[arg(long)]
        web: bool,

        /// Do not merge neighbouring chunks into retrieved sources.
        #[arg(long)]
        no_context: bool,

        /// Attach a file or URL to every turn.
        #[arg(long = "attach")]
        attachments: Vec<String>,

        /// Offer the built-in tools to the model.
        #[arg(long)]
        tools: bool,
    },

    /// Probe the model server's health endpoint.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localmind=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut cfg = load_cli_config(&cli.config)?;

    match cli.command {
        Commands::Index { locators, progress } => {
            let ctx = AppContext::new(cfg)?;
            run_index(&ctx, &locators, progress.as_deref()).await?;
        }
        Commands::Resources => {
            let ctx = AppContext::new(cfg)?;
            let resources = ctx.resources().await;
            if resources.is_empty() {
                println!("No resources. Add some with `localmind index <path-or-url>`.");
            }
            for r in resources {
                println!(
                    "{}  {:<6}  {}  ({})",
                    r.id,
                    format!("{:?}", r.kind).to_lowercase(),
                    r.name,
                    r.locator
                );
            }
        }
        Commands::Remove { id } => {
            let ctx = AppContext::new(cfg)?;
            match ctx.remove_resource(&id).await? {
                Some(r) => println!("Removed {}", r.name),
                None => anyhow::bail!("No resource with id {}", id),
            }
        }
        Commands::Search { query, limit } => {
            let ctx = AppContext::new(cfg)?;
            let hits = ctx.index_snapshot().search(&query, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {}#{}",
                    i + 1,
                    hit.score,
                    hit.item.source,
                    hit.item.sequence
                );
                println!("   {}", snippet(&hit.item.text, 200));
            }
        }
        Commands::Chat {
            message,
            web,
            no_context,
            attachments,
            tools,
        } => {
            if no_context {
                cfg.retrieval.use_context = false;
            }
            let mut ctx = AppContext::new(cfg)?;
            if tools {
                register_builtin_tools(&mut ctx);
            }
            let ctx = Arc::new(ctx);
            let options = ChatOptions {
                use_web: web,
                attachments: load_attachments(&ctx, &attachments).await?,
            };
            let result = run_chat(Arc::clone(&ctx), message, &options).await;
            ctx.server.stop().await;
            if !result? {
                std::process::exit(1);
            }
        }
        Commands::Health => {
            let ctx = AppContext::new(cfg)?;
            let score = ctx.server.health_score().await;
            println!("{}  health {:.2}", ctx.server.base_url(), score);
        }
    }

    Ok(())
}

fn load_cli_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return config::load_config(path);
    }
    tracing::debug!(path = %path.display(), "config file not found, using defaults");
    let cfg = Config::default();
    config::validate(&cfg)?;
    Ok(cfg)
}

async fn run_index(ctx: &AppContext, locators: &[String], progress: Option<&str>) -> anyhow::Result<()> {
    let mode = match progress {
        None => ProgressMode::default_for_tty(),
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some("off") => ProgressMode::Off,
        Some(other) => anyhow::bail!("Unknown progress mode '{}'. Use human, json, or off.", other),
    };
    let reporter = mode.reporter();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    let report = if locators.is_empty() {
        ctx.reindex(reporter.as_ref(), &cancel).await?
    } else {
        ctx.add_resources(locators, reporter.as_ref(), &cancel).await?
    };

    if report.cancelled {
        println!("Indexing cancelled; the previous index is unchanged.");
        return Ok(());
    }

    println!("Index complete");
    println!("  resources:      {}", report.resources.len());
    println!("  chunks embedded: {}", report.chunks_embedded);
    println!("  chunks reused:   {}", report.chunks_reused);
    if let Some(notice) = &report.notice {
        println!("  {}", notice);
    }
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.name, failure.error);
    }
    Ok(())
}

async fn load_attachments(ctx: &AppContext, locators: &[String]) -> anyhow::Result<Vec<Source>> {
    if locators.is_empty() {
        return Ok(Vec::new());
    }
    let extractor = FsExtractor::new(Duration::from_secs(ctx.config.model.request_timeout_secs))?;
    let mut sources = Vec::with_capacity(locators.len());
    for locator in locators {
        let text = extractor
            .extract_text(locator)
            .await
            .with_context(|| format!("Failed to read attachment {}", locator))?;
        sources.push(Source::new(text, locator.clone()));
    }
    Ok(sources)
}

fn register_builtin_tools(ctx: &mut AppContext) {
    ctx.register_tool(Box::new(FnTool::new(
        "current_datetime",
        "Current date and time, local or UTC",
        vec![ToolParameter::optional(
            "utc",
            "Return UTC instead of local time",
            DataType::Boolean,
        )],
        |args| {
            let utc = args.get("utc").and_then(|v| v.as_bool()).unwrap_or(false);
            let now = if utc {
                chrono::Utc::now().to_rfc3339()
            } else {
                chrono::Local::now().to_rfc3339()
            };
            Ok(serde_json::json!({ "datetime": now }))
        },
    )));
}

/// Returns `false` when a one-shot turn failed.
async fn run_chat(ctx: Arc<AppContext>, message: Option<String>, options: &ChatOptions) -> anyhow::Result<bool> {
    let server = Arc::clone(&ctx.server);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            server.interrupt();
        }
    });

    let mut session = ChatSession::new(ctx);

    if let Some(message) = message {
        return Ok(chat_turn(&mut session, &message, options).await);
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            chat_turn(&mut session, line, options).await;
        }
        eprint!("> ");
    }
    eprintln!();
    Ok(true)
}

/// Run one turn, printing as it streams. Returns `false` on a fatal error.
async fn chat_turn(session: &mut ChatSession, message: &str, options: &ChatOptions) -> bool {
    let mut on_event = |event: SessionEvent| match event {
        SessionEvent::Fragment(text) => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
        SessionEvent::Retrying(e) => eprintln!("\n[{}; retrying]", e.description()),
        SessionEvent::ToolCalls { requested, valid } => {
            eprintln!("\n[tools: {} of {} calls executed]", valid, requested)
        }
        SessionEvent::Correction { malformed, .. } => {
            eprintln!("[asking the model to fix {} tool call(s)]", malformed)
        }
    };

    match session.send(message, options, &mut on_event).await {
        Ok(outcome) => {
            println!();
            print_outcome(&outcome);
            true
        }
        Err(InferenceError::Cancelled) => {
            println!();
            eprintln!("[stopped]");
            true
        }
        Err(e) => {
            eprintln!("\nerror: {}", e.description());
            eprintln!("{}", e.recovery_suggestion());
            tracing::debug!(error = %e, "turn failed");
            false
        }
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    if !outcome.citations.is_empty() {
        eprintln!("cited: {}", outcome.citations.join(", "));
    }
    let m = &outcome.reply.metrics;
    let mut parts = vec![format!("{} source(s) offered", outcome.sources.len())];
    if let Some(tps) = m.tokens_per_second {
        parts.push(format!("{:.1} tok/s", tps));
    }
    if let Some(ms) = m.response_start_ms {
        parts.push(format!("first token {} ms", ms));
    }
    eprintln!("[{}]", parts.join(", "));
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
