//! quire-server binary
//!
//! Runs the retention sweeper over a quire database and offers admin
//! commands for inspecting and maintaining it.
//!
//! ## Usage
//!
//! ```bash
//! quire-server serve                      # sweep until ctrl-c
//! quire-server book add "Field notes"
//! quire-server book list
//! quire-server ls <book-id> --all
//! quire-server history <block-id>
//! quire-server sweep                      # one retention sweep
//! quire-server rebalance <book-id>
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quire_server::{sweeper, ServerConfig, Store};
use quire_types::{now_millis, Block, BlockContent, BlockId, BookId};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Block engine daemon and admin tool for quire.
#[derive(Parser, Debug)]
#[command(name = "quire-server", version)]
struct Args {
    /// Config file (default: the platform config dir's quire/server.toml, if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file; overrides the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the retention sweeper until interrupted
    Serve {
        /// Seconds between sweeps; overrides the config
        #[arg(long)]
        sweep_interval: Option<u64>,

        /// Retention window in days; overrides the config
        #[arg(long)]
        retention_days: Option<u64>,
    },
    /// List the blocks of a book in order
    Ls {
        book: String,

        /// Include soft-deleted blocks
        #[arg(long)]
        all: bool,
    },
    /// Show the version history of a block
    History { block: String },
    /// Purge expired soft-deleted blocks once
    Sweep,
    /// Renumber a book's order keys
    Rebalance { book: String },
    /// Manage books
    #[command(subcommand)]
    Book(BookCommand),
}

#[derive(Subcommand, Debug)]
enum BookCommand {
    /// Create a book and print its id
    Add { title: String },
    /// Mark a book deleted
    Rm { book: String },
    /// List books
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _otel_guard = init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "telemetry")]
fn init_tracing() -> Option<quire_telemetry::OtelGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    if !quire_telemetry::otel_enabled() {
        registry.init();
        return None;
    }
    match quire_telemetry::otel_layer("quire-server") {
        Ok((otel_layer, guard)) => {
            registry.with(otel_layer).init();
            Some(guard)
        }
        Err(e) => {
            registry.init();
            tracing::warn!(error = %e, "OTel export disabled");
            None
        }
    }
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(args: Args) -> Result<()> {
    let mut config = ServerConfig::resolve(args.config.as_deref())?;
    if let Some(database) = args.database {
        config.database = database;
    }

    match args.command {
        Command::Serve {
            sweep_interval,
            retention_days,
        } => {
            if let Some(secs) = sweep_interval {
                config.sweep_interval_secs = secs;
            }
            if let Some(days) = retention_days {
                config.engine.retention_days = days;
            }
            config.validate()?;
            cmd_serve(&config).await
        }
        Command::Ls { book, all } => cmd_ls(&config, &book, all).await,
        Command::History { block } => cmd_history(&config, &block).await,
        Command::Sweep => cmd_sweep(&config).await,
        Command::Rebalance { book } => cmd_rebalance(&config, &book).await,
        Command::Book(BookCommand::Add { title }) => cmd_book_add(&config, &title),
        Command::Book(BookCommand::Rm { book }) => cmd_book_rm(&config, &book),
        Command::Book(BookCommand::List) => cmd_book_list(&config),
    }
}

async fn cmd_serve(config: &ServerConfig) -> Result<()> {
    let store = Store::open(&config.database)?;
    let engine = Arc::new(store.engine(&config.engine)?);
    tracing::info!(
        database = %config.database.display(),
        retention_days = config.engine.retention_days,
        "quire-server running"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(sweeper::run(engine.clone(), config.sweep_interval(), shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    sweeper.await.context("sweeper task panicked")?;
    engine.flush().await;
    Ok(())
}

async fn cmd_ls(config: &ServerConfig, book: &str, all: bool) -> Result<()> {
    let book = parse_book(book)?;
    let store = Store::open(&config.database)?;
    let engine = store.engine(&config.engine)?;
    let blocks = engine.list_all(book, all).await?;
    for block in &blocks {
        println!(
            "{:<10} {:<13} {:<11} {} {}",
            block.order_key,
            block.status.to_string(),
            block.block_type.to_string(),
            block.id,
            preview(block)
        );
    }
    if blocks.is_empty() {
        eprintln!("(no blocks)");
    }
    Ok(())
}

async fn cmd_history(config: &ServerConfig, block: &str) -> Result<()> {
    let id = BlockId::parse(block).with_context(|| format!("invalid block id {block:?}"))?;
    let store = Store::open(&config.database)?;
    let engine = store.engine(&config.engine)?;
    for version in engine.history(id).await? {
        println!(
            "{:>4} {:<16} v{:<4} {:>14} {}",
            version.sequence,
            version.change_type.as_str(),
            version.block_version,
            version.occurred_at,
            version.snapshot.order_key
        );
    }
    Ok(())
}

async fn cmd_sweep(config: &ServerConfig) -> Result<()> {
    let store = Store::open(&config.database)?;
    let engine = store.engine(&config.engine)?;
    let purged = engine.purge_expired().await?;
    engine.flush().await;
    println!("purged {} block(s)", purged.len());
    Ok(())
}

async fn cmd_rebalance(config: &ServerConfig, book: &str) -> Result<()> {
    let book = parse_book(book)?;
    let store = Store::open(&config.database)?;
    let engine = store.engine(&config.engine)?;
    let renumbered = engine.rebalance(book).await?;
    engine.flush().await;
    println!("renumbered {} block(s)", renumbered.len());
    Ok(())
}

fn cmd_book_add(config: &ServerConfig, title: &str) -> Result<()> {
    let store = Store::open(&config.database)?;
    let id = store.books.add(title, now_millis())?;
    println!("{id}");
    Ok(())
}

fn cmd_book_rm(config: &ServerConfig, book: &str) -> Result<()> {
    let book = parse_book(book)?;
    let store = Store::open(&config.database)?;
    if !store.books.mark_deleted(book, now_millis())? {
        bail!("no live book {book}");
    }
    Ok(())
}

fn cmd_book_list(config: &ServerConfig) -> Result<()> {
    let store = Store::open(&config.database)?;
    for record in store.books.list()? {
        let state = if record.deleted_at.is_some() { "deleted" } else { "live" };
        println!("{} {:<7} {}", record.id, state, record.title);
    }
    Ok(())
}

fn parse_book(s: &str) -> Result<BookId> {
    BookId::parse(s).with_context(|| format!("invalid book id {s:?}"))
}

/// One-line summary of a block's content.
fn preview(block: &Block) -> String {
    let text = match &block.content {
        None => return "(purged)".to_string(),
        Some(BlockContent::Markdown { source }) => source.clone(),
        Some(BlockContent::Heading { level, text }) => format!("{} {text}", "#".repeat(*level as usize)),
        Some(BlockContent::Text { text }) | Some(BlockContent::Quote { text, .. }) => text.clone(),
        Some(BlockContent::Code { source, .. }) => source.clone(),
        Some(BlockContent::Image { url, .. }) | Some(BlockContent::Video { url, .. }) => url.clone(),
        Some(BlockContent::TodoList { items }) => format!("{} item(s)", items.len()),
        Some(BlockContent::Checkpoint { title, .. }) => title.clone(),
    };
    let line = text.lines().next().unwrap_or("");
    match line.char_indices().nth(60) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}
