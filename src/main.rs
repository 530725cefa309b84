//! webcrawler command-line interface

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use webcrawler::config::{default_config_toml, Config};
use webcrawler::session::{CrawlEngine, QueueRecovery};
use webcrawler::storage::CrawlStore;

#[derive(Parser)]
#[command(name = "webcrawler")]
#[command(about = "Polite, concurrent, breadth-first web crawler")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "crawler.toml")]
    config: PathBuf,

    /// Verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a crawl from the given seed URLs
    Crawl {
        /// Seed URLs
        #[arg(required = true)]
        seeds: Vec<String>,

        /// Session name
        #[arg(short, long, default_value = "default")]
        name: String,

        /// Resume a durable session by id
        #[arg(long)]
        session: Option<Uuid>,

        /// Override crawler.max_depth
        #[arg(long)]
        max_depth: Option<u32>,

        /// Override crawler.max_pages
        #[arg(long)]
        max_pages: Option<u64>,

        /// Override crawler.concurrent_workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Write a commented default configuration file
    Init {
        /// Output path
        #[arg(default_value = "crawler.toml")]
        path: PathBuf,
    },

    /// Run one recovery pass against a session's durable queue
    Recover {
        /// Session id
        session: Uuid,
    },

    /// List recent crawl sessions
    Sessions {
        /// Maximum rows
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("webcrawler={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Config::from_env()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Crawl {
            seeds,
            name,
            session,
            max_depth,
            max_pages,
            workers,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(depth) = max_depth {
                config.crawler.max_depth = depth;
            }
            if let Some(pages) = max_pages {
                config.crawler.max_pages = pages;
            }
            if let Some(n) = workers {
                config.crawler.concurrent_workers = n;
            }
            config.validate()?;

            let engine = CrawlEngine::new(config, &name, session).await?;
            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight pages");
                    cancel.cancel();
                }
            });

            let summary = engine.run(seeds).await?;
            println!(
                "session {} {}: {} pages, {} failed, {} skipped, {} words, {} bytes in {:.1}s",
                summary.session_id,
                summary.state.as_str(),
                summary.pages_crawled,
                summary.pages_failed,
                summary.pages_skipped,
                summary.total_words,
                summary.total_bytes,
                summary.elapsed.as_secs_f64()
            );
        }

        Commands::Init { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            std::fs::write(&path, default_config_toml())
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }

        Commands::Recover { session } => {
            let config = load_config(&cli.config)?;
            let store = CrawlStore::connect(&config.database).await?;
            store.ensure_schema().await?;
            let recovery = QueueRecovery::new(
                store.pool().clone(),
                session,
                config.crawler.max_retries,
                config.queue.retention(),
            );
            let report = recovery.run_once().await?;
            info!(
                reclaimed = report.reclaimed,
                exhausted = report.exhausted,
                purged = report.purged,
                "recovery pass complete"
            );
            for (status, count) in &report.status_counts {
                println!("{:>10}  {}", status, count);
            }
            if let Some(age) = report.oldest_pending {
                println!("oldest pending: {}", format_age(age));
            }
            if let Some(age) = report.oldest_in_flight {
                println!("oldest in-flight: {}", format_age(age));
            }
        }

        Commands::Sessions { limit } => {
            let config = load_config(&cli.config)?;
            let store = CrawlStore::connect(&config.database).await?;
            store.ensure_schema().await?;
            let sessions = store.list_sessions(limit).await?;
            if sessions.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            println!(
                "{:<36}  {:<20}  {:<9}  {:>7}  {:>7}  {:>9}",
                "id", "name", "state", "pages", "errors", "words"
            );
            for s in sessions {
                println!(
                    "{:<36}  {:<20}  {:<9}  {:>7}  {:>7}  {:>9}",
                    s.id,
                    truncate(&s.name, 20),
                    s.state,
                    s.pages_crawled,
                    s.error_count,
                    s.total_words
                );
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 120 {
        format!("{}s", secs)
    } else if secs < 7200 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}
