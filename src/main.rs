use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod brief;
mod config;
mod db;
mod dropoff;
mod error;
mod insights;
mod models;
mod narrative;
mod ranking;
mod report;
mod scoring;
mod server;
mod store;
mod upsell;

use crate::config::Config;
use crate::db::PgStore;
use crate::narrative::{NarrativeService, OpenAiNarrative};
use crate::store::ActivityStore;

#[derive(Parser)]
#[command(name = "engagement-supervisor")]
#[command(
    about = "Engagement scoring, dropoff detection and executive briefs for the admin dashboard",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo users and activity
    Seed,
    /// Import activity events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Compute and store engagement scores
    Score {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        since_days: Option<i64>,
    },
    /// List users at risk of dropping off
    Dropoff {
        #[arg(long)]
        since_days: Option<i64>,
    },
    /// Show the most engaged users from stored scores
    Top {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print recommendations over stored scores
    Recommend,
    /// Generate an executive brief
    Brief {
        #[arg(long, default_value = "brief.md")]
        out: PathBuf,
        /// Also write the structured brief as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        #[arg(long)]
        since_days: Option<i64>,
    },
    /// Find engaged free and starter users to upsell
    Upsell,
    /// Run the admin HTTP API
    Serve,
}

/// `--limit` falls back to the configured top K; zero is rejected.
fn resolve_limit(limit: Option<usize>, default: usize) -> anyhow::Result<usize> {
    match limit.unwrap_or(default) {
        0 => anyhow::bail!("--limit must be at least 1"),
        limit => Ok(limit),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("engagement_supervisor=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool.clone());
    let narrator: Option<Arc<dyn NarrativeService>> = config
        .narrative
        .clone()
        .map(|nc| Arc::new(OpenAiNarrative::new(nc)) as Arc<dyn NarrativeService>);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = db::seed(&pool).await?;
            println!("Seed data inserted ({inserted} new events).");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} events from {}.", csv.display());
        }
        Commands::Score { user, since_days } => {
            if let Some(days) = since_days {
                config.pipeline.lookback_days = days.max(1);
            }
            let run =
                scoring::run_scoring(&store, &config.pipeline, user.as_deref(), Utc::now())
                    .await?;
            println!("Scored {} users, {} failed.", run.scored, run.failed);
            for error in &run.errors {
                println!("- {}: {}", error.user_id, error.message);
            }
        }
        Commands::Dropoff { since_days } => {
            if let Some(days) = since_days {
                config.pipeline.lookback_days = days.max(1);
            }
            let scan = dropoff::detect_dropoff(&store, &config.pipeline, Utc::now()).await?;
            if scan.signals.is_empty() {
                println!("No users found.");
                return Ok(());
            }
            println!("Users by dropoff risk:");
            for signal in &scan.signals {
                println!("- [{}] {} ({})", signal.risk, signal.email, signal.basis);
            }
            for error in &scan.errors {
                println!("! skipped {}: {}", error.user_id, error.message);
            }
        }
        Commands::Top { limit } => {
            let limit = resolve_limit(limit, config.pipeline.top_k)?;
            let top = ranking::top_engaged(&store, &config.pipeline, limit).await?;
            if top.is_empty() {
                println!("No engagement scores yet. Run `score` first.");
                return Ok(());
            }
            println!("Top users by engagement score:");
            for user in &top {
                println!(
                    "{}. {} ({}) score {:.2}",
                    user.rank, user.email, user.plan, user.score
                );
            }
        }
        Commands::Recommend => {
            let recs = insights::recommend(&store, &config.pipeline, Utc::now()).await?;
            for rec in &recs {
                println!("- [{:?}] {}: {}", rec.severity, rec.message, rec.action);
            }
        }
        Commands::Brief {
            out,
            json,
            since_days,
        } => {
            if let Some(days) = since_days {
                config.pipeline.lookback_days = days.max(1);
            }
            let brief = brief::generate_brief(
                &store as &dyn ActivityStore,
                narrator.as_deref(),
                &config.pipeline,
                Utc::now(),
            )
            .await?;
            std::fs::write(&out, report::render_markdown(&brief))
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Brief written to {}.", out.display());
            if let Some(path) = json {
                std::fs::write(&path, serde_json::to_string_pretty(&brief)?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Structured brief written to {}.", path.display());
            }
            if !brief.errors.is_empty() {
                println!("{} pipeline stages reported errors.", brief.errors.len());
            }
        }
        Commands::Upsell => {
            let candidates = upsell::run_upsell_sweep(&store, &config.pipeline).await?;
            if candidates.is_empty() {
                println!("No upsell candidates.");
                return Ok(());
            }
            println!("Upsell candidates:");
            for c in &candidates {
                println!(
                    "- {} ({} -> {}) score {:.2}",
                    c.email, c.plan, c.suggested_plan, c.score
                );
            }
        }
        Commands::Serve => {
            let state = server::AppState {
                store: Arc::new(store),
                narrator,
                config: Arc::new(config.pipeline.clone()),
            };
            server::serve(state, config.bind_addr).await?;
        }
    }

    Ok(())
}
