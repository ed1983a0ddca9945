use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use feedsync::config::Config;
use feedsync::dedup::DedupRegistry;
use feedsync::storage::{Database, DatabaseError, NewFeed};
use feedsync::worker::spool::read_entries;
use feedsync::worker::{SpoolSource, WorkerPool, WorkerSettings};

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Feed synchronization core: scheduling, reconciliation and dedup")]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "feedsync.toml")]
    config: PathBuf,

    /// Database file (overrides `database_path` from the config)
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe a user to a feed
    AddFeed {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        url: String,
        #[arg(long)]
        category: Option<i64>,
        #[arg(long, default_value = "")]
        title: String,
    },

    /// List feeds due for polling
    Jobs {
        #[command(flatten)]
        filter: FilterArgs,
        /// Stop selecting feeds with this many parsing errors (0 = no limit)
        #[arg(long)]
        error_limit: Option<i64>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Include feeds that are not due yet
        #[arg(long)]
        all: bool,
    },

    /// Clear error state and make matching feeds due now
    Reset {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Refresh one feed from a JSON file of parsed entries
    Import {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        feed: i64,
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        update_existing: bool,
    },

    /// Poll due feeds from a spool directory until Ctrl-C
    Daemon {
        #[arg(long, value_name = "DIR")]
        spool: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct FilterArgs {
    #[arg(long)]
    user: Option<i64>,
    #[arg(long)]
    category: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config: {}", args.config.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log_level in config")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::debug!(?config, "Configuration");

    let db_path = args.database.as_deref().unwrap_or(&config.database_path);
    let db = match Database::open(db_path).await {
        Ok(db) => db.with_bulk_threshold(config.bulk_insert_threshold),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another process appears to hold {db_path} locked. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::AddFeed {
            user,
            url,
            category,
            title,
        } => {
            let id = db
                .create_feed(&NewFeed {
                    user_id: user,
                    feed_url: url,
                    title,
                    category_id: category,
                })
                .await
                .context("Failed to add feed")?;
            println!("{id}");
        }

        Command::Jobs {
            filter,
            error_limit,
            batch_size,
            all,
        } => {
            let mut builder = db
                .new_batch_builder()
                .without_disabled_feeds()
                .with_error_limit(error_limit.unwrap_or(config.polling_error_limit))
                .with_batch_size(batch_size.unwrap_or(config.batch_size));
            if let Some(user) = filter.user {
                builder = builder.with_user_id(user);
            }
            if let Some(category) = filter.category {
                builder = builder.with_category_id(category);
            }
            if !all {
                builder = builder.with_next_check_expired();
            }

            let jobs = builder.fetch_jobs().await.context("Failed to fetch jobs")?;
            for job in jobs {
                println!("{}\t{}\t{}", job.feed_id, job.user_id, job.feed_url);
            }
        }

        Command::Reset { filter } => {
            let mut builder = db.new_batch_builder();
            if let Some(user) = filter.user {
                builder = builder.with_user_id(user);
            }
            if let Some(category) = filter.category {
                builder = builder.with_category_id(category);
            }
            let count = builder
                .reset_next_check_at()
                .await
                .context("Failed to reset feeds")?;
            println!("{count} feeds reset");
        }

        Command::Import {
            user,
            feed,
            file,
            update_existing,
        } => {
            let parsed = read_entries(&file)
                .await
                .with_context(|| format!("Failed to read entries: {}", file.display()))?;
            let now = chrono::Utc::now();
            let entries = parsed.into_iter().map(|p| p.into_entry(now)).collect();

            // A one-shot import has no other refreshes to dedup against in
            // memory; the reconciler seeds the registry from stored rows.
            let dedup = DedupRegistry::with_capacity_per_user(config.dedup_capacity_per_user);
            let refreshed = db
                .refresh_feed_entries(&dedup, user, feed, entries, update_existing)
                .await
                .context("Failed to import entries")?;
            println!(
                "created={} updated={} deduplicated={}",
                refreshed.created_count(),
                refreshed.updated_count(),
                refreshed.deduplicated
            );
        }

        Command::Daemon { spool } => {
            let dedup = Arc::new(DedupRegistry::with_capacity_per_user(
                config.dedup_capacity_per_user,
            ));
            let pool = WorkerPool::new(
                db,
                SpoolSource::new(spool),
                dedup.clone(),
                WorkerSettings::from(&config),
            );

            pool.run_forever(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            })
            .await;

            tracing::info!(
                users = dedup.users(),
                deduplicated = dedup.total_deduplicated(),
                "Daemon stopped"
            );
        }
    }

    Ok(())
}
