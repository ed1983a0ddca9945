//! Bounded worker pool driving scheduled refreshes.
//!
//! Each scheduler pass takes the due jobs, fetches every feed through a
//! [`FeedSource`], hands the entries to the reconciler and records the attempt
//! on the feed. At most `workers` feeds are in flight at once and a feed never
//! appears twice in one pass.

pub mod spool;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::dedup::DedupFilter;
use crate::feed::ParsedEntry;
use crate::storage::{next_check_after, Database, DatabaseError, FeedRefreshed, Job};

pub use spool::SpoolSource;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while obtaining a feed's parsed entries.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read feed source: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid entries in feed source: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Why a single job failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

// ============================================================================
// Feed Source
// ============================================================================

/// Provider of already-parsed entries for a job.
pub trait FeedSource: Send + Sync {
    fn fetch(&self, job: &Job) -> impl Future<Output = Result<Vec<ParsedEntry>, SourceError>> + Send;
}

// ============================================================================
// Worker Pool
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Feeds refreshed concurrently
    pub workers: usize,
    /// Delay until the next poll of a feed, after success or failure
    pub check_interval: Duration,
    /// Time between scheduler passes
    pub polling_frequency: Duration,
    pub update_existing: bool,
    pub batch_size: usize,
    pub error_limit: i64,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers(),
            check_interval: config.check_interval(),
            polling_frequency: config.polling_frequency(),
            update_existing: config.update_existing_entries,
            batch_size: config.batch_size,
            error_limit: config.polling_error_limit,
        }
    }
}

/// Result of one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: Result<FeedRefreshed, JobError>,
}

pub struct WorkerPool<S> {
    db: Database,
    source: S,
    dedup: Arc<dyn DedupFilter>,
    settings: WorkerSettings,
}

impl<S: FeedSource> WorkerPool<S> {
    pub fn new(db: Database, source: S, dedup: Arc<dyn DedupFilter>, settings: WorkerSettings) -> Self {
        Self {
            db,
            source,
            dedup,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run `jobs` with bounded concurrency. Outcomes arrive in completion order.
    ///
    /// Later jobs for a feed already in the batch are skipped so the same feed
    /// is never refreshed twice at once.
    pub async fn run_batch(&self, jobs: Vec<Job>) -> Vec<JobOutcome> {
        let total = jobs.len();
        let mut seen = HashSet::with_capacity(total);
        let jobs: Vec<Job> = jobs.into_iter().filter(|j| seen.insert(j.feed_id)).collect();
        if jobs.len() < total {
            tracing::debug!(skipped = total - jobs.len(), "Skipped duplicate jobs for the same feed");
        }

        stream::iter(jobs)
            .map(|job| async move {
                let result = self.run_job(&job).await;
                JobOutcome { job, result }
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await
    }

    /// One scheduler pass over enabled, due feeds below the error limit.
    pub async fn refresh_due(
        &self,
        batch_size: usize,
        error_limit: i64,
    ) -> Result<Vec<JobOutcome>, DatabaseError> {
        let jobs = self
            .db
            .new_batch_builder()
            .without_disabled_feeds()
            .with_error_limit(error_limit)
            .with_next_check_expired()
            .with_batch_size(batch_size)
            .fetch_jobs()
            .await?;

        if jobs.is_empty() {
            tracing::debug!("No feeds due for refresh");
            return Ok(Vec::new());
        }

        let outcomes = self.run_batch(jobs).await;
        log_summary(&outcomes);
        Ok(outcomes)
    }

    /// Repeat scheduler passes every polling period until `shutdown` resolves.
    ///
    /// A pass still running at shutdown is dropped; its open transactions roll back.
    pub async fn run_forever(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.settings.polling_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            workers = self.settings.workers,
            every_secs = self.settings.polling_frequency.as_secs(),
            "Scheduler started"
        );

        loop {
            let pass = async {
                ticker.tick().await;
                if let Err(e) = self
                    .refresh_due(self.settings.batch_size, self.settings.error_limit)
                    .await
                {
                    tracing::warn!(error = %e, "Scheduler pass failed");
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = pass => {}
            }
        }
    }

    async fn run_job(&self, job: &Job) -> Result<FeedRefreshed, JobError> {
        let checked_at = Utc::now();
        let next_check_at = next_check_after(checked_at, self.settings.check_interval);
        let result = self.refresh_job(job, checked_at).await;

        match &result {
            Ok(_) => {
                if let Err(e) = self
                    .db
                    .record_refresh_success(job.feed_id, checked_at, next_check_at)
                    .await
                {
                    tracing::warn!(feed_id = job.feed_id, error = %e, "Failed to record feed refresh");
                }
            }
            Err(err) => {
                match self
                    .db
                    .record_refresh_failure(job.feed_id, &err.to_string(), checked_at, next_check_at)
                    .await
                {
                    Ok(errors) => tracing::warn!(
                        feed_id = job.feed_id,
                        url = %job.feed_url,
                        errors,
                        error = %err,
                        "Feed refresh failed"
                    ),
                    Err(db_err) => tracing::warn!(
                        feed_id = job.feed_id,
                        error = %db_err,
                        "Failed to increment feed error count"
                    ),
                }
            }
        }

        result
    }

    async fn refresh_job(&self, job: &Job, fetched_at: DateTime<Utc>) -> Result<FeedRefreshed, JobError> {
        let entries = self
            .source
            .fetch(job)
            .await?
            .into_iter()
            .map(|parsed| parsed.into_entry(fetched_at))
            .collect();

        let refreshed = self
            .db
            .refresh_feed_entries(
                self.dedup.as_ref(),
                job.user_id,
                job.feed_id,
                entries,
                self.settings.update_existing,
            )
            .await?;
        Ok(refreshed)
    }
}

fn log_summary(outcomes: &[JobOutcome]) {
    let (mut created, mut updated, mut deduplicated, mut failed) = (0, 0, 0, 0);
    for outcome in outcomes {
        match &outcome.result {
            Ok(r) => {
                created += r.created_count();
                updated += r.updated_count();
                deduplicated += r.deduplicated;
            }
            Err(_) => failed += 1,
        }
    }

    tracing::info!(
        jobs = outcomes.len(),
        created,
        updated,
        deduplicated,
        failed,
        "Refresh pass complete"
    );
}
