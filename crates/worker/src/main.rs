#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ExamPrep Background Worker
//!
//! Scheduled jobs:
//! - Replay of failed webhook events (every 15 minutes)
//! - Billing and content invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use examprep_billing::{
    BillingService, InvariantCheckSummary, InvariantChecker, WebhookReplayResult,
};
use examprep_content::ContentInvariantChecker;
use examprep_shared::create_pool;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Most failed events retried in one replay pass
const REPLAY_BATCH: i64 = 100;

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplayTally {
    recovered: usize,
    still_failing: usize,
}

/// Log results of a replay pass
fn log_replay_results(results: &[WebhookReplayResult]) -> ReplayTally {
    let mut tally = ReplayTally::default();

    for result in results {
        if result.success {
            tally.recovered += 1;
        } else {
            tally.still_failing += 1;
            error!(
                stripe_event_id = %result.stripe_event_id,
                event_type = %result.event_type,
                status = %result.new_status,
                error = result.new_error.as_deref().unwrap_or("none"),
                "RECONCILIATION NEEDED: webhook event still failing after replay"
            );
        }
    }

    info!(
        replayed = results.len(),
        recovered = tally.recovered,
        still_failing = tally.still_failing,
        "Webhook replay cycle complete"
    );
    tally
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Invariant checks passed"
        );
        return;
    }

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            affected = violation.user_ids.len(),
            context = %violation.context,
            "{}",
            violation.description
        );
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Invariant checks found violations"
    );
}

async fn run_invariant_checks(pool: PgPool) {
    let billing = match InvariantChecker::new(pool.clone()).run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Billing invariant checks failed to run");
            return;
        }
    };

    let content = match ContentInvariantChecker::new(pool).run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Content invariant checks failed to run");
            log_invariant_summary(&billing);
            return;
        }
    };

    log_invariant_summary(&billing.merge(content));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ExamPrep Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // Without Stripe config there is nothing to replay, but the checks still run
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Some(Arc::new(b)),
        Err(e) => {
            warn!(error = %e, "Billing not configured - webhook replay disabled");
            None
        }
    };

    let scheduler = JobScheduler::new().await?;
    let mut jobs = 0;

    if let Some(billing) = billing {
        scheduler
            .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                let billing = billing.clone();
                Box::pin(async move {
                    info!("Running scheduled webhook replay");
                    match billing.webhooks.replay_failed(Some(REPLAY_BATCH)).await {
                        Ok(results) => {
                            log_replay_results(&results);
                        }
                        Err(e) => error!(error = %e, "Webhook replay failed to run"),
                    }
                })
            })?)
            .await?;
        jobs += 1;
        info!("Scheduled: Failed webhook replay (every 15 minutes)");
    }

    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                info!("Running scheduled invariant checks");
                run_invariant_checks(pool).await;
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Invariant checks (hourly)");

    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    jobs += 1;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("ExamPrep Worker started with {} scheduled jobs", jobs);

    // The scheduler runs jobs on background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
