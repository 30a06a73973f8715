//! Append-only run metrics.
//!
//! One row per pipeline run, keyed by the run's correlation id. Reruns
//! that reuse an id (manual replays) must not double-count, so the insert
//! ignores conflicts. Metrics persistence is observability only: a failure
//! here is logged by the orchestrator and never affects the run's outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use vigia_common::error::AppError;

use crate::worker::ChannelOutcome;

/// Counters for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub correlation_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub tenants_evaluated: u32,
    pub alerts_found: u32,
    pub queued: u32,
    pub deduplicated: u32,
    pub stale_recovered: u64,
    pub attempted: u32,
    pub delivered: u32,
    pub failed: u32,
    pub retried: u32,
    pub rate_limited: u32,
}

impl RunMetrics {
    pub fn new(correlation_id: Uuid, executed_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            executed_at,
            tenants_evaluated: 0,
            alerts_found: 0,
            queued: 0,
            deduplicated: 0,
            stale_recovered: 0,
            attempted: 0,
            delivered: 0,
            failed: 0,
            retried: 0,
            rate_limited: 0,
        }
    }

    /// Fold one channel's outcome into the run counters.
    pub fn absorb(&mut self, outcome: &ChannelOutcome) {
        self.attempted += outcome.attempted;
        self.delivered += outcome.delivered;
        self.failed += outcome.failed;
        self.retried += outcome.retried;
        self.rate_limited += outcome.rate_limited;
    }
}

/// Storage operations on the `alert_run_metrics` table.
pub struct RunMetricsRepo;

impl RunMetricsRepo {
    /// Persist the run's metrics. Idempotent per correlation id.
    ///
    /// Callers treat an error here as log-and-continue; see module docs.
    pub async fn record(pool: &PgPool, metrics: &RunMetrics) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO alert_run_metrics (
                correlation_id, executed_at, tenants_evaluated, alerts_found,
                queued, deduplicated, stale_recovered, attempted, delivered,
                failed, retried, rate_limited
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(metrics.correlation_id)
        .bind(metrics.executed_at)
        .bind(metrics.tenants_evaluated as i64)
        .bind(metrics.alerts_found as i64)
        .bind(metrics.queued as i64)
        .bind(metrics.deduplicated as i64)
        .bind(metrics.stale_recovered as i64)
        .bind(metrics.attempted as i64)
        .bind(metrics.delivered as i64)
        .bind(metrics.failed as i64)
        .bind(metrics.retried as i64)
        .bind(metrics.rate_limited as i64)
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigia_common::types::DispatchChannel;

    #[test]
    fn test_absorb_sums_channel_outcomes() {
        let mut metrics = RunMetrics::new(Uuid::new_v4(), Utc::now());

        let mut webhook = ChannelOutcome::new(DispatchChannel::Webhook);
        webhook.attempted = 4;
        webhook.delivered = 3;
        webhook.retried = 1;

        let mut email = ChannelOutcome::new(DispatchChannel::Email);
        email.attempted = 2;
        email.delivered = 1;
        email.failed = 1;
        email.rate_limited = 5;

        metrics.absorb(&webhook);
        metrics.absorb(&email);

        assert_eq!(metrics.attempted, 6);
        assert_eq!(metrics.delivered, 4);
        assert_eq!(metrics.retried, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.rate_limited, 5);
    }
}
