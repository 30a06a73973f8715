//! One end-to-end expiration alert run.
//!
//! The pipeline is serialized across instances by a database lease:
//!   1. Acquire the `expiration-alerts` lease, or bail out quietly.
//!   2. Aggregate due expirations across tenants.
//!   3. Fan alerts out into the outbox (dedupe happens on insert).
//!   4. Recover dispatches stuck in `processing` from dead runs.
//!   5. Drain each channel's due rows through its worker.
//!   6. Persist run metrics and release the lease.
//!
//! The lease is released whatever the inner run did; a release failure is
//! logged and left to TTL expiry.

use std::collections::HashMap;

use chrono::{Local, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use vigia_common::config::AppConfig;
use vigia_common::types::{DispatchChannel, ExpirationAlert};
use vigia_engine::aggregator::AlertAggregator;
use vigia_engine::source::AlertSource;

use crate::channel::{ChannelResolver, FallbackChannels, ResolvedChannels};
use crate::delivery::Deliverer;
use crate::lease::JobLeaseRepo;
use crate::metrics::{RunMetrics, RunMetricsRepo};
use crate::outbox::{DispatchCandidate, DispatchRepo};
use crate::worker::{ChannelOutcome, DispatchWorker};

/// Lease name shared by every instance running this pipeline.
pub const JOB_NAME: &str = "expiration-alerts";

/// What one run did. Returned to manual triggers; `None` at the `run`
/// level means the lease was held elsewhere and nothing happened.
#[derive(Debug, Serialize)]
pub struct PipelineOutcome {
    pub metrics: RunMetrics,
    pub channels: Vec<ChannelOutcome>,
}

pub struct AlertPipeline {
    pool: PgPool,
    source: Box<dyn AlertSource>,
    deliverer: Deliverer,
    fallback: FallbackChannels,
    owner_id: String,
    batch_limit: i64,
    lock_ttl_seconds: i64,
    stale_after: chrono::Duration,
}

impl AlertPipeline {
    pub fn new(
        pool: PgPool,
        source: Box<dyn AlertSource>,
        deliverer: Deliverer,
        config: &AppConfig,
    ) -> Self {
        Self {
            pool,
            source,
            deliverer,
            fallback: FallbackChannels::from_config(config),
            owner_id: format!("vigia-{}-{}", std::process::id(), Uuid::new_v4()),
            batch_limit: config.alerts_batch_limit,
            lock_ttl_seconds: config.alerts_lock_ttl_seconds,
            stale_after: chrono::Duration::minutes(config.alerts_stale_after_minutes),
        }
    }

    /// Identifier stamped on claimed rows and the job lease.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Execute one run if the lease can be taken, `Ok(None)` otherwise.
    pub async fn run(&self) -> anyhow::Result<Option<PipelineOutcome>> {
        let acquired = JobLeaseRepo::try_acquire(
            &self.pool,
            JOB_NAME,
            &self.owner_id,
            self.lock_ttl_seconds,
            Utc::now(),
        )
        .await?;

        if !acquired {
            tracing::info!(job = JOB_NAME, "Lease held by another instance, run skipped");
            return Ok(None);
        }

        let result = self.run_locked().await;

        if let Err(error) = JobLeaseRepo::release(&self.pool, JOB_NAME, &self.owner_id).await {
            tracing::error!(
                job = JOB_NAME,
                error = %error,
                "Failed to release job lease, leaving it to TTL expiry"
            );
        }

        result.map(Some)
    }

    async fn run_locked(&self) -> anyhow::Result<PipelineOutcome> {
        let correlation_id = Uuid::new_v4();
        let executed_at = Utc::now();
        let today = Local::now().date_naive();

        tracing::info!(correlation_id = %correlation_id, "Expiration alert run started");

        let aggregation =
            AlertAggregator::run(self.source.as_ref(), today, correlation_id).await?;

        let mut metrics = RunMetrics::new(correlation_id, executed_at);
        metrics.tenants_evaluated = aggregation.tenants_evaluated;
        metrics.alerts_found = aggregation.alerts.len() as u32;

        let candidates = self.build_candidates(&aggregation.alerts).await?;
        let enqueued = DispatchRepo::enqueue(&self.pool, &candidates, Utc::now()).await?;
        metrics.queued = enqueued.queued;
        metrics.deduplicated = enqueued.deduplicated;

        let stale = DispatchRepo::recover_stale(&self.pool, Utc::now(), self.stale_after).await?;
        if stale > 0 {
            tracing::warn!(
                correlation_id = %correlation_id,
                recovered = stale,
                "Stale processing dispatches reset to pending"
            );
        }
        metrics.stale_recovered = stale;

        let mut worker = DispatchWorker::new(
            &self.pool,
            self.source.as_ref(),
            &self.deliverer,
            &self.fallback,
            &self.owner_id,
            correlation_id,
            today,
            self.batch_limit,
        );

        let mut channels = Vec::with_capacity(DispatchChannel::ALL.len());
        for channel in DispatchChannel::ALL {
            let outcome = worker.process_channel(channel).await?;
            metrics.absorb(&outcome);
            channels.push(outcome);
        }

        if let Err(error) = RunMetricsRepo::record(&self.pool, &metrics).await {
            tracing::error!(
                correlation_id = %correlation_id,
                error = %error,
                "Failed to persist run metrics"
            );
        }

        tracing::info!(
            correlation_id = %correlation_id,
            tenants_evaluated = metrics.tenants_evaluated,
            alerts_found = metrics.alerts_found,
            queued = metrics.queued,
            deduplicated = metrics.deduplicated,
            stale_recovered = metrics.stale_recovered,
            attempted = metrics.attempted,
            delivered = metrics.delivered,
            retried = metrics.retried,
            failed = metrics.failed,
            rate_limited = metrics.rate_limited,
            "Expiration alert run complete"
        );

        Ok(PipelineOutcome { metrics, channels })
    }

    /// Fan each alert out to one candidate per recipient of every channel
    /// its tenant resolves. Tenants with no usable channel drop their
    /// alerts here; nothing reaches the outbox for them.
    async fn build_candidates(
        &self,
        alerts: &[ExpirationAlert],
    ) -> anyhow::Result<Vec<DispatchCandidate>> {
        let mut resolved_cache: HashMap<String, ResolvedChannels> = HashMap::new();
        let mut candidates = Vec::new();

        for alert in alerts {
            if !resolved_cache.contains_key(&alert.tenant_id) {
                let records = self
                    .source
                    .list_tenant_channel_settings(&alert.tenant_id)
                    .await?;
                resolved_cache.insert(
                    alert.tenant_id.clone(),
                    ChannelResolver::resolve(&alert.tenant_id, &records, &self.fallback),
                );
            }

            let Some(resolved) = resolved_cache.get(&alert.tenant_id) else {
                continue;
            };

            if resolved.is_empty() {
                tracing::debug!(
                    tenant_id = %alert.tenant_id,
                    entity_id = %alert.entity_id,
                    "No usable channels for tenant, alert not queued"
                );
                continue;
            }

            for config in resolved.iter() {
                for recipient in config.recipients() {
                    candidates.push(DispatchCandidate::from_alert(
                        alert,
                        config.channel(),
                        recipient,
                        config.policy(),
                    ));
                }
            }
        }

        Ok(candidates)
    }
}
