//! Per-channel outbox workers.
//!
//! Each run walks one channel's due rows oldest-first:
//!   1. Load up to the batch limit of due `pending` rows.
//!   2. Resolve the row tenant's channel config (memoized per run).
//!   3. Enforce the tenant's per-run cap before claiming.
//!   4. Claim the row; a lost claim means another instance won it.
//!   5. Deliver, then settle the row: sent, retried with backoff, or
//!      failed once attempts are exhausted.
//!
//! Delivery failures stay isolated to their row; database failures abort
//! the channel run.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use vigia_common::error::AppError;
use vigia_common::types::{DispatchChannel, DispatchRecord};
use vigia_engine::source::AlertSource;

use crate::channel::{ChannelConfig, ChannelResolver, FallbackChannels, ResolvedChannels};
use crate::delivery::Deliverer;
use crate::outbox::{self, DispatchRepo};

/// Per-channel counters for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    pub channel: DispatchChannel,
    /// True when the channel had no due rows at all.
    pub skipped: bool,
    pub attempted: u32,
    pub delivered: u32,
    pub retried: u32,
    pub failed: u32,
    pub rate_limited: u32,
}

impl ChannelOutcome {
    pub fn new(channel: DispatchChannel) -> Self {
        Self {
            channel,
            skipped: false,
            attempted: 0,
            delivered: 0,
            retried: 0,
            failed: 0,
            rate_limited: 0,
        }
    }
}

/// Next attempt time while retries remain; `None` once the row's attempt
/// budget is spent.
fn retry_schedule(
    new_attempts: i32,
    max_attempts: i32,
    backoff_base_seconds: i64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    (new_attempts < max_attempts).then(|| {
        now + Duration::seconds(outbox::backoff_delay_seconds(
            new_attempts,
            backoff_base_seconds,
        ))
    })
}

/// Walks the three channels of one run, sharing a tenant config cache so
/// each tenant's settings are read once per run.
pub struct DispatchWorker<'a> {
    pool: &'a PgPool,
    source: &'a dyn AlertSource,
    deliverer: &'a Deliverer,
    fallback: &'a FallbackChannels,
    owner_id: &'a str,
    correlation_id: Uuid,
    today: NaiveDate,
    batch_limit: i64,
    resolved: HashMap<String, ResolvedChannels>,
}

impl<'a> DispatchWorker<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: &'a PgPool,
        source: &'a dyn AlertSource,
        deliverer: &'a Deliverer,
        fallback: &'a FallbackChannels,
        owner_id: &'a str,
        correlation_id: Uuid,
        today: NaiveDate,
        batch_limit: i64,
    ) -> Self {
        Self {
            pool,
            source,
            deliverer,
            fallback,
            owner_id,
            correlation_id,
            today,
            batch_limit,
            resolved: HashMap::new(),
        }
    }

    pub async fn process_channel(
        &mut self,
        channel: DispatchChannel,
    ) -> anyhow::Result<ChannelOutcome> {
        let mut outcome = ChannelOutcome::new(channel);
        let rows = DispatchRepo::list_due(self.pool, channel, Utc::now(), self.batch_limit).await?;

        if rows.is_empty() {
            tracing::debug!(channel = %channel, "No due dispatches, channel skipped");
            outcome.skipped = true;
            return Ok(outcome);
        }

        tracing::info!(
            correlation_id = %self.correlation_id,
            channel = %channel,
            due = rows.len(),
            "Processing due dispatches"
        );

        let mut claimed_per_tenant: HashMap<String, i64> = HashMap::new();

        for row in rows {
            let config = self.channel_config_for(&row.tenant_id, channel).await?;
            let cap = config
                .as_ref()
                .map_or(self.fallback.default_policy.max_per_run, |config| {
                    config.policy().max_per_run
                });

            let claimed_so_far = claimed_per_tenant.get(&row.tenant_id).copied().unwrap_or(0);
            if claimed_so_far >= cap {
                outcome.rate_limited += 1;
                tracing::debug!(
                    tenant_id = %row.tenant_id,
                    channel = %channel,
                    cap,
                    "Per-run cap reached, row left for a later run"
                );
                continue;
            }

            let Some(claimed) =
                DispatchRepo::claim(self.pool, row.id, self.owner_id, Utc::now()).await?
            else {
                tracing::debug!(dispatch_id = %row.id, "Row claimed elsewhere, skipping");
                continue;
            };

            *claimed_per_tenant.entry(row.tenant_id.clone()).or_insert(0) += 1;
            outcome.attempted += 1;

            // A tenant with no usable config for this channel still burns an
            // attempt: the config may be fixed before the next one.
            let result = match &config {
                Some(config) => {
                    self.deliverer
                        .deliver(&claimed, config, self.correlation_id, self.today)
                        .await
                }
                None => Err(AppError::Delivery(format!(
                    "no {channel} configuration for tenant {}",
                    claimed.tenant_id
                ))),
            };

            self.settle(&claimed, result, &mut outcome).await?;
        }

        tracing::info!(
            correlation_id = %self.correlation_id,
            channel = %channel,
            attempted = outcome.attempted,
            delivered = outcome.delivered,
            retried = outcome.retried,
            failed = outcome.failed,
            rate_limited = outcome.rate_limited,
            "Channel dispatch complete"
        );

        Ok(outcome)
    }

    /// Resolve and memoize the tenant's config for one channel.
    async fn channel_config_for(
        &mut self,
        tenant_id: &str,
        channel: DispatchChannel,
    ) -> anyhow::Result<Option<ChannelConfig>> {
        if !self.resolved.contains_key(tenant_id) {
            let records = self.source.list_tenant_channel_settings(tenant_id).await?;
            let resolved = ChannelResolver::resolve(tenant_id, &records, self.fallback);
            self.resolved.insert(tenant_id.to_string(), resolved);
        }

        Ok(self
            .resolved
            .get(tenant_id)
            .and_then(|resolved| resolved.get(channel))
            .cloned())
    }

    /// Record one attempt's result on the claimed row.
    async fn settle(
        &self,
        claimed: &DispatchRecord,
        result: Result<(), AppError>,
        outcome: &mut ChannelOutcome,
    ) -> Result<(), AppError> {
        let now = Utc::now();

        match result {
            Ok(()) => {
                let settled =
                    DispatchRepo::mark_sent(self.pool, claimed.id, self.owner_id, now).await?;
                if settled {
                    outcome.delivered += 1;
                    tracing::info!(
                        dispatch_id = %claimed.id,
                        tenant_id = %claimed.tenant_id,
                        channel = %claimed.channel,
                        recipient = %claimed.recipient,
                        "Dispatch delivered"
                    );
                } else {
                    tracing::warn!(
                        dispatch_id = %claimed.id,
                        "Ownership lost before completion, result dropped"
                    );
                }
            }
            Err(error) => {
                let new_attempts = claimed.attempts + 1;
                let reason = error.to_string();

                match retry_schedule(
                    new_attempts,
                    claimed.max_attempts,
                    claimed.backoff_base_seconds,
                    now,
                ) {
                    Some(next_attempt_at) => {
                        let settled = DispatchRepo::mark_retry(
                            self.pool,
                            claimed.id,
                            self.owner_id,
                            &reason,
                            next_attempt_at,
                            now,
                        )
                        .await?;
                        if settled {
                            outcome.retried += 1;
                            tracing::warn!(
                                dispatch_id = %claimed.id,
                                tenant_id = %claimed.tenant_id,
                                channel = %claimed.channel,
                                attempts = new_attempts,
                                next_attempt_at = %next_attempt_at,
                                error = %reason,
                                "Delivery failed, retry scheduled"
                            );
                        } else {
                            tracing::warn!(
                                dispatch_id = %claimed.id,
                                "Ownership lost before retry could be recorded"
                            );
                        }
                    }
                    None => {
                        let settled = DispatchRepo::mark_failed(
                            self.pool,
                            claimed.id,
                            self.owner_id,
                            &reason,
                            now,
                        )
                        .await?;
                        if settled {
                            outcome.failed += 1;
                            tracing::warn!(
                                dispatch_id = %claimed.id,
                                tenant_id = %claimed.tenant_id,
                                channel = %claimed.channel,
                                attempts = new_attempts,
                                error = %reason,
                                "Delivery attempts exhausted, dispatch failed"
                            );
                        } else {
                            tracing::warn!(
                                dispatch_id = %claimed.id,
                                "Ownership lost before failure could be recorded"
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
