//! Alert aggregation job.
//!
//! One run, identified by a correlation id:
//! 1. Load every tenant's alert config
//! 2. For each tenant, pull candidate PGR + training records and evaluate
//!    them against the tenant's window (via `DueDateEvaluator`)
//! 3. Collect all alerts into a single outcome for the dispatch stage
//!
//! A tenant whose records cannot be loaded is logged and skipped; one broken
//! tenant never aborts the run for the others.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use vigia_common::types::{ExpirationAlert, TenantAlertConfig};

use crate::due::DueDateEvaluator;
use crate::source::AlertSource;

/// Result of one aggregation run.
#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub correlation_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub tenants_evaluated: u32,
    pub tenants_failed: u32,
    pub alerts: Vec<ExpirationAlert>,
}

/// Fans the due-date evaluator out across all tenants.
pub struct AlertAggregator;

impl AlertAggregator {
    /// Run one aggregation pass over every tenant.
    ///
    /// Only the initial tenant-config load can fail the run as a whole;
    /// per-tenant record loads are isolated.
    pub async fn run(
        source: &dyn AlertSource,
        today: NaiveDate,
        correlation_id: Uuid,
    ) -> anyhow::Result<AggregationOutcome> {
        let executed_at = Utc::now();
        let configs = source.list_tenant_alert_configs().await?;

        let mut alerts: Vec<ExpirationAlert> = Vec::new();
        let mut tenants_evaluated = 0u32;
        let mut tenants_failed = 0u32;

        for config in &configs {
            match Self::evaluate_tenant(source, config, today).await {
                Ok(tenant_alerts) => {
                    tenants_evaluated += 1;
                    for alert in &tenant_alerts {
                        tracing::info!(
                            correlation_id = %correlation_id,
                            tenant_id = %config.tenant_id,
                            kind = %alert.kind,
                            entity_id = %alert.entity_id,
                            title = %alert.title,
                            due_date = %alert.due_date,
                            days_until_due = alert.days_until_due,
                            "Expiration alert found"
                        );
                    }
                    alerts.extend(tenant_alerts);
                }
                Err(e) => {
                    tenants_failed += 1;
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        tenant_id = %config.tenant_id,
                        error = %e,
                        "Tenant evaluation failed, continuing with remaining tenants"
                    );
                }
            }
        }

        if alerts.is_empty() {
            tracing::info!(correlation_id = %correlation_id, "No pending expirations found");
        }

        tracing::info!(
            correlation_id = %correlation_id,
            tenants_evaluated,
            tenants_failed,
            alerts = alerts.len(),
            "Aggregation complete"
        );

        Ok(AggregationOutcome {
            correlation_id,
            executed_at,
            tenants_evaluated,
            tenants_failed,
            alerts,
        })
    }

    async fn evaluate_tenant(
        source: &dyn AlertSource,
        config: &TenantAlertConfig,
        today: NaiveDate,
    ) -> anyhow::Result<Vec<ExpirationAlert>> {
        let pgr_records = source.list_pgr_due_records(&config.tenant_id).await?;
        let training_records = source.list_training_due_records(&config.tenant_id).await?;

        Ok(DueDateEvaluator::evaluate(
            config,
            &pgr_records,
            &training_records,
            today,
        ))
    }
}
