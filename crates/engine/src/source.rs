//! Read-side port for the aggregation job.
//!
//! The pipeline only reads tenant data through [`AlertSource`], so the
//! Postgres adapter can be swapped for an in-memory fake in tests (or an
//! upstream API client later) without touching the evaluator.

use async_trait::async_trait;
use sqlx::PgPool;

use vigia_common::types::{
    PgrDueRecord, TenantAlertConfig, TenantChannelRecord, TrainingDueRecord,
};

/// Everything the alert pipeline needs to read from the platform.
#[async_trait]
pub trait AlertSource: Send + Sync {
    /// All tenants eligible for alert evaluation.
    async fn list_tenant_alert_configs(&self) -> anyhow::Result<Vec<TenantAlertConfig>>;

    /// Candidate PGR documents for one tenant (due date present, not expired).
    async fn list_pgr_due_records(&self, tenant_id: &str) -> anyhow::Result<Vec<PgrDueRecord>>;

    /// Candidate trainings for one tenant (due date present, not completed).
    async fn list_training_due_records(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<Vec<TrainingDueRecord>>;

    /// Channel settings a tenant has explicitly stored.
    async fn list_tenant_channel_settings(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<Vec<TenantChannelRecord>>;
}

/// Production [`AlertSource`] backed by the platform's Postgres schema.
pub struct PgAlertSource {
    pool: PgPool,
}

impl PgAlertSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertSource for PgAlertSource {
    async fn list_tenant_alert_configs(&self) -> anyhow::Result<Vec<TenantAlertConfig>> {
        let configs: Vec<TenantAlertConfig> = sqlx::query_as(
            r#"
            SELECT id AS tenant_id, name AS tenant_name, alert_window_days
            FROM tenants
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(configs)
    }

    async fn list_pgr_due_records(&self, tenant_id: &str) -> anyhow::Result<Vec<PgrDueRecord>> {
        // Terminal rows are dropped here and re-checked by the evaluator,
        // which stays correct for sources that do not pre-filter.
        let records: Vec<PgrDueRecord> = sqlx::query_as(
            r#"
            SELECT id AS entity_id, title, status, due_date, company_name
            FROM safety_programs
            WHERE tenant_id = $1
              AND due_date IS NOT NULL
              AND lower(status) <> 'expired'
            ORDER BY due_date
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_training_due_records(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<Vec<TrainingDueRecord>> {
        let records: Vec<TrainingDueRecord> = sqlx::query_as(
            r#"
            SELECT id AS entity_id, title, status, due_date, company_name
            FROM trainings
            WHERE tenant_id = $1
              AND due_date IS NOT NULL
              AND lower(status) <> 'completed'
            ORDER BY due_date
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_tenant_channel_settings(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<Vec<TenantChannelRecord>> {
        let settings: Vec<TenantChannelRecord> = sqlx::query_as(
            r#"
            SELECT channel, enabled, settings
            FROM tenant_channel_settings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(settings)
    }
}
