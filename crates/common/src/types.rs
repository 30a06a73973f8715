use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of regulatory documents that generate expiration alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// PGR safety program (Programa de Gerenciamento de Riscos).
    Pgr,
    /// Employee training certification.
    Training,
}

impl AlertKind {
    /// Uppercase label used in rendered notification messages.
    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::Pgr => "PGR",
            AlertKind::Training => "TRAINING",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::Pgr => write!(f, "pgr"),
            AlertKind::Training => write!(f, "training"),
        }
    }
}

/// Notification delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DispatchChannel {
    Webhook,
    Email,
    Whatsapp,
}

impl DispatchChannel {
    /// All channels, in the order the worker loop processes them.
    pub const ALL: [DispatchChannel; 3] = [
        DispatchChannel::Webhook,
        DispatchChannel::Email,
        DispatchChannel::Whatsapp,
    ];
}

impl std::fmt::Display for DispatchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchChannel::Webhook => write!(f, "webhook"),
            DispatchChannel::Email => write!(f, "email"),
            DispatchChannel::Whatsapp => write!(f, "whatsapp"),
        }
    }
}

/// Lifecycle state of an outbox row.
///
/// Legal transitions: pending → processing (claim), processing → sent,
/// processing → pending (retry with backoff), processing → failed
/// (attempts exhausted). The stale sweep forces processing → pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchStatus::Pending => write!(f, "pending"),
            DispatchStatus::Processing => write!(f, "processing"),
            DispatchStatus::Sent => write!(f, "sent"),
            DispatchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-tenant alert configuration, read fresh on every run.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantAlertConfig {
    pub tenant_id: String,
    pub tenant_name: String,
    /// Days before a due date during which reminders fire. Values ≤ 0 are
    /// sanitized to the default window by the evaluator.
    pub alert_window_days: i32,
}

/// A safety-program row nearing its due date, as handed over by the
/// platform CRUD layer. `due_date` arrives as a raw ISO string (date-only
/// or datetime) and is parsed by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PgrDueRecord {
    pub entity_id: String,
    pub title: String,
    pub status: String,
    pub due_date: String,
    pub company_name: Option<String>,
}

/// A training-certification row nearing its due date.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrainingDueRecord {
    pub entity_id: String,
    pub title: String,
    pub status: String,
    pub due_date: String,
    pub company_name: Option<String>,
}

/// A derived expiration alert. Ephemeral — consumed by the dispatcher
/// within the same run, never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationAlert {
    pub kind: AlertKind,
    pub tenant_id: String,
    pub tenant_name: String,
    pub entity_id: String,
    pub title: String,
    pub company_name: Option<String>,
    pub due_date: NaiveDate,
    /// Whole days until the due date; 0 means due today.
    pub days_until_due: i64,
}

/// A durable outbox row: one notification to one recipient on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DispatchRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub tenant_name: String,
    pub channel: DispatchChannel,
    pub recipient: String,
    /// `tenant|channel|normalized_recipient|kind|entity|due_date` —
    /// globally unique; repeated enqueues of the same alert are no-ops.
    pub dedupe_key: String,
    pub alert_kind: AlertKind,
    pub entity_id: String,
    pub title: String,
    pub company_name: Option<String>,
    pub due_date: NaiveDate,
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_seconds: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub status: DispatchStatus,
    pub processing_owner: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An explicit per-tenant channel settings row. `settings` holds the
/// kind-specific fields as JSON and is parsed by the channel resolver.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantChannelRecord {
    pub channel: DispatchChannel,
    pub enabled: bool,
    pub settings: serde_json::Value,
}
