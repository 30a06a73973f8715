//! Channel delivery.
//!
//! All three channels render the same human-readable message and ship it
//! over HTTP with one shared client and a bounded per-call timeout. A
//! non-2xx response or a timeout is a plain delivery failure that enters
//! the caller's retry path; no provider-specific handling exists beyond
//! the payload shape.

use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use vigia_common::error::AppError;
use vigia_common::types::DispatchRecord;

use crate::channel::ChannelConfig;

/// Per-request timeout. One hung provider must not stall a channel loop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resend transactional email endpoint.
const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Meta WhatsApp Cloud API base.
const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Response-body snippet length kept in `last_error`.
const ERROR_SNIPPET_LEN: usize = 200;

/// pt-BR due label relative to "today" at delivery time.
pub fn due_label(days_until_due: i64) -> String {
    match days_until_due {
        0 => "vence hoje".to_string(),
        d if d > 0 => format!("vence em {d} dia{}", plural(d)),
        d => format!("vencido há {} dia{}", -d, plural(-d)),
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Whole days between today and the row's due date at delivery time; can
/// go negative once a queued alert slips past its date between retries.
pub fn days_until(due_date: NaiveDate, today: NaiveDate) -> i64 {
    due_date.signed_duration_since(today).num_days()
}

/// The message every channel carries:
/// `[tenant] KIND title (company) - due label`.
pub fn render_message(record: &DispatchRecord, days_until_due: i64) -> String {
    format!(
        "[{}] {} {} ({}) - {}",
        record.tenant_name,
        record.alert_kind.label(),
        record.title,
        record.company_name.as_deref().unwrap_or("-"),
        due_label(days_until_due)
    )
}

/// JSON envelope POSTed to webhook recipients.
pub fn webhook_payload(
    record: &DispatchRecord,
    message: &str,
    correlation_id: Uuid,
) -> serde_json::Value {
    json!({
        "event": "expiration_alert",
        "correlation_id": correlation_id,
        "tenant": {
            "id": record.tenant_id,
            "name": record.tenant_name,
        },
        "alert": {
            "kind": record.alert_kind,
            "entity_id": record.entity_id,
            "title": record.title,
            "company_name": record.company_name,
            "due_date": record.due_date,
        },
        "message": message,
    })
}

/// Sends claimed dispatches over the wire.
pub struct Deliverer {
    client: reqwest::Client,
}

impl Deliverer {
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Deliver one record using its tenant's resolved config. The message
    /// is rendered against `today` so retried rows carry current wording.
    pub async fn deliver(
        &self,
        record: &DispatchRecord,
        config: &ChannelConfig,
        correlation_id: Uuid,
        today: NaiveDate,
    ) -> Result<(), AppError> {
        let message = render_message(record, days_until(record.due_date, today));

        match config {
            ChannelConfig::Webhook { bearer_token, .. } => {
                self.send_webhook(record, &message, bearer_token.as_deref(), correlation_id)
                    .await
            }
            ChannelConfig::Email { api_key, from, .. } => {
                self.send_email(record, &message, api_key, from).await
            }
            ChannelConfig::Whatsapp {
                token,
                phone_number_id,
                ..
            } => {
                self.send_whatsapp(record, &message, token, phone_number_id)
                    .await
            }
        }
    }

    async fn send_webhook(
        &self,
        record: &DispatchRecord,
        message: &str,
        bearer_token: Option<&str>,
        correlation_id: Uuid,
    ) -> Result<(), AppError> {
        let mut request = self
            .client
            .post(&record.recipient)
            .json(&webhook_payload(record, message, correlation_id));

        if let Some(token) = bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await?;
        Self::ensure_success("webhook", response).await
    }

    async fn send_email(
        &self,
        record: &DispatchRecord,
        message: &str,
        api_key: &str,
        from: &str,
    ) -> Result<(), AppError> {
        let payload = json!({
            "from": from,
            "to": [record.recipient],
            "subject": format!(
                "Alerta de vencimento: {} {}",
                record.alert_kind.label(),
                record.title
            ),
            "html": format!("<p>{}</p>", html_escape(message)),
        });

        let response = self
            .client
            .post(RESEND_API_URL)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&payload)
            .send()
            .await?;

        Self::ensure_success("email", response).await
    }

    async fn send_whatsapp(
        &self,
        record: &DispatchRecord,
        message: &str,
        token: &str,
        phone_number_id: &str,
    ) -> Result<(), AppError> {
        let url = format!("{GRAPH_API_BASE}/{phone_number_id}/messages");
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": record.recipient,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": message,
            },
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .json(&payload)
            .send()
            .await?;

        Self::ensure_success("whatsapp", response).await
    }

    /// Map a non-2xx response to a delivery error carrying the status and
    /// a body snippet destined for the row's `last_error`.
    async fn ensure_success(channel: &str, response: reqwest::Response) -> Result<(), AppError> {
        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Delivery(format!(
            "{channel} delivery failed: HTTP {status}: {}",
            snippet(&body)
        )))
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// First chars of a provider response, newlines collapsed.
fn snippet(body: &str) -> String {
    let flat = body.replace(['\n', '\r'], " ");
    let trimmed = flat.trim();
    match trimmed.char_indices().nth(ERROR_SNIPPET_LEN) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
