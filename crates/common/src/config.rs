use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Master switch for the scheduled alert pipeline (default: true)
    pub alerts_enabled: bool,

    /// Run one pipeline pass immediately at startup (default: false)
    pub alerts_run_on_start: bool,

    /// Minutes between scheduled pipeline runs (default: 60)
    pub alerts_interval_minutes: u64,

    /// TTL of the cross-process job lock in seconds (default: 600)
    pub alerts_lock_ttl_seconds: i64,

    /// Minutes after which a `processing` outbox row is considered stale
    /// and swept back to `pending` (default: 10)
    pub alerts_stale_after_minutes: i64,

    /// Maximum due rows fetched per channel per run (default: 500)
    pub alerts_batch_limit: i64,

    /// Fallback webhook target URLs, comma-separated
    pub webhook_urls: Vec<String>,

    /// Optional bearer token sent with fallback webhook posts
    pub webhook_token: Option<String>,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Fallback email recipients, comma-separated
    pub email_to: Vec<String>,

    /// WhatsApp Cloud API access token
    pub whatsapp_token: Option<String>,

    /// WhatsApp Cloud API phone number id
    pub whatsapp_phone_number_id: Option<String>,

    /// Fallback WhatsApp recipients (E.164 numbers), comma-separated
    pub whatsapp_to: Vec<String>,

    /// Delivery attempts before an outbox row goes terminal (default: 5)
    pub alert_max_attempts: i32,

    /// Per-tenant-per-channel dispatch cap within one run (default: 50)
    pub alert_max_per_run: i64,

    /// Base of the exponential retry backoff in seconds (default: 60)
    pub alert_backoff_base_seconds: i64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            alerts_enabled: env_bool("ALERTS_ENABLED").unwrap_or(true),
            alerts_run_on_start: env_bool("ALERTS_RUN_ON_START").unwrap_or(false),
            alerts_interval_minutes: std::env::var("ALERTS_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("ALERTS_INTERVAL_MINUTES must be a valid u64"))?
                .max(1),
            alerts_lock_ttl_seconds: std::env::var("ALERTS_LOCK_TTL_SECONDS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("ALERTS_LOCK_TTL_SECONDS must be a valid i64"))?,
            alerts_stale_after_minutes: std::env::var("ALERTS_STALE_AFTER_MINUTES")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("ALERTS_STALE_AFTER_MINUTES must be a valid i64"))?
                .max(1),
            alerts_batch_limit: std::env::var("ALERTS_BATCH_LIMIT")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(500)
                .clamp(1, 500),
            webhook_urls: env_list("ALERT_WEBHOOK_URLS"),
            webhook_token: env_opt("ALERT_WEBHOOK_TOKEN"),
            resend_api_key: env_opt("RESEND_API_KEY"),
            email_from: env_opt("EMAIL_FROM"),
            email_to: env_list("ALERT_EMAIL_TO"),
            whatsapp_token: env_opt("WHATSAPP_TOKEN"),
            whatsapp_phone_number_id: env_opt("WHATSAPP_PHONE_NUMBER_ID"),
            whatsapp_to: env_list("ALERT_WHATSAPP_TO"),
            alert_max_attempts: std::env::var("ALERT_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(5)
                .max(1),
            alert_max_per_run: std::env::var("ALERT_MAX_PER_RUN")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(50)
                .max(1),
            alert_backoff_base_seconds: std::env::var("ALERT_BACKOFF_BASE_SECONDS")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(60)
                .max(1),
        })
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| parse_list(&v))
        .unwrap_or_default()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(parse_bool(" on "));
    }

    #[test]
    fn test_parse_bool_falsy() {
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("enabled"));
    }

    #[test]
    fn test_parse_list_trims_and_drops_empties() {
        assert_eq!(
            parse_list("a@x.com, b@x.com ,,c@x.com"),
            vec!["a@x.com", "b@x.com", "c@x.com"]
        );
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ").is_empty());
    }
}
