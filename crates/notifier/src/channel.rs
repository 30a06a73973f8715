//! Channel configuration resolver.
//!
//! Each tenant may store explicit per-channel settings; the process also
//! carries global fallback settings from the environment. Per channel:
//! 1. Explicit record, enabled and complete → use it
//! 2. Explicit record, disabled → channel off for this tenant
//! 3. Explicit record, enabled but unparsable or incomplete → channel off
//!    (warn log). A broken explicit config must not fall back, or alerts
//!    would leak to the shared global recipients.
//! 4. No explicit record → global fallback, if complete
//!
//! A config with zero recipients counts as incomplete.

use serde::Deserialize;

use vigia_common::config::AppConfig;
use vigia_common::types::{DispatchChannel, TenantChannelRecord};

/// Delivery policy carried by every resolved channel config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub max_attempts: i32,
    pub max_per_run: i64,
    pub backoff_base_seconds: i64,
}

impl ChannelPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.alert_max_attempts,
            max_per_run: config.alert_max_per_run,
            backoff_base_seconds: config.alert_backoff_base_seconds,
        }
    }
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_per_run: 50,
            backoff_base_seconds: 60,
        }
    }
}

/// A fully-resolved, deliverable channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelConfig {
    Webhook {
        urls: Vec<String>,
        bearer_token: Option<String>,
        policy: ChannelPolicy,
    },
    Email {
        api_key: String,
        from: String,
        to: Vec<String>,
        policy: ChannelPolicy,
    },
    Whatsapp {
        token: String,
        phone_number_id: String,
        to: Vec<String>,
        policy: ChannelPolicy,
    },
}

impl ChannelConfig {
    pub fn channel(&self) -> DispatchChannel {
        match self {
            ChannelConfig::Webhook { .. } => DispatchChannel::Webhook,
            ChannelConfig::Email { .. } => DispatchChannel::Email,
            ChannelConfig::Whatsapp { .. } => DispatchChannel::Whatsapp,
        }
    }

    /// Recipients this config fans out to: URLs, addresses or phone numbers.
    pub fn recipients(&self) -> &[String] {
        match self {
            ChannelConfig::Webhook { urls, .. } => urls,
            ChannelConfig::Email { to, .. } => to,
            ChannelConfig::Whatsapp { to, .. } => to,
        }
    }

    pub fn policy(&self) -> &ChannelPolicy {
        match self {
            ChannelConfig::Webhook { policy, .. } => policy,
            ChannelConfig::Email { policy, .. } => policy,
            ChannelConfig::Whatsapp { policy, .. } => policy,
        }
    }
}

/// Per-tenant resolution result: at most one config per channel kind.
#[derive(Debug, Clone, Default)]
pub struct ResolvedChannels {
    pub webhook: Option<ChannelConfig>,
    pub email: Option<ChannelConfig>,
    pub whatsapp: Option<ChannelConfig>,
}

impl ResolvedChannels {
    pub fn get(&self, channel: DispatchChannel) -> Option<&ChannelConfig> {
        match channel {
            DispatchChannel::Webhook => self.webhook.as_ref(),
            DispatchChannel::Email => self.email.as_ref(),
            DispatchChannel::Whatsapp => self.whatsapp.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.webhook.is_none() && self.email.is_none() && self.whatsapp.is_none()
    }

    /// Resolved configs in worker channel order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> + '_ {
        DispatchChannel::ALL
            .into_iter()
            .filter_map(|channel| self.get(channel))
    }

    fn set(&mut self, config: ChannelConfig) {
        match config.channel() {
            DispatchChannel::Webhook => self.webhook = Some(config),
            DispatchChannel::Email => self.email = Some(config),
            DispatchChannel::Whatsapp => self.whatsapp = Some(config),
        }
    }
}

/// Process-wide fallback channel settings built from the environment,
/// used for tenants without an explicit settings row.
#[derive(Debug, Clone)]
pub struct FallbackChannels {
    pub webhook: Option<ChannelConfig>,
    pub email: Option<ChannelConfig>,
    pub whatsapp: Option<ChannelConfig>,
    /// Base policy applied to explicit records that do not override it.
    pub default_policy: ChannelPolicy,
}

impl FallbackChannels {
    pub fn from_config(config: &AppConfig) -> Self {
        let policy = ChannelPolicy::from_config(config);

        let webhook = (!config.webhook_urls.is_empty()).then(|| ChannelConfig::Webhook {
            urls: config.webhook_urls.clone(),
            bearer_token: config.webhook_token.clone(),
            policy,
        });

        let email = match (&config.resend_api_key, &config.email_from) {
            (Some(api_key), Some(from)) if !config.email_to.is_empty() => {
                Some(ChannelConfig::Email {
                    api_key: api_key.clone(),
                    from: from.clone(),
                    to: config.email_to.clone(),
                    policy,
                })
            }
            _ => None,
        };

        let whatsapp = match (&config.whatsapp_token, &config.whatsapp_phone_number_id) {
            (Some(token), Some(phone_number_id)) if !config.whatsapp_to.is_empty() => {
                Some(ChannelConfig::Whatsapp {
                    token: token.clone(),
                    phone_number_id: phone_number_id.clone(),
                    to: config.whatsapp_to.clone(),
                    policy,
                })
            }
            _ => None,
        };

        Self {
            webhook,
            email,
            whatsapp,
            default_policy: policy,
        }
    }

    fn get(&self, channel: DispatchChannel) -> Option<&ChannelConfig> {
        match channel {
            DispatchChannel::Webhook => self.webhook.as_ref(),
            DispatchChannel::Email => self.email.as_ref(),
            DispatchChannel::Whatsapp => self.whatsapp.as_ref(),
        }
    }
}

/// Wire shape of the `settings` JSON on an explicit webhook record.
#[derive(Debug, Default, Deserialize)]
struct WebhookSettings {
    #[serde(default)]
    urls: Vec<String>,
    url: Option<String>,
    bearer_token: Option<String>,
    max_attempts: Option<i32>,
    max_per_run: Option<i64>,
    backoff_base_seconds: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct EmailSettings {
    api_key: Option<String>,
    from: Option<String>,
    #[serde(default)]
    to: Vec<String>,
    max_attempts: Option<i32>,
    max_per_run: Option<i64>,
    backoff_base_seconds: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WhatsappSettings {
    token: Option<String>,
    phone_number_id: Option<String>,
    #[serde(default)]
    to: Vec<String>,
    max_attempts: Option<i32>,
    max_per_run: Option<i64>,
    backoff_base_seconds: Option<i64>,
}

/// Resolves the effective channel set for one tenant.
pub struct ChannelResolver;

impl ChannelResolver {
    pub fn resolve(
        tenant_id: &str,
        explicit: &[TenantChannelRecord],
        fallback: &FallbackChannels,
    ) -> ResolvedChannels {
        let mut resolved = ResolvedChannels::default();

        for channel in DispatchChannel::ALL {
            match explicit.iter().find(|record| record.channel == channel) {
                Some(record) if !record.enabled => {
                    tracing::debug!(
                        tenant_id = %tenant_id,
                        channel = %channel,
                        "Channel explicitly disabled for tenant"
                    );
                }
                Some(record) => match Self::parse_explicit(record, fallback.default_policy) {
                    Ok(config) => resolved.set(config),
                    Err(reason) => {
                        tracing::warn!(
                            tenant_id = %tenant_id,
                            channel = %channel,
                            reason = %reason,
                            "Explicit channel settings unusable, channel skipped for tenant"
                        );
                    }
                },
                None => {
                    if let Some(config) = fallback.get(channel) {
                        resolved.set(config.clone());
                    }
                }
            }
        }

        resolved
    }

    /// Parse an enabled explicit record into a usable config.
    ///
    /// Any missing required field makes the whole channel unusable for the
    /// tenant; the caller logs the reason and moves on.
    fn parse_explicit(
        record: &TenantChannelRecord,
        base_policy: ChannelPolicy,
    ) -> Result<ChannelConfig, String> {
        match record.channel {
            DispatchChannel::Webhook => {
                let settings: WebhookSettings = serde_json::from_value(record.settings.clone())
                    .map_err(|e| format!("malformed settings: {e}"))?;
                let urls: Vec<String> = settings
                    .urls
                    .iter()
                    .chain(settings.url.iter())
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect();
                if urls.is_empty() {
                    return Err("no webhook urls configured".to_string());
                }
                Ok(ChannelConfig::Webhook {
                    urls,
                    bearer_token: settings.bearer_token.filter(|t| !t.trim().is_empty()),
                    policy: merge_policy(
                        base_policy,
                        settings.max_attempts,
                        settings.max_per_run,
                        settings.backoff_base_seconds,
                    ),
                })
            }
            DispatchChannel::Email => {
                let settings: EmailSettings = serde_json::from_value(record.settings.clone())
                    .map_err(|e| format!("malformed settings: {e}"))?;
                let api_key = non_empty(settings.api_key).ok_or("missing api_key")?;
                let from = non_empty(settings.from).ok_or("missing from address")?;
                let to = non_empty_list(&settings.to);
                if to.is_empty() {
                    return Err("no recipient addresses".to_string());
                }
                Ok(ChannelConfig::Email {
                    api_key,
                    from,
                    to,
                    policy: merge_policy(
                        base_policy,
                        settings.max_attempts,
                        settings.max_per_run,
                        settings.backoff_base_seconds,
                    ),
                })
            }
            DispatchChannel::Whatsapp => {
                let settings: WhatsappSettings = serde_json::from_value(record.settings.clone())
                    .map_err(|e| format!("malformed settings: {e}"))?;
                let token = non_empty(settings.token).ok_or("missing access token")?;
                let phone_number_id =
                    non_empty(settings.phone_number_id).ok_or("missing phone_number_id")?;
                let to = non_empty_list(&settings.to);
                if to.is_empty() {
                    return Err("no recipient numbers".to_string());
                }
                Ok(ChannelConfig::Whatsapp {
                    token,
                    phone_number_id,
                    to,
                    policy: merge_policy(
                        base_policy,
                        settings.max_attempts,
                        settings.max_per_run,
                        settings.backoff_base_seconds,
                    ),
                })
            }
        }
    }
}

fn merge_policy(
    base: ChannelPolicy,
    max_attempts: Option<i32>,
    max_per_run: Option<i64>,
    backoff_base_seconds: Option<i64>,
) -> ChannelPolicy {
    ChannelPolicy {
        max_attempts: max_attempts.filter(|v| *v >= 1).unwrap_or(base.max_attempts),
        max_per_run: max_per_run.filter(|v| *v >= 1).unwrap_or(base.max_per_run),
        backoff_base_seconds: backoff_base_seconds
            .filter(|v| *v >= 1)
            .unwrap_or(base.backoff_base_seconds),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(
        channel: DispatchChannel,
        enabled: bool,
        settings: serde_json::Value,
    ) -> TenantChannelRecord {
        TenantChannelRecord {
            channel,
            enabled,
            settings,
        }
    }

    fn fallback_with_webhook() -> FallbackChannels {
        FallbackChannels {
            webhook: Some(ChannelConfig::Webhook {
                urls: vec!["https://fallback.example.com/hook".to_string()],
                bearer_token: None,
                policy: ChannelPolicy::default(),
            }),
            email: None,
            whatsapp: None,
            default_policy: ChannelPolicy::default(),
        }
    }

    fn empty_fallback() -> FallbackChannels {
        FallbackChannels {
            webhook: None,
            email: None,
            whatsapp: None,
            default_policy: ChannelPolicy::default(),
        }
    }

    #[test]
    fn test_explicit_enabled_overrides_fallback() {
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            true,
            serde_json::json!({"urls": ["https://tenant.example.com/hook"]}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &fallback_with_webhook());

        let config = resolved.get(DispatchChannel::Webhook).unwrap();
        assert_eq!(config.recipients(), ["https://tenant.example.com/hook"]);
    }

    #[test]
    fn test_explicit_disabled_turns_channel_off() {
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            false,
            serde_json::json!({"urls": ["https://tenant.example.com/hook"]}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &fallback_with_webhook());

        assert!(resolved.get(DispatchChannel::Webhook).is_none());
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_broken_explicit_does_not_fall_back() {
        // Enabled but with no deliverable target: the channel must be
        // skipped rather than degrade to the fallback recipients
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            true,
            serde_json::json!({}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &fallback_with_webhook());

        assert!(resolved.get(DispatchChannel::Webhook).is_none());
    }

    #[test]
    fn test_malformed_settings_do_not_fall_back() {
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            true,
            serde_json::json!("not an object"),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &fallback_with_webhook());

        assert!(resolved.is_empty());
    }

    #[test]
    fn test_missing_explicit_uses_fallback() {
        let resolved = ChannelResolver::resolve("t1", &[], &fallback_with_webhook());

        let config = resolved.get(DispatchChannel::Webhook).unwrap();
        assert_eq!(config.recipients(), ["https://fallback.example.com/hook"]);
        assert!(resolved.get(DispatchChannel::Email).is_none());
    }

    #[test]
    fn test_no_explicit_no_fallback_is_absent() {
        let resolved = ChannelResolver::resolve("t1", &[], &empty_fallback());
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_single_url_string_accepted() {
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            true,
            serde_json::json!({"url": " https://one.example.com/hook "}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());

        let config = resolved.get(DispatchChannel::Webhook).unwrap();
        assert_eq!(config.recipients(), ["https://one.example.com/hook"]);
    }

    #[test]
    fn test_email_with_zero_recipients_is_absent() {
        let explicit = vec![make_record(
            DispatchChannel::Email,
            true,
            serde_json::json!({"api_key": "re_123", "from": "alerts@vigia.dev", "to": []}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());

        assert!(resolved.get(DispatchChannel::Email).is_none());
    }

    #[test]
    fn test_complete_explicit_email_resolved() {
        let explicit = vec![make_record(
            DispatchChannel::Email,
            true,
            serde_json::json!({
                "api_key": "re_123",
                "from": "alerts@vigia.dev",
                "to": ["safety@acme.com", " rh@acme.com "]
            }),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());

        let config = resolved.get(DispatchChannel::Email).unwrap();
        assert_eq!(config.recipients(), ["safety@acme.com", "rh@acme.com"]);
    }

    #[test]
    fn test_whatsapp_requires_token_and_phone_number_id() {
        let explicit = vec![make_record(
            DispatchChannel::Whatsapp,
            true,
            serde_json::json!({"token": "EAAG...", "to": ["+5511999990000"]}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());

        assert!(resolved.get(DispatchChannel::Whatsapp).is_none());
    }

    #[test]
    fn test_policy_overrides_applied() {
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            true,
            serde_json::json!({
                "urls": ["https://tenant.example.com/hook"],
                "max_per_run": 10,
                "backoff_base_seconds": 120
            }),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());

        let policy = resolved.get(DispatchChannel::Webhook).unwrap().policy();
        assert_eq!(policy.max_per_run, 10);
        assert_eq!(policy.backoff_base_seconds, 120);
        // Unset override keeps the process default
        assert_eq!(policy.max_attempts, ChannelPolicy::default().max_attempts);
    }

    #[test]
    fn test_invalid_policy_override_ignored() {
        let explicit = vec![make_record(
            DispatchChannel::Webhook,
            true,
            serde_json::json!({"urls": ["https://t.example.com/h"], "max_per_run": 0}),
        )];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());

        let policy = resolved.get(DispatchChannel::Webhook).unwrap().policy();
        assert_eq!(policy.max_per_run, ChannelPolicy::default().max_per_run);
    }

    #[test]
    fn test_iter_yields_channels_in_worker_order() {
        let explicit = vec![
            make_record(
                DispatchChannel::Whatsapp,
                true,
                serde_json::json!({
                    "token": "EAAG...",
                    "phone_number_id": "1055",
                    "to": ["+5511999990000"]
                }),
            ),
            make_record(
                DispatchChannel::Webhook,
                true,
                serde_json::json!({"urls": ["https://t.example.com/h"]}),
            ),
        ];

        let resolved = ChannelResolver::resolve("t1", &explicit, &empty_fallback());
        let order: Vec<DispatchChannel> = resolved.iter().map(|c| c.channel()).collect();

        assert_eq!(order, [DispatchChannel::Webhook, DispatchChannel::Whatsapp]);
    }
}
