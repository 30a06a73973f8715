//! Due-date evaluator — pure window math over tenant expiration records.
//!
//! For each tenant:
//! 1. Sanitize the configured alert window (values <= 0 fall back to 15 days)
//! 2. Skip records in a terminal status or with unparsable due dates
//! 3. Keep records due within the window: 0 <= days_until_due <= window
//!
//! The reference date is injected by the caller, so evaluation never touches
//! the system clock and the same inputs always yield the same alerts.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use vigia_common::types::{
    AlertKind, ExpirationAlert, PgrDueRecord, TenantAlertConfig, TrainingDueRecord,
};

/// Fallback alert window when a tenant's configured value is unusable.
pub const DEFAULT_WINDOW_DAYS: i64 = 15;

/// A PGR document in this status has already lapsed and been superseded;
/// it must never produce an expiration alert again.
const PGR_TERMINAL_STATUS: &str = "expired";

/// A training in this status was recertified; the old due date is moot.
const TRAINING_TERMINAL_STATUS: &str = "completed";

/// Evaluates a tenant's records against its alert window.
pub struct DueDateEvaluator;

impl DueDateEvaluator {
    /// Produce one alert per record that is due within the tenant's window.
    ///
    /// Records are dropped (never errored) when:
    /// - the status equals the kind's terminal status (case-insensitive)
    /// - the due date cannot be parsed
    /// - the record is overdue (`days_until_due < 0`) or beyond the window
    pub fn evaluate(
        config: &TenantAlertConfig,
        pgr_records: &[PgrDueRecord],
        training_records: &[TrainingDueRecord],
        today: NaiveDate,
    ) -> Vec<ExpirationAlert> {
        let window = Self::sanitize_window(config.alert_window_days);
        let mut alerts = Vec::new();

        for record in pgr_records {
            if is_terminal(&record.status, PGR_TERMINAL_STATUS) {
                continue;
            }
            if let Some(due_date) = parse_due_date(&record.due_date)
                && let Some(days) = days_within_window(due_date, today, window)
            {
                alerts.push(ExpirationAlert {
                    kind: AlertKind::Pgr,
                    tenant_id: config.tenant_id.clone(),
                    tenant_name: config.tenant_name.clone(),
                    entity_id: record.entity_id.clone(),
                    title: record.title.clone(),
                    company_name: record.company_name.clone(),
                    due_date,
                    days_until_due: days,
                });
            }
        }

        for record in training_records {
            if is_terminal(&record.status, TRAINING_TERMINAL_STATUS) {
                continue;
            }
            if let Some(due_date) = parse_due_date(&record.due_date)
                && let Some(days) = days_within_window(due_date, today, window)
            {
                alerts.push(ExpirationAlert {
                    kind: AlertKind::Training,
                    tenant_id: config.tenant_id.clone(),
                    tenant_name: config.tenant_name.clone(),
                    entity_id: record.entity_id.clone(),
                    title: record.title.clone(),
                    company_name: record.company_name.clone(),
                    due_date,
                    days_until_due: days,
                });
            }
        }

        alerts
    }

    /// Clamp a configured window to something usable.
    pub fn sanitize_window(configured_days: i32) -> i64 {
        if configured_days <= 0 {
            DEFAULT_WINDOW_DAYS
        } else {
            i64::from(configured_days)
        }
    }
}

/// Whole days from `today` to `due_date`, if inside `[0, window]`.
fn days_within_window(due_date: NaiveDate, today: NaiveDate, window: i64) -> Option<i64> {
    let days = due_date.signed_duration_since(today).num_days();
    if (0..=window).contains(&days) {
        Some(days)
    } else {
        None
    }
}

fn is_terminal(status: &str, terminal: &str) -> bool {
    status.trim().eq_ignore_ascii_case(terminal)
}

/// Parse a due date stored as text into a calendar date.
///
/// Accepted shapes, tried in order:
/// - bare date `2026-02-28` (taken as-is, no timezone conversion)
/// - RFC 3339 datetime (`2026-02-28T10:30:00Z`, `2026-02-28T22:00:00-03:00`);
///   the calendar date is read in the timestamp's own offset, so a late-night
///   date in UTC-3 does not slide into the next day
/// - offset-less datetime (`2026-02-28T10:30:00`, `2026-02-28 10:30:00`)
///
/// Anything else yields `None` and the record is skipped.
fn parse_due_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.date());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 19).unwrap()
    }

    fn make_config(window_days: i32) -> TenantAlertConfig {
        TenantAlertConfig {
            tenant_id: "tenant-1".to_string(),
            tenant_name: "Acme Seguranca".to_string(),
            alert_window_days: window_days,
        }
    }

    fn make_pgr(due_date: &str, status: &str) -> PgrDueRecord {
        PgrDueRecord {
            entity_id: "pgr-1".to_string(),
            title: "PGR Matriz".to_string(),
            status: status.to_string(),
            due_date: due_date.to_string(),
            company_name: Some("Acme Ltda".to_string()),
        }
    }

    fn make_training(due_date: &str, status: &str) -> TrainingDueRecord {
        TrainingDueRecord {
            entity_id: "training-1".to_string(),
            title: "NR-35 Trabalho em Altura".to_string(),
            status: status.to_string(),
            due_date: due_date.to_string(),
            company_name: None,
        }
    }

    #[test]
    fn test_pgr_within_window_produces_alert() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-28", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Pgr);
        assert_eq!(alerts[0].days_until_due, 9);
        assert_eq!(alerts[0].due_date, NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
    }

    #[test]
    fn test_pgr_beyond_window_ignored() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-03-20", "active")],
            &[],
            today(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_due_today_included() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-19", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].days_until_due, 0);
    }

    #[test]
    fn test_window_boundary_day_included() {
        // today + 15 is the last day inside a 15-day window
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-03-06", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].days_until_due, 15);
    }

    #[test]
    fn test_overdue_record_excluded() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-18", "active")],
            &[],
            today(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_expired_pgr_ignored_even_when_due_soon() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-23", "expired")],
            &[],
            today(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_completed_training_ignored() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[],
            &[make_training("2026-02-23", "completed")],
            today(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_terminal_status_match_is_case_insensitive() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-23", "EXPIRED")],
            &[make_training("2026-02-23", " Completed ")],
            today(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_completed_status_does_not_silence_pgr() {
        // "completed" is only terminal for trainings
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-23", "completed")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_zero_window_falls_back_to_default() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(0),
            &[
                make_pgr("2026-03-06", "active"), // today + 15
                make_pgr("2026-03-07", "active"), // today + 16
            ],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].days_until_due, 15);
    }

    #[test]
    fn test_negative_window_falls_back_to_default() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(-30),
            &[make_pgr("2026-02-28", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_unparsable_due_date_skipped() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("soon", "active"), make_pgr("", "active")],
            &[make_training("31/12/2026", "pending")],
            today(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_datetime_due_date_uses_calendar_date() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-28T10:30:00Z", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].days_until_due, 9);
    }

    #[test]
    fn test_offset_datetime_keeps_its_own_calendar_date() {
        // 22:00 in UTC-3 is already March 2 in UTC; the record still means March 1
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-03-01T22:00:00-03:00", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].due_date, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(alerts[0].days_until_due, 10);
    }

    #[test]
    fn test_space_separated_datetime_parsed() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-28 08:00:00", "active")],
            &[],
            today(),
        );
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_mixed_kinds_aggregate() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-21", "active")],
            &[make_training("2026-02-25", "pending")],
            today(),
        );
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::Pgr);
        assert_eq!(alerts[1].kind, AlertKind::Training);
        assert_eq!(alerts[1].days_until_due, 6);
    }

    #[test]
    fn test_company_name_carried_through() {
        let alerts = DueDateEvaluator::evaluate(
            &make_config(15),
            &[make_pgr("2026-02-21", "active")],
            &[make_training("2026-02-21", "pending")],
            today(),
        );
        assert_eq!(alerts[0].company_name.as_deref(), Some("Acme Ltda"));
        assert_eq!(alerts[1].company_name, None);
    }
}
