//! Interval scheduler for the alert pipeline.
//!
//! One in-process task owns the cadence: an optional run at startup, then
//! a fixed interval. A busy flag keeps a manual trigger from overlapping
//! the scheduled run inside this process; across processes the job lease
//! does the serializing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use vigia_common::config::AppConfig;

use crate::pipeline::{AlertPipeline, PipelineOutcome};

pub struct AlertScheduler {
    pipeline: AlertPipeline,
    enabled: bool,
    run_on_start: bool,
    interval: Duration,
    busy: AtomicBool,
}

impl AlertScheduler {
    pub fn new(pipeline: AlertPipeline, config: &AppConfig) -> Self {
        Self {
            pipeline,
            enabled: config.alerts_enabled,
            run_on_start: config.alerts_run_on_start,
            interval: Duration::from_secs(config.alerts_interval_minutes * 60),
            busy: AtomicBool::new(false),
        }
    }

    /// One run now, outside the cadence. Returns `None` when a run is
    /// already active in this process or the lease is held elsewhere.
    pub async fn trigger_now(&self) -> anyhow::Result<Option<PipelineOutcome>> {
        self.run_guarded("manual").await
    }

    /// Drive the cadence until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if !self.enabled {
            tracing::warn!("Expiration alerts disabled, scheduler idle");
            // Stay alive so manual triggers keep working.
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            return Ok(());
        }

        tracing::info!(
            interval_minutes = self.interval.as_secs() / 60,
            run_on_start = self.run_on_start,
            "Alert scheduler started"
        );

        if self.run_on_start {
            self.tick("startup").await;
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup run already
        // covered it (or it was deliberately not wanted).
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick("interval").await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Alert scheduler stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// A failed run never takes the scheduler down; the next tick gets a
    /// fresh chance.
    async fn tick(&self, reason: &str) {
        if let Err(error) = self.run_guarded(reason).await {
            tracing::error!(reason, error = %error, "Pipeline run failed");
        }
    }

    async fn run_guarded(&self, reason: &str) -> anyhow::Result<Option<PipelineOutcome>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            tracing::info!(reason, "Pipeline already running in this process, skipped");
            return Ok(None);
        }

        let result = self.pipeline.run().await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}
