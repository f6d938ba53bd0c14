//! Spend budget monitoring
//!
//! A timer-driven loop aggregates the cost series over the current budget
//! period and walks a `Normal -> Warning -> Exceeded` state machine. Alerts
//! fire exactly once per period per level; the `pause-upstream` action is
//! delegated to an external collaborator and is best-effort. The monitor
//! only ever reads the store.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::constants::{BUDGET_EVAL_INTERVAL_SECS, DEFAULT_WARN_THRESHOLD};
use crate::store::{MetricCategory, MetricStore, TimeRange};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    /// UTC start of the period containing `now`. Weeks start on Monday.
    pub fn start_of(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        match self {
            BudgetPeriod::Daily => midnight,
            BudgetPeriod::Weekly => {
                let back = now.weekday().num_days_from_monday() as i64;
                midnight - ChronoDuration::days(back)
            }
            BudgetPeriod::Monthly => now
                .date_naive()
                .with_day(1)
                .expect("day 1 exists in every month")
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc(),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPeriod::Daily => write!(f, "daily"),
            BudgetPeriod::Weekly => write!(f, "weekly"),
            BudgetPeriod::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetAction {
    #[default]
    AlertOnly,
    PauseUpstream,
}

impl fmt::Display for BudgetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetAction::AlertOnly => write!(f, "alert-only"),
            BudgetAction::PauseUpstream => write!(f, "pause-upstream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub period: BudgetPeriod,
    pub limit_usd: f64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default)]
    pub action: BudgetAction,
}

fn default_warn_threshold() -> f64 {
    DEFAULT_WARN_THRESHOLD
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.limit_usd.is_finite() || self.limit_usd <= 0.0 {
            return Err("limit_usd must be a positive number");
        }
        if !self.warn_threshold.is_finite()
            || self.warn_threshold <= 0.0
            || self.warn_threshold > 1.0
        {
            return Err("warn_threshold must be in (0, 1]");
        }
        Ok(())
    }
}

// =============================================================================
// Derived state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Normal,
    Warning,
    Exceeded,
}

/// Point-in-time budget status, recomputed from the cost series each cycle
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub level: BudgetLevel,
    pub spend_usd: f64,
    pub limit_usd: f64,
    pub warn_threshold: f64,
    pub period: BudgetPeriod,
    pub period_start: DateTime<Utc>,
    pub action: BudgetAction,
}

// =============================================================================
// Collaborators
// =============================================================================

/// Destination for budget alerts. The core depends on the capability, not
/// on any delivery mechanism.
pub trait AlertSink: Send + Sync {
    fn send_alert(&self, level: BudgetLevel, status: &BudgetStatus);
}

/// External control over the telemetry-producing agent
pub trait UpstreamControl: Send + Sync {
    fn pause(&self) -> anyhow::Result<()>;
}

/// Default sink: structured log lines only
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send_alert(&self, level: BudgetLevel, status: &BudgetStatus) {
        tracing::warn!(
            level = ?level,
            spend_usd = status.spend_usd,
            limit_usd = status.limit_usd,
            period = %status.period,
            "Budget alert"
        );
    }
}

/// Default upstream control: logs the pause request and succeeds
pub struct LogUpstreamControl;

impl UpstreamControl for LogUpstreamControl {
    fn pause(&self) -> anyhow::Result<()> {
        tracing::warn!("Budget exceeded, pause-upstream requested (no agent control attached)");
        Ok(())
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Per-period alert bookkeeping. Reset whenever the period rolls over or the
/// config is replaced.
#[derive(Debug, Clone, Copy)]
struct Cycle {
    period_start: DateTime<Utc>,
    level: BudgetLevel,
    warning_alerted: bool,
    exceeded_alerted: bool,
}

impl Cycle {
    fn fresh(period_start: DateTime<Utc>) -> Self {
        Self {
            period_start,
            level: BudgetLevel::Normal,
            warning_alerted: false,
            exceeded_alerted: false,
        }
    }
}

pub struct BudgetMonitor {
    store: Arc<MetricStore>,
    config: RwLock<Option<BudgetConfig>>,
    cycle: Mutex<Option<Cycle>>,
    alerts: Arc<dyn AlertSink>,
    upstream: Arc<dyn UpstreamControl>,
}

impl BudgetMonitor {
    pub fn new(
        store: Arc<MetricStore>,
        config: Option<BudgetConfig>,
        alerts: Arc<dyn AlertSink>,
        upstream: Arc<dyn UpstreamControl>,
    ) -> Self {
        Self {
            store,
            config: RwLock::new(config),
            cycle: Mutex::new(None),
            alerts,
            upstream,
        }
    }

    pub fn config(&self) -> Option<BudgetConfig> {
        self.config.read().clone()
    }

    /// Replace the active config. The alert cycle restarts so new limits
    /// re-alert even within the same period.
    pub fn replace_config(&self, config: BudgetConfig) {
        tracing::info!(
            limit_usd = config.limit_usd,
            period = %config.period,
            action = %config.action,
            "Budget config replaced"
        );
        *self.config.write() = Some(config);
        *self.cycle.lock() = None;
    }

    /// Read-only status for the query API. Does not advance the state
    /// machine or emit alerts.
    pub fn status(&self, now: DateTime<Utc>) -> Option<BudgetStatus> {
        let config = self.config.read().clone()?;
        let period_start = config.period.start_of(now);
        let spend = self
            .store
            .sum(MetricCategory::Cost, TimeRange::since(period_start));
        let level = compute_level(spend, &config);
        // Within a period the level never drops below what the monitor
        // already reached
        let level = match *self.cycle.lock() {
            Some(cycle) if cycle.period_start == period_start => level.max(cycle.level),
            _ => level,
        };
        Some(BudgetStatus {
            level,
            spend_usd: spend,
            limit_usd: config.limit_usd,
            warn_threshold: config.warn_threshold,
            period: config.period,
            period_start,
            action: config.action,
        })
    }

    /// One evaluation cycle: aggregate spend, transition the state machine,
    /// emit alerts on upward transitions.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Option<BudgetStatus> {
        let config = self.config.read().clone()?;
        let period_start = config.period.start_of(now);
        let spend = self
            .store
            .sum(MetricCategory::Cost, TimeRange::since(period_start));

        let mut cycle_guard = self.cycle.lock();
        let cycle = match cycle_guard.as_mut() {
            Some(c) if c.period_start == period_start => c,
            _ => {
                tracing::debug!(period_start = %period_start, "Budget period started");
                cycle_guard.insert(Cycle::fresh(period_start))
            }
        };

        let level = compute_level(spend, &config).max(cycle.level);
        cycle.level = level;

        let status = BudgetStatus {
            level,
            spend_usd: spend,
            limit_usd: config.limit_usd,
            warn_threshold: config.warn_threshold,
            period: config.period,
            period_start,
            action: config.action,
        };

        match level {
            BudgetLevel::Normal => {}
            BudgetLevel::Warning => {
                if !cycle.warning_alerted {
                    cycle.warning_alerted = true;
                    self.alerts.send_alert(BudgetLevel::Warning, &status);
                }
            }
            BudgetLevel::Exceeded => {
                if !cycle.exceeded_alerted {
                    cycle.exceeded_alerted = true;
                    self.alerts.send_alert(BudgetLevel::Exceeded, &status);
                    if config.action == BudgetAction::PauseUpstream
                        && let Err(e) = self.upstream.pause()
                    {
                        tracing::error!(error = %e, "Failed to pause upstream agent");
                    }
                }
            }
        }

        Some(status)
    }

    /// Periodic evaluation until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(BUDGET_EVAL_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(status) = self.evaluate(Utc::now()) {
                        tracing::trace!(
                            spend_usd = status.spend_usd,
                            level = ?status.level,
                            "Budget evaluated"
                        );
                    }
                }
            }
        }
        tracing::debug!("Budget monitor stopped");
    }
}

fn compute_level(spend: f64, config: &BudgetConfig) -> BudgetLevel {
    if spend >= config.limit_usd {
        BudgetLevel::Exceeded
    } else if spend >= config.limit_usd * config.warn_threshold {
        BudgetLevel::Warning
    } else {
        BudgetLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveHub;
    use crate::store::MetricRecord;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<BudgetLevel>>,
    }

    impl AlertSink for RecordingSink {
        fn send_alert(&self, level: BudgetLevel, _status: &BudgetStatus) {
            self.alerts.lock().push(level);
        }
    }

    #[derive(Default)]
    struct RecordingPause {
        calls: Mutex<u32>,
    }

    impl UpstreamControl for RecordingPause {
        fn pause(&self) -> anyhow::Result<()> {
            *self.calls.lock() += 1;
            Ok(())
        }
    }

    fn store() -> Arc<MetricStore> {
        Arc::new(MetricStore::new(1_000, 14, Arc::new(LiveHub::new(16))))
    }

    fn config(action: BudgetAction) -> BudgetConfig {
        BudgetConfig {
            period: BudgetPeriod::Daily,
            limit_usd: 100.0,
            warn_threshold: 0.8,
            action,
        }
    }

    fn spend(store: &MetricStore, now: DateTime<Utc>, amount: f64) {
        store
            .append(MetricRecord::new(MetricCategory::Cost, now, amount))
            .unwrap();
    }

    fn monitor(
        store: Arc<MetricStore>,
        action: BudgetAction,
    ) -> (Arc<BudgetMonitor>, Arc<RecordingSink>, Arc<RecordingPause>) {
        let sink = Arc::new(RecordingSink::default());
        let pause = Arc::new(RecordingPause::default());
        let monitor = Arc::new(BudgetMonitor::new(
            store,
            Some(config(action)),
            sink.clone(),
            pause.clone(),
        ));
        (monitor, sink, pause)
    }

    #[test]
    fn test_state_sequence_normal_warning_exceeded() {
        let store = store();
        let (monitor, sink, pause) = monitor(store.clone(), BudgetAction::PauseUpstream);
        // Noon avoids the period boundary while spend accumulates
        let now = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();

        spend(&store, now, 50.0);
        assert_eq!(monitor.evaluate(now).unwrap().level, BudgetLevel::Normal);

        spend(&store, now, 35.0);
        assert_eq!(monitor.evaluate(now).unwrap().level, BudgetLevel::Warning);

        spend(&store, now, 16.0);
        assert_eq!(monitor.evaluate(now).unwrap().level, BudgetLevel::Exceeded);

        assert_eq!(
            *sink.alerts.lock(),
            vec![BudgetLevel::Warning, BudgetLevel::Exceeded]
        );
        assert_eq!(*pause.calls.lock(), 1);
    }

    #[test]
    fn test_alerts_fire_once_per_period() {
        let store = store();
        let (monitor, sink, _) = monitor(store.clone(), BudgetAction::AlertOnly);
        let now = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();

        spend(&store, now, 90.0);
        monitor.evaluate(now);
        monitor.evaluate(now);
        monitor.evaluate(now);
        assert_eq!(*sink.alerts.lock(), vec![BudgetLevel::Warning]);
    }

    #[test]
    fn test_pause_not_invoked_for_alert_only() {
        let store = store();
        let (monitor, _, pause) = monitor(store.clone(), BudgetAction::AlertOnly);
        let now = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        spend(&store, now, 150.0);
        assert_eq!(monitor.evaluate(now).unwrap().level, BudgetLevel::Exceeded);
        assert_eq!(*pause.calls.lock(), 0);
    }

    #[test]
    fn test_period_rollover_resets_state() {
        let store = store();
        let (monitor, sink, _) = monitor(store.clone(), BudgetAction::AlertOnly);
        let day_one = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();

        spend(&store, day_one, 95.0);
        assert_eq!(monitor.evaluate(day_one).unwrap().level, BudgetLevel::Warning);

        // Next day: yesterday's spend falls outside the new period
        let day_two = day_one + ChronoDuration::days(1);
        assert_eq!(monitor.evaluate(day_two).unwrap().level, BudgetLevel::Normal);

        // Warning again in the new period re-alerts
        spend(&store, day_two, 85.0);
        assert_eq!(monitor.evaluate(day_two).unwrap().level, BudgetLevel::Warning);
        assert_eq!(
            *sink.alerts.lock(),
            vec![BudgetLevel::Warning, BudgetLevel::Warning]
        );
    }

    #[test]
    fn test_replace_config_restarts_cycle() {
        let store = store();
        let (monitor, sink, _) = monitor(store.clone(), BudgetAction::AlertOnly);
        let now = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();

        spend(&store, now, 90.0);
        monitor.evaluate(now);
        assert_eq!(sink.alerts.lock().len(), 1);

        // A tighter limit re-alerts immediately
        monitor.replace_config(BudgetConfig {
            limit_usd: 50.0,
            ..config(BudgetAction::AlertOnly)
        });
        assert_eq!(monitor.evaluate(now).unwrap().level, BudgetLevel::Exceeded);
        assert_eq!(sink.alerts.lock().len(), 2);
    }

    #[test]
    fn test_no_config_means_no_status() {
        let store = store();
        let monitor = BudgetMonitor::new(
            store,
            None,
            Arc::new(LogAlertSink),
            Arc::new(LogUpstreamControl),
        );
        assert!(monitor.evaluate(Utc::now()).is_none());
        assert!(monitor.status(Utc::now()).is_none());
    }

    #[test]
    fn test_status_is_read_only() {
        let store = store();
        let (monitor, sink, _) = monitor(store.clone(), BudgetAction::AlertOnly);
        let now = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        spend(&store, now, 95.0);
        let status = monitor.status(now).unwrap();
        assert_eq!(status.level, BudgetLevel::Warning);
        assert!(sink.alerts.lock().is_empty());
    }

    #[test]
    fn test_period_starts() {
        let now = "2026-08-19T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            BudgetPeriod::Daily.start_of(now).to_rfc3339(),
            "2026-08-19T00:00:00+00:00"
        );
        // 2026-08-19 is a Wednesday; the week starts Monday the 17th
        assert_eq!(
            BudgetPeriod::Weekly.start_of(now).to_rfc3339(),
            "2026-08-17T00:00:00+00:00"
        );
        assert_eq!(
            BudgetPeriod::Monthly.start_of(now).to_rfc3339(),
            "2026-08-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(config(BudgetAction::AlertOnly).validate().is_ok());
        assert!(
            BudgetConfig {
                limit_usd: 0.0,
                ..config(BudgetAction::AlertOnly)
            }
            .validate()
            .is_err()
        );
        assert!(
            BudgetConfig {
                warn_threshold: 1.5,
                ..config(BudgetAction::AlertOnly)
            }
            .validate()
            .is_err()
        );
    }
}
