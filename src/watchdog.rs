//! Liveness Watchdog (spec C8).
//!
//! Generalizes the teacher's `State`/`Diagnostics` split and
//! `conductor::health`'s `AppState { task_health: Arc<RwLock<HashMap<...>>>,
//! config }` per-task bookkeeping shape to the three named activities and
//! two success-sync snapshots this spec requires, instead of an open-ended
//! task map.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Activity {
    SynchronizeAll,
    IngressResyncProcess,
    McrtResyncProcess,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuccessSync {
    pub run_time: Option<DateTime<Utc>>,
    pub ingress_scheduled: usize,
    pub mcrt_scheduled: usize,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub activity_timeout: Duration,
    pub success_timeout: Duration,
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            activity_timeout: Duration::from_secs(5 * 60),
            success_timeout: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(30),
            enabled: false,
        }
    }
}

#[derive(Debug, Default)]
struct LivenessState {
    last_activity: HashMap<Activity, DateTime<Utc>>,
    last_success_sync: SuccessSync,
    prev_success_sync: SuccessSync,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub reason: Option<String>,
}

/// Tracks reconcile activity/success timestamps and derives a liveness
/// verdict from them. Cheap to clone (an `Arc` around the shared state) so
/// it can be handed to both the orchestrator and the `actix-web` handler.
#[derive(Clone)]
pub struct Watchdog {
    state: Arc<RwLock<LivenessState>>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Watchdog {
            state: Arc::new(RwLock::new(LivenessState::default())),
            config,
        }
    }

    /// `update_last_activity`: monotone-forward only, never decreases.
    pub async fn update_last_activity(&self, activity: Activity, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let slot = state.last_activity.entry(activity).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }

    /// `update_last_success_sync`: rotates `prev := last` and records the new
    /// snapshot only if `t` is after the current `SynchronizeAll` activity
    /// timestamp; otherwise a no-op.
    pub async fn update_last_success_sync(&self, at: DateTime<Utc>, ingress_scheduled: usize, mcrt_scheduled: usize) {
        let mut state = self.state.write().await;
        let sync_all_activity = state.last_activity.get(&Activity::SynchronizeAll).copied();
        if sync_all_activity.map(|t| at <= t).unwrap_or(false) {
            return;
        }
        state.prev_success_sync = state.last_success_sync.clone();
        state.last_success_sync = SuccessSync {
            run_time: Some(at),
            ingress_scheduled,
            mcrt_scheduled,
        };
        state.last_activity.insert(Activity::SynchronizeAll, at);
    }

    pub async fn check(&self) -> HealthReport {
        if !self.config.enabled {
            return HealthReport { healthy: true, reason: None };
        }
        let state = self.state.read().await;
        let now = Utc::now();

        if let Some(reason) = check_sync_all_timeout(&state, now, &self.config) {
            return HealthReport { healthy: false, reason: Some(reason) };
        }
        if let Some(reason) = check_queue_health(&state, Activity::IngressResyncProcess, state.prev_success_sync.ingress_scheduled) {
            return HealthReport { healthy: false, reason: Some(reason) };
        }
        if let Some(reason) = check_queue_health(&state, Activity::McrtResyncProcess, state.prev_success_sync.mcrt_scheduled) {
            return HealthReport { healthy: false, reason: Some(reason) };
        }
        HealthReport { healthy: true, reason: None }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }
}

fn check_sync_all_timeout(state: &LivenessState, now: DateTime<Utc>, config: &WatchdogConfig) -> Option<String> {
    let last_activity = state.last_activity.get(&Activity::SynchronizeAll);
    if let Some(last_activity) = last_activity {
        if now > *last_activity && (now - *last_activity).to_std().unwrap_or_default() > config.activity_timeout {
            return Some("SynchronizeAll has not run within the activity timeout".into());
        }
    } else {
        return Some("SynchronizeAll has never run".into());
    }

    match state.last_success_sync.run_time {
        Some(run_time) if now > run_time && (now - run_time).to_std().unwrap_or_default() > config.success_timeout => {
            Some("SynchronizeAll has not succeeded within the success timeout".into())
        }
        Some(_) => None,
        None => Some("SynchronizeAll has never succeeded".into()),
    }
}

fn check_queue_health(state: &LivenessState, activity: Activity, prev_scheduled: usize) -> Option<String> {
    if prev_scheduled == 0 {
        return None;
    }
    let Some(prev_run_time) = state.prev_success_sync.run_time else {
        return None;
    };
    match state.last_activity.get(&activity) {
        Some(last) if *last >= prev_run_time => None,
        _ => Some(format!("{activity:?} has not drained since the previous successful resync scheduled work for it")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> WatchdogConfig {
        WatchdogConfig {
            activity_timeout: Duration::from_secs(300),
            success_timeout: Duration::from_secs(900),
            interval: Duration::from_secs(1),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn disabled_watchdog_always_reports_healthy() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        assert!(watchdog.check().await.healthy);
    }

    #[tokio::test]
    async fn fresh_watchdog_with_no_activity_is_unhealthy() {
        let watchdog = Watchdog::new(enabled_config());
        assert!(!watchdog.check().await.healthy);
    }

    #[tokio::test]
    async fn activity_and_success_within_timeouts_is_healthy() {
        let watchdog = Watchdog::new(enabled_config());
        let now = Utc::now();
        watchdog.update_last_success_sync(now, 0, 0).await;
        assert!(watchdog.check().await.healthy);
    }

    #[tokio::test]
    async fn last_activity_update_is_monotone() {
        let watchdog = Watchdog::new(enabled_config());
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(60);
        watchdog.update_last_activity(Activity::SynchronizeAll, t1).await;
        watchdog.update_last_activity(Activity::SynchronizeAll, t0).await;
        let state = watchdog.state.read().await;
        assert_eq!(*state.last_activity.get(&Activity::SynchronizeAll).unwrap(), t1);
    }

    #[tokio::test]
    async fn queue_health_fails_when_scheduled_work_never_drained() {
        let watchdog = Watchdog::new(enabled_config());
        let first = Utc::now() - chrono::Duration::seconds(10);
        let second = Utc::now();
        // First success-sync scheduled 3 ingress keys; becomes `prev` once a
        // second success-sync rotates it in.
        watchdog.update_last_success_sync(first, 3, 0).await;
        watchdog.update_last_success_sync(second, 0, 0).await;
        // IngressResyncProcess activity never recorded: should fail.
        let report = watchdog.check().await;
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn queue_health_passes_once_drain_activity_is_observed() {
        let watchdog = Watchdog::new(enabled_config());
        let first = Utc::now() - chrono::Duration::seconds(10);
        let second = Utc::now();
        watchdog.update_last_success_sync(first, 3, 0).await;
        watchdog.update_last_activity(Activity::IngressResyncProcess, first + chrono::Duration::milliseconds(500)).await;
        watchdog.update_last_success_sync(second, 0, 0).await;
        assert!(watchdog.check().await.healthy);
    }
}
