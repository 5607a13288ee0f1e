//! Control plane: pause/resume, force-scan, manual breaker, audit log, and
//! the health snapshot the orchestrator maintains each cycle (spec §4.9, §3
//! `HealthState`, §5 "atomic swap on the struct pointer; readers deep-copy").

use crate::config::Config;
use crate::models::AdapterState;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::info;

const DURATION_WINDOW: usize = 120;
const AUDIT_WINDOW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualBreakerState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub manual_state: ManualBreakerState,
    pub last_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Immutable health snapshot, atomically swapped in by the orchestrator and
/// deep-copied by readers (spec §5).
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub durations_ms: Vec<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_streak: u32,
    pub cycle_count: u64,
    pub backoff_sec: f64,
    pub sla_warn_multiplier: f64,
    pub sla_critical_multiplier: f64,
    pub scan_interval_sec: u64,
    pub symbol_liveness: BTreeMap<String, DateTime<Utc>>,
    pub adapter_state: Option<AdapterState>,
}

impl HealthSnapshot {
    fn new(config: &Config) -> Self {
        Self {
            durations_ms: Vec::new(),
            last_success: None,
            last_error: None,
            failure_streak: 0,
            cycle_count: 0,
            backoff_sec: 0.0,
            sla_warn_multiplier: config.scan_sla_warn_multiplier,
            sla_critical_multiplier: config.scan_sla_critical_multiplier,
            scan_interval_sec: config.scan_interval_sec,
            symbol_liveness: BTreeMap::new(),
            adapter_state: None,
        }
    }

    /// Mean of the rolling duration window, used for the market-gauge-independent
    /// SLA warn/critical computation exposed via `GET /health`.
    pub fn avg_duration_ms(&self) -> f64 {
        if self.durations_ms.is_empty() {
            return 0.0;
        }
        self.durations_ms.iter().sum::<u64>() as f64 / self.durations_ms.len() as f64
    }

    pub fn is_degraded(&self) -> bool {
        let breaker_open = self
            .adapter_state
            .as_ref()
            .map(|s| s.state == crate::models::CircuitState::Open)
            .unwrap_or(false);
        self.failure_streak > 0 || breaker_open
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub paused: bool,
    pub breaker: BreakerSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub health: HealthSnapshot,
    pub control: ControlSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceScanResult {
    pub queued: bool,
    pub reason: Option<String>,
}

struct BreakerInner {
    state: ManualBreakerState,
    last_reason: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Shared control-plane state. One instance lives in `AppState`; the
/// orchestrator and the HTTP control API both hold an `Arc` to it.
pub struct ControlPlane {
    paused: AtomicBool,
    pause_changed: Notify,
    breaker: Mutex<BreakerInner>,
    audit: Mutex<VecDeque<AuditEntry>>,
    force_event: Notify,
    health: ArcSwap<HealthSnapshot>,
}

impl ControlPlane {
    pub fn new(config: &Config) -> Self {
        Self {
            paused: AtomicBool::new(false),
            pause_changed: Notify::new(),
            breaker: Mutex::new(BreakerInner {
                state: ManualBreakerState::Closed,
                last_reason: None,
                updated_at: None,
            }),
            audit: Mutex::new(VecDeque::with_capacity(AUDIT_WINDOW)),
            force_event: Notify::new(),
            health: ArcSwap::from_pointee(HealthSnapshot::new(config)),
        }
    }

    fn audit(&self, action: &str, actor: &str, detail: impl Into<String>) {
        let entry = AuditEntry {
            ts: Utc::now(),
            action: action.to_string(),
            actor: actor.to_string(),
            detail: detail.into(),
        };
        info!(action, actor, detail = %entry.detail, "control plane audit");
        let mut audit = self.audit.lock();
        if audit.len() >= AUDIT_WINDOW {
            audit.pop_front();
        }
        audit.push_back(entry);
    }

    pub fn pause(&self, actor: &str, reason: &str) {
        self.paused.store(true, Ordering::SeqCst);
        self.pause_changed.notify_waiters();
        self.audit("pause", actor, reason);
    }

    pub fn resume(&self, actor: &str, reason: &str) {
        self.paused.store(false, Ordering::SeqCst);
        self.pause_changed.notify_waiters();
        self.audit("resume", actor, reason);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Blocks the calling (orchestrator) task until the pause gate is clear.
    pub async fn wait_until_resumed(&self) {
        loop {
            if !self.is_paused() {
                return;
            }
            self.pause_changed.notified().await;
        }
    }

    pub fn force_scan(&self, actor: &str, reason: &str) -> ForceScanResult {
        if self.is_paused() {
            self.audit("force_scan_rejected", actor, reason);
            return ForceScanResult { queued: false, reason: Some("paused".to_string()) };
        }
        self.force_event.notify_waiters();
        self.audit("force_scan", actor, reason);
        ForceScanResult { queued: true, reason: None }
    }

    /// Sleeps for `duration`, waking early if a force-scan arrives.
    pub async fn sleep_or_force(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.force_event.notified() => {}
        }
    }

    pub fn set_manual_breaker(&self, state: ManualBreakerState, actor: &str, reason: &str) {
        let mut breaker = self.breaker.lock();
        breaker.state = state;
        breaker.last_reason = Some(reason.to_string());
        breaker.updated_at = Some(Utc::now());
        drop(breaker);
        self.audit("set_breaker", actor, format!("{reason} -> {state:?}"));
    }

    pub fn manual_breaker_open(&self) -> bool {
        self.breaker.lock().state == ManualBreakerState::Open
    }

    fn breaker_snapshot(&self) -> BreakerSnapshot {
        let breaker = self.breaker.lock();
        BreakerSnapshot {
            manual_state: breaker.state,
            last_reason: breaker.last_reason.clone(),
            updated_at: breaker.updated_at,
        }
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().iter().cloned().collect()
    }

    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.health.load_full()
    }

    /// Atomically replaces the health snapshot (spec §5: "atomic swap on the
    /// struct pointer"). `f` receives a deep copy of the current snapshot to
    /// mutate; the result becomes the new live snapshot.
    pub fn update_health(&self, f: impl FnOnce(&mut HealthSnapshot)) {
        let mut next = (**self.health.load()).clone();
        f(&mut next);
        if next.durations_ms.len() > DURATION_WINDOW {
            let drop_count = next.durations_ms.len() - DURATION_WINDOW;
            next.durations_ms.drain(0..drop_count);
        }
        self.health.store(Arc::new(next));
    }

    pub fn get_health_report(&self) -> HealthReport {
        let health = (*self.health()).clone();
        let status = if health.is_degraded() { "degraded" } else { "ok" };
        HealthReport {
            status,
            control: ControlSnapshot { paused: self.is_paused(), breaker: self.breaker_snapshot() },
            health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            exchange: "binance".into(),
            symbols: vec![],
            scan_interval_sec: 30,
            scan_concurrency: 8,
            scan_top_by_qvol: 150,
            topn_default: 50,
            markets_cache_ttl_sec: 3600,
            adapter_timeout_sec: 5,
            adapter_max_failures: 5,
            adapter_cooldown_sec: 60,
            min_qvol_usdt: 25_000_000.0,
            max_spread_bps: 15.0,
            notional_test: 10_000.0,
            include_carry: true,
            profile_default: "scalp".into(),
            manipulation_threshold: None,
            scan_sla_warn_multiplier: 1.5,
            scan_sla_critical_multiplier: 3.0,
            admin_api_token: "token".into(),
            webhook_url: None,
            pubsub_channel: None,
            bind_addr: "0.0.0.0:8090".into(),
        }
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let cp = ControlPlane::new(&config());
        cp.pause("tester", "maintenance");
        cp.pause("tester", "maintenance again");
        assert!(cp.is_paused());
        cp.resume("tester", "done");
        cp.resume("tester", "done again");
        assert!(!cp.is_paused());
    }

    #[test]
    fn force_scan_rejected_while_paused() {
        let cp = ControlPlane::new(&config());
        cp.pause("tester", "maintenance");
        let result = cp.force_scan("tester", "now");
        assert!(!result.queued);
        assert_eq!(result.reason.as_deref(), Some("paused"));
    }

    #[test]
    fn audit_log_is_capped() {
        let cp = ControlPlane::new(&config());
        for i in 0..(AUDIT_WINDOW + 10) {
            cp.pause("tester", &format!("reason-{i}"));
            cp.resume("tester", &format!("reason-{i}"));
        }
        assert_eq!(cp.audit_log().len(), AUDIT_WINDOW);
    }

    #[test]
    fn health_report_is_degraded_on_failure_streak() {
        let cp = ControlPlane::new(&config());
        cp.update_health(|h| h.failure_streak = 3);
        let report = cp.get_health_report();
        assert_eq!(report.status, "degraded");
    }

    #[test]
    fn manual_breaker_defaults_closed() {
        let cp = ControlPlane::new(&config());
        assert!(!cp.manual_breaker_open());
        cp.set_manual_breaker(ManualBreakerState::Open, "tester", "incident");
        assert!(cp.manual_breaker_open());
    }
}
