//! Health Monitor (C3): per-backend liveness, failure counts, quarantine.
//!
//! The state machine and thresholds are specific to this system (3 states,
//! not the teacher's circuit-breaker-plus-auto-restart design in
//! `backend::health`), but the per-backend `DashMap` + record_success/
//! record_failure idiom, and the background sweep task shape, are both
//! carried over from it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Degraded,
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKindSnapshot {
    Transient,
    Permanent,
}

/// A point-in-time copy of one backend's health, safe to hand to readers
/// without holding any lock (§5: "readers take a snapshot").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: Status,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_failure_at: Option<Instant>,
    pub last_failure_kind: Option<FailureKindSnapshot>,
    pub p50_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
}

struct BackendHealth {
    status: Status,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_failure_kind: Option<FailureKindSnapshot>,
    quarantined_since: Option<Instant>,
    latency: Histogram<u64>,
}

impl BackendHealth {
    fn new() -> Self {
        Self {
            status: Status::Healthy,
            consecutive_failures: 0,
            last_failure_at: None,
            last_failure_kind: None,
            quarantined_since: None,
            // 1ms .. 60s range, 2 significant figures — enough for p50/p99 without
            // meaningfully bloating memory per backend.
            latency: Histogram::new_with_bounds(1, 60_000, 2).expect("valid histogram bounds"),
        }
    }

    fn record_success(&mut self, latency: Duration) {
        self.status = Status::Healthy;
        self.consecutive_failures = 0;
        self.last_failure_kind = None;
        self.quarantined_since = None;
        let _ = self.latency.record(latency.as_millis().max(1) as u64);
    }

    fn record_failure(&mut self, kind: FailureKind, threshold: u32) {
        self.last_failure_at = Some(Instant::now());
        match kind {
            FailureKind::Transient => {
                self.last_failure_kind = Some(FailureKindSnapshot::Transient);
                self.consecutive_failures += 1;
                self.status = if self.consecutive_failures >= threshold {
                    self.quarantined_since = Some(Instant::now());
                    Status::Quarantined
                } else {
                    Status::Degraded
                };
            }
            FailureKind::Permanent => {
                self.last_failure_kind = Some(FailureKindSnapshot::Permanent);
                self.quarantined_since = Some(Instant::now());
                self.status = Status::Quarantined;
            }
        }
    }

    fn auto_reset_if_due(&mut self, cooloff: Duration) {
        if self.status == Status::Quarantined
            && let Some(since) = self.quarantined_since
            && since.elapsed() >= cooloff
        {
            self.status = Status::Degraded;
            self.quarantined_since = None;
        }
    }

    fn snapshot(&self) -> HealthState {
        HealthState {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            last_failure_kind: self.last_failure_kind,
            p50_latency_ms: (self.latency.len() > 0).then(|| self.latency.value_at_quantile(0.50) as f64),
            p99_latency_ms: (self.latency.len() > 0).then(|| self.latency.value_at_quantile(0.99) as f64),
        }
    }
}

/// Tracks health for every known backend. `quarantine_threshold` (K) and
/// `quarantine_cooloff` (T_q) come from `HealthConfig` (§4.3).
pub struct HealthMonitor {
    backends: DashMap<String, Mutex<BackendHealth>>,
    quarantine_threshold: u32,
    quarantine_cooloff: Duration,
}

impl HealthMonitor {
    pub fn new(quarantine_threshold: u32, quarantine_cooloff: Duration) -> Self {
        Self {
            backends: DashMap::new(),
            quarantine_threshold,
            quarantine_cooloff,
        }
    }

    fn entry(&self, backend: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<BackendHealth>> {
        self.backends
            .entry(backend.to_string())
            .or_insert_with(|| Mutex::new(BackendHealth::new()));
        self.backends.get(backend).expect("just inserted")
    }

    pub async fn record_success(&self, backend: &str, latency: Duration) {
        let entry = self.entry(backend);
        let mut health = entry.lock().await;
        health.record_success(latency);
    }

    pub async fn record_failure(&self, backend: &str, kind: FailureKind) {
        let entry = self.entry(backend);
        let mut health = entry.lock().await;
        health.record_failure(kind, self.quarantine_threshold);
        if health.status == Status::Quarantined {
            warn!(backend, "backend quarantined");
        }
    }

    pub async fn is_quarantined(&self, backend: &str) -> bool {
        let entry = self.entry(backend);
        let mut health = entry.lock().await;
        health.auto_reset_if_due(self.quarantine_cooloff);
        health.status == Status::Quarantined
    }

    pub async fn snapshot(&self, backend: &str) -> Option<HealthState> {
        let entry = self.backends.get(backend)?;
        let mut health = entry.lock().await;
        health.auto_reset_if_due(self.quarantine_cooloff);
        Some(health.snapshot())
    }

    /// `health()` upstream operation (§6): a snapshot per known backend.
    pub async fn snapshot_all(&self) -> HashMap<String, HealthState> {
        let names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            if let Some(state) = self.snapshot(&name).await {
                out.insert(name, state);
            }
        }
        out
    }

    pub fn remove(&self, backend: &str) {
        self.backends.remove(backend);
    }

    async fn status_of(&self, backend: &str) -> Option<Status> {
        let entry = self.backends.get(backend)?;
        let mut health = entry.lock().await;
        health.auto_reset_if_due(self.quarantine_cooloff);
        Some(health.status)
    }

    /// Background sweep: auto-resets quarantined backends past their
    /// cool-off, and actively probes every `Degraded` backend with a
    /// lightweight `listTools` call through the pool, restoring it to
    /// `Healthy` on success (§4.3) rather than waiting for the next real
    /// invocation to happen to land on it.
    pub async fn run_sweep(
        &self,
        interval: Duration,
        shutdown: std::sync::Arc<tokio::sync::Notify>,
        pool: std::sync::Arc<crate::pool::Pool>,
        profile: std::sync::Arc<crate::profile::ProfileStore>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.notified() => {
                    info!("health sweep shutting down");
                    return;
                }
            }
            let names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
            for name in &names {
                self.is_quarantined(name).await;
            }
            for name in &names {
                if self.status_of(name).await != Some(Status::Degraded) {
                    continue;
                }
                let Ok(spec) = profile.get(name).await else {
                    continue;
                };
                match pool.acquire(name, &spec, self).await {
                    Ok(mut conn) => match conn.channel_mut().list_tools().await {
                        Ok(_) => {
                            info!(backend = %name, "degraded backend probe succeeded, restoring to healthy");
                            self.record_success(name, Duration::from_millis(0)).await;
                            pool.release(conn).await;
                        }
                        Err(e) => {
                            self.record_failure(name, e.failure_kind()).await;
                            pool.discard(conn).await;
                        }
                    },
                    Err(e) => {
                        self.record_failure(name, e.failure_kind()).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_healthy() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        assert!(!monitor.is_quarantined("fs").await);
    }

    #[tokio::test]
    async fn three_transient_failures_quarantine() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        for _ in 0..3 {
            monitor.record_failure("fs", FailureKind::Transient).await;
        }
        assert!(monitor.is_quarantined("fs").await);
    }

    #[tokio::test]
    async fn two_transient_failures_stay_degraded() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        monitor.record_failure("fs", FailureKind::Transient).await;
        monitor.record_failure("fs", FailureKind::Transient).await;
        assert!(!monitor.is_quarantined("fs").await);
        let snap = monitor.snapshot("fs").await.unwrap();
        assert_eq!(snap.status, Status::Degraded);
    }

    #[tokio::test]
    async fn permanent_failure_quarantines_immediately() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        monitor.record_failure("fs", FailureKind::Permanent).await;
        assert!(monitor.is_quarantined("fs").await);
    }

    #[tokio::test]
    async fn success_resets_to_healthy_from_any_state() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        monitor.record_failure("fs", FailureKind::Permanent).await;
        assert!(monitor.is_quarantined("fs").await);
        monitor.record_success("fs", Duration::from_millis(10)).await;
        assert!(!monitor.is_quarantined("fs").await);
        let snap = monitor.snapshot("fs").await.unwrap();
        assert_eq!(snap.status, Status::Healthy);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn auto_reset_after_cooloff() {
        let monitor = HealthMonitor::new(1, Duration::from_millis(10));
        monitor.record_failure("fs", FailureKind::Permanent).await;
        assert!(monitor.is_quarantined("fs").await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_quarantined("fs").await);
        let snap = monitor.snapshot("fs").await.unwrap();
        assert_eq!(snap.status, Status::Degraded);
    }

    #[tokio::test]
    async fn latency_percentiles_available_after_success() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        monitor.record_success("fs", Duration::from_millis(5)).await;
        monitor.record_success("fs", Duration::from_millis(15)).await;
        let snap = monitor.snapshot("fs").await.unwrap();
        assert!(snap.p50_latency_ms.is_some());
        assert!(snap.p99_latency_ms.is_some());
    }

    #[tokio::test]
    async fn snapshot_all_includes_every_known_backend() {
        let monitor = HealthMonitor::new(3, Duration::from_secs(600));
        monitor.record_success("fs", Duration::from_millis(1)).await;
        monitor.record_success("gh", Duration::from_millis(1)).await;
        let all = monitor.snapshot_all().await;
        assert_eq!(all.len(), 2);
    }
}
