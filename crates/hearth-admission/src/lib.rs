// Admission control for new connections: a rolling per-source minute window,
// a global per-second ceiling, and a hard capacity check against the store.
//
// The in-memory tables are single-writer behind a mutex. The mutex is never
// held across the store call; a capacity read against a failing store admits
// (the store is not the source of truth for liveness, and refusing during an
// outage would amplify it).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hearth_state::{keys, StateStore};
use serde::Serialize;

const SOURCE_WINDOW_SECS: u64 = 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdmissionConfig {
    pub max_per_source_per_minute: u32,
    pub max_global_per_second: u32,
    pub max_global: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_per_source_per_minute: 60,
            max_global_per_second: 1_000,
            max_global: 10_000_000,
        }
    }
}

/// Partial override applied by `reconfigure`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionUpdate {
    pub max_per_source_per_minute: Option<u32>,
    pub max_global_per_second: Option<u32>,
    pub max_global: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SourceRateLimited,
    GlobalRateLimited,
    CapacityExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceRateLimited => "source_rate_limited",
            Self::GlobalRateLimited => "global_rate_limited",
            Self::CapacityExceeded => "capacity_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdmissionStats {
    pub total_checks: u64,
    pub admitted: u64,
    pub rate_limited_sources: u64,
    pub rate_limited_global: u64,
    pub capacity_rejected: u64,
    pub store_failures_open: u64,
    pub config: AdmissionConfig,
}

#[derive(Debug, Default)]
struct Tables {
    // source id -> admit timestamps (unix seconds) within the window
    per_source: HashMap<String, Vec<u64>>,
    // (second, admits recorded within it)
    global_second: (u64, u32),
}

#[derive(Debug)]
pub struct AdmissionController {
    store: Arc<dyn StateStore>,
    config: Mutex<AdmissionConfig>,
    tables: Mutex<Tables>,
    total_checks: AtomicU64,
    admitted: AtomicU64,
    rate_limited_sources: AtomicU64,
    rate_limited_global: AtomicU64,
    capacity_rejected: AtomicU64,
    store_failures_open: AtomicU64,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn StateStore>, config: AdmissionConfig) -> Self {
        Self {
            store,
            config: Mutex::new(config),
            tables: Mutex::new(Tables::default()),
            total_checks: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            rate_limited_sources: AtomicU64::new(0),
            rate_limited_global: AtomicU64::new(0),
            capacity_rejected: AtomicU64::new(0),
            store_failures_open: AtomicU64::new(0),
        }
    }

    pub async fn check(&self, source_id: &str) -> Decision {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        let config = self.current_config();
        let now = unix_now();

        {
            let tables = self.lock_tables();
            let cutoff = now.saturating_sub(SOURCE_WINDOW_SECS);
            let recent = tables
                .per_source
                .get(source_id)
                .map(|stamps| stamps.iter().filter(|stamp| **stamp > cutoff).count())
                .unwrap_or(0);
            if recent >= config.max_per_source_per_minute as usize {
                return self.reject(RejectReason::SourceRateLimited);
            }

            // A new wall second implicitly resets the global cell.
            let (second, count) = tables.global_second;
            if second == now && count >= config.max_global_per_second {
                return self.reject(RejectReason::GlobalRateLimited);
            }
        }
        // Table lock released: the store read may suspend.

        match self.store.get_int(keys::CONCURRENT_CONNECTIONS).await {
            Ok(value) => {
                if value.unwrap_or(0).max(0) as u64 >= config.max_global {
                    return self.reject(RejectReason::CapacityExceeded);
                }
            }
            Err(err) => {
                // Fail open: admission must not turn a store outage into a
                // connection outage.
                tracing::warn!(error = %err, "capacity check failed, admitting");
                self.store_failures_open.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hearth_admission_capacity_check_failures_total").increment(1);
            }
        }

        self.admitted.fetch_add(1, Ordering::Relaxed);
        Decision::Allowed
    }

    /// Commit an admit that `check` allowed into both tables.
    pub fn record(&self, source_id: &str) {
        let now = unix_now();
        let mut tables = self.lock_tables();
        tables
            .per_source
            .entry(source_id.to_string())
            .or_default()
            .push(now);
        if tables.global_second.0 == now {
            tables.global_second.1 += 1;
        } else {
            tables.global_second = (now, 1);
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rate_limited_sources: self.rate_limited_sources.load(Ordering::Relaxed),
            rate_limited_global: self.rate_limited_global.load(Ordering::Relaxed),
            capacity_rejected: self.capacity_rejected.load(Ordering::Relaxed),
            store_failures_open: self.store_failures_open.load(Ordering::Relaxed),
            config: self.current_config(),
        }
    }

    /// Hot-swap the limits; absent fields keep their current value.
    pub fn reconfigure(&self, update: AdmissionUpdate) {
        let mut config = self
            .config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(value) = update.max_per_source_per_minute {
            config.max_per_source_per_minute = value;
        }
        if let Some(value) = update.max_global_per_second {
            config.max_global_per_second = value;
        }
        if let Some(value) = update.max_global {
            config.max_global = value;
        }
        tracing::info!(
            max_per_source_per_minute = config.max_per_source_per_minute,
            max_global_per_second = config.max_global_per_second,
            max_global = config.max_global,
            "admission limits reconfigured"
        );
    }

    /// Drop stale window entries. Runs on the sweeper cadence; also callable
    /// directly.
    pub fn sweep(&self) {
        let now = unix_now();
        let cutoff = now.saturating_sub(SOURCE_WINDOW_SECS);
        let mut tables = self.lock_tables();
        tables.per_source.retain(|_, stamps| {
            stamps.retain(|stamp| *stamp > cutoff);
            !stamps.is_empty()
        });
        if tables.global_second.0 < now {
            tables.global_second = (0, 0);
        }
    }

    pub fn run_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    fn reject(&self, reason: RejectReason) -> Decision {
        let counter = match reason {
            RejectReason::SourceRateLimited => &self.rate_limited_sources,
            RejectReason::GlobalRateLimited => &self.rate_limited_global,
            RejectReason::CapacityExceeded => &self.capacity_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hearth_admissions_rejected_total", "reason" => reason.as_str())
            .increment(1);
        Decision::Rejected(reason)
    }

    fn current_config(&self) -> AdmissionConfig {
        *self
            .config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn backdate_source(&self, source_id: &str, seconds: u64) {
        let mut tables = self.lock_tables();
        if let Some(stamps) = tables.per_source.get_mut(source_id) {
            for stamp in stamps.iter_mut() {
                *stamp = stamp.saturating_sub(seconds);
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_state::MemoryStore;

    fn controller_with(config: AdmissionConfig) -> (Arc<AdmissionController>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(AdmissionController::new(store.clone(), config));
        (controller, store)
    }

    #[tokio::test]
    async fn fourth_admit_from_one_source_is_refused() {
        let (controller, _store) = controller_with(AdmissionConfig {
            max_per_source_per_minute: 3,
            ..AdmissionConfig::default()
        });
        for _ in 0..3 {
            assert_eq!(controller.check("5.6.7.8").await, Decision::Allowed);
            controller.record("5.6.7.8");
        }
        assert_eq!(
            controller.check("5.6.7.8").await,
            Decision::Rejected(RejectReason::SourceRateLimited)
        );
        let stats = controller.stats();
        assert_eq!(stats.rate_limited_sources, 1);
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.total_checks, 4);
    }

    #[tokio::test]
    async fn sources_are_limited_independently() {
        let (controller, _store) = controller_with(AdmissionConfig {
            max_per_source_per_minute: 1,
            ..AdmissionConfig::default()
        });
        assert_eq!(controller.check("1.1.1.1").await, Decision::Allowed);
        controller.record("1.1.1.1");
        assert_eq!(
            controller.check("1.1.1.1").await,
            Decision::Rejected(RejectReason::SourceRateLimited)
        );
        assert_eq!(controller.check("2.2.2.2").await, Decision::Allowed);
    }

    #[tokio::test]
    async fn global_ceiling_applies_across_sources() {
        let (controller, _store) = controller_with(AdmissionConfig {
            max_global_per_second: 2,
            ..AdmissionConfig::default()
        });
        controller.record("1.1.1.1");
        controller.record("2.2.2.2");
        assert_eq!(
            controller.check("3.3.3.3").await,
            Decision::Rejected(RejectReason::GlobalRateLimited)
        );
        assert_eq!(controller.stats().rate_limited_global, 1);
    }

    #[tokio::test]
    async fn capacity_rejects_at_the_configured_cap() {
        let (controller, store) = controller_with(AdmissionConfig {
            max_global: 5,
            ..AdmissionConfig::default()
        });
        store
            .set(keys::CONCURRENT_CONNECTIONS, "5")
            .await
            .expect("set");
        assert_eq!(
            controller.check("1.2.3.4").await,
            Decision::Rejected(RejectReason::CapacityExceeded)
        );
        assert_eq!(controller.stats().capacity_rejected, 1);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let (controller, store) = controller_with(AdmissionConfig::default());
        store.set_failing(true);
        assert_eq!(controller.check("1.2.3.4").await, Decision::Allowed);
        assert_eq!(controller.stats().store_failures_open, 1);
    }

    #[tokio::test]
    async fn sweep_forgets_expired_sources() {
        let (controller, _store) = controller_with(AdmissionConfig {
            max_per_source_per_minute: 1,
            ..AdmissionConfig::default()
        });
        assert_eq!(controller.check("9.9.9.9").await, Decision::Allowed);
        controller.record("9.9.9.9");
        assert_eq!(
            controller.check("9.9.9.9").await,
            Decision::Rejected(RejectReason::SourceRateLimited)
        );
        // Age the admit past the window; the sweeper drops it and the source
        // is admitted again.
        controller.backdate_source("9.9.9.9", SOURCE_WINDOW_SECS + 5);
        controller.sweep();
        assert_eq!(controller.check("9.9.9.9").await, Decision::Allowed);
    }

    #[tokio::test]
    async fn reconfigure_applies_partial_overrides() {
        let (controller, _store) = controller_with(AdmissionConfig::default());
        controller.reconfigure(AdmissionUpdate {
            max_per_source_per_minute: Some(2),
            max_global: Some(100),
            ..AdmissionUpdate::default()
        });
        let config = controller.stats().config;
        assert_eq!(config.max_per_source_per_minute, 2);
        assert_eq!(config.max_global_per_second, 1_000);
        assert_eq!(config.max_global, 100);
    }
}
