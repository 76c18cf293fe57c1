// The periodic time accumulator.
//
// Exactly one node in the cluster runs this task (election is external; the
// leader carries the tick flag). Each tick credits live-count x elapsed
// seconds into the accumulated total, evaluates milestones against the fresh
// snapshot, and broadcasts a state update to every client in the cluster.
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hearth_common::{ServerMessage, StateSnapshot};
use hearth_milestones::Engine;
use hearth_state::{keys, StateStore, StoreError};
use serde::Serialize;
use tokio::sync::watch;

use crate::fanout::Fanout;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub last_tick_unix_ms: u64,
    pub last_live: u64,
    pub last_total: u64,
}

impl TickStats {
    /// Freshness gate for readiness: the engine is healthy while ticks land
    /// within three periods. Before the first tick the engine gets the
    /// benefit of the doubt (the process just started).
    pub fn is_fresh(&self, interval: Duration) -> bool {
        if self.last_tick_unix_ms == 0 {
            return true;
        }
        let now = unix_now_ms();
        now.saturating_sub(self.last_tick_unix_ms) <= interval.as_millis() as u64 * 3
    }
}

#[derive(Debug)]
pub struct TickEngine {
    store: Arc<dyn StateStore>,
    milestones: Engine,
    fanout: Fanout,
    interval: Duration,
    stats_tx: watch::Sender<TickStats>,
}

impl TickEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        milestones: Engine,
        fanout: Fanout,
        interval: Duration,
    ) -> (Self, watch::Receiver<TickStats>) {
        let (stats_tx, stats_rx) = watch::channel(TickStats::default());
        (
            Self {
                store,
                milestones,
                fanout,
                interval,
                stats_tx,
            },
            stats_rx,
        )
    }

    pub async fn run(self) {
        let mut last_tick_ms = unix_now_ms();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the first real
        // tick lands one full period after start.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.tick_once(&mut last_tick_ms).await;
        }
    }

    /// One accumulation step. Public so the drive logic is testable without
    /// waiting out real tick periods.
    pub async fn tick_once(&self, last_tick_ms: &mut u64) {
        let now = unix_now_ms();
        // Never zero: a live count always contributes something, and a
        // suspended node credits the gap it slept through.
        let elapsed_secs = (now.saturating_sub(*last_tick_ms) / 1_000).max(1);
        // Advance unconditionally. A failed tick under-counts one period,
        // which is acceptable; re-crediting the same window is not.
        *last_tick_ms = now;
        let interval_secs = self.interval.as_secs().max(1);

        let live = match self.store.get_int(keys::CONCURRENT_CONNECTIONS).await {
            Ok(value) => value.unwrap_or(0).max(0) as u64,
            Err(err) => return self.skip(now, err),
        };

        let total = if live > 0 {
            let delta = live.saturating_mul(elapsed_secs.max(interval_secs));
            match self
                .store
                .incr_by(keys::TOTAL_CONNECTION_SECONDS, delta as i64)
                .await
            {
                Ok(new_total) => new_total.max(0) as u64,
                Err(err) => return self.skip(now, err),
            }
        } else {
            match self.store.get_int(keys::TOTAL_CONNECTION_SECONDS).await {
                Ok(value) => value.unwrap_or(0).max(0) as u64,
                Err(err) => return self.skip(now, err),
            }
        };

        let snapshot = StateSnapshot {
            concurrent_connections: live,
            total_connection_seconds: total,
            peak_connections: live,
        };
        match self.milestones.evaluate(snapshot).await {
            Ok(unlocked) => {
                for milestone in unlocked {
                    if let Err(err) = self
                        .fanout
                        .publish(ServerMessage::EvolutionEvent { milestone })
                        .await
                    {
                        tracing::warn!(error = %err, "milestone broadcast failed");
                    }
                }
            }
            // Next tick retries with a fresh snapshot.
            Err(err) => tracing::warn!(error = %err, "milestone evaluation skipped"),
        }

        // The evaluation above may have raised the peak.
        let peak = self
            .store
            .get_int(keys::PEAK_CONNECTIONS)
            .await
            .ok()
            .flatten()
            .unwrap_or(0)
            .max(0) as u64;
        let broadcast = StateSnapshot {
            peak_connections: peak.max(live),
            ..snapshot
        };
        if let Err(err) = self
            .fanout
            .publish(ServerMessage::state_update(broadcast))
            .await
        {
            tracing::warn!(error = %err, "state update broadcast failed");
        }

        self.stats_tx.send_modify(|stats| {
            stats.ticks_run += 1;
            stats.last_tick_unix_ms = now;
            stats.last_live = live;
            stats.last_total = total;
        });
        metrics::counter!("hearth_ticks_total").increment(1);
        metrics::gauge!("hearth_concurrent_connections").set(live as f64);
    }

    fn skip(&self, now: u64, err: StoreError) {
        tracing::warn!(error = %err, "tick skipped on store failure");
        metrics::counter!("hearth_ticks_skipped_total").increment(1);
        self.stats_tx.send_modify(|stats| {
            stats.ticks_skipped += 1;
            stats.last_tick_unix_ms = now;
        });
    }
}

pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
