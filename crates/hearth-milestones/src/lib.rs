// Milestone evaluation against the shared state.
//
// Unlocks are recorded in a global set; the set-add result is the race
// arbiter, so a milestone fires exactly once cluster-wide no matter how many
// nodes evaluate the same snapshot.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hearth_common::{MilestoneRecord, StateSnapshot};
use hearth_state::{keys, Result, StateStore, WriteOp};

pub mod catalog;

pub use catalog::{MilestoneDef, CATALOG, SIGNIFICANT_PEAKS};

const PEAK_HISTORY_RETENTION_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct Engine {
    store: Arc<dyn StateStore>,
}

impl Engine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Evaluate the catalog against a snapshot and return the milestones this
    /// call newly unlocked. The caller fans the records out; losing a set-add
    /// race to another node is silent.
    ///
    /// Any store failure aborts the evaluation; the next tick retries with a
    /// fresh snapshot.
    pub async fn evaluate(&self, snapshot: StateSnapshot) -> Result<Vec<MilestoneRecord>> {
        let prior_peak = self
            .store
            .get_int(keys::PEAK_CONNECTIONS)
            .await?
            .unwrap_or(0)
            .max(0) as u64;

        if snapshot.concurrent_connections > prior_peak {
            self.record_peak(snapshot.concurrent_connections).await?;
        }

        let already: HashSet<String> = self
            .store
            .set_members(keys::UNLOCKED_MILESTONES)
            .await?
            .into_iter()
            .collect();

        let mut unlocked = Vec::new();
        for def in &CATALOG {
            if already.contains(def.id) || !def.holds(&snapshot, prior_peak) {
                continue;
            }
            if self
                .store
                .set_add(keys::UNLOCKED_MILESTONES, def.id)
                .await?
            {
                tracing::info!(milestone = def.id, "milestone unlocked");
                unlocked.push(def.to_record());
            }
            // A false result means another node won the race.
        }
        Ok(unlocked)
    }

    /// Unlocked milestones as full records, for the welcome payload and the
    /// progress endpoint. Identifiers no longer in the catalog are skipped.
    pub async fn unlocked_records(&self) -> Result<Vec<MilestoneRecord>> {
        let mut ids = self.store.set_members(keys::UNLOCKED_MILESTONES).await?;
        ids.sort();
        Ok(ids
            .iter()
            .filter_map(|id| catalog::find(id))
            .map(|def| def.to_record())
            .collect())
    }

    // New peak: store it, append the history point, and prune entries older
    // than the retention window, all as one atomic group.
    async fn record_peak(&self, peak: u64) -> Result<()> {
        let now = unix_now();
        let cutoff = now.saturating_sub(PEAK_HISTORY_RETENTION_SECS);
        self.store
            .atomic(&[
                WriteOp::Set {
                    key: keys::PEAK_CONNECTIONS.to_string(),
                    value: peak.to_string(),
                },
                WriteOp::SortedAdd {
                    key: keys::PEAK_HISTORY.to_string(),
                    score: now as f64,
                    member: format!("{now}:{peak}"),
                },
                WriteOp::SortedRemoveByScore {
                    key: keys::PEAK_HISTORY.to_string(),
                    min: 0.0,
                    max: cutoff as f64,
                },
            ])
            .await?;
        tracing::info!(peak, "new peak recorded");
        Ok(())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
