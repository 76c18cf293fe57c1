// Shared protocol types used across crates.
use serde::{Deserialize, Serialize};

/// The global counters every client observes.
///
/// Snapshots taken by different paths (tick, admit, leave) may interleave,
/// so consumers must tolerate a later message carrying an older live count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub concurrent_connections: u64,
    pub total_connection_seconds: u64,
    pub peak_connections: u64,
}

// Milestone predicate class, carried on the wire as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneKind {
    Concurrent,
    Time,
    Compound,
}

/// A milestone as clients see it: identity plus the threshold when the
/// predicate is a simple one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: MilestoneKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
}

/// Everything the server sends down a client socket. Clients send nothing
/// meaningful back, so there is no inbound counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        concurrent_connections: u64,
        total_connection_seconds: u64,
        peak_connections: u64,
        unlocked_milestones: Vec<MilestoneRecord>,
    },
    StateUpdate {
        concurrent_connections: u64,
        total_connection_seconds: u64,
        peak_connections: u64,
    },
    EvolutionEvent {
        milestone: MilestoneRecord,
    },
    ShutdownWarning {
        message: String,
        // Milliseconds the client should wait before reconnecting elsewhere.
        reconnect_delay: u64,
    },
}

impl ServerMessage {
    pub fn state_update(snapshot: StateSnapshot) -> Self {
        Self::StateUpdate {
            concurrent_connections: snapshot.concurrent_connections,
            total_connection_seconds: snapshot.total_connection_seconds,
            peak_connections: snapshot.peak_connections,
        }
    }

    /// State updates supersede each other and may be coalesced when a
    /// client falls behind; everything else must be delivered or the
    /// client dropped.
    pub fn is_coalescable(&self) -> bool {
        matches!(self, Self::StateUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_update_round_trips_as_tagged_json() {
        let msg = ServerMessage::state_update(StateSnapshot {
            concurrent_connections: 3,
            total_connection_seconds: 120,
            peak_connections: 5,
        });
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "state_update");
        assert_eq!(json["concurrent_connections"], 3);
        assert_eq!(json["total_connection_seconds"], 120);
        assert_eq!(json["peak_connections"], 5);
        let back: ServerMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn milestone_kind_serializes_as_type_field() {
        let record = MilestoneRecord {
            id: "first_awakening".to_string(),
            name: "First Awakening".to_string(),
            description: "The first soul arrives.".to_string(),
            kind: MilestoneKind::Concurrent,
            threshold: Some(1),
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["type"], "concurrent");
        assert_eq!(json["threshold"], 1);
    }

    #[test]
    fn compound_milestone_omits_threshold() {
        let record = MilestoneRecord {
            id: "peak_leap".to_string(),
            name: "Peak Leap".to_string(),
            description: "A new order of magnitude.".to_string(),
            kind: MilestoneKind::Compound,
            threshold: None,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json.get("threshold").is_none());
    }

    #[test]
    fn only_state_updates_coalesce() {
        let update = ServerMessage::state_update(StateSnapshot::default());
        assert!(update.is_coalescable());
        let warning = ServerMessage::ShutdownWarning {
            message: "server restarting".to_string(),
            reconnect_delay: 5000,
        };
        assert!(!warning.is_coalescable());
    }
}
