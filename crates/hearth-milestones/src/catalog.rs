// The compiled milestone catalog. Immutable after startup and read
// concurrently without synchronization.
use hearth_common::{MilestoneKind, MilestoneRecord, StateSnapshot};

/// Peak thresholds that count as a "leap" when crossed for the first time.
pub const SIGNIFICANT_PEAKS: [u64; 6] = [10, 100, 1_000, 10_000, 100_000, 1_000_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Fires when the live count reaches the threshold.
    Concurrent(u64),
    /// Fires when accumulated connection-seconds reach the threshold.
    Time(u64),
    /// live >= `live` held together with accumulated time >= `seconds`.
    Sustained { live: u64, seconds: u64 },
    /// The live count crosses a significant threshold the prior peak
    /// had not yet reached.
    PeakLeap,
}

#[derive(Debug, Clone, Copy)]
pub struct MilestoneDef {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub predicate: Predicate,
}

impl MilestoneDef {
    pub fn kind(&self) -> MilestoneKind {
        match self.predicate {
            Predicate::Concurrent(_) => MilestoneKind::Concurrent,
            Predicate::Time(_) => MilestoneKind::Time,
            Predicate::Sustained { .. } | Predicate::PeakLeap => MilestoneKind::Compound,
        }
    }

    pub fn threshold(&self) -> Option<u64> {
        match self.predicate {
            Predicate::Concurrent(n) | Predicate::Time(n) => Some(n),
            Predicate::Sustained { .. } | Predicate::PeakLeap => None,
        }
    }

    /// Evaluate against a snapshot. `prior_peak` is the peak recorded before
    /// this snapshot was taken; only the peak-leap predicate reads it.
    pub fn holds(&self, snapshot: &StateSnapshot, prior_peak: u64) -> bool {
        match self.predicate {
            Predicate::Concurrent(n) => snapshot.concurrent_connections >= n,
            Predicate::Time(n) => snapshot.total_connection_seconds >= n,
            Predicate::Sustained { live, seconds } => {
                snapshot.concurrent_connections >= live
                    && snapshot.total_connection_seconds >= seconds
            }
            Predicate::PeakLeap => SIGNIFICANT_PEAKS
                .iter()
                .any(|&t| snapshot.concurrent_connections >= t && prior_peak < t),
        }
    }

    pub fn to_record(&self) -> MilestoneRecord {
        MilestoneRecord {
            id: self.id.to_string(),
            name: self.name.to_string(),
            description: self.description.to_string(),
            kind: self.kind(),
            threshold: self.threshold(),
        }
    }
}

pub const CATALOG: [MilestoneDef; 17] = [
    MilestoneDef {
        id: "first_awakening",
        name: "First Awakening",
        description: "The first soul arrives.",
        predicate: Predicate::Concurrent(1),
    },
    MilestoneDef {
        id: "gathering_of_ten",
        name: "Gathering of Ten",
        description: "Ten souls present at once.",
        predicate: Predicate::Concurrent(10),
    },
    MilestoneDef {
        id: "hundred_gathered",
        name: "A Hundred Gathered",
        description: "One hundred souls present at once.",
        predicate: Predicate::Concurrent(100),
    },
    MilestoneDef {
        id: "thousand_strong",
        name: "A Thousand Strong",
        description: "One thousand souls present at once.",
        predicate: Predicate::Concurrent(1_000),
    },
    MilestoneDef {
        id: "ten_thousand_voices",
        name: "Ten Thousand Voices",
        description: "Ten thousand souls present at once.",
        predicate: Predicate::Concurrent(10_000),
    },
    MilestoneDef {
        id: "hundred_thousand_souls",
        name: "A Hundred Thousand Souls",
        description: "One hundred thousand souls present at once.",
        predicate: Predicate::Concurrent(100_000),
    },
    MilestoneDef {
        id: "million_concurrent",
        name: "One Million Together",
        description: "A million souls present at once.",
        predicate: Predicate::Concurrent(1_000_000),
    },
    MilestoneDef {
        id: "first_minute",
        name: "First Minute",
        description: "A minute of shared time accumulated.",
        predicate: Predicate::Time(60),
    },
    MilestoneDef {
        id: "first_hour",
        name: "First Hour",
        description: "An hour of shared time accumulated.",
        predicate: Predicate::Time(3_600),
    },
    MilestoneDef {
        id: "first_day",
        name: "First Day",
        description: "A day of shared time accumulated.",
        predicate: Predicate::Time(86_400),
    },
    MilestoneDef {
        id: "first_week",
        name: "First Week",
        description: "A week of shared time accumulated.",
        predicate: Predicate::Time(604_800),
    },
    MilestoneDef {
        id: "first_month",
        name: "First Month",
        description: "A month of shared time accumulated.",
        predicate: Predicate::Time(2_592_000),
    },
    MilestoneDef {
        id: "first_year",
        name: "First Year",
        description: "A year of shared time accumulated.",
        predicate: Predicate::Time(31_536_000),
    },
    MilestoneDef {
        id: "first_century",
        name: "First Century",
        description: "A century of shared time accumulated.",
        predicate: Predicate::Time(3_153_600_000),
    },
    MilestoneDef {
        id: "first_millennium",
        name: "First Millennium",
        description: "A millennium of shared time accumulated.",
        predicate: Predicate::Time(31_536_000_000),
    },
    MilestoneDef {
        id: "sustained_thousand",
        name: "Sustained Thousand",
        description: "A thousand souls present with an hour already shared.",
        predicate: Predicate::Sustained {
            live: 1_000,
            seconds: 3_600,
        },
    },
    MilestoneDef {
        id: "peak_leap",
        name: "Peak Leap",
        description: "The gathering leaps past a height it had never reached.",
        predicate: Predicate::PeakLeap,
    },
];

/// Look up a milestone definition by identifier.
pub fn find(id: &str) -> Option<&'static MilestoneDef> {
    CATALOG.iter().find(|def| def.id == id)
}
