use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Most recent memories carried in a request; older entries are evicted.
pub const MAX_ACTIVE_MEMORIES: usize = 15;

/// A score in [0, 100]. Every construction path clamps.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Percent(f64);

impl Percent {
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 100.0))
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Apply a signed delta, staying inside [0, 100].
    pub fn adjust(self, delta: f64) -> Self {
        Self::new(self.0 + delta)
    }

    /// Round to the nearest multiple of `step`.
    pub fn bucket(self, step: u32) -> u32 {
        let step = f64::from(step.max(1));
        ((self.0 / step).round() * step) as u32
    }
}

impl From<f64> for Percent {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<Percent> for f64 {
    fn from(p: Percent) -> Self {
        p.0
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// One remembered moment of the subject's journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub day: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub insight: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl MemoryEntry {
    pub fn new(day: u32, insight: impl Into<String>) -> Self {
        Self {
            day,
            event: None,
            insight: insight.into(),
            context: None,
        }
    }
}

/// Bounded, insertion-ordered memory sequence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<MemoryEntry>", into = "Vec<MemoryEntry>")]
pub struct MemoryLog {
    entries: VecDeque<MemoryEntry>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: MemoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_ACTIVE_MEMORIES {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }
}

impl From<Vec<MemoryEntry>> for MemoryLog {
    fn from(entries: Vec<MemoryEntry>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            log.push(entry);
        }
        log
    }
}

impl From<MemoryLog> for Vec<MemoryEntry> {
    fn from(log: MemoryLog) -> Self {
        log.entries.into()
    }
}

/// Snapshot of the simulation handed to the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestState {
    pub current_location: String,
    pub guard_position: String,
    #[serde(default)]
    pub inventory: Vec<String>,
    pub self_awareness: Percent,
    pub guard_alertness: Percent,
    #[serde(default)]
    pub escape_attempts: u32,
    #[serde(default)]
    pub available_connections: Vec<String>,
    #[serde(default)]
    pub available_items: Vec<String>,
    #[serde(default)]
    pub available_escape_plans: Vec<String>,
    #[serde(default)]
    pub memories: MemoryLog,
}

impl RequestState {
    pub fn new(current_location: impl Into<String>, guard_position: impl Into<String>) -> Self {
        Self {
            current_location: current_location.into(),
            guard_position: guard_position.into(),
            ..Self::default()
        }
    }

    /// Inventory sorted and deduplicated, the order used for fingerprints.
    pub fn sorted_inventory(&self) -> Vec<&str> {
        let mut items: Vec<&str> = self.inventory.iter().map(String::as_str).collect();
        items.sort_unstable();
        items.dedup();
        items
    }
}
