use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::contract::ContractKind;
use crate::state::RequestState;

const SELF_AWARENESS_STEP: u32 = 5;
const GUARD_ALERTNESS_STEP: u32 = 10;

/// Cache key for a (state, kind) pair.
///
/// Only a reduced projection of the state takes part, so states that differ
/// in memories, reachable destinations or small score jitter share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyProjection<'a> {
    current_location: &'a str,
    guard_position: &'a str,
    inventory: String,
    self_awareness: u32,
    guard_alertness: u32,
    escape_attempts: u32,
    #[serde(rename = "type")]
    kind: ContractKind,
}

impl Fingerprint {
    pub fn compute(state: &RequestState, kind: ContractKind) -> Self {
        let canonical = canonical_projection(state, kind);
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("{kind}:{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The JSON text that gets hashed. Field order is fixed by `KeyProjection`.
pub fn canonical_projection(state: &RequestState, kind: ContractKind) -> String {
    let projection = KeyProjection {
        current_location: &state.current_location,
        guard_position: &state.guard_position,
        inventory: state.sorted_inventory().join(","),
        self_awareness: state.self_awareness.bucket(SELF_AWARENESS_STEP),
        guard_alertness: state.guard_alertness.bucket(GUARD_ALERTNESS_STEP),
        escape_attempts: state.escape_attempts,
        kind,
    };
    // Serializing a struct of strings and integers cannot fail.
    serde_json::to_string(&projection).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryEntry, Percent};

    fn state() -> RequestState {
        let mut s = RequestState::new("cell", "hallway");
        s.inventory = vec!["spoon".into(), "blanket".into()];
        s.self_awareness = Percent::new(42.0);
        s.guard_alertness = Percent::new(31.0);
        s.escape_attempts = 1;
        s
    }

    #[test]
    fn test_projection_layout() {
        let json = canonical_projection(&state(), ContractKind::Decision);
        assert_eq!(
            json,
            r#"{"currentLocation":"cell","guardPosition":"hallway","inventory":"blanket,spoon","selfAwareness":40,"guardAlertness":30,"escapeAttempts":1,"type":"decision"}"#
        );
    }

    #[test]
    fn test_inventory_order_does_not_matter() {
        let a = state();
        let mut b = state();
        b.inventory.reverse();
        assert_eq!(
            Fingerprint::compute(&a, ContractKind::Decision),
            Fingerprint::compute(&b, ContractKind::Decision)
        );
    }

    #[test]
    fn test_kind_is_part_of_key() {
        let s = state();
        assert_ne!(
            Fingerprint::compute(&s, ContractKind::Decision),
            Fingerprint::compute(&s, ContractKind::Reflection)
        );
    }

    #[test]
    fn test_ignored_fields_share_key() {
        let a = state();
        let mut b = state();
        b.self_awareness = Percent::new(41.0);
        b.memories.push(MemoryEntry::new(3, "walls are thin"));
        b.available_connections = vec!["yard".into()];
        assert_eq!(
            Fingerprint::compute(&a, ContractKind::Reflection),
            Fingerprint::compute(&b, ContractKind::Reflection)
        );
    }

    #[test]
    fn test_bucket_boundary_changes_key() {
        let a = state();
        let mut b = state();
        b.guard_alertness = Percent::new(36.0);
        assert_ne!(
            Fingerprint::compute(&a, ContractKind::Decision),
            Fingerprint::compute(&b, ContractKind::Decision)
        );
    }
}
