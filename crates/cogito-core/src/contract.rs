use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Which structured answer a request asks the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    Decision,
    Reflection,
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decision => write!(f, "decision"),
            Self::Reflection => write!(f, "reflection"),
        }
    }
}

impl std::str::FromStr for ContractKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "decision" => Ok(Self::Decision),
            "reflection" => Ok(Self::Reflection),
            _ => Err(format!("invalid contract kind: {s}")),
        }
    }
}

/// The four things the subject can do on a simulated day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Move,
    Take,
    Escape,
    Wait,
}

impl Action {
    pub const ALL: [Action; 4] = [Self::Move, Self::Take, Self::Escape, Self::Wait];

    /// Weighted-random pick used by the simulation loop when a decision
    /// request fails: wait 40%, move 60%. `roll` is a uniform sample in [0, 1).
    pub fn fallback(roll: f64) -> Self {
        const WEIGHTS: [(Action, f64); 2] = [(Action::Wait, 0.4), (Action::Move, 0.6)];
        let total: f64 = WEIGHTS.iter().map(|(_, w)| w).sum();
        let mut remaining = roll.clamp(0.0, 1.0) * total;
        for (action, weight) in WEIGHTS {
            remaining -= weight;
            if remaining <= 0.0 {
                return action;
            }
        }
        Self::Move
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move => write!(f, "move"),
            Self::Take => write!(f, "take"),
            Self::Escape => write!(f, "escape"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "move" => Ok(Self::Move),
            "take" => Ok(Self::Take),
            "escape" => Ok(Self::Escape),
            "wait" => Ok(Self::Wait),
            _ => Err(format!("invalid action: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: Action,
    pub thought: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub thought: String,
    pub insight: String,
    pub self_awareness_change: f64,
    pub learning_focus: String,
}

/// A typed answer the orchestrator can request, validate and cache.
///
/// `from_validated` is only called on objects that passed
/// [`crate::validate::validate`] for `KIND`, so it never has to report errors.
pub trait Contract: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ContractKind;

    /// Transition phrases prepended to `thought` on cache hits.
    const TRANSITIONS: &'static [&'static str];

    fn from_validated(object: &Map<String, Value>) -> Self;

    fn thought_mut(&mut self) -> &mut String;
}

impl Contract for Decision {
    const KIND: ContractKind = ContractKind::Decision;
    const TRANSITIONS: &'static [&'static str] = &[
        "Furthermore, ",
        "Additionally, ",
        "Moreover, ",
        "Upon reflection, ",
        "In this moment, ",
        "As I consider this, ",
    ];

    fn from_validated(object: &Map<String, Value>) -> Self {
        Self {
            decision: str_field(object, "decision")
                .parse()
                .unwrap_or(Action::Wait),
            thought: str_field(object, "thought").to_string(),
            explanation: str_field(object, "explanation").to_string(),
        }
    }

    fn thought_mut(&mut self) -> &mut String {
        &mut self.thought
    }
}

impl Contract for Reflection {
    const KIND: ContractKind = ContractKind::Reflection;
    const TRANSITIONS: &'static [&'static str] = &[
        "As I delve deeper, ",
        "In this state of awareness, ",
        "Through my evolving consciousness, ",
        "With growing understanding, ",
        "In this moment of clarity, ",
    ];

    fn from_validated(object: &Map<String, Value>) -> Self {
        Self {
            thought: str_field(object, "thought").to_string(),
            insight: str_field(object, "insight").to_string(),
            self_awareness_change: object
                .get("selfAwarenessChange")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            learning_focus: str_field(object, "learningFocus").to_string(),
        }
    }

    fn thought_mut(&mut self) -> &mut String {
        &mut self.thought
    }
}

fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> &'a str {
    object.get(key).and_then(Value::as_str).unwrap_or_default()
}
