pub mod contract;
pub mod error;
pub mod fingerprint;
pub mod repair;
pub mod state;
pub mod validate;

pub use contract::{Action, Contract, ContractKind, Decision, Reflection};
pub use error::{CogitoError, CogitoResult, TransportError};
pub use fingerprint::Fingerprint;
pub use repair::{repair, repair_payload};
pub use state::{MemoryEntry, MemoryLog, Percent, RequestState, MAX_ACTIVE_MEMORIES};
pub use validate::{into_contract, validate, FieldViolation, ValidationReport};
