#![forbid(unsafe_code)]

pub mod common;
pub mod ph1conf;
pub mod ph1proctor;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
