#![forbid(unsafe_code)]

pub mod common;
pub mod ph1att;
pub mod ph1id;
pub mod ph1j;
pub mod ph1occ;
pub mod ph1pres;

pub use common::{
    ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate, NS_PER_MINUTE,
};
