#![forbid(unsafe_code)]

pub mod ph1att;
pub mod ph1id;
pub mod ph1j;
pub mod ph1occ;
pub mod ph1os;
pub mod ph1pres;

pub use ph1os::{PresenceConfig, PresenceError, PresenceRuntime};
