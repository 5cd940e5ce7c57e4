#![forbid(unsafe_code)]

pub mod ph1att;
pub mod ph1occ;
pub mod ph1pres;
