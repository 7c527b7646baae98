#![forbid(unsafe_code)]

pub mod ph1f;
pub mod repo;
