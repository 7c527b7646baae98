#![forbid(unsafe_code)]

pub mod config;
pub mod ph1proctor;
pub mod session_registry;
