#![forbid(unsafe_code)]

pub mod ph1conf;
pub mod ph1detect;
pub mod ph1frame;
pub mod ph1proctor;
