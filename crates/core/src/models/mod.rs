//! Data models for Chronos

mod role;
mod team;

pub use role::*;
pub use team::*;
