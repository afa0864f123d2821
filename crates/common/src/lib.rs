//! Shared error definitions, clock helpers and telemetry setup used across
//! the usemcp crates.

pub mod error;
pub mod telemetry;
pub mod time;

pub use error::{Error, FromMessage, Result};
