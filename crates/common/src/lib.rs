//! Common types, document shapes, and errors shared across the cleanroom crates.

pub mod error;
pub mod protocol;

pub use error::{CleanroomError, Result};
