//! Common module - endpoint and repository helpers shared across the codebase

pub mod utils;

pub use utils::*;
