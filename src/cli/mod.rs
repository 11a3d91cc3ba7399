//! Command line interface module
//!
//! Argument parsing for the `replicator` binary and the runner that wires
//! configuration, clients and the controller into a serving process.

pub mod args;
pub mod runner;

pub use args::{Args, Command, ServeArgs};
pub use runner::Runner;
