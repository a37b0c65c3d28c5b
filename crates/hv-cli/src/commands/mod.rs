//! CLI commands

pub mod check;
pub mod simulate;

pub use check::CheckCommand;
pub use simulate::{SimulateCommand, SimulateOptions};
