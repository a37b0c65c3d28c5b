//! Labvisor CLI
//!
//! Command-line tools around the orchestration service: checking a pool
//! configuration and running lab deployments against simulated hosts.

pub mod commands;

#[cfg(test)]
mod tests;
