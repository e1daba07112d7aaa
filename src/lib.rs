//! Library crate for the conductor engine.
//!
//! Orchestrates an autonomous software-engineering loop: a planner agent
//! decomposes a goal into tasks, parallel workers delegate each task to an
//! external coding-agent CLI and commit the results, and a judge agent
//! decides whether to continue, stop, or abort. State lives under
//! `<project>/.conductor/` so sessions are resumable.

pub mod agents;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod test_support;
