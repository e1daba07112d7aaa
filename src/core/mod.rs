//! Deterministic core logic for the conductor engine.
//!
//! These modules define stable contracts between components: task lifecycle,
//! agent pool health, error taxonomy, events, and session state. They take
//! timestamps as parameters where selection logic depends on the clock, so
//! behavior stays deterministic and testable.

pub mod classify;
pub mod events;
pub mod pool;
pub mod session;
pub mod task;
