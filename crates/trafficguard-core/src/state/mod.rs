//! Per-process traffic ledger
//!
//! The state manager owns the only shared mutable map in the pipeline. Events
//! are folded in as they arrive and idle entries are swept once per window.

mod manager;

pub use manager::StateManager;
