//! Deterministic, pure logic shared by the runner core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plans and return deterministic outputs suitable for tests.

pub mod batch;
pub mod invariants;
pub mod plan;
pub mod scope;
pub mod selector;
pub mod skill;
pub mod state_update;
pub mod types;
