//! Autonomous plan runner.
//!
//! A plan is a dependency graph of units, each with a declared file scope.
//! The runner schedules conflict-free batches, has an implementer edit an
//! isolated workspace per unit, verifies the result with quality gates and
//! integrates passing change sets onto one branch in a deterministic order.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, batching, scope
//!   matching, state transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (plan and ledger files, processes,
//!   git). Collaborators sit behind traits so tests can script them.
//!
//! Orchestration modules ([`engine`], [`merge`], [`coordinator`], [`select`],
//! [`validate`]) combine the two to implement CLI commands.

pub mod cancel;
pub mod coordinator;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod merge;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
