//! I/O helpers for runner commands: persistence, processes and version control.

pub mod attempt_log;
pub mod config;
pub mod context;
pub mod gates;
pub mod git;
pub mod implementer;
pub mod init;
pub mod ledger;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod vcs;
