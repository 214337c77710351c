//! Small init and service supervisor for Unix hosts.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Condition store.
pub mod cond;

/// Config loading.
pub mod config;

/// Console progress lines.
pub mod console;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Restricted word expansion.
pub mod expand;

/// Privilege dropping and rlimits.
pub mod privilege;

/// Child reaper.
pub mod reaper;

/// Service registry.
pub mod registry;

/// Respawn policy.
pub mod respawn;

/// Runtime paths and modes.
pub mod runtime;

/// Service records and state machine types.
pub mod service;

/// Self-pipe signal dispatch.
pub mod signals;

/// Process launcher.
pub mod spawn;

/// Status snapshot.
pub mod status;

/// Supervisor engine.
pub mod supervisor;

/// Timer wheel.
pub mod timer;

/// TTY lines.
pub mod tty;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
