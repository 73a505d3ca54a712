//! Cradle is a container entrypoint supervisor. Before launching a command it checks
//! that the declared environment variables are present and well-formed and waits until
//! upstream dependencies (files, sockets, HTTP endpoints) are reachable. It then runs the
//! command, relays termination signals to it, samples its resource usage and routes its
//! output through a structured logging pipeline with field masking.

/// Shared cancellation scope.
pub mod cancel;

/// Environment variable checks.
pub mod checkenv;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Dependency readiness probing.
pub mod depends;

/// Environment variable store.
pub mod env;

/// Error handling.
pub mod error;

/// Log multiplexing and export.
pub mod logs;

/// Process resource sampling.
pub mod metrics;

/// Preflight and result reports.
pub mod report;

/// Termination signal subscriptions.
pub mod signals;

/// Supervision of the target process.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
