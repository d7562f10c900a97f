//! Error types for kernel actions.

use thiserror::Error;

/// Errors that can occur while driving kernel state.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The external command could not be spawned at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The rendered command line.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The external command ran and exited non-zero.
    #[error("command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        /// The rendered command line.
        command: String,
        /// Exit status, or -1 if terminated by a signal.
        status: i32,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// Injected failure from the fake kernel (tests only).
    #[error("injected kernel failure")]
    Injected,
}
