//! Error types for the agent and control binaries.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration problems, detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path of the unreadable file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file failed to parse.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Path of the malformed file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// A required option is missing or options contradict each other.
    #[error("{0}")]
    Invalid(String),
}

/// Fatal agent errors. Steady-state operation never escalates here; only
/// startup problems and signal-driven shutdown leave the worker loops.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad configuration (exit code 1).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Initial kernel setup failed (exit code 2).
    #[error("kernel setup failed: {0}")]
    Kernel(#[from] amesh_kernel::KernelError),

    /// The address tracker could not start (exit code 2).
    #[error("address tracker failed: {0}")]
    Tracker(#[from] amesh_kernel::TrackerError),

    /// Signal handler installation or worker teardown failed.
    #[error("runtime failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the control tool.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Bad configuration (exit code 1).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A directory operation failed (exit code 2).
    #[error("directory operation failed: {0}")]
    Directory(#[from] amesh_directory::DirectoryError),
}
