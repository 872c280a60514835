//! Error handling for the replay pipeline
//!
//! This module defines the crate-wide error type and a Result alias used by
//! every layer, node and codec collaborator.
//!
//! # Error kinds
//!
//! Errors fall into four groups that decide how far a failure propagates:
//!
//! - **Transient** - logged by the node, the affected line or record is skipped
//! - **Peer-scoped** - one connection stops working for the rest of the step
//! - **Step-scoped** ([`PipelineError::is_step_fatal`]) - the step completes at
//!   both barriers, then the driver aborts the remaining steps
//! - **Run-scoped** ([`PipelineError::is_run_fatal`]) - barriers are broken and
//!   the run is torn down

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by codec collaborators.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The framed message does not fit into the frame buffer
    #[error("frame overflow: needed {needed} bytes, {remaining} remaining")]
    Overflow { needed: usize, remaining: usize },

    /// The input could not be decoded
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Writing decoded output failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Errors related to configuration loading or topology building
    #[error("Configuration error: {0}")]
    Config(String),

    /// A barrier was broken while a party was waiting on it
    #[error("Barrier '{barrier}' is broken")]
    BarrierBroken { barrier: String },

    /// A barrier handed to a layer does not match its node count
    #[error("Barrier '{barrier}' has {actual} parties, layer needs {expected}")]
    BarrierArity {
        barrier: String,
        expected: usize,
        actual: usize,
    },

    /// Codec collaborator failures
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A codec name that the registry does not know
    #[error("Unknown codec '{0}'")]
    UnknownCodec(String),

    /// Binding the producer's listening socket failed
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A consumer could not reach its target
    #[error("Failed to connect to {address} after {attempts} attempts: {source}")]
    Connect {
        address: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A step input file does not exist
    #[error("Missing input file {path:?}")]
    MissingInput { path: PathBuf },

    /// Launching an external process failed
    #[error("Failed to spawn '{command}': {source}")]
    ProcessSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An external process died between steps
    #[error("Process '{node}' exited unexpectedly ({status})")]
    ProcessCrashed { node: String, status: String },

    /// An external process exited with a non-zero code on shutdown
    #[error("Process '{node}' exited with code {code}")]
    ProcessExit { node: String, code: i32 },

    /// A node's worker thread is no longer receiving steps
    #[error("Node '{0}' is no longer running")]
    NodeGone(String),

    /// A node's worker thread panicked
    #[error("Node '{0}' panicked")]
    NodePanicked(String),

    /// The run was stopped before all steps completed
    #[error("Run aborted at step '{step}': {source}")]
    Aborted {
        step: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Thread spawning and other IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a broken barrier error
    pub fn broken(barrier: impl Into<String>) -> Self {
        PipelineError::BarrierBroken {
            barrier: barrier.into(),
        }
    }

    /// Whether the failure ends the current step for the whole run.
    ///
    /// The step still completes at both barriers; the driver stops afterwards.
    pub fn is_step_fatal(&self) -> bool {
        match self {
            PipelineError::MissingInput { .. } | PipelineError::BarrierBroken { .. } => true,
            PipelineError::WithContext { source, .. } => source.is_step_fatal(),
            _ => false,
        }
    }

    /// Whether the failure makes the barrier contract impossible to honour.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            PipelineError::Bind { .. }
            | PipelineError::ProcessSpawn { .. }
            | PipelineError::ProcessCrashed { .. }
            | PipelineError::NodePanicked(_)
            | PipelineError::Aborted { .. } => true,
            PipelineError::WithContext { source, .. } => source.is_run_fatal(),
            _ => false,
        }
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> PipelineResult<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for PipelineResult<T> {
    fn context(self, context: impl Into<String>) -> PipelineResult<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::Io(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Config("layers is empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: layers is empty");
    }

    #[test]
    fn test_error_with_context() {
        let err = PipelineError::broken("producers.start");
        let with_ctx = err.with_context("Layer producers");
        assert!(with_ctx.to_string().contains("Layer producers"));
        assert!(with_ctx.to_string().contains("producers.start"));
    }

    #[test]
    fn test_classification() {
        let missing = PipelineError::MissingInput {
            path: PathBuf::from("in/a.txt"),
        };
        assert!(missing.is_step_fatal());
        assert!(!missing.is_run_fatal());

        let crashed = PipelineError::ProcessCrashed {
            node: "jvm".to_string(),
            status: "exit status: 3".to_string(),
        };
        assert!(crashed.is_run_fatal());
        assert!(crashed.with_context("before step b").is_run_fatal());

        let overflow = PipelineError::from(CodecError::Overflow {
            needed: 10,
            remaining: 2,
        });
        assert!(!overflow.is_step_fatal());
        assert!(!overflow.is_run_fatal());
    }

    #[test]
    fn test_io_context() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        let err = res.context("opening step file").unwrap_err();
        assert!(err.to_string().starts_with("opening step file"));
    }
}
