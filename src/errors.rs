//! Structured error types for the collection loop.
//!
//! Subprocess failures always carry the offending command line and a bounded
//! excerpt of its standard error.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("CreateProfile rejected: {0}")]
    Rejected(tonic::Status),

    #[error("CreateProfile failed after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: tonic::Status },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("command {command} failed: {status}; {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("command {command} finished but left no capture at {}", path.display())]
    MissingCapture { command: String, path: PathBuf },
}

#[derive(Error, Debug)]
pub enum SymbolizeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("command {command} failed: {status}; {stderr}")]
    ListFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to populate {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("symbol tree task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("command {command} failed: {status}; {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("command {command} produced no profile")]
    EmptyOutput { command: String },

    #[error("gzip of pprof data failed: {0}")]
    Compress(std::io::Error),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("unsupported profile type {0}")]
    UnsupportedProfileType(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Symbolize(#[from] SymbolizeError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl AgentError {
    /// Whether the error belongs to the capture/symbolize/convert pipeline,
    /// which only costs the current profile outside of strict mode.
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(
            self,
            Self::Capture(_) | Self::Symbolize(_) | Self::Conversion(_)
        )
    }
}
