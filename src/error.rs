//! Crate-wide error taxonomy.
//!
//! Configuration problems are fatal before capture starts. Capture errors are
//! fatal for the pipeline that hit them and are forwarded to the supervisor
//! over the error channel. Reassembly and parse faults are counted, never
//! raised.

use std::path::PathBuf;

use thiserror::Error;

use crate::collect::backend::IngestError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no capturable network interfaces found")]
    NoInterfaces,

    #[error("unknown interface {0:?}")]
    UnknownInterface(String),

    #[error("invalid BPF filter on {interface}: {reason}")]
    InvalidFilter { interface: String, reason: String },

    #[error("failed to open capture on {interface}: {reason}")]
    CaptureOpen { interface: String, reason: String },

    #[error("capture read failed on {interface}: {reason}")]
    CaptureRead { interface: String, reason: String },

    #[error("output directory {}: {reason}", .path.display())]
    OutputDir { path: PathBuf, reason: String },

    #[error("failed to write archive {}: {reason}", .path.display())]
    ArchiveWrite { path: PathBuf, reason: String },

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("subcommand exited with code {code}")]
    Subcommand { code: i32 },

    #[error("no HTTP exchanges captured")]
    TraceEmpty,
}
