//! Error taxonomy shared by every module and the tri-state cycle outcome.

use std::{error::Error as StdError, fmt, io};

use thiserror::Error;

/// Boxed source error carried by transport failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A single bus or network transaction failed.
///
/// Always recoverable: the device path and the attempted operation are kept
/// so the log line is enough to diagnose a flaky wire.
#[derive(Debug, Error)]
#[error("{op} on [{device}] failed: {source}")]
pub struct TransportError {
    pub device: String,
    pub op: &'static str,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(device: impl Into<String>, op: &'static str, source: impl Into<BoxError>) -> Self {
        Self {
            device: device.into(),
            op,
            source: source.into(),
        }
    }

    /// A transfer moved fewer bytes than the frame requires.
    pub fn short(device: impl Into<String>, op: &'static str, expected: usize, got: usize) -> Self {
        Self::new(
            device,
            op,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {expected} bytes, got {got}"),
            ),
        )
    }
}

/// Errors crossing a module boundary.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("concurrency fault: {0}")]
    Concurrency(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("sink error: {0}")]
    Sink(String),
}

impl ModuleError {
    /// Only a broken lock invariant stops the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModuleError::Concurrency(_))
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        ModuleError::Configuration(msg.to_string())
    }

    pub fn sink(msg: impl fmt::Display) -> Self {
        ModuleError::Sink(msg.to_string())
    }

    pub fn validation(msg: impl fmt::Display) -> Self {
        ModuleError::Validation(msg.to_string())
    }
}

/// Result of one acquisition or publish attempt.
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// The loop continues; the current cycle's publish step is skipped.
    Recoverable(ModuleError),
    /// The loop must terminate.
    Fatal(ModuleError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal(_))
    }
}

impl From<ModuleError> for Outcome {
    fn from(err: ModuleError) -> Self {
        if err.is_fatal() {
            Outcome::Fatal(err)
        } else {
            Outcome::Recoverable(err)
        }
    }
}

impl From<Result<(), ModuleError>> for Outcome {
    fn from(result: Result<(), ModuleError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) => e.into(),
        }
    }
}
