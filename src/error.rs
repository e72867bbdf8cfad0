//! Error types for the authorization engine.
//!
//! Every failure carries the layer it originated from (TPM, device driver,
//! core services, or this service provider) next to the kind of failure,
//! instead of packing both into one integer.

use std::fmt;
use thiserror::Error;

use crate::tpm::TransportError;

/// The subsystem an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// The TPM itself.
    Tpm,
    /// The device driver library.
    Tddl,
    /// The core services daemon or its transport.
    Tcs,
    /// This engine.
    Tsp,
}

impl Layer {
    fn bits(self) -> u32 {
        match self {
            Layer::Tpm => 0x0000,
            Layer::Tddl => 0x1000,
            Layer::Tcs => 0x2000,
            Layer::Tsp => 0x3000,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Tpm => "tpm",
            Layer::Tddl => "tddl",
            Layer::Tcs => "tcs",
            Layer::Tsp => "tsp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("authorization is required but no usable secret is available")]
    AuthRequired,

    #[error("authorization HMAC mismatch")]
    AuthFail,

    #[error("policy secret has expired")]
    PolicyExpired,

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("resources temporarily unavailable")]
    Transient,

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("migratable key has no migration policy")]
    KeyNoMigrationPolicy,

    #[error("invalid or stale object handle")]
    InvalidHandle,

    #[error("application callback failed: {0}")]
    Callback(String),

    #[error("transport: {0}")]
    Transport(TransportError),
}

impl ErrorKind {
    fn code(&self) -> u32 {
        match self {
            ErrorKind::AuthRequired => 0x010e,
            ErrorKind::AuthFail => 0x0001,
            ErrorKind::PolicyExpired => 0x0002,
            ErrorKind::BadParameter(_) => 0x0003,
            ErrorKind::InternalError(_) => 0x0004,
            ErrorKind::OutOfMemory => 0x0005,
            ErrorKind::InvalidHandle => 0x0126,
            ErrorKind::KeyNoMigrationPolicy => 0x010b,
            ErrorKind::Callback(_) => 0x0003,
            ErrorKind::Transient => 0x0015,
            ErrorKind::Transport(t) => t.code(),
        }
    }
}

/// An engine error: what went wrong and which layer reported it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} (layer: {layer})")]
pub struct Error {
    pub kind: ErrorKind,
    pub layer: Layer,
}

impl Error {
    /// An error raised by the engine itself.
    pub fn tsp(kind: ErrorKind) -> Self {
        Self {
            kind,
            layer: Layer::Tsp,
        }
    }

    pub fn bad_parameter(reason: impl Into<String>) -> Self {
        Self::tsp(ErrorKind::BadParameter(reason.into()))
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::tsp(ErrorKind::InternalError(reason.into()))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// A flat TSS-style result code, layer in bits 12..15. Diagnostics only.
    pub fn code(&self) -> u32 {
        self.layer.bits() | self.kind.code()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::tsp(kind)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        let layer = err.layer();
        let kind = match err {
            TransportError::OutOfMemory => ErrorKind::OutOfMemory,
            t if t.is_transient() => ErrorKind::Transient,
            other => ErrorKind::Transport(other),
        };
        Self { kind, layer }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::internal("policy lock poisoned")
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
