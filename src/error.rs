use thiserror::Error;

use crate::codec::ErrorCode;

/// Unified error type for every fallible operation in the transport core.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial endpoint could not be opened, written to, or has disconnected.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame failed validation (bad magic, bad length, bad CRC) and could
    /// not be recovered by resynchronizing.
    #[error("framing error: {0}")]
    Framing(String),

    /// No reply arrived within the configured timeout after exhausting retries.
    #[error("timeout waiting for reply to {command} (seq={sequence})")]
    Timeout { command: &'static str, sequence: u16 },

    /// The target answered with NACK/ERROR carrying a protocol error code.
    #[error("target rejected {during} with {error_code:?}")]
    PeerRejected {
        error_code: ErrorCode,
        during: &'static str,
    },

    /// Caller-supplied argument was out of range (oversized image, overlong
    /// version/project string, etc).
    #[error("invalid argument: {0}")]
    Argument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
