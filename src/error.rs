//! Custom error types for the application.
//!
//! `WxError` consolidates every failure the console driver and engine can
//! produce. Protocol errors carry the command that was in flight so a log
//! line is enough to reconstruct what the console was being asked to do.
//!
//! The engine treats these in three classes:
//!
//! - **Transient** (`Wakeup`, `Ack`, `Crc`, `Io`): retried at the operation
//!   level, then surfaced as `RetriesExceeded`.
//! - **Fatal to the operation** (`ViolatedPrecondition`,
//!   `UnsupportedFeature`, `UnknownArchiveType`): never retried.
//! - **Environmental** (`Serial`, `Config`, `Store`): handled by the engine
//!   fault policy (backoff and restart, or terminate).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type WxResult<T> = std::result::Result<T, WxError>;

#[derive(Error, Debug)]
pub enum WxError {
    #[error("console failed to wake after {tries} attempts")]
    Wakeup { tries: u32 },

    #[error("no ACK for {command:?} (got {got:?})")]
    Ack { command: String, got: Option<u8> },

    #[error("CRC exchange for {command:?} failed after {tries} attempts")]
    Crc { command: String, tries: u32 },

    #[error("retries exceeded while {context}")]
    RetriesExceeded { context: &'static str },

    #[error("unknown archive record type {0:#04x} (expected Rev-B, type 0)")]
    UnknownArchiveType(u8),

    #[error("violated precondition: {0}")]
    ViolatedPrecondition(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("archive store error: {0}")]
    Store(String),
}

impl WxError {
    /// Whether an operation-level retry loop should swallow this error and
    /// try the exchange again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WxError::Wakeup { .. } | WxError::Ack { .. } | WxError::Crc { .. } | WxError::Io(_)
        )
    }
}
