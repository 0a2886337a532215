//! Error types and result handling for binlog-capture.
//!
//! This module defines the main error type [`Error`], the decimal codec's
//! [`DecimalError`] and a convenience [`Result`] type alias used throughout
//! the crate. Every [`Error`] also maps onto a coarse [`ErrorCode`] so that
//! callers driving the replication loop can tell a clean end of stream from
//! a failure.
//!
//! # Example
//!
//! ```rust
//! use binlog_capture::{Error, ErrorCode, Result};
//!
//! fn next_event() -> Result<()> {
//!     // Simulating the server closing the stream
//!     Err(Error::EndOfStream)
//! }
//!
//! match next_event() {
//!     Ok(()) => println!("Got an event"),
//!     Err(e) if e.code() == ErrorCode::Eof => println!("Stream finished"),
//!     Err(e) => eprintln!("Replication failed: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for binlog-capture operations.
///
/// This enum represents all possible errors that can occur during
/// replication, from configuration issues to malformed row images.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid connection parameters.
    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),

    /// JSON serialization error, typically from checkpoint files.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the socket or on checkpoint files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish or keep the connection to the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication with the server failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The server sent something the client does not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error packet.
    #[error("Server error {code}: {message}")]
    Server {
        /// MySQL error number
        code: u16,
        /// Human readable message sent by the server
        message: String,
    },

    /// A rows event referenced a table id with no preceding table map.
    #[error("Unknown table id: {0}")]
    UnknownTable(u64),

    /// A row image could not be split into fields.
    #[error("Corrupt row image: {0}")]
    CorruptRowImage(String),

    /// Checksum of a received event did not match.
    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the event
        expected: u32,
        /// Checksum computed over the received bytes
        computed: u32,
    },

    /// Decimal decoding failed.
    #[error("Decimal error: {0}")]
    Decimal(#[from] DecimalError),

    /// The server closed the binlog stream cleanly.
    #[error("End of binlog stream")]
    EndOfStream,

    /// The requested position is not inside any binary log on the server.
    #[error("Position {file}:{position} is out of range")]
    PositionOutOfRange {
        /// Binary log file name
        file: String,
        /// Byte offset inside the file
        position: u64,
    },

    /// Memory for an incoming event could not be reserved.
    #[error("Out of memory while reserving {0} bytes for an event")]
    OutOfMemory(usize),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The driver was shut down while an operation was waiting.
    ///
    /// This is not really an error but uses the error mechanism
    /// to unblock consumers cleanly.
    #[error("Shutdown requested")]
    Shutdown,
}

/// Coarse outcome of a driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The operation succeeded.
    Ok,
    /// No more events: the stream ended or the position lies past the end.
    Eof,
    /// Any other failure.
    Fail,
}

impl Error {
    /// Maps the error onto the [`ErrorCode`] the replication API reports.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::EndOfStream | Error::PositionOutOfRange { .. } => ErrorCode::Eof,
            _ => ErrorCode::Fail,
        }
    }

    /// Whether retrying after a reconnect makes sense.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection(_) | Error::Timeout { .. }
        )
    }
}

/// Status of the packed decimal codec.
///
/// `Truncated` and `Overflow` are soft errors: the destination still holds
/// as much of the value as fits.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalError {
    /// Fraction digits were dropped.
    #[error("decimal value truncated")]
    Truncated,

    /// Integer digits were dropped.
    #[error("decimal value overflow")]
    Overflow,

    /// The input is not a valid packed decimal.
    #[error("bad decimal number")]
    BadNumber,

    /// The destination has no room for any digit group.
    #[error("out of memory for decimal digits")]
    OutOfMemory,
}

/// A convenient Result type alias for binlog-capture operations.
///
/// This is equivalent to `std::result::Result<T, binlog_capture::Error>`.
///
/// # Example
///
/// ```rust
/// use binlog_capture::Result;
///
/// fn do_something() -> Result<String> {
///     Ok("Success".to_string())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
