//! The hardware module owns the byte-oriented duplex channel to the adapter.
//!
//! Nothing above this module is allowed to see raw bytes; [`adapter::AdapterController`]
//! is the sole caller of [`Transport`].

#[cfg(feature = "serial")]
pub mod serial;

use std::time::Duration;

/// Transport result
pub type TransportResult<T> = Result<T, TransportError>;

/// Error produced by the byte-oriented channel to the adapter
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying IO error writing to or reading from the channel
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),
    /// The `>` prompt was not observed before the read deadline elapsed
    #[error("timed out waiting for adapter prompt")]
    ReadTimeout,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Byte-oriented duplex channel to an ELM327-compatible adapter.
///
/// A [`Transport`] performs no interpretation of the bytes it moves; it only knows how
/// to frame a single command/response round trip the way the adapter expects: a command
/// terminated by `\r`, and a response terminated by the `>` prompt character.
pub trait Transport: Send {
    /// Writes `cmd` followed by a carriage return and flushes the channel.
    fn write_line(&mut self, cmd: &str) -> TransportResult<()>;

    /// Accumulates bytes until the `>` prompt is observed or `deadline` elapses.
    ///
    /// The returned buffer excludes the prompt character. While waiting, implementations
    /// must poll in short (~10ms) increments rather than blocking indefinitely, so that a
    /// cancellation flag checked between polls is honoured promptly.
    fn read_until_prompt(&mut self, deadline: Duration) -> TransportResult<String>;
}

/// Default read deadline for an ordinary exchange (ms).
pub const DEFAULT_READ_DEADLINE_MS: u64 = 2_000;

/// Read deadline for operations known to be slow on real hardware (0x19, 0x14).
pub const SLOW_READ_DEADLINE_MS: u64 = 5_000;

/// The Bluetooth SPP service UUID every ELM327 (clone or genuine) advertises.
///
/// The core never performs Bluetooth discovery itself — this constant exists purely so
/// the excluded platform layer (which does perform discovery) can filter candidate
/// devices without hard-coding the UUID itself.
pub const ELM327_SPP_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";
