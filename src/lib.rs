#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]

//! A crate which provides a diagnostic protocol core for talking to a vehicle's ECUs
//! through a consumer-grade ELM327 serial/Bluetooth adapter.
//!
//! ## Why this crate exists
//!
//! Genuine ELM327 silicon, and the various clone chipsets sold under the same name,
//! accept a small ASCII command language (AT commands) for configuring an underlying
//! ISO 15765-4 (CAN) transport, and then pass diagnostic traffic through mostly
//! unmodified. The wrinkle that makes this crate non-trivial is that a large fraction
//! of clone adapters silently swallow any request that uses a physical CAN source
//! address (`ATSH7E0`, `ATSH765`, ...) — the adapter appears to accept the command, but
//! no frame is ever transmitted. The only configuration that reliably produces traffic
//! on clone hardware is broadcast (`ATSH7DF`) with a receive filter (`ATCRA`) and an
//! explicit flow-control header (`ATFCSH`). This crate rewrites every addressed request
//! into that broadcast-plus-filter equivalent in exactly one place
//! ([`adapter::AdapterController`]), so every layer above it can keep pretending it is
//! talking to a specific ECU by address.
//!
//! ## Module stack
//!
//! Leaves-first, the crate is organized as:
//! * [`hardware`] — the byte-oriented transport to the adapter.
//! * [`adapter`] — adapter configuration state, command serialization, the ATSH rewrite.
//! * [`isotp`] — pure translation between ISO-TP frames and the adapter's line-oriented text.
//! * [`uds`] — UDS (ISO 14229) request encoding and reply classification.
//! * [`engine`] — orchestration: ECU discovery/selection, session control, TesterPresent
//!   keep-alive, DID/DTC decoding.
//! * [`catalogs`] — the static, read-only tables the other modules consult (ECU addresses,
//!   DID definitions, DTC descriptions, DPF regeneration status text).
//! * [`dtc`] — the [`dtc::Dtc`] value type and its wire decoding.
//!
//! This crate deliberately does not cover writing to ECU memory, flashing, UDS security
//! access (0x27), programming sessions, multi-bus topologies, 29-bit CAN identifiers,
//! J1939, or manufacturer actuator tests.

pub mod adapter;
pub mod catalogs;
pub mod dtc;
pub mod engine;
pub mod hardware;
pub mod isotp;
pub mod uds;

use adapter::AdapterError;
use hardware::TransportError;

/// Diagnostic core result
pub type DiagServerResult<T> = Result<T, DiagError>;

/// Crate-wide error taxonomy.
///
/// Transport contributes [`DiagError::Io`] and [`DiagError::ReadTimeout`]; the adapter
/// controller adds [`DiagError::AdapterRejected`], [`DiagError::BusProbeFailed`] and
/// [`DiagError::ForbiddenAfterBusActive`]; the UDS client and engine add the remaining
/// protocol-level variants.
#[derive(Debug)]
pub enum DiagError {
    /// Underlying transport read/write failure. Fatal to the connection.
    Io(std::io::Error),
    /// The adapter did not return its `>` prompt within the read deadline.
    ReadTimeout,
    /// The `0100` bus probe issued during `initialize` returned `NO DATA`, `UNABLE` or `ERROR`.
    BusProbeFailed,
    /// The adapter answered a configuration command (`ATCRA`/`ATFCSH`/...) with `ERROR` or `?`.
    AdapterRejected,
    /// The ECU did not answer within the adapter's own response window.
    NoData,
    /// The ECU returned a well-formed negative response (`7F <service> <nrc>`).
    NegativeResponse {
        /// Service ID the negative response refers to
        service: u8,
        /// Raw negative response code
        nrc: u8,
    },
    /// The reply did not echo the service/DID that was requested.
    ProtocolMismatch,
    /// Caller attempted a destructive AT command (`ATZ`/`ATD`/`ATWS`/`ATH0`/`ATS0`) after the
    /// bus went active. Rejected locally without contacting the adapter.
    ForbiddenAfterBusActive,
}

impl std::fmt::Display for DiagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagError::Io(e) => write!(f, "transport IO error: {e}"),
            DiagError::ReadTimeout => write!(f, "timed out waiting for adapter prompt"),
            DiagError::BusProbeFailed => write!(f, "0100 bus probe returned no usable reply"),
            DiagError::AdapterRejected => write!(f, "adapter rejected a configuration command"),
            DiagError::NoData => write!(f, "ECU provided no data"),
            DiagError::NegativeResponse { service, nrc } => {
                write!(f, "negative response to service 0x{service:02X}: NRC 0x{nrc:02X}")
            }
            DiagError::ProtocolMismatch => {
                write!(f, "reply did not echo the requested service/identifier")
            }
            DiagError::ForbiddenAfterBusActive => {
                write!(f, "AT command is forbidden once the CAN bus is active")
            }
        }
    }
}

impl std::error::Error for DiagError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiagError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for DiagError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => DiagError::Io(e),
            TransportError::ReadTimeout => DiagError::ReadTimeout,
        }
    }
}

impl From<isotp::IsoTpError> for DiagError {
    fn from(e: isotp::IsoTpError) -> Self {
        match e {
            isotp::IsoTpError::NoData => DiagError::NoData,
            isotp::IsoTpError::ProtocolMismatch => DiagError::ProtocolMismatch,
        }
    }
}

impl From<AdapterError> for DiagError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Transport(t) => t.into(),
            AdapterError::AdapterRejected => DiagError::AdapterRejected,
            AdapterError::ForbiddenAfterBusActive => DiagError::ForbiddenAfterBusActive,
            AdapterError::BusProbeFailed => DiagError::BusProbeFailed,
            AdapterError::WorkerGone => DiagError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "adapter worker thread is no longer running",
            )),
        }
    }
}
