//! UDS (ISO 14229) request encoding and reply classification.
//!
//! Each service lives in its own submodule, matching the shape of the table in
//! the crate's design notes. None of these functions touch bytes directly —
//! they encode a request string, call through
//! [`crate::adapter::AdapterController::exchange`], and hand the cleaned reply
//! text to [`crate::isotp::parse_response`] before classifying it.

pub mod clear_diagnostic_information;
pub mod diagnostic_session_control;
pub mod read_data_by_identifier;
pub mod read_dtc_information;
pub mod tester_present;

use std::time::Duration;

use crate::adapter::AdapterController;
use crate::{DiagError, DiagServerResult};

/// Negative response codes a caller might reasonably want to match on by name.
///
/// This is not exhaustive — any other byte value still round-trips through
/// [`DiagError::NegativeResponse`] as a raw `nrc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Nrc {
    /// 0x11 — `serviceNotSupported`
    ServiceNotSupported,
    /// 0x22 — `conditionsNotCorrect`
    ConditionsNotCorrect,
    /// 0x31 — `requestOutOfRange`
    RequestOutOfRange,
    /// 0x7E — `subFunctionNotSupportedInActiveSession`
    SubFunctionNotSupportedInActiveSession,
    /// 0x7F — `serviceNotSupportedInActiveSession`
    ServiceNotSupportedInActiveSession,
    /// Any NRC not named above.
    Other(u8),
}

impl From<u8> for Nrc {
    fn from(code: u8) -> Self {
        match code {
            0x11 => Nrc::ServiceNotSupported,
            0x22 => Nrc::ConditionsNotCorrect,
            0x31 => Nrc::RequestOutOfRange,
            0x7E => Nrc::SubFunctionNotSupportedInActiveSession,
            0x7F => Nrc::ServiceNotSupportedInActiveSession,
            other => Nrc::Other(other),
        }
    }
}

/// Sends `request_hex` through `adapter` and returns the parsed ISO-TP payload,
/// or a [`DiagError::NegativeResponse`] if it was a well-formed `7F` reply.
pub(crate) fn send_request(adapter: &AdapterController, request_hex: &str, deadline: Duration) -> DiagServerResult<Vec<u8>> {
    let text = adapter.exchange(request_hex, deadline)?;
    let payload = crate::isotp::parse_response(&text)?;
    if payload.is_empty() {
        return Err(DiagError::NoData);
    }
    if payload[0] == 0x7F {
        let service = *payload.get(1).unwrap_or(&0);
        let nrc = *payload.get(2).unwrap_or(&0);
        return Err(DiagError::NegativeResponse { service, nrc });
    }
    Ok(payload)
}
