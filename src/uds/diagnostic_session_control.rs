//! UDS service 0x10 — `DiagnosticSessionControl`.

use std::time::Duration;

use super::send_request;
use crate::adapter::AdapterController;
use crate::hardware::DEFAULT_READ_DEADLINE_MS;
use crate::{DiagError, DiagServerResult};

/// Requests the default diagnostic session (`1001`).
pub fn set_default_session(adapter: &AdapterController) -> DiagServerResult<()> {
    request_session(adapter, "1001")
}

/// Requests the extended diagnostic session (`1003`).
pub fn set_extended_session(adapter: &AdapterController) -> DiagServerResult<()> {
    request_session(adapter, "1003")
}

fn request_session(adapter: &AdapterController, request_hex: &str) -> DiagServerResult<()> {
    let payload = send_request(adapter, request_hex, Duration::from_millis(DEFAULT_READ_DEADLINE_MS))?;
    if payload.first() == Some(&0x50) {
        Ok(())
    } else {
        Err(DiagError::ProtocolMismatch)
    }
}
