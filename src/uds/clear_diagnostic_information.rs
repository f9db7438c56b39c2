//! UDS service 0x14 — `ClearDiagnosticInformation`.

use std::time::Duration;

use super::send_request;
use crate::adapter::AdapterController;
use crate::hardware::SLOW_READ_DEADLINE_MS;
use crate::{DiagError, DiagServerResult};

/// Clears all diagnostic information (`14FFFFFF`, group = all).
pub fn clear_all(adapter: &AdapterController) -> DiagServerResult<()> {
    let payload = send_request(adapter, "14FFFFFF", Duration::from_millis(SLOW_READ_DEADLINE_MS))?;
    if payload.first() == Some(&0x54) {
        Ok(())
    } else {
        Err(DiagError::ProtocolMismatch)
    }
}
