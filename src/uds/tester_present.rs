//! UDS service 0x3E — `TesterPresent`, used as the extended-session keep-alive.

use std::time::Duration;

use super::send_request;
use crate::adapter::AdapterController;
use crate::hardware::DEFAULT_READ_DEADLINE_MS;
use crate::{DiagError, DiagServerResult};

/// Sends `3E00` (suppressed-response form not used) and checks for the
/// positive reply `7E`.
pub fn tester_present(adapter: &AdapterController) -> DiagServerResult<()> {
    let payload = send_request(adapter, "3E00", Duration::from_millis(DEFAULT_READ_DEADLINE_MS))?;
    if payload.first() == Some(&0x7E) {
        Ok(())
    } else {
        Err(DiagError::ProtocolMismatch)
    }
}
