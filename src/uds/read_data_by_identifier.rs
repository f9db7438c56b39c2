//! UDS service 0x22 — `ReadDataByIdentifier`.

use std::time::Duration;

use super::send_request;
use crate::adapter::AdapterController;
use crate::hardware::DEFAULT_READ_DEADLINE_MS;
use crate::{DiagError, DiagServerResult};

/// Reads `did` and returns the data bytes with the `62 didHi didLo` prefix
/// stripped.
///
/// Fails with [`DiagError::ProtocolMismatch`] if the reply's echoed DID does not
/// match the one requested.
pub fn read_data_by_identifier(adapter: &AdapterController, did: u16) -> DiagServerResult<Vec<u8>> {
    let request = format!("22{did:04X}");
    let payload = send_request(adapter, &request, Duration::from_millis(DEFAULT_READ_DEADLINE_MS))?;
    if payload.len() < 3 || payload[0] != 0x62 {
        return Err(DiagError::ProtocolMismatch);
    }
    let echoed = u16::from_be_bytes([payload[1], payload[2]]);
    if echoed != did {
        return Err(DiagError::ProtocolMismatch);
    }
    Ok(payload[3..].to_vec())
}
