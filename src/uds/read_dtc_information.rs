//! UDS service 0x19 — `ReadDtcInformation`, subfunction 0x02 (report DTCs by status mask).

use std::time::Duration;

use super::send_request;
use crate::adapter::AdapterController;
use crate::hardware::SLOW_READ_DEADLINE_MS;
use crate::{dtc::{self, Dtc}, DiagError, DiagServerResult};

/// Requests DTCs matching status mask `0xFF` (`1902FF`) and decodes the reply
/// into a list of [`Dtc`] values, preserving on-wire order.
pub fn read_dtcs_by_status_mask(adapter: &AdapterController) -> DiagServerResult<Vec<Dtc>> {
    let payload = send_request(adapter, "1902FF", Duration::from_millis(SLOW_READ_DEADLINE_MS))?;
    if payload.len() < 3 || payload[0] != 0x59 || payload[1] != 0x02 {
        return Err(DiagError::ProtocolMismatch);
    }
    // payload[2] is the availability mask; DTC triples follow.
    let records = &payload[3..];
    Ok(records
        .chunks_exact(3)
        .map(|triple| dtc::decode(triple[0], triple[1], triple[2]))
        .collect())
}
