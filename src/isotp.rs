//! Pure translation between the adapter's line-oriented hex text and an ordered
//! byte sequence, per ISO 15765-2 (ISO-TP) frame types.
//!
//! This module never touches a [`crate::hardware::Transport`] or an
//! [`crate::adapter::AdapterController`]; it only knows how to turn the text a
//! `readUntilPrompt` call already returned into payload bytes, or to report why it
//! couldn't.

/// Error produced while reassembling an ISO-TP payload from adapter text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IsoTpError {
    /// A reply line contained `NO DATA`, `ERROR`, `UNABLE` or a bare `?`.
    #[error("ECU provided no data")]
    NoData,
    /// Consecutive Frame sequence nibbles were not monotonically increasing.
    #[error("consecutive frame sequence gap")]
    ProtocolMismatch,
}

/// ISO-TP codec result.
pub type IsoTpResult<T> = Result<T, IsoTpError>;

/// Reassembles the payload carried by an adapter reply.
///
/// `text` is the cleaned reply already returned by
/// [`crate::adapter::AdapterController::exchange`] (echo stripped, `OK` and
/// `SEARCHING...` lines dropped). Each remaining line is one CAN frame: an
/// optional leading 3-hex-digit CAN id followed by space-separated hex bytes.
pub fn parse_response(text: &str) -> IsoTpResult<Vec<u8>> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for line in &lines {
        let upper = line.to_uppercase();
        if upper.contains("NO DATA") || upper.contains("ERROR") || upper.contains("UNABLE") || upper.contains('?') {
            return Err(IsoTpError::NoData);
        }
    }

    if lines.is_empty() {
        return Err(IsoTpError::NoData);
    }

    let mut frames: Vec<Vec<u8>> = Vec::with_capacity(lines.len());
    for line in &lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let data_tokens: &[&str] = if tokens.first().map_or(false, |t| t.len() == 3 && is_hex(t)) {
            &tokens[1..]
        } else {
            &tokens[..]
        };
        frames.push(data_tokens.iter().filter_map(|t| u8::from_str_radix(t, 16).ok()).collect());
    }

    let mut frames = frames.into_iter();
    let first = frames.next().unwrap_or_default();
    if first.is_empty() {
        return Err(IsoTpError::NoData);
    }

    let b0 = first[0];
    match b0 & 0xF0 {
        0x00 => {
            let declared = (b0 & 0x0F) as usize;
            let available = &first[1..];
            let payload = if declared > 0 && declared <= available.len() {
                available[..declared].to_vec()
            } else {
                if declared != 0 && declared != available.len() {
                    log::warn!(
                        "single frame declared length {declared} disagrees with {} available bytes; consuming all of them",
                        available.len()
                    );
                }
                available.to_vec()
            };
            Ok(payload)
        }
        0x10 => {
            if first.len() < 2 {
                return Err(IsoTpError::NoData);
            }
            let total_len = (((b0 & 0x0F) as usize) << 8) | first[1] as usize;
            let mut payload: Vec<u8> = first[2..].iter().copied().take(6).collect();

            let mut expected_seq: u8 = 1;
            for frame in frames {
                if payload.len() >= total_len {
                    break;
                }
                if frame.is_empty() {
                    continue;
                }
                let pci = frame[0];
                if pci & 0xF0 != 0x20 {
                    continue;
                }
                let seq = pci & 0x0F;
                if seq != expected_seq {
                    return Err(IsoTpError::ProtocolMismatch);
                }
                expected_seq = (expected_seq + 1) % 16;
                payload.extend(frame[1..].iter().copied().take(7));
            }

            if payload.len() > total_len {
                payload.truncate(total_len);
            }
            Ok(payload)
        }
        _ => Ok(first),
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_with_declared_length_longer_than_available_consumes_remainder() {
        let payload = parse_response("7E8 06 62 D4 1F 0B B8").unwrap();
        assert_eq!(payload, vec![0x62, 0xD4, 0x1F, 0x0B, 0xB8]);
    }

    #[test]
    fn single_frame_with_exact_declared_length() {
        let payload = parse_response("7E8 03 41 00 BE").unwrap();
        assert_eq!(payload, vec![0x41, 0x00, 0xBE]);
    }

    #[test]
    fn first_frame_plus_consecutive_frame_reassembles_in_order() {
        let text = "7E8 10 09 59 02 FF 04 20 09\r7E8 21 01 34 08";
        let payload = parse_response(text).unwrap();
        assert_eq!(payload, vec![0x59, 0x02, 0xFF, 0x04, 0x20, 0x09, 0x01, 0x34, 0x08]);
    }

    #[test]
    fn consecutive_frame_sequence_gap_is_protocol_mismatch() {
        let text = "7E8 10 09 59 02 FF 04 20 09\r7E8 22 01 34 08";
        assert_eq!(parse_response(text), Err(IsoTpError::ProtocolMismatch));
    }

    #[test]
    fn no_data_line_is_reported() {
        assert_eq!(parse_response("NO DATA"), Err(IsoTpError::NoData));
    }

    #[test]
    fn unable_to_connect_is_no_data() {
        assert_eq!(parse_response("UNABLE TO CONNECT"), Err(IsoTpError::NoData));
    }
}
