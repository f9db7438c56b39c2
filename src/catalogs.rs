//! Static, read-only tables consulted by every other module: the ECU address map,
//! the DID catalog with its decoders, the DTC description table, and the DPF
//! regeneration status table.
//!
//! Everything here is a `'static` const or static array built once at compile
//! time; there is no runtime initialization step and nothing here is ever mutated.

/// A named ECU address pair on the CAN bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EcuAddress {
    /// Short tag used by callers to select this ECU, e.g. `"ECM"`.
    pub code: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Transmit (request) CAN id, three uppercase hex digits.
    pub tx: &'static str,
    /// Receive (response) CAN id, three uppercase hex digits.
    pub rx: &'static str,
}

/// The ECUs this crate targets. The canonical rx for a `0x7Ex` tx is `tx + 8`;
/// the BSI pair is manufacturer-specific and does not follow that rule.
pub static ECU_ADDRESSES: &[EcuAddress] = &[
    EcuAddress { code: "ECM", name: "Engine Control Module", tx: "7E0", rx: "7E8" },
    EcuAddress { code: "TCM", name: "Transmission Control Module", tx: "7E1", rx: "7E9" },
    EcuAddress { code: "BSI", name: "Built-In Systems Interface", tx: "765", rx: "76D" },
];

/// Looks up an ECU by its short code (case-insensitive).
pub fn by_code(code: &str) -> Option<&'static EcuAddress> {
    ECU_ADDRESSES.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

/// Looks up an ECU by its rx CAN id (case-insensitive).
pub fn by_rx(rx: &str) -> Option<&'static EcuAddress> {
    ECU_ADDRESSES.iter().find(|e| e.rx.eq_ignore_ascii_case(rx))
}

/// Looks up an ECU by its tx CAN id (case-insensitive).
pub fn by_tx(tx: &str) -> Option<&'static EcuAddress> {
    ECU_ADDRESSES.iter().find(|e| e.tx.eq_ignore_ascii_case(tx))
}

/// Resolves the rx filter to program for a given tx (source) address.
///
/// Uses the catalog when the pair is tabled (covers the BSI exception); falls
/// back to `tx + 8 mod 0x1000` for any other address, which holds for the whole
/// standard `0x7Ex` range.
pub fn tx_to_rx(tx: &str) -> String {
    if let Some(ecu) = by_tx(tx) {
        return ecu.rx.to_string();
    }
    match u16::from_str_radix(tx, 16) {
        Ok(n) => format!("{:03X}", (n + 8) % 0x1000),
        Err(_) => tx.to_string(),
    }
}

/// A decoded DID value. Which variant a decoder produces is fixed per DID.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DidValue {
    /// A single decoded scalar, already in engineering units.
    Scalar(f64),
    /// Four injector trim corrections in mm³, one per cylinder bank slot.
    InjectorCorrections([f64; 4]),
    /// Printable ASCII text (identification strings).
    Text(String),
}

/// A catalogued Data Identifier.
pub struct Did {
    /// 16-bit identifier.
    pub id: u16,
    /// Human-readable name.
    pub name: &'static str,
    /// Engineering unit, used by the engine's formatting rules.
    pub unit: &'static str,
    /// High byte of `id`; groups the DID catalog by function.
    pub group: u8,
    /// Payload length this decoder expects; informational only, decoders are
    /// tolerant of a shorter slice and return `None` rather than panic.
    pub expected_data_len: usize,
    /// Converts raw payload bytes (with the `62 didHi didLo` prefix already
    /// stripped) into a typed value.
    pub decode: fn(&[u8]) -> Option<DidValue>,
}

fn decode_rpm(data: &[u8]) -> Option<DidValue> {
    let raw = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    Some(DidValue::Scalar(raw as f64 / 4.0))
}

fn decode_soot_loading(data: &[u8]) -> Option<DidValue> {
    let raw = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    Some(DidValue::Scalar(raw as f64 * 0.01))
}

fn decode_signed_celsius(data: &[u8]) -> Option<DidValue> {
    let raw = *data.first()?;
    Some(DidValue::Scalar(raw as i8 as f64))
}

fn decode_battery_voltage(data: &[u8]) -> Option<DidValue> {
    let raw = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    Some(DidValue::Scalar(raw as f64 * 0.001))
}

fn decode_distance_km(data: &[u8]) -> Option<DidValue> {
    let raw = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    Some(DidValue::Scalar(raw as f64))
}

fn decode_regen_status(data: &[u8]) -> Option<DidValue> {
    let raw = *data.first()?;
    Some(DidValue::Scalar(raw as f64))
}

fn decode_injector_corrections(data: &[u8]) -> Option<DidValue> {
    if data.len() < 8 {
        return None;
    }
    let mut out = [0.0; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        let raw = i16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
        *slot = raw as f64 * 0.01;
    }
    Some(DidValue::InjectorCorrections(out))
}

fn decode_identification_text(data: &[u8]) -> Option<DidValue> {
    let text: String = data
        .iter()
        .filter(|&&b| (0x20..=0x7E).contains(&b))
        .map(|&b| b as char)
        .collect();
    Some(DidValue::Text(text.trim().to_string()))
}

/// The DID catalog. `group` values `0xD0..0xDF` are manufacturer-enhanced data
/// groups; `0xF0..0xFF` are the standardised identification/vehicle-info group.
pub static DIDS: &[Did] = &[
    Did { id: 0xD41F, name: "Engine speed", unit: "rpm", group: 0xD4, expected_data_len: 2, decode: decode_rpm },
    Did { id: 0xD420, name: "Coolant temperature", unit: "\u{b0}C", group: 0xD4, expected_data_len: 1, decode: decode_signed_celsius },
    Did { id: 0xD421, name: "Intake air temperature", unit: "\u{b0}C", group: 0xD4, expected_data_len: 1, decode: decode_signed_celsius },
    Did { id: 0xD422, name: "Battery voltage", unit: "V", group: 0xD4, expected_data_len: 2, decode: decode_battery_voltage },
    Did { id: 0xD482, name: "Injector trim corrections", unit: "mm\u{b3}", group: 0xD4, expected_data_len: 8, decode: decode_injector_corrections },
    Did { id: 0xD546, name: "DPF soot loading", unit: "g/l", group: 0xD5, expected_data_len: 2, decode: decode_soot_loading },
    Did { id: 0xD547, name: "Distance since last regeneration", unit: "km", group: 0xD5, expected_data_len: 2, decode: decode_distance_km },
    Did { id: 0xD548, name: "DPF regeneration status", unit: "", group: 0xD5, expected_data_len: 1, decode: decode_regen_status },
    Did { id: 0xF080, name: "Part number", unit: "", group: 0xF0, expected_data_len: 0, decode: decode_identification_text },
    Did { id: 0xF0FE, name: "Calibration identification", unit: "", group: 0xF0, expected_data_len: 0, decode: decode_identification_text },
    Did { id: 0xF091, name: "Hardware number", unit: "", group: 0xF0, expected_data_len: 0, decode: decode_identification_text },
];

/// Looks up a DID by its numeric identifier.
pub fn did_by_id(id: u16) -> Option<&'static Did> {
    DIDS.iter().find(|d| d.id == id)
}

/// A DTC description table entry.
pub struct DtcDescription {
    /// Four-character code, e.g. `"P0420"`.
    pub code: &'static str,
    /// Human-readable description.
    pub description: &'static str,
}

/// Known DTC descriptions. Lookup misses default to `"Unknown DTC"`.
pub static DTC_DESCRIPTIONS: &[DtcDescription] = &[
    DtcDescription { code: "P0420", description: "Catalyst System Efficiency Below Threshold (Bank 1)" },
    DtcDescription { code: "P0401", description: "Exhaust Gas Recirculation Flow Insufficient" },
    DtcDescription { code: "P0134", description: "O2 Sensor Circuit No Activity Detected (Bank 1 Sensor 1)" },
    DtcDescription { code: "P2002", description: "Diesel Particulate Filter Efficiency Below Threshold (Bank 1)" },
    DtcDescription { code: "P0300", description: "Random/Multiple Cylinder Misfire Detected" },
    DtcDescription { code: "P0171", description: "System Too Lean (Bank 1)" },
];

/// Default description for a DTC code not present in [`DTC_DESCRIPTIONS`].
pub const UNKNOWN_DTC_DESCRIPTION: &str = "Unknown DTC";

/// Looks up a DTC's description, defaulting to [`UNKNOWN_DTC_DESCRIPTION`].
pub fn dtc_description(code: &str) -> &'static str {
    DTC_DESCRIPTIONS
        .iter()
        .find(|d| d.code == code)
        .map(|d| d.description)
        .unwrap_or(UNKNOWN_DTC_DESCRIPTION)
}

/// Looks up the human-readable text for a DPF regeneration status byte.
pub fn dpf_regen_status_text(status: u8) -> &'static str {
    match status {
        0x00 => "Inactive",
        0x01 => "In progress",
        0x02 => "Completed",
        0x03 => "Interrupted",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_to_rx_uses_the_table_for_bsi() {
        assert_eq!(tx_to_rx("765"), "76D");
    }

    #[test]
    fn tx_to_rx_falls_back_to_plus_eight() {
        assert_eq!(tx_to_rx("7E0"), "7E8");
        assert_eq!(tx_to_rx("7E1"), "7E9");
    }

    #[test]
    fn rpm_decode_matches_invariant() {
        let value = decode_rpm(&[0x0B, 0xB8]).unwrap();
        assert_eq!(value, DidValue::Scalar(750.0));
    }

    #[test]
    fn injector_corrections_decode_matches_invariant() {
        let value = decode_injector_corrections(&[0xFF, 0x9C, 0x00, 0x64, 0xFE, 0x0C, 0x01, 0xF4]).unwrap();
        assert_eq!(value, DidValue::InjectorCorrections([-1.00, 1.00, -5.00, 5.00]));
    }

    #[test]
    fn unknown_dtc_defaults() {
        assert_eq!(dtc_description("P9999"), UNKNOWN_DTC_DESCRIPTION);
    }
}
