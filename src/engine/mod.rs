//! Orchestration: ECU discovery/selection, session control, TesterPresent
//! keep-alive, DID catalog application, and DTC decoding.
//!
//! [`DiagnosticEngine`] is the type the excluded presentation layer talks to; it
//! owns a [`UdsClient`]-shaped set of free functions in [`crate::uds`] plus the
//! [`AdapterController`] those functions drive, and is the only place session
//! state and the TesterPresent keep-alive task live.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{AdapterController, LogSink, StateSink};
use crate::catalogs::{self, DidValue};
use crate::dtc::Dtc;
use crate::hardware::Transport;
use crate::uds;
use crate::{DiagError, DiagServerResult};

/// Engine-facing configuration. None of this is persisted by the core; the
/// excluded platform layer owns loading/saving it if it wants to.
#[derive(Debug, Clone)]
pub struct DiagConfig {
    /// Read deadline for ordinary exchanges, in milliseconds.
    pub read_timeout_ms: u64,
    /// Read deadline for slow operations (0x19, 0x14), in milliseconds.
    pub slow_read_timeout_ms: u64,
    /// TesterPresent cadence while the session is extended, in milliseconds.
    /// Clamped to at most 4,000 ms regardless of the value supplied, since a
    /// longer cadence risks the session timing out on real hardware.
    pub tester_present_interval_ms: u64,
    /// Consecutive `ReadTimeout`s the engine tolerates before forcing a
    /// disconnect.
    pub max_consecutive_timeouts: u32,
    /// ECU code preferred when `initialize` detects more than one candidate.
    pub preferred_ecu: String,
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: crate::hardware::DEFAULT_READ_DEADLINE_MS,
            slow_read_timeout_ms: crate::hardware::SLOW_READ_DEADLINE_MS,
            tester_present_interval_ms: 2_000,
            max_consecutive_timeouts: 3,
            preferred_ecu: "ECM".to_string(),
        }
    }
}

impl DiagConfig {
    /// Builds a config, clamping `tester_present_interval_ms` to the crate's
    /// required ceiling regardless of what was requested.
    pub fn new(tester_present_interval_ms: u64) -> Self {
        Self {
            tester_present_interval_ms: tester_present_interval_ms.min(4_000),
            ..Self::default()
        }
    }
}

/// Current diagnostic session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Session {
    /// Default session; TesterPresent is not running.
    Default,
    /// Extended session; TesterPresent keep-alive is active.
    Extended,
}

/// Identification strings read from an ECU. Unreadable fields become `"N/A"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuIdentification {
    /// DID 0xF080.
    pub part_number: String,
    /// DID 0xF0FE.
    pub calibration: String,
    /// DID 0xF091.
    pub hardware_number: String,
}

/// An ECU detected during `initialize`, with its identification filled in
/// lazily by [`DiagnosticEngine::identify_ecu`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedEcu {
    /// The catalogued address.
    pub address: &'static catalogs::EcuAddress,
    /// Identification strings; empty until [`DiagnosticEngine::identify_ecu`] runs.
    pub identification: EcuIdentification,
}

/// The result of reading one catalogued DID.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DidReading {
    /// Numeric identifier requested.
    pub did: u16,
    /// Catalog name.
    pub name: &'static str,
    /// Catalog unit.
    pub unit: &'static str,
    /// Raw payload bytes, `62 didHi didLo` prefix already stripped.
    pub raw: Vec<u8>,
    /// Decoded value.
    pub value: DidValue,
    /// Human-readable rendering, per the formatting rules in the crate docs.
    pub formatted: String,
}

/// Whether a DID group prefix (`0xD0..0xDF`) answered at all during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupScanResult {
    /// The group prefix scanned (high byte of a 0xDxxx DID).
    pub group: u8,
    /// True if the group answered with neither `NoData` nor a negative response.
    pub active: bool,
}

/// A snapshot of the engine-group DIDs. Any field the ECU didn't answer is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineData {
    /// DID 0xD41F, rpm.
    pub rpm: Option<f64>,
    /// DID 0xD420, °C.
    pub coolant_temp_c: Option<f64>,
    /// DID 0xD421, °C.
    pub intake_air_temp_c: Option<f64>,
    /// DID 0xD422, V.
    pub battery_voltage_v: Option<f64>,
}

/// A snapshot of the DPF-group DIDs. Any field the ECU didn't answer is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DpfData {
    /// DID 0xD546, g/l.
    pub soot_loading_g_per_l: Option<f64>,
    /// DID 0xD547, km.
    pub distance_since_regen_km: Option<f64>,
    /// DID 0xD548, looked up in [`catalogs::dpf_regen_status_text`].
    pub regen_status: Option<&'static str>,
}

fn requires_extended_session(group: u8) -> bool {
    matches!(group, 0xD4 | 0xD5 | 0xD7)
}

fn format_value(value: &DidValue, unit: &str) -> String {
    match value {
        DidValue::Scalar(v) => {
            let decimals = match unit {
                "rpm" | "km" | "" => 0,
                "\u{b0}C" | "%" => 1,
                "V" | "mm\u{b3}" => 2,
                _ => 1,
            };
            if unit.is_empty() {
                format!("{v:.decimals$}")
            } else {
                format!("{v:.decimals$} {unit}")
            }
        }
        DidValue::InjectorCorrections(values) => values.iter().map(|v| format!("{v:.2}")).collect::<Vec<_>>().join(", "),
        DidValue::Text(s) => s.clone(),
    }
}

struct KeepAlive {
    cancel: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// Orchestrates ECU discovery/selection, session control, the TesterPresent
/// keep-alive, DID reads and DTC read/clear.
#[allow(missing_debug_implementations)]
pub struct DiagnosticEngine {
    adapter: Arc<AdapterController>,
    config: DiagConfig,
    detected: Vec<DetectedEcu>,
    session: Session,
    /// Shared with the keep-alive thread so a `ReadTimeout` hit by either the
    /// foreground caller or the background `TesterPresent` tick counts toward
    /// the same threshold.
    consecutive_timeouts: Arc<AtomicU32>,
    keep_alive: Option<KeepAlive>,
}

impl DiagnosticEngine {
    /// Builds an engine around `transport`, spawning the adapter's worker thread
    /// but not yet running `initialize`.
    pub fn new(transport: Box<dyn Transport>, config: DiagConfig, on_log: Option<LogSink>, on_state_changed: Option<StateSink>) -> Self {
        Self {
            adapter: Arc::new(AdapterController::new(transport, on_log, on_state_changed)),
            config,
            detected: Vec::new(),
            session: Session::Default,
            consecutive_timeouts: Arc::new(AtomicU32::new(0)),
            keep_alive: None,
        }
    }

    fn record_result<T>(&mut self, result: DiagServerResult<T>) -> DiagServerResult<T> {
        match &result {
            Err(DiagError::ReadTimeout) => {
                let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.max_consecutive_timeouts {
                    log::warn!("disconnecting after {count} consecutive read timeouts");
                    self.disconnect();
                }
            }
            _ => self.consecutive_timeouts.store(0, Ordering::SeqCst),
        }
        result
    }

    /// Runs `AdapterController::initialize` and caches the detected ECU set.
    pub fn initialize(&mut self) -> DiagServerResult<()> {
        let result = self.adapter.initialize().map_err(DiagError::from);
        let addresses = self.record_result(result)?;
        self.detected = addresses
            .into_iter()
            .map(|address| DetectedEcu { address, identification: EcuIdentification::default() })
            .collect();
        Ok(())
    }

    /// The ECUs detected by the last `initialize` call.
    pub fn detected_ecus(&self) -> &[DetectedEcu] {
        &self.detected
    }

    /// Selects an ECU by its catalog code. Idempotent.
    pub fn select_ecu(&mut self, code: &str) -> DiagServerResult<()> {
        let ecu = catalogs::by_code(code).ok_or(DiagError::ProtocolMismatch)?;
        let result = self.adapter.select_ecu(ecu.tx, ecu.rx).map_err(DiagError::from);
        self.record_result(result)
    }

    fn ensure_extended_session(&mut self) -> DiagServerResult<()> {
        if self.session == Session::Extended {
            return Ok(());
        }
        let result = match uds::diagnostic_session_control::set_extended_session(&self.adapter) {
            Ok(()) | Err(DiagError::NoData) => {
                self.session = Session::Extended;
                self.start_keep_alive();
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.record_result(result)
    }

    /// The diagnostic session last established (or assumed established after a
    /// sparse `NoData` reply to `1003`).
    pub fn session(&self) -> Session {
        self.session
    }

    /// Consecutive `ReadTimeout`s observed since the last successful exchange,
    /// whether hit directly by a foreground call or by the keep-alive task.
    /// Resets to zero on any result that isn't a timeout.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    fn start_keep_alive(&mut self) {
        if self.keep_alive.is_some() {
            return;
        }
        let adapter = self.adapter.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_thread = cancel.clone();
        let timeouts = self.consecutive_timeouts.clone();
        let max_consecutive_timeouts = self.config.max_consecutive_timeouts;
        let interval = Duration::from_millis(self.config.tester_present_interval_ms);
        let handle = std::thread::spawn(move || {
            const POLL: Duration = Duration::from_millis(50);
            'ticks: while !cancel_thread.load(Ordering::Relaxed) {
                let mut waited = Duration::ZERO;
                while waited < interval {
                    if cancel_thread.load(Ordering::Relaxed) {
                        break 'ticks;
                    }
                    std::thread::sleep(POLL);
                    waited += POLL;
                }
                match uds::tester_present::tester_present(&adapter) {
                    Ok(()) => timeouts.store(0, Ordering::SeqCst),
                    Err(DiagError::ReadTimeout) => {
                        let count = timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                        log::debug!("tester present keep-alive timed out ({count}/{max_consecutive_timeouts})");
                        if count >= max_consecutive_timeouts {
                            log::warn!("keep-alive forcing a disconnect after {count} consecutive read timeouts");
                            let _ = adapter.shutdown();
                            break 'ticks;
                        }
                    }
                    Err(e) => log::debug!("tester present keep-alive tick failed: {e}"),
                }
            }
        });
        self.keep_alive = Some(KeepAlive { cancel, handle });
    }

    fn stop_keep_alive(&mut self) {
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.cancel.store(true, Ordering::Relaxed);
            let _ = keep_alive.handle.join();
        }
    }

    /// Reads `did`, decodes it with the catalog decoder, and returns the typed,
    /// formatted result. Opens an extended session first if the DID's group
    /// requires one.
    pub fn read_did(&mut self, did: u16) -> DiagServerResult<DidReading> {
        let entry = catalogs::did_by_id(did).ok_or(DiagError::ProtocolMismatch)?;
        if requires_extended_session(entry.group) {
            self.ensure_extended_session()?;
        }
        let result = (|| {
            let raw = uds::read_data_by_identifier::read_data_by_identifier(&self.adapter, did)?;
            let value = (entry.decode)(&raw).ok_or(DiagError::ProtocolMismatch)?;
            let formatted = format_value(&value, entry.unit);
            Ok(DidReading { did, name: entry.name, unit: entry.unit, raw, value, formatted })
        })();
        self.record_result(result)
    }

    fn read_scalar_or_none(&mut self, did: u16) -> DiagServerResult<Option<f64>> {
        match self.read_did(did) {
            Ok(reading) => Ok(match reading.value {
                DidValue::Scalar(v) => Some(v),
                _ => None,
            }),
            Err(DiagError::NoData) | Err(DiagError::ProtocolMismatch) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_regen_status_or_none(&mut self, did: u16) -> DiagServerResult<Option<&'static str>> {
        match self.read_did(did) {
            Ok(reading) => Ok(match reading.value {
                DidValue::Scalar(v) => Some(catalogs::dpf_regen_status_text(v as u8)),
                _ => None,
            }),
            Err(DiagError::NoData) | Err(DiagError::ProtocolMismatch) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads the engine-group DIDs (rpm, coolant/intake temperature, battery
    /// voltage) in one batch. A field the ECU didn't answer becomes `None`
    /// rather than failing the whole snapshot.
    pub fn read_engine_snapshot(&mut self) -> DiagServerResult<EngineData> {
        self.ensure_extended_session()?;
        Ok(EngineData {
            rpm: self.read_scalar_or_none(0xD41F)?,
            coolant_temp_c: self.read_scalar_or_none(0xD420)?,
            intake_air_temp_c: self.read_scalar_or_none(0xD421)?,
            battery_voltage_v: self.read_scalar_or_none(0xD422)?,
        })
    }

    /// Reads the DPF-group DIDs (soot loading, distance since regeneration,
    /// regeneration status). A field the ECU didn't answer becomes `None`.
    pub fn read_dpf_snapshot(&mut self) -> DiagServerResult<DpfData> {
        self.ensure_extended_session()?;
        Ok(DpfData {
            soot_loading_g_per_l: self.read_scalar_or_none(0xD546)?,
            distance_since_regen_km: self.read_scalar_or_none(0xD547)?,
            regen_status: self.read_regen_status_or_none(0xD548)?,
        })
    }

    /// Reads DID 0xD482 and splits its 8 payload bytes into four injector trim
    /// corrections in mm³.
    pub fn read_injector_corrections(&mut self) -> DiagServerResult<[f64; 4]> {
        let reading = self.read_did(0xD482)?;
        match reading.value {
            DidValue::InjectorCorrections(values) => Ok(values),
            _ => Err(DiagError::ProtocolMismatch),
        }
    }

    /// Scans DID group prefixes `0xD0..0xDF`, marking a group active when its
    /// probe answers with neither `NoData` nor a negative response.
    pub fn scan_did_groups(&mut self) -> DiagServerResult<Vec<GroupScanResult>> {
        self.ensure_extended_session()?;
        let mut results = Vec::with_capacity(16);
        for group in 0xD0u8..=0xDF {
            let request = format!("22{group:02X}00");
            let deadline = Duration::from_millis(self.config.read_timeout_ms);
            let active = match uds::send_request(&self.adapter, &request, deadline) {
                Ok(_) => true,
                Err(DiagError::NoData) | Err(DiagError::NegativeResponse { .. }) => false,
                Err(e) => return self.record_result(Err(e)),
            };
            results.push(GroupScanResult { group, active });
        }
        self.record_result(Ok(results))
    }

    /// Reads DTCs matching status mask `0xFF`, preserving on-wire order.
    pub fn read_dtcs(&mut self) -> DiagServerResult<Vec<Dtc>> {
        self.ensure_extended_session()?;
        let result = uds::read_dtc_information::read_dtcs_by_status_mask(&self.adapter);
        self.record_result(result)
    }

    /// Clears all diagnostic information. Returns `Ok(true)` on success; a
    /// negative response (e.g. `conditionsNotCorrect`) surfaces as `Err`.
    pub fn clear_dtcs(&mut self) -> DiagServerResult<bool> {
        self.ensure_extended_session()?;
        let result = uds::clear_diagnostic_information::clear_all(&self.adapter).map(|()| true);
        self.record_result(result)
    }

    fn read_identification_field(&mut self, did: u16) -> DiagServerResult<String> {
        match self.read_did(did) {
            Ok(reading) => match reading.value {
                DidValue::Text(s) if !s.is_empty() => Ok(s),
                _ => Ok("N/A".to_string()),
            },
            Err(_) => Ok("N/A".to_string()),
        }
    }

    /// Reads part number, calibration and hardware number, caching the result
    /// on the matching [`DetectedEcu`].
    pub fn identify_ecu(&mut self, code: &str) -> DiagServerResult<EcuIdentification> {
        self.ensure_extended_session()?;
        let identification = EcuIdentification {
            part_number: self.read_identification_field(0xF080)?,
            calibration: self.read_identification_field(0xF0FE)?,
            hardware_number: self.read_identification_field(0xF091)?,
        };
        if let Some(detected) = self.detected.iter_mut().find(|e| e.address.code.eq_ignore_ascii_case(code)) {
            detected.identification = identification.clone();
        }
        Ok(identification)
    }

    /// Cancels the TesterPresent keep-alive, closes the transport and resets
    /// the adapter's state, and waits for the adapter worker to acknowledge
    /// the teardown before returning.
    pub fn disconnect(&mut self) {
        self.stop_keep_alive();
        if let Err(e) = self.adapter.shutdown() {
            log::debug!("adapter shutdown during disconnect reported: {e}");
        }
        self.session = Session::Default;
    }
}

impl Drop for DiagnosticEngine {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Transport, TransportResult};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedTransport(Mutex<VecDeque<String>>);

    impl Transport for ScriptedTransport {
        fn write_line(&mut self, _cmd: &str) -> TransportResult<()> {
            Ok(())
        }

        fn read_until_prompt(&mut self, _deadline: Duration) -> TransportResult<String> {
            Ok(self.0.get_mut().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn engine_with(replies: &[&str]) -> DiagnosticEngine {
        let transport = ScriptedTransport(Mutex::new(replies.iter().map(|s| s.to_string()).collect()));
        DiagnosticEngine::new(Box::new(transport), DiagConfig::default(), None, None)
    }

    #[test]
    fn probe_and_discover_yields_ecm_and_tcm() {
        let mut engine = engine_with(&[
            "ELM327 v1.5", "", "", "", "", "", "", "",
            "7E8 06 41 00 BE 3F A8 13\r7E9 06 41 00 88 18 00 01",
            "", "", "", "", "",
        ]);
        engine.initialize().unwrap();
        let codes: Vec<&str> = engine.detected_ecus().iter().map(|e| e.address.code).collect();
        assert_eq!(codes, vec!["ECM", "TCM"]);
    }

    #[test]
    fn reads_soot_loading_did() {
        let mut engine = engine_with(&["50", "7E8 04 62 D5 46 12 34"]);
        let reading = engine.read_did(0xD546).unwrap();
        match reading.value {
            DidValue::Scalar(v) => assert!((v - 46.60).abs() < 1e-9),
            _ => panic!("expected scalar"),
        }
    }

    #[test]
    fn clear_dtcs_reports_negative_response() {
        let mut engine = engine_with(&["50", "7E8 03 7F 14 22"]);
        let err = engine.clear_dtcs().unwrap_err();
        assert!(matches!(err, DiagError::NegativeResponse { service: 0x14, nrc: 0x22 }));
    }

    #[test]
    fn clear_dtcs_succeeds() {
        let mut engine = engine_with(&["50", "7E8 01 54"]);
        assert_eq!(engine.clear_dtcs().unwrap(), true);
    }
}
