//! End-to-end scenarios driving [`elm_diag_core::engine::DiagnosticEngine`] through a
//! scripted fake transport, grounded in the same fake-channel-plus-scripted-replies
//! style the core's adapter unit tests use.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use elm_diag_core::engine::{DiagConfig, DiagnosticEngine};
use elm_diag_core::hardware::{Transport, TransportResult};
use elm_diag_core::DiagError;

struct ScriptedTransport(Mutex<VecDeque<String>>);

impl ScriptedTransport {
    fn new(replies: &[&str]) -> Self {
        Self(Mutex::new(replies.iter().map(|s| s.to_string()).collect()))
    }
}

impl Transport for ScriptedTransport {
    fn write_line(&mut self, _cmd: &str) -> TransportResult<()> {
        Ok(())
    }

    fn read_until_prompt(&mut self, _deadline: Duration) -> TransportResult<String> {
        Ok(self.0.get_mut().unwrap().pop_front().unwrap_or_default())
    }
}

fn engine_with(replies: &[&str]) -> DiagnosticEngine {
    DiagnosticEngine::new(Box::new(ScriptedTransport::new(replies)), DiagConfig::default(), None, None)
}

const INIT_OK: [&str; 9] = [
    "ELM327 v1.5", "", "", "", "", "", "", "",
    "7E8 06 41 00 BE 3F A8 13",
];

#[test]
fn injector_corrections_decode_from_live_read() {
    let _ = env_logger::try_init();
    let mut replies: Vec<&str> = INIT_OK.to_vec();
    replies.extend_from_slice(&["", "", "", "", ""]); // select_ecu(ECM) during initialize
    replies.push("50"); // 1003 extended session
    replies.push("7E8 0B 62 D4 82 FF 9C 00 64 FE 0C 01 F4"); // read DID 0xD482, single frame, 11 payload bytes
    let mut engine = engine_with(&replies);
    engine.initialize().unwrap();

    let corrections = engine.read_injector_corrections().unwrap();
    assert_eq!(corrections, [-1.00, 1.00, -5.00, 5.00]);
}

#[test]
fn identification_falls_back_to_na_on_rejected_reads() {
    let mut replies: Vec<&str> = INIT_OK.to_vec();
    replies.extend_from_slice(&["", "", "", "", ""]);
    replies.push("50"); // extended session
    replies.push("NO DATA"); // F080
    replies.push("7E8 07 62 F0 FE 41 42 43 31"); // F0FE -> "ABC1"
    replies.push("7F 22 31"); // F091 negative response
    let mut engine = engine_with(&replies);
    engine.initialize().unwrap();

    let ident = engine.identify_ecu("ECM").unwrap();
    assert_eq!(ident.part_number, "N/A");
    assert_eq!(ident.calibration, "ABC1");
    assert_eq!(ident.hardware_number, "N/A");
    assert_eq!(engine.detected_ecus()[0].identification, ident);
}

#[test]
fn did_group_scan_marks_only_answering_groups_active() {
    let mut replies: Vec<&str> = INIT_OK.to_vec();
    replies.extend_from_slice(&["", "", "", "", ""]);
    replies.push("50"); // extended session
    for group in 0xD0u8..=0xDF {
        if group == 0xD4 {
            replies.push("7E8 04 62 D4 00 00 00");
        } else {
            replies.push("NO DATA");
        }
    }
    let owned: Vec<String> = replies.iter().map(|s| s.to_string()).collect();
    let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
    let mut engine = engine_with(&refs);
    engine.initialize().unwrap();

    let scan = engine.scan_did_groups().unwrap();
    assert_eq!(scan.len(), 16);
    assert!(scan.iter().find(|g| g.group == 0xD4).unwrap().active);
    assert!(!scan.iter().find(|g| g.group == 0xD0).unwrap().active);
}

#[test]
fn read_dtcs_reassembles_first_and_consecutive_frame() {
    let _ = env_logger::try_init();
    let mut replies: Vec<&str> = INIT_OK.to_vec();
    replies.extend_from_slice(&["", "", "", "", ""]); // select_ecu(ECM) during initialize
    replies.push("50"); // 1003 extended session
    replies.push("7E8 10 09 59 02 FF 04 20 09\r7E8 21 01 34 08"); // 1902FF, First + Consecutive Frame
    let mut engine = engine_with(&replies);
    engine.initialize().unwrap();

    let dtcs = engine.read_dtcs().unwrap();
    assert_eq!(dtcs.len(), 2);
    assert_eq!(dtcs[0].code, "P0420");
    assert_eq!(dtcs[0].status, 0x09);
    assert_eq!(dtcs[1].code, "P0134");
    assert_eq!(dtcs[1].status, 0x08);
}

#[test]
fn disconnect_closes_the_transport_and_resets_adapter_state() {
    let _ = env_logger::try_init();
    let mut replies: Vec<&str> = INIT_OK.to_vec();
    replies.extend_from_slice(&["", "", "", "", ""]);
    let mut engine = engine_with(&replies);
    engine.initialize().unwrap();

    engine.disconnect();

    let err = engine.read_did(0xD41F).unwrap_err();
    assert!(matches!(err, DiagError::Io(_)));
}

#[test]
fn repeated_read_timeouts_are_counted_and_trip_the_threshold() {
    struct AlwaysTimesOut;
    impl Transport for AlwaysTimesOut {
        fn write_line(&mut self, _cmd: &str) -> TransportResult<()> {
            Ok(())
        }
        fn read_until_prompt(&mut self, _deadline: Duration) -> TransportResult<String> {
            Err(elm_diag_core::hardware::TransportError::ReadTimeout)
        }
    }

    let mut config = DiagConfig::default();
    config.max_consecutive_timeouts = 2;
    let mut engine = DiagnosticEngine::new(Box::new(AlwaysTimesOut), config, None, None);

    let first = engine.read_did(0xD41F).unwrap_err();
    assert!(matches!(first, DiagError::ReadTimeout));
    assert_eq!(engine.consecutive_timeouts(), 1);

    let second = engine.read_did(0xD41F).unwrap_err();
    assert!(matches!(second, DiagError::ReadTimeout));
    assert_eq!(engine.consecutive_timeouts(), 2);
}
