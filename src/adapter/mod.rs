//! Adapter configuration state and the single serialization gate onto the
//! [`crate::hardware::Transport`].
//!
//! [`AdapterController`] is the only component in this crate allowed to see raw
//! adapter bytes. Every public operation is funneled through a background worker
//! thread that owns both the `Transport` and the [`AdapterState`], servicing an
//! ordered queue of requests — a message-passing stand-in for the single
//! exclusive mutex the design calls for, chosen because it makes cancellation
//! (dropping the reply receiver) and ordering (FIFO queue drain) free properties
//! instead of things a lock has to be disciplined about.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::catalogs;
use crate::hardware::{Transport, TransportError, DEFAULT_READ_DEADLINE_MS};

/// Adapter controller result.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by [`AdapterController`].
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Propagated from the underlying transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A configuration command (`ATCRA`/`ATFCSH`/...) was answered with `ERROR` or `?`.
    #[error("adapter rejected a configuration command")]
    AdapterRejected,
    /// A reset/disconnect-style command was attempted after the bus went active.
    #[error("command forbidden once the CAN bus is active")]
    ForbiddenAfterBusActive,
    /// The `0100` bus probe during `initialize` returned `NO DATA`, `UNABLE` or `ERROR`.
    #[error("0100 bus probe returned no usable reply")]
    BusProbeFailed,
    /// The worker thread has already exited (the controller was dropped or the
    /// thread panicked); the request was never serviced.
    #[error("adapter worker thread is no longer running")]
    WorkerGone,
}

/// Lifecycle phase of the connection to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterPhase {
    /// No transport is open.
    Disconnected,
    /// A transport is being opened.
    Connecting,
    /// Transport open, `initialize` not yet run.
    Connected,
    /// Running the `initialize` AT-command sequence and bus probe.
    Initializing,
    /// Initialized, bus active, ready for diagnostic traffic.
    Ready,
    /// A fatal error occurred; the connection must be torn down and reopened.
    Errored,
}

/// Whether the adapter's transmit header is programmed to broadcast.
///
/// Once [`AdapterState::can_bus_active`] is set the header is always
/// [`HeaderMode::Broadcast`] — see the crate-level docs for why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// Not yet programmed.
    Unset,
    /// Programmed to `0x7DF`.
    Broadcast,
}

/// A snapshot of the configuration currently programmed into the adapter.
#[derive(Debug, Clone)]
pub struct AdapterState {
    /// Current lifecycle phase.
    pub phase: AdapterPhase,
    /// Current transmit header mode.
    pub header_mode: HeaderMode,
    /// Last `ATCRA` value, if any.
    pub rx_filter: Option<String>,
    /// Last `ATFCSH` value, if any.
    pub flow_control_header: Option<String>,
    /// Whether adapter echo is disabled (`ATE0`).
    pub echo: bool,
    /// Whether adapter linefeeds are disabled (`ATL0`).
    pub linefeed: bool,
    /// Whether CAN headers are shown in replies (`ATH1`).
    pub headers_shown: bool,
    /// Whether spaces are shown between hex bytes (`ATS1`).
    pub spaces_shown: bool,
    /// Becomes true after the first successful `0100` bus probe. Reset commands
    /// are refused once this is true.
    pub can_bus_active: bool,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            phase: AdapterPhase::Disconnected,
            header_mode: HeaderMode::Unset,
            rx_filter: None,
            flow_control_header: None,
            echo: true,
            linefeed: true,
            headers_shown: false,
            spaces_shown: false,
            can_bus_active: false,
        }
    }
}

const FORBIDDEN_AFTER_BUS_ACTIVE: [&str; 5] = ["ATZ", "ATD", "ATWS", "ATH0", "ATS0"];

const INIT_STEPS: [&str; 8] = ["ATZ", "ATE0", "ATL0", "ATH1", "ATS1", "ATSP6", "ATST64", "ATAT1"];

/// Log sink signature; see [`AdapterController::new`].
pub type LogSink = Box<dyn Fn(&str) + Send>;
/// State-change sink signature; see [`AdapterController::new`].
pub type StateSink = Box<dyn Fn(AdapterPhase) + Send>;

enum Job {
    Initialize(mpsc::Sender<AdapterResult<Vec<&'static catalogs::EcuAddress>>>),
    Exchange(String, Duration, mpsc::Sender<AdapterResult<String>>),
    SelectEcu(String, String, mpsc::Sender<AdapterResult<()>>),
    SendPayload(String, Vec<String>, Duration, mpsc::Sender<AdapterResult<String>>),
    State(mpsc::Sender<AdapterResult<AdapterState>>),
    Shutdown(mpsc::Sender<AdapterResult<()>>),
}

/// Owns [`AdapterState`], the [`Transport`] and the single serialization gate.
///
/// Every public method blocks the calling thread until the background worker
/// has serviced the request; no two requests are ever in flight against the
/// transport at once, and their observable order matches the order in which
/// callers invoked these methods.
#[allow(missing_debug_implementations)]
pub struct AdapterController {
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl AdapterController {
    /// Spawns the worker thread that owns `transport` for the lifetime of the connection.
    ///
    /// `on_log` and `on_state_changed` are optional observer sinks invoked from the
    /// worker thread; they must not block.
    pub fn new(
        transport: Box<dyn Transport>,
        on_log: Option<LogSink>,
        on_state_changed: Option<StateSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::spawn(move || Self::run(rx, transport, on_log, on_state_changed));
        Self {
            jobs: Some(tx),
            worker: Some(worker),
        }
    }

    /// Opens the transport via `opener` and runs `initialize` on it.
    ///
    /// `opener` is handed `device_handle` and is responsible for producing an
    /// already-configured transport (baud rate, framing, ...); this function
    /// doesn't know or care what kind of handle it was given — that's the
    /// excluded platform layer's job (resolving a paired Bluetooth device or a
    /// named serial port down to an open [`Transport`]).
    pub fn connect<H>(
        device_handle: H,
        opener: impl FnOnce(H) -> crate::hardware::TransportResult<Box<dyn Transport>>,
        on_log: Option<LogSink>,
        on_state_changed: Option<StateSink>,
    ) -> AdapterResult<(Self, Vec<&'static catalogs::EcuAddress>)> {
        let transport = opener(device_handle)?;
        let controller = Self::new(transport, on_log, on_state_changed);
        let detected = controller.initialize()?;
        Ok((controller, detected))
    }

    fn call<T>(&self, build: impl FnOnce(mpsc::Sender<AdapterResult<T>>) -> Job) -> AdapterResult<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let job = build(reply_tx);
        self.jobs
            .as_ref()
            .ok_or(AdapterError::WorkerGone)?
            .send(job)
            .map_err(|_| AdapterError::WorkerGone)?;
        reply_rx.recv().map_err(|_| AdapterError::WorkerGone)?
    }

    /// Runs the `ATZ`..`ATAT1` sequence, probes the bus with `0100`, and switches to
    /// broadcast mode for the first detected ECU (preferring `ECM`). Returns the
    /// detected ECU addresses.
    pub fn initialize(&self) -> AdapterResult<Vec<&'static catalogs::EcuAddress>> {
        self.call(Job::Initialize)
    }

    /// Sends `command` under the gate, intercepting `ATSH<addr>` as described in the
    /// crate docs, and returns the cleaned reply (echo stripped, `OK`/`SEARCHING` lines
    /// dropped).
    pub fn exchange(&self, command: &str, deadline: Duration) -> AdapterResult<String> {
        self.call(|reply| Job::Exchange(command.to_string(), deadline, reply))
    }

    /// Programs the adapter to receive from `rx` and use `tx` as the flow-control
    /// header, leaving the transmit header at broadcast. A no-op if already programmed
    /// for this pair.
    pub fn select_ecu(&self, tx: &str, rx: &str) -> AdapterResult<()> {
        self.call(|reply| Job::SelectEcu(tx.to_string(), rx.to_string(), reply))
    }

    /// Runs each of `pre_commands` (subject to the same `ATSH` interception as
    /// [`Self::exchange`]), then sends `data_hex` and returns its cleaned reply.
    pub fn send_payload(&self, data_hex: &str, pre_commands: &[String], deadline: Duration) -> AdapterResult<String> {
        self.call(|reply| Job::SendPayload(data_hex.to_string(), pre_commands.to_vec(), deadline, reply))
    }

    /// Returns a snapshot of the current adapter state.
    pub fn state(&self) -> AdapterResult<AdapterState> {
        self.call(Job::State)
    }

    /// Closes the transport and resets [`AdapterState`] to its default, then stops
    /// the worker thread from accepting any further request. Blocks until the
    /// worker has acknowledged the teardown.
    ///
    /// Idempotent in effect: a second call observes `WorkerGone` once the worker
    /// has exited, which is the correct outcome for a connection that is already
    /// torn down.
    pub fn shutdown(&self) -> AdapterResult<()> {
        self.call(Job::Shutdown)
    }

    fn run(jobs: mpsc::Receiver<Job>, transport: Box<dyn Transport>, on_log: Option<LogSink>, on_state_changed: Option<StateSink>) {
        let mut worker = Worker {
            transport,
            state: AdapterState::default(),
            on_log,
            on_state_changed,
        };
        for job in jobs {
            match job {
                Job::Initialize(reply) => {
                    let result = worker.initialize();
                    let _ = reply.send(result);
                }
                Job::Exchange(cmd, deadline, reply) => {
                    let result = worker.exchange_public(&cmd, deadline);
                    let _ = reply.send(result);
                }
                Job::SelectEcu(tx, rx, reply) => {
                    let result = worker.select_ecu(&tx, &rx);
                    let _ = reply.send(result);
                }
                Job::SendPayload(data_hex, pre_commands, deadline, reply) => {
                    let result = worker.send_payload(&data_hex, &pre_commands, deadline);
                    let _ = reply.send(result);
                }
                Job::State(reply) => {
                    let _ = reply.send(Ok(worker.state.clone()));
                }
                Job::Shutdown(reply) => {
                    worker.shutdown();
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }
    }
}

impl Drop for AdapterController {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    transport: Box<dyn Transport>,
    state: AdapterState,
    on_log: Option<LogSink>,
    on_state_changed: Option<StateSink>,
}

impl Worker {
    fn set_phase(&mut self, phase: AdapterPhase) {
        self.state.phase = phase;
        if let Some(cb) = &self.on_state_changed {
            cb(phase);
        }
    }

    fn log(&self, line: &str) {
        if let Some(cb) = &self.on_log {
            cb(line);
        }
    }

    fn raw_exchange(&mut self, cmd: &str, deadline: Duration) -> AdapterResult<String> {
        let cmd = cmd.trim().to_uppercase();
        self.log(&format!("-> {cmd}"));
        self.transport.write_line(&cmd)?;
        let raw = self.transport.read_until_prompt(deadline)?;
        self.log(&format!("<- {}", raw.escape_debug()));
        Ok(clean_reply(&raw, &cmd))
    }

    fn exchange_public(&mut self, command: &str, deadline: Duration) -> AdapterResult<String> {
        let cmd = command.trim().to_uppercase();
        if self.state.can_bus_active && FORBIDDEN_AFTER_BUS_ACTIVE.contains(&cmd.as_str()) {
            return Err(AdapterError::ForbiddenAfterBusActive);
        }
        if cmd.starts_with("ATSH") && cmd != "ATSH7DF" {
            self.intercept_atsh(&cmd[4..], deadline)
        } else {
            self.raw_exchange(&cmd, deadline)
        }
    }

    /// Rewrites an addressed `ATSH<addr>` into the broadcast-plus-filter sequence every
    /// clone adapter actually honours, atomically with respect to other callers since
    /// this whole function runs while the worker holds the only reference to `self`.
    fn intercept_atsh(&mut self, suffix: &str, deadline: Duration) -> AdapterResult<String> {
        let rx = catalogs::tx_to_rx(suffix);
        self.raw_exchange(&format!("ATCRA{rx}"), deadline)?;
        self.raw_exchange(&format!("ATFCSH{suffix}"), deadline)?;
        self.raw_exchange("ATFCSD300000", deadline)?;
        self.raw_exchange("ATFCSM1", deadline)?;
        let last = self.raw_exchange("ATSH7DF", deadline)?;
        self.state.rx_filter = Some(rx);
        self.state.flow_control_header = Some(suffix.to_string());
        self.state.header_mode = HeaderMode::Broadcast;
        Ok(last)
    }

    fn select_ecu(&mut self, tx: &str, rx: &str) -> AdapterResult<()> {
        if self.state.flow_control_header.as_deref() == Some(tx) && self.state.rx_filter.as_deref() == Some(rx) {
            return Ok(());
        }
        let deadline = Duration::from_millis(DEFAULT_READ_DEADLINE_MS);
        let r1 = self.raw_exchange(&format!("ATCRA{rx}"), deadline)?;
        check_rejected(&r1)?;
        let r2 = self.raw_exchange(&format!("ATFCSH{tx}"), deadline)?;
        check_rejected(&r2)?;
        self.raw_exchange("ATFCSD300000", deadline)?;
        self.raw_exchange("ATFCSM1", deadline)?;
        self.raw_exchange("ATSH7DF", deadline)?;
        self.state.rx_filter = Some(rx.to_string());
        self.state.flow_control_header = Some(tx.to_string());
        self.state.header_mode = HeaderMode::Broadcast;
        Ok(())
    }

    fn send_payload(&mut self, data_hex: &str, pre_commands: &[String], deadline: Duration) -> AdapterResult<String> {
        for pre in pre_commands {
            let cmd = pre.trim().to_uppercase();
            if cmd.starts_with("ATSH") && cmd != "ATSH7DF" {
                self.intercept_atsh(&cmd[4..], deadline)?;
            } else {
                self.raw_exchange(&cmd, deadline)?;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.raw_exchange(data_hex, deadline)
    }

    fn initialize(&mut self) -> AdapterResult<Vec<&'static catalogs::EcuAddress>> {
        self.set_phase(AdapterPhase::Initializing);
        let deadline = Duration::from_millis(DEFAULT_READ_DEADLINE_MS);
        let mut version_reply = String::new();
        for cmd in INIT_STEPS {
            let reply = self.raw_exchange(cmd, deadline)?;
            if cmd == "ATZ" {
                version_reply = reply;
                std::thread::sleep(Duration::from_millis(1000));
            } else {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        if !version_reply.to_uppercase().contains("ELM327") {
            log::warn!("ATZ reply did not contain the expected ELM327 banner: {version_reply:?}");
        }
        self.state.echo = false;
        self.state.linefeed = false;
        self.state.headers_shown = true;
        self.state.spaces_shown = true;

        let probe = self.raw_exchange("0100", Duration::from_millis(crate::hardware::SLOW_READ_DEADLINE_MS))?;
        let probe_upper = probe.to_uppercase();
        if probe_upper.contains("NO DATA") || probe_upper.contains("UNABLE") || probe_upper.contains("ERROR") {
            self.set_phase(AdapterPhase::Errored);
            return Err(AdapterError::BusProbeFailed);
        }

        let mut detected: Vec<&'static catalogs::EcuAddress> = Vec::new();
        for line in probe.lines() {
            let line = line.trim();
            if line.len() < 3 {
                continue;
            }
            if let Some(ecu) = catalogs::by_rx(&line[..3]) {
                if !detected.iter().any(|e| e.rx == ecu.rx) {
                    detected.push(ecu);
                }
            }
        }

        self.state.can_bus_active = true;

        if let Some(first) = detected.iter().find(|e| e.code == "ECM").or_else(|| detected.first()) {
            self.select_ecu(first.tx, first.rx)?;
        }

        self.set_phase(AdapterPhase::Ready);
        Ok(detected)
    }

    /// Drops the real transport in favor of a placeholder that errors on every
    /// call, and resets state to a fresh, disconnected snapshot.
    fn shutdown(&mut self) {
        self.transport = Box::new(ClosedTransport);
        self.state = AdapterState::default();
        self.set_phase(AdapterPhase::Disconnected);
    }
}

/// Stands in for a real transport once the connection has been torn down, so
/// the worker loop can finish draining in-flight work without holding onto
/// the actual channel.
struct ClosedTransport;

impl Transport for ClosedTransport {
    fn write_line(&mut self, _cmd: &str) -> crate::hardware::TransportResult<()> {
        Err(closed_transport_error())
    }

    fn read_until_prompt(&mut self, _deadline: Duration) -> crate::hardware::TransportResult<String> {
        Err(closed_transport_error())
    }
}

fn closed_transport_error() -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "transport closed"))
}

fn check_rejected(reply: &str) -> AdapterResult<()> {
    let upper = reply.to_uppercase();
    if upper.contains("ERROR") || upper.trim() == "?" {
        Err(AdapterError::AdapterRejected)
    } else {
        Ok(())
    }
}

fn clean_reply(raw: &str, echoed_cmd: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.eq_ignore_ascii_case(echoed_cmd))
        .filter(|l| !l.eq_ignore_ascii_case("OK"))
        .filter(|l| !l.to_uppercase().starts_with("SEARCHING"))
        .collect::<Vec<_>>()
        .join("\r")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeTransport {
        script: std::collections::VecDeque<String>,
        written: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for FakeTransport {
        fn write_line(&mut self, cmd: &str) -> crate::hardware::TransportResult<()> {
            self.written.lock().unwrap().push(cmd.to_string());
            Ok(())
        }

        fn read_until_prompt(&mut self, _deadline: Duration) -> crate::hardware::TransportResult<String> {
            Ok(self.script.pop_front().unwrap_or_default())
        }
    }

    fn fake(replies: &[&str]) -> (FakeTransport, Arc<Mutex<Vec<String>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            FakeTransport {
                script: replies.iter().map(|s| s.to_string()).collect(),
                written: written.clone(),
            },
            written,
        )
    }

    #[test]
    fn select_ecu_emits_exact_bsi_sequence() {
        let (transport, written) = fake(&["", "", "", "", ""]);
        let ctl = AdapterController::new(Box::new(transport), None, None);
        ctl.select_ecu("765", "76D").unwrap();
        let log = written.lock().unwrap().clone();
        assert_eq!(log, vec!["ATCRA76D", "ATFCSH765", "ATFCSD300000", "ATFCSM1", "ATSH7DF"]);
    }

    #[test]
    fn exchange_intercepts_addressed_atsh() {
        let (transport, written) = fake(&["", "", "", "", ""]);
        let ctl = AdapterController::new(Box::new(transport), None, None);
        ctl.exchange("ATSH7E0", Duration::from_millis(100)).unwrap();
        let log = written.lock().unwrap().clone();
        assert_eq!(log, vec!["ATCRA7E8", "ATFCSH7E0", "ATFCSD300000", "ATFCSM1", "ATSH7DF"]);
    }

    #[test]
    fn forbidden_commands_are_rejected_locally_after_bus_active() {
        let (transport, written) = fake(&[
            "ELM327 v1.5", "", "", "", "", "", "", "",
            "7E8 06 41 00 BE 3F A8 13",
            "", "", "", "", "",
        ]);
        let ctl = AdapterController::new(Box::new(transport), None, None);
        ctl.initialize().unwrap();
        let before = written.lock().unwrap().len();
        let err = ctl.exchange("ATZ", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, AdapterError::ForbiddenAfterBusActive));
        assert_eq!(written.lock().unwrap().len(), before);
    }

    #[test]
    fn bus_probe_failure_is_reported() {
        let (transport, _) = fake(&["ELM327 v1.5", "", "", "", "", "", "", "", "NO DATA"]);
        let ctl = AdapterController::new(Box::new(transport), None, None);
        let err = ctl.initialize().unwrap_err();
        assert!(matches!(err, AdapterError::BusProbeFailed));
    }

    #[test]
    fn clean_reply_drops_the_searching_line() {
        let raw = "0100\rSEARCHING...\r7E8 06 41 00 BE 3F A8 13\rOK";
        assert_eq!(clean_reply(raw, "0100"), "7E8 06 41 00 BE 3F A8 13");
    }

    #[test]
    fn shutdown_resets_state_and_rejects_further_requests() {
        let (transport, _) = fake(&["", "", "", "", ""]);
        let ctl = AdapterController::new(Box::new(transport), None, None);
        ctl.select_ecu("765", "76D").unwrap();
        ctl.shutdown().unwrap();

        let err = ctl.state().unwrap_err();
        assert!(matches!(err, AdapterError::WorkerGone));
    }

    #[test]
    fn connect_opens_the_transport_and_initializes() {
        let (transport, _) = fake(&[
            "ELM327 v1.5", "", "", "", "", "", "", "",
            "7E8 06 41 00 BE 3F A8 13",
            "", "", "", "", "",
        ]);
        let (ctl, detected) = AdapterController::connect(
            transport,
            |t| Ok(Box::new(t) as Box<dyn Transport>),
            None,
            None,
        )
        .unwrap();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].code, "ECM");
        assert_eq!(ctl.state().unwrap().phase, AdapterPhase::Ready);
    }
}
