/*!
 * In-process simulated instruments.
 *
 * [`SimulatedTransports`] is a [`TransportProvider`] whose sessions talk to
 * simulated instruments instead of hardware. Instruments are registered by
 * address, port or index; each one records the traffic it received and
 * carries a [`FaultInjector`] so tests can make it unreachable, slow or
 * failing.
 *
 * The simulated instruments speak the same command sets the drivers emit:
 * SCPI for the meter and supply, the KTA line protocol for the relay board,
 * and named nodes for the camera.
 */
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use labkit_core::types::Value;

use crate::error::{TransportError, TransportResult};
use crate::transport::{CameraInfo, Frame, ImagingSession, SerialLine, TransportProvider, VisaSession};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fault injection and call accounting for one simulated instrument
#[derive(Debug, Default)]
pub struct FaultInjector {
    unreachable: AtomicBool,
    fail_all: AtomicBool,
    fail_next: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl FaultInjector {
    /// Refuse every attempt to open a session
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail every primitive call with an I/O error
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next primitive call
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Delay every primitive call
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of primitive calls received so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_open(&self, target: &str) -> TransportResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(target.to_string()));
        }
        Ok(())
    }

    async fn check_call(&self, op: &str) -> TransportResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.fail_all.load(Ordering::SeqCst) || self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Io(format!("injected failure during '{}'", op)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VISA instruments
// ---------------------------------------------------------------------------

/// What a simulated VISA instrument behaves like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimVisaKind {
    /// A digital multimeter answering `READ?`
    Multimeter,
    /// A programmable supply with `channels` outputs
    PowerSupply {
        /// Number of outputs
        channels: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct SimChannel {
    voltage: f64,
    current: f64,
    range: String,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            voltage: 0.0,
            current: 0.1,
            range: "P8V".to_string(),
        }
    }
}

#[derive(Debug)]
struct VisaState {
    reading: f64,
    function: String,
    selected: usize,
    channels: Vec<SimChannel>,
    output: bool,
    load_ohms: f64,
    self_test_passes: bool,
    commands: Vec<String>,
    open_sessions: usize,
}

/// A simulated message-based instrument
#[derive(Debug)]
pub struct SimVisaInstrument {
    address: String,
    idn: String,
    kind: SimVisaKind,
    faults: FaultInjector,
    state: Mutex<VisaState>,
}

impl SimVisaInstrument {
    fn new(address: &str, idn: String, kind: SimVisaKind) -> Self {
        let channels = match kind {
            SimVisaKind::Multimeter => 0,
            SimVisaKind::PowerSupply { channels } => channels,
        };

        Self {
            address: address.to_string(),
            idn,
            kind,
            faults: FaultInjector::default(),
            state: Mutex::new(VisaState {
                reading: 0.0,
                function: "VOLT:DC".to_string(),
                selected: 0,
                channels: vec![SimChannel::default(); channels],
                output: false,
                load_ohms: 10.0,
                self_test_passes: true,
                commands: Vec::new(),
                open_sessions: 0,
            }),
        }
    }

    /// The VISA address this instrument answers on
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The instrument kind
    pub fn kind(&self) -> SimVisaKind {
        self.kind
    }

    /// Fault injection for this instrument
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Set the value a meter returns from `READ?`
    pub fn set_reading(&self, value: f64) {
        lock(&self.state).reading = value;
    }

    /// Set the resistive load seen by a supply's outputs
    pub fn set_load(&self, ohms: f64) {
        lock(&self.state).load_ohms = ohms;
    }

    /// Decide whether `*TST?` passes
    pub fn set_self_test_result(&self, passes: bool) {
        lock(&self.state).self_test_passes = passes;
    }

    /// The measurement function last configured on a meter
    pub fn function(&self) -> String {
        lock(&self.state).function.clone()
    }

    /// Whether a supply's outputs are on
    pub fn output_enabled(&self) -> bool {
        lock(&self.state).output
    }

    /// Programmed `(voltage, current limit, range)` of a supply channel (1-based)
    pub fn channel_setpoint(&self, channel: usize) -> Option<(f64, f64, String)> {
        let state = lock(&self.state);
        let index = channel.checked_sub(1)?;
        state
            .channels
            .get(index)
            .map(|ch| (ch.voltage, ch.current, ch.range.clone()))
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Whether a session is currently open
    pub fn is_open(&self) -> bool {
        lock(&self.state).open_sessions > 0
    }

    fn reset_state(state: &mut VisaState) {
        state.function = "VOLT:DC".to_string();
        state.selected = 0;
        state.output = false;
        for channel in state.channels.iter_mut() {
            *channel = SimChannel::default();
        }
    }

    fn channel_mut(state: &mut VisaState) -> TransportResult<&mut SimChannel> {
        let selected = state.selected;
        state
            .channels
            .get_mut(selected)
            .ok_or_else(|| TransportError::Protocol("no output channel selected".to_string()))
    }

    /// Execute one command, returning the response for queries
    fn execute(&self, command: &str) -> TransportResult<Option<String>> {
        let mut state = lock(&self.state);
        state.commands.push(command.to_string());
        trace!("{} <- {}", self.address, command);

        let command = command.trim();
        let (header, argument) = match command.split_once(char::is_whitespace) {
            Some((header, argument)) => (header.to_ascii_uppercase(), argument.trim()),
            None => (command.to_ascii_uppercase(), ""),
        };
        let number = || {
            argument
                .parse::<f64>()
                .map_err(|_| TransportError::Protocol(format!("bad numeric argument '{}'", argument)))
        };

        match header.as_str() {
            "*IDN?" => Ok(Some(self.idn.clone())),
            "*RST" => {
                Self::reset_state(&mut state);
                Ok(None)
            }
            "*CLS" => Ok(None),
            "*TST?" => Ok(Some(if state.self_test_passes { "0" } else { "1" }.to_string())),
            "READ?" => Ok(Some(format!("{:+.9E}", state.reading))),
            "INST:NSEL" => {
                let channel = number()? as usize;
                if channel == 0 || channel > state.channels.len() {
                    return Err(TransportError::Protocol(format!("no channel {}", channel)));
                }
                state.selected = channel - 1;
                Ok(None)
            }
            "VOLT" => {
                let value = number()?;
                Self::channel_mut(&mut state)?.voltage = value;
                Ok(None)
            }
            "CURR" => {
                let value = number()?;
                Self::channel_mut(&mut state)?.current = value;
                Ok(None)
            }
            "VOLT:RANG" => {
                let range = argument.to_ascii_uppercase();
                Self::channel_mut(&mut state)?.range = range;
                Ok(None)
            }
            "OUTP" => {
                state.output = matches!(argument.to_ascii_uppercase().as_str(), "ON" | "1");
                Ok(None)
            }
            "MEAS:VOLT?" => {
                let output = state.output;
                let channel = Self::channel_mut(&mut state)?;
                let volts = if output { channel.voltage } else { 0.0 };
                Ok(Some(format!("{:.6}", volts)))
            }
            "MEAS:CURR?" => {
                let output = state.output;
                let load = state.load_ohms;
                let channel = Self::channel_mut(&mut state)?;
                let amps = if output && load > 0.0 {
                    (channel.voltage / load).min(channel.current)
                } else {
                    0.0
                };
                Ok(Some(format!("{:.6}", amps)))
            }
            other if other.starts_with("CONF:") => {
                state.function = other.trim_start_matches("CONF:").to_string();
                Ok(None)
            }
            other if other.ends_with('?') => {
                Err(TransportError::Protocol(format!("unsupported query '{}'", other)))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
struct SimVisaSession {
    instrument: Arc<SimVisaInstrument>,
    open: bool,
}

impl SimVisaSession {
    async fn call(&self, op: &str) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.instrument.faults.check_call(op).await
    }
}

#[async_trait]
impl VisaSession for SimVisaSession {
    async fn identify(&mut self) -> TransportResult<String> {
        self.query("*IDN?").await
    }

    async fn write(&mut self, command: &str) -> TransportResult<()> {
        self.call(command).await?;
        self.instrument.execute(command).map(|_| ())
    }

    async fn query(&mut self, command: &str) -> TransportResult<String> {
        self.call(command).await?;
        self.instrument
            .execute(command)?
            .ok_or_else(|| TransportError::Protocol(format!("'{}' produced no response", command)))
    }

    async fn reset(&mut self) -> TransportResult<()> {
        self.write("*RST").await
    }

    async fn clear_faults(&mut self) -> TransportResult<()> {
        self.write("*CLS").await
    }

    async fn self_test(&mut self) -> TransportResult<bool> {
        Ok(self.query("*TST?").await?.trim() == "0")
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.open {
            self.open = false;
            let mut state = lock(&self.instrument.state);
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relay board
// ---------------------------------------------------------------------------

const RELAY_ON: &str = "connect_normal_open";
const RELAY_OFF: &str = "connect_normal_closed";

#[derive(Debug)]
struct RelayBoardState {
    relays: Vec<bool>,
    input_counts: Vec<u16>,
    commands: Vec<String>,
    open: bool,
    baud_rate: u32,
}

/// A simulated KTA-style relay board on a serial port
#[derive(Debug)]
pub struct SimRelayBoard {
    port: String,
    faults: FaultInjector,
    state: Mutex<RelayBoardState>,
}

impl SimRelayBoard {
    fn new(port: &str, relays: usize) -> Self {
        Self {
            port: port.to_string(),
            faults: FaultInjector::default(),
            state: Mutex::new(RelayBoardState {
                relays: vec![false; relays],
                input_counts: vec![0; 4],
                commands: Vec::new(),
                open: false,
                baud_rate: 0,
            }),
        }
    }

    /// The port the board is attached to
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Fault injection for this board
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Physical relay states (`true` = energised)
    pub fn relay_states(&self) -> Vec<bool> {
        lock(&self.state).relays.clone()
    }

    /// Set the raw ADC counts reported for analog input `channel`
    pub fn set_input_counts(&self, channel: usize, counts: u16) {
        let mut state = lock(&self.state);
        if channel >= state.input_counts.len() {
            state.input_counts.resize(channel + 1, 0);
        }
        state.input_counts[channel] = counts;
    }

    /// Every command line received, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Whether a line is currently open on this board
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Baud rate of the last open
    pub fn baud_rate(&self) -> u32 {
        lock(&self.state).baud_rate
    }

    fn relay_index(state: &RelayBoardState, argument: Option<&str>) -> Option<usize> {
        let number = argument?.parse::<usize>().ok()?;
        (1..=state.relays.len()).contains(&number).then(|| number - 1)
    }

    fn execute(&self, line: &str) -> String {
        let mut state = lock(&self.state);
        state.commands.push(line.to_string());
        trace!("{} <- {}", self.port, line);

        let mut words = line.split_whitespace();
        match words.next() {
            Some("getversion") => "KTA-223 v3.1".to_string(),
            Some("setrelaystate") => {
                let index = Self::relay_index(&state, words.next());
                match (index, words.next()) {
                    (Some(index), Some(RELAY_ON)) => {
                        state.relays[index] = true;
                        "OK".to_string()
                    }
                    (Some(index), Some(RELAY_OFF)) => {
                        state.relays[index] = false;
                        "OK".to_string()
                    }
                    _ => "ERR".to_string(),
                }
            }
            Some("getrelaystate") => match Self::relay_index(&state, words.next()) {
                Some(index) if state.relays[index] => RELAY_ON.to_string(),
                Some(_) => RELAY_OFF.to_string(),
                None => "ERR".to_string(),
            },
            Some("readvoltage") => {
                let channel = words.next().and_then(|w| w.parse::<usize>().ok());
                match channel.and_then(|c| state.input_counts.get(c)) {
                    Some(counts) => counts.to_string(),
                    None => "ERR".to_string(),
                }
            }
            _ => "ERR".to_string(),
        }
    }
}

#[derive(Debug)]
struct SimSerialLine {
    transports: SimulatedTransports,
    board: Option<Arc<SimRelayBoard>>,
    pending: VecDeque<Bytes>,
}

impl SimSerialLine {
    fn board(&self) -> TransportResult<&Arc<SimRelayBoard>> {
        self.board.as_ref().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl SerialLine for SimSerialLine {
    async fn open(&mut self, port: &str, baud_rate: u32, _timeout: Duration) -> TransportResult<()> {
        let board = self
            .transports
            .relay_board(port)
            .ok_or_else(|| TransportError::Unreachable(format!("no device on {}", port)))?;
        board.faults.check_open(port)?;

        {
            let mut state = lock(&board.state);
            state.open = true;
            state.baud_rate = baud_rate;
        }
        self.board = Some(board);
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(board) = self.board.take() {
            lock(&board.state).open = false;
        }
        self.pending.clear();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let board = Arc::clone(self.board()?);
        board.faults.check_call("write").await?;

        let text = String::from_utf8_lossy(data);
        for line in text.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
            let reply = board.execute(line.trim());
            self.pending.push_back(Bytes::from(format!("{}\r\n", reply)));
        }
        Ok(())
    }

    async fn read(&mut self, _timeout: Duration) -> TransportResult<Option<Bytes>> {
        let board = Arc::clone(self.board()?);
        board.faults.check_call("read").await?;
        Ok(self.pending.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Cameras
// ---------------------------------------------------------------------------

/// Nodes a camera refuses to change while acquisition is running
const STREAM_LOCKED_NODES: [&str; 4] = ["PixelFormat", "Width", "Height", "AcquisitionMode"];

#[derive(Debug)]
struct CameraState {
    initialised: bool,
    acquiring: bool,
    nodes: BTreeMap<String, Value>,
    next_frame_id: u64,
    triggers: u64,
    fill: u8,
}

/// A simulated camera visible through the imaging SDK
#[derive(Debug)]
pub struct SimCamera {
    info: CameraInfo,
    faults: FaultInjector,
    incomplete_next: AtomicBool,
    state: Mutex<CameraState>,
}

impl SimCamera {
    fn new(serial_number: String) -> Self {
        Self {
            info: CameraInfo {
                vendor: "FLIR".to_string(),
                model: "Blackfly S BFS-U3-16S2M".to_string(),
                serial_number,
                firmware: "1.27.3.0".to_string(),
            },
            faults: FaultInjector::default(),
            incomplete_next: AtomicBool::new(false),
            state: Mutex::new(CameraState {
                initialised: false,
                acquiring: false,
                nodes: BTreeMap::new(),
                next_frame_id: 0,
                triggers: 0,
                fill: 128,
            }),
        }
    }

    /// Device information reported by enumeration
    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    /// Fault injection for this camera
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Deliver the next frame as incomplete
    pub fn fail_next_frame(&self) {
        self.incomplete_next.store(true, Ordering::SeqCst);
    }

    /// Set the byte value every pixel is filled with
    pub fn set_fill(&self, fill: u8) {
        lock(&self.state).fill = fill;
    }

    /// Current value of a camera node
    pub fn node(&self, name: &str) -> Option<Value> {
        lock(&self.state).nodes.get(name).cloned()
    }

    /// Whether the camera is initialised
    pub fn is_initialised(&self) -> bool {
        lock(&self.state).initialised
    }

    /// Whether acquisition is running
    pub fn is_acquiring(&self) -> bool {
        lock(&self.state).acquiring
    }

    /// Number of software triggers received
    pub fn triggers(&self) -> u64 {
        lock(&self.state).triggers
    }

    fn next_frame(&self) -> TransportResult<Frame> {
        let mut state = lock(&self.state);
        if !state.acquiring {
            return Err(TransportError::Protocol("acquisition not started".to_string()));
        }

        state.next_frame_id += 1;
        if self.incomplete_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Incomplete(format!(
                "frame {} missing packets",
                state.next_frame_id
            )));
        }

        let dimension = |name: &str, default: u32| {
            state
                .nodes
                .get(name)
                .and_then(Value::as_integer)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(default)
        };
        let width = dimension("Width", 64);
        let height = dimension("Height", 48);
        let pixel_format = state
            .nodes
            .get("PixelFormat")
            .and_then(Value::as_str)
            .unwrap_or("Mono8")
            .to_string();
        let bytes_per_pixel = if pixel_format.ends_with("16") { 2 } else { 1 };
        let size = width as usize * height as usize * bytes_per_pixel;

        Ok(Frame {
            frame_id: state.next_frame_id,
            width,
            height,
            pixel_format,
            data: Bytes::from(vec![state.fill; size]),
        })
    }
}

#[derive(Debug)]
struct SimImagingSession {
    cameras: Vec<Arc<SimCamera>>,
    active: Option<Arc<SimCamera>>,
}

impl SimImagingSession {
    async fn camera(&self, op: &str) -> TransportResult<Arc<SimCamera>> {
        let camera = self.active.clone().ok_or(TransportError::Closed)?;
        camera.faults.check_call(op).await?;
        Ok(camera)
    }
}

#[async_trait]
impl ImagingSession for SimImagingSession {
    async fn enumerate_devices(&mut self) -> TransportResult<Vec<CameraInfo>> {
        Ok(self.cameras.iter().map(|c| c.info.clone()).collect())
    }

    async fn init(&mut self, index: usize) -> TransportResult<CameraInfo> {
        let camera = self
            .cameras
            .get(index)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("no camera at index {}", index)))?;
        camera.faults.check_open(&camera.info.serial_number)?;

        lock(&camera.state).initialised = true;
        let info = camera.info.clone();
        self.active = Some(camera);
        Ok(info)
    }

    async fn deinit(&mut self) -> TransportResult<()> {
        if let Some(camera) = self.active.take() {
            let mut state = lock(&camera.state);
            state.acquiring = false;
            state.initialised = false;
        }
        Ok(())
    }

    async fn set_node(&mut self, node: &str, value: &Value) -> TransportResult<()> {
        let camera = self.camera(node).await?;
        let mut state = lock(&camera.state);
        if state.acquiring && STREAM_LOCKED_NODES.contains(&node) {
            return Err(TransportError::Protocol(format!(
                "node '{}' is not writable during acquisition",
                node
            )));
        }
        state.nodes.insert(node.to_string(), value.clone());
        Ok(())
    }

    async fn trigger(&mut self) -> TransportResult<()> {
        let camera = self.camera("TriggerSoftware").await?;
        lock(&camera.state).triggers += 1;
        Ok(())
    }

    async fn begin_acquisition(&mut self) -> TransportResult<()> {
        let camera = self.camera("BeginAcquisition").await?;
        lock(&camera.state).acquiring = true;
        Ok(())
    }

    async fn end_acquisition(&mut self) -> TransportResult<()> {
        let camera = self.camera("EndAcquisition").await?;
        lock(&camera.state).acquiring = false;
        Ok(())
    }

    async fn get_next_image(&mut self, _timeout: Duration) -> TransportResult<Frame> {
        let camera = self.camera("GetNextImage").await?;
        camera.next_frame()
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Bench {
    visa: Mutex<HashMap<String, Arc<SimVisaInstrument>>>,
    relay_boards: Mutex<HashMap<String, Arc<SimRelayBoard>>>,
    cameras: Mutex<Vec<Arc<SimCamera>>>,
}

/// A provider whose sessions reach simulated instruments.
///
/// Clones share the same bench of instruments.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransports {
    bench: Arc<Bench>,
}

impl SimulatedTransports {
    /// Create an empty bench
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a multimeter at `address`
    pub fn add_multimeter(&self, address: &str) -> Arc<SimVisaInstrument> {
        let idn = "Agilent Technologies,34461A,MY53200123,A.02.14-02.40-02.14-00.49-01-01".to_string();
        self.add_visa(address, idn, SimVisaKind::Multimeter)
    }

    /// Attach a power supply of `model` (e.g. `E3646A`) at `address`
    pub fn add_power_supply(&self, address: &str, model: &str, channels: usize) -> Arc<SimVisaInstrument> {
        let idn = format!("Agilent Technologies,{},0,2.4-5.0-1.0", model.to_ascii_uppercase());
        self.add_visa(address, idn, SimVisaKind::PowerSupply { channels })
    }

    fn add_visa(&self, address: &str, idn: String, kind: SimVisaKind) -> Arc<SimVisaInstrument> {
        let instrument = Arc::new(SimVisaInstrument::new(address, idn, kind));
        lock(&self.bench.visa).insert(address.to_string(), Arc::clone(&instrument));
        instrument
    }

    /// Attach an eight-relay board on `port`
    pub fn add_relay_board(&self, port: &str) -> Arc<SimRelayBoard> {
        let board = Arc::new(SimRelayBoard::new(port, 8));
        lock(&self.bench.relay_boards).insert(port.to_string(), Arc::clone(&board));
        board
    }

    /// Attach a camera; it enumerates at the next free index
    pub fn add_camera(&self) -> Arc<SimCamera> {
        let mut cameras = lock(&self.bench.cameras);
        let camera = Arc::new(SimCamera::new(format!("2014{:04}", cameras.len() + 1)));
        cameras.push(Arc::clone(&camera));
        camera
    }

    /// The VISA instrument at `address`
    pub fn visa(&self, address: &str) -> Option<Arc<SimVisaInstrument>> {
        lock(&self.bench.visa).get(address).cloned()
    }

    /// The relay board on `port`
    pub fn relay_board(&self, port: &str) -> Option<Arc<SimRelayBoard>> {
        lock(&self.bench.relay_boards).get(port).cloned()
    }

    /// The camera at enumeration `index`
    pub fn camera(&self, index: usize) -> Option<Arc<SimCamera>> {
        lock(&self.bench.cameras).get(index).cloned()
    }
}

#[async_trait]
impl TransportProvider for SimulatedTransports {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn open_visa(&self, address: &str, _timeout: Duration) -> TransportResult<Box<dyn VisaSession>> {
        let instrument = self
            .visa(address)
            .ok_or_else(|| TransportError::Unreachable(format!("no instrument at {}", address)))?;
        instrument.faults.check_open(address)?;

        lock(&instrument.state).open_sessions += 1;
        Ok(Box::new(SimVisaSession { instrument, open: true }))
    }

    fn serial_line(&self) -> Box<dyn SerialLine> {
        Box::new(SimSerialLine {
            transports: self.clone(),
            board: None,
            pending: VecDeque::new(),
        })
    }

    async fn open_imaging(&self) -> TransportResult<Box<dyn ImagingSession>> {
        Ok(Box::new(SimImagingSession {
            cameras: lock(&self.bench.cameras).clone(),
            active: None,
        }))
    }
}
