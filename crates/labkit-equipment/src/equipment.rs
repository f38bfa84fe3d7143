/*!
 * The equipment lifecycle contract.
 *
 * [`Equipment`] is the uniform operation set every device family exposes.
 * [`Instrument`] implements it once for all families: it owns the connection
 * state machine, the config store, the data log and the measurement worker,
 * and delegates the family-specific work to a [`Driver`].
 *
 * An instrument keeps two async locks. The state lock guards status, config,
 * data log and last error and is only held for bookkeeping, so status reads
 * never wait on a slow transport. The device lock guards the driver and its
 * session and is held for the whole transport exchange, so the measurement
 * worker and a caller never talk to the device at the same time.
 */
use std::fmt::{self, Debug};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use labkit_core::types::{ConfigMap, Id, Metadata, Value};
use labkit_core::utils::{period_from_rate, JoinOutcome};

use crate::config_store::{CommonSettings, ConfigStore};
use crate::data_log::{DataLog, ExportFormat, MeasurementRecord};
use crate::error::{EquipmentError, Result};
use crate::measurement::{Cancellation, LoopTiming, MeasurementStart, MeasurementWorker};
use crate::status::{EquipmentStatus, StateMachine, StatusTransition};
use crate::transport::TransportProvider;

/// Physical interface family of a piece of equipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoType {
    /// LAN / VISA instruments
    Ethernet,
    /// RS-232 and USB-serial devices
    Serial,
    /// USB devices driven through a vendor SDK
    Usb,
    /// Anything else
    Special,
}

impl fmt::Display for IoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoType::Ethernet => "ethernet",
            IoType::Serial => "serial",
            IoType::Usb => "usb",
            IoType::Special => "special",
        };
        f.write_str(name)
    }
}

/// Identification reported by a connected device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identification {
    /// Manufacturer
    pub manufacturer: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware revision
    pub firmware: String,
}

/// Snapshot of an equipment's state for GUIs and scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Equipment name
    pub name: String,
    /// Lifecycle status
    pub status: EquipmentStatus,
    /// Whether a session is open and usable
    pub connected: bool,
    /// Whether continuous measurement is running
    pub measuring: bool,
    /// Interface family
    pub io_type: IoType,
    /// Most recent error message
    pub last_error: Option<String>,
    /// Number of records in the data log
    pub data_points: usize,
}

/// Notifications published by an equipment instance
#[derive(Debug, Clone)]
pub enum EquipmentEvent {
    /// The lifecycle status changed
    StatusChanged {
        /// Equipment name
        equipment: String,
        /// Previous status
        from: EquipmentStatus,
        /// New status
        to: EquipmentStatus,
    },
    /// A record was appended to the data log
    RecordAdded {
        /// Equipment name
        equipment: String,
        /// The new record
        record: MeasurementRecord,
    },
    /// The data log was cleared
    DataCleared {
        /// Equipment name
        equipment: String,
    },
    /// An operation failed
    Error {
        /// Equipment name
        equipment: String,
        /// The error message stored as `last_error`
        message: String,
    },
}

/// One measurement produced by a driver
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// The measured value
    pub value: Value,
    /// Units of `value`
    pub units: String,
    /// Extra fields stored with the record
    pub metadata: Metadata,
}

impl Reading {
    /// Create a reading without metadata
    pub fn new(value: impl Into<Value>, units: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            units: units.into(),
            metadata: Metadata::new(),
        }
    }

    /// Attach one metadata field
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Family-specific behaviour plugged into an [`Instrument`].
///
/// Drivers perform transport work only; status bookkeeping, error recording
/// and the data log are handled by the instrument around every call.
#[async_trait]
pub trait Driver: Send + Sync + Debug + 'static {
    /// The open transport session(s) this family needs
    type Session: Send + Debug + 'static;

    /// Logical type name used by the registry
    fn type_name(&self) -> &'static str;

    /// Interface family
    fn io_type(&self) -> IoType;

    /// The family's default configuration
    fn default_config(&self) -> Result<ConfigMap>;

    /// Check a candidate configuration before it is applied
    fn validate(&self, config: &ConfigStore) -> Result<()> {
        config.settings::<CommonSettings>()?.validate()
    }

    /// Open the transport and identify the device
    async fn open(
        &mut self,
        transports: &dyn TransportProvider,
        config: &ConfigStore,
    ) -> Result<(Self::Session, Identification)>;

    /// Push the active configuration down to the device
    async fn apply(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<()>;

    /// Put outputs, relays and acquisition into their safe state.
    ///
    /// The driver may record the safe state in `config` so that a later
    /// `connect()` does not re-energise anything.
    async fn safe_shutdown(&mut self, session: &mut Self::Session, config: &mut ConfigStore) -> Result<()>;

    /// Request a transport-level reset
    async fn reset(&mut self, session: &mut Self::Session) -> Result<()>;

    /// Run the device self-test
    async fn self_test(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<bool>;

    /// Take exactly one measurement
    async fn measure(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<Reading>;

    /// Called before the measurement worker starts
    async fn begin_streaming(&mut self, _session: &mut Self::Session, _config: &ConfigStore) -> Result<()> {
        Ok(())
    }

    /// Called once continuous measurement has stopped
    async fn end_streaming(&mut self, _session: &mut Self::Session) -> Result<()> {
        Ok(())
    }

    /// Release the session
    async fn close(&mut self, session: Self::Session) -> Result<()>;
}

/// The uniform operation set of every equipment family
#[async_trait]
pub trait Equipment: Send + Sync + Debug {
    /// Unique instance id
    fn id(&self) -> &Id;

    /// Equipment name
    fn name(&self) -> &str;

    /// Logical type name (e.g. `agilent_dmm`)
    fn type_name(&self) -> &'static str;

    /// Interface family
    fn io_type(&self) -> IoType;

    /// Open the transport and move to `Ready`
    async fn connect(&self) -> Result<()>;

    /// Stop measuring, shut outputs down safely and close the transport
    async fn disconnect(&self) -> Result<()>;

    /// Whether a session is open and usable
    async fn is_connected(&self) -> bool;

    /// Current lifecycle status
    async fn status(&self) -> EquipmentStatus;

    /// Recent status transitions, oldest first
    async fn status_history(&self) -> Vec<StatusTransition>;

    /// A copy of the active configuration
    async fn get_config(&self) -> ConfigMap;

    /// The family's default configuration
    async fn default_config(&self) -> ConfigMap;

    /// Merge known keys into the active configuration and apply it
    async fn set_config(&self, partial: ConfigMap) -> Result<()>;

    /// Push the active configuration to the device
    async fn apply_config(&self) -> Result<()>;

    /// Restore defaults and reset the device, leaving outputs safe
    async fn reset(&self) -> Result<()>;

    /// Start continuous measurement
    async fn start_measurement(&self) -> Result<MeasurementStart>;

    /// Stop continuous measurement
    async fn stop_measurement(&self) -> Result<()>;

    /// Take one measurement and append it to the data log
    async fn measure(&self) -> Result<Value>;

    /// Whether continuous measurement is running
    async fn is_measuring(&self) -> bool;

    /// A copy of the data log
    async fn get_measurement_data(&self) -> Vec<MeasurementRecord>;

    /// Empty the data log
    async fn clear_data(&self) -> Result<()>;

    /// Write the data log to `path`
    async fn export_data(&self, path: &Path, format: ExportFormat) -> Result<()>;

    /// Status summary
    async fn get_status(&self) -> StatusReport;

    /// The most recent error message
    async fn last_error(&self) -> Option<String>;

    /// Forget the most recent error message
    async fn clear_error(&self);

    /// Run the device self-test
    async fn self_test(&self) -> Result<bool>;

    /// Identification captured at connect time
    async fn identification(&self) -> Result<Identification>;

    /// Subscribe to this equipment's events
    fn subscribe(&self) -> broadcast::Receiver<EquipmentEvent>;
}

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Notifier {
    equipment: String,
    events: broadcast::Sender<EquipmentEvent>,
}

impl Notifier {
    fn status_changed(&self, from: EquipmentStatus, to: EquipmentStatus) {
        let _ = self.events.send(EquipmentEvent::StatusChanged {
            equipment: self.equipment.clone(),
            from,
            to,
        });
    }

    fn record_added(&self, record: MeasurementRecord) {
        let _ = self.events.send(EquipmentEvent::RecordAdded {
            equipment: self.equipment.clone(),
            record,
        });
    }

    fn data_cleared(&self) {
        let _ = self.events.send(EquipmentEvent::DataCleared {
            equipment: self.equipment.clone(),
        });
    }

    fn error(&self, message: String) {
        let _ = self.events.send(EquipmentEvent::Error {
            equipment: self.equipment.clone(),
            message,
        });
    }
}

/// Bookkeeping of one instrument. Never held across transport I/O.
struct State {
    notifier: Notifier,
    machine: StateMachine,
    config: ConfigStore,
    log: DataLog,
    last_error: Option<String>,
    identification: Option<Identification>,
    session_open: bool,
}

impl State {
    fn status(&self) -> EquipmentStatus {
        self.machine.status()
    }

    fn is_connected(&self) -> bool {
        self.status().is_connected() && self.session_open
    }

    fn set_status(&mut self, to: EquipmentStatus, operation: &'static str) -> Result<()> {
        let from = self.machine.status();
        self.machine
            .transition(to)
            .map_err(|_| EquipmentError::InvalidState { operation, status: from })?;
        if from != to {
            self.notifier.status_changed(from, to);
        }
        Ok(())
    }

    /// Record a failed operation and return the error.
    ///
    /// Device faults move the equipment to `Error`; anything else only ends a
    /// transient `Busy`.
    fn fail(&mut self, operation: &'static str, err: EquipmentError) -> EquipmentError {
        let name = &self.notifier.equipment;
        if err.is_device_fault() {
            error!("'{}' {} failed: {}", name, operation, err);
            if self.status().can_transition_to(EquipmentStatus::Error) {
                let _ = self.set_status(EquipmentStatus::Error, operation);
            }
        } else {
            warn!("'{}' {} rejected: {}", name, operation, err);
            if self.status() == EquipmentStatus::Busy {
                let _ = self.set_status(EquipmentStatus::Ready, operation);
            }
        }

        let message = err.to_string();
        self.last_error = Some(message.clone());
        self.notifier.error(message);
        err
    }

    fn succeed(&mut self) {
        self.last_error = None;
    }

    fn record(&mut self, reading: Reading) -> MeasurementRecord {
        let record = self.log.push(reading.value, reading.units, reading.metadata);
        self.notifier.record_added(record.clone());
        record
    }

    fn require_connected(&mut self, operation: &'static str) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.fail(operation, EquipmentError::NotConnected))
        }
    }

    fn require_status(&mut self, operation: &'static str, allowed: &[EquipmentStatus]) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(self.fail(operation, EquipmentError::InvalidState { operation, status }))
        }
    }

    /// Enter `Busy` unless measuring; returns the configuration to push and
    /// whether the equipment is measuring
    fn begin_apply(&mut self, operation: &'static str) -> Result<(ConfigStore, bool)> {
        let measuring = self.status() == EquipmentStatus::Measuring;
        if !measuring {
            self.set_status(EquipmentStatus::Busy, operation)?;
        }
        Ok((self.config.clone(), measuring))
    }

    fn finish_apply(&mut self, operation: &'static str, result: Result<()>, measuring: bool) -> Result<()> {
        match result {
            Ok(()) => {
                if !measuring {
                    self.set_status(EquipmentStatus::Ready, operation)?;
                }
                self.succeed();
                Ok(())
            }
            Err(e) => Err(self.fail(operation, e)),
        }
    }
}

/// The driver and its open session. Held for the duration of transport I/O,
/// which serialises every device access of one instrument.
struct Device<D: Driver> {
    driver: D,
    session: Option<D::Session>,
}

impl<D: Driver> Device<D> {
    fn parts(&mut self) -> Result<(&mut D, &mut D::Session)> {
        let Device { driver, session } = self;
        let session = session.as_mut().ok_or(EquipmentError::NotConnected)?;
        Ok((driver, session))
    }

    async fn apply(&mut self, config: &ConfigStore) -> Result<()> {
        let (driver, session) = self.parts()?;
        driver.apply(session, config).await
    }

    /// Apply the configuration and take one reading
    async fn measure(&mut self, config: &ConfigStore) -> Result<Reading> {
        let (driver, session) = self.parts()?;
        driver.apply(session, config).await?;
        driver.measure(session, config).await
    }

    /// Safe shutdown and close; every step is attempted, the first error is kept
    async fn release(&mut self, name: &str, config: &mut ConfigStore) -> Option<EquipmentError> {
        let mut session = self.session.take()?;
        let mut failure = None;

        if let Err(e) = self.driver.safe_shutdown(&mut session, config).await {
            warn!("'{}' safe shutdown failed: {}", name, e);
            failure = Some(e);
        }
        if let Err(e) = self.driver.close(session).await {
            warn!("'{}' closing transport failed: {}", name, e);
            failure.get_or_insert(e);
        }
        failure
    }
}

/// Lock order: `device` before `state`. `state` is never held across an
/// await on `device` or on the transport.
struct Shared<D: Driver> {
    state: Mutex<State>,
    device: Mutex<Device<D>>,
    worker: StdMutex<Option<MeasurementWorker>>,
    notifier: Notifier,
    transports: Arc<dyn TransportProvider>,
    timing: LoopTiming,
}

impl<D: Driver> Shared<D> {
    /// Detach the running worker, if any, and raise its cancellation flag
    fn take_worker(&self) -> Option<MeasurementWorker> {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = &worker {
            worker.cancel();
        }
        worker
    }

    fn install_worker(&self, worker: MeasurementWorker) {
        let previous = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(worker);
        // A worker left over from an earlier failure has already exited or
        // been cancelled; dropping its handle detaches it.
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// One iteration of the continuous measurement loop
    async fn poll(&self, cancel: Cancellation) -> ControlFlow<()> {
        const OP: &str = "measurement loop";
        let mut device = self.device.lock().await;
        let config = {
            let state = self.state.lock().await;
            if cancel.is_cancelled() || state.status() != EquipmentStatus::Measuring {
                return ControlFlow::Break(());
            }
            state.config.clone()
        };

        let result = device.measure(&config).await;

        let mut state = self.state.lock().await;
        if cancel.is_cancelled() || state.status() != EquipmentStatus::Measuring {
            // stopped while the reading was in flight
            return ControlFlow::Break(());
        }
        match result {
            Ok(reading) => {
                state.record(reading);
                state.succeed();
                ControlFlow::Continue(())
            }
            Err(e) => {
                let fatal = e.is_device_fault();
                state.fail(OP, e);
                if fatal {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        }
    }

    /// Let the driver end streaming once the device is free again
    async fn end_streaming(&self, operation: &'static str) -> Result<()> {
        let mut device = self.device.lock().await;
        if self.state.lock().await.status() == EquipmentStatus::Measuring {
            debug!("'{}' restarted measuring; streaming stays on", self.notifier.equipment);
            return Ok(());
        }

        let result = match device.parts() {
            Ok((driver, session)) => driver.end_streaming(session).await,
            Err(_) => Ok(()),
        };

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.succeed();
                Ok(())
            }
            Err(e) => Err(state.fail(operation, e)),
        }
    }
}

/// A piece of equipment: the lifecycle contract around a family [`Driver`]
pub struct Instrument<D: Driver> {
    id: Id,
    name: String,
    type_name: &'static str,
    io_type: IoType,
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Debug for Instrument<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("io_type", &self.io_type)
            .finish()
    }
}

impl<D: Driver> Instrument<D> {
    /// Create a disconnected instrument with the driver's default configuration
    pub fn new(name: impl Into<String>, driver: D, transports: Arc<dyn TransportProvider>) -> Result<Self> {
        Self::with_timing(name, driver, transports, LoopTiming::default())
    }

    /// Like [`Instrument::new`] with explicit measurement loop timing
    pub fn with_timing(
        name: impl Into<String>,
        driver: D,
        transports: Arc<dyn TransportProvider>,
        timing: LoopTiming,
    ) -> Result<Self> {
        let name = name.into();
        let config = ConfigStore::new(driver.default_config()?);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let notifier = Notifier {
            equipment: name.clone(),
            events,
        };

        Ok(Self {
            id: Id::new(),
            type_name: driver.type_name(),
            io_type: driver.io_type(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    notifier: notifier.clone(),
                    machine: StateMachine::new(),
                    config,
                    log: DataLog::new(),
                    last_error: None,
                    identification: None,
                    session_open: false,
                }),
                device: Mutex::new(Device { driver, session: None }),
                worker: StdMutex::new(None),
                notifier,
                transports,
                timing,
            }),
            name,
        })
    }

    async fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().await
    }

    async fn device(&self) -> MutexGuard<'_, Device<D>> {
        self.shared.device.lock().await
    }

    /// Exclusive device access for a family-specific operation on a
    /// connected device
    pub(crate) async fn access(&self, operation: &'static str) -> Result<Access<'_, D>> {
        let device = self.device().await;
        let config = {
            let mut state = self.lock().await;
            state.require_connected(operation)?;
            state.config.clone()
        };
        Ok(Access {
            device,
            state: &self.shared.state,
            config,
            operation,
        })
    }

    /// Like [`Instrument::access`], but only requires an open session, so it
    /// also works in `Error`
    pub(crate) async fn access_session(&self, operation: &'static str) -> Result<Access<'_, D>> {
        let device = self.device().await;
        let config = {
            let mut state = self.lock().await;
            if device.session.is_none() {
                return Err(state.fail(operation, EquipmentError::NotConnected));
            }
            state.config.clone()
        };
        Ok(Access {
            device,
            state: &self.shared.state,
            config,
            operation,
        })
    }

    /// Run `f` on the driver and the active configuration without requiring
    /// a connection
    pub(crate) async fn with_driver<T>(&self, f: impl FnOnce(&mut D, &ConfigStore) -> T) -> T {
        let mut device = self.device().await;
        let state = self.lock().await;
        f(&mut device.driver, &state.config)
    }

    /// Record a failed connection attempt; the status always ends in `Error`
    async fn abort_connect(&self, device: &mut Device<D>, err: EquipmentError) -> EquipmentError {
        const OP: &str = "connect";
        let (err, mut config) = {
            let mut state = self.lock().await;
            let err = state.fail(OP, err);
            if state.status() == EquipmentStatus::Connecting {
                let _ = state.set_status(EquipmentStatus::Error, OP);
            }
            (err, state.config.clone())
        };
        if let Some(e) = device.release(&self.name, &mut config).await {
            debug!("'{}' ignoring close failure after aborted connect: {}", self.name, e);
        }
        self.lock().await.config = config;
        err
    }

    fn spawn_worker(&self, period: std::time::Duration) -> MeasurementWorker {
        let shared: Weak<Shared<D>> = Arc::downgrade(&self.shared);
        MeasurementWorker::spawn(self.name.clone(), period, move |cancel| {
            let shared = shared.clone();
            async move {
                match shared.upgrade() {
                    Some(shared) => shared.poll(cancel).await,
                    None => ControlFlow::Break(()),
                }
            }
        })
    }
}

/// Device access for family-specific operations.
///
/// Works on a copy of the active configuration that is written back when the
/// operation finishes; no other operation can touch the configuration while
/// the device is held.
pub(crate) struct Access<'a, D: Driver> {
    device: MutexGuard<'a, Device<D>>,
    state: &'a Mutex<State>,
    config: ConfigStore,
    operation: &'static str,
}

impl<'a, D: Driver> Access<'a, D> {
    /// The driver, its open session and the config store
    pub(crate) fn parts(&mut self) -> Result<(&mut D, &mut D::Session, &mut ConfigStore)> {
        let (driver, session) = self.device.parts()?;
        Ok((driver, session, &mut self.config))
    }

    /// Append a reading to the data log
    pub(crate) async fn record(&mut self, reading: Reading) -> MeasurementRecord {
        self.state.lock().await.record(reading)
    }

    /// Record the outcome of the operation
    pub(crate) async fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        state.config = self.config.clone();
        match result {
            Ok(value) => {
                state.succeed();
                Ok(value)
            }
            Err(e) => Err(state.fail(self.operation, e)),
        }
    }
}

#[async_trait]
impl<D: Driver> Equipment for Instrument<D> {
    fn id(&self) -> &Id {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn io_type(&self) -> IoType {
        self.io_type
    }

    async fn connect(&self) -> Result<()> {
        const OP: &str = "connect";
        let mut device = self.device().await;

        let stale = {
            let mut state = self.lock().await;
            match state.status() {
                EquipmentStatus::Ready | EquipmentStatus::Measuring => {
                    debug!("'{}' already connected", self.name);
                    return Ok(());
                }
                EquipmentStatus::Error => true,
                EquipmentStatus::Disconnected => false,
                status @ (EquipmentStatus::Connecting | EquipmentStatus::Busy) => {
                    return Err(state.fail(OP, EquipmentError::InvalidState { operation: OP, status }));
                }
            }
        };

        if stale {
            drop(self.shared.take_worker());
            let mut config = self.lock().await.config.clone();
            if let Some(e) = device.release(&self.name, &mut config).await {
                debug!("'{}' ignoring failure while dropping stale session: {}", self.name, e);
            }
            let mut state = self.lock().await;
            state.config = config;
            state.session_open = false;
        }

        let config = {
            let mut state = self.lock().await;
            state.set_status(EquipmentStatus::Connecting, OP)?;
            state.config.clone()
        };
        info!("Connecting '{}' via {}", self.name, self.shared.transports.name());

        let opened = device.driver.open(self.shared.transports.as_ref(), &config).await;
        let identification = match opened {
            Ok((session, identification)) => {
                device.session = Some(session);
                identification
            }
            Err(e) => {
                let e = match e {
                    EquipmentError::Transport(t) => EquipmentError::connection(t.to_string()),
                    other => other,
                };
                return Err(self.abort_connect(&mut device, e).await);
            }
        };

        if let Err(e) = device.apply(&config).await {
            return Err(self.abort_connect(&mut device, e).await);
        }

        info!(
            "Connected '{}': {} {} (s/n {})",
            self.name, identification.manufacturer, identification.model, identification.serial_number
        );
        let mut state = self.lock().await;
        state.identification = Some(identification);
        state.session_open = true;
        state.set_status(EquipmentStatus::Ready, OP)?;
        state.succeed();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        const OP: &str = "disconnect";
        let worker = self.shared.take_worker();
        let failure = {
            let mut device = self.device().await;
            let mut config = {
                let state = self.lock().await;
                if state.status() == EquipmentStatus::Disconnected && device.session.is_none() {
                    None
                } else {
                    Some(state.config.clone())
                }
            };

            match config.as_mut() {
                None => None,
                Some(config) => {
                    let failure = device.release(&self.name, config).await;
                    let mut state = self.lock().await;
                    state.config = config.clone();
                    state.session_open = false;
                    state.set_status(EquipmentStatus::Disconnected, OP)?;
                    info!("Disconnected '{}'", self.name);

                    match failure {
                        Some(e) => Some(state.fail(OP, e)),
                        None => {
                            state.succeed();
                            None
                        }
                    }
                }
            }
        };

        if let Some(worker) = worker {
            worker.stop(self.shared.timing.stop_timeout).await;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn is_connected(&self) -> bool {
        self.lock().await.is_connected()
    }

    async fn status(&self) -> EquipmentStatus {
        self.lock().await.status()
    }

    async fn status_history(&self) -> Vec<StatusTransition> {
        self.lock().await.machine.history()
    }

    async fn get_config(&self) -> ConfigMap {
        self.lock().await.config.snapshot()
    }

    async fn default_config(&self) -> ConfigMap {
        self.lock().await.config.defaults().clone()
    }

    async fn set_config(&self, partial: ConfigMap) -> Result<()> {
        const OP: &str = "set_config";
        let mut device = self.device().await;

        let (previous, config, measuring) = {
            let mut state = self.lock().await;
            state.require_connected(OP)?;

            let previous = match state.config.merge(&partial) {
                Ok(previous) => previous,
                Err(e) => return Err(state.fail(OP, e)),
            };
            if let Err(e) = device.driver.validate(&state.config) {
                state.config.restore(previous);
                return Err(state.fail(OP, e));
            }
            // the running worker keeps the period it was started with
            if state.status() == EquipmentStatus::Measuring
                && previous.get("sample_rate") != state.config.get("sample_rate")
            {
                state.config.restore(previous);
                return Err(state.fail(
                    OP,
                    EquipmentError::validation("sample_rate cannot change while measuring"),
                ));
            }

            debug!("'{}' merged {} configuration keys", self.name, partial.len());
            let (config, measuring) = match state.begin_apply(OP) {
                Ok(begun) => begun,
                Err(e) => {
                    state.config.restore(previous);
                    return Err(e);
                }
            };
            (previous, config, measuring)
        };

        let result = device.apply(&config).await;

        let mut state = self.lock().await;
        if result.is_err() {
            state.config.restore(previous);
        }
        state.finish_apply(OP, result, measuring)
    }

    async fn apply_config(&self) -> Result<()> {
        const OP: &str = "apply_config";
        let mut device = self.device().await;
        let (config, measuring) = {
            let mut state = self.lock().await;
            state.require_connected(OP)?;
            state.begin_apply(OP)?
        };

        let result = device.apply(&config).await;
        self.lock().await.finish_apply(OP, result, measuring)
    }

    async fn reset(&self) -> Result<()> {
        const OP: &str = "reset";
        let mut device = self.device().await;
        let mut config = {
            let mut state = self.lock().await;
            state.require_connected(OP)?;
            state.require_status(OP, &[EquipmentStatus::Ready])?;
            state.set_status(EquipmentStatus::Busy, OP)?;
            state.config.clone()
        };

        let result = async {
            let (driver, session) = device.parts()?;
            driver.safe_shutdown(session, &mut config).await?;
            driver.reset(session).await?;
            config.restore_defaults();
            driver.apply(session, &config).await
        }
        .await;

        let mut state = self.lock().await;
        state.config = config;
        match result {
            Ok(()) => {
                state.set_status(EquipmentStatus::Ready, OP)?;
                state.succeed();
                info!("Reset '{}' to defaults", self.name);
                Ok(())
            }
            Err(e) => Err(state.fail(OP, e)),
        }
    }

    async fn start_measurement(&self) -> Result<MeasurementStart> {
        const OP: &str = "start_measurement";
        let mut device = self.device().await;

        let (config, period) = {
            let mut state = self.lock().await;
            state.require_connected(OP)?;

            if state.status() == EquipmentStatus::Measuring {
                debug!("'{}' is already measuring", self.name);
                return Ok(MeasurementStart::AlreadyRunning);
            }
            state.require_status(OP, &[EquipmentStatus::Ready])?;

            let rate = match state.config.settings::<CommonSettings>() {
                Ok(settings) => settings.sample_rate,
                Err(e) => return Err(state.fail(OP, e)),
            };
            let Some(period) = period_from_rate(rate, self.shared.timing.min_poll_interval) else {
                return Err(state.fail(
                    OP,
                    EquipmentError::configuration(format!("invalid sample_rate {}", rate)),
                ));
            };
            (state.config.clone(), period)
        };

        let begun = match device.parts() {
            Ok((driver, session)) => driver.begin_streaming(session, &config).await,
            Err(e) => Err(e),
        };

        let mut state = self.lock().await;
        if let Err(e) = begun {
            return Err(state.fail(OP, e));
        }
        state.set_status(EquipmentStatus::Measuring, OP)?;
        self.shared.install_worker(self.spawn_worker(period));
        state.succeed();
        info!("'{}' measuring every {:?}", self.name, period);
        Ok(MeasurementStart::Started)
    }

    async fn stop_measurement(&self) -> Result<()> {
        const OP: &str = "stop_measurement";
        let worker = self.shared.take_worker();
        let timeout = self.shared.timing.stop_timeout;

        let was_measuring = {
            let mut state = self.lock().await;
            let measuring = state.status() == EquipmentStatus::Measuring;
            if measuring {
                state.set_status(EquipmentStatus::Ready, OP)?;
            }
            measuring
        };

        let outcome = match worker {
            Some(worker) => worker.stop(timeout).await,
            None => JoinOutcome::Finished,
        };
        if !was_measuring {
            return Ok(());
        }
        info!("'{}' stopped measuring", self.name);

        if outcome == JoinOutcome::TimedOut {
            // the detached tick still holds the device
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let _ = shared.end_streaming(OP).await;
            });
            return Ok(());
        }
        self.shared.end_streaming(OP).await
    }

    async fn measure(&self) -> Result<Value> {
        const OP: &str = "measure";
        let mut device = self.device().await;
        let config = {
            let mut state = self.lock().await;
            state.require_connected(OP)?;
            state.require_status(OP, &[EquipmentStatus::Ready, EquipmentStatus::Measuring])?;
            state.config.clone()
        };

        let result = device.measure(&config).await;

        let mut state = self.lock().await;
        match result {
            Ok(reading) => {
                let record = state.record(reading);
                state.succeed();
                Ok(record.value)
            }
            Err(e) => Err(state.fail(OP, e)),
        }
    }

    async fn is_measuring(&self) -> bool {
        self.lock().await.status() == EquipmentStatus::Measuring
    }

    async fn get_measurement_data(&self) -> Vec<MeasurementRecord> {
        self.lock().await.log.records().to_vec()
    }

    async fn clear_data(&self) -> Result<()> {
        const OP: &str = "clear_data";
        let mut state = self.lock().await;
        state.require_connected(OP)?;
        state.require_status(OP, &[EquipmentStatus::Ready])?;

        let cleared = state.log.len();
        state.log.clear();
        state.notifier.data_cleared();
        state.succeed();
        debug!("'{}' cleared {} records", self.name, cleared);
        Ok(())
    }

    async fn export_data(&self, path: &Path, format: ExportFormat) -> Result<()> {
        const OP: &str = "export_data";
        let snapshot = {
            let state = self.lock().await;
            state.log.snapshot(&self.name, state.config.snapshot())
        };

        match snapshot.write_to(path, format).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lock().await.fail(OP, e)),
        }
    }

    async fn get_status(&self) -> StatusReport {
        let state = self.lock().await;
        let status = state.status();
        StatusReport {
            name: self.name.clone(),
            status,
            connected: state.is_connected(),
            measuring: status == EquipmentStatus::Measuring,
            io_type: self.io_type,
            last_error: state.last_error.clone(),
            data_points: state.log.len(),
        }
    }

    async fn last_error(&self) -> Option<String> {
        self.lock().await.last_error.clone()
    }

    async fn clear_error(&self) {
        self.lock().await.last_error = None;
    }

    async fn self_test(&self) -> Result<bool> {
        const OP: &str = "self_test";
        let mut device = self.device().await;
        let config = {
            let mut state = self.lock().await;
            state.require_connected(OP)?;
            state.require_status(OP, &[EquipmentStatus::Ready])?;
            state.set_status(EquipmentStatus::Busy, OP)?;
            state.config.clone()
        };

        let result = match device.parts() {
            Ok((driver, session)) => driver.self_test(session, &config).await,
            Err(e) => Err(e),
        };

        let mut state = self.lock().await;
        match result {
            Ok(passed) => {
                state.set_status(EquipmentStatus::Ready, OP)?;
                state.succeed();
                if !passed {
                    warn!("'{}' self-test reported a failure", self.name);
                }
                Ok(passed)
            }
            Err(e) => Err(state.fail(OP, e)),
        }
    }

    async fn identification(&self) -> Result<Identification> {
        let state = self.lock().await;
        match (&state.identification, state.status().is_connected()) {
            (Some(identification), true) => Ok(identification.clone()),
            _ => Err(EquipmentError::NotConnected),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EquipmentEvent> {
        self.shared.notifier.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config_store::to_config_map;
    use crate::transport::simulated::SimVisaInstrument;
    use crate::transport::visa::query_f64;
    use crate::transport::{SimulatedTransports, VisaSession};

    const ADDRESS: &str = "SIM::METER::INSTR";

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct GaugeSettings {
        #[serde(flatten)]
        common: CommonSettings,
        limit: f64,
    }

    #[derive(Debug, Default)]
    struct GaugeDriver;

    #[async_trait]
    impl Driver for GaugeDriver {
        type Session = Box<dyn VisaSession>;

        fn type_name(&self) -> &'static str {
            "gauge"
        }

        fn io_type(&self) -> IoType {
            IoType::Ethernet
        }

        fn default_config(&self) -> Result<ConfigMap> {
            to_config_map(&GaugeSettings {
                limit: 1.0,
                ..Default::default()
            })
        }

        fn validate(&self, config: &ConfigStore) -> Result<()> {
            let settings: GaugeSettings = config.settings()?;
            settings.common.validate()?;
            if settings.limit > 10.0 {
                return Err(EquipmentError::validation("limit above 10"));
            }
            Ok(())
        }

        async fn open(
            &mut self,
            transports: &dyn TransportProvider,
            config: &ConfigStore,
        ) -> Result<(Self::Session, Identification)> {
            let timeout = config.settings::<CommonSettings>()?.timeout();
            let mut session = transports.open_visa(ADDRESS, timeout).await?;
            let idn = session.identify().await?;
            Ok((session, crate::transport::visa::parse_identification(&idn)?))
        }

        async fn apply(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<()> {
            let settings: GaugeSettings = config.settings()?;
            session.write(&format!("VOLT {}", settings.limit)).await?;
            Ok(())
        }

        async fn safe_shutdown(&mut self, session: &mut Self::Session, _config: &mut ConfigStore) -> Result<()> {
            session.write("OUTP OFF").await?;
            Ok(())
        }

        async fn reset(&mut self, session: &mut Self::Session) -> Result<()> {
            session.reset().await?;
            Ok(())
        }

        async fn self_test(&mut self, session: &mut Self::Session, _config: &ConfigStore) -> Result<bool> {
            Ok(session.self_test().await?)
        }

        async fn measure(&mut self, session: &mut Self::Session, _config: &ConfigStore) -> Result<Reading> {
            let value = query_f64(session.as_mut(), "READ?").await?;
            Ok(Reading::new(value, "V").with_metadata("function", "gauge"))
        }

        async fn close(&mut self, mut session: Self::Session) -> Result<()> {
            session.close().await?;
            Ok(())
        }
    }

    fn gauge() -> (Instrument<GaugeDriver>, Arc<SimVisaInstrument>) {
        gauge_with(Duration::from_secs(1))
    }

    fn gauge_with(stop_timeout: Duration) -> (Instrument<GaugeDriver>, Arc<SimVisaInstrument>) {
        let transports = SimulatedTransports::new();
        let meter = transports.add_multimeter(ADDRESS);
        let timing = LoopTiming {
            stop_timeout,
            min_poll_interval: Duration::from_millis(1),
        };
        let instrument = Instrument::with_timing("gauge", GaugeDriver, Arc::new(transports), timing).unwrap();
        (instrument, meter)
    }

    fn partial(key: &str, value: impl Into<Value>) -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert(key.to_string(), value.into());
        map
    }

    #[tokio::test]
    async fn test_connect_walks_the_lifecycle() {
        let (gauge, meter) = gauge();
        let mut events = gauge.subscribe();
        assert_eq!(gauge.status().await, EquipmentStatus::Disconnected);

        gauge.connect().await.unwrap();
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
        assert!(gauge.is_connected().await);
        assert!(meter.is_open());

        let id = gauge.identification().await.unwrap();
        assert_eq!(id.manufacturer, "Agilent Technologies");
        assert_eq!(id.model, "34461A");

        let transitions: Vec<_> = gauge.status_history().await.iter().map(|t| t.to).collect();
        assert_eq!(transitions, vec![EquipmentStatus::Connecting, EquipmentStatus::Ready]);

        match events.recv().await.unwrap() {
            EquipmentEvent::StatusChanged { from, to, .. } => {
                assert_eq!((from, to), (EquipmentStatus::Disconnected, EquipmentStatus::Connecting));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // a second connect is a no-op
        gauge.connect().await.unwrap();
        assert_eq!(gauge.status_history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_operations_change_nothing() {
        let (gauge, meter) = gauge();
        let config = gauge.get_config().await;

        assert_eq!(gauge.set_config(partial("limit", 2.0)).await, Err(EquipmentError::NotConnected));
        assert_eq!(gauge.measure().await, Err(EquipmentError::NotConnected));
        assert!(gauge.start_measurement().await.is_err());
        assert!(gauge.reset().await.is_err());
        assert!(gauge.clear_data().await.is_err());
        assert!(gauge.self_test().await.is_err());
        assert!(gauge.identification().await.is_err());

        assert_eq!(gauge.status().await, EquipmentStatus::Disconnected);
        assert_eq!(gauge.get_config().await, config);
        assert!(gauge.get_measurement_data().await.is_empty());
        assert_eq!(meter.faults().calls(), 0);
        assert!(gauge.last_error().await.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_connect_sets_error_and_recovers() {
        let (gauge, meter) = gauge();
        meter.faults().set_unreachable(true);

        let err = gauge.connect().await.unwrap_err();
        assert!(matches!(err, EquipmentError::Connection(_)));
        assert_eq!(gauge.status().await, EquipmentStatus::Error);
        assert!(!gauge.is_connected().await);
        assert!(gauge.get_status().await.last_error.is_some());

        meter.faults().set_unreachable(false);
        gauge.connect().await.unwrap();
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
        assert_eq!(gauge.last_error().await, None);
    }

    #[tokio::test]
    async fn test_set_config_merges_known_keys() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();

        gauge.set_config(partial("limit", 2.5)).await.unwrap();
        assert_eq!(gauge.get_config().await.get("limit"), Some(&Value::Float(2.5)));
        assert!(meter.commands().iter().any(|c| c == "VOLT 2.5"));

        let before = gauge.get_config().await;
        let err = gauge.set_config(partial("bogus", 1)).await.unwrap_err();
        assert!(matches!(err, EquipmentError::Configuration(_)));
        assert_eq!(gauge.get_config().await, before);
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        let calls = meter.faults().calls();
        let before = gauge.get_config().await;

        let err = gauge.set_config(partial("limit", 25.0)).await.unwrap_err();
        assert!(matches!(err, EquipmentError::Validation(_)));
        assert_eq!(gauge.get_config().await, before);
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
        assert_eq!(meter.faults().calls(), calls);
    }

    #[tokio::test]
    async fn test_apply_failure_rolls_back_and_errors() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        let before = gauge.get_config().await;

        meter.faults().fail_next();
        let err = gauge.set_config(partial("limit", 3.0)).await.unwrap_err();
        assert!(err.is_device_fault());
        assert_eq!(gauge.get_config().await, before);
        assert_eq!(gauge.status().await, EquipmentStatus::Error);
    }

    #[tokio::test]
    async fn test_set_config_with_own_snapshot_is_idempotent() {
        let (gauge, _meter) = gauge();
        gauge.connect().await.unwrap();

        let snapshot = gauge.get_config().await;
        gauge.set_config(snapshot.clone()).await.unwrap();
        assert_eq!(gauge.get_config().await, snapshot);
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_measure_appends_exactly_one_record() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        meter.set_reading(1.25);

        assert_eq!(gauge.measure().await.unwrap(), Value::Float(1.25));
        let data = gauge.get_measurement_data().await;
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].units, "V");
        assert_eq!(data[0].metadata.get("function"), Some(&Value::from("gauge")));

        meter.faults().fail_next();
        assert!(gauge.measure().await.is_err());
        assert_eq!(gauge.get_measurement_data().await.len(), 1);
        assert_eq!(gauge.status().await, EquipmentStatus::Error);
    }

    #[tokio::test]
    async fn test_continuous_measurement() {
        let (gauge, _meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.set_config(partial("sample_rate", 200.0)).await.unwrap();

        assert_eq!(gauge.start_measurement().await.unwrap(), MeasurementStart::Started);
        assert_eq!(gauge.start_measurement().await.unwrap(), MeasurementStart::AlreadyRunning);
        assert!(gauge.is_measuring().await);
        assert!(gauge.reset().await.is_err());
        assert!(gauge.clear_data().await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        gauge.stop_measurement().await.unwrap();
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);

        let count = gauge.get_measurement_data().await.len();
        assert!(count >= 1, "expected records, got {}", count);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gauge.get_measurement_data().await.len(), count);

        // stopping again is harmless
        gauge.stop_measurement().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_bounded_while_a_reading_is_in_flight() {
        let (gauge, meter) = gauge_with(Duration::from_millis(50));
        gauge.connect().await.unwrap();
        gauge.set_config(partial("sample_rate", 1000.0)).await.unwrap();
        gauge.start_measurement().await.unwrap();

        meter.faults().set_latency(Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = tokio::time::timeout(Duration::from_millis(100), gauge.status()).await;
        assert_eq!(status, Ok(EquipmentStatus::Measuring));
        assert!(tokio::time::timeout(Duration::from_millis(100), gauge.get_status()).await.is_ok());

        let started = std::time::Instant::now();
        gauge.stop_measurement().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(150), "stop took {:?}", started.elapsed());
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
        assert!(!gauge.is_measuring().await);

        // the reading that was in flight is dropped
        let count = gauge.get_measurement_data().await.len();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(gauge.get_measurement_data().await.len(), count);
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_sample_rate_is_fixed_while_measuring() {
        let (gauge, _meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.set_config(partial("sample_rate", 0.01)).await.unwrap();
        gauge.start_measurement().await.unwrap();

        let err = gauge.set_config(partial("sample_rate", 50.0)).await.unwrap_err();
        assert!(matches!(err, EquipmentError::Validation(_)));
        assert_eq!(gauge.get_config().await.get("sample_rate"), Some(&Value::Float(0.01)));
        assert_eq!(gauge.status().await, EquipmentStatus::Measuring);

        // other keys still apply while measuring
        gauge.set_config(partial("limit", 2.0)).await.unwrap();
        assert_eq!(gauge.status().await, EquipmentStatus::Measuring);
        gauge.stop_measurement().await.unwrap();

        gauge.set_config(partial("sample_rate", 50.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_failure_moves_to_error() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.set_config(partial("sample_rate", 200.0)).await.unwrap();
        gauge.start_measurement().await.unwrap();

        meter.faults().set_fail_all(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gauge.status().await, EquipmentStatus::Error);
        assert!(!gauge.is_measuring().await);

        meter.faults().set_fail_all(false);
        gauge.connect().await.unwrap();
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_disconnect_stops_loop_and_shuts_down() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.start_measurement().await.unwrap();

        gauge.disconnect().await.unwrap();
        assert_eq!(gauge.status().await, EquipmentStatus::Disconnected);
        assert!(!meter.is_open());
        assert!(meter.commands().iter().any(|c| c == "OUTP OFF"));

        gauge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_forces_status_even_on_failure() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();

        meter.faults().set_fail_all(true);
        assert!(gauge.disconnect().await.is_err());
        assert_eq!(gauge.status().await, EquipmentStatus::Disconnected);
        assert!(!meter.is_open());
    }

    #[tokio::test]
    async fn test_reset_restores_defaults() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.set_config(partial("limit", 4.0)).await.unwrap();

        gauge.reset().await.unwrap();
        assert_eq!(gauge.get_config().await, gauge.default_config().await);
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);

        let commands = meter.commands();
        let off = commands.iter().rposition(|c| c == "OUTP OFF").unwrap();
        let rst = commands.iter().rposition(|c| c == "*RST").unwrap();
        assert!(off < rst);
    }

    #[tokio::test]
    async fn test_self_test_and_clear() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        assert!(gauge.self_test().await.unwrap());
        meter.set_self_test_result(false);
        assert!(!gauge.self_test().await.unwrap());
        assert_eq!(gauge.status().await, EquipmentStatus::Ready);

        gauge.measure().await.unwrap();
        let mut events = gauge.subscribe();
        gauge.clear_data().await.unwrap();
        assert!(gauge.get_measurement_data().await.is_empty());
        assert!(matches!(events.recv().await.unwrap(), EquipmentEvent::DataCleared { .. }));
    }

    #[tokio::test]
    async fn test_status_report() {
        let (gauge, _meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.measure().await.unwrap();

        let report = gauge.get_status().await;
        assert_eq!(report.name, "gauge");
        assert_eq!(report.status, EquipmentStatus::Ready);
        assert!(report.connected);
        assert!(!report.measuring);
        assert_eq!(report.io_type, IoType::Ethernet);
        assert_eq!(report.data_points, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["io_type"], "ethernet");
    }

    #[tokio::test]
    async fn test_dropping_instrument_ends_worker() {
        let (gauge, meter) = gauge();
        gauge.connect().await.unwrap();
        gauge.set_config(partial("sample_rate", 200.0)).await.unwrap();
        gauge.start_measurement().await.unwrap();
        drop(gauge);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let calls = meter.faults().calls();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(meter.faults().calls(), calls);
    }
}
