/*!
 * Equipment registry and factory.
 *
 * The factory maps a logical type name to a concrete equipment family and
 * checks the parameters that family needs. It performs no I/O: a created
 * equipment is `Disconnected` with its default configuration.
 *
 * The registry owns named equipment, loads and saves the equipment
 * configuration file and drives bulk connect/disconnect.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use labkit_core::config::Config;
use labkit_core::types::{ConfigMap, Value};

use crate::devices::relay::DEFAULT_BAUD_RATE;
use crate::devices::{
    AgilentDmm, AgilentPowerSupply, Camera, CameraDriver, DmmDriver, KtaRelay, PowerSupplyDriver, RelayDriver,
    SupplyModel,
};
use crate::data_log::ExportFormat;
use crate::equipment::{Driver, Equipment, Instrument, StatusReport};
use crate::error::{CreationError, EquipmentError, RegistryError};
use crate::measurement::LoopTiming;
use crate::transport::TransportProvider;

/// Logical equipment type names known to the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EquipmentKind {
    /// VISA digital multimeter
    AgilentDmm,
    /// VISA DC power supply
    AgilentPowerSupply,
    /// Serial relay board
    KtaRelay,
    /// Imaging-SDK camera
    Camera,
}

impl EquipmentKind {
    /// Every kind, in the order they are listed to callers
    pub const ALL: [EquipmentKind; 4] = [
        EquipmentKind::AgilentDmm,
        EquipmentKind::AgilentPowerSupply,
        EquipmentKind::KtaRelay,
        EquipmentKind::Camera,
    ];

    /// The logical type name
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentKind::AgilentDmm => "agilent_dmm",
            EquipmentKind::AgilentPowerSupply => "agilent_power_supply",
            EquipmentKind::KtaRelay => "kta_relay",
            EquipmentKind::Camera => "camera",
        }
    }

    /// Parameters that must be present to create this kind
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            EquipmentKind::AgilentDmm | EquipmentKind::AgilentPowerSupply => &["visa_address"],
            EquipmentKind::KtaRelay => &["com_port"],
            EquipmentKind::Camera => &["camera_index"],
        }
    }
}

impl fmt::Display for EquipmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquipmentKind {
    type Err = CreationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EquipmentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CreationError::UnknownType(s.to_string()))
    }
}

/// A created equipment of any family
#[derive(Debug)]
pub enum AnyEquipment {
    /// Multimeter
    Dmm(AgilentDmm),
    /// Power supply
    PowerSupply(AgilentPowerSupply),
    /// Relay board
    Relay(KtaRelay),
    /// Camera
    Camera(Camera),
}

impl AnyEquipment {
    /// The equipment contract, independent of family
    pub fn as_equipment(&self) -> &dyn Equipment {
        match self {
            AnyEquipment::Dmm(e) => e,
            AnyEquipment::PowerSupply(e) => e,
            AnyEquipment::Relay(e) => e,
            AnyEquipment::Camera(e) => e,
        }
    }

    /// The family of this equipment
    pub fn kind(&self) -> EquipmentKind {
        match self {
            AnyEquipment::Dmm(_) => EquipmentKind::AgilentDmm,
            AnyEquipment::PowerSupply(_) => EquipmentKind::AgilentPowerSupply,
            AnyEquipment::Relay(_) => EquipmentKind::KtaRelay,
            AnyEquipment::Camera(_) => EquipmentKind::Camera,
        }
    }

    /// The multimeter, if this is one
    pub fn as_dmm(&self) -> Option<&AgilentDmm> {
        match self {
            AnyEquipment::Dmm(e) => Some(e),
            _ => None,
        }
    }

    /// The power supply, if this is one
    pub fn as_power_supply(&self) -> Option<&AgilentPowerSupply> {
        match self {
            AnyEquipment::PowerSupply(e) => Some(e),
            _ => None,
        }
    }

    /// The relay board, if this is one
    pub fn as_relay(&self) -> Option<&KtaRelay> {
        match self {
            AnyEquipment::Relay(e) => Some(e),
            _ => None,
        }
    }

    /// The camera, if this is one
    pub fn as_camera(&self) -> Option<&Camera> {
        match self {
            AnyEquipment::Camera(e) => Some(e),
            _ => None,
        }
    }
}

/// Builds equipment from a logical type name and creation parameters
#[derive(Debug, Clone)]
pub struct EquipmentFactory {
    transports: Arc<dyn TransportProvider>,
    timing: LoopTiming,
}

impl EquipmentFactory {
    /// A factory whose equipment opens sessions through `transports`
    pub fn new(transports: Arc<dyn TransportProvider>) -> Self {
        Self::with_timing(transports, LoopTiming::default())
    }

    /// Like [`EquipmentFactory::new`] with explicit measurement loop timing
    pub fn with_timing(transports: Arc<dyn TransportProvider>, timing: LoopTiming) -> Self {
        Self { transports, timing }
    }

    /// Create a disconnected equipment named `name` of `equipment_type`
    pub fn create(
        &self,
        equipment_type: &str,
        name: &str,
        params: &ConfigMap,
    ) -> Result<AnyEquipment, CreationError> {
        let kind: EquipmentKind = equipment_type.parse()?;
        for parameter in kind.required_parameters() {
            if !params.contains_key(*parameter) {
                return Err(CreationError::MissingParameter {
                    equipment_type: kind.to_string(),
                    parameter: parameter.to_string(),
                });
            }
        }

        let equipment = match kind {
            EquipmentKind::AgilentDmm => {
                let driver = DmmDriver::new(string_param(params, "visa_address")?);
                AnyEquipment::Dmm(self.build(kind, name, driver)?)
            }
            EquipmentKind::AgilentPowerSupply => {
                let model = match params.get("model") {
                    Some(value) => {
                        let text = value.as_str().ok_or_else(|| invalid("model", "expected a string"))?;
                        text.parse::<SupplyModel>().map_err(|e| invalid("model", e.to_string()))?
                    }
                    None => SupplyModel::default(),
                };
                let driver = PowerSupplyDriver::new(string_param(params, "visa_address")?, model);
                AnyEquipment::PowerSupply(self.build(kind, name, driver)?)
            }
            EquipmentKind::KtaRelay => {
                let baud_rate = match params.get("baud_rate") {
                    Some(value) => value
                        .as_integer()
                        .and_then(|v| u32::try_from(v).ok())
                        .filter(|v| *v > 0)
                        .ok_or_else(|| invalid("baud_rate", "expected a positive integer"))?,
                    None => DEFAULT_BAUD_RATE,
                };
                let driver = RelayDriver::new(string_param(params, "com_port")?, baud_rate);
                AnyEquipment::Relay(self.build(kind, name, driver)?)
            }
            EquipmentKind::Camera => {
                let driver = CameraDriver::new(index_param(params, "camera_index")?);
                AnyEquipment::Camera(self.build(kind, name, driver)?)
            }
        };

        debug!("Created {} '{}'", kind, name);
        Ok(equipment)
    }

    fn build<D: Driver>(
        &self,
        kind: EquipmentKind,
        name: &str,
        driver: D,
    ) -> Result<Instrument<D>, CreationError> {
        Instrument::with_timing(name, driver, Arc::clone(&self.transports), self.timing)
            .map_err(|e: EquipmentError| invalid(kind.as_str(), e.to_string()))
    }
}

fn invalid(parameter: &str, reason: impl Into<String>) -> CreationError {
    CreationError::InvalidParameter {
        parameter: parameter.to_string(),
        reason: reason.into(),
    }
}

fn string_param(params: &ConfigMap, key: &str) -> Result<String, CreationError> {
    match params.get(key).and_then(Value::as_str) {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        Some(_) => Err(invalid(key, "must not be empty")),
        None => Err(invalid(key, "expected a string")),
    }
}

fn index_param(params: &ConfigMap, key: &str) -> Result<usize, CreationError> {
    let value = params.get(key).ok_or_else(|| invalid(key, "missing"))?;
    let index = match value {
        Value::String(text) => text.trim().parse::<i64>().ok(),
        other => other.as_integer(),
    };
    index
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| invalid(key, "expected a non-negative integer"))
}

/// One entry of the equipment configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentEntry {
    /// Logical type name
    #[serde(rename = "type")]
    pub equipment_type: String,
    /// Creation parameters
    #[serde(default)]
    pub config: ConfigMap,
}

/// Encoding of an equipment configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// JSON object
    Json,
    /// TOML table
    Toml,
}

impl FileFormat {
    /// TOML for `.toml` files, JSON otherwise
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => FileFormat::Toml,
            _ => FileFormat::Json,
        }
    }
}

/// Event types for the equipment registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// Equipment was added
    Added {
        /// Equipment name
        name: String,
        /// Logical type name
        equipment_type: EquipmentKind,
    },
    /// Equipment was removed after being disconnected
    Removed {
        /// Equipment name
        name: String,
    },
}

#[derive(Debug)]
struct Registered {
    params: ConfigMap,
    equipment: Arc<AnyEquipment>,
}

/// Named equipment owned by one application
#[derive(Debug)]
pub struct EquipmentRegistry {
    factory: EquipmentFactory,
    equipment: RwLock<HashMap<String, Registered>>,
    event_sender: broadcast::Sender<RegistryEvent>,
    data_dir: PathBuf,
    export_format: ExportFormat,
}

impl EquipmentRegistry {
    /// Create an empty registry
    pub fn new(factory: EquipmentFactory) -> Self {
        let defaults = Config::default();
        let (event_sender, _) = broadcast::channel(100);
        Self {
            factory,
            equipment: RwLock::new(HashMap::new()),
            event_sender,
            data_dir: PathBuf::from(defaults.general.data_dir),
            export_format: ExportFormat::default(),
        }
    }

    /// Build a registry from the application configuration.
    ///
    /// Measurement timing comes from `[measurement]`. The file named by
    /// `equipment.config_file` is loaded when it exists, and its equipment is
    /// connected when `equipment.connect_on_load` is set.
    pub async fn from_config(config: &Config, transports: Arc<dyn TransportProvider>) -> Result<Self, RegistryError> {
        let export_format: ExportFormat = config
            .measurement
            .default_export_format
            .parse()
            .map_err(|e: EquipmentError| RegistryError::Config(e.to_string()))?;

        let factory = EquipmentFactory::with_timing(transports, LoopTiming::from(&config.measurement));
        let mut registry = Self::new(factory);
        registry.data_dir = PathBuf::from(&config.general.data_dir);
        registry.export_format = export_format;

        let path = Path::new(&config.equipment.config_file);
        if path.exists() {
            registry.load_file(path)?;
            if config.equipment.connect_on_load {
                registry.connect_all().await?;
            }
        } else {
            info!("No equipment file at {}; starting empty", path.display());
        }
        Ok(registry)
    }

    /// Directory [`EquipmentRegistry::export`] writes to
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Export the data log of `name` into the data directory in the
    /// configured default format; returns the written path
    pub async fn export(&self, name: &str) -> Result<PathBuf, RegistryError> {
        let equipment = self.get(name)?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.data_dir.join(format!("{}.{}", name, self.export_format));
        equipment.as_equipment().export_data(&path, self.export_format).await?;
        info!("Exported '{}' to {}", name, path.display());
        Ok(path)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// The factory used by [`EquipmentRegistry::add`]
    pub fn factory(&self) -> &EquipmentFactory {
        &self.factory
    }

    /// Create and register equipment under `name`
    pub fn add(&self, name: &str, equipment_type: &str, params: ConfigMap) -> Result<Arc<AnyEquipment>, RegistryError> {
        let mut table = self.equipment.write().map_err(|_| RegistryError::LockPoisoned)?;
        if table.contains_key(name) {
            return Err(CreationError::DuplicateName(name.to_string()).into());
        }

        let equipment = Arc::new(self.factory.create(equipment_type, name, &params)?);
        let kind = equipment.kind();
        table.insert(
            name.to_string(),
            Registered {
                params,
                equipment: Arc::clone(&equipment),
            },
        );
        drop(table);

        let _ = self.event_sender.send(RegistryEvent::Added {
            name: name.to_string(),
            equipment_type: kind,
        });
        info!("Added {} '{}'", kind, name);
        Ok(equipment)
    }

    /// Disconnect and unregister the equipment named `name`.
    ///
    /// A failed safe shutdown is logged; the equipment is removed and left
    /// `Disconnected` either way.
    pub async fn remove(&self, name: &str) -> Result<Arc<AnyEquipment>, RegistryError> {
        let registered = {
            let mut table = self.equipment.write().map_err(|_| RegistryError::LockPoisoned)?;
            table
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
        };

        if let Err(e) = registered.equipment.as_equipment().disconnect().await {
            warn!("Safe shutdown of '{}' failed during removal: {}", name, e);
        }

        let _ = self.event_sender.send(RegistryEvent::Removed { name: name.to_string() });
        info!("Removed '{}'", name);
        Ok(registered.equipment)
    }

    /// The equipment named `name`
    pub fn get(&self, name: &str) -> Result<Arc<AnyEquipment>, RegistryError> {
        let table = self.equipment.read().map_err(|_| RegistryError::LockPoisoned)?;
        table
            .get(name)
            .map(|r| Arc::clone(&r.equipment))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Result<Vec<String>, RegistryError> {
        let table = self.equipment.read().map_err(|_| RegistryError::LockPoisoned)?;
        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Number of registered equipment
    pub fn len(&self) -> usize {
        self.equipment.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Result<Vec<(String, Arc<AnyEquipment>)>, RegistryError> {
        let table = self.equipment.read().map_err(|_| RegistryError::LockPoisoned)?;
        let mut entries: Vec<_> = table
            .iter()
            .map(|(name, r)| (name.clone(), Arc::clone(&r.equipment)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Connect every equipment; returns whether each one succeeded
    pub async fn connect_all(&self) -> Result<BTreeMap<String, bool>, RegistryError> {
        let mut summary = BTreeMap::new();
        for (name, equipment) in self.snapshot()? {
            let connected = match equipment.as_equipment().connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to connect '{}': {}", name, e);
                    false
                }
            };
            summary.insert(name, connected);
        }
        info!(
            "Connected {}/{} equipment",
            summary.values().filter(|ok| **ok).count(),
            summary.len()
        );
        Ok(summary)
    }

    /// Disconnect every equipment; returns whether each safe shutdown succeeded
    pub async fn disconnect_all(&self) -> Result<BTreeMap<String, bool>, RegistryError> {
        let mut summary = BTreeMap::new();
        for (name, equipment) in self.snapshot()? {
            let clean = match equipment.as_equipment().disconnect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to disconnect '{}' cleanly: {}", name, e);
                    false
                }
            };
            summary.insert(name, clean);
        }
        Ok(summary)
    }

    /// Status report of every equipment, sorted by name
    pub async fn statuses(&self) -> Result<Vec<StatusReport>, RegistryError> {
        let mut reports = Vec::new();
        for (_, equipment) in self.snapshot()? {
            reports.push(equipment.as_equipment().get_status().await);
        }
        Ok(reports)
    }

    /// Logical type names the factory accepts
    pub fn available_types(&self) -> Vec<&'static str> {
        EquipmentKind::ALL.iter().map(|k| k.as_str()).collect()
    }

    /// Register every entry of an equipment configuration document.
    ///
    /// All entries are created before any is registered, so a bad entry
    /// leaves the registry untouched.
    pub fn load_str(&self, text: &str, format: FileFormat) -> Result<Vec<String>, RegistryError> {
        let entries: BTreeMap<String, EquipmentEntry> = match format {
            FileFormat::Json => serde_json::from_str(text).map_err(|e| RegistryError::File(e.to_string()))?,
            FileFormat::Toml => toml::from_str(text).map_err(|e| RegistryError::File(e.to_string()))?,
        };

        let mut table = self.equipment.write().map_err(|_| RegistryError::LockPoisoned)?;
        let mut created = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            if table.contains_key(&name) {
                return Err(CreationError::DuplicateName(name).into());
            }
            let equipment = self.factory.create(&entry.equipment_type, &name, &entry.config)?;
            created.push((name, entry.config, equipment));
        }

        let mut names = Vec::with_capacity(created.len());
        for (name, params, equipment) in created {
            let kind = equipment.kind();
            table.insert(
                name.clone(),
                Registered {
                    params,
                    equipment: Arc::new(equipment),
                },
            );
            let _ = self.event_sender.send(RegistryEvent::Added {
                name: name.clone(),
                equipment_type: kind,
            });
            names.push(name);
        }
        info!("Loaded {} equipment", names.len());
        Ok(names)
    }

    /// Register every entry of the equipment configuration file at `path`
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("Loading equipment from {}", path.display());
        self.load_str(&text, FileFormat::from_path(path))
    }

    /// Write the equipment configuration file describing the registry
    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RegistryError> {
        let path = path.as_ref();
        let entries: BTreeMap<String, EquipmentEntry> = {
            let table = self.equipment.read().map_err(|_| RegistryError::LockPoisoned)?;
            table
                .iter()
                .map(|(name, r)| {
                    (
                        name.clone(),
                        EquipmentEntry {
                            equipment_type: r.equipment.kind().to_string(),
                            config: r.params.clone(),
                        },
                    )
                })
                .collect()
        };

        let text = match FileFormat::from_path(path) {
            FileFormat::Json => {
                serde_json::to_string_pretty(&entries).map_err(|e| RegistryError::File(e.to_string()))?
            }
            FileFormat::Toml => toml::to_string_pretty(&entries).map_err(|e| RegistryError::File(e.to_string()))?,
        };
        std::fs::write(path, text)?;
        debug!("Saved {} equipment to {}", entries.len(), path.display());
        Ok(())
    }
}
