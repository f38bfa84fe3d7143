/*!
 * Agilent E364x programmable DC power supplies over VISA.
 *
 * The per-channel settings live in the config store under
 * `voltage_channel_N`, `current_limit_channel_N` and `range_channel_N`; only
 * the channels the model actually has are present. Every setpoint is checked
 * against the selected range of the concrete model before anything is sent.
 */
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use labkit_core::types::{ConfigMap, Value};

use crate::config_store::{to_config_map, CommonSettings, ConfigStore};
use crate::equipment::{Driver, Equipment, Identification, Instrument, IoType, Reading};
use crate::error::{EquipmentError, Result};
use crate::transport::visa::{on_off, parse_identification, query_f64};
use crate::transport::{TransportProvider, VisaSession};

/// One selectable output range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRange {
    /// Range name as used by SCPI (`P8V`, `P20V`)
    pub name: &'static str,
    /// Highest programmable voltage
    pub max_voltage: f64,
    /// Highest programmable current
    pub max_current: f64,
}

impl VoltageRange {
    fn check_voltage(&self, volts: f64) -> Result<()> {
        if !volts.is_finite() || volts < 0.0 || volts > self.max_voltage {
            return Err(EquipmentError::validation(format!(
                "voltage {} V outside 0..={} V of range {}",
                volts, self.max_voltage, self.name
            )));
        }
        Ok(())
    }

    fn check_current(&self, amps: f64) -> Result<()> {
        if !amps.is_finite() || amps < 0.0 || amps > self.max_current {
            return Err(EquipmentError::validation(format!(
                "current limit {} A outside 0..={} A of range {}",
                amps, self.max_current, self.name
            )));
        }
        Ok(())
    }
}

const E3640_RANGES: [VoltageRange; 2] = [
    VoltageRange {
        name: "P8V",
        max_voltage: 8.0,
        max_current: 3.0,
    },
    VoltageRange {
        name: "P20V",
        max_voltage: 20.0,
        max_current: 1.5,
    },
];

const E3648_RANGES: [VoltageRange; 2] = [
    VoltageRange {
        name: "P8V",
        max_voltage: 8.0,
        max_current: 5.0,
    },
    VoltageRange {
        name: "P20V",
        max_voltage: 20.0,
        max_current: 2.5,
    },
];

/// Supported supply models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupplyModel {
    /// Single output, 30 W
    #[default]
    E3640a,
    /// Dual output, 60 W
    E3646a,
    /// Dual output, 100 W
    E3648a,
}

impl SupplyModel {
    /// Lowercase model name
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplyModel::E3640a => "e3640a",
            SupplyModel::E3646a => "e3646a",
            SupplyModel::E3648a => "e3648a",
        }
    }

    /// Number of outputs
    pub fn channels(&self) -> usize {
        match self {
            SupplyModel::E3640a => 1,
            SupplyModel::E3646a | SupplyModel::E3648a => 2,
        }
    }

    /// Selectable ranges
    pub fn ranges(&self) -> &'static [VoltageRange] {
        match self {
            SupplyModel::E3640a | SupplyModel::E3646a => &E3640_RANGES,
            SupplyModel::E3648a => &E3648_RANGES,
        }
    }

    /// Look up a range by name
    pub fn range(&self, name: &str) -> Result<VoltageRange> {
        self.ranges()
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .copied()
            .ok_or_else(|| {
                EquipmentError::validation(format!("range '{}' does not exist on the {}", name, self.as_str()))
            })
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel == 0 || channel > self.channels() {
            return Err(EquipmentError::validation(format!(
                "channel {} does not exist on the {} ({} channels)",
                channel,
                self.as_str(),
                self.channels()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SupplyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupplyModel {
    type Err = EquipmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "e3640a" => Ok(SupplyModel::E3640a),
            "e3646a" => Ok(SupplyModel::E3646a),
            "e3648a" => Ok(SupplyModel::E3648a),
            other => Err(EquipmentError::validation(format!("unsupported supply model '{}'", other))),
        }
    }
}

/// Settings shared by all outputs of a supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplySettings {
    /// Settings every family shares
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Outputs on or off
    pub output_enabled: bool,
    /// Over-voltage protection
    pub over_voltage_protection: bool,
    /// Over-current protection
    pub over_current_protection: bool,
}

impl Default for SupplySettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            output_enabled: false,
            over_voltage_protection: true,
            over_current_protection: true,
        }
    }
}

/// Programmed state of one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// Output number, 1-based
    pub channel: usize,
    /// Programmed voltage
    pub voltage_set: f64,
    /// Programmed current limit
    pub current_limit: f64,
    /// Selected range
    pub range: String,
}

/// Programmed state of the whole supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStatus {
    /// Outputs on or off
    pub output_enabled: bool,
    /// Number of outputs
    pub num_channels: usize,
    /// Per-output state
    pub channels: Vec<ChannelStatus>,
}

fn voltage_key(channel: usize) -> String {
    format!("voltage_channel_{}", channel)
}

fn current_key(channel: usize) -> String {
    format!("current_limit_channel_{}", channel)
}

fn range_key(channel: usize) -> String {
    format!("range_channel_{}", channel)
}

fn channel_status(config: &ConfigStore, channel: usize) -> Result<ChannelStatus> {
    let missing = |key: String| EquipmentError::configuration(format!("'{}' missing or mistyped", key));

    let voltage_set = config
        .get(&voltage_key(channel))
        .and_then(Value::as_float)
        .ok_or_else(|| missing(voltage_key(channel)))?;
    let current_limit = config
        .get(&current_key(channel))
        .and_then(Value::as_float)
        .ok_or_else(|| missing(current_key(channel)))?;
    let range = config
        .get(&range_key(channel))
        .and_then(Value::as_str)
        .ok_or_else(|| missing(range_key(channel)))?
        .to_string();

    Ok(ChannelStatus {
        channel,
        voltage_set,
        current_limit,
        range,
    })
}

/// Driver for E3640A/E3646A/E3648A supplies
#[derive(Debug, Clone)]
pub struct PowerSupplyDriver {
    visa_address: String,
    model: SupplyModel,
}

impl PowerSupplyDriver {
    /// A driver for a supply of `model` at `visa_address`
    pub fn new(visa_address: impl Into<String>, model: SupplyModel) -> Self {
        Self {
            visa_address: visa_address.into(),
            model,
        }
    }

    /// The supply model
    pub fn model(&self) -> SupplyModel {
        self.model
    }

    fn channels(&self) -> impl Iterator<Item = usize> {
        1..=self.model.channels()
    }

    async fn select(session: &mut dyn VisaSession, channel: usize) -> Result<()> {
        session.write(&format!("INST:NSEL {}", channel)).await?;
        Ok(())
    }
}

/// A programmable DC power supply
pub type AgilentPowerSupply = Instrument<PowerSupplyDriver>;

#[async_trait]
impl Driver for PowerSupplyDriver {
    type Session = Box<dyn VisaSession>;

    fn type_name(&self) -> &'static str {
        "agilent_power_supply"
    }

    fn io_type(&self) -> IoType {
        IoType::Ethernet
    }

    fn default_config(&self) -> Result<ConfigMap> {
        let mut config = to_config_map(&SupplySettings::default())?;
        for channel in self.channels() {
            config.insert(voltage_key(channel), Value::Float(0.0));
            config.insert(current_key(channel), Value::Float(0.1));
            config.insert(range_key(channel), Value::from("P8V"));
        }
        Ok(config)
    }

    fn validate(&self, config: &ConfigStore) -> Result<()> {
        config.settings::<SupplySettings>()?.common.validate()?;
        for channel in self.channels() {
            let status = channel_status(config, channel)?;
            let range = self.model.range(&status.range)?;
            range.check_voltage(status.voltage_set)?;
            range.check_current(status.current_limit)?;
        }
        Ok(())
    }

    async fn open(
        &mut self,
        transports: &dyn TransportProvider,
        config: &ConfigStore,
    ) -> Result<(Self::Session, Identification)> {
        let timeout = config.settings::<CommonSettings>()?.timeout();
        let mut session = transports.open_visa(&self.visa_address, timeout).await?;

        let identified = async {
            let idn = session.identify().await?;
            session.clear_faults().await?;
            parse_identification(&idn)
        }
        .await;

        match identified {
            Ok(identification) => {
                if !identification.model.eq_ignore_ascii_case(self.model.as_str()) {
                    warn!(
                        "{} identifies as {}, configured as {}",
                        self.visa_address, identification.model, self.model
                    );
                }
                Ok((session, identification))
            }
            Err(e) => {
                let _ = session.close().await;
                Err(EquipmentError::connection(format!(
                    "no identification from {}: {}",
                    self.visa_address, e
                )))
            }
        }
    }

    async fn apply(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<()> {
        self.validate(config)?;
        let settings: SupplySettings = config.settings()?;

        for channel in self.channels() {
            let status = channel_status(config, channel)?;
            let range = self.model.range(&status.range)?;
            Self::select(session.as_mut(), channel).await?;
            session.write(&format!("VOLT:RANG {}", range.name)).await?;
            session.write(&format!("VOLT {}", status.voltage_set)).await?;
            session.write(&format!("CURR {}", status.current_limit)).await?;
        }
        session
            .write(&format!("VOLT:PROT:STAT {}", on_off(settings.over_voltage_protection)))
            .await?;
        session
            .write(&format!("CURR:PROT:STAT {}", on_off(settings.over_current_protection)))
            .await?;
        session.write(&format!("OUTP {}", on_off(settings.output_enabled))).await?;

        debug!(
            "{} programmed {} channel(s), output {}",
            self.visa_address,
            self.model.channels(),
            on_off(settings.output_enabled)
        );
        Ok(())
    }

    async fn safe_shutdown(&mut self, session: &mut Self::Session, config: &mut ConfigStore) -> Result<()> {
        session.write("OUTP OFF").await?;
        config.set("output_enabled", false)?;
        Ok(())
    }

    async fn reset(&mut self, session: &mut Self::Session) -> Result<()> {
        session.reset().await?;
        session.clear_faults().await?;
        Ok(())
    }

    async fn self_test(&mut self, session: &mut Self::Session, _config: &ConfigStore) -> Result<bool> {
        Ok(session.self_test().await?)
    }

    async fn measure(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<Reading> {
        let settings: SupplySettings = config.settings()?;
        let mut values = ConfigMap::new();

        for channel in self.channels() {
            Self::select(session.as_mut(), channel).await?;
            let volts = query_f64(session.as_mut(), "MEAS:VOLT?").await?;
            let amps = query_f64(session.as_mut(), "MEAS:CURR?").await?;
            values.insert(format!("voltage_ch{}", channel), Value::Float(volts));
            values.insert(format!("current_ch{}", channel), Value::Float(amps));
            values.insert(format!("power_ch{}", channel), Value::Float(volts * amps));
        }

        Ok(Reading::new(Value::Object(values), "V/A/W")
            .with_metadata("channels", self.model.channels() as i64)
            .with_metadata("output_enabled", settings.output_enabled))
    }

    async fn close(&mut self, mut session: Self::Session) -> Result<()> {
        session.close().await?;
        Ok(())
    }
}

impl Instrument<PowerSupplyDriver> {
    /// Program the voltage of one output
    pub async fn set_voltage(&self, channel: usize, volts: f64) -> Result<()> {
        let mut access = self.access("set_voltage").await?;
        let result = async {
            let (driver, session, config) = access.parts()?;
            let model = driver.model();
            model.check_channel(channel)?;
            let range = model.range(&channel_status(config, channel)?.range)?;
            range.check_voltage(volts)?;

            PowerSupplyDriver::select(session.as_mut(), channel).await?;
            session.write(&format!("VOLT {}", volts)).await?;
            config.set(&voltage_key(channel), volts)
        }
        .await;
        access.finish(result).await
    }

    /// Program the current limit of one output
    pub async fn set_current_limit(&self, channel: usize, amps: f64) -> Result<()> {
        let mut access = self.access("set_current_limit").await?;
        let result = async {
            let (driver, session, config) = access.parts()?;
            let model = driver.model();
            model.check_channel(channel)?;
            let range = model.range(&channel_status(config, channel)?.range)?;
            range.check_current(amps)?;

            PowerSupplyDriver::select(session.as_mut(), channel).await?;
            session.write(&format!("CURR {}", amps)).await?;
            config.set(&current_key(channel), amps)
        }
        .await;
        access.finish(result).await
    }

    /// Select the output range of one output.
    ///
    /// The programmed setpoints must fit the new range.
    pub async fn set_range(&self, channel: usize, range: &str) -> Result<()> {
        let mut access = self.access("set_range").await?;
        let result = async {
            let (driver, session, config) = access.parts()?;
            let model = driver.model();
            model.check_channel(channel)?;
            let range = model.range(range)?;
            let status = channel_status(config, channel)?;
            range.check_voltage(status.voltage_set)?;
            range.check_current(status.current_limit)?;

            PowerSupplyDriver::select(session.as_mut(), channel).await?;
            session.write(&format!("VOLT:RANG {}", range.name)).await?;
            config.set(&range_key(channel), range.name)
        }
        .await;
        access.finish(result).await
    }

    /// Switch the outputs on or off
    pub async fn enable_output(&self, enabled: bool) -> Result<()> {
        let mut access = self.access("enable_output").await?;
        let result = async {
            let (_, session, config) = access.parts()?;
            session.write(&format!("OUTP {}", on_off(enabled))).await?;
            config.set("output_enabled", enabled)
        }
        .await;
        access.finish(result).await
    }

    /// Programmed state of every output
    pub async fn get_output_status(&self) -> Result<OutputStatus> {
        let mut access = self.access("get_output_status").await?;
        let result = {
            let (driver, _, config) = access.parts()?;
            let model = driver.model();
            let output_enabled = config
                .get("output_enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (1..=model.channels())
                .map(|channel| channel_status(config, channel))
                .collect::<Result<Vec<_>>>()
                .map(|channels| OutputStatus {
                    output_enabled,
                    num_channels: model.channels(),
                    channels,
                })
        };
        access.finish(result).await
    }

    /// Turn every output off immediately, whatever the status
    pub async fn emergency_stop(&self) -> Result<()> {
        let mut access = self.access_session("emergency_stop").await?;
        warn!("Emergency stop on '{}'", self.name());
        let result = async {
            let (_, session, config) = access.parts()?;
            session.write("OUTP OFF").await?;
            config.set("output_enabled", false)
        }
        .await;
        access.finish(result).await
    }
}
