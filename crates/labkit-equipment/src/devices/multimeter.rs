/*!
 * Agilent/Keysight digital multimeter over VISA.
 */
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use labkit_core::types::{ConfigMap, Value};

use crate::config_store::{to_config_map, CommonSettings, ConfigStore};
use crate::equipment::{Driver, Equipment, Identification, Instrument, IoType, Reading};
use crate::error::{EquipmentError, Result};
use crate::transport::visa::{on_off, parse_identification, query_f64};
use crate::transport::{TransportProvider, VisaSession};

/// What the meter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementFunction {
    /// DC voltage
    VoltageDc,
    /// AC voltage
    VoltageAc,
    /// DC current
    CurrentDc,
    /// AC current
    CurrentAc,
    /// Two-wire resistance
    Resistance,
    /// Four-wire resistance
    Fresistance,
    /// Capacitance
    Capacitance,
    /// Continuity
    Continuity,
    /// Diode forward voltage
    Diode,
    /// Frequency
    Frequency,
    /// Period
    Period,
    /// Temperature
    Temperature,
}

impl MeasurementFunction {
    /// Every supported function
    pub const ALL: [MeasurementFunction; 12] = [
        MeasurementFunction::VoltageDc,
        MeasurementFunction::VoltageAc,
        MeasurementFunction::CurrentDc,
        MeasurementFunction::CurrentAc,
        MeasurementFunction::Resistance,
        MeasurementFunction::Fresistance,
        MeasurementFunction::Capacitance,
        MeasurementFunction::Continuity,
        MeasurementFunction::Diode,
        MeasurementFunction::Frequency,
        MeasurementFunction::Period,
        MeasurementFunction::Temperature,
    ];

    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementFunction::VoltageDc => "voltage_dc",
            MeasurementFunction::VoltageAc => "voltage_ac",
            MeasurementFunction::CurrentDc => "current_dc",
            MeasurementFunction::CurrentAc => "current_ac",
            MeasurementFunction::Resistance => "resistance",
            MeasurementFunction::Fresistance => "fresistance",
            MeasurementFunction::Capacitance => "capacitance",
            MeasurementFunction::Continuity => "continuity",
            MeasurementFunction::Diode => "diode",
            MeasurementFunction::Frequency => "frequency",
            MeasurementFunction::Period => "period",
            MeasurementFunction::Temperature => "temperature",
        }
    }

    /// SCPI subsystem name
    pub fn scpi(&self) -> &'static str {
        match self {
            MeasurementFunction::VoltageDc => "VOLT:DC",
            MeasurementFunction::VoltageAc => "VOLT:AC",
            MeasurementFunction::CurrentDc => "CURR:DC",
            MeasurementFunction::CurrentAc => "CURR:AC",
            MeasurementFunction::Resistance => "RES",
            MeasurementFunction::Fresistance => "FRES",
            MeasurementFunction::Capacitance => "CAP",
            MeasurementFunction::Continuity => "CONT",
            MeasurementFunction::Diode => "DIOD",
            MeasurementFunction::Frequency => "FREQ",
            MeasurementFunction::Period => "PER",
            MeasurementFunction::Temperature => "TEMP",
        }
    }

    /// Units of a reading
    pub fn units(&self) -> &'static str {
        match self {
            MeasurementFunction::VoltageDc | MeasurementFunction::VoltageAc | MeasurementFunction::Diode => "V",
            MeasurementFunction::CurrentDc | MeasurementFunction::CurrentAc => "A",
            MeasurementFunction::Resistance | MeasurementFunction::Fresistance | MeasurementFunction::Continuity => {
                "Ω"
            }
            MeasurementFunction::Capacitance => "F",
            MeasurementFunction::Frequency => "Hz",
            MeasurementFunction::Period => "s",
            MeasurementFunction::Temperature => "°C",
        }
    }

    /// Whether the function accepts a range setting
    pub fn is_ranged(&self) -> bool {
        !matches!(
            self,
            MeasurementFunction::Continuity | MeasurementFunction::Diode | MeasurementFunction::Temperature
        )
    }

    /// Whether the function accepts an integration aperture
    pub fn has_aperture(&self) -> bool {
        matches!(
            self,
            MeasurementFunction::VoltageDc
                | MeasurementFunction::CurrentDc
                | MeasurementFunction::Resistance
                | MeasurementFunction::Fresistance
                | MeasurementFunction::Temperature
        )
    }
}

impl fmt::Display for MeasurementFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementFunction {
    type Err = EquipmentError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        MeasurementFunction::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| EquipmentError::validation(format!("unknown measurement function '{}'", s)))
    }
}

/// Trigger source of the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Trigger as soon as a reading is requested
    Immediate,
    /// Trigger on `*TRG`
    Bus,
    /// Trigger on the rear-panel input
    External,
}

impl TriggerSource {
    fn scpi(&self) -> &'static str {
        match self {
            TriggerSource::Immediate => "IMM",
            TriggerSource::Bus => "BUS",
            TriggerSource::External => "EXT",
        }
    }
}

/// Configuration of a multimeter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmmSettings {
    /// Settings every family shares
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Active function
    pub measurement_function: MeasurementFunction,
    /// Fixed range used when `auto_range` is off
    pub range: f64,
    /// Integration time in seconds
    pub aperture: f64,
    /// Trigger source
    pub trigger_source: TriggerSource,
    /// Readings per trigger
    pub sample_count: i64,
    /// Front-panel display on or off
    pub display_enabled: bool,
}

impl Default for DmmSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            measurement_function: MeasurementFunction::VoltageDc,
            range: 10.0,
            aperture: 0.02,
            trigger_source: TriggerSource::Immediate,
            sample_count: 1,
            display_enabled: true,
        }
    }
}

impl DmmSettings {
    fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if !self.range.is_finite() || self.range <= 0.0 {
            return Err(EquipmentError::validation(format!("range must be positive, got {}", self.range)));
        }
        if !self.aperture.is_finite() || self.aperture <= 0.0 {
            return Err(EquipmentError::validation(format!(
                "aperture must be positive, got {}",
                self.aperture
            )));
        }
        if self.sample_count < 1 {
            return Err(EquipmentError::validation("sample_count must be at least 1"));
        }
        Ok(())
    }
}

/// Driver for Agilent 344xx-style meters
#[derive(Debug, Clone)]
pub struct DmmDriver {
    visa_address: String,
}

impl DmmDriver {
    /// A driver for the meter at `visa_address`
    pub fn new(visa_address: impl Into<String>) -> Self {
        Self {
            visa_address: visa_address.into(),
        }
    }

    /// The VISA resource address
    pub fn visa_address(&self) -> &str {
        &self.visa_address
    }
}

/// A digital multimeter
pub type AgilentDmm = Instrument<DmmDriver>;

#[async_trait]
impl Driver for DmmDriver {
    type Session = Box<dyn VisaSession>;

    fn type_name(&self) -> &'static str {
        "agilent_dmm"
    }

    fn io_type(&self) -> IoType {
        IoType::Ethernet
    }

    fn default_config(&self) -> Result<ConfigMap> {
        to_config_map(&DmmSettings::default())
    }

    fn validate(&self, config: &ConfigStore) -> Result<()> {
        config.settings::<DmmSettings>()?.validate()
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
            Ok(identification) => Ok((session, identification)),
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
        let settings: DmmSettings = config.settings()?;
        let function = settings.measurement_function;
        let scpi = function.scpi();

        session.write(&format!("CONF:{}", scpi)).await?;
        if function.is_ranged() {
            if settings.common.auto_range {
                session.write(&format!("{}:RANG:AUTO ON", scpi)).await?;
            } else {
                session.write(&format!("{}:RANG {}", scpi, settings.range)).await?;
            }
        }
        if function.has_aperture() {
            session.write(&format!("{}:APER {}", scpi, settings.aperture)).await?;
        }
        session.write(&format!("TRIG:SOUR {}", settings.trigger_source.scpi())).await?;
        session.write(&format!("SAMP:COUN {}", settings.sample_count)).await?;
        session.write(&format!("DISP {}", on_off(settings.display_enabled))).await?;

        debug!("{} configured for {}", self.visa_address, function);
        Ok(())
    }

    async fn safe_shutdown(&mut self, session: &mut Self::Session, _config: &mut ConfigStore) -> Result<()> {
        session.write("ABOR").await?;
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
        let settings: DmmSettings = config.settings()?;
        let function = settings.measurement_function;
        let value = query_f64(session.as_mut(), "READ?").await?;

        let range = if settings.common.auto_range || !function.is_ranged() {
            Value::from("auto")
        } else {
            Value::from(settings.range)
        };
        Ok(Reading::new(value, function.units())
            .with_metadata("function", function.as_str())
            .with_metadata("range", range))
    }

    async fn close(&mut self, mut session: Self::Session) -> Result<()> {
        session.close().await?;
        Ok(())
    }
}

impl Instrument<DmmDriver> {
    /// Switch to `function` and take one reading
    pub async fn measure_function(&self, function: MeasurementFunction) -> Result<Value> {
        let mut partial = ConfigMap::new();
        partial.insert("measurement_function".to_string(), Value::from(function.as_str()));
        self.set_config(partial).await?;
        self.measure().await
    }

    /// The active measurement function
    pub async fn measurement_function(&self) -> Result<MeasurementFunction> {
        self.with_driver(|_, config| config.settings::<DmmSettings>().map(|s| s.measurement_function))
            .await
    }
}
