/*!
 * KTA-223 relay controller on a serial line.
 *
 * The board speaks a line protocol terminated by `\r\n`:
 * `setrelaystate <n> connect_normal_open|connect_normal_closed` answers
 * `OK`, `getrelaystate <n>` answers the state word, `readvoltage <ch>`
 * answers raw ADC counts and `getversion` the firmware string.
 */
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use labkit_core::types::{ConfigMap, Value};

use crate::config_store::{to_config_map, CommonSettings, ConfigStore};
use crate::equipment::{Driver, Identification, Instrument, IoType, Reading};
use crate::error::{EquipmentError, Result, TransportError};
use crate::transport::serial::transact;
use crate::transport::{SerialLine, TransportProvider};

/// Default baud rate of the board
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Volts per ADC count of the analog inputs
pub const VOLTS_PER_COUNT: f64 = 0.0048875;

/// Number of analog input channels
pub const VOLTAGE_CHANNELS: usize = 4;

const RELAY_ON: &str = "connect_normal_open";
const RELAY_OFF: &str = "connect_normal_closed";

/// Configuration of a relay board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Settings every family shares
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Number of relays on the board
    pub num_relays: i64,
    /// Commanded relay states (`true` = energised)
    pub relay_states: Vec<bool>,
    /// Include analog inputs in measurements
    pub voltage_monitoring: bool,
    /// Wait for the board's acknowledgement after every command
    pub auto_response: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            num_relays: 8,
            relay_states: vec![false; 8],
            voltage_monitoring: true,
            auto_response: true,
        }
    }
}

impl RelaySettings {
    fn relay_count(&self) -> usize {
        usize::try_from(self.num_relays).unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if self.num_relays < 1 {
            return Err(EquipmentError::validation("num_relays must be at least 1"));
        }
        if self.relay_states.len() != self.relay_count() {
            return Err(EquipmentError::validation(format!(
                "relay_states has {} entries for {} relays",
                self.relay_states.len(),
                self.num_relays
            )));
        }
        Ok(())
    }

    fn check_relay(&self, relay: usize) -> Result<()> {
        if relay == 0 || relay > self.relay_count() {
            return Err(EquipmentError::validation(format!(
                "relay {} does not exist (1..={})",
                relay, self.num_relays
            )));
        }
        Ok(())
    }
}

/// Driver for KTA-223 relay boards
#[derive(Debug, Clone)]
pub struct RelayDriver {
    com_port: String,
    baud_rate: u32,
    labels: Vec<String>,
}

impl RelayDriver {
    /// A driver for the board on `com_port`
    pub fn new(com_port: impl Into<String>, baud_rate: u32) -> Self {
        let labels = (1..=RelaySettings::default().relay_count())
            .map(|i| format!("Relay_{}", i))
            .collect();
        Self {
            com_port: com_port.into(),
            baud_rate,
            labels,
        }
    }

    /// The serial port name
    pub fn com_port(&self) -> &str {
        &self.com_port
    }

    /// The configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    async fn set_relay(line: &mut dyn SerialLine, settings: &RelaySettings, relay: usize, on: bool) -> Result<()> {
        let command = format!("setrelaystate {} {}", relay, if on { RELAY_ON } else { RELAY_OFF });
        if !settings.auto_response {
            crate::transport::serial::send(line, &command).await?;
            return Ok(());
        }

        let response = transact(line, &command, settings.common.timeout()).await?;
        if response.contains("OK") {
            Ok(())
        } else {
            Err(TransportError::Protocol(format!("relay {} not switched: '{}'", relay, response)).into())
        }
    }

    async fn query_relay(line: &mut dyn SerialLine, timeout: Duration, relay: usize) -> Result<bool> {
        let response = transact(line, &format!("getrelaystate {}", relay), timeout).await?;
        if response.contains(RELAY_ON) {
            Ok(true)
        } else if response.contains(RELAY_OFF) {
            Ok(false)
        } else {
            Err(TransportError::Protocol(format!("relay {} state unreadable: '{}'", relay, response)).into())
        }
    }

    async fn query_voltage(line: &mut dyn SerialLine, timeout: Duration, channel: usize) -> Result<f64> {
        let response = transact(line, &format!("readvoltage {}", channel), timeout).await?;
        let counts = response.trim().parse::<u32>().map_err(|_| {
            TransportError::Protocol(format!("channel {} answered '{}'", channel, response.trim()))
        })?;
        Ok(f64::from(counts) * VOLTS_PER_COUNT)
    }

    async fn all_off(line: &mut dyn SerialLine, settings: &RelaySettings) -> Result<()> {
        for relay in 1..=settings.relay_count() {
            Self::set_relay(line, settings, relay, false).await?;
        }
        Ok(())
    }
}

/// A serial relay controller
pub type KtaRelay = Instrument<RelayDriver>;

#[async_trait]
impl Driver for RelayDriver {
    type Session = Box<dyn SerialLine>;

    fn type_name(&self) -> &'static str {
        "kta_relay"
    }

    fn io_type(&self) -> IoType {
        IoType::Serial
    }

    fn default_config(&self) -> Result<ConfigMap> {
        to_config_map(&RelaySettings::default())
    }

    fn validate(&self, config: &ConfigStore) -> Result<()> {
        config.settings::<RelaySettings>()?.validate()
    }

    async fn open(
        &mut self,
        transports: &dyn TransportProvider,
        config: &ConfigStore,
    ) -> Result<(Self::Session, Identification)> {
        let timeout = config.settings::<CommonSettings>()?.timeout();
        let mut line = transports.serial_line();
        line.open(&self.com_port, self.baud_rate, timeout).await?;

        match transact(line.as_mut(), "getversion", timeout).await {
            Ok(version) => {
                info!("KTA controller on {} reports '{}'", self.com_port, version);
                let identification = Identification {
                    manufacturer: "KTA".to_string(),
                    model: "223".to_string(),
                    serial_number: "Unknown".to_string(),
                    firmware: if version.is_empty() { "Unknown".to_string() } else { version },
                };
                Ok((line, identification))
            }
            Err(e) => {
                let _ = line.close().await;
                Err(EquipmentError::connection(format!(
                    "no answer from controller on {}: {}",
                    self.com_port, e
                )))
            }
        }
    }

    async fn apply(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<()> {
        let settings: RelaySettings = config.settings()?;
        settings.validate()?;
        for (index, on) in settings.relay_states.iter().enumerate() {
            Self::set_relay(session.as_mut(), &settings, index + 1, *on).await?;
        }
        Ok(())
    }

    async fn safe_shutdown(&mut self, session: &mut Self::Session, config: &mut ConfigStore) -> Result<()> {
        let settings: RelaySettings = config.settings()?;
        Self::all_off(session.as_mut(), &settings).await?;
        config.set("relay_states", vec![false; settings.relay_count()])?;
        Ok(())
    }

    async fn reset(&mut self, _session: &mut Self::Session) -> Result<()> {
        // No reset command; the instrument opens every relay before this.
        Ok(())
    }

    async fn self_test(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<bool> {
        let settings: RelaySettings = config.settings()?;
        let timeout = settings.common.timeout();
        let line = session.as_mut();

        if transact(line, "getversion", timeout).await.is_err() {
            return Ok(false);
        }

        let mut passed = true;
        for relay in 1..=settings.relay_count() {
            Self::set_relay(line, &settings, relay, true).await?;
            if !Self::query_relay(line, timeout, relay).await? {
                debug!("Relay {} on {} did not close", relay, self.com_port);
                passed = false;
            }
            Self::set_relay(line, &settings, relay, false).await?;
        }

        for (index, on) in settings.relay_states.iter().enumerate() {
            Self::set_relay(line, &settings, index + 1, *on).await?;
        }
        Ok(passed)
    }

    async fn measure(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<Reading> {
        let settings: RelaySettings = config.settings()?;
        let timeout = settings.common.timeout();
        let line = session.as_mut();

        let mut states = Vec::with_capacity(settings.relay_count());
        for relay in 1..=settings.relay_count() {
            states.push(Self::query_relay(line, timeout, relay).await?);
        }

        let mut value = ConfigMap::new();
        value.insert("relay_states".to_string(), Value::from(states));
        if settings.voltage_monitoring {
            let mut voltages = Vec::with_capacity(VOLTAGE_CHANNELS);
            for channel in 0..VOLTAGE_CHANNELS {
                voltages.push(Self::query_voltage(line, timeout, channel).await?);
            }
            value.insert("voltages".to_string(), Value::from(voltages));
        } else {
            value.insert("voltages".to_string(), Value::Null);
        }

        Ok(Reading::new(Value::Object(value), "bool/V").with_metadata("num_relays", settings.num_relays))
    }

    async fn close(&mut self, mut session: Self::Session) -> Result<()> {
        session.close().await?;
        Ok(())
    }
}

impl Instrument<RelayDriver> {
    /// Energise (`true`) or release one relay, numbered from 1
    pub async fn set_relay_state(&self, relay: usize, on: bool) -> Result<()> {
        let mut access = self.access("set_relay_state").await?;
        let result = async {
            let (_, line, config) = access.parts()?;
            let settings: RelaySettings = config.settings()?;
            settings.check_relay(relay)?;

            RelayDriver::set_relay(line.as_mut(), &settings, relay, on).await?;
            let mut states = settings.relay_states;
            states[relay - 1] = on;
            config.set("relay_states", states)
        }
        .await;
        access.finish(result).await
    }

    /// Read one relay's state from the board
    pub async fn get_relay_state(&self, relay: usize) -> Result<bool> {
        let mut access = self.access("get_relay_state").await?;
        let result = async {
            let (_, line, config) = access.parts()?;
            let settings: RelaySettings = config.settings()?;
            settings.check_relay(relay)?;
            RelayDriver::query_relay(line.as_mut(), settings.common.timeout(), relay).await
        }
        .await;
        access.finish(result).await
    }

    /// Read every relay's state from the board
    pub async fn get_all_relay_states(&self) -> Result<Vec<bool>> {
        let mut access = self.access("get_all_relay_states").await?;
        let result = async {
            let (_, line, config) = access.parts()?;
            let settings: RelaySettings = config.settings()?;
            let mut states = Vec::with_capacity(settings.relay_count());
            for relay in 1..=settings.relay_count() {
                states.push(RelayDriver::query_relay(line.as_mut(), settings.common.timeout(), relay).await?);
            }
            Ok(states)
        }
        .await;
        access.finish(result).await
    }

    /// Read one analog input (0-based) in volts
    pub async fn read_voltage(&self, channel: usize) -> Result<f64> {
        let mut access = self.access("read_voltage").await?;
        let result = async {
            if channel >= VOLTAGE_CHANNELS {
                return Err(EquipmentError::validation(format!(
                    "voltage channel {} does not exist (0..{})",
                    channel, VOLTAGE_CHANNELS
                )));
            }
            let (_, line, config) = access.parts()?;
            let timeout = config.settings::<CommonSettings>()?.timeout();
            RelayDriver::query_voltage(line.as_mut(), timeout, channel).await
        }
        .await;
        access.finish(result).await
    }

    /// Name the relays; ignored unless there is exactly one label per relay
    pub async fn set_relay_labels(&self, labels: Vec<String>) -> bool {
        self.with_driver(|driver, config| {
            let count = config
                .settings::<RelaySettings>()
                .map(|s| s.relay_count())
                .unwrap_or(0);
            if labels.len() == count {
                driver.labels = labels;
                true
            } else {
                false
            }
        })
        .await
    }

    /// The relay labels
    pub async fn relay_labels(&self) -> Vec<String> {
        self.with_driver(|driver, _| driver.labels.clone()).await
    }
}
