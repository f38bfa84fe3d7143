/*!
 * Machine-vision camera behind an imaging SDK.
 *
 * A measurement is one frame. Outside continuous measurement the driver
 * starts acquisition for the single grab and stops it again; while measuring
 * acquisition stays on for the lifetime of the worker.
 */
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use labkit_core::types::{ConfigMap, Value};

use crate::config_store::{to_config_map, CommonSettings, ConfigStore};
use crate::equipment::{Driver, Identification, Instrument, IoType, Reading};
use crate::error::{EquipmentError, Result, TransportError};
use crate::transport::{Frame, ImagingSession, TransportProvider};

/// How long one grab waits for a frame
pub const GRAB_TIMEOUT: Duration = Duration::from_secs(1);

/// How frames are triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// The driver fires a software trigger for every grab
    Software,
    /// Frames are triggered on an input line
    Hardware,
    /// Free-running at `frame_rate`
    Off,
}

impl TriggerMode {
    /// Config spelling of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Software => "software",
            TriggerMode::Hardware => "hardware",
            TriggerMode::Off => "off",
        }
    }
}

/// Acquisition mode of the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Stream until stopped
    Continuous,
    /// One frame per acquisition
    SingleFrame,
}

/// Configuration of a camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Settings every family shares
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Exposure in microseconds
    pub exposure_time: f64,
    /// Gain in dB
    pub gain: f64,
    /// Frame rate when not hardware-triggered
    pub frame_rate: f64,
    /// Pixel format name
    pub pixel_format: String,
    /// Image width in pixels
    pub image_width: i64,
    /// Image height in pixels
    pub image_height: i64,
    /// Acquisition mode
    pub acquisition_mode: AcquisitionMode,
    /// Stream buffer handling
    pub buffer_handling_mode: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            trigger_mode: TriggerMode::Software,
            exposure_time: 10000.0,
            gain: 0.0,
            frame_rate: 30.0,
            pixel_format: "Mono8".to_string(),
            image_width: 1920,
            image_height: 1080,
            acquisition_mode: AcquisitionMode::Continuous,
            buffer_handling_mode: "newest_only".to_string(),
        }
    }
}

impl CameraSettings {
    fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if !self.exposure_time.is_finite() || self.exposure_time <= 0.0 {
            return Err(EquipmentError::validation("exposure_time must be positive"));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(EquipmentError::validation("frame_rate must be positive"));
        }
        if self.image_width < 1 || self.image_height < 1 {
            return Err(EquipmentError::validation(format!(
                "image size {}x{} is empty",
                self.image_width, self.image_height
            )));
        }
        if self.pixel_format.trim().is_empty() {
            return Err(EquipmentError::validation("pixel_format must not be empty"));
        }
        Ok(())
    }
}

/// SDK name of a snake_case setting value (`newest_only` -> `NewestOnly`)
fn node_name(value: &str) -> String {
    value
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// An open SDK session plus the acquisition flag
#[derive(Debug)]
pub struct CameraSession {
    sdk: Box<dyn ImagingSession>,
    acquiring: bool,
}

impl CameraSession {
    async fn begin(&mut self) -> Result<()> {
        if !self.acquiring {
            self.sdk.begin_acquisition().await?;
            self.acquiring = true;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        if self.acquiring {
            self.acquiring = false;
            self.sdk.end_acquisition().await?;
        }
        Ok(())
    }

    /// Trigger if needed and wait for one complete frame
    async fn grab(&mut self, settings: &CameraSettings) -> Result<Frame> {
        let single = !self.acquiring;
        self.begin().await?;

        let grabbed = async {
            if settings.trigger_mode == TriggerMode::Software {
                self.sdk.trigger().await?;
            }
            self.sdk.get_next_image(GRAB_TIMEOUT).await
        }
        .await;

        if single {
            self.end().await?;
        }
        grabbed.map_err(|e| match e {
            TransportError::Incomplete(detail) => EquipmentError::measurement(format!("image incomplete: {}", detail)),
            other => other.into(),
        })
    }
}

/// Driver for SDK cameras
#[derive(Debug, Clone)]
pub struct CameraDriver {
    camera_index: usize,
}

impl CameraDriver {
    /// A driver for the camera at enumeration `camera_index`
    pub fn new(camera_index: usize) -> Self {
        Self { camera_index }
    }

    /// The enumeration index
    pub fn camera_index(&self) -> usize {
        self.camera_index
    }

    fn summary(frame: &Frame) -> Value {
        let mut fields = ConfigMap::new();
        fields.insert("width".to_string(), Value::from(frame.width));
        fields.insert("height".to_string(), Value::from(frame.height));
        fields.insert("pixel_format".to_string(), Value::from(frame.pixel_format.as_str()));
        fields.insert("frame_id".to_string(), Value::Integer(frame.frame_id as i64));
        fields.insert("size_bytes".to_string(), Value::from(frame.data.len()));
        fields.insert("mean_intensity".to_string(), Value::Float(frame.mean_intensity()));
        Value::Object(fields)
    }

    fn reading(frame: &Frame, settings: &CameraSettings) -> Reading {
        Reading::new(Self::summary(frame), "pixels")
            .with_metadata("capture_mode", settings.trigger_mode.as_str())
            .with_metadata("exposure_time", settings.exposure_time)
    }
}

/// A machine-vision camera
pub type Camera = Instrument<CameraDriver>;

#[async_trait]
impl Driver for CameraDriver {
    type Session = CameraSession;

    fn type_name(&self) -> &'static str {
        "camera"
    }

    fn io_type(&self) -> IoType {
        IoType::Usb
    }

    fn default_config(&self) -> Result<ConfigMap> {
        to_config_map(&CameraSettings::default())
    }

    fn validate(&self, config: &ConfigStore) -> Result<()> {
        config.settings::<CameraSettings>()?.validate()
    }

    async fn open(
        &mut self,
        transports: &dyn TransportProvider,
        _config: &ConfigStore,
    ) -> Result<(Self::Session, Identification)> {
        let mut sdk = transports.open_imaging().await?;

        let found = sdk.enumerate_devices().await?.len();
        if self.camera_index >= found {
            let _ = sdk.deinit().await;
            return Err(EquipmentError::connection(format!(
                "no camera at index {} ({} found)",
                self.camera_index, found
            )));
        }

        let info = sdk.init(self.camera_index).await?;
        info!(
            "Camera {} is {} {} (s/n {})",
            self.camera_index, info.vendor, info.model, info.serial_number
        );
        let identification = Identification {
            manufacturer: info.vendor,
            model: info.model,
            serial_number: info.serial_number,
            firmware: info.firmware,
        };
        Ok((CameraSession { sdk, acquiring: false }, identification))
    }

    async fn apply(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<()> {
        let settings: CameraSettings = config.settings()?;
        settings.validate()?;
        let sdk = session.sdk.as_mut();

        sdk.set_node("ExposureTime", &Value::Float(settings.exposure_time)).await?;
        sdk.set_node("Gain", &Value::Float(settings.gain)).await?;
        if settings.trigger_mode != TriggerMode::Hardware {
            sdk.set_node("AcquisitionFrameRateEnable", &Value::Bool(true)).await?;
            sdk.set_node("AcquisitionFrameRate", &Value::Float(settings.frame_rate)).await?;
        }
        // image geometry and acquisition mode are locked while streaming
        if session.acquiring {
            debug!("Camera {} is acquiring; keeping image format", self.camera_index);
        } else {
            sdk.set_node("PixelFormat", &Value::from(settings.pixel_format.as_str())).await?;
            sdk.set_node("Width", &Value::Integer(settings.image_width)).await?;
            sdk.set_node("Height", &Value::Integer(settings.image_height)).await?;

            let acquisition = match settings.acquisition_mode {
                AcquisitionMode::Continuous => "Continuous",
                AcquisitionMode::SingleFrame => "SingleFrame",
            };
            sdk.set_node("AcquisitionMode", &Value::from(acquisition)).await?;
        }
        sdk.set_node(
            "StreamBufferHandlingMode",
            &Value::from(node_name(&settings.buffer_handling_mode)),
        )
        .await?;

        match settings.trigger_mode {
            TriggerMode::Off => sdk.set_node("TriggerMode", &Value::from("Off")).await?,
            TriggerMode::Software | TriggerMode::Hardware => {
                sdk.set_node("TriggerMode", &Value::from("Off")).await?;
                let source = if settings.trigger_mode == TriggerMode::Software {
                    "Software"
                } else {
                    "Line0"
                };
                sdk.set_node("TriggerSource", &Value::from(source)).await?;
                sdk.set_node("TriggerMode", &Value::from("On")).await?;
            }
        }

        debug!(
            "Camera {} configured: {}x{} {} at {} us",
            self.camera_index,
            settings.image_width,
            settings.image_height,
            settings.pixel_format,
            settings.exposure_time
        );
        Ok(())
    }

    async fn safe_shutdown(&mut self, session: &mut Self::Session, _config: &mut ConfigStore) -> Result<()> {
        session.end().await
    }

    async fn reset(&mut self, session: &mut Self::Session) -> Result<()> {
        session.end().await
    }

    async fn self_test(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<bool> {
        let settings: CameraSettings = config.settings()?;
        match session.grab(&settings).await {
            Ok(frame) => Ok(!frame.data.is_empty()),
            Err(EquipmentError::Measurement(detail)) => {
                debug!("Camera {} self-test grab failed: {}", self.camera_index, detail);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn measure(&mut self, session: &mut Self::Session, config: &ConfigStore) -> Result<Reading> {
        let settings: CameraSettings = config.settings()?;
        let frame = session.grab(&settings).await?;
        Ok(Self::reading(&frame, &settings))
    }

    async fn begin_streaming(&mut self, session: &mut Self::Session, _config: &ConfigStore) -> Result<()> {
        session.begin().await
    }

    async fn end_streaming(&mut self, session: &mut Self::Session) -> Result<()> {
        session.end().await
    }

    async fn close(&mut self, mut session: Self::Session) -> Result<()> {
        session.end().await?;
        session.sdk.deinit().await?;
        Ok(())
    }
}

impl Instrument<CameraDriver> {
    /// Grab one frame, log its summary and optionally write the raw pixels to
    /// `path`
    pub async fn capture_image(&self, path: Option<&Path>) -> Result<Frame> {
        let mut access = self.access("capture_image").await?;
        let result = async {
            let (_, session, config) = access.parts()?;
            let settings: CameraSettings = config.settings()?;
            let frame = session.grab(&settings).await?;
            let reading = CameraDriver::reading(&frame, &settings);
            Ok((frame, reading))
        }
        .await;

        let (frame, mut reading) = access.finish(result).await?;
        if let Some(path) = path {
            if let Err(e) = tokio::fs::write(path, &frame.data).await {
                return access.finish(Err(EquipmentError::export(format!(
                    "writing {}: {}",
                    path.display(),
                    e
                ))))
                .await;
            }
            reading = reading.with_metadata("saved_filename", path.display().to_string());
        }
        access.record(reading).await;
        Ok(frame)
    }
}
