/*!
 * Imaging-SDK session contract.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use labkit_core::types::Value;

use crate::error::TransportResult;

/// A camera discovered by an imaging session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Vendor name
    pub vendor: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware version
    pub firmware: String,
}

/// One acquired image
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number assigned by the camera
    pub frame_id: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format name (e.g. `Mono8`)
    pub pixel_format: String,
    /// Raw pixel data
    pub data: Bytes,
}

impl Frame {
    /// Mean of the raw bytes
    pub fn mean_intensity(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|b| u64::from(*b)).sum();
        sum as f64 / self.data.len() as f64
    }
}

/// An imaging-SDK session.
///
/// The session owns the SDK system handle and at most one initialised camera;
/// both are released when the session is dropped after `deinit()`.
#[async_trait]
pub trait ImagingSession: Send + Debug {
    /// List the cameras visible to the SDK
    async fn enumerate_devices(&mut self) -> TransportResult<Vec<CameraInfo>>;

    /// Initialise the camera at `index`
    async fn init(&mut self, index: usize) -> TransportResult<CameraInfo>;

    /// Release the initialised camera
    async fn deinit(&mut self) -> TransportResult<()>;

    /// Write a camera node (exposure, gain, pixel format, ...)
    async fn set_node(&mut self, node: &str, value: &Value) -> TransportResult<()>;

    /// Fire a software trigger
    async fn trigger(&mut self) -> TransportResult<()>;

    /// Start streaming frames
    async fn begin_acquisition(&mut self) -> TransportResult<()>;

    /// Stop streaming frames
    async fn end_acquisition(&mut self) -> TransportResult<()>;

    /// Wait for the next frame.
    ///
    /// A partially transferred frame is reported as
    /// [`TransportError::Incomplete`](crate::error::TransportError::Incomplete).
    async fn get_next_image(&mut self, timeout: Duration) -> TransportResult<Frame>;
}
