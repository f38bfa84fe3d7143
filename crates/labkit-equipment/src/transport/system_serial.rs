/*!
 * Serial lines backed by the operating system through the `serialport` crate.
 *
 * `serialport` is blocking, so every read and write runs on Tokio's blocking
 * pool with the port behind an `Arc<Mutex<..>>`.
 */
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serialport::SerialPort;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};
use crate::transport::{ImagingSession, SerialLine, TransportProvider, VisaSession};

/// A serial line on a local port (e.g. `/dev/ttyUSB0`, `COM3`)
#[derive(Default)]
pub struct SystemSerialLine {
    port_name: Option<String>,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl std::fmt::Debug for SystemSerialLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSerialLine")
            .field("port_name", &self.port_name)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SystemSerialLine {
    /// Create an unopened line
    pub fn new() -> Self {
        Self::default()
    }

    fn port(&self) -> TransportResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(TransportError::Closed)
    }
}

fn join_error(e: tokio::task::JoinError) -> TransportError {
    TransportError::Io(format!("serial I/O task failed: {}", e))
}

#[async_trait]
impl SerialLine for SystemSerialLine {
    async fn open(&mut self, port: &str, baud_rate: u32, timeout: Duration) -> TransportResult<()> {
        let name = port.to_string();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .timeout(timeout)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .open()
        })
        .await
        .map_err(join_error)?
        .map_err(|e| TransportError::Unreachable(format!("{}: {}", port, e)))?;

        info!("Opened serial port {} at {} baud", port, baud_rate);
        self.port_name = Some(port.to_string());
        self.port = Some(Arc::new(Mutex::new(opened)));
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(name) = self.port_name.take() {
            debug!("Closing serial port {}", name);
        }
        self.port = None;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let port = self.port()?;
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            guard.write_all(&data)?;
            guard.flush()
        })
        .await
        .map_err(join_error)?
        .map_err(TransportError::from)
    }

    async fn read(&mut self, timeout: Duration) -> TransportResult<Option<Bytes>> {
        let port = self.port()?;

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let mut line = BytesMut::new();
            let mut byte = [0u8; 1];
            let start = Instant::now();

            while start.elapsed() < timeout {
                match guard.read(&mut byte) {
                    Ok(1) => {
                        line.extend_from_slice(&byte);
                        if byte[0] == b'\n' {
                            return Ok(Some(line.freeze()));
                        }
                    }
                    Ok(_) => return Err(TransportError::Io("unexpected end of stream".to_string())),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(TransportError::from(e)),
                }
            }

            if line.is_empty() {
                Ok(None)
            } else {
                Ok(Some(line.freeze()))
            }
        })
        .await
        .map_err(join_error)?
    }
}

/// Provider for real hardware: serial lines go to local ports.
///
/// No VISA library or imaging SDK is linked, so those sessions report the
/// backend as unreachable.
#[derive(Debug, Default, Clone)]
pub struct SystemTransports;

#[async_trait]
impl TransportProvider for SystemTransports {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn open_visa(&self, address: &str, _timeout: Duration) -> TransportResult<Box<dyn VisaSession>> {
        Err(TransportError::Unreachable(format!("no VISA backend for {}", address)))
    }

    fn serial_line(&self) -> Box<dyn SerialLine> {
        Box::new(SystemSerialLine::new())
    }

    async fn open_imaging(&self) -> TransportResult<Box<dyn ImagingSession>> {
        Err(TransportError::Unreachable("no imaging SDK available".to_string()))
    }
}
