/*!
 * Serial line contract and a small line-oriented command helper.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::error::{TransportError, TransportResult};

/// A byte-oriented serial line
#[async_trait]
pub trait SerialLine: Send + Debug {
    /// Open `port` at `baud_rate`; `timeout` bounds individual reads
    async fn open(&mut self, port: &str, baud_rate: u32, timeout: Duration) -> TransportResult<()>;

    /// Close the line; closing an already closed line is not an error
    async fn close(&mut self) -> TransportResult<()>;

    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Read one line, or `None` when nothing arrived within `timeout`
    async fn read(&mut self, timeout: Duration) -> TransportResult<Option<Bytes>>;
}

/// Terminator appended to every command line
pub const LINE_ENDING: &str = "\r\n";

/// Send one ASCII command line and wait for the reply line.
///
/// No reply within `timeout` is a [`TransportError::Timeout`].
pub async fn transact(line: &mut dyn SerialLine, command: &str, timeout: Duration) -> TransportResult<String> {
    send(line, command).await?;

    match line.read(timeout).await? {
        Some(reply) => {
            let reply = String::from_utf8_lossy(&reply).trim().to_string();
            trace!("{} -> {}", command, reply);
            Ok(reply)
        }
        None => Err(TransportError::Timeout(format!("no reply to '{}'", command))),
    }
}

/// Send one ASCII command line without waiting for a reply
pub async fn send(line: &mut dyn SerialLine, command: &str) -> TransportResult<()> {
    let mut data = Vec::with_capacity(command.len() + LINE_ENDING.len());
    data.extend_from_slice(command.as_bytes());
    data.extend_from_slice(LINE_ENDING.as_bytes());
    line.write(&data).await
}
