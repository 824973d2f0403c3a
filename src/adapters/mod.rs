//! Hardware adapter implementations
//!
//! This module contains the [`Adapter`] trait, the low-level byte-stream
//! abstraction every instrument driver talks through, and its implementations:
//!
//! - [`SerialAdapter`]: RS-232/RS-485 via `tokio-serial`
//! - [`MockAdapter`]: scripted in-memory device for tests and dry runs
//!
//! Drivers never hold an adapter directly. They hold a [`SharedPort`], which lets
//! two flow controllers on one multi-drop bus share a single physical port.

pub mod mock;
pub mod serial_adapter;
pub mod shared_port;

pub use mock::{line_responder, MockAdapter, MockHandle, ModbusBusSim};
pub use serial_adapter::{available_ports, SerialAdapter};
pub use shared_port::{PortGuard, SharedPort};

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Byte-stream endpoint bound to one physical port.
#[async_trait]
pub trait Adapter: Send {
    /// Port identifier (e.g. "/dev/ttyUSB0")
    fn name(&self) -> &str;

    /// Configured read timeout for a single transaction
    fn timeout(&self) -> Duration;

    /// Whether the port is currently open
    fn is_open(&self) -> bool;

    /// Open the port with its configured line settings
    async fn open(&mut self) -> AppResult<()>;

    /// Close the port. Closing a closed port is a no-op.
    async fn close(&mut self) -> AppResult<()>;

    /// Write all bytes and flush
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read whatever is available, waiting at most `wait`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    async fn read(&mut self, buffer: &mut [u8], wait: Duration) -> AppResult<usize>;

    /// Discard any unread input
    async fn clear_input(&mut self) -> AppResult<()>;
}

/// Fill `buffer` completely or fail with [`DaqError::Timeout`] once `deadline`
/// passes.
pub async fn read_exact(
    port: &mut dyn Adapter,
    buffer: &mut [u8],
    deadline: Instant,
) -> AppResult<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DaqError::Timeout(port.timeout()));
        }
        filled += port.read(&mut buffer[filled..], remaining).await?;
    }
    Ok(())
}

/// Accumulates bytes from an adapter and hands them out as trimmed text lines.
///
/// Lines end at CR or LF; empty lines are skipped. Bytes after the last
/// terminator are kept for the next call.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially received line
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Read the next non-empty line, or `None` if `deadline` passes first.
    pub async fn read_line(
        &mut self,
        port: &mut dyn Adapter,
        deadline: Instant,
    ) -> AppResult<Option<String>> {
        let mut chunk = [0u8; 128];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let n = port.read(&mut chunk, remaining.min(port.timeout())).await?;
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.pending.iter().position(|&b| b == b'\r' || b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}
