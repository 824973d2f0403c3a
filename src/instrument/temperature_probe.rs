//! Cell temperature probe driver
//!
//! Polled like the hygrometer: a short command followed by CR, answered by a line
//! holding a single signed decimal in °C (`23.45`, `+023.45`, `T = 23.45 C`).

use super::handle::query_line;
use super::{DeviceHandle, DeviceState, Driver, Quantity, Sample};
use crate::adapters::{LineBuffer, SharedPort};
use crate::config::TemperatureProbeConfig;
use crate::error::{DaqError, DriverResult};
use crate::protocol::parse_probe_line;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Cell temperature probe answering a poll command with one number
pub struct TemperatureProbe {
    handle: DeviceHandle,
    lines: LineBuffer,
    command: Vec<u8>,
    poll_window: Duration,
    settle: Duration,
}

impl TemperatureProbe {
    /// Probe `id` on `port` polled with `T`
    pub fn new(id: impl Into<String>, port: SharedPort) -> Self {
        Self {
            handle: DeviceHandle::new(id, port),
            lines: LineBuffer::new(),
            command: b"T\r".to_vec(),
            poll_window: Duration::from_secs(1),
            settle: Duration::from_secs(1),
        }
    }

    /// Probe with command, poll window and settle delay from config
    pub fn from_config(
        id: impl Into<String>,
        config: &TemperatureProbeConfig,
        port: SharedPort,
    ) -> Self {
        Self::new(id, port)
            .with_poll_command(&config.poll_command)
            .with_poll_window(config.poll_window)
            .with_settle(config.settle)
    }

    /// Command sent for each reading; CR is appended
    pub fn with_poll_command(mut self, command: &str) -> Self {
        self.command = format!("{command}\r").into_bytes();
        self
    }

    /// How long a poll waits for a matching line
    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = window;
        self
    }

    /// Delay after opening the port before clearing input
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Current temperature in °C.
    ///
    /// Fails with [`DaqError::NoMatch`] when no parsable reply arrives within the
    /// poll window.
    pub async fn temperature(&mut self) -> DriverResult<f64> {
        self.handle.ensure_connected()?;
        let port = self.handle.port().clone();
        let result = query_line(
            &port,
            &mut self.lines,
            &self.command,
            self.poll_window,
            parse_probe_line,
        )
        .await;
        self.handle
            .observe(result)?
            .ok_or(DaqError::NoMatch(self.poll_window))
    }
}

#[async_trait]
impl Driver for TemperatureProbe {
    fn id(&self) -> &str {
        self.handle.id()
    }

    fn state(&self) -> DeviceState {
        self.handle.state()
    }

    async fn connect(&mut self) -> DriverResult<()> {
        info!(device = %self.handle.id(), port = %self.handle.port().name(), "Connecting temperature probe");
        self.handle.connect(self.settle).await?;
        self.lines.clear();
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.handle.disconnect().await
    }

    async fn read_sample(&mut self) -> DriverResult<Vec<Sample>> {
        let value = self.temperature().await?;
        Ok(vec![Sample::new(Quantity::Temperature, value)])
    }
}
