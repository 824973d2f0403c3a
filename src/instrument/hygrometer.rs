//! Chilled-mirror hygrometer driver
//!
//! The instrument talks plain ASCII over RS-232. A `P` command makes it print one
//! status line; it can also be told to print lines on its own at a fixed interval.
//! Lines that do not carry a complete dewpoint/ambient/humidity triple (banners,
//! balance messages, command echoes) are skipped.

use super::handle::query_line;
use super::{DeviceHandle, DeviceState, Driver, Quantity, Sample};
use crate::adapters::{LineBuffer, SharedPort};
use crate::config::HygrometerConfig;
use crate::error::{DaqError, DriverResult};
use crate::protocol::{parse_hygrometer_line, HygrometerSample};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const POLL_COMMAND: &[u8] = b"P\r";
const COMMAND_PAUSE: Duration = Duration::from_millis(500);
const ACK_WINDOW: Duration = Duration::from_secs(5);

/// Chilled-mirror hygrometer speaking the DewMaster line protocol
pub struct Hygrometer {
    handle: DeviceHandle,
    lines: LineBuffer,
    poll_window: Duration,
    settle: Duration,
}

impl Hygrometer {
    /// Hygrometer `id` on `port` with default poll window and settle delay
    pub fn new(id: impl Into<String>, port: SharedPort) -> Self {
        Self {
            handle: DeviceHandle::new(id, port),
            lines: LineBuffer::new(),
            poll_window: Duration::from_secs(1),
            settle: Duration::from_secs(1),
        }
    }

    /// Hygrometer with its poll window and settle delay from config
    pub fn from_config(id: impl Into<String>, config: &HygrometerConfig, port: SharedPort) -> Self {
        Self::new(id, port)
            .with_poll_window(config.poll_window)
            .with_settle(config.settle)
    }

    /// How long [`poll`](Self::poll) waits for a matching line
    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = window;
        self
    }

    /// Delay after opening the port before clearing input
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Request one status line.
    ///
    /// Returns the first complete sample received within the poll window, or
    /// `None` if only unrecognised lines (or nothing) arrived.
    pub async fn poll(&mut self) -> DriverResult<Option<HygrometerSample>> {
        self.handle.ensure_connected()?;
        let port = self.handle.port().clone();
        let result = query_line(
            &port,
            &mut self.lines,
            POLL_COMMAND,
            self.poll_window,
            parse_hygrometer_line,
        )
        .await;
        self.handle.observe(result)
    }

    /// Set the automatic output interval. Returns the acknowledgement lines the
    /// instrument printed.
    pub async fn set_output_interval(&mut self, seconds: u32) -> DriverResult<Vec<String>> {
        self.handle.ensure_connected()?;
        let port = self.handle.port().clone();
        let lines = &mut self.lines;
        let result = async {
            let mut guard = port.lock().await;
            let value = seconds.to_string();
            for (i, command) in ["P", "O", value.as_str()].into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(COMMAND_PAUSE).await;
                }
                guard.write(format!("{command}\r").as_bytes()).await?;
            }

            let deadline = Instant::now() + ACK_WINDOW;
            let mut acks = Vec::new();
            while let Some(line) = lines.read_line(&mut *guard, deadline).await? {
                acks.push(line);
            }
            Ok::<_, DaqError>(acks)
        }
        .await;
        let acks = self.handle.observe(result)?;
        info!(device = %self.handle.id(), seconds, ack = %acks.join(" | "), "Output interval set");
        Ok(acks)
    }

    /// Consume automatically emitted lines for `duration` without polling,
    /// passing each complete sample to `on_sample`. Returns the number of samples
    /// seen.
    pub async fn read_stream<F>(&mut self, duration: Duration, mut on_sample: F) -> DriverResult<usize>
    where
        F: FnMut(HygrometerSample) + Send,
    {
        self.handle.ensure_connected()?;
        let port = self.handle.port().clone();
        let lines = &mut self.lines;
        let result = async {
            let mut guard = port.lock().await;
            let deadline = Instant::now() + duration;
            let mut count = 0;
            while let Some(line) = lines.read_line(&mut *guard, deadline).await? {
                match parse_hygrometer_line(&line) {
                    Some(sample) => {
                        count += 1;
                        on_sample(sample);
                    }
                    None => debug!(line = %line, "Skipping non-data line"),
                }
            }
            Ok::<_, DaqError>(count)
        }
        .await;
        self.handle.observe(result)
    }
}

#[async_trait]
impl Driver for Hygrometer {
    fn id(&self) -> &str {
        self.handle.id()
    }

    fn state(&self) -> DeviceState {
        self.handle.state()
    }

    async fn connect(&mut self) -> DriverResult<()> {
        info!(device = %self.handle.id(), port = %self.handle.port().name(), "Connecting hygrometer");
        self.handle.connect(self.settle).await?;
        self.lines.clear();
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.handle.disconnect().await
    }

    async fn read_sample(&mut self) -> DriverResult<Vec<Sample>> {
        let sample = self
            .poll()
            .await?
            .ok_or(DaqError::NoMatch(self.poll_window))?;
        Ok(vec![
            Sample::new(Quantity::Dewpoint, sample.dewpoint),
            Sample::new(Quantity::AmbientTemperature, sample.ambient_temperature),
            Sample::new(Quantity::RelativeHumidity, sample.relative_humidity),
        ])
    }
}
