//! Serial adapter for RS-232/RS-485 communication
//!
//! Wraps `tokio-serial` so reads and writes are async and every read is bounded by
//! a timeout. The port is configured from [`SerialSettings`] when opened.

use super::Adapter;
use crate::config::SerialSettings;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial adapter for one physical port
pub struct SerialAdapter {
    settings: SerialSettings,

    #[cfg(feature = "instrument_serial")]
    port: Option<SerialStream>,
}

impl SerialAdapter {
    /// Create an adapter; the port is not opened until [`Adapter::open`].
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Line settings this adapter opens with
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[cfg(feature = "instrument_serial")]
fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

#[cfg(feature = "instrument_serial")]
fn parity(parity: crate::config::Parity) -> tokio_serial::Parity {
    match parity {
        crate::config::Parity::None => tokio_serial::Parity::None,
        crate::config::Parity::Even => tokio_serial::Parity::Even,
        crate::config::Parity::Odd => tokio_serial::Parity::Odd,
    }
}

#[cfg(feature = "instrument_serial")]
fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    if bits == 2 {
        tokio_serial::StopBits::Two
    } else {
        tokio_serial::StopBits::One
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Adapter for SerialAdapter {
    fn name(&self) -> &str {
        &self.settings.port
    }

    fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let s = &self.settings;
        let port = tokio_serial::new(&s.port, s.baud_rate)
            .data_bits(data_bits(s.data_bits))
            .parity(parity(s.parity))
            .stop_bits(stop_bits(s.stop_bits))
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(s.timeout)
            .open_native_async()?;
        debug!(port = %s.port, baud = s.baud_rate, "Serial port opened");
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.settings.port, "Serial port closed");
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buffer: &mut [u8], wait: Duration) -> AppResult<usize> {
        let port = self.port.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
        match tokio::time::timeout(wait, port.read(buffer)).await {
            Ok(Ok(0)) if !buffer.is_empty() => Err(DaqError::SerialUnexpectedEof),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(0),
        }
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
        port.clear(tokio_serial::ClearBuffer::Input)?;
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Adapter for SerialAdapter {
    fn name(&self) -> &str {
        &self.settings.port
    }

    fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    fn is_open(&self) -> bool {
        false
    }

    async fn open(&mut self) -> AppResult<()> {
        Err(DaqError::SerialFeatureDisabled)
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn write(&mut self, _bytes: &[u8]) -> AppResult<()> {
        Err(DaqError::SerialFeatureDisabled)
    }

    async fn read(&mut self, _buffer: &mut [u8], _wait: Duration) -> AppResult<usize> {
        Err(DaqError::SerialFeatureDisabled)
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        Err(DaqError::SerialFeatureDisabled)
    }
}

/// Serial ports visible to the operating system, as `(name, kind)` pairs.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> AppResult<Vec<(String, String)>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => format!(
                    "USB {:04x}:{:04x} {}",
                    info.vid,
                    info.pid,
                    info.product.unwrap_or_default()
                ),
                other => format!("{other:?}"),
            };
            (p.port_name, kind)
        })
        .collect())
}

/// Serial ports visible to the operating system, as `(name, kind)` pairs.
#[cfg(not(feature = "instrument_serial"))]
pub fn available_ports() -> AppResult<Vec<(String, String)>> {
    Err(DaqError::SerialFeatureDisabled)
}
