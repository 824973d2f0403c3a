//! Vögtlin mass-flow controller driver
//!
//! The controller speaks Modbus RTU. Every quantity is an IEEE-754 float held in
//! two consecutive holding registers, read with function 0x03 and written with
//! 0x10. Several controllers may share one RS-485 bus; each is addressed by its
//! station id and all of them hold the same [`SharedPort`].
//!
//! ## Configuration
//!
//! ```toml
//! [devices.dry_mfc]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! timeout = "500ms"
//! address = 1
//! word_swap = false
//! settle = "500ms"
//! ```

use super::{DeviceHandle, DeviceState, Driver, Quantity, Sample};
use crate::adapters::{read_exact, SharedPort};
use crate::config::FlowControllerConfig;
use crate::error::{DaqError, DriverResult};
use crate::protocol::modbus_rtu::{self, RESPONSE_HEAD_LEN};
use crate::protocol::register_codec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Holding-register map. Each quantity spans two registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    /// Measured flow (ml/min)
    Flow,
    /// Gas temperature (°C)
    Temperature,
    /// Totalised flow
    TotalFlow,
    /// Flow setpoint (ml/min)
    Setpoint,
    /// Analog input signal
    AnalogInput,
    /// Valve drive signal (%)
    ValveSignal,
    /// Alarm register
    Alarm,
    /// Error register
    Error,
    /// Control function selector
    ControlFunction,
    /// Setpoint ramp
    Ramp,
}

impl Register {
    /// First of the two registers holding the value
    pub fn address(self) -> u16 {
        match self {
            Register::Flow => 0x0000,
            Register::Temperature => 0x0002,
            Register::TotalFlow => 0x0004,
            Register::Setpoint => 0x0006,
            Register::AnalogInput => 0x0008,
            Register::ValveSignal => 0x000A,
            Register::Alarm => 0x000C,
            Register::Error => 0x000D,
            Register::ControlFunction => 0x000E,
            Register::Ramp => 0x000F,
        }
    }
}

/// Snapshot of the main process values
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowStatus {
    /// Measured flow (ml/min)
    pub flow: f32,
    /// Active setpoint (ml/min)
    pub setpoint: f32,
    /// Gas temperature (°C)
    pub temperature: f32,
    /// Valve drive signal (%)
    pub valve_signal: f32,
}

/// Driver for one flow controller station
pub struct FlowController {
    handle: DeviceHandle,
    station: u8,
    word_swap: bool,
    settle: Duration,
}

impl FlowController {
    /// Create a driver for `station` on `port`.
    pub fn new(id: impl Into<String>, port: SharedPort, station: u8) -> Self {
        Self {
            handle: DeviceHandle::new(id, port),
            station,
            word_swap: false,
            settle: Duration::from_millis(500),
        }
    }

    /// Build from configuration; `default_address` applies when the config has none.
    pub fn from_config(
        id: impl Into<String>,
        config: &FlowControllerConfig,
        default_address: u8,
        port: SharedPort,
    ) -> Self {
        Self::new(id, port, config.address.unwrap_or(default_address))
            .with_word_swap(config.word_swap)
            .with_settle(config.settle)
    }

    /// Reverse register order of float pairs
    pub fn with_word_swap(mut self, word_swap: bool) -> Self {
        self.word_swap = word_swap;
        self
    }

    /// Delay after opening the port before the first request
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Modbus station address
    pub fn station(&self) -> u8 {
        self.station
    }

    /// Port this controller talks through
    pub fn port(&self) -> &SharedPort {
        self.handle.port()
    }

    /// Send one request and collect its complete response frame.
    ///
    /// The port stays locked for the whole exchange.
    async fn transact(&mut self, request: &[u8], success_len: usize) -> DriverResult<Vec<u8>> {
        self.handle.ensure_connected()?;
        let port = self.handle.port().clone();
        let result = async {
            let mut guard = port.lock().await;
            guard.clear_input().await?;
            guard.write(request).await?;

            let deadline = Instant::now() + port.timeout();
            let mut head = [0u8; RESPONSE_HEAD_LEN];
            read_exact(&mut *guard, &mut head, deadline).await?;

            let mut frame = vec![0u8; modbus_rtu::response_len(&head, success_len)];
            frame[..RESPONSE_HEAD_LEN].copy_from_slice(&head);
            read_exact(&mut *guard, &mut frame[RESPONSE_HEAD_LEN..], deadline).await?;
            Ok::<_, DaqError>(frame)
        }
        .await;
        self.handle.observe(result)
    }

    /// Read the float stored at `register`
    pub async fn read_register(&mut self, register: Register) -> DriverResult<f32> {
        let request = modbus_rtu::read_registers_request(self.station, register.address(), 2);
        let frame = self
            .transact(&request, modbus_rtu::read_response_len(2))
            .await?;
        let words = modbus_rtu::parse_read_response(self.station, 2, &frame)?;
        let value = register_codec::decode_f32([words[0], words[1]], self.word_swap);
        debug!(device = %self.handle.id(), ?register, value, "Register read");
        Ok(value)
    }

    /// Write a float to `register`
    pub async fn write_register(&mut self, register: Register, value: f32) -> DriverResult<()> {
        let words = register_codec::encode_f32(value, self.word_swap);
        let request = modbus_rtu::write_registers_request(self.station, register.address(), &words);
        let frame = self
            .transact(&request, modbus_rtu::WRITE_RESPONSE_LEN)
            .await?;
        modbus_rtu::parse_write_response(self.station, register.address(), 2, &frame)
    }

    /// Measured flow (ml/min)
    pub async fn flow(&mut self) -> DriverResult<f32> {
        self.read_register(Register::Flow).await
    }

    /// Active setpoint (ml/min)
    pub async fn setpoint(&mut self) -> DriverResult<f32> {
        self.read_register(Register::Setpoint).await
    }

    /// Gas temperature (°C)
    pub async fn temperature(&mut self) -> DriverResult<f32> {
        self.read_register(Register::Temperature).await
    }

    /// Totalised flow
    pub async fn total_flow(&mut self) -> DriverResult<f32> {
        self.read_register(Register::TotalFlow).await
    }

    /// Valve drive signal (%)
    pub async fn valve_signal(&mut self) -> DriverResult<f32> {
        self.read_register(Register::ValveSignal).await
    }

    /// Analog input signal
    pub async fn analog_input(&mut self) -> DriverResult<f32> {
        self.read_register(Register::AnalogInput).await
    }

    /// Flow, setpoint, temperature and valve signal in one call
    pub async fn status(&mut self) -> DriverResult<FlowStatus> {
        Ok(FlowStatus {
            flow: self.flow().await?,
            setpoint: self.setpoint().await?,
            temperature: self.temperature().await?,
            valve_signal: self.valve_signal().await?,
        })
    }

    /// Command a new flow setpoint. Non-finite values are rejected before
    /// anything is sent.
    pub async fn set_setpoint(&mut self, value: f32) -> DriverResult<()> {
        if !value.is_finite() {
            return Err(DaqError::InvalidSetpoint(value));
        }
        self.write_register(Register::Setpoint, value).await?;
        info!(device = %self.handle.id(), station = self.station, value, "Setpoint written");
        Ok(())
    }
}

#[async_trait]
impl Driver for FlowController {
    fn id(&self) -> &str {
        self.handle.id()
    }

    fn state(&self) -> DeviceState {
        self.handle.state()
    }

    async fn connect(&mut self) -> DriverResult<()> {
        info!(
            device = %self.handle.id(),
            port = %self.handle.port().name(),
            station = self.station,
            "Connecting flow controller"
        );
        self.handle.connect(self.settle).await
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.handle.disconnect().await
    }

    async fn read_sample(&mut self) -> DriverResult<Vec<Sample>> {
        let mut samples = Vec::with_capacity(2);
        let mut first_error = None;
        for (quantity, register) in [
            (Quantity::Flow, Register::Flow),
            (Quantity::Setpoint, Register::Setpoint),
        ] {
            if self.handle.state() != DeviceState::Connected {
                break;
            }
            match self.read_register(register).await {
                Ok(value) => samples.push(Sample::new(quantity, f64::from(value))),
                Err(e) => {
                    warn!(device = %self.handle.id(), ?register, error = %e, "Register read failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if samples.is_empty() => Err(e),
            _ => Ok(samples),
        }
    }

    fn supports_setpoint(&self) -> bool {
        true
    }

    async fn write_setpoint(&mut self, value: f32) -> DriverResult<()> {
        self.set_setpoint(value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockAdapter, MockHandle, ModbusBusSim};

    fn controller(bus: &ModbusBusSim, station: u8) -> (FlowController, MockHandle) {
        let (adapter, mock) = MockAdapter::new("/dev/ttyUSB0");
        let adapter = adapter.with_responder(bus.responder());
        let port = SharedPort::new(Box::new(adapter));
        (FlowController::new("dry_mfc", port, station).with_settle(Duration::ZERO), mock)
    }

    #[tokio::test]
    async fn test_reads_decode_registers() {
        let bus = ModbusBusSim::new();
        bus.set_float(1, Register::Flow.address(), 12.5)
            .set_float(1, Register::Setpoint.address(), 15.0)
            .set_float(1, Register::Temperature.address(), 22.25)
            .set_float(1, Register::ValveSignal.address(), 41.0)
            .set_float(1, Register::TotalFlow.address(), 1520.75)
            .set_float(1, Register::AnalogInput.address(), -3.5);
        let (mut mfc, mock) = controller(&bus, 1);
        mfc.connect().await.unwrap();

        assert_eq!(mfc.flow().await.unwrap(), 12.5);
        let status = mfc.status().await.unwrap();
        assert_eq!(status.setpoint, 15.0);
        assert_eq!(status.temperature, 22.25);
        assert_eq!(status.valve_signal, 41.0);
        assert_eq!(mfc.total_flow().await.unwrap(), 1520.75);
        assert_eq!(mfc.analog_input().await.unwrap(), -3.5);

        // Flow request: station 1, function 3, address 0, two registers
        assert_eq!(&mock.writes()[0][..6], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_set_setpoint_writes_two_registers() {
        let bus = ModbusBusSim::new();
        bus.add_station(2);
        let (mut mfc, mock) = controller(&bus, 2);
        mfc.connect().await.unwrap();

        mfc.set_setpoint(10.0).await.unwrap();
        assert_eq!(bus.float(2, Register::Setpoint.address()), Some(10.0));
        let request = &mock.writes()[0];
        assert_eq!(&request[..7], &[0x02, 0x10, 0x00, 0x06, 0x00, 0x02, 0x04]);
    }

    #[tokio::test]
    async fn test_non_finite_setpoint_is_rejected_locally() {
        let bus = ModbusBusSim::new();
        bus.add_station(1);
        let (mut mfc, mock) = controller(&bus, 1);
        mfc.connect().await.unwrap();

        let err = mfc.set_setpoint(f32::NAN).await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidSetpoint(_)));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_exception_keeps_device_connected() {
        let bus = ModbusBusSim::new();
        bus.reject_writes(1, true);
        let (mut mfc, _mock) = controller(&bus, 1);
        mfc.connect().await.unwrap();

        let err = mfc.set_setpoint(5.0).await.unwrap_err();
        assert!(matches!(err, DaqError::ModbusException { station: 1, code: 0x03 }));
        assert_eq!(mfc.state(), DeviceState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_station_times_out() {
        let bus = ModbusBusSim::new();
        let (mut mfc, _mock) = controller(&bus, 7);
        mfc.connect().await.unwrap();

        assert!(matches!(mfc.flow().await, Err(DaqError::Timeout(_))));
        assert_eq!(mfc.state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_io_error_fails_device() {
        let bus = ModbusBusSim::new();
        bus.add_station(1);
        let (mut mfc, mock) = controller(&bus, 1);
        mfc.connect().await.unwrap();
        mock.fail_io(true);

        assert!(mfc.read_sample().await.is_err());
        assert_eq!(mfc.state(), DeviceState::Failed);
        // Further calls fail fast without touching the port
        let writes = mock.writes().len();
        assert!(mfc.flow().await.is_err());
        assert_eq!(mock.writes().len(), writes);

        mfc.disconnect().await.unwrap();
        assert_eq!(mfc.state(), DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn test_word_swap_applies_to_reads() {
        let bus = ModbusBusSim::new();
        // Store 1.0 the way a low-word-first device would
        bus.set_float(1, Register::Flow.address(), f32::from_bits(0x0000_3F80));
        let (mfc, _mock) = controller(&bus, 1);
        let mut mfc = mfc.with_word_swap(true);
        mfc.connect().await.unwrap();
        assert_eq!(mfc.flow().await.unwrap(), 1.0);
    }
}
