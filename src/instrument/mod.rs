//! Instrument drivers
//!
//! Every instrument implements [`Driver`], so the orchestrator can connect, read
//! and disconnect them without knowing what sits behind the port:
//!
//! - [`FlowController`]: Vögtlin mass-flow controller over Modbus RTU
//! - [`Hygrometer`]: chilled-mirror hygrometer, ASCII status lines
//! - [`TemperatureProbe`]: single-value ASCII temperature probe
//!
//! A driver reports its values as [`Sample`]s tagged with a [`Quantity`]; the
//! [`DeviceRole`] the orchestrator assigned to it decides which [`Channel`] of the
//! [`Reading`](crate::measurement::Reading) each quantity lands in.

pub mod flow_controller;
pub mod handle;
pub mod hygrometer;
pub mod temperature_probe;

pub use flow_controller::{FlowController, FlowStatus, Register};
pub use handle::DeviceHandle;
pub use hygrometer::Hygrometer;
pub use temperature_probe::TemperatureProbe;

use crate::error::{DaqError, DriverResult};
use crate::measurement::Channel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle of one driver.
///
/// `Disconnected → Connected → (Failed | Disconnected)`. A transport error moves
/// a connected driver to `Failed`; only [`Driver::disconnect`] leaves `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Port not leased
    Disconnected,
    /// Port leased and answering
    Connected,
    /// Transport broke; skipped until reconnected
    Failed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connected => "connected",
            DeviceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Physical quantity a driver can report
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    /// Measured gas flow
    Flow,
    /// Flow setpoint read back from the controller
    Setpoint,
    /// Temperature of the measured medium
    Temperature,
    /// Dewpoint temperature
    Dewpoint,
    /// Ambient air temperature
    AmbientTemperature,
    /// Relative humidity
    RelativeHumidity,
}

/// One value read from a driver
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// What was measured
    pub quantity: Quantity,
    /// Measured value in the quantity's unit
    pub value: f64,
}

impl Sample {
    /// Sample of `quantity` with `value`
    pub fn new(quantity: Quantity, value: f64) -> Self {
        Self { quantity, value }
    }
}

/// Position a device occupies in the sampling session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Dry air flow controller
    DryFlow,
    /// Wet air flow controller
    WetFlow,
    /// Chilled-mirror hygrometer
    Hygrometer,
    /// Sample cell temperature probe
    CellTemperature,
}

impl DeviceRole {
    /// Roles in the order devices are connected and read
    pub const ORDER: [DeviceRole; 4] = [
        DeviceRole::DryFlow,
        DeviceRole::WetFlow,
        DeviceRole::Hygrometer,
        DeviceRole::CellTemperature,
    ];

    /// Channel a quantity from a device in this role is recorded under
    pub fn channel_for(self, quantity: Quantity) -> Option<Channel> {
        match (self, quantity) {
            (DeviceRole::DryFlow, Quantity::Flow) => Some(Channel::DryFlow),
            (DeviceRole::DryFlow, Quantity::Setpoint) => Some(Channel::DrySetpoint),
            (DeviceRole::WetFlow, Quantity::Flow) => Some(Channel::WetFlow),
            (DeviceRole::WetFlow, Quantity::Setpoint) => Some(Channel::WetSetpoint),
            (DeviceRole::Hygrometer, Quantity::Dewpoint) => Some(Channel::DewpointTemp),
            (DeviceRole::Hygrometer, Quantity::AmbientTemperature) => Some(Channel::AmbientTemp),
            (DeviceRole::Hygrometer, Quantity::RelativeHumidity) => {
                Some(Channel::RelativeHumidity)
            }
            (DeviceRole::CellTemperature, Quantity::Temperature) => Some(Channel::CellTemp),
            _ => None,
        }
    }

    /// Every channel this role fills
    pub fn channels(self) -> &'static [Channel] {
        match self {
            DeviceRole::DryFlow => &[Channel::DryFlow, Channel::DrySetpoint],
            DeviceRole::WetFlow => &[Channel::WetFlow, Channel::WetSetpoint],
            DeviceRole::Hygrometer => &[
                Channel::AmbientTemp,
                Channel::DewpointTemp,
                Channel::RelativeHumidity,
            ],
            DeviceRole::CellTemperature => &[Channel::CellTemp],
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceRole::DryFlow => "Dry Air MFC",
            DeviceRole::WetFlow => "Wet Air MFC",
            DeviceRole::Hygrometer => "Hygrometer",
            DeviceRole::CellTemperature => "Temperature Probe",
        };
        f.write_str(s)
    }
}

/// Uniform contract every instrument driver fulfils.
#[async_trait]
pub trait Driver: Send {
    /// Driver identifier used in logs and reports
    fn id(&self) -> &str;

    /// Current connection state
    fn state(&self) -> DeviceState;

    /// Take the transport and prepare the instrument.
    ///
    /// Any failure leaves the driver `Disconnected` without holding the
    /// transport.
    async fn connect(&mut self) -> DriverResult<()>;

    /// Release the transport. Always ends in `Disconnected`, even on error.
    async fn disconnect(&mut self) -> DriverResult<()>;

    /// Read every quantity this driver reports.
    ///
    /// Partial results are fine; an error means nothing could be read.
    async fn read_sample(&mut self) -> DriverResult<Vec<Sample>>;

    /// Whether [`Driver::write_setpoint`] is implemented
    fn supports_setpoint(&self) -> bool {
        false
    }

    /// Apply a flow setpoint. Fails with `Unsupported` unless overridden.
    async fn write_setpoint(&mut self, _value: f32) -> DriverResult<()> {
        Err(DaqError::Unsupported(format!(
            "{} does not accept setpoints",
            self.id()
        )))
    }
}
