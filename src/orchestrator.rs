//! Sampling orchestrator
//!
//! Owns every configured driver and runs the monitoring session:
//!
//! ```text
//! Idle --connect_devices--> Connecting --> Monitoring --run/shutdown--> Stopping --> Stopped
//! ```
//!
//! Devices are always visited in the same order (dry MFC, wet MFC, hygrometer,
//! temperature probe). One device failing to connect or read never stops the
//! others; its channels are simply absent from the [`Reading`].
//!
//! Cycles start on a fixed grid of `interval`, so slow devices do not make the
//! schedule drift. A stop request is honoured between cycles; a cycle that has
//! started always completes.

use crate::adapters::{SerialAdapter, SharedPort};
use crate::config::{
    DeviceConfigs, SerialSettings, DEFAULT_DRY_MFC_ADDRESS, DEFAULT_WET_MFC_ADDRESS,
};
use crate::data::{DataLogger, Plotter};
use crate::error::{AppResult, DaqError};
use crate::instrument::{
    DeviceRole, DeviceState, Driver, FlowController, Hygrometer, TemperatureProbe,
};
use crate::measurement::{Reading, FIELD_NAMES};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Created, nothing connected
    Idle,
    /// Connecting devices
    Connecting,
    /// Devices connected, ready to run cycles
    Monitoring,
    /// Disconnecting devices
    Stopping,
    /// Session over
    Stopped,
}

struct DeviceSlot {
    role: DeviceRole,
    driver: Box<dyn Driver>,
}

/// Outcome of connecting one device
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceConnectResult {
    /// Slot the device fills
    pub role: DeviceRole,
    /// Driver identifier
    pub id: String,
    /// `None` when the device connected
    pub error: Option<String>,
}

impl DeviceConnectResult {
    /// True when the device connected
    pub fn connected(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-device connection outcomes, in connection order
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectReport {
    /// One entry per installed device
    pub devices: Vec<DeviceConnectResult>,
    /// True when every configured device connected
    pub all_connected: bool,
}

impl ConnectReport {
    /// Devices that did not connect
    pub fn failed(&self) -> impl Iterator<Item = &DeviceConnectResult> {
        self.devices.iter().filter(|d| !d.connected())
    }
}

/// Result of one setpoint request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SetpointOutcome {
    /// Setpoint written
    Applied(f32),
    /// Write failed with this error
    Failed(String),
    /// The controller is not configured or not connected
    NotConfigured,
    /// No setpoint requested
    NotRequested,
}

impl fmt::Display for SetpointOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetpointOutcome::Applied(v) => write!(f, "set to {v} ml/min"),
            SetpointOutcome::Failed(e) => write!(f, "failed: {e}"),
            SetpointOutcome::NotConfigured => f.write_str("controller not available"),
            SetpointOutcome::NotRequested => f.write_str("unchanged"),
        }
    }
}

/// Per-controller setpoint outcomes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetpointReport {
    /// Dry air controller
    pub dry: SetpointOutcome,
    /// Wet air controller
    pub wet: SetpointOutcome,
}

/// Totals for a finished monitoring run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Completed sampling cycles
    pub cycles: u64,
    /// Readings the logger failed to write
    pub log_failures: u64,
}

/// Drives every instrument through one monitoring session.
pub struct SamplingOrchestrator {
    state: SessionState,
    slots: Vec<DeviceSlot>,
}

impl Default for SamplingOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingOrchestrator {
    /// An orchestrator with no devices
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            slots: Vec::new(),
        }
    }

    /// Install `driver` in `role`, replacing any driver already there.
    pub fn with_device(mut self, role: DeviceRole, driver: Box<dyn Driver>) -> Self {
        self.slots.retain(|s| s.role != role);
        self.slots.push(DeviceSlot { role, driver });
        self.slots.sort_by_key(|s| {
            DeviceRole::ORDER
                .iter()
                .position(|r| *r == s.role)
                .unwrap_or(usize::MAX)
        });
        self
    }

    /// Build serial drivers for every configured device. Two flow controllers
    /// naming the same port share one bus.
    pub fn from_settings(devices: &DeviceConfigs) -> Self {
        let mut ports: Vec<SharedPort> = Vec::new();
        let mut port_for = |serial: &SerialSettings| -> SharedPort {
            if let Some(port) = ports.iter().find(|p| p.name() == serial.port) {
                return port.clone();
            }
            let port = SharedPort::new(Box::new(SerialAdapter::new(serial.clone())));
            ports.push(port.clone());
            port
        };

        let mut orchestrator = Self::new();
        if let Some(cfg) = &devices.dry_mfc {
            let port = port_for(&cfg.serial);
            let driver = FlowController::from_config("dry_mfc", cfg, DEFAULT_DRY_MFC_ADDRESS, port);
            orchestrator = orchestrator.with_device(DeviceRole::DryFlow, Box::new(driver));
        }
        if let Some(cfg) = &devices.wet_mfc {
            let port = port_for(&cfg.serial);
            let driver = FlowController::from_config("wet_mfc", cfg, DEFAULT_WET_MFC_ADDRESS, port);
            orchestrator = orchestrator.with_device(DeviceRole::WetFlow, Box::new(driver));
        }
        if let Some(cfg) = &devices.hygrometer {
            let driver = Hygrometer::from_config("hygrometer", cfg, port_for(&cfg.serial));
            orchestrator = orchestrator.with_device(DeviceRole::Hygrometer, Box::new(driver));
        }
        if let Some(cfg) = &devices.temperature_probe {
            let driver = TemperatureProbe::from_config("temperature_probe", cfg, port_for(&cfg.serial));
            orchestrator = orchestrator.with_device(DeviceRole::CellTemperature, Box::new(driver));
        }
        orchestrator
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Roles with a driver installed, in visiting order
    pub fn roles(&self) -> Vec<DeviceRole> {
        self.slots.iter().map(|s| s.role).collect()
    }

    /// State of the driver in `role`, if one is installed
    pub fn device_state(&self, role: DeviceRole) -> Option<DeviceState> {
        self.slot(role).map(|s| s.driver.state())
    }

    fn slot(&self, role: DeviceRole) -> Option<&DeviceSlot> {
        self.slots.iter().find(|s| s.role == role)
    }

    fn slot_mut(&mut self, role: DeviceRole) -> Option<&mut DeviceSlot> {
        self.slots.iter_mut().find(|s| s.role == role)
    }

    /// Try to connect every device. Failures are reported, not raised, and the
    /// session moves on to `Monitoring` either way.
    pub async fn connect_devices(&mut self) -> ConnectReport {
        self.state = SessionState::Connecting;
        let mut report = ConnectReport {
            devices: Vec::with_capacity(self.slots.len()),
            all_connected: true,
        };

        for slot in &mut self.slots {
            let id = slot.driver.id().to_string();
            let error = match slot.driver.connect().await {
                Ok(()) => {
                    info!(device = %id, role = %slot.role, "Connected");
                    None
                }
                Err(e) => {
                    warn!(device = %id, role = %slot.role, error = %e, "Connection failed");
                    report.all_connected = false;
                    Some(e.to_string())
                }
            };
            report.devices.push(DeviceConnectResult {
                role: slot.role,
                id,
                error,
            });
        }

        self.state = SessionState::Monitoring;
        report
    }

    /// Read every connected device once and merge the results.
    ///
    /// Devices that are not connected, or whose read fails, leave their channels
    /// absent.
    pub async fn read_all(&mut self) -> Reading {
        let mut reading = Reading::empty(Utc::now());
        for slot in &mut self.slots {
            if slot.driver.state() != DeviceState::Connected {
                continue;
            }
            match slot.driver.read_sample().await {
                Ok(samples) => {
                    for sample in samples {
                        if let Some(channel) = slot.role.channel_for(sample.quantity) {
                            reading.set(channel, Some(sample.value));
                        }
                    }
                }
                Err(e) => {
                    warn!(device = %slot.driver.id(), error = %e, "Read failed, channels blank this cycle");
                }
            }
        }
        reading
    }

    /// Apply the requested setpoints. Each controller is handled independently
    /// and exactly once.
    pub async fn set_flow_rates(&mut self, dry: Option<f32>, wet: Option<f32>) -> SetpointReport {
        SetpointReport {
            dry: self.apply_setpoint(DeviceRole::DryFlow, dry).await,
            wet: self.apply_setpoint(DeviceRole::WetFlow, wet).await,
        }
    }

    async fn apply_setpoint(&mut self, role: DeviceRole, value: Option<f32>) -> SetpointOutcome {
        let Some(value) = value else {
            return SetpointOutcome::NotRequested;
        };
        let Some(slot) = self.slot_mut(role) else {
            warn!(%role, value, "Setpoint requested for an unconfigured controller");
            return SetpointOutcome::NotConfigured;
        };
        if slot.driver.state() != DeviceState::Connected || !slot.driver.supports_setpoint() {
            warn!(%role, value, "Controller not available for setpoint");
            return SetpointOutcome::NotConfigured;
        }
        match slot.driver.write_setpoint(value).await {
            Ok(()) => {
                info!(%role, value, "Flow setpoint applied");
                SetpointOutcome::Applied(value)
            }
            Err(e) => {
                warn!(%role, value, error = %e, "Failed to apply flow setpoint");
                SetpointOutcome::Failed(e.to_string())
            }
        }
    }

    /// Run monitoring cycles every `interval` until `stop` turns true (or its
    /// sender goes away), then shut down.
    ///
    /// Each cycle reads all devices, then calls `logger.log_data` and
    /// `plotter.add_data_point` with the merged reading. Log write failures are
    /// counted and reported but do not end the session.
    pub async fn run(
        &mut self,
        interval: Duration,
        logger: &mut dyn DataLogger,
        plotter: &mut dyn Plotter,
        mut stop: watch::Receiver<bool>,
    ) -> AppResult<SessionSummary> {
        if self.state != SessionState::Monitoring {
            return Err(DaqError::InvalidState(format!(
                "monitoring requires connected devices, session is {:?}",
                self.state
            )));
        }
        if interval.is_zero() {
            return Err(DaqError::InvalidState(
                "sampling interval must be non-zero".to_string(),
            ));
        }
        if let Err(e) = logger.start_new_log(&FIELD_NAMES).await {
            self.shutdown().await;
            return Err(e);
        }

        info!(interval = ?interval, devices = self.slots.len(), "Monitoring started");
        let mut summary = SessionSummary::default();
        let mut ticker = interval_at(Instant::now(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = ticker.tick() => {}
            }

            let reading = self.read_all().await;
            if let Err(e) = logger.log_data(&reading).await {
                summary.log_failures += 1;
                warn!(error = %e, "Failed to log reading");
            }
            plotter.add_data_point(&reading);
            summary.cycles += 1;
            info!("{reading}");
        }

        info!(cycles = summary.cycles, "Monitoring stopped");
        if let Err(e) = logger.close().await {
            warn!(error = %e, "Failed to close data log");
        }
        self.shutdown().await;
        Ok(summary)
    }

    /// Disconnect every device that is connected or failed. Errors are logged.
    /// Calling this again after it finished does nothing.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.state = SessionState::Stopping;
        for slot in &mut self.slots {
            if slot.driver.state() == DeviceState::Disconnected {
                continue;
            }
            match slot.driver.disconnect().await {
                Ok(()) => info!(device = %slot.driver.id(), "Disconnected"),
                Err(e) => warn!(device = %slot.driver.id(), error = %e, "Disconnect failed"),
            }
        }
        self.state = SessionState::Stopped;
        debug!("Session stopped");
    }
}

/// Resolves once the flag is true or the sender has been dropped.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
