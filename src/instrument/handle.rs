//! Connection bookkeeping shared by all drivers.
//!
//! A [`DeviceHandle`] pairs a driver's [`SharedPort`] lease with its
//! [`DeviceState`], and turns transport failures into the `Failed` state.

use super::DeviceState;
use crate::adapters::{LineBuffer, SharedPort};
use crate::error::{DaqError, DriverResult};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lease and lifecycle state of one device on a port
#[derive(Debug)]
pub struct DeviceHandle {
    id: String,
    port: SharedPort,
    state: DeviceState,
    leased: bool,
}

impl DeviceHandle {
    /// Disconnected handle for device `id` on `port`
    pub fn new(id: impl Into<String>, port: SharedPort) -> Self {
        Self {
            id: id.into(),
            port,
            state: DeviceState::Disconnected,
            leased: false,
        }
    }

    /// Device identifier used in logs
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current connection state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Port the device is leased on
    pub fn port(&self) -> &SharedPort {
        &self.port
    }

    /// Acquire the port lease, wait `settle`, then discard stale input.
    ///
    /// If anything after the lease fails, the lease is returned before the error
    /// is reported.
    pub async fn connect(&mut self, settle: Duration) -> DriverResult<()> {
        if self.state == DeviceState::Connected {
            return Ok(());
        }
        if !self.leased {
            self.port.acquire().await?;
            self.leased = true;
        }
        tokio::time::sleep(settle).await;

        let cleared = self.port.lock().await.clear_input().await;
        if let Err(e) = cleared {
            self.abort_connect().await;
            return Err(e);
        }
        self.state = DeviceState::Connected;
        debug!(device = %self.id, port = %self.port.name(), "Device connected");
        Ok(())
    }

    async fn abort_connect(&mut self) {
        self.state = DeviceState::Disconnected;
        if std::mem::take(&mut self.leased) {
            if let Err(e) = self.port.release().await {
                warn!(device = %self.id, error = %e, "Failed to release port after connect failure");
            }
        }
    }

    /// Return the lease. The state is `Disconnected` afterwards regardless of
    /// the outcome.
    pub async fn disconnect(&mut self) -> DriverResult<()> {
        self.state = DeviceState::Disconnected;
        if std::mem::take(&mut self.leased) {
            self.port.release().await?;
            debug!(device = %self.id, "Device disconnected");
        }
        Ok(())
    }

    /// Error unless the device is `Connected`
    pub fn ensure_connected(&self) -> DriverResult<()> {
        match self.state {
            DeviceState::Connected => Ok(()),
            DeviceState::Disconnected | DeviceState::Failed => Err(DaqError::SerialPortNotConnected),
        }
    }

    /// Pass `result` through, marking the device `Failed` on a transport error.
    pub fn observe<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        if let Err(e) = &result {
            if e.is_transport_failure() && self.state == DeviceState::Connected {
                warn!(device = %self.id, error = %e, "Transport failure, marking device failed");
                self.state = DeviceState::Failed;
            }
        }
        result
    }
}

/// Send `command` on a line-oriented port and return the first reply line that
/// `parse` accepts, or `None` once `window` elapses.
///
/// Stale input is discarded before the command goes out.
pub(crate) async fn query_line<T, F>(
    port: &SharedPort,
    lines: &mut LineBuffer,
    command: &[u8],
    window: Duration,
    parse: F,
) -> DriverResult<Option<T>>
where
    T: Send,
    F: Fn(&str) -> Option<T> + Send,
{
    let mut guard = port.lock().await;
    guard.clear_input().await?;
    lines.clear();
    guard.write(command).await?;

    let deadline = Instant::now() + window;
    while let Some(line) = lines.read_line(&mut *guard, deadline).await? {
        match parse(&line) {
            Some(value) => return Ok(Some(value)),
            None => debug!(port = %port.name(), line = %line, "Ignoring unrecognised line"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn handle() -> (DeviceHandle, crate::adapters::MockHandle) {
        let (adapter, mock) = MockAdapter::new("mock0");
        (DeviceHandle::new("dev", SharedPort::new(Box::new(adapter))), mock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_disconnect() {
        let (mut dev, mock) = handle();
        dev.connect(Duration::from_millis(500)).await.unwrap();
        assert_eq!(dev.state(), DeviceState::Connected);
        assert!(mock.is_open());

        dev.disconnect().await.unwrap();
        assert_eq!(dev.state(), DeviceState::Disconnected);
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_disconnected() {
        let (mut dev, mock) = handle();
        mock.fail_open(true);
        assert!(dev.connect(Duration::ZERO).await.is_err());
        assert_eq!(dev.state(), DeviceState::Disconnected);
        assert_eq!(dev.port().leases().await, 0);
    }

    #[tokio::test]
    async fn test_only_transport_errors_fail_the_device() {
        let (mut dev, _mock) = handle();
        dev.connect(Duration::ZERO).await.unwrap();

        let r: DriverResult<()> = dev.observe(Err(DaqError::Timeout(Duration::from_millis(100))));
        assert!(r.is_err());
        assert_eq!(dev.state(), DeviceState::Connected);

        let _ = dev.observe::<()>(Err(DaqError::SerialUnexpectedEof));
        assert_eq!(dev.state(), DeviceState::Failed);
        assert!(dev.ensure_connected().is_err());

        // Disconnect still releases the lease
        dev.disconnect().await.unwrap();
        assert_eq!(dev.port().leases().await, 0);
    }
}
