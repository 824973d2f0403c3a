//! Lease-counted port handle for multi-drop buses
//!
//! Two flow controllers may sit on one RS-485 bus with different station
//! addresses, or each own a dedicated port. Drivers hold a cloned [`SharedPort`]
//! either way: the first [`acquire`](SharedPort::acquire) opens the underlying
//! adapter, the last [`release`](SharedPort::release) closes it. Transactions take
//! the inner mutex for their whole request/response exchange, so frames from two
//! stations never interleave.

use super::Adapter;
use crate::error::AppResult;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

struct PortInner {
    adapter: Box<dyn Adapter>,
    leases: usize,
}

/// Cloneable handle to one physical port
#[derive(Clone)]
pub struct SharedPort {
    inner: Arc<Mutex<PortInner>>,
    name: String,
    timeout: Duration,
}

/// Exclusive access to the port for the duration of one transaction
pub struct PortGuard<'a> {
    guard: MutexGuard<'a, PortInner>,
}

impl Deref for PortGuard<'_> {
    type Target = dyn Adapter;

    fn deref(&self) -> &Self::Target {
        &*self.guard.adapter
    }
}

impl DerefMut for PortGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.guard.adapter
    }
}

impl SharedPort {
    /// Wrap an adapter. The adapter is not opened until the first lease.
    pub fn new(adapter: Box<dyn Adapter>) -> Self {
        let name = adapter.name().to_string();
        let timeout = adapter.timeout();
        Self {
            inner: Arc::new(Mutex::new(PortInner { adapter, leases: 0 })),
            name,
            timeout,
        }
    }

    /// Port identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read timeout of the underlying adapter
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Take a lease, opening the port if this is the first one.
    ///
    /// On failure no lease is held.
    pub async fn acquire(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.leases == 0 {
            inner.adapter.open().await?;
        }
        inner.leases += 1;
        debug!(port = %self.name, leases = inner.leases, "Port lease acquired");
        Ok(())
    }

    /// Return a lease, closing the port when the last one is released.
    pub async fn release(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.leases == 0 {
            return Ok(());
        }
        inner.leases -= 1;
        debug!(port = %self.name, leases = inner.leases, "Port lease released");
        if inner.leases == 0 {
            inner.adapter.close().await?;
        }
        Ok(())
    }

    /// Number of drivers currently holding the port
    pub async fn leases(&self) -> usize {
        self.inner.lock().await.leases
    }

    /// Lock the port for one transaction
    pub async fn lock(&self) -> PortGuard<'_> {
        PortGuard {
            guard: self.inner.lock().await,
        }
    }

    /// True when both handles refer to the same physical port
    pub fn same_port(&self, other: &SharedPort) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPort")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}
