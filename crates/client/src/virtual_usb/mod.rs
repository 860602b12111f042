//! Virtual USB controller side
//!
//! The [`VirtualUsbManager`] owns the port table of the virtual root hub and
//! creates one [`DeviceSession`] per imported device.
//!
//! # Architecture
//!
//! The platform device framework (the virtual host controller that
//! instantiates devices and produces USB request blocks) sits outside this
//! crate. It plugs in through [`DeviceHost`] and drives sessions with
//! [`DeviceSession::submit`] and [`DeviceSession::cancel`].

pub mod port_table;
pub mod session;

use anyhow::Result;
use protocol::UsbDevice;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{AttachError, DetachError};
use crate::network::{ConnectOptions, DeviceLocation};

pub use port_table::{PortGuard, PortTable};
pub use session::{DeviceSession, SessionState};

/// Platform hook notified when a device appears on or leaves a port
pub trait DeviceHost: Send + Sync {
    /// Make the imported device visible on `port`; an error rejects the import
    fn plug_in(&self, port: u16, device: &UsbDevice) -> Result<()>;

    /// Remove whatever is plugged into `port`
    fn plug_out(&self, port: u16);
}

/// Host that accepts every device and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl DeviceHost for NullHost {
    fn plug_in(&self, port: u16, device: &UsbDevice) -> Result<()> {
        debug!(
            "Port {}: plugged in {:04x}:{:04x}",
            port, device.vendor_id, device.product_id
        );
        Ok(())
    }

    fn plug_out(&self, port: u16) {
        debug!("Port {}: unplugged", port);
    }
}

/// Snapshot of one session for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDevice {
    pub port: u16,
    pub location: DeviceLocation,
    /// Known once the import handshake completed
    pub device: Option<UsbDevice>,
    pub state: SessionState,
}

/// Process-wide coordinator for imported devices
pub struct VirtualUsbManager {
    ports: Arc<PortTable<DeviceSession>>,
    host: Arc<dyn DeviceHost>,
    options: ConnectOptions,
    shutdown: CancellationToken,
}

impl VirtualUsbManager {
    /// Manager sized and tuned from the client configuration
    pub fn new(config: &ClientConfig, host: Arc<dyn DeviceHost>) -> Self {
        let capacity = u16::try_from(config.vhci.ports).unwrap_or(u16::MAX);
        Self::with_capacity(capacity, ConnectOptions::from(&config.network), host)
    }

    pub fn with_capacity(
        capacity: u16,
        options: ConnectOptions,
        host: Arc<dyn DeviceHost>,
    ) -> Self {
        debug!("Virtual root hub with {} port(s)", capacity);
        Self {
            ports: Arc::new(PortTable::new(capacity)),
            host,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.ports.capacity()
    }

    /// Reserve the lowest free port without importing anything
    pub fn claim_port(&self) -> Option<u16> {
        self.ports.claim().map(PortGuard::keep)
    }

    /// Release a port reserved with [`claim_port`](Self::claim_port)
    ///
    /// Ports held by a live session are left alone; detach the session.
    pub fn release_port(&self, port: u16) -> bool {
        if self.ports.lookup(port).is_some() {
            warn!("Port {} is held by a session, not releasing", port);
            return false;
        }
        self.ports.release(port)
    }

    /// Import the device at `location` onto the lowest free port
    ///
    /// `cancel` aborts the attempt; once it returns `Ok` the session lives
    /// until it is detached, the remote drops, or the manager shuts down.
    pub async fn attach(
        &self,
        location: DeviceLocation,
        cancel: &CancellationToken,
    ) -> Result<Arc<DeviceSession>, AttachError> {
        DeviceSession::establish(
            &self.ports,
            &self.host,
            location,
            &self.options,
            self.shutdown.child_token(),
            cancel,
        )
        .await
    }

    /// Session bound to `port`
    pub fn session(&self, port: u16) -> Option<Arc<DeviceSession>> {
        self.ports.lookup(port)
    }

    /// Detach the session on `port` and wait for it to finish
    pub async fn detach(&self, port: u16, cancel: &CancellationToken) -> Result<(), DetachError> {
        if port == 0 || port > self.capacity() {
            return Err(DetachError::InvalidPort(port));
        }
        let session = self
            .ports
            .lookup(port)
            .ok_or(DetachError::NotAttached(port))?;
        session.detach(cancel).await
    }

    /// Detach every session; returns how many were detached
    pub async fn detach_all(&self, cancel: &CancellationToken) -> Result<usize, DetachError> {
        let sessions: Vec<_> = self.ports.enumerate().map(|(_, s)| s).collect();
        for session in &sessions {
            session.request_detach();
        }
        for session in &sessions {
            session.wait_detached(cancel).await?;
        }
        if !sessions.is_empty() {
            info!("Detached {} device(s)", sessions.len());
        }
        Ok(sessions.len())
    }

    /// Sessions currently bound to ports, ordered by port
    pub fn imported_devices(&self) -> Vec<ImportedDevice> {
        self.ports
            .enumerate()
            .map(|(port, session)| ImportedDevice {
                port,
                location: session.location().clone(),
                device: session.device().cloned(),
                state: session.state(),
            })
            .collect()
    }

    /// Import every persisted location marked for auto-import
    ///
    /// Failures are logged and returned alongside successes; one bad
    /// location does not stop the rest.
    pub async fn auto_import(
        &self,
        config: &ClientConfig,
        cancel: &CancellationToken,
    ) -> Vec<(DeviceLocation, Result<Arc<DeviceSession>, AttachError>)> {
        let mut results = Vec::new();
        for location in config.auto_import_locations() {
            if cancel.is_cancelled() {
                break;
            }
            let result = self.attach(location.clone(), cancel).await;
            if let Err(e) = &result {
                warn!("Auto-import of {} failed: {}", location, e);
            }
            results.push((location, result));
        }
        results
    }

    /// Tear down every session without waiting
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for VirtualUsbManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
