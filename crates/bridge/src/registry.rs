//! Open connection registry
//!
//! Owns every open connection together with its transfer pump, keyed by
//! [`ConnectionHandle`]. A device can be open at most once: an open attempt
//! first takes an [`OpenReservation`] on the device name, which fails with
//! `AlreadyOpen` while another open of the same device is in progress or
//! the device is already registered.
//!
//! The registry lock only guards the map. Opening, joining pumps and
//! closing OS connections all happen outside it.

use crate::host::{HostConnection, UsbHost};
use crate::pump::TransferPump;
use protocol::{BridgeCallbacks, BridgeError, ConnectionHandle, DeviceDescriptor};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One open device: its OS connection and the pump serving it
pub struct OpenConnection {
    name: String,
    handle: ConnectionHandle,
    connection: Arc<dyn HostConnection>,
    pump: TransferPump,
}

impl OpenConnection {
    /// OS name of the device
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn connection(&self) -> &Arc<dyn HostConnection> {
        &self.connection
    }

    pub fn pump(&self) -> &TransferPump {
        &self.pump
    }

    /// Stop the pump, then release the OS connection
    fn shut_down(&self) -> protocol::Result<()> {
        let joined = self.pump.stop_and_join();
        self.connection.close();
        joined
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionHandle, Arc<OpenConnection>>,
    opening: HashSet<String>,
}

impl RegistryState {
    fn is_open(&self, name: &str) -> bool {
        self.connections.values().any(|c| c.name == name)
    }
}

/// Claim on a device name for the duration of one open attempt
///
/// Released when dropped, whether the open succeeded or not.
pub struct OpenReservation<'a> {
    registry: &'a ConnectionRegistry,
    name: String,
}

impl OpenReservation<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for OpenReservation<'_> {
    fn drop(&mut self) {
        self.registry.lock().opening.remove(&self.name);
    }
}

/// Registry of open connections
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    callbacks: Arc<dyn BridgeCallbacks>,
    poll_interval: Duration,
    transfer_interface: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry
    ///
    /// Pumps deliver to `callbacks`, wait at most `poll_interval` between
    /// stop checks, and accept endpoints of interface `transfer_interface`.
    pub fn new(
        callbacks: Arc<dyn BridgeCallbacks>,
        poll_interval: Duration,
        transfer_interface: usize,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            callbacks,
            poll_interval,
            transfer_interface,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `name` for an open attempt
    pub fn reserve(&self, name: &str) -> protocol::Result<OpenReservation<'_>> {
        let mut state = self.lock();

        if state.is_open(name) || !state.opening.insert(name.to_string()) {
            return Err(BridgeError::AlreadyOpen {
                name: name.to_string(),
            });
        }

        Ok(OpenReservation {
            registry: self,
            name: name.to_string(),
        })
    }

    /// Open `device` and start its pump
    ///
    /// The caller must already hold a permission grant for the device.
    pub fn open(
        &self,
        host: &dyn UsbHost,
        device: &DeviceDescriptor,
        reservation: OpenReservation<'_>,
    ) -> protocol::Result<ConnectionHandle> {
        debug_assert_eq!(reservation.name(), device.name);

        let connection = host
            .open_device(&device.name)
            .ok_or_else(|| BridgeError::OpenFailed {
                name: device.name.clone(),
            })?;

        let descriptor = connection.file_descriptor();
        if descriptor < 0 {
            warn!(
                "Device {} opened with invalid descriptor {}",
                device.name, descriptor
            );
            connection.close();
            return Err(BridgeError::InvalidHandle {
                name: device.name.clone(),
                descriptor,
            });
        }

        let handle = ConnectionHandle(descriptor);
        let endpoints = device
            .interface(self.transfer_interface)
            .map(|interface| interface.endpoint_addresses.clone())
            .unwrap_or_default();

        let pump = match TransferPump::spawn(
            handle,
            Arc::clone(&connection),
            endpoints,
            Arc::clone(&self.callbacks),
            self.poll_interval,
        ) {
            Ok(pump) => pump,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };

        let entry = Arc::new(OpenConnection {
            name: device.name.clone(),
            handle,
            connection,
            pump,
        });

        let displaced = self.lock().connections.insert(handle, Arc::clone(&entry));
        if let Some(displaced) = displaced {
            // The OS reused a descriptor we still had mapped
            error!(
                "Descriptor {} reused while {} was registered",
                handle, displaced.name
            );
            if let Err(e) = displaced.shut_down() {
                error!("Failed to shut down displaced connection {}: {}", handle, e);
            }
        }
        drop(reservation);

        info!("Opened {} as connection {}", device.name, handle);
        Ok(handle)
    }

    /// Stop the pump, release the connection and forget the handle
    pub fn close(&self, handle: ConnectionHandle) -> protocol::Result<()> {
        let entry = self
            .lock()
            .connections
            .remove(&handle)
            .ok_or(BridgeError::UnknownHandle(handle))?;

        let result = entry.shut_down();
        info!("Closed connection {} ({})", handle, entry.name);
        result
    }

    /// Look up an open connection
    pub fn lookup(&self, handle: ConnectionHandle) -> protocol::Result<Arc<OpenConnection>> {
        self.lock()
            .connections
            .get(&handle)
            .cloned()
            .ok_or(BridgeError::UnknownHandle(handle))
    }

    /// Close every connection, returning the failures
    pub fn close_all(&self) -> Vec<BridgeError> {
        let entries: Vec<_> = self
            .lock()
            .connections
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        if !entries.is_empty() {
            debug!("Closing {} open connections", entries.len());
        }

        entries
            .into_iter()
            .filter_map(|entry| entry.shut_down().err())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of all open connections, sorted
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self.lock().connections.keys().copied().collect();
        handles.sort();
        handles
    }
}
