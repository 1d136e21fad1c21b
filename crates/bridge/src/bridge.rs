//! The bridge facade
//!
//! [`UsbBridge`] is the one object the native daemon talks to. It wires the
//! identity allocator, enumerator, permission broker, connection registry
//! and host event dispatcher together over a [`UsbHost`] backend.
//!
//! `open` blocks while the OS asks for permission, so it must be called
//! from a plain thread, not from inside an async runtime.

use crate::config::BridgeConfig;
use crate::enumerator::DeviceEnumerator;
use crate::events::HostEventDispatcher;
use crate::host::UsbHost;
use crate::identity::{IdentityAllocator, IdentityTable};
use crate::permission::PermissionBroker;
use crate::registry::ConnectionRegistry;
use crate::strings;
use common::create_event_channel;
use protocol::{
    BridgeCallbacks, BridgeError, ConnectionHandle, DeviceDescriptor, RequestId, TransferToken,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Entry point for the native daemon
pub struct UsbBridge {
    host: Arc<dyn UsbHost>,
    enumerator: DeviceEnumerator,
    broker: PermissionBroker,
    registry: ConnectionRegistry,
    dispatcher: Mutex<Option<HostEventDispatcher>>,
    control_timeout: Duration,
    shut_down: AtomicBool,
}

impl UsbBridge {
    /// Start the bridge on `host`
    ///
    /// Subscribes to host events for the lifetime of the bridge. `identities`
    /// is the process-wide identity table; pass the same table to every
    /// bridge started in the process so identities stay stable.
    pub fn start(
        host: Arc<dyn UsbHost>,
        callbacks: Arc<dyn BridgeCallbacks>,
        config: &BridgeConfig,
        identities: Arc<IdentityTable>,
    ) -> protocol::Result<Self> {
        let allocator = IdentityAllocator::new(identities, config.usb.bus_path_prefix.clone());
        let enumerator = DeviceEnumerator::new(allocator.clone(), config.device_filters());
        let broker = PermissionBroker::new();
        let registry = ConnectionRegistry::new(
            Arc::clone(&callbacks),
            config.poll_interval(),
            usize::from(config.usb.transfer_interface),
        );

        let (events_tx, events_rx) = create_event_channel();
        let dispatcher = HostEventDispatcher::spawn(events_rx, broker.clone(), allocator, callbacks)?;
        host.subscribe(events_tx);

        info!("USB bridge started");

        Ok(Self {
            host,
            enumerator,
            broker,
            registry,
            dispatcher: Mutex::new(Some(dispatcher)),
            control_timeout: config.control_timeout(),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> protocol::Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BridgeError::BridgeShutDown);
        }
        Ok(())
    }

    /// Snapshot the attached devices
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.enumerator.list(self.host.as_ref())
    }

    /// Open `device`, asking the OS for permission first if needed
    ///
    /// Blocks until the OS decides. Fails with `AlreadyOpen` while the same
    /// device is open or being opened by another caller.
    pub fn open(&self, device: &DeviceDescriptor) -> protocol::Result<ConnectionHandle> {
        self.ensure_running()?;

        let reservation = self.registry.reserve(&device.name)?;
        self.broker.acquire(self.host.as_ref(), device)?;

        // Shutdown may have raced the permission prompt
        self.ensure_running()?;

        self.registry.open(self.host.as_ref(), device, reservation)
    }

    /// Close a connection, stopping its pump first
    pub fn close(&self, handle: ConnectionHandle) -> protocol::Result<()> {
        self.registry.close(handle)
    }

    /// Raw string descriptor read; None if the handle is unknown or the read fails
    pub fn get_string_descriptor(
        &self,
        handle: ConnectionHandle,
        index: u8,
        language_id: u16,
        length: usize,
    ) -> Option<Vec<u8>> {
        let entry = self.registry.lookup(handle).ok()?;
        strings::get_string_descriptor(
            entry.connection().as_ref(),
            index,
            language_id,
            length,
            self.control_timeout,
        )
    }

    /// String descriptor decoded to ASCII in the device's first language
    pub fn read_string_ascii(&self, handle: ConnectionHandle, index: u8) -> protocol::Result<String> {
        let entry = self.registry.lookup(handle)?;
        strings::read_string_ascii(entry.connection().as_ref(), index, self.control_timeout)
    }

    /// Claim an interface, detaching any kernel driver
    pub fn claim_interface(&self, handle: ConnectionHandle, interface: u8) -> bool {
        match self.registry.lookup(handle) {
            Ok(entry) => entry.connection().claim_interface(interface, true),
            Err(e) => {
                debug!("Cannot claim interface {}: {}", interface, e);
                false
            }
        }
    }

    pub fn release_interface(&self, handle: ConnectionHandle, interface: u8) -> bool {
        match self.registry.lookup(handle) {
            Ok(entry) => entry.connection().release_interface(interface),
            Err(e) => {
                debug!("Cannot release interface {}: {}", interface, e);
                false
            }
        }
    }

    /// Queue an asynchronous transfer
    ///
    /// The outcome arrives later through `on_transfer_completed`, carrying
    /// `token` and the buffer.
    pub fn submit(
        &self,
        handle: ConnectionHandle,
        endpoint: u8,
        buffer: Vec<u8>,
        token: TransferToken,
    ) -> protocol::Result<RequestId> {
        self.ensure_running()?;
        self.registry.lookup(handle)?.pump().submit(endpoint, buffer, token)
    }

    /// Best-effort cancellation of an in-flight request
    pub fn cancel(&self, request: RequestId) {
        match self.registry.lookup(request.handle) {
            Ok(entry) => {
                entry.pump().cancel(request);
            }
            Err(_) => debug!("Cancel of {} ignored: connection is closed", request),
        }
    }

    /// Interrupt every thread blocked in `open` waiting for permission
    pub fn interrupt_permission_requests(&self) -> usize {
        self.broker.interrupt_all()
    }

    /// Handles of all open connections
    pub fn open_handles(&self) -> Vec<ConnectionHandle> {
        self.registry.handles()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the bridge
    ///
    /// Interrupts pending permission waits, ends the host event
    /// subscription, and closes every open connection. Later calls do
    /// nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down USB bridge");

        let interrupted = self.broker.close();
        if interrupted > 0 {
            debug!("Interrupted {} permission waits", interrupted);
        }

        self.host.unsubscribe();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }

        for e in self.registry.close_all() {
            error!("Error closing connection during shutdown: {}", e);
        }

        info!("USB bridge stopped");
    }
}

impl Drop for UsbBridge {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            warn!("USB bridge dropped without shutdown");
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockHost, mock_device};
    use common::test_utils::RecordingCallbacks;

    fn start(host: &Arc<MockHost>) -> UsbBridge {
        UsbBridge::start(
            Arc::clone(host) as Arc<dyn UsbHost>,
            Arc::new(RecordingCallbacks::new()),
            &BridgeConfig::default(),
            Arc::new(IdentityTable::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_subscription_follows_lifecycle() {
        let host = Arc::new(MockHost::new());
        let bridge = start(&host);
        assert!(host.is_subscribed());

        bridge.shutdown();
        assert!(!host.is_subscribed());
        assert!(bridge.is_shut_down());

        // Idempotent
        bridge.shutdown();
    }

    #[test]
    fn test_operations_after_shutdown() {
        let host = Arc::new(MockHost::new());
        host.add_device(mock_device("dev-a", 1, 2, &[&[0x81]]));
        host.grant("dev-a");
        let bridge = start(&host);

        let device = bridge.enumerate().remove(0);
        let handle = bridge.open(&device).unwrap();

        bridge.shutdown();

        assert!(host.connection("dev-a").unwrap().is_closed());
        assert!(bridge.open_handles().is_empty());
        assert!(matches!(bridge.open(&device), Err(BridgeError::BridgeShutDown)));
        assert!(matches!(
            bridge.submit(handle, 0x81, vec![0; 4], TransferToken(1)),
            Err(BridgeError::BridgeShutDown)
        ));
        assert!(matches!(bridge.close(handle), Err(BridgeError::UnknownHandle(_))));
    }

    #[test]
    fn test_unknown_handle_paths() {
        let host = Arc::new(MockHost::new());
        let bridge = start(&host);
        let handle = ConnectionHandle(42);

        assert!(bridge.get_string_descriptor(handle, 1, 0x0409, 255).is_none());
        assert!(!bridge.claim_interface(handle, 0));
        assert!(!bridge.release_interface(handle, 0));
        assert!(matches!(
            bridge.read_string_ascii(handle, 1),
            Err(BridgeError::UnknownHandle(_))
        ));
        assert!(matches!(
            bridge.submit(handle, 0x81, vec![], TransferToken(0)),
            Err(BridgeError::UnknownHandle(_))
        ));
        bridge.cancel(RequestId { handle, request: 1 });

        bridge.shutdown();
    }

    #[test]
    fn test_claim_and_release() {
        let host = Arc::new(MockHost::new());
        host.add_device(mock_device("dev-a", 1, 2, &[&[0x81], &[0x82]]));
        host.grant("dev-a");
        let bridge = start(&host);

        let device = bridge.enumerate().remove(0);
        let handle = bridge.open(&device).unwrap();

        assert!(bridge.claim_interface(handle, 1));
        assert_eq!(host.connection("dev-a").unwrap().claimed_interfaces(), vec![1]);
        assert!(bridge.release_interface(handle, 1));
        assert!(!bridge.release_interface(handle, 1));

        bridge.close(handle).unwrap();
        bridge.shutdown();
    }
}
