//! Host event dispatch
//!
//! Drains the host event channel on a dedicated thread. Permission
//! decisions go to the [`PermissionBroker`]; attach and detach notices are
//! forwarded to the native consumer as a bare hotplug signal, which it
//! answers by enumerating again.

use crate::identity::IdentityAllocator;
use crate::permission::PermissionBroker;
use common::{HostEvent, HostEventReceiver};
use protocol::{BridgeCallbacks, BridgeError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Thread that routes host events
pub struct HostEventDispatcher {
    events: HostEventReceiver,
    thread: Option<JoinHandle<()>>,
}

impl HostEventDispatcher {
    /// Start draining `events`
    pub fn spawn(
        events: HostEventReceiver,
        broker: PermissionBroker,
        allocator: IdentityAllocator,
        callbacks: Arc<dyn BridgeCallbacks>,
    ) -> protocol::Result<Self> {
        let router = EventRouter {
            broker,
            allocator,
            callbacks,
        };
        let receiver = events.clone();

        let thread = std::thread::Builder::new()
            .name("usb-host-events".to_string())
            .spawn(move || {
                debug!("Host event dispatcher started");
                while let Ok(event) = receiver.recv() {
                    router.route(event);
                }
                debug!("Host event dispatcher stopped");
            })
            .map_err(|source| BridgeError::ThreadSpawn {
                name: "usb-host-events".to_string(),
                source,
            })?;

        Ok(Self {
            events,
            thread: Some(thread),
        })
    }

    /// Close the channel and wait for the thread to drain it
    ///
    /// From the dispatcher thread itself (a hotplug callback shutting the
    /// bridge down) the channel is closed without joining.
    pub fn stop(&mut self) {
        self.events.close();

        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.thread().id() == std::thread::current().id() {
            debug!("Host event dispatcher stopped from its own thread");
            return;
        }

        if thread.join().is_err() {
            error!("Host event dispatcher panicked");
        }
    }
}

impl Drop for HostEventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventRouter {
    broker: PermissionBroker,
    allocator: IdentityAllocator,
    callbacks: Arc<dyn BridgeCallbacks>,
}

impl EventRouter {
    fn route(&self, event: HostEvent) {
        match event {
            HostEvent::PermissionDecision { name, granted } => {
                let woken = self.broker.deliver(&name, granted);
                debug!(
                    "Permission decision for {} (granted: {}) woke {} waiters",
                    name, granted, woken
                );
            }
            HostEvent::DeviceAttached { name } => {
                let identity = self.allocator.resolve(&name);
                info!("Device attached: {} ({})", name, identity);
                self.notify_hotplug();
            }
            HostEvent::DeviceDetached { name } => {
                let identity = self.allocator.resolve(&name);
                info!("Device detached: {} ({})", name, identity);
                self.notify_hotplug();
            }
        }
    }

    fn notify_hotplug(&self) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.callbacks.on_hotplug_event()
        }));

        if let Err(e) = result {
            error!("Panic in hotplug callback: {:?}", e);
        }
    }
}
