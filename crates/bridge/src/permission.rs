//! Permission negotiation
//!
//! The host grants access to a device asynchronously: the bridge asks, the
//! OS prompts, and the decision shows up later on the host event thread.
//! [`PermissionBroker::acquire`] turns that into a blocking call.
//!
//! Each requester registers a one-shot [`PermissionWaiter`] under the
//! device name before the prompt is issued, so a fast decision cannot be
//! lost. A decision wakes only the waiters registered for that device.
//! Dropping a waiter's sender without a value is how waits are interrupted.

use crate::host::UsbHost;
use protocol::{BridgeError, DeviceDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Outcome of a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied,
}

#[derive(Default)]
struct WaiterTable {
    next_id: u64,
    by_name: HashMap<String, Vec<(u64, oneshot::Sender<Decision>)>>,
    closed: bool,
}

impl WaiterTable {
    fn remove(&mut self, name: &str, id: u64) {
        if let Some(waiters) = self.by_name.get_mut(name) {
            waiters.retain(|(waiter_id, _)| *waiter_id != id);
            if waiters.is_empty() {
                self.by_name.remove(name);
            }
        }
    }
}

fn lock(table: &Mutex<WaiterTable>) -> MutexGuard<'_, WaiterTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One pending permission request
///
/// Deregisters itself when dropped, whether or not a decision arrived.
pub struct PermissionWaiter {
    id: u64,
    name: String,
    receiver: oneshot::Receiver<Decision>,
    table: Arc<Mutex<WaiterTable>>,
}

impl PermissionWaiter {
    /// Block until a decision arrives; None if the wait was interrupted
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(mut self) -> Option<Decision> {
        let receiver = std::mem::replace(&mut self.receiver, oneshot::channel().1);
        receiver.blocking_recv().ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PermissionWaiter {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.name, self.id);
    }
}

/// Routes permission decisions to the threads waiting for them
#[derive(Clone, Default)]
pub struct PermissionBroker {
    table: Arc<Mutex<WaiterTable>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the process may open `device`, prompting if needed
    ///
    /// Returns immediately when the OS already holds a grant. Otherwise
    /// blocks the calling thread until the decision or an interruption.
    pub fn acquire(&self, host: &dyn UsbHost, device: &DeviceDescriptor) -> protocol::Result<()> {
        if host.has_permission(&device.name) {
            debug!("Permission for {} already granted", device.name);
            return Ok(());
        }

        let waiter = self.register(&device.name);

        info!(
            "Requesting permission for {} ({})",
            device.name,
            device.identity()
        );
        host.request_permission(&device.name);

        match waiter.wait() {
            Some(Decision::Granted) => {
                info!("Permission granted for {}", device.name);
                Ok(())
            }
            Some(Decision::Denied) => {
                warn!("Permission denied for {}", device.name);
                Err(BridgeError::PermissionDenied {
                    name: device.name.clone(),
                    identity: device.identity(),
                })
            }
            None => {
                debug!("Permission wait for {} interrupted", device.name);
                Err(BridgeError::PermissionInterrupted {
                    name: device.name.clone(),
                })
            }
        }
    }

    /// Register a waiter for `name`
    ///
    /// After [`close`](Self::close) the waiter is born interrupted.
    pub fn register(&self, name: &str) -> PermissionWaiter {
        let (sender, receiver) = oneshot::channel();
        let mut table = lock(&self.table);

        let id = table.next_id;
        table.next_id += 1;

        if !table.closed {
            table
                .by_name
                .entry(name.to_string())
                .or_default()
                .push((id, sender));
        }

        PermissionWaiter {
            id,
            name: name.to_string(),
            receiver,
            table: Arc::clone(&self.table),
        }
    }

    /// Deliver a decision to every waiter registered for `name`
    ///
    /// Returns the number of waiters woken. Decisions nobody waits for are
    /// dropped.
    pub fn deliver(&self, name: &str, granted: bool) -> usize {
        let waiters = lock(&self.table).by_name.remove(name).unwrap_or_default();

        if waiters.is_empty() {
            debug!("Dropping unsolicited permission decision for {}", name);
            return 0;
        }

        let decision = if granted {
            Decision::Granted
        } else {
            Decision::Denied
        };

        waiters
            .into_iter()
            .filter_map(|(_, sender)| sender.send(decision).ok())
            .count()
    }

    /// Interrupt every wait on `name`
    pub fn interrupt(&self, name: &str) -> usize {
        // Dropping the senders wakes the receivers with an error
        lock(&self.table)
            .by_name
            .remove(name)
            .map(|waiters| waiters.len())
            .unwrap_or(0)
    }

    /// Interrupt every pending wait
    pub fn interrupt_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.table).by_name.drain().collect();
        let count = drained.iter().map(|(_, waiters)| waiters.len()).sum();
        if count > 0 {
            debug!("Interrupted {} permission waits", count);
        }
        count
    }

    /// Interrupt everything and refuse new waits
    pub fn close(&self) -> usize {
        lock(&self.table).closed = true;
        self.interrupt_all()
    }

    /// Number of registered waiters
    pub fn pending(&self) -> usize {
        lock(&self.table).by_name.values().map(Vec::len).sum()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        lock(&self.table).by_name.contains_key(name)
    }
}
