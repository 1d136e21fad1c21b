//! Test utilities for the USB bridge
//!
//! Provides descriptor builders, a recording implementation of
//! [`BridgeCallbacks`], and wait helpers for tests that cross thread
//! boundaries.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_descriptor;
//!
//! let device = create_mock_descriptor("/dev/bus/usb/001/002", 0x1234, 0x5678, &[&[0x81, 0x02]]);
//! assert_eq!(device.bus_number, 1);
//! assert_eq!(device.interfaces[0].endpoint_addresses, vec![0x81, 0x02]);
//! ```

use protocol::{BridgeCallbacks, DeviceDescriptor, InterfaceDescriptor, TransferCompletion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a DeviceDescriptor for testing
///
/// Bus number and device address are parsed from `/dev/bus/usb/BBB/DDD`
/// names and left at zero otherwise.
pub fn create_mock_descriptor(
    name: &str,
    vendor_id: u16,
    product_id: u16,
    interfaces: &[&[u8]],
) -> DeviceDescriptor {
    let (bus_number, device_address) = name
        .strip_prefix("/dev/bus/usb/")
        .and_then(|rest| rest.split_once('/'))
        .and_then(|(bus, addr)| Some((bus.parse().ok()?, addr.parse().ok()?)))
        .unwrap_or((0, 0));

    DeviceDescriptor {
        name: name.to_string(),
        bus_number,
        device_address,
        vendor_id,
        product_id,
        interfaces: interfaces
            .iter()
            .map(|endpoints| InterfaceDescriptor::new(endpoints.to_vec()))
            .collect(),
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Callback sink that records everything the bridge delivers
#[derive(Default)]
pub struct RecordingCallbacks {
    completions: Mutex<Vec<TransferCompletion>>,
    delivered: Condvar,
    hotplugs: AtomicUsize,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all completions delivered so far
    pub fn completions(&self) -> Vec<TransferCompletion> {
        self.completions
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Number of completions delivered so far
    pub fn completion_count(&self) -> usize {
        self.completions.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Block until at least `count` completions arrived
    pub fn wait_for_completions(&self, count: usize, timeout: Duration) -> bool {
        let Ok(guard) = self.completions.lock() else {
            return false;
        };
        match self
            .delivered
            .wait_timeout_while(guard, timeout, |c| c.len() < count)
        {
            Ok((guard, _)) => guard.len() >= count,
            Err(_) => false,
        }
    }

    /// Number of hotplug notices delivered so far
    pub fn hotplug_count(&self) -> usize {
        self.hotplugs.load(Ordering::SeqCst)
    }
}

impl BridgeCallbacks for RecordingCallbacks {
    fn on_transfer_completed(&self, completion: TransferCompletion) {
        if let Ok(mut completions) = self.completions.lock() {
            completions.push(completion);
        }
        self.delivered.notify_all();
    }

    fn on_hotplug_event(&self) {
        self.hotplugs.fetch_add(1, Ordering::SeqCst);
    }
}
