//! Host OS seam
//!
//! The bridge never talks to the USB stack directly. Everything it needs from
//! the host OS goes through two traits:
//!
//! - [`UsbHost`]: device list, permission state and prompts, opening devices,
//!   and the event subscription that carries permission decisions and hotplug
//!   notices back as [`common::HostEvent`]s.
//! - [`HostConnection`]: one opened device. Interface claims, control reads,
//!   and the asynchronous request API (initialize, queue, wait, cancel,
//!   close) the transfer pump is built on.
//!
//! Two backends are provided: [`libusb::LibusbHost`] drives real hardware
//! through `rusb`, and [`mock::MockHost`] is a scriptable in-memory host for
//! tests.

pub mod libusb;
pub mod mock;

pub use libusb::LibusbHost;
pub use mock::{MockConnection, MockHost, mock_device};

use crate::pump::PendingRequest;
use common::HostEventSender;
use protocol::CompletionStatus;
use std::sync::Arc;
use std::time::Duration;

/// One interface as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    /// Endpoint addresses in OS order, or None if the OS could not report them
    pub endpoint_addresses: Option<Vec<u8>>,
}

impl HostInterface {
    pub fn new(endpoint_addresses: Vec<u8>) -> Self {
        Self {
            endpoint_addresses: Some(endpoint_addresses),
        }
    }

    /// Interface whose endpoint data is unavailable
    pub fn unavailable() -> Self {
        Self {
            endpoint_addresses: None,
        }
    }
}

/// Raw device record as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    /// OS device name, unique among attached devices
    pub name: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Interfaces in OS order, or None if the configuration is unavailable
    pub interfaces: Option<Vec<HostInterface>>,
}

/// Host-assigned number of an initialized request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostRequestId(pub u64);

/// A request the OS reports as finished
#[derive(Debug)]
pub struct HostCompletion {
    /// Which request finished
    pub request: HostRequestId,
    /// Correlation data queued with the request, handed back
    pub pending: PendingRequest,
    /// Final status
    pub status: CompletionStatus,
    /// Bytes transferred (meaningful for `Completed`)
    pub bytes_transferred: usize,
}

/// Result of one wait on a connection's completion source
#[derive(Debug)]
pub enum WaitOutcome {
    /// A request finished
    Completed(HostCompletion),
    /// The OS returned without a usable request
    Null,
    /// Nothing finished within the wait interval
    TimedOut,
}

/// Host operating system USB service
pub trait UsbHost: Send + Sync {
    /// Snapshot of the currently attached devices in OS order
    fn device_list(&self) -> Vec<HostDevice>;

    /// Whether the OS has already granted access to the device
    fn has_permission(&self, name: &str) -> bool;

    /// Ask the OS to prompt for access
    ///
    /// Returns immediately. The decision arrives later as a
    /// [`common::HostEvent::PermissionDecision`] on the subscribed channel.
    fn request_permission(&self, name: &str);

    /// Open a device the process has access to
    fn open_device(&self, name: &str) -> Option<Arc<dyn HostConnection>>;

    /// Start delivering permission and hotplug events to `events`
    fn subscribe(&self, events: HostEventSender);

    /// Stop delivering events
    fn unsubscribe(&self);
}

/// One open OS-level USB connection
pub trait HostConnection: Send + Sync {
    /// OS descriptor backing this connection (negative if unusable)
    fn file_descriptor(&self) -> i32;

    /// Claim an interface, detaching a kernel driver first if `force` is set
    fn claim_interface(&self, interface: u8, force: bool) -> bool;

    /// Release a claimed interface
    fn release_interface(&self, interface: u8) -> bool;

    /// Run an IN control transfer, returning the number of bytes read
    fn control_transfer_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Option<usize>;

    /// Initialize a request for an endpoint
    fn initialize_request(&self, endpoint: u8) -> Option<HostRequestId>;

    /// Queue an initialized request; ownership of `pending` is handed back on failure
    fn queue_request(
        &self,
        request: HostRequestId,
        pending: PendingRequest,
    ) -> Result<(), PendingRequest>;

    /// Wait up to `timeout` for the next finished request
    fn request_wait(&self, timeout: Duration) -> WaitOutcome;

    /// Ask the OS to cancel an in-flight request
    fn cancel_request(&self, request: HostRequestId) -> bool;

    /// Release an OS request object
    fn close_request(&self, request: HostRequestId);

    /// Release the connection
    fn close(&self);
}
