//! USB device bridge
//!
//! Mediates between the host OS USB subsystem and a native daemon that
//! cannot open devices itself. The bridge enumerates devices, negotiates
//! access, owns open connections, and pumps asynchronous transfer
//! completions back to the daemon.
//!
//! # Architecture
//!
//! ```text
//! UsbBridge
//!   ├─ DeviceEnumerator ── IdentityAllocator ── IdentityTable
//!   ├─ PermissionBroker  <── HostEventDispatcher <── host event channel
//!   └─ ConnectionRegistry
//!        └─ per connection: HostConnection + TransferPump thread
//! ```
//!
//! The OS is reached only through the [`host::UsbHost`] and
//! [`host::HostConnection`] traits, implemented for libusb and for an
//! in-memory mock.
//!
//! # Example
//!
//! ```
//! use bridge::config::BridgeConfig;
//! use bridge::host::{MockHost, UsbHost, mock_device};
//! use bridge::identity::IdentityTable;
//! use bridge::UsbBridge;
//! use common::test_utils::RecordingCallbacks;
//! use std::sync::Arc;
//!
//! let host = Arc::new(MockHost::new());
//! host.add_device(mock_device("/dev/bus/usb/001/002", 0x16d0, 0x063d, &[&[0x84, 0x05]]));
//! host.grant("/dev/bus/usb/001/002");
//!
//! let bridge = UsbBridge::start(
//!     host.clone() as Arc<dyn UsbHost>,
//!     Arc::new(RecordingCallbacks::new()),
//!     &BridgeConfig::default(),
//!     Arc::new(IdentityTable::new()),
//! )
//! .unwrap();
//!
//! let devices = bridge.enumerate();
//! let handle = bridge.open(&devices[0]).unwrap();
//! bridge.close(handle).unwrap();
//! bridge.shutdown();
//! ```

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod enumerator;
pub mod events;
pub mod host;
pub mod identity;
pub mod permission;
pub mod pump;
pub mod registry;
pub mod strings;

pub use bridge::UsbBridge;
pub use config::BridgeConfig;
pub use daemon::{Daemon, DaemonService};
pub use enumerator::{DeviceEnumerator, DeviceFilter};
pub use identity::{IdentityAllocator, IdentityTable};
pub use permission::PermissionBroker;
pub use registry::ConnectionRegistry;
