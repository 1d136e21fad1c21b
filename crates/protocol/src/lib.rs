//! Contract between the USB bridge and the native daemon
//!
//! This crate defines the types the daemon sees when it talks to the bridge:
//! device descriptors from enumeration, connection and request handles, the
//! completion record, the error taxonomy, and the callback trait the daemon
//! implements to receive completions and hotplug notices.
//!
//! # Example
//!
//! ```
//! use protocol::{BusIdentity, DeviceDescriptor, InterfaceDescriptor};
//!
//! let device = DeviceDescriptor {
//!     name: "/dev/bus/usb/001/002".to_string(),
//!     bus_number: 1,
//!     device_address: 2,
//!     vendor_id: 0x1234,
//!     product_id: 0x5678,
//!     interfaces: vec![InterfaceDescriptor::new(vec![0x81, 0x02])],
//! };
//!
//! assert_eq!(device.identity(), BusIdentity::new(1, 2));
//! ```

pub mod callbacks;
pub mod error;
pub mod types;

pub use callbacks::BridgeCallbacks;
pub use error::{BridgeError, Result};
pub use types::{
    BusIdentity, CompletionStatus, ConnectionHandle, DeviceDescriptor, ENDPOINT_DIR_IN,
    InterfaceDescriptor, RequestId, TransferCompletion, TransferToken, is_in_endpoint,
};
