//! Bridge-facing USB type definitions
//!
//! This module defines the types exchanged between the bridge and the native
//! daemon: device snapshots produced by enumeration, the opaque handles used
//! to address open connections and in-flight requests, and the completion
//! record delivered when a transfer finishes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Endpoint direction bit (set for device-to-host endpoints)
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Bus number and device address pair identifying a device
///
/// Either parsed from the OS device path or synthesized by the bridge when
/// the OS does not expose one. Packs into 16 bits as `bus << 8 | address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusIdentity {
    /// USB bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
}

impl BusIdentity {
    pub const fn new(bus_number: u8, device_address: u8) -> Self {
        Self {
            bus_number,
            device_address,
        }
    }

    /// Split a packed 16-bit value into bus (high byte) and address (low byte)
    pub const fn from_packed(value: u16) -> Self {
        Self {
            bus_number: (value >> 8) as u8,
            device_address: (value & 0xFF) as u8,
        }
    }

    /// Pack into a 16-bit value
    pub const fn packed(&self) -> u16 {
        ((self.bus_number as u16) << 8) | self.device_address as u16
    }
}

impl fmt::Display for BusIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus_number, self.device_address)
    }
}

/// One USB interface as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Endpoint addresses in OS-reported order
    pub endpoint_addresses: Vec<u8>,
}

impl InterfaceDescriptor {
    pub fn new(endpoint_addresses: Vec<u8>) -> Self {
        Self { endpoint_addresses }
    }

    /// Check whether this interface exposes the given endpoint address
    pub fn has_endpoint(&self, endpoint: u8) -> bool {
        self.endpoint_addresses.contains(&endpoint)
    }
}

/// Immutable device snapshot produced by one enumeration pass
///
/// A descriptor is never updated after construction. The next enumeration
/// produces fresh descriptors that supersede it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// OS device path or identifier, unique per attached device
    pub name: String,
    /// USB bus number (real or synthesized)
    pub bus_number: u8,
    /// USB device address (real or synthesized)
    pub device_address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Interfaces in OS-reported order
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptor {
    /// Bus identity of this device
    pub fn identity(&self) -> BusIdentity {
        BusIdentity::new(self.bus_number, self.device_address)
    }

    /// Look up an interface by index
    pub fn interface(&self, index: usize) -> Option<&InterfaceDescriptor> {
        self.interfaces.get(index)
    }
}

/// Opaque handle for an open connection
///
/// Carries the OS descriptor number of the underlying connection. Only
/// meaningful while the connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub i32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of one in-flight transfer request
///
/// Includes the connection handle so a request can be cancelled without the
/// caller naming the connection separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    /// Connection the request was submitted on
    pub handle: ConnectionHandle,
    /// Host-assigned request number
    pub request: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.handle, self.request)
    }
}

/// Opaque caller-supplied token echoed back on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferToken(pub u64);

/// Final state of a transfer as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Transfer finished; `bytes_transferred` is valid
    Completed,
    /// Transfer was cancelled before it finished
    Cancelled,
    /// Device disappeared while the transfer was in flight
    NoDevice,
    /// Transfer failed for another reason (stall, overflow, I/O error)
    Failed,
}

/// Completion record delivered to the native consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    /// Token supplied at submission
    pub token: TransferToken,
    /// Endpoint the transfer ran on
    pub endpoint: u8,
    /// Number of bytes transferred (0 unless `status` is `Completed`)
    pub bytes_transferred: usize,
    /// Final transfer status
    pub status: CompletionStatus,
    /// Buffer handed back to the caller; IN data occupies the first
    /// `bytes_transferred` bytes
    pub buffer: Vec<u8>,
}

impl TransferCompletion {
    /// Data actually transferred
    pub fn data(&self) -> &[u8] {
        let len = self.bytes_transferred.min(self.buffer.len());
        &self.buffer[..len]
    }
}

/// Check whether an endpoint address is device-to-host
pub const fn is_in_endpoint(endpoint: u8) -> bool {
    endpoint & ENDPOINT_DIR_IN != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_identity_packing() {
        let identity = BusIdentity::from_packed(0x0102);
        assert_eq!(identity.bus_number, 1);
        assert_eq!(identity.device_address, 2);
        assert_eq!(identity.packed(), 0x0102);

        assert_eq!(BusIdentity::from_packed(0xFFFF), BusIdentity::new(255, 255));
        assert_eq!(BusIdentity::from_packed(0), BusIdentity::new(0, 0));
    }

    #[test]
    fn test_bus_identity_display() {
        assert_eq!(BusIdentity::new(1, 2).to_string(), "001:002");
    }

    #[test]
    fn test_endpoint_direction() {
        assert!(is_in_endpoint(0x81));
        assert!(!is_in_endpoint(0x02));
    }

    #[test]
    fn test_completion_data_is_clamped() {
        let completion = TransferCompletion {
            token: TransferToken(1),
            endpoint: 0x81,
            bytes_transferred: 3,
            status: CompletionStatus::Completed,
            buffer: vec![1, 2, 3, 4],
        };
        assert_eq!(completion.data(), &[1, 2, 3]);

        let short = TransferCompletion {
            bytes_transferred: 10,
            buffer: vec![9],
            ..completion
        };
        assert_eq!(short.data(), &[9]);
    }

    #[test]
    fn test_descriptor_interface_lookup() {
        let device = DeviceDescriptor {
            name: "/dev/bus/usb/001/002".to_string(),
            bus_number: 1,
            device_address: 2,
            vendor_id: 0x1234,
            product_id: 0x5678,
            interfaces: vec![InterfaceDescriptor::new(vec![0x81, 0x02])],
        };

        assert_eq!(device.identity(), BusIdentity::new(1, 2));
        assert!(device.interface(0).unwrap().has_endpoint(0x81));
        assert!(!device.interface(0).unwrap().has_endpoint(0x83));
        assert!(device.interface(1).is_none());
    }

    #[test]
    fn test_descriptor_serializes_to_json() {
        let device = DeviceDescriptor {
            name: "usb-a".to_string(),
            bus_number: 0,
            device_address: 3,
            vendor_id: 0x16d0,
            product_id: 0x063d,
            interfaces: vec![],
        };
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"vendor_id\":5840"));
    }
}
