//! Bridge error types

use crate::types::{BusIdentity, ConnectionHandle};
use thiserror::Error;

/// Errors returned synchronously to the native consumer
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The OS (or the user) refused access to the device
    #[error("Permission denied for device {name} ({identity})")]
    PermissionDenied { name: String, identity: BusIdentity },

    /// The permission wait was abandoned before a decision arrived
    #[error("Permission request for device {name} was interrupted")]
    PermissionInterrupted { name: String },

    /// The OS returned no connection object
    #[error("Could not open device {name}")]
    OpenFailed { name: String },

    /// The OS returned a connection without a usable descriptor
    #[error("Device {name} opened with invalid descriptor {descriptor}")]
    InvalidHandle { name: String, descriptor: i32 },

    /// The device is already open or an open attempt is in progress
    #[error("Device {name} is already open")]
    AlreadyOpen { name: String },

    /// No open connection is registered under this handle
    #[error("Unknown connection handle {0}")]
    UnknownHandle(ConnectionHandle),

    /// The endpoint does not exist on the transfer interface
    #[error("Endpoint {endpoint:#04x} not found on connection {handle}")]
    EndpointNotFound {
        handle: ConnectionHandle,
        endpoint: u8,
    },

    /// The OS refused to initialize a request for the endpoint
    #[error("Could not initialize request for endpoint {endpoint:#04x}")]
    RequestInitFailed { endpoint: u8 },

    /// The OS refused to queue the request
    #[error("Could not queue request for endpoint {endpoint:#04x}")]
    RequestQueueFailed { endpoint: u8 },

    /// The transfer pump thread could not be joined
    #[error("Transfer pump for connection {0} could not be joined")]
    PumpJoinFailed(ConnectionHandle),

    /// A worker thread could not be spawned
    #[error("Could not spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A string descriptor could not be read or decoded
    #[error("String descriptor {index} unavailable: {reason}")]
    StringDescriptor { index: u8, reason: String },

    /// The bridge has been shut down
    #[error("Bridge is shut down")]
    BridgeShutDown,
}

/// Type alias for bridge results
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_includes_identity() {
        let err = BridgeError::PermissionDenied {
            name: "/dev/bus/usb/001/002".to_string(),
            identity: BusIdentity::new(1, 2),
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/bus/usb/001/002"));
        assert!(msg.contains("001:002"));
    }

    #[test]
    fn test_endpoint_error_display() {
        let err = BridgeError::EndpointNotFound {
            handle: ConnectionHandle(7),
            endpoint: 0x83,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0x83"));
        assert!(msg.contains("#7"));
    }
}
