//! Device enumeration
//!
//! Snapshots the host's device list into bridge-owned [`DeviceDescriptor`]s.
//! A device whose configuration or endpoint data the OS cannot report is
//! left out entirely rather than described partially.

use crate::host::{HostDevice, UsbHost};
use crate::identity::IdentityAllocator;
use protocol::{DeviceDescriptor, InterfaceDescriptor};
use std::str::FromStr;
use tracing::{debug, trace};

/// VID:PID match pattern, `None` meaning wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Parse `0xVID:0xPID`, where either side may be `*`
    ///
    /// Returns None for anything else; use `str::parse` for the reason.
    pub fn parse(filter: &str) -> Option<Self> {
        filter.parse().ok()
    }

    /// Check whether a VID/PID pair matches this filter
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

impl FromStr for DeviceFilter {
    type Err = String;

    fn from_str(filter: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = filter.split(':').collect();
        let &[vid, pid] = parts.as_slice() else {
            return Err(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x16d0:0x063d' or '0x16d0:*')",
                filter
            ));
        };

        Ok(Self {
            vendor_id: parse_id(vid, "VID")?,
            product_id: parse_id(pid, "PID")?,
        })
    }
}

/// `*` parses to None, a hex id to Some(id)
fn parse_id(part: &str, name: &str) -> Result<Option<u16>, String> {
    if part == "*" {
        return Ok(None);
    }

    let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) else {
        return Err(format!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x16d0')",
            name, part
        ));
    };

    if hex.is_empty() || hex.len() > 4 {
        return Err(format!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name, part
        ));
    }

    u16::from_str_radix(hex, 16)
        .map(Some)
        .map_err(|_| format!("Invalid {} '{}', not a valid hex number", name, part))
}

/// Check a VID/PID pair against a filter list (empty list allows everything)
pub fn check_filters(vendor_id: u16, product_id: u16, filters: &[DeviceFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
}

/// Builds device snapshots from the host's device list
#[derive(Debug, Clone)]
pub struct DeviceEnumerator {
    allocator: IdentityAllocator,
    filters: Vec<DeviceFilter>,
}

impl DeviceEnumerator {
    pub fn new(allocator: IdentityAllocator, filters: Vec<DeviceFilter>) -> Self {
        Self { allocator, filters }
    }

    pub fn allocator(&self) -> &IdentityAllocator {
        &self.allocator
    }

    /// Snapshot the attached devices in OS order
    pub fn list(&self, host: &dyn UsbHost) -> Vec<DeviceDescriptor> {
        let devices: Vec<DeviceDescriptor> = host
            .device_list()
            .into_iter()
            .filter_map(|device| self.describe(device))
            .collect();

        debug!("Enumerated {} devices", devices.len());
        devices
    }

    fn describe(&self, device: HostDevice) -> Option<DeviceDescriptor> {
        if !check_filters(device.vendor_id, device.product_id, &self.filters) {
            trace!(
                "Device ignored by filter: {}, vid={:#06x}, pid={:#06x}",
                device.name, device.vendor_id, device.product_id
            );
            return None;
        }

        let Some(host_interfaces) = device.interfaces else {
            debug!("Omitting {}: configuration unavailable", device.name);
            return None;
        };

        let mut interfaces = Vec::with_capacity(host_interfaces.len());
        for (index, interface) in host_interfaces.into_iter().enumerate() {
            let Some(endpoints) = interface.endpoint_addresses else {
                debug!(
                    "Omitting {}: endpoints of interface {} unavailable",
                    device.name, index
                );
                return None;
            };
            interfaces.push(InterfaceDescriptor::new(endpoints));
        }

        let identity = self.allocator.resolve(&device.name);

        Some(DeviceDescriptor {
            name: device.name,
            bus_number: identity.bus_number,
            device_address: identity.device_address,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            interfaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostInterface, MockHost, mock_device};
    use crate::identity::IdentityTable;
    use protocol::BusIdentity;
    use std::sync::Arc;

    fn enumerator(filters: Vec<DeviceFilter>) -> DeviceEnumerator {
        DeviceEnumerator::new(
            IdentityAllocator::with_default_prefix(Arc::new(IdentityTable::new())),
            filters,
        )
    }

    #[test]
    fn test_filter_logic() {
        let filters: Vec<DeviceFilter> = ["0x1234:0x5678", "0xabcd:*"]
            .iter()
            .map(|f| DeviceFilter::parse(f).unwrap())
            .collect();

        assert!(check_filters(0x1234, 0x5678, &filters));
        assert!(!check_filters(0x1234, 0x0000, &filters));
        assert!(check_filters(0xabcd, 0x0001, &filters));
        assert!(!check_filters(0x0001, 0x0001, &filters));
        assert!(check_filters(0x0001, 0x0001, &[]));

        let any = DeviceFilter::parse("*:*").unwrap();
        assert!(any.matches(0xffff, 0));
    }

    #[test]
    fn test_filter_parse_reports_reason() {
        let err = "16d0:063d".parse::<DeviceFilter>().unwrap_err();
        assert!(err.contains("VID '16d0'"));

        let err = "0x16d0:0xZZ".parse::<DeviceFilter>().unwrap_err();
        assert!(err.contains("PID '0xZZ'"));

        let err = "0x1:0x2:0x3".parse::<DeviceFilter>().unwrap_err();
        assert!(err.contains("expected VID:PID"));
    }

    #[test]
    fn test_filter_parse_rejects_malformed() {
        assert!(DeviceFilter::parse("1234:5678").is_none());
        assert!(DeviceFilter::parse("0x1234").is_none());
        assert!(DeviceFilter::parse("0x12345:0x1").is_none());
        assert!(DeviceFilter::parse("0x:0x1").is_none());
        assert_eq!(
            DeviceFilter::parse("0X16D0:*"),
            Some(DeviceFilter {
                vendor_id: Some(0x16d0),
                product_id: None
            })
        );
    }

    #[test]
    fn test_list_preserves_os_order_and_data() {
        let host = MockHost::new();
        host.add_device(mock_device("/dev/bus/usb/001/004", 0x16d0, 0x063d, &[&[0x84, 0x05]]));
        host.add_device(mock_device("android-usb-7", 0x16d0, 0x09e5, &[&[0x81], &[0x82, 0x03]]));

        let devices = enumerator(Vec::new()).list(&host);

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "/dev/bus/usb/001/004");
        assert_eq!(devices[0].identity(), BusIdentity::new(1, 4));
        assert_eq!(devices[0].interfaces[0].endpoint_addresses, vec![0x84, 0x05]);

        assert_eq!(devices[1].identity(), BusIdentity::new(0, 0));
        assert_eq!(devices[1].vendor_id, 0x16d0);
        assert_eq!(devices[1].product_id, 0x09e5);
        assert_eq!(devices[1].interfaces.len(), 2);
        assert_eq!(devices[1].interfaces[1].endpoint_addresses, vec![0x82, 0x03]);
    }

    #[test]
    fn test_incomplete_devices_are_omitted() {
        let host = MockHost::new();
        host.add_device(HostDevice {
            name: "no-config".to_string(),
            vendor_id: 1,
            product_id: 1,
            interfaces: None,
        });
        host.add_device(HostDevice {
            name: "no-endpoints".to_string(),
            vendor_id: 1,
            product_id: 2,
            interfaces: Some(vec![HostInterface::new(vec![0x81]), HostInterface::unavailable()]),
        });
        host.add_device(mock_device("complete", 1, 3, &[]));

        let devices = enumerator(Vec::new()).list(&host);

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "complete");
        assert!(devices[0].interfaces.is_empty());
    }

    #[test]
    fn test_repeated_enumeration_is_stable() {
        let host = MockHost::new();
        host.add_device(mock_device("usb-a", 1, 1, &[&[0x81]]));
        host.add_device(mock_device("usb-b", 2, 2, &[&[0x82]]));

        let enumerator = enumerator(Vec::new());
        let first = enumerator.list(&host);
        let second = enumerator.list(&host);

        assert_eq!(first, second);
        assert_ne!(first[0].identity(), first[1].identity());
    }

    #[test]
    fn test_filtered_devices_consume_no_identity() {
        let host = MockHost::new();
        host.add_device(mock_device("other", 0x1111, 0x2222, &[]));
        host.add_device(mock_device("wanted", 0x16d0, 0x063d, &[]));

        let enumerator = enumerator(vec![DeviceFilter::parse("0x16d0:*").unwrap()]);
        let devices = enumerator.list(&host);

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "wanted");
        assert_eq!(enumerator.allocator().table().len(), 1);
    }
}
