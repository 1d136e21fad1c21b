//! Stable bus identity assignment
//!
//! Devices normally expose their bus number and device address through their
//! OS path (`/dev/bus/usb/BBB/DDD`). Where the OS hides that path, the bridge
//! synthesizes a pair from an append-only table keyed by device name, so the
//! same device keeps the same identity for the life of the process.
//!
//! The table hands out `len mod 65536`. After 65536 distinct unidentifiable
//! names, identities start to repeat.

use protocol::BusIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default prefix of OS paths that encode bus and address
pub const DEFAULT_BUS_PATH_PREFIX: &str = "/dev/bus/usb/";

/// Number of distinct synthesized identities before wraparound
const IDENTITY_SPACE: usize = 0x1_0000;

/// Process-wide table of synthesized identities
///
/// Append-only; entries are never removed. Shared between the enumerator
/// and the hotplug path through [`IdentityAllocator`].
#[derive(Debug, Default)]
pub struct IdentityTable {
    entries: Mutex<HashMap<String, u16>>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names that have been assigned a synthesized identity
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `name`, allocating the next value if it is new
    fn get_or_allocate(&self, name: &str) -> u16 {
        let mut entries = self.lock();

        if let Some(value) = entries.get(name) {
            return *value;
        }

        let value = (entries.len() % IDENTITY_SPACE) as u16;
        entries.insert(name.to_string(), value);
        debug!("Allocated identity {:#06x} for device {}", value, name);
        value
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u16>> {
        // The table is append-only, so a poisoned guard still holds consistent data
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves device names to bus identities
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    table: Arc<IdentityTable>,
    bus_path_prefix: String,
}

impl IdentityAllocator {
    /// Create an allocator backed by `table`
    pub fn new(table: Arc<IdentityTable>, bus_path_prefix: impl Into<String>) -> Self {
        Self {
            table,
            bus_path_prefix: bus_path_prefix.into(),
        }
    }

    /// Allocator with the default `/dev/bus/usb/` prefix
    pub fn with_default_prefix(table: Arc<IdentityTable>) -> Self {
        Self::new(table, DEFAULT_BUS_PATH_PREFIX)
    }

    /// Resolve `name` to a bus identity
    ///
    /// Real bus paths are parsed. Anything else, including bus paths that
    /// fail to parse, gets a synthesized identity. Never fails.
    pub fn resolve(&self, name: &str) -> BusIdentity {
        if let Some(identity) = self.parse_bus_path(name) {
            return identity;
        }

        BusIdentity::from_packed(self.table.get_or_allocate(name))
    }

    /// The shared identity table
    pub fn table(&self) -> &Arc<IdentityTable> {
        &self.table
    }

    fn parse_bus_path(&self, name: &str) -> Option<BusIdentity> {
        let rest = name.strip_prefix(&self.bus_path_prefix)?;
        let mut parts = rest.split('/');

        let bus = parts.next()?.parse::<u8>().ok()?;
        let address = parts.next()?.parse::<u8>().ok()?;

        if parts.next().is_some() {
            return None;
        }

        Some(BusIdentity::new(bus, address))
    }
}
