//! Callbacks the native daemon implements

use crate::types::TransferCompletion;

/// Outward notifications from the bridge to the native daemon
///
/// Completions are delivered from the pump thread of the owning connection,
/// hotplug notices from the host event thread. Implementations must return
/// quickly; blocking here stalls the thread that called in.
pub trait BridgeCallbacks: Send + Sync {
    /// A submitted transfer finished, failed, or was cancelled
    fn on_transfer_completed(&self, completion: TransferCompletion);

    /// A device was attached or detached; the daemon should re-enumerate
    fn on_hotplug_event(&self);
}
