//! Host event channel between the OS callback path and the bridge
//!
//! The host OS reports permission decisions and hotplug notices on its own
//! callback thread. Instead of registering ambient listeners, the host
//! backend is handed a [`HostEventSender`] when the bridge subscribes, and the
//! bridge drains the matching [`HostEventReceiver`] on a dedicated thread.
//! Closing the channel ends the subscription.

use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use tracing::debug;

/// Notifications delivered by the host OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The OS reported a permission decision for a device
    PermissionDecision {
        /// OS device name the decision applies to
        name: String,
        /// Whether access was granted
        granted: bool,
    },

    /// A device was attached
    DeviceAttached {
        /// OS device name
        name: String,
    },

    /// A device was detached
    DeviceDetached {
        /// OS device name
        name: String,
    },
}

/// Sending half, owned by the host backend (OS callback side)
#[derive(Debug, Clone)]
pub struct HostEventSender {
    tx: Sender<HostEvent>,
}

impl HostEventSender {
    /// Post an event without blocking
    ///
    /// The channel is unbounded, so this only fails once the bridge has
    /// closed its subscription.
    pub fn send(&self, event: HostEvent) -> crate::Result<()> {
        self.tx.try_send(event).map_err(|e| {
            debug!("Dropping host event, subscription closed: {:?}", e.into_inner());
            crate::Error::Channel("host event channel closed".to_string())
        })
    }

    /// Close the channel; the receiving side drains what is left and stops
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    /// Check whether the subscription has ended
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, drained by the bridge's event thread
#[derive(Debug, Clone)]
pub struct HostEventReceiver {
    rx: Receiver<HostEvent>,
}

impl HostEventReceiver {
    /// Receive the next event (blocking)
    ///
    /// Returns an error once the channel is closed and empty.
    pub fn recv(&self) -> crate::Result<HostEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<HostEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Close the channel from the receiving side
    pub fn close(&self) -> bool {
        self.rx.close()
    }
}

/// Create the host event channel
///
/// Returns (HostEventSender for the host backend, HostEventReceiver for the bridge)
pub fn create_event_channel() -> (HostEventSender, HostEventReceiver) {
    let (tx, rx) = unbounded();

    (HostEventSender { tx }, HostEventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (tx, rx) = create_event_channel();

        tx.send(HostEvent::DeviceAttached {
            name: "a".to_string(),
        })
        .unwrap();
        tx.send(HostEvent::PermissionDecision {
            name: "a".to_string(),
            granted: true,
        })
        .unwrap();

        assert_eq!(
            rx.recv().unwrap(),
            HostEvent::DeviceAttached {
                name: "a".to_string()
            }
        );
        assert!(matches!(
            rx.recv().unwrap(),
            HostEvent::PermissionDecision { granted: true, .. }
        ));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let (tx, rx) = create_event_channel();

        let handle = std::thread::spawn(move || rx.recv().is_err());

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(tx.close());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (tx, rx) = create_event_channel();
        rx.close();

        assert!(tx.is_closed());
        assert!(
            tx.send(HostEvent::DeviceDetached {
                name: "a".to_string()
            })
            .is_err()
        );
    }

    #[test]
    fn test_send_after_close_reports_channel_error() {
        let (tx, _rx) = create_event_channel();
        tx.close();

        let err = tx
            .send(HostEvent::DeviceAttached {
                name: "a".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, crate::Error::Channel(_)));
        assert!(err.to_string().contains("closed"));
    }
}
