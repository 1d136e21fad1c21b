//! Daemon main loop hosting
//!
//! The native daemon runs its main loop on a dedicated thread with access
//! to the bridge. [`DaemonService`] starts that thread at most once at a
//! time and stops it by asking the daemon to return, then joining.

use crate::bridge::UsbBridge;
use protocol::BridgeError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// A daemon main loop
pub trait Daemon: Send + Sync + 'static {
    /// Run until interrupted
    fn run(&self, bridge: Arc<UsbBridge>);

    /// Ask `run` to return; called from another thread
    fn interrupt(&self);
}

/// Hosts a [`Daemon`] on its own thread
pub struct DaemonService {
    bridge: Arc<UsbBridge>,
    daemon: Arc<dyn Daemon>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonService {
    pub fn new(bridge: Arc<UsbBridge>, daemon: Arc<dyn Daemon>) -> Self {
        Self {
            bridge,
            daemon,
            thread: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the daemon thread unless it is already running
    ///
    /// Returns false if a running thread was found.
    pub fn start(&self) -> protocol::Result<bool> {
        let mut thread = self.lock();

        if thread.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Daemon thread already running");
            return Ok(false);
        }

        // Reap a thread that returned on its own
        if let Some(finished) = thread.take()
            && finished.join().is_err()
        {
            error!("Daemon thread panicked");
        }

        let bridge = Arc::clone(&self.bridge);
        let daemon = Arc::clone(&self.daemon);

        let handle = std::thread::Builder::new()
            .name("usb-daemon".to_string())
            .spawn(move || {
                info!("Daemon thread started");
                daemon.run(bridge);
                info!("Daemon thread exited");
            })
            .map_err(|source| BridgeError::ThreadSpawn {
                name: "usb-daemon".to_string(),
                source,
            })?;

        *thread = Some(handle);
        Ok(true)
    }

    /// Interrupt the daemon and wait for its thread
    ///
    /// The join is unbounded, and skipped when called from the daemon
    /// thread itself. Returns false if no thread was running.
    pub fn stop(&self) -> bool {
        let Some(thread) = self.lock().take() else {
            return false;
        };

        self.daemon.interrupt();

        if thread.thread().id() == std::thread::current().id() {
            debug!("Daemon stopped from its own thread");
            return true;
        }

        if thread.join().is_err() {
            error!("Daemon thread panicked");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DaemonService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::host::{MockHost, UsbHost};
    use crate::identity::IdentityTable;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, RecordingCallbacks, wait_until};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};

    #[derive(Default)]
    struct BlockingDaemon {
        runs: AtomicUsize,
        stopped: Mutex<bool>,
        wake: Condvar,
    }

    impl Daemon for BlockingDaemon {
        fn run(&self, _bridge: Arc<UsbBridge>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let stopped = self.stopped.lock().unwrap();
            let mut stopped = self.wake.wait_while(stopped, |s| !*s).unwrap();
            *stopped = false;
        }

        fn interrupt(&self) {
            *self.stopped.lock().unwrap() = true;
            self.wake.notify_all();
        }
    }

    fn bridge() -> Arc<UsbBridge> {
        Arc::new(
            UsbBridge::start(
                Arc::new(MockHost::new()) as Arc<dyn UsbHost>,
                Arc::new(RecordingCallbacks::new()),
                &BridgeConfig::default(),
                Arc::new(IdentityTable::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_start_is_idempotent() {
        let bridge = bridge();
        let daemon = Arc::new(BlockingDaemon::default());
        let service = DaemonService::new(Arc::clone(&bridge), daemon.clone());

        assert!(service.start().unwrap());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || daemon.runs.load(Ordering::SeqCst) == 1));
        assert!(!service.start().unwrap());
        assert!(service.is_running());

        assert!(service.stop());
        assert!(!service.is_running());
        assert!(!service.stop());
        assert_eq!(daemon.runs.load(Ordering::SeqCst), 1);

        bridge.shutdown();
    }

    #[test]
    fn test_restart_after_stop() {
        let bridge = bridge();
        let daemon = Arc::new(BlockingDaemon::default());
        let service = DaemonService::new(Arc::clone(&bridge), daemon.clone());

        assert!(service.start().unwrap());
        assert!(service.stop());
        assert!(service.start().unwrap());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || daemon.runs.load(Ordering::SeqCst) == 2));
        assert!(service.stop());

        bridge.shutdown();
    }
}
