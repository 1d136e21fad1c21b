//! Per-connection transfer pump
//!
//! Every open connection gets one pump thread. The thread waits on the
//! connection's completion source and hands each finished request back to
//! the native consumer through [`BridgeCallbacks::on_transfer_completed`],
//! in the order the OS reports them.
//!
//! The correlation data for a request ([`PendingRequest`]) travels with the
//! OS request and comes back in the completion, so the pump keeps no map of
//! its own. The wait is bounded by a poll interval so the stop flag set by
//! `close` is observed without interrupting the thread.

use crate::host::{HostCompletion, HostConnection, HostRequestId, WaitOutcome};
use protocol::{
    BridgeCallbacks, BridgeError, CompletionStatus, ConnectionHandle, RequestId,
    TransferCompletion, TransferToken,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// One in-flight transfer: destination buffer, caller token and endpoint
#[derive(Debug)]
pub struct PendingRequest {
    endpoint: u8,
    token: TransferToken,
    buffer: Vec<u8>,
}

impl PendingRequest {
    pub(crate) fn new(endpoint: u8, token: TransferToken, buffer: Vec<u8>) -> Self {
        Self {
            endpoint,
            token,
            buffer,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn token(&self) -> TransferToken {
        self.token
    }

    /// Data to send (OUT) or space to receive into (IN)
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn into_parts(self) -> (u8, TransferToken, Vec<u8>) {
        (self.endpoint, self.token, self.buffer)
    }
}

/// Transfer pump for one open connection
pub struct TransferPump {
    handle: ConnectionHandle,
    connection: Arc<dyn HostConnection>,
    /// Endpoint addresses of the transfer interface
    endpoints: Vec<u8>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransferPump {
    /// Spawn the pump thread for `connection`
    ///
    /// `endpoints` are the endpoint addresses `submit` accepts.
    pub fn spawn(
        handle: ConnectionHandle,
        connection: Arc<dyn HostConnection>,
        endpoints: Vec<u8>,
        callbacks: Arc<dyn BridgeCallbacks>,
        poll_interval: Duration,
    ) -> protocol::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let name = format!("usb-pump-{}", handle.0);

        let worker = PumpWorker {
            handle,
            connection: Arc::clone(&connection),
            callbacks,
            stop: Arc::clone(&stop),
            poll_interval,
        };

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())
            .map_err(|source| BridgeError::ThreadSpawn { name, source })?;

        debug!(
            "Spawned transfer pump for connection {} (endpoints {:02x?})",
            handle, endpoints
        );

        Ok(Self {
            handle,
            connection,
            endpoints,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Queue an asynchronous transfer on `endpoint`
    ///
    /// The endpoint must belong to the transfer interface. Nothing reaches
    /// the OS when it does not. A request the OS initialized but refused to
    /// queue is released before the error is returned.
    pub fn submit(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        token: TransferToken,
    ) -> protocol::Result<RequestId> {
        if !self.endpoints.contains(&endpoint) {
            return Err(BridgeError::EndpointNotFound {
                handle: self.handle,
                endpoint,
            });
        }

        let request = self
            .connection
            .initialize_request(endpoint)
            .ok_or(BridgeError::RequestInitFailed { endpoint })?;

        let pending = PendingRequest::new(endpoint, token, buffer);
        let length = pending.buffer().len();

        if self.connection.queue_request(request, pending).is_err() {
            self.connection.close_request(request);
            return Err(BridgeError::RequestQueueFailed { endpoint });
        }

        trace!(
            "Queued request {} on connection {}: endpoint={:#04x}, length={}",
            request.0, self.handle, endpoint, length
        );

        Ok(RequestId {
            handle: self.handle,
            request: request.0,
        })
    }

    /// Best-effort cancellation; the pump delivers the outcome
    pub fn cancel(&self, request: RequestId) -> bool {
        let cancelled = self.connection.cancel_request(HostRequestId(request.request));
        if !cancelled {
            debug!("Cancel of request {} was not accepted", request);
        }
        cancelled
    }

    /// Signal the pump to stop and wait for the thread to exit
    ///
    /// Returns once the thread has exited; later calls return immediately.
    /// Called from the pump thread itself (a consumer closing from inside
    /// its completion callback) the join is skipped and the thread exits
    /// when the callback returns.
    pub fn stop_and_join(&self) -> protocol::Result<()> {
        self.stop.store(true, Ordering::Release);

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(thread) = thread else {
            return Ok(());
        };

        if thread.thread().id() == std::thread::current().id() {
            debug!(
                "Transfer pump for connection {} stopped from its own thread",
                self.handle
            );
            return Ok(());
        }

        thread.join().map_err(|_| {
            error!("Transfer pump for connection {} panicked", self.handle);
            BridgeError::PumpJoinFailed(self.handle)
        })
    }
}

impl Drop for TransferPump {
    fn drop(&mut self) {
        let _ = self.stop_and_join();
    }
}

/// State moved onto the pump thread
struct PumpWorker {
    handle: ConnectionHandle,
    connection: Arc<dyn HostConnection>,
    callbacks: Arc<dyn BridgeCallbacks>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl PumpWorker {
    fn run(self) {
        info!("Transfer pump for connection {} started", self.handle);

        while !self.stop.load(Ordering::Acquire) {
            match self.connection.request_wait(self.poll_interval) {
                WaitOutcome::Completed(completion) => self.deliver(completion),
                WaitOutcome::Null => {
                    warn!(
                        "Connection {} returned a null request, continuing",
                        self.handle
                    );
                }
                WaitOutcome::TimedOut => {}
            }
        }

        info!("Transfer pump for connection {} stopped", self.handle);
    }

    fn deliver(&self, completion: HostCompletion) {
        let HostCompletion {
            request,
            pending,
            status,
            bytes_transferred,
        } = completion;
        let (endpoint, token, buffer) = pending.into_parts();

        let bytes_transferred = match status {
            CompletionStatus::Completed => bytes_transferred.min(buffer.len()),
            _ => 0,
        };

        trace!(
            "Request {} on connection {} finished: {:?}, {} bytes",
            request.0, self.handle, status, bytes_transferred
        );

        let record = TransferCompletion {
            token,
            endpoint,
            bytes_transferred,
            status,
            buffer,
        };

        // A panicking consumer must not take the pump down with it
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.callbacks.on_transfer_completed(record)
        }));

        if let Err(e) = result {
            error!(
                "Panic in completion callback on connection {}: {:?}",
                self.handle, e
            );
        }

        self.connection.close_request(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockConnection;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, RecordingCallbacks, wait_until};
    use std::sync::{OnceLock, Weak};

    const POLL: Duration = Duration::from_millis(10);

    fn spawn_pump(
        connection: &Arc<MockConnection>,
        callbacks: Arc<dyn BridgeCallbacks>,
    ) -> TransferPump {
        TransferPump::spawn(
            ConnectionHandle(connection.descriptor()),
            Arc::clone(connection) as Arc<dyn HostConnection>,
            vec![0x81, 0x02],
            callbacks,
            POLL,
        )
        .unwrap()
    }

    struct PanickingCallbacks {
        inner: RecordingCallbacks,
    }

    impl BridgeCallbacks for PanickingCallbacks {
        fn on_transfer_completed(&self, completion: TransferCompletion) {
            let first = completion.token == TransferToken(1);
            self.inner.on_transfer_completed(completion);
            if first {
                panic!("consumer failure");
            }
        }

        fn on_hotplug_event(&self) {}
    }

    /// Stops its own pump from inside the first completion
    struct StoppingCallbacks {
        pump: OnceLock<Weak<TransferPump>>,
        stopped: Mutex<Option<protocol::Result<()>>>,
        inner: RecordingCallbacks,
    }

    impl BridgeCallbacks for StoppingCallbacks {
        fn on_transfer_completed(&self, completion: TransferCompletion) {
            self.inner.on_transfer_completed(completion);
            if let Some(pump) = self.pump.get().and_then(Weak::upgrade) {
                *self.stopped.lock().unwrap() = Some(pump.stop_and_join());
            }
        }

        fn on_hotplug_event(&self) {}
    }

    #[test]
    fn test_completion_delivered_with_token() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks.clone());

        let id = pump
            .submit(0x81, vec![0; 64], TransferToken(7))
            .unwrap();
        assert_eq!(id.handle, ConnectionHandle(5));
        assert_eq!(connection.queued_count(), 1);

        assert!(connection.complete_next(&[0xAB; 64]));
        assert!(callbacks.wait_for_completions(1, DEFAULT_TEST_TIMEOUT));

        let completion = &callbacks.completions()[0];
        assert_eq!(completion.token, TransferToken(7));
        assert_eq!(completion.bytes_transferred, 64);
        assert_eq!(completion.status, CompletionStatus::Completed);
        assert_eq!(completion.data(), &[0xAB; 64][..]);

        // The OS request is released after delivery
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || connection
            .released_requests()
            .contains(&HostRequestId(id.request))));

        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_completions_delivered_in_os_order() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks.clone());

        for token in 1..=3 {
            pump.submit(0x81, vec![0; 8], TransferToken(token)).unwrap();
        }
        for _ in 0..3 {
            assert!(connection.complete_next(&[1, 2]));
        }

        assert!(callbacks.wait_for_completions(3, DEFAULT_TEST_TIMEOUT));
        let tokens: Vec<_> = callbacks.completions().iter().map(|c| c.token).collect();
        assert_eq!(
            tokens,
            vec![TransferToken(1), TransferToken(2), TransferToken(3)]
        );

        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_unknown_endpoint_queues_nothing() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks);

        let err = pump.submit(0x83, vec![0; 8], TransferToken(1)).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::EndpointNotFound { endpoint: 0x83, .. }
        ));
        assert_eq!(connection.queued_count(), 0);
        assert_eq!(connection.initialized_count(), 0);

        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_init_and_queue_failures() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks);

        connection.set_fail_initialize(true);
        let err = pump.submit(0x81, vec![0; 8], TransferToken(1)).unwrap_err();
        assert!(matches!(err, BridgeError::RequestInitFailed { endpoint: 0x81 }));

        connection.set_fail_initialize(false);
        connection.set_fail_queue(true);
        let err = pump.submit(0x02, vec![0; 8], TransferToken(2)).unwrap_err();
        assert!(matches!(err, BridgeError::RequestQueueFailed { endpoint: 0x02 }));

        // The initialized request was released
        assert_eq!(connection.released_requests().len(), 1);
        assert_eq!(connection.queued_count(), 0);

        // The pump keeps running after submit failures
        connection.set_fail_queue(false);
        pump.submit(0x81, vec![0; 8], TransferToken(3)).unwrap();
        assert_eq!(connection.queued_count(), 1);

        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_null_completion_is_skipped() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks.clone());

        pump.submit(0x81, vec![0; 4], TransferToken(1)).unwrap();
        connection.inject_null();
        assert!(connection.complete_next(&[9]));

        assert!(callbacks.wait_for_completions(1, DEFAULT_TEST_TIMEOUT));
        assert_eq!(callbacks.completion_count(), 1);

        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_cancel_delivers_cancelled_status() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks.clone());

        let id = pump.submit(0x81, vec![0; 16], TransferToken(4)).unwrap();
        assert!(pump.cancel(id));

        assert!(callbacks.wait_for_completions(1, DEFAULT_TEST_TIMEOUT));
        let completion = &callbacks.completions()[0];
        assert_eq!(completion.token, TransferToken(4));
        assert_eq!(completion.status, CompletionStatus::Cancelled);
        assert_eq!(completion.bytes_transferred, 0);

        // Second cancel finds nothing in flight
        assert!(!pump.cancel(id));

        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_stop_pump() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(PanickingCallbacks {
            inner: RecordingCallbacks::new(),
        });
        let pump = spawn_pump(&connection, callbacks.clone());

        pump.submit(0x81, vec![0; 4], TransferToken(1)).unwrap();
        pump.submit(0x81, vec![0; 4], TransferToken(2)).unwrap();
        assert!(connection.complete_next(&[1]));
        assert!(connection.complete_next(&[2]));

        assert!(callbacks.inner.wait_for_completions(2, DEFAULT_TEST_TIMEOUT));
        assert!(pump.stop_and_join().is_ok());
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let pump = spawn_pump(&connection, callbacks.clone());

        pump.submit(0x81, vec![0; 4], TransferToken(1)).unwrap();
        pump.stop_and_join().unwrap();

        assert!(connection.complete_next(&[1]));
        std::thread::sleep(POLL * 5);
        assert_eq!(callbacks.completion_count(), 0);

        // Joining twice is harmless
        pump.stop_and_join().unwrap();
    }

    #[test]
    fn test_stop_from_completion_callback() {
        let connection = Arc::new(MockConnection::new(5));
        let callbacks = Arc::new(StoppingCallbacks {
            pump: OnceLock::new(),
            stopped: Mutex::new(None),
            inner: RecordingCallbacks::new(),
        });
        let pump = Arc::new(spawn_pump(&connection, callbacks.clone()));
        callbacks.pump.set(Arc::downgrade(&pump)).unwrap();

        pump.submit(0x81, vec![0; 4], TransferToken(1)).unwrap();
        pump.submit(0x81, vec![0; 4], TransferToken(2)).unwrap();
        assert!(connection.complete_next(&[1]));

        // Returns instead of joining its own thread
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || callbacks
            .stopped
            .lock()
            .unwrap()
            .is_some()));
        assert!(matches!(*callbacks.stopped.lock().unwrap(), Some(Ok(()))));

        // The thread exits once the callback returns
        assert!(connection.complete_next(&[2]));
        std::thread::sleep(POLL * 5);
        assert_eq!(callbacks.inner.completion_count(), 1);

        pump.stop_and_join().unwrap();
    }
}
