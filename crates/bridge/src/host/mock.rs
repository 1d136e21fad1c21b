//! Scriptable in-memory host
//!
//! [`MockHost`] plays the OS side of the bridge without hardware. Tests add
//! devices, decide permission prompts, make opens fail, and drive the
//! completion queue of each [`MockConnection`] by hand.

use super::{
    HostCompletion, HostConnection, HostDevice, HostInterface, HostRequestId, UsbHost,
    WaitOutcome,
};
use crate::pump::PendingRequest;
use common::{HostEvent, HostEventSender};
use protocol::CompletionStatus;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// First descriptor number handed out by [`MockHost::open_device`]
const FIRST_DESCRIPTOR: i32 = 3;

/// Build a [`HostDevice`] with the given interface endpoint lists
pub fn mock_device(name: &str, vendor_id: u16, product_id: u16, interfaces: &[&[u8]]) -> HostDevice {
    HostDevice {
        name: name.to_string(),
        vendor_id,
        product_id,
        interfaces: Some(
            interfaces
                .iter()
                .map(|endpoints| HostInterface::new(endpoints.to_vec()))
                .collect(),
        ),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MockHostState {
    devices: Vec<HostDevice>,
    granted: HashSet<String>,
    permission_requests: Vec<String>,
    auto_decision: Option<bool>,
    open_failures: HashSet<String>,
    invalid_descriptors: HashSet<String>,
    next_descriptor: i32,
    connections: HashMap<String, Arc<MockConnection>>,
    open_count: usize,
    events: Option<HostEventSender>,
}

/// In-memory [`UsbHost`]
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockHostState>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device without announcing it
    pub fn add_device(&self, device: HostDevice) {
        lock(&self.state).devices.push(device);
    }

    /// Add a device and post a `DeviceAttached` event
    pub fn attach(&self, device: HostDevice) {
        let name = device.name.clone();
        self.add_device(device);
        self.post(HostEvent::DeviceAttached { name });
    }

    /// Remove a device and post a `DeviceDetached` event
    pub fn detach(&self, name: &str) {
        lock(&self.state).devices.retain(|d| d.name != name);
        self.post(HostEvent::DeviceDetached {
            name: name.to_string(),
        });
    }

    /// Record a grant the OS already holds (no prompt needed)
    pub fn grant(&self, name: &str) {
        lock(&self.state).granted.insert(name.to_string());
    }

    /// Answer a prompt: record the decision and post it as an event
    ///
    /// Returns false if nothing is subscribed.
    pub fn decide(&self, name: &str, granted: bool) -> bool {
        {
            let mut state = lock(&self.state);
            if granted {
                state.granted.insert(name.to_string());
            } else {
                state.granted.remove(name);
            }
        }

        self.post(HostEvent::PermissionDecision {
            name: name.to_string(),
            granted,
        })
    }

    /// Answer every future prompt immediately with `decision`
    pub fn set_auto_decision(&self, decision: Option<bool>) {
        lock(&self.state).auto_decision = decision;
    }

    /// Names passed to `request_permission`, in call order
    pub fn permission_requests(&self) -> Vec<String> {
        lock(&self.state).permission_requests.clone()
    }

    /// Make `open_device` return no connection for `name`
    pub fn set_open_failure(&self, name: &str) {
        lock(&self.state).open_failures.insert(name.to_string());
    }

    /// Make `open_device` return a connection with a negative descriptor
    pub fn set_invalid_descriptor(&self, name: &str) {
        lock(&self.state).invalid_descriptors.insert(name.to_string());
    }

    /// Make the next `open_device` hand out `descriptor`, as an OS reusing a number would
    pub fn set_next_descriptor(&self, descriptor: i32) {
        lock(&self.state).next_descriptor = descriptor;
    }

    /// Most recent connection opened for `name`
    pub fn connection(&self, name: &str) -> Option<Arc<MockConnection>> {
        lock(&self.state).connections.get(name).cloned()
    }

    /// Number of successful `open_device` calls
    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.state).events.is_some()
    }

    fn post(&self, event: HostEvent) -> bool {
        let sender = lock(&self.state).events.clone();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => {
                debug!("Mock host dropped {:?}: not subscribed", event);
                false
            }
        }
    }
}

impl UsbHost for MockHost {
    fn device_list(&self) -> Vec<HostDevice> {
        lock(&self.state).devices.clone()
    }

    fn has_permission(&self, name: &str) -> bool {
        lock(&self.state).granted.contains(name)
    }

    fn request_permission(&self, name: &str) {
        let decision = {
            let mut state = lock(&self.state);
            state.permission_requests.push(name.to_string());
            state.auto_decision
        };

        if let Some(granted) = decision {
            self.decide(name, granted);
        }
    }

    fn open_device(&self, name: &str) -> Option<Arc<dyn HostConnection>> {
        let mut state = lock(&self.state);

        if !state.granted.contains(name) || state.open_failures.contains(name) {
            return None;
        }

        let descriptor = if state.invalid_descriptors.contains(name) {
            -1
        } else {
            let next = state.next_descriptor.max(FIRST_DESCRIPTOR);
            state.next_descriptor = next + 1;
            next
        };

        let connection = Arc::new(MockConnection::new(descriptor));
        state.connections.insert(name.to_string(), Arc::clone(&connection));
        state.open_count += 1;

        Some(connection)
    }

    fn subscribe(&self, events: HostEventSender) {
        lock(&self.state).events = Some(events);
    }

    fn unsubscribe(&self) {
        lock(&self.state).events = None;
    }
}

/// Entry on a mock connection's completion queue
enum MockEvent {
    Finished(HostCompletion),
    Null,
}

struct MockConnectionState {
    next_request: u64,
    initialized: HashMap<HostRequestId, u8>,
    queued: VecDeque<(HostRequestId, PendingRequest)>,
    events: VecDeque<MockEvent>,
    released: Vec<HostRequestId>,
    claimed: HashSet<u8>,
    string_descriptors: HashMap<(u8, u16), Vec<u8>>,
    fail_initialize: bool,
    fail_queue: bool,
    closed: bool,
}

/// In-memory [`HostConnection`] whose completions are driven by the test
pub struct MockConnection {
    descriptor: i32,
    state: Mutex<MockConnectionState>,
    ready: Condvar,
}

impl MockConnection {
    pub fn new(descriptor: i32) -> Self {
        Self {
            descriptor,
            state: Mutex::new(MockConnectionState {
                next_request: 1,
                initialized: HashMap::new(),
                queued: VecDeque::new(),
                events: VecDeque::new(),
                released: Vec::new(),
                claimed: HashSet::new(),
                string_descriptors: HashMap::new(),
                fail_initialize: false,
                fail_queue: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Finish the oldest queued request, copying `data` into its buffer
    pub fn complete_next(&self, data: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let Some((request, mut pending)) = state.queued.pop_front() else {
            return false;
        };

        let len = data.len().min(pending.buffer().len());
        pending.buffer_mut()[..len].copy_from_slice(&data[..len]);

        state.events.push_back(MockEvent::Finished(HostCompletion {
            request,
            pending,
            status: CompletionStatus::Completed,
            bytes_transferred: len,
        }));
        self.ready.notify_all();
        true
    }

    /// Finish the oldest queued request with a non-success status
    pub fn fail_next(&self, status: CompletionStatus) -> bool {
        let mut state = lock(&self.state);
        let Some((request, pending)) = state.queued.pop_front() else {
            return false;
        };

        state.events.push_back(MockEvent::Finished(HostCompletion {
            request,
            pending,
            status,
            bytes_transferred: 0,
        }));
        self.ready.notify_all();
        true
    }

    /// Make the next wait return without a request
    pub fn inject_null(&self) {
        lock(&self.state).events.push_back(MockEvent::Null);
        self.ready.notify_all();
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.state).queued.len()
    }

    /// Requests initialized but not yet queued or released
    pub fn initialized_count(&self) -> usize {
        lock(&self.state).initialized.len()
    }

    /// Requests passed to `close_request`, in call order
    pub fn released_requests(&self) -> Vec<HostRequestId> {
        lock(&self.state).released.clone()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        let mut claimed: Vec<u8> = lock(&self.state).claimed.iter().copied().collect();
        claimed.sort_unstable();
        claimed
    }

    pub fn set_fail_initialize(&self, fail: bool) {
        lock(&self.state).fail_initialize = fail;
    }

    pub fn set_fail_queue(&self, fail: bool) {
        lock(&self.state).fail_queue = fail;
    }

    /// Raw bytes returned for string descriptor `index` in `language_id`
    pub fn set_string_descriptor(&self, index: u8, language_id: u16, raw: Vec<u8>) {
        lock(&self.state)
            .string_descriptors
            .insert((index, language_id), raw);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl HostConnection for MockConnection {
    fn file_descriptor(&self) -> i32 {
        self.descriptor
    }

    fn claim_interface(&self, interface: u8, _force: bool) -> bool {
        let mut state = lock(&self.state);
        !state.closed && state.claimed.insert(interface)
    }

    fn release_interface(&self, interface: u8) -> bool {
        lock(&self.state).claimed.remove(&interface)
    }

    fn control_transfer_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Option<usize> {
        let state = lock(&self.state);

        // Only GET_DESCRIPTOR(STRING) is modelled
        if state.closed || request_type != 0x80 || request != 0x06 || value >> 8 != 0x03 {
            return None;
        }

        let raw = state
            .string_descriptors
            .get(&((value & 0xFF) as u8, index))?;
        let len = raw.len().min(buffer.len());
        buffer[..len].copy_from_slice(&raw[..len]);
        Some(len)
    }

    fn initialize_request(&self, endpoint: u8) -> Option<HostRequestId> {
        let mut state = lock(&self.state);
        if state.fail_initialize || state.closed {
            return None;
        }

        let request = HostRequestId(state.next_request);
        state.next_request += 1;
        state.initialized.insert(request, endpoint);
        Some(request)
    }

    fn queue_request(
        &self,
        request: HostRequestId,
        pending: PendingRequest,
    ) -> Result<(), PendingRequest> {
        let mut state = lock(&self.state);
        if state.fail_queue || state.closed || !state.initialized.contains_key(&request) {
            return Err(pending);
        }

        state.initialized.remove(&request);
        state.queued.push_back((request, pending));
        Ok(())
    }

    fn request_wait(&self, timeout: Duration) -> WaitOutcome {
        let state = lock(&self.state);
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.events.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match state.events.pop_front() {
            Some(MockEvent::Finished(completion)) => WaitOutcome::Completed(completion),
            Some(MockEvent::Null) => WaitOutcome::Null,
            None => WaitOutcome::TimedOut,
        }
    }

    fn cancel_request(&self, request: HostRequestId) -> bool {
        let mut state = lock(&self.state);
        let Some(position) = state.queued.iter().position(|(id, _)| *id == request) else {
            return false;
        };

        if let Some((request, pending)) = state.queued.remove(position) {
            state.events.push_back(MockEvent::Finished(HostCompletion {
                request,
                pending,
                status: CompletionStatus::Cancelled,
                bytes_transferred: 0,
            }));
            self.ready.notify_all();
        }
        true
    }

    fn close_request(&self, request: HostRequestId) {
        let mut state = lock(&self.state);
        state.initialized.remove(&request);
        state.released.push(request);
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        trace!(
            "Closing mock connection {} with {} requests in flight",
            self.descriptor,
            state.queued.len()
        );
        state.closed = true;
        state.queued.clear();
        state.claimed.clear();
        self.ready.notify_all();
    }
}
