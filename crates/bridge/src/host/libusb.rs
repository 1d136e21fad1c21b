//! libusb host backend
//!
//! Drives real hardware through `rusb`. Device names follow the Linux
//! usbfs layout (`/dev/bus/usb/BBB/DDD`), so bus identities come straight
//! from the path.
//!
//! libusb has no permission prompt: access is whatever the process can
//! open, and `request_permission` posts that answer as the decision event
//! right away.
//!
//! The asynchronous request API is built from synchronous transfers. Each
//! endpoint gets a lane thread fed through an `async_channel` that posts
//! finished requests to the connection's completion queue in the order they
//! finish. Cancellation and close are checked between attempts, never in
//! the middle of one. Only an IN request that fits in a single packet is
//! retried after a timeout slice, since nothing can have moved; every other
//! request gets one attempt and a timeout is reported as a failure.

use super::{
    HostCompletion, HostConnection, HostDevice, HostInterface, HostRequestId, UsbHost,
    WaitOutcome,
};
use crate::pump::PendingRequest;
use common::{HostEvent, HostEventSender};
use protocol::{CompletionStatus, is_in_endpoint};
use rusb::{
    Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, TransferType,
    UsbContext,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Timeout of one retryable slice on a lane
const LANE_SLICE: Duration = Duration::from_millis(100);

/// Timeout of a request that cannot be retried
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Event loop timeout for the hotplug thread
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// usbfs-style device name for a bus/address pair
pub fn device_name(bus: u8, address: u8) -> String {
    format!("/dev/bus/usb/{:03}/{:03}", bus, address)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hotplug registration plus the thread pumping libusb events for it
struct HotplugWatcher {
    _registration: Registration<Context>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("USB hotplug thread panicked");
        }
    }
}

/// [`UsbHost`] backed by a libusb context
pub struct LibusbHost {
    context: Context,
    next_descriptor: AtomicI32,
    events: Mutex<Option<HostEventSender>>,
    watcher: Mutex<Option<HotplugWatcher>>,
}

impl LibusbHost {
    /// Create a host over a fresh libusb context
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        info!("libusb context initialized (hotplug: {})", rusb::has_hotplug());

        Ok(Self {
            context,
            next_descriptor: AtomicI32::new(1),
            events: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    fn find_device(&self, name: &str) -> Option<Device<Context>> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to list USB devices: {}", e);
                return None;
            }
        };

        devices
            .iter()
            .find(|device| device_name(device.bus_number(), device.address()) == name)
    }

    fn post(&self, event: HostEvent) {
        let sender = lock(&self.events).clone();
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send(event) {
                    debug!("Host event dropped: {}", e);
                }
            }
            None => debug!("Host event dropped: not subscribed"),
        }
    }

    fn start_watcher(&self, events: HostEventSender) -> Result<HotplugWatcher, rusb::Error> {
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { events }))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let context = self.context.clone();

        let thread = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match context.handle_events(Some(EVENT_TIMEOUT)) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(e) => {
                            warn!("Error handling USB events: {}", e);
                            std::thread::sleep(EVENT_TIMEOUT);
                        }
                    }
                }
            })
            .map_err(|e| {
                error!("Failed to spawn USB hotplug thread: {}", e);
                rusb::Error::Other
            })?;

        Ok(HotplugWatcher {
            _registration: registration,
            stop,
            thread: Some(thread),
        })
    }
}

impl UsbHost for LibusbHost {
    fn device_list(&self) -> Vec<HostDevice> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to list USB devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .iter()
            .filter_map(|device| {
                let name = device_name(device.bus_number(), device.address());
                let descriptor = match device.device_descriptor() {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        debug!("Skipping {}: no device descriptor ({})", name, e);
                        return None;
                    }
                };

                Some(HostDevice {
                    name,
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                    interfaces: read_interfaces(&device),
                })
            })
            .collect()
    }

    fn has_permission(&self, name: &str) -> bool {
        let Some(device) = self.find_device(name) else {
            return false;
        };

        match device.open() {
            Ok(_) => true,
            Err(rusb::Error::Access) => false,
            Err(e) => {
                debug!("Could not check access to {}: {}", name, e);
                false
            }
        }
    }

    fn request_permission(&self, name: &str) {
        let granted = self.has_permission(name);
        debug!("Access to {} resolved as {}", name, granted);
        self.post(HostEvent::PermissionDecision {
            name: name.to_string(),
            granted,
        });
    }

    fn open_device(&self, name: &str) -> Option<Arc<dyn HostConnection>> {
        let device = self.find_device(name)?;

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to open device {}: {}", name, e);
                return None;
            }
        };

        let descriptor = self.next_descriptor.fetch_add(1, Ordering::SeqCst);
        let endpoints = read_endpoint_types(&device);
        debug!(
            "Opened device {} as descriptor {} ({} endpoints)",
            name,
            descriptor,
            endpoints.len()
        );

        Some(Arc::new(LibusbConnection::new(descriptor, handle, endpoints)))
    }

    fn subscribe(&self, events: HostEventSender) {
        *lock(&self.events) = Some(events.clone());

        if !rusb::has_hotplug() {
            warn!("libusb has no hotplug support, device changes will not be reported");
            return;
        }

        match self.start_watcher(events) {
            Ok(watcher) => {
                if let Some(previous) = lock(&self.watcher).replace(watcher) {
                    previous.shutdown();
                }
                debug!("Hot-plug callbacks registered");
            }
            Err(e) => warn!("Failed to register hotplug callback: {}", e),
        }
    }

    fn unsubscribe(&self) {
        *lock(&self.events) = None;

        let watcher = lock(&self.watcher).take();
        if let Some(watcher) = watcher {
            watcher.shutdown();
            debug!("Hot-plug callbacks unregistered");
        }
    }
}

impl Drop for LibusbHost {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Forwards libusb hotplug callbacks onto the host event channel
struct HotplugForwarder {
    events: HostEventSender,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let name = device_name(device.bus_number(), device.address());
        debug!("Hot-plug callback: device arrived ({})", name);
        let _ = self.events.send(HostEvent::DeviceAttached { name });
    }

    fn device_left(&mut self, device: Device<Context>) {
        let name = device_name(device.bus_number(), device.address());
        debug!("Hot-plug callback: device left ({})", name);
        let _ = self.events.send(HostEvent::DeviceDetached { name });
    }
}

/// Interfaces of the active configuration, first alternate setting each
///
/// Falls back to the first configuration when the active one cannot be read
/// (the device is unconfigured or the kernel will not say).
fn read_interfaces(device: &Device<Context>) -> Option<Vec<HostInterface>> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .ok()?;

    let interfaces = config
        .interfaces()
        .map(|interface| match interface.descriptors().next() {
            Some(setting) => HostInterface::new(
                setting
                    .endpoint_descriptors()
                    .map(|endpoint| endpoint.address())
                    .collect(),
            ),
            None => HostInterface::unavailable(),
        })
        .collect();

    Some(interfaces)
}

/// Transfer type and packet size of one endpoint
#[derive(Debug, Clone, Copy)]
struct EndpointInfo {
    transfer_type: TransferType,
    max_packet_size: usize,
}

/// Endpoint info for every endpoint on every interface and setting
fn read_endpoint_types(device: &Device<Context>) -> HashMap<u8, EndpointInfo> {
    let mut endpoints = HashMap::new();

    let Ok(config) = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
    else {
        return endpoints;
    };

    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            for endpoint in setting.endpoint_descriptors() {
                endpoints
                    .entry(endpoint.address())
                    .or_insert(EndpointInfo {
                        transfer_type: endpoint.transfer_type(),
                        max_packet_size: usize::from(endpoint.max_packet_size() & 0x7FF),
                    });
            }
        }
    }

    endpoints
}

/// Request on a lane, with its cancellation flag
struct LaneJob {
    request: HostRequestId,
    pending: PendingRequest,
    cancel: Arc<AtomicBool>,
}

struct Lane {
    jobs: async_channel::Sender<LaneJob>,
    thread: JoinHandle<()>,
}

/// One open libusb device
pub struct LibusbConnection {
    descriptor: i32,
    handle: Arc<RwLock<DeviceHandle<Context>>>,
    endpoints: HashMap<u8, EndpointInfo>,
    next_request: AtomicU64,
    /// Cancellation flag per initialized request, removed on close_request
    requests: Mutex<HashMap<HostRequestId, (u8, Arc<AtomicBool>)>>,
    lanes: Mutex<HashMap<u8, Lane>>,
    finished_tx: mpsc::Sender<HostCompletion>,
    finished_rx: Mutex<mpsc::Receiver<HostCompletion>>,
    closed: Arc<AtomicBool>,
}

impl LibusbConnection {
    fn new(
        descriptor: i32,
        handle: DeviceHandle<Context>,
        endpoints: HashMap<u8, EndpointInfo>,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::channel();

        Self {
            descriptor,
            handle: Arc::new(RwLock::new(handle)),
            endpoints,
            next_request: AtomicU64::new(1),
            requests: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            finished_tx,
            finished_rx: Mutex::new(finished_rx),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_lane(&self, endpoint: u8, info: EndpointInfo) -> std::io::Result<Lane> {
        let (jobs, queue) = async_channel::unbounded::<LaneJob>();
        let handle = Arc::clone(&self.handle);
        let finished = self.finished_tx.clone();
        let closed = Arc::clone(&self.closed);

        let thread = std::thread::Builder::new()
            .name(format!("usb-lane-{}-{:02x}", self.descriptor, endpoint))
            .spawn(move || {
                while let Ok(job) = queue.recv_blocking() {
                    let completion = run_transfer(&handle, info, job, &closed);
                    if finished.send(completion).is_err() {
                        break;
                    }
                }
                trace!("Lane for endpoint {:#04x} exited", endpoint);
            })?;

        Ok(Lane { jobs, thread })
    }
}

/// Whether a timed-out attempt may be repeated
///
/// A single IN packet arrives whole or not at all, so a timed-out slice
/// moved nothing. Anything larger, and any OUT data, may have partially
/// moved.
fn is_retryable(info: EndpointInfo, endpoint: u8, length: usize) -> bool {
    is_in_endpoint(endpoint) && length <= info.max_packet_size
}

/// Run one transfer to completion, cancellation or failure
fn run_transfer(
    handle: &RwLock<DeviceHandle<Context>>,
    info: EndpointInfo,
    job: LaneJob,
    closed: &AtomicBool,
) -> HostCompletion {
    let LaneJob {
        request,
        mut pending,
        cancel,
    } = job;
    let endpoint = pending.endpoint();
    let is_in = is_in_endpoint(endpoint);
    let retryable = is_retryable(info, endpoint, pending.buffer().len());
    let timeout = if retryable { LANE_SLICE } else { TRANSFER_TIMEOUT };

    let (status, bytes_transferred) = loop {
        if cancel.load(Ordering::Acquire) || closed.load(Ordering::Acquire) {
            break (CompletionStatus::Cancelled, 0);
        }

        let result = {
            let handle = handle.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match (info.transfer_type, is_in) {
                (TransferType::Interrupt, true) => {
                    handle.read_interrupt(endpoint, pending.buffer_mut(), timeout)
                }
                (TransferType::Interrupt, false) => {
                    handle.write_interrupt(endpoint, pending.buffer(), timeout)
                }
                (_, true) => handle.read_bulk(endpoint, pending.buffer_mut(), timeout),
                (_, false) => handle.write_bulk(endpoint, pending.buffer(), timeout),
            }
        };

        match result {
            Ok(n) => break (CompletionStatus::Completed, n),
            Err(rusb::Error::Timeout) if retryable => continue,
            Err(rusb::Error::NoDevice) => break (CompletionStatus::NoDevice, 0),
            Err(e) => {
                debug!("Transfer on endpoint {:#04x} failed: {}", endpoint, e);
                break (CompletionStatus::Failed, 0);
            }
        }
    };

    HostCompletion {
        request,
        pending,
        status,
        bytes_transferred,
    }
}

impl HostConnection for LibusbConnection {
    fn file_descriptor(&self) -> i32 {
        self.descriptor
    }

    fn claim_interface(&self, interface: u8, force: bool) -> bool {
        let mut handle = self
            .handle
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if force {
            match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    if let Err(e) = handle.detach_kernel_driver(interface) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                ),
            }
        }

        match handle.claim_interface(interface) {
            Ok(()) => {
                debug!("Claimed interface {} on descriptor {}", interface, self.descriptor);
                true
            }
            Err(e) => {
                warn!("Failed to claim interface {}: {}", interface, e);
                false
            }
        }
    }

    fn release_interface(&self, interface: u8) -> bool {
        let mut handle = self
            .handle
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match handle.release_interface(interface) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to release interface {}: {}", interface, e);
                false
            }
        }
    }

    fn control_transfer_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Option<usize> {
        let handle = self
            .handle
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match handle.read_control(request_type, request, value, index, buffer, timeout) {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(
                    "Control transfer failed: request_type={:#x}, request={:#x}, value={:#x}: {}",
                    request_type, request, value, e
                );
                None
            }
        }
    }

    fn initialize_request(&self, endpoint: u8) -> Option<HostRequestId> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        match self.endpoints.get(&endpoint).map(|info| info.transfer_type) {
            Some(TransferType::Bulk) | Some(TransferType::Interrupt) => {}
            other => {
                debug!(
                    "Endpoint {:#04x} does not support queued requests ({:?})",
                    endpoint, other
                );
                return None;
            }
        }

        let request = HostRequestId(self.next_request.fetch_add(1, Ordering::SeqCst));
        lock(&self.requests).insert(request, (endpoint, Arc::new(AtomicBool::new(false))));
        Some(request)
    }

    fn queue_request(
        &self,
        request: HostRequestId,
        pending: PendingRequest,
    ) -> Result<(), PendingRequest> {
        if self.closed.load(Ordering::Acquire) {
            return Err(pending);
        }

        let Some((endpoint, cancel)) = lock(&self.requests).get(&request).cloned() else {
            return Err(pending);
        };
        let Some(info) = self.endpoints.get(&endpoint).copied() else {
            return Err(pending);
        };

        let mut lanes = lock(&self.lanes);
        if !lanes.contains_key(&endpoint) {
            match self.spawn_lane(endpoint, info) {
                Ok(lane) => {
                    lanes.insert(endpoint, lane);
                }
                Err(e) => {
                    error!("Failed to spawn lane for endpoint {:#04x}: {}", endpoint, e);
                    return Err(pending);
                }
            }
        }

        let Some(lane) = lanes.get(&endpoint) else {
            return Err(pending);
        };

        lane.jobs
            .try_send(LaneJob {
                request,
                pending,
                cancel,
            })
            .map_err(|e| e.into_inner().pending)
    }

    fn request_wait(&self, timeout: Duration) -> WaitOutcome {
        let finished = lock(&self.finished_rx);
        match finished.recv_timeout(timeout) {
            Ok(completion) => WaitOutcome::Completed(completion),
            Err(mpsc::RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
            Err(mpsc::RecvTimeoutError::Disconnected) => WaitOutcome::Null,
        }
    }

    fn cancel_request(&self, request: HostRequestId) -> bool {
        match lock(&self.requests).get(&request) {
            Some((_, cancel)) => !cancel.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    fn close_request(&self, request: HostRequestId) {
        lock(&self.requests).remove(&request);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let lanes: Vec<Lane> = lock(&self.lanes).drain().map(|(_, lane)| lane).collect();
        for lane in &lanes {
            lane.jobs.close();
        }
        for lane in lanes {
            if lane.thread.join().is_err() {
                error!("Lane thread on descriptor {} panicked", self.descriptor);
            }
        }

        lock(&self.requests).clear();
        debug!("Closed descriptor {}", self.descriptor);
    }
}

impl Drop for LibusbConnection {
    fn drop(&mut self) {
        self.close();
    }
}
