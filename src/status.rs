use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusb::{Device, Hotplug, HotplugBuilder, Registration, UsbContext};

use crate::error::{EzpError, Result, Step};
use crate::{EZP_PID, EZP_VID};

/// Connectivity of the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Attached and we can open it.
    Ready = 1,
    /// Attached but opening failed, usually for lack of permission.
    Connected = 2,
    /// Not attached.
    Disconnected = 3,
}
impl Status {
    fn from_u8(x: u8) -> Option<Self> {
        match x {
            x if x == Self::Ready as u8 => Some(Self::Ready),
            x if x == Self::Connected as u8 => Some(Self::Connected),
            x if x == Self::Disconnected as u8 => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Receives status changes from a [`StatusMonitor`].
///
/// Called on the monitor thread, once per relevant hot-plug event.
pub trait StatusObserver: Send {
    fn on_status(&mut self, status: Status);
}

impl<F: FnMut(Status) + Send> StatusObserver for F {
    fn on_status(&mut self, status: Status) {
        self(status)
    }
}

/// Raw hot-plug notification.
#[derive(Debug)]
pub enum HotplugEvent<D> {
    Arrived(D),
    Left(D),
}

/// Device carried by a hot-plug event.
pub trait HotplugDevice {
    /// Vendor and product id, `None` if the descriptor cannot be read.
    fn identity(&self) -> Option<(u16, u16)>;

    /// Opens the device and closes it again right away.
    fn probe_open(&self) -> bool;
}

impl<T: UsbContext> HotplugDevice for Device<T> {
    fn identity(&self) -> Option<(u16, u16)> {
        match self.device_descriptor() {
            Ok(desc) => Some((desc.vendor_id(), desc.product_id())),
            Err(e) => {
                log::warn!("error getting device descriptor: {}", e);
                None
            }
        }
    }

    fn probe_open(&self) -> bool {
        match self.open() {
            Ok(_handle) => true,
            Err(e) => {
                log::debug!("open probe failed: {}", e);
                false
            }
        }
    }
}

/// Callback the monitor hands to a [`HotplugSource`].
pub type EventSink<D> = Box<dyn FnMut(HotplugEvent<D>) + Send>;

/// Source of hot-plug events.
pub trait HotplugSource: Send + 'static {
    type Device: HotplugDevice;

    /// Whether the platform can deliver hot-plug events at all.
    fn has_hotplug(&self) -> bool;

    /// Whether only events matching the subscribed vendor/product id are
    /// delivered, so an event for an unreadable device is still ours.
    fn filters_by_id(&self) -> bool {
        false
    }

    /// Starts delivering events for the configured identity to `sink`.
    fn subscribe(&mut self, config: &StatusMonitorConfig, sink: EventSink<Self::Device>) -> Result<()>;

    fn unsubscribe(&mut self);

    /// Delivers pending events, blocking up to `timeout` for new ones.
    fn handle_events(&mut self, timeout: Duration) -> Result<()>;
}

struct Forwarder<T: UsbContext> {
    sink: EventSink<Device<T>>,
}

impl<T: UsbContext> Hotplug<T> for Forwarder<T> {
    fn device_arrived(&mut self, device: Device<T>) {
        (self.sink)(HotplugEvent::Arrived(device))
    }

    fn device_left(&mut self, device: Device<T>) {
        (self.sink)(HotplugEvent::Left(device))
    }
}

/// libusb hot-plug events through rusb.
pub struct RusbHotplug<T: UsbContext> {
    context: T,
    registration: Option<Registration<T>>,
}
impl<T: UsbContext> RusbHotplug<T> {
    pub fn new(context: T) -> Self {
        RusbHotplug {
            context,
            registration: None,
        }
    }
}

impl<T: UsbContext + 'static> HotplugSource for RusbHotplug<T> {
    type Device = Device<T>;

    fn has_hotplug(&self) -> bool {
        rusb::has_hotplug()
    }

    fn filters_by_id(&self) -> bool {
        true
    }

    fn subscribe(&mut self, config: &StatusMonitorConfig, sink: EventSink<Device<T>>) -> Result<()> {
        let callback: Box<dyn Hotplug<T>> = Box::new(Forwarder { sink });
        let registration = HotplugBuilder::new()
            .vendor_id(config.vendor_id)
            .product_id(config.product_id)
            .enumerate(config.enumerate)
            .register(&self.context, callback)
            .map_err(EzpError::HotplugFailure)?;
        self.registration = Some(registration);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some(reg) = self.registration.take() {
            self.context.unregister_callback(reg);
        }
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<()> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => {
                log::error!("error handling usb events: {}", e);
                Err(EzpError::UsbTransportFailure {
                    step: Step::EventDispatch,
                    source: e,
                })
            }
        }
    }
}

/// Maps one hot-plug event to the new status, `None` if the event is not
/// about the programmer.
///
/// A device whose descriptor cannot be read only counts as the programmer
/// when `source_filters` says the source already matched its id.
pub fn reduce_event<D: HotplugDevice>(
    event: &HotplugEvent<D>,
    vendor_id: u16,
    product_id: u16,
    source_filters: bool,
) -> Option<Status> {
    let (device, arrived) = match event {
        HotplugEvent::Arrived(d) => (d, true),
        HotplugEvent::Left(d) => (d, false),
    };

    match device.identity() {
        None => {
            log::warn!(
                "device {}, but its descriptor is unreadable",
                if arrived { "attached" } else { "detached" }
            );
            source_filters.then_some(Status::Disconnected)
        }
        Some(ids) if ids != (vendor_id, product_id) => None,
        Some(_) if arrived => Some(if device.probe_open() {
            Status::Ready
        } else {
            Status::Connected
        }),
        Some(_) => Some(Status::Disconnected),
    }
}

/// Stop signal shared between a monitor and its dispatch thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Settings for [`StatusMonitor::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMonitorConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Longest a single dispatch may block, which bounds how long
    /// cancellation takes to be noticed.
    pub dispatch_timeout: Duration,
    /// Report an already attached programmer as an arrival at start.
    pub enumerate: bool,
}
impl Default for StatusMonitorConfig {
    fn default() -> Self {
        StatusMonitorConfig {
            vendor_id: EZP_VID,
            product_id: EZP_PID,
            dispatch_timeout: Duration::from_millis(250),
            enumerate: true,
        }
    }
}

const STATUS_UNKNOWN: u8 = 0;

fn dispatch<S: HotplugSource>(source: &mut S, token: &CancelToken, timeout: Duration) -> Result<()> {
    while !token.is_cancelled() {
        source.handle_events(timeout)?;
    }
    Ok(())
}

/// Watches programmer attach/detach events on a dedicated thread.
pub struct StatusMonitor {
    token: CancelToken,
    stopped: Receiver<()>,
    thread: Option<JoinHandle<Result<()>>>,
    status: Arc<AtomicU8>,
}

impl StatusMonitor {
    /// Subscribes to hot-plug events and starts the dispatch thread.
    ///
    /// Fails with [`EzpError::HotplugUnsupported`] without subscribing when
    /// `source` cannot deliver hot-plug events.
    pub fn start<S, O>(mut source: S, config: StatusMonitorConfig, observer: O) -> Result<Self>
    where
        S: HotplugSource,
        O: StatusObserver + 'static,
    {
        if !source.has_hotplug() {
            return Err(EzpError::HotplugUnsupported);
        }

        let status = Arc::new(AtomicU8::new(STATUS_UNKNOWN));
        let sink_status = status.clone();
        let (vid, pid) = (config.vendor_id, config.product_id);
        let filtered = source.filters_by_id();
        let mut observer = observer;
        let sink: EventSink<S::Device> = Box::new(move |event| {
            if let Some(s) = reduce_event(&event, vid, pid, filtered) {
                log::debug!("programmer status: {:?}", s);
                sink_status.store(s as u8, Ordering::Release);
                observer.on_status(s);
            }
        });
        source.subscribe(&config, sink)?;

        let token = CancelToken::new();
        let loop_token = token.clone();
        let (stopped_tx, stopped) = mpsc::sync_channel(1);
        let timeout = config.dispatch_timeout;

        let thread = thread::Builder::new()
            .name("ezp-status".into())
            .spawn(move || {
                let res = dispatch(&mut source, &loop_token, timeout);
                source.unsubscribe();
                let _ = stopped_tx.send(());
                res
            })
            .map_err(EzpError::StatusThreadFailure)?;

        log::info!("listening for programmer {:04X}:{:04X}", vid, pid);
        Ok(StatusMonitor {
            token,
            stopped,
            thread: Some(thread),
            status,
        })
    }

    /// Last reported status, `None` until the first event.
    pub fn status(&self) -> Option<Status> {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Token that stops this monitor when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Asks the dispatch thread to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the dispatch thread to unsubscribe and exit. Returns false on timeout.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        match self.stopped.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Stops the monitor and returns the dispatch loop's outcome.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.token.cancel();
        match self.thread.take() {
            Some(thread) => {
                let res = thread.join().map_err(|_| EzpError::StatusMonitorPanicked)?;
                log::info!("status monitor stopped");
                res
            }
            None => Ok(()),
        }
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("status monitor ended with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeDevice {
        ids: Option<(u16, u16)>,
        opens: bool,
    }

    impl HotplugDevice for FakeDevice {
        fn identity(&self) -> Option<(u16, u16)> {
            self.ids
        }

        fn probe_open(&self) -> bool {
            self.opens
        }
    }

    fn programmer(opens: bool) -> FakeDevice {
        FakeDevice {
            ids: Some((EZP_VID, EZP_PID)),
            opens,
        }
    }

    fn foreign() -> FakeDevice {
        FakeDevice {
            ids: Some((0x1234, 0x5678)),
            opens: true,
        }
    }

    #[derive(Clone, Default)]
    struct Shared {
        pending: Arc<Mutex<VecDeque<HotplugEvent<FakeDevice>>>>,
        dispatches: Arc<AtomicUsize>,
        subscribed: Arc<AtomicBool>,
    }

    struct MockSource {
        hotplug: bool,
        fail_dispatch: bool,
        shared: Shared,
        sink: Option<EventSink<FakeDevice>>,
    }

    impl MockSource {
        fn new(hotplug: bool) -> (Self, Shared) {
            let shared = Shared::default();
            let source = MockSource {
                hotplug,
                fail_dispatch: false,
                shared: shared.clone(),
                sink: None,
            };
            (source, shared)
        }
    }

    impl HotplugSource for MockSource {
        type Device = FakeDevice;

        fn has_hotplug(&self) -> bool {
            self.hotplug
        }

        fn subscribe(&mut self, _config: &StatusMonitorConfig, sink: EventSink<FakeDevice>) -> Result<()> {
            self.sink = Some(sink);
            self.shared.subscribed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn unsubscribe(&mut self) {
            self.sink = None;
            self.shared.subscribed.store(false, Ordering::SeqCst);
        }

        fn handle_events(&mut self, timeout: Duration) -> Result<()> {
            self.shared.dispatches.fetch_add(1, Ordering::SeqCst);
            if self.fail_dispatch {
                return Err(EzpError::UsbTransportFailure {
                    step: Step::EventDispatch,
                    source: rusb::Error::NoDevice,
                });
            }
            let events: Vec<_> = self.shared.pending.lock().unwrap().drain(..).collect();
            if events.is_empty() {
                thread::sleep(timeout.min(Duration::from_millis(2)));
            }
            if let Some(sink) = self.sink.as_mut() {
                for e in events {
                    sink(e);
                }
            }
            Ok(())
        }
    }

    fn config() -> StatusMonitorConfig {
        StatusMonitorConfig {
            dispatch_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn arrival_probe_decides_ready_or_connected() {
        let ok = HotplugEvent::Arrived(programmer(true));
        let denied = HotplugEvent::Arrived(programmer(false));
        assert_eq!(reduce_event(&ok, EZP_VID, EZP_PID, false), Some(Status::Ready));
        assert_eq!(
            reduce_event(&denied, EZP_VID, EZP_PID, false),
            Some(Status::Connected)
        );
    }

    #[test]
    fn removal_is_always_disconnected() {
        for opens in [true, false] {
            let left = HotplugEvent::Left(programmer(opens));
            assert_eq!(
                reduce_event(&left, EZP_VID, EZP_PID, false),
                Some(Status::Disconnected)
            );
        }
    }

    #[test]
    fn foreign_devices_are_ignored() {
        assert_eq!(
            reduce_event(&HotplugEvent::Arrived(foreign()), EZP_VID, EZP_PID, false),
            None
        );
        assert_eq!(
            reduce_event(&HotplugEvent::Left(foreign()), EZP_VID, EZP_PID, false),
            None
        );
    }

    fn unreadable() -> FakeDevice {
        FakeDevice {
            ids: None,
            opens: true,
        }
    }

    #[test]
    fn unreadable_descriptor_from_filtered_source_means_disconnected() {
        assert_eq!(
            reduce_event(&HotplugEvent::Arrived(unreadable()), EZP_VID, EZP_PID, true),
            Some(Status::Disconnected)
        );
        assert_eq!(
            reduce_event(&HotplugEvent::Left(unreadable()), EZP_VID, EZP_PID, true),
            Some(Status::Disconnected)
        );
    }

    #[test]
    fn unreadable_descriptor_from_unfiltered_source_is_ignored() {
        assert_eq!(
            reduce_event(&HotplugEvent::Arrived(unreadable()), EZP_VID, EZP_PID, false),
            None
        );
    }

    #[test]
    fn unreadable_foreign_device_keeps_programmer_status() {
        let (source, shared) = MockSource::new(true);
        {
            let mut pending = shared.pending.lock().unwrap();
            pending.push_back(HotplugEvent::Arrived(programmer(true)));
            pending.push_back(HotplugEvent::Arrived(unreadable()));
            pending.push_back(HotplugEvent::Left(foreign()));
        }

        let (tx, rx) = mpsc::channel();
        let monitor = StatusMonitor::start(source, config(), move |s: Status| {
            let _ = tx.send(s);
        })
        .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Status::Ready
        );
        while !shared.pending.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        monitor.stop().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsupported_hotplug_never_dispatches() {
        let (source, shared) = MockSource::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let observer_calls = calls.clone();

        let res = StatusMonitor::start(source, config(), move |_s: Status| {
            observer_calls.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(res, Err(EzpError::HotplugUnsupported)));
        assert_eq!(shared.dispatches.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!shared.subscribed.load(Ordering::SeqCst));
    }

    #[test]
    fn reports_one_status_per_relevant_event() {
        let (source, shared) = MockSource::new(true);
        {
            let mut pending = shared.pending.lock().unwrap();
            pending.push_back(HotplugEvent::Arrived(programmer(true)));
            pending.push_back(HotplugEvent::Arrived(foreign()));
            pending.push_back(HotplugEvent::Left(programmer(true)));
            pending.push_back(HotplugEvent::Arrived(programmer(false)));
        }

        let (tx, rx) = mpsc::channel();
        let monitor = StatusMonitor::start(source, config(), move |s: Status| {
            let _ = tx.send(s);
        })
        .unwrap();

        let seen: Vec<Status> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(
            seen,
            vec![Status::Ready, Status::Disconnected, Status::Connected]
        );
        assert_eq!(monitor.status(), Some(Status::Connected));
        assert!(shared.subscribed.load(Ordering::SeqCst));

        monitor.stop().unwrap();
        assert!(!shared.subscribed.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_is_unknown_until_first_event() {
        let (source, _shared) = MockSource::new(true);
        let monitor = StatusMonitor::start(source, config(), |_s: Status| {}).unwrap();
        assert_eq!(monitor.status(), None);
        monitor.stop().unwrap();
    }

    #[test]
    fn cancel_token_ends_the_loop() {
        let (source, shared) = MockSource::new(true);
        let monitor = StatusMonitor::start(source, config(), |_s: Status| {}).unwrap();

        monitor.cancel_token().cancel();
        assert!(monitor.wait_stopped(Duration::from_secs(5)));
        assert!(!shared.subscribed.load(Ordering::SeqCst));

        let dispatches = shared.dispatches.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(shared.dispatches.load(Ordering::SeqCst), dispatches);
        monitor.stop().unwrap();
    }

    #[test]
    fn dispatch_error_is_returned_on_stop() {
        let (mut source, shared) = MockSource::new(true);
        source.fail_dispatch = true;
        let monitor = StatusMonitor::start(source, config(), |_s: Status| {}).unwrap();

        assert!(monitor.wait_stopped(Duration::from_secs(5)));
        assert!(!shared.subscribed.load(Ordering::SeqCst));
        assert!(matches!(
            monitor.stop(),
            Err(EzpError::UsbTransportFailure {
                step: Step::EventDispatch,
                ..
            })
        ));
    }
}
