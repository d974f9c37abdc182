//! Serial device discovery and hotplug monitoring.
//!
//! The registry owns the set of currently-present serial devices and
//! publishes presence transitions as [`DeviceEvent`]s over mpsc channels.
//! Two interchangeable backends drive the monitor: a udev netlink
//! subscription filtered to the `tty` subsystem (Linux, preferred), and a
//! periodic rescan-and-diff fallback. Both feed the same diff routine, so
//! they satisfy an identical event contract: `Added(p)` fires exactly once
//! per absent→present transition and `Removed(p)` exactly once per
//! present→absent transition; nothing fires while presence is unchanged.
//!
//! The monitor task is the sole mutator of the known-device set while it
//! runs; readers always receive copies.

mod poll;
#[cfg(target_os = "linux")]
mod udev;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;

/// Device name patterns recognized as flashable serial ports.
const DEVICE_PATTERNS: &[&str] = &[
    "ttyUSB*",
    "ttyACM*",
    "cu.usbserial-*",
    "cu.SLAB_USBtoUART*",
];

/// Bound on waiting for the monitor task to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A device presence transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared at this path.
    Added(String),
    /// The device at this path went away.
    Removed(String),
}

type SharedSet = Arc<Mutex<BTreeSet<String>>>;
type Subscribers = Arc<Mutex<Vec<mpsc::Sender<DeviceEvent>>>>;

/// Discovers present serial devices and reports hotplug transitions.
pub struct DeviceRegistry {
    base_dir: PathBuf,
    poll_interval: Duration,
    known: SharedSet,
    subscribers: Subscribers,
    monitor: Mutex<Option<MonitorHandle>>,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeviceRegistry {
    /// Registry over the system device directory.
    pub fn new() -> Self {
        Self::with_base_dir("/dev")
    }

    /// Registry over an arbitrary directory. Used by tests; also handy
    /// for containers exposing a remapped device tree.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            poll_interval: poll::POLL_INTERVAL,
            known: Arc::new(Mutex::new(BTreeSet::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            monitor: Mutex::new(None),
        }
    }

    /// Override the polling backend's rescan interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enumerate currently present devices, lexicographically ordered.
    ///
    /// Pure read: no registry state changes, no events. Enumeration
    /// failure is treated as zero devices.
    pub fn scan(&self) -> Vec<String> {
        scan_dir(&self.base_dir)
    }

    /// Sorted copy of the known-device set.
    pub fn devices(&self) -> Vec<String> {
        self.known.lock().unwrap().iter().cloned().collect()
    }

    /// Force an out-of-band rescan, resynchronizing the known set without
    /// going through the event path. Returns the fresh snapshot.
    pub fn refresh(&self) -> Vec<String> {
        let devices = self.scan();
        *self.known.lock().unwrap() = devices.iter().cloned().collect();
        devices
    }

    /// Subscribe to presence transitions.
    ///
    /// Events are delivered on the monitoring task; a subscriber that
    /// stops draining its channel delays delivery to everyone behind it.
    pub fn subscribe(&self) -> mpsc::Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Start the background monitor. Idempotent while one is running.
    pub fn start_monitoring(&self) {
        let mut monitor = self.monitor.lock().unwrap();
        if let Some(handle) = monitor.as_ref() {
            if !handle.task.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor_task(
            self.base_dir.clone(),
            self.poll_interval,
            self.known.clone(),
            self.subscribers.clone(),
            cancel.clone(),
        ));
        *monitor = Some(MonitorHandle { cancel, task });
    }

    /// Stop the background monitor, waiting up to two seconds for it to
    /// wind down. Idempotent when no monitor is running.
    pub async fn stop_monitoring(&self) {
        let handle = self.monitor.lock().unwrap().take();
        let Some(MonitorHandle { cancel, task }) = handle else {
            return;
        };

        cancel.cancel();
        let abort = task.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
            warn!("device monitor did not stop within bound, aborting");
            abort.abort();
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerate devices in `base_dir` whose names match the recognized
/// patterns, sorted lexicographically.
fn scan_dir(base_dir: &Path) -> Vec<String> {
    let patterns: Vec<glob::Pattern> = DEVICE_PATTERNS
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return Vec::new();
    };

    let mut devices: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            patterns.iter().any(|p| p.matches(&name))
        })
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();

    devices.sort();
    devices
}

/// Run the monitor until cancelled: initial scan, then the best
/// available backend.
async fn monitor_task(
    base_dir: PathBuf,
    poll_interval: Duration,
    known: SharedSet,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    // Synchronize the known set before watching for transitions; the
    // initial population emits no events.
    let initial: BTreeSet<String> = scan_dir(&base_dir).into_iter().collect();
    *known.lock().unwrap() = initial;

    #[cfg(target_os = "linux")]
    match udev::UdevMonitor::new() {
        Ok(monitor) => {
            debug!("device monitor using udev netlink backend");
            match monitor.run(&known, &subscribers, &cancel).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "udev monitor failed, falling back to polling");
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "udev unavailable, using polling backend");
        }
    }

    if cancel.is_cancelled() {
        return;
    }

    let interval_ms = poll_interval.as_millis() as u64;
    debug!(interval_ms, "device monitor polling");
    poll::run(&base_dir, poll_interval, &known, &subscribers, &cancel).await;
}

/// Diff an observed snapshot against the known set, emitting one event
/// per transition. Shared by both backends (the polling backend applies
/// whole snapshots; initial synchronization bypasses it).
async fn apply_snapshot(known: &SharedSet, subscribers: &Subscribers, current: BTreeSet<String>) {
    let (added, removed) = {
        let mut known = known.lock().unwrap();
        let added: Vec<String> = current.difference(&known).cloned().collect();
        let removed: Vec<String> = known.difference(&current).cloned().collect();
        *known = current;
        (added, removed)
    };

    for path in added {
        debug!(port = %path, "device added");
        emit(subscribers, DeviceEvent::Added(path)).await;
    }
    for path in removed {
        debug!(port = %path, "device removed");
        emit(subscribers, DeviceEvent::Removed(path)).await;
    }
}

/// Apply a single observed transition. Used by the udev backend, which
/// sees per-device events rather than snapshots. Transitions that don't
/// change presence state emit nothing.
#[cfg(target_os = "linux")]
async fn apply_transition(
    known: &SharedSet,
    subscribers: &Subscribers,
    event: DeviceEvent,
) {
    let changed = {
        let mut known = known.lock().unwrap();
        match &event {
            DeviceEvent::Added(path) => known.insert(path.clone()),
            DeviceEvent::Removed(path) => known.remove(path.as_str()),
        }
    };

    if changed {
        emit(subscribers, event).await;
    }
}

/// Deliver an event to every live subscriber, pruning closed channels.
async fn emit(subscribers: &Subscribers, event: DeviceEvent) {
    // Clone the senders out so the lock isn't held across await points.
    let senders: Vec<mpsc::Sender<DeviceEvent>> = subscribers.lock().unwrap().clone();

    let mut any_closed = false;
    for tx in &senders {
        if tx.send(event.clone()).await.is_err() {
            any_closed = true;
        }
    }

    if any_closed {
        subscribers.lock().unwrap().retain(|tx| !tx.is_closed());
    }
}
