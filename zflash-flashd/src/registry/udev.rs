//! Event-driven hotplug backend over a udev netlink subscription.
//!
//! Subscribes to kernel device notifications filtered to the `tty`
//! subsystem, the same filter the polling backend approximates by name
//! patterns. The netlink socket is non-blocking; readiness is driven
//! through tokio's `AsyncFd`, so transitions are observed without any
//! rescan latency.

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;

use super::{apply_transition, DeviceEvent, RegistryError, SharedSet, Subscribers};
use crate::tracing::prelude::*;

/// A live udev netlink subscription.
pub(super) struct UdevMonitor {
    socket: AsyncFd<udev::MonitorSocket>,
}

impl UdevMonitor {
    /// Open a netlink monitor filtered to tty devices.
    pub(super) fn new() -> Result<Self, RegistryError> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem("tty")?
            .listen()?;
        let socket = AsyncFd::with_interest(socket, Interest::READABLE)?;
        Ok(Self { socket })
    }

    /// Pump kernel events into the known set until cancelled.
    ///
    /// Returns `Err` only on socket failure, in which case the caller
    /// falls back to the polling backend.
    pub(super) async fn run(
        mut self,
        known: &SharedSet,
        subscribers: &Subscribers,
        cancel: &CancellationToken,
    ) -> Result<(), RegistryError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                guard = self.socket.readable_mut() => {
                    let mut guard = guard?;

                    let transitions = drain(guard.get_inner_mut());
                    for event in transitions {
                        apply_transition(known, subscribers, event).await;
                    }

                    guard.clear_ready();
                }
            }
        }
    }
}

/// Drain all pending kernel events into presence transitions.
///
/// Actions other than add/remove (change, bind, ...) don't affect
/// presence and are dropped here. Duplicate bursts for one device node
/// are harmless: `apply_transition` only emits on actual state changes.
fn drain(socket: &mut udev::MonitorSocket) -> Vec<DeviceEvent> {
    let mut transitions = Vec::new();

    for event in socket.iter() {
        let Some(node) = event.devnode() else {
            continue;
        };
        let path = node.to_string_lossy().into_owned();

        let transition = match event.event_type() {
            udev::EventType::Add => DeviceEvent::Added(path),
            udev::EventType::Remove => DeviceEvent::Removed(path),
            _ => continue,
        };

        trace!(?transition, "udev event");
        transitions.push(transition);
    }

    transitions
}
