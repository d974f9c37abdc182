//! Polling hotplug backend: periodic full rescan and diff.
//!
//! Fallback for platforms without a device-notification subscription.
//! Known limitation: a presence flicker (appear and disappear entirely
//! within one poll interval) is invisible to this backend. That is an
//! accepted fidelity bound of polling, not something we try to mask.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{apply_snapshot, scan_dir, SharedSet, Subscribers};

/// Rescan cadence.
pub(super) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Rescan-and-diff until cancelled.
pub(super) async fn run(
    base_dir: &Path,
    interval: Duration,
    known: &SharedSet,
    subscribers: &Subscribers,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let current: BTreeSet<String> = scan_dir(base_dir).into_iter().collect();
                apply_snapshot(known, subscribers, current).await;
            }
        }
    }
}
