//! Flash orchestration.
//!
//! The daemon bridges device-registry events and operator commands to a
//! bounded worker pool driving the flash engine, and records every
//! terminal outcome in the history store. Three entry points submit
//! work (a single-port command, a scan-everything batch, and
//! hotplug-triggered monitor mode) and all of them go through the same
//! per-port in-flight guard, so at most one attempt runs against a port
//! at any instant no matter how it was requested.
//!
//! Per-device failures are isolated: a bad port fails its own attempt
//! and nothing else. The only fatal conditions are failing to open the
//! history store and failing to start the runtime itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::flasher::{EspFlasher, FlashResult, FlashState};
use crate::history::{AttemptStatus, HistoryStore, NewRecord};
use crate::registry::{DeviceEvent, DeviceRegistry};
use crate::session_log::SessionLogger;
use crate::tracing::prelude::*;

/// Capacity of the event channel to the presentation layer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Orchestration errors surfaced to direct callers.
///
/// Batch and monitor layers convert these into failed results or log
/// lines; they never abort other ports' work.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("port {0} already has a flash attempt in progress")]
    PortBusy(String),

    #[error("daemon is shutting down")]
    ShuttingDown,
}

/// Events consumed by the (external) presentation layer.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Percentage reported by the tool for an in-flight attempt.
    Progress { port: String, percent: u8 },

    /// Identity resolved for the device under an attempt.
    ChipInfo {
        port: String,
        chip_type: Option<String>,
        mac: Option<String>,
    },

    /// An attempt reached a terminal state.
    Finished { port: String, result: FlashResult },
}

/// Bookkeeping for one in-flight attempt. Owned exclusively by the
/// daemon; the entry doubles as the port's in-flight marker and is
/// removed once the outcome is persisted.
#[derive(Debug)]
struct FlashTask {
    firmware: PathBuf,
    offset: u32,
    state: FlashState,
    progress: u8,
    started_at: Instant,
}

/// Point-in-time view of one in-flight attempt, for status displays.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub port: String,
    pub firmware: PathBuf,
    pub offset: u32,
    pub state: FlashState,
    pub progress: u8,
    pub elapsed: Duration,
}

type ActiveTasks = Arc<Mutex<HashMap<String, FlashTask>>>;

/// Removes the port's in-flight marker when the attempt ends, however
/// it ends.
struct ActiveGuard {
    active: ActiveTasks,
    port: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.port);
    }
}

/// The flash orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Daemon {
    config: Arc<Config>,
    registry: Arc<DeviceRegistry>,
    flasher: Arc<EspFlasher>,
    history: Arc<HistoryStore>,
    session_logs: SessionLogger,
    workers: Arc<Semaphore>,
    active: ActiveTasks,
    events: mpsc::Sender<DaemonEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Construct a daemon over the system device tree.
    ///
    /// Fails when the history store can't be opened or the log
    /// directory can't be created.
    pub fn new(config: Config) -> crate::Result<(Self, mpsc::Receiver<DaemonEvent>)> {
        Self::with_registry(config, DeviceRegistry::new())
    }

    /// Construct a daemon over a specific registry. Lets tests (and
    /// remapped device trees) control discovery.
    pub fn with_registry(
        config: Config,
        registry: DeviceRegistry,
    ) -> crate::Result<(Self, mpsc::Receiver<DaemonEvent>)> {
        let history = HistoryStore::open(&config.db_path)?;
        let session_logs = SessionLogger::new(&config.log_dir)?;
        let flasher = EspFlasher::new(&config);
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let daemon = Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            flasher: Arc::new(flasher),
            history: Arc::new(history),
            session_logs,
            workers,
            active: Arc::new(Mutex::new(HashMap::new())),
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        Ok((daemon, events_rx))
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn flasher(&self) -> &EspFlasher {
        &self.flasher
    }

    /// Token cancelled when shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown: no new attempts are accepted, outstanding ones
    /// finish or time out. In-flight esptool invocations are not killed
    /// mid-write; interrupting them could leave a device partially
    /// programmed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Flash one device, end to end: in-flight guard, worker permit,
    /// session log, engine invocation, history record, events.
    ///
    /// Rejects with [`FlashError::PortBusy`] when the port already has
    /// an attempt in flight.
    pub async fn flash_device(
        &self,
        port: &str,
        firmware_override: Option<&Path>,
    ) -> Result<FlashResult, FlashError> {
        if self.shutdown.is_cancelled() {
            return Err(FlashError::ShuttingDown);
        }

        let firmware = firmware_override
            .unwrap_or(&self.config.firmware_path)
            .to_path_buf();
        let offset = self.config.flash_offset;

        let _guard = self.begin_attempt(port, &firmware, offset)?;

        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FlashError::ShuttingDown)?;

        self.update_task(port, |task| task.state = FlashState::Identifying);
        info!(port = %port, firmware = %firmware.display(), "starting flash attempt");

        let session_path = self.session_logs.session_path(port);

        let progress_sink = {
            let events = self.events.clone();
            let active = self.active.clone();
            let port = port.to_string();
            move |percent: u8| {
                {
                    let mut active = active.lock().unwrap();
                    if let Some(task) = active.get_mut(&port) {
                        task.state = FlashState::Flashing;
                        // Progress within one attempt never goes backward.
                        task.progress = task.progress.max(percent);
                    }
                }
                trace!(port = %port, percent, "flash progress");
                // Progress is high-rate and lossy by design; a full
                // channel drops updates rather than stalling the reader
                // loop.
                events
                    .try_send(DaemonEvent::Progress {
                        port: port.clone(),
                        percent,
                    })
                    .ok();
            }
        };

        let result = self.flasher.flash(port, &firmware, offset, progress_sink).await;

        self.events
            .send(DaemonEvent::ChipInfo {
                port: port.to_string(),
                chip_type: result.chip_type.clone(),
                mac: result.mac.clone(),
            })
            .await
            .ok();

        if let Err(e) = self.session_logs.write(&session_path, &result.log_output).await {
            warn!(port = %port, error = %e, "failed to write session log");
        }

        let record = NewRecord {
            port: port.to_string(),
            status: if result.success {
                AttemptStatus::Success
            } else {
                AttemptStatus::Fail
            },
            mac: result.mac.clone(),
            chip_type: result.chip_type.clone(),
            duration_secs: result.duration.as_secs_f64(),
            firmware: Some(firmware.display().to_string()),
            log_path: Some(session_path.display().to_string()),
            error_msg: result.error_msg.clone(),
        };
        if let Err(e) = self.history.add_record(&record) {
            // A write failure loses one record; it must not take the
            // attempt (or future attempts) down with it.
            error!(port = %port, error = %e, "failed to persist attempt record");
        }

        self.update_task(port, |task| {
            task.state = if result.success {
                FlashState::Succeeded
            } else {
                FlashState::Failed
            };
        });

        if result.success {
            info!(
                port = %port,
                mac = ?result.mac,
                duration_s = format!("{:.2}", result.duration.as_secs_f64()),
                "flash successful"
            );
        } else {
            error!(port = %port, error = ?result.error_msg, "flash failed");
        }

        self.events
            .send(DaemonEvent::Finished {
                port: port.to_string(),
                result: result.clone(),
            })
            .await
            .ok();

        Ok(result)
    }

    /// Flash every device visible right now, in parallel.
    ///
    /// Returns one result per scanned port, always: per-port timeouts,
    /// rejections, and panics are converted into failed results locally
    /// and never block collection of the rest.
    pub async fn flash_all(
        &self,
        firmware_override: Option<&Path>,
    ) -> HashMap<String, FlashResult> {
        let ports = self.registry.scan();
        if ports.is_empty() {
            warn!("no devices found");
            return HashMap::new();
        }
        info!(count = ports.len(), ports = ?ports, "flashing all devices");

        let task_timeout = Duration::from_secs(self.config.flash_timeout_secs);
        let mut tasks = JoinSet::new();
        let mut port_by_task = HashMap::new();

        for port in &ports {
            let daemon = self.clone();
            let port = port.clone();
            let port_for_map = port.clone();
            let firmware = firmware_override.map(Path::to_path_buf);
            let handle = tasks.spawn(async move {
                let attempt = tokio::time::timeout(
                    task_timeout,
                    daemon.flash_device(&port, firmware.as_deref()),
                )
                .await;
                let result = match attempt {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => FlashResult::failure(&port, e.to_string()),
                    Err(_) => FlashResult::failure(
                        &port,
                        format!("flash timed out after {}s", task_timeout.as_secs()),
                    ),
                };
                (port, result)
            });
            port_by_task.insert(handle.id(), port_for_map);
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (port, result))) => {
                    results.insert(port, result);
                }
                Err(e) => {
                    // A panicked task still owes its port a result.
                    if let Some(port) = port_by_task.get(&e.id()) {
                        results.insert(
                            port.clone(),
                            FlashResult::failure(port, format!("flash task failed: {e}")),
                        );
                    }
                }
            }
        }
        results
    }

    /// Run continuously, flashing devices as they are plugged in.
    ///
    /// Every add event submits an attempt; rapid replug bursts are not
    /// debounced, the per-port guard serializes them. Runs until
    /// shutdown is requested, then stops monitoring and waits for
    /// outstanding attempts.
    pub async fn monitor_mode(&self) {
        info!("monitor mode: flashing devices as they connect");

        let mut events = self.registry.subscribe();
        self.registry.start_monitoring();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(DeviceEvent::Added(port)) => {
                            info!(port = %port, "device connected");
                            let daemon = self.clone();
                            self.tracker.spawn(async move {
                                if let Err(e) = daemon.flash_device(&port, None).await {
                                    debug!(port = %port, error = %e, "skipping attempt");
                                }
                            });
                        }
                        Some(DeviceEvent::Removed(port)) => {
                            info!(port = %port, "device disconnected");
                        }
                        None => break,
                    }
                }
            }
        }

        self.registry.stop_monitoring().await;
        self.tracker.close();
        self.tracker.wait().await;
        info!("monitor mode stopped");
    }

    /// Snapshots of all in-flight attempts, ordered by port.
    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        let active = self.active.lock().unwrap();
        let mut snapshots: Vec<TaskSnapshot> = active
            .iter()
            .map(|(port, task)| TaskSnapshot {
                port: port.clone(),
                firmware: task.firmware.clone(),
                offset: task.offset,
                state: task.state,
                progress: task.progress,
                elapsed: task.started_at.elapsed(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.port.cmp(&b.port));
        snapshots
    }

    /// Test-and-insert the port's in-flight marker.
    fn begin_attempt(
        &self,
        port: &str,
        firmware: &Path,
        offset: u32,
    ) -> Result<ActiveGuard, FlashError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(port) {
            return Err(FlashError::PortBusy(port.to_string()));
        }
        active.insert(
            port.to_string(),
            FlashTask {
                firmware: firmware.to_path_buf(),
                offset,
                state: FlashState::NotStarted,
                progress: 0,
                started_at: Instant::now(),
            },
        );
        Ok(ActiveGuard {
            active: self.active.clone(),
            port: port.to_string(),
        })
    }

    fn update_task(&self, port: &str, f: impl FnOnce(&mut FlashTask)) {
        if let Some(task) = self.active.lock().unwrap().get_mut(port) {
            f(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    /// Fake esptool that logs invocations and reports a healthy chip.
    const HAPPY_TOOL: &str = r#"
echo "Chip is ESP32-D0WDQ6 (revision v1.0)"
echo "MAC: aa:bb:cc:dd:ee:ff"
echo "Writing at 0x00001000... (50 %)"
echo "Writing at 0x00008000... (100 %)"
exit 0"#;

    struct Fixture {
        daemon: Daemon,
        events: mpsc::Receiver<DaemonEvent>,
        tool_dir: tempfile::TempDir,
        dev_dir: tempfile::TempDir,
    }

    fn fixture(tool_body: &str) -> Fixture {
        use std::os::unix::fs::PermissionsExt;

        let tool_dir = tempfile::tempdir().unwrap();
        let dev_dir = tempfile::tempdir().unwrap();

        let tool = tool_dir.path().join("esptool");
        let calls = tool_dir.path().join("calls.log");
        let script = format!("#!/bin/sh\necho \"$@\" >> {}\n{tool_body}\n", calls.display());
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let firmware = tool_dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"\xe9firmware").unwrap();

        let config = Config {
            esptool_path: tool,
            firmware_path: firmware,
            db_path: tool_dir.path().join("history.db"),
            log_dir: tool_dir.path().join("logs"),
            flash_timeout_secs: 5,
            ..Config::default()
        };

        let registry = DeviceRegistry::with_base_dir(dev_dir.path())
            .poll_interval(Duration::from_millis(20));
        let (daemon, events) = Daemon::with_registry(config, registry).unwrap();

        Fixture {
            daemon,
            events,
            tool_dir,
            dev_dir,
        }
    }

    impl Fixture {
        fn add_device(&self, name: &str) {
            File::create(self.dev_dir.path().join(name)).unwrap();
        }

        fn invocation_count(&self) -> usize {
            std::fs::read_to_string(self.tool_dir.path().join("calls.log"))
                .map(|text| text.lines().count())
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn flash_all_returns_one_result_per_device() {
        let fx = fixture(HAPPY_TOOL);
        for i in 0..5 {
            fx.add_device(&format!("ttyUSB{i}"));
        }

        let results = fx.daemon.flash_all(None).await;

        assert_eq!(results.len(), 5);
        assert!(results.values().all(|r| r.success));

        // Every terminal result produced exactly one history record.
        let stats = fx.daemon.history().statistics(None).unwrap();
        assert_eq!(stats.success, 5);
        assert_eq!(stats.total, 5);
    }

    #[tokio::test]
    async fn flash_all_with_no_devices_is_empty() {
        let fx = fixture(HAPPY_TOOL);
        assert!(fx.daemon.flash_all(None).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_attempts_on_one_port_run_once() {
        // Tool is slow enough that the second call lands mid-attempt.
        let fx = fixture("sleep 0.3\nexit 0");

        let (first, second) = tokio::join!(
            fx.daemon.flash_device("/dev/ttyUSB0", None),
            fx.daemon.flash_device("/dev/ttyUSB0", None),
        );

        let rejected = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(FlashError::PortBusy(_))))
            .count();
        assert_eq!(rejected, 1);

        // The executed attempt invoked the tool exactly once per stage:
        // identify + write_flash.
        assert_eq!(fx.invocation_count(), 2);

        // Guard released once both calls settled.
        assert!(fx.daemon.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn batch_isolates_a_stuck_port() {
        let fx = fixture("case \"$@\" in *ttyUSB3*) sleep 30;; esac\nexit 0");
        for i in 0..5 {
            fx.add_device(&format!("ttyUSB{i}"));
        }

        // Tight per-task timeout so the stuck port trips it quickly.
        let mut config = (*fx.daemon.config).clone();
        config.flash_timeout_secs = 1;
        let daemon = Daemon {
            config: Arc::new(config),
            ..fx.daemon.clone()
        };

        let results = daemon.flash_all(None).await;

        assert_eq!(results.len(), 5);
        let stuck = results
            .iter()
            .find(|(port, _)| port.ends_with("ttyUSB3"))
            .map(|(_, r)| r)
            .unwrap();
        assert!(!stuck.success);
        assert!(stuck.error_msg.as_deref().unwrap().contains("timed out"));

        let healthy = results
            .iter()
            .filter(|(port, _)| !port.ends_with("ttyUSB3"))
            .count();
        assert_eq!(healthy, 4);
        assert!(results
            .iter()
            .filter(|(port, _)| !port.ends_with("ttyUSB3"))
            .all(|(_, r)| r.success));
    }

    #[tokio::test]
    async fn flash_device_emits_progress_and_terminal_events() {
        let mut fx = fixture(HAPPY_TOOL);

        let result = fx.daemon.flash_device("/dev/ttyUSB0", None).await.unwrap();
        assert!(result.success);

        let mut percents = Vec::new();
        let mut chip_info = None;
        let mut finished = None;
        while let Ok(event) = fx.events.try_recv() {
            match event {
                DaemonEvent::Progress { percent, .. } => percents.push(percent),
                DaemonEvent::ChipInfo { chip_type, .. } => chip_info = chip_type,
                DaemonEvent::Finished { result, .. } => finished = Some(result),
            }
        }

        assert_eq!(percents, vec![50, 100]);
        assert_eq!(chip_info.as_deref(), Some("ESP32-D0WDQ6"));
        assert!(finished.unwrap().success);
    }

    #[tokio::test]
    async fn failed_attempt_is_recorded_as_fail() {
        let fx = fixture("echo \"A fatal error occurred\"\nexit 2");

        let result = fx.daemon.flash_device("/dev/ttyUSB0", None).await.unwrap();
        assert!(!result.success);

        let stats = fx.daemon.history().statistics(None).unwrap();
        assert_eq!(stats.fail, 1);
        assert_eq!(stats.success, 0);

        let records = fx.daemon.history().recent(1).unwrap();
        assert_eq!(records[0].status, "fail");
        assert!(records[0].error_msg.as_deref().unwrap().contains("code 2"));
    }

    #[tokio::test]
    async fn session_log_is_written_and_referenced() {
        let fx = fixture(HAPPY_TOOL);

        fx.daemon.flash_device("/dev/ttyUSB0", None).await.unwrap();

        let records = fx.daemon.history().recent(1).unwrap();
        let log_path = records[0].log_path.clone().unwrap();
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("Chip is ESP32-D0WDQ6"));
    }

    #[tokio::test]
    async fn monitor_mode_flashes_hotplugged_devices() {
        let mut fx = fixture(HAPPY_TOOL);

        let daemon = fx.daemon.clone();
        let monitor = tokio::spawn(async move { daemon.monitor_mode().await });

        // Give the monitor a moment to take its initial scan, then
        // plug a device in.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.add_device("ttyUSB0");

        let finished = timeout(WAIT, async {
            loop {
                match fx.events.recv().await {
                    Some(DaemonEvent::Finished { result, .. }) => break result,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(finished.success);

        fx.daemon.shutdown();
        timeout(WAIT, monitor).await.unwrap().unwrap();

        let stats = fx.daemon.history().statistics(None).unwrap();
        assert_eq!(stats.success, 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_attempts() {
        let fx = fixture(HAPPY_TOOL);
        fx.daemon.shutdown();

        let result = fx.daemon.flash_device("/dev/ttyUSB0", None).await;
        assert!(matches!(result, Err(FlashError::ShuttingDown)));
    }
}
