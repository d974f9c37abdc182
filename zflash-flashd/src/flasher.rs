//! Flash engine wrapping the external esptool.
//!
//! Every operation shells out to esptool and classifies the outcome from
//! its exit code and combined stdout/stderr text. The engine never
//! returns an error from [`EspFlasher::flash`]: firmware validation
//! failures, spawn failures, timeouts, and nonzero exits all become
//! failure-carrying [`FlashResult`]s so one bad device can't poison a
//! batch. Retry policy, if any, belongs to the orchestrator.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::Config;
use crate::tracing::prelude::*;

/// Timeout for chip identification queries.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Guard timeout for a full write_flash invocation.
const FLASH_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for erase_flash invocations.
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt lifecycle states.
///
/// An attempt moves `NotStarted → Identifying → Flashing` and terminates
/// in `Succeeded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    NotStarted,
    Identifying,
    Flashing,
    Succeeded,
    Failed,
}

/// Outcome of one flash attempt. Immutable once produced.
#[derive(Debug, Clone)]
pub struct FlashResult {
    pub success: bool,
    pub port: String,
    pub chip_type: Option<String>,
    pub mac: Option<String>,
    pub duration: Duration,
    pub error_msg: Option<String>,
    pub log_output: String,
}

impl FlashResult {
    /// A failure result carrying no captured output.
    pub fn failure(port: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            success: false,
            port: port.into(),
            chip_type: None,
            mac: None,
            duration: Duration::ZERO,
            error_msg: Some(error_msg.into()),
            log_output: String::new(),
        }
    }
}

/// Drives esptool against one port at a time.
#[derive(Debug, Clone)]
pub struct EspFlasher {
    chip: String,
    baud_rate: u32,
    verify: bool,
    esptool: PathBuf,
}

impl EspFlasher {
    pub fn new(config: &Config) -> Self {
        Self {
            chip: config.chip.clone(),
            baud_rate: config.baud_rate,
            verify: config.verify,
            esptool: config.esptool_path.clone(),
        }
    }

    /// Query chip type and MAC address from the device.
    ///
    /// Never fails: a tool error, timeout, or unparseable output yields
    /// `(None, None)`.
    pub async fn identify(&self, port: &str) -> (Option<String>, Option<String>) {
        let result = tokio::time::timeout(
            IDENTIFY_TIMEOUT,
            Command::new(&self.esptool)
                .arg("--port")
                .arg(port)
                .arg("--baud")
                .arg(self.baud_rate.to_string())
                .arg("chip_id")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                (parse_chip(&text), parse_mac(&text))
            }
            Ok(Err(e)) => {
                debug!(port = %port, error = %e, "chip identification spawn failed");
                (None, None)
            }
            Err(_) => {
                debug!(port = %port, "chip identification timed out");
                (None, None)
            }
        }
    }

    /// Flash `firmware` onto the device at `port`.
    ///
    /// `progress` receives each percentage esptool reports. All tool
    /// output is captured into the result's `log_output` whether or not
    /// the attempt succeeds. Duration is measured end to end.
    pub async fn flash(
        &self,
        port: &str,
        firmware: &Path,
        offset: u32,
        mut progress: impl FnMut(u8) + Send,
    ) -> FlashResult {
        let started = Instant::now();
        let mut result = FlashResult {
            success: false,
            port: port.to_string(),
            chip_type: None,
            mac: None,
            duration: Duration::ZERO,
            error_msg: None,
            log_output: String::new(),
        };

        // Missing firmware fails fast, before any process is spawned.
        if !firmware.exists() {
            result.error_msg = Some(format!("firmware file not found: {}", firmware.display()));
            result.duration = started.elapsed();
            return result;
        }

        let (chip_type, mac) = self.identify(port).await;
        result.chip_type = chip_type;
        result.mac = mac;

        let mut command = Command::new(&self.esptool);
        command
            .arg("--chip")
            .arg(&self.chip)
            .arg("--port")
            .arg(port)
            .arg("--baud")
            .arg(self.baud_rate.to_string())
            .arg("write_flash");
        if self.verify {
            command.arg("--verify");
        }
        command
            .arg("-z")
            .arg(format!("{offset:#x}"))
            .arg(firmware)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                result.error_msg = Some(format!("failed to launch esptool: {e}"));
                result.duration = started.elapsed();
                return result;
            }
        };

        let mut stdout = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines());
        let mut stderr = child
            .stderr
            .take()
            .map(|err| BufReader::new(err).lines());

        let mut log_output = String::new();

        let run = async {
            loop {
                let line = tokio::select! {
                    line = next_line(&mut stdout), if stdout.is_some() => line,
                    line = next_line(&mut stderr), if stderr.is_some() => line,
                    else => break,
                };
                if let Some(line) = line {
                    if let Some(percent) = parse_progress(&line) {
                        progress(percent);
                    }
                    log_output.push_str(&line);
                    log_output.push('\n');
                }
            }
            child.wait().await
        };

        match tokio::time::timeout(FLASH_TIMEOUT, run).await {
            Ok(Ok(status)) if status.success() => {
                result.success = true;
            }
            Ok(Ok(status)) => {
                result.error_msg = Some(match status.code() {
                    Some(code) => format!("esptool failed with code {code}"),
                    None => "esptool terminated by signal".to_string(),
                });
            }
            Ok(Err(e)) => {
                result.error_msg = Some(format!("flash error: {e}"));
            }
            Err(_) => {
                // Killing a half-finished write can leave the device
                // partially programmed; the attempt is abandoned anyway
                // once the bound is exceeded.
                result.error_msg = Some("flash operation timed out".to_string());
            }
        }

        result.log_output = log_output;
        result.duration = started.elapsed();
        result
    }

    /// Erase the device's entire flash. Any failure maps to `false`.
    pub async fn erase_flash(&self, port: &str) -> bool {
        let result = tokio::time::timeout(
            ERASE_TIMEOUT,
            Command::new(&self.esptool)
                .arg("--chip")
                .arg(&self.chip)
                .arg("--port")
                .arg(port)
                .arg("--baud")
                .arg(self.baud_rate.to_string())
                .arg("erase_flash")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        matches!(result, Ok(Ok(output)) if output.status.success())
    }

    /// Check whether a flashable chip answers on `port`: the serial
    /// handle must open and identification must resolve a chip type.
    pub async fn verify_port(&self, port: &str) -> bool {
        let path = port.to_string();
        let baud = self.baud_rate;
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(path, baud)
                .timeout(Duration::from_secs(1))
                .open()
                .is_ok()
        })
        .await
        .unwrap_or(false);

        if !opened {
            return false;
        }

        self.identify(port).await.0.is_some()
    }
}

/// Read the next line from an optional line stream, clearing the stream
/// once it is exhausted so the read loop's `select!` can converge.
async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    let stream = lines.as_mut()?;
    match stream.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(_) => {
            *lines = None;
            None
        }
    }
}

fn parse_chip(output: &str) -> Option<String> {
    Regex::new(r"Chip is (ESP[^\s]+)")
        .ok()?
        .captures(output)
        .map(|caps| caps[1].to_string())
}

fn parse_mac(output: &str) -> Option<String> {
    Regex::new(r"(?i)MAC: ([0-9a-f:]+)")
        .ok()?
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Extract a progress percentage from one output line, e.g.
/// `Writing at 0x00001000... (42 %)` → 42.
fn parse_progress(line: &str) -> Option<u8> {
    let caps = Regex::new(r"\((\d+)\s*%\)").ok()?.captures(line)?;
    caps[1].parse().ok().filter(|percent| *percent <= 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Write a fake esptool script and return a flasher invoking it.
    ///
    /// The script logs each invocation's arguments to `calls.log` in the
    /// same directory, then runs `body`.
    fn fake_esptool(dir: &Path, body: &str) -> EspFlasher {
        use std::os::unix::fs::PermissionsExt;

        let tool = dir.join("esptool");
        let calls = dir.join("calls.log");
        let script = format!("#!/bin/sh\necho \"$@\" >> {}\n{body}\n", calls.display());
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            esptool_path: tool,
            ..Config::default()
        };
        EspFlasher::new(&config)
    }

    fn invocation_count(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("calls.log"))
            .map(|text| text.lines().count())
            .unwrap_or(0)
    }

    const HAPPY_TOOL: &str = r#"
echo "Chip is ESP32-D0WDQ6 (revision v1.0)"
echo "MAC: aa:bb:cc:dd:ee:ff"
echo "Writing at 0x00001000... (50 %)"
echo "Writing at 0x00008000... (100 %)"
echo "Hash of data verified."
exit 0"#;

    #[test]
    fn progress_lines_parse_to_percentages() {
        assert_eq!(parse_progress("Writing at 0x00001000... (42 %)"), Some(42));
        assert_eq!(parse_progress("Writing at 0x0000c000... (100 %)"), Some(100));
        assert_eq!(parse_progress("Wrote 1024 bytes (3 %) compressed"), Some(3));
        // No parenthesized percentage: no callback.
        assert_eq!(parse_progress("Connecting...."), None);
        assert_eq!(parse_progress("Writing at 0x00001000..."), None);
        // Out-of-range values are dropped rather than forwarded.
        assert_eq!(parse_progress("(250 %)"), None);
    }

    #[test]
    fn identification_lines_parse() {
        let output = "esptool.py v4.7\nChip is ESP32-S3 (QFN56)\nMAC: 7c:df:a1:00:3c:6e\n";
        assert_eq!(parse_chip(output), Some("ESP32-S3".to_string()));
        assert_eq!(parse_mac(output), Some("7c:df:a1:00:3c:6e".to_string()));

        assert_eq!(parse_chip("garbage"), None);
        assert_eq!(parse_mac("garbage"), None);
    }

    #[tokio::test]
    async fn missing_firmware_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = fake_esptool(dir.path(), "exit 0");

        let result = flasher
            .flash("/dev/ttyUSB0", Path::new("missing.bin"), 0x1000, |_| {})
            .await;

        assert!(!result.success);
        assert!(result.error_msg.as_deref().unwrap().contains("missing.bin"));
        assert!(result.duration < Duration::from_millis(100));
        assert_eq!(invocation_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn successful_flash_captures_identity_progress_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"\xe9firmware").unwrap();
        let flasher = fake_esptool(dir.path(), HAPPY_TOOL);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |percent| seen.lock().unwrap().push(percent)
        };

        let result = flasher.flash("/dev/ttyUSB0", &firmware, 0x1000, sink).await;

        assert!(result.success);
        assert_eq!(result.chip_type.as_deref(), Some("ESP32-D0WDQ6"));
        assert_eq!(result.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
        assert!(result.log_output.contains("Hash of data verified."));
        // identify + write_flash
        assert_eq!(invocation_count(dir.path()), 2);
    }

    #[tokio::test]
    async fn nonzero_exit_classifies_as_failure_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"\xe9firmware").unwrap();
        let flasher = fake_esptool(dir.path(), "echo \"A fatal error occurred\"\nexit 2");

        let result = flasher.flash("/dev/ttyUSB0", &firmware, 0x1000, |_| {}).await;

        assert!(!result.success);
        assert!(result.error_msg.as_deref().unwrap().contains("code 2"));
        assert!(result.log_output.contains("A fatal error occurred"));
    }

    #[tokio::test]
    async fn identify_failure_leaves_fields_empty_but_attempt_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"\xe9firmware").unwrap();
        // Tool produces no identification lines at all.
        let flasher = fake_esptool(dir.path(), "echo \"Writing at 0x0 (100 %)\"\nexit 0");

        let result = flasher.flash("/dev/ttyUSB0", &firmware, 0x1000, |_| {}).await;

        assert!(result.success);
        assert_eq!(result.chip_type, None);
        assert_eq!(result.mac, None);
    }

    #[tokio::test]
    async fn erase_maps_exit_codes_to_bool() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = fake_esptool(dir.path(), "exit 0");
        assert!(flasher.erase_flash("/dev/ttyUSB0").await);

        let dir = tempfile::tempdir().unwrap();
        let flasher = fake_esptool(dir.path(), "exit 1");
        assert!(!flasher.erase_flash("/dev/ttyUSB0").await);
    }

    #[tokio::test]
    async fn verify_port_is_false_when_the_port_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        // Even a tool that reports a chip can't rescue an unopenable port.
        let flasher = fake_esptool(dir.path(), "echo \"Chip is ESP32\"\nexit 0");

        assert!(!flasher.verify_port("/nonexistent/ttyUSB0").await);
        assert_eq!(invocation_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn spawn_failure_becomes_a_failure_result() {
        let config = Config {
            esptool_path: PathBuf::from("/nonexistent/esptool"),
            ..Config::default()
        };
        let flasher = EspFlasher::new(&config);

        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"\xe9firmware").unwrap();

        let result = flasher.flash("/dev/ttyUSB0", &firmware, 0x1000, |_| {}).await;
        assert!(!result.success);
        assert!(result.error_msg.is_some());
    }
}
