//! Per-attempt session log artifacts.
//!
//! Every flash attempt captures the full esptool output into its own text
//! file, named by port and attempt timestamp. The history store keeps the
//! path so an operator can pull up the raw tool output for any recorded
//! attempt.

use std::io;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

/// Allocates session log files under a fixed directory.
#[derive(Debug, Clone)]
pub struct SessionLogger {
    log_dir: PathBuf,
}

impl SessionLogger {
    /// Create a session logger rooted at `log_dir`, creating the
    /// directory if needed.
    pub fn new(log_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir })
    }

    /// Allocate the log path for one attempt on `port`.
    ///
    /// The file is not created here; the caller writes the captured
    /// output once the attempt finishes.
    pub fn session_path(&self, port: &str) -> PathBuf {
        let timestamp = OffsetDateTime::now_utc()
            .format(time::macros::format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))
            .unwrap_or_else(|_| "00000000_000000".to_string());
        let port_name = port.replace('/', "_");
        self.log_dir.join(format!("{port_name}_{timestamp}.log"))
    }

    /// Write captured tool output to a previously allocated path.
    pub async fn write(&self, path: &Path, output: &str) -> io::Result<()> {
        tokio::fs::write(path, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_path_encodes_port_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path()).unwrap();

        let path = logger.session_path("/dev/ttyUSB0");
        let name = path.file_name().unwrap().to_str().unwrap();

        assert!(name.starts_with("_dev_ttyUSB0_"));
        assert!(name.ends_with(".log"));
        // <port>_<YYYYMMDD>_<HHMMSS>.log
        assert_eq!(name.matches('_').count(), 4);
    }

    #[test]
    fn new_creates_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/logs");
        SessionLogger::new(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
