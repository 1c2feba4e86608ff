//! Supervisor configuration.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default delay between daemon restarts.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Default delay between cancellation and the signal broadcast on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Default maximum size of a single log file.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 128 * 1000 * 1000;

/// Default maximum count of rotated log files.
pub const DEFAULT_LOG_MAX_COUNT: u64 = 5;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Directory containing unit files
    pub unit_dir: PathBuf,
    /// Directory for log files, `None` logs to console only
    pub log_dir: Option<PathBuf>,
    /// Exit right after short units when there are no long units
    pub quick_exit: bool,
    /// Delay before a daemon is restarted
    pub restart_delay: Duration,
    /// Grace window between cancellation and signal broadcast
    pub shutdown_grace: Duration,
    /// Maximum size of a log file before rotation
    pub log_max_size: u64,
    /// Maximum count of rotated log files
    pub log_max_count: u64,
    /// Comma separated allow filter
    pub enable: String,
    /// Comma separated deny filter
    pub disable: String,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/minit.d"),
            log_dir: Some(PathBuf::from("/var/log/minit")),
            quick_exit: false,
            restart_delay: DEFAULT_RESTART_DELAY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_max_size: DEFAULT_LOG_MAX_SIZE,
            log_max_count: DEFAULT_LOG_MAX_COUNT,
            enable: String::new(),
            disable: String::new(),
        }
    }
}

impl InitConfig {
    /// Create the unit and log directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.unit_dir)?;
        if let Some(ref dir) = self.log_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Parse a log directory option, `none` disables file logging.
pub fn parse_log_dir(s: &str) -> Option<PathBuf> {
    if s.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

/// Parse a duration string like "500ms", "5s", "1m30s" or "2h".
///
/// A bare integer is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| Error::Config(format!("missing unit in duration: {}", s)))?;
        if num_len == 0 {
            return Err(Error::Config(format!("invalid duration: {}", s)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration: {}", s)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(Error::Config(format!("unknown duration unit '{}' in {}", unit, s))),
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(value * scale);
    }

    Ok(total)
}
