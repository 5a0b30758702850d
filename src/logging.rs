use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use chrono::Utc;
use once_cell::sync::Lazy;

/// Global gateway logger instance
static GATEWAY_LOGGER: Lazy<Mutex<Option<GatewayLogger>>> = Lazy::new(|| Mutex::new(None));

/// Appends gateway log lines to a regular log and an error log
pub struct GatewayLogger {
    log_file_path: PathBuf,
    error_file_path: PathBuf,
}

impl GatewayLogger {
    /// Initialize the gateway logger with file paths
    pub fn init(log_file_path: PathBuf, error_file_path: PathBuf) -> Result<(), String> {
        let logger = GatewayLogger {
            log_file_path,
            error_file_path,
        };

        logger.ensure_files_writable()?;

        if let Ok(mut slot) = GATEWAY_LOGGER.lock() {
            *slot = Some(logger);
        }

        log_info("Gateway logger initialized");

        Ok(())
    }

    /// Ensure log files are writable
    fn ensure_files_writable(&self) -> Result<(), String> {
        for path in [&self.log_file_path, &self.error_file_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create log directory: {}", e))?;
            }

            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Cannot write to log file {}: {}", path.display(), e))?;
        }

        Ok(())
    }

    fn write_log(&self, level: &str, message: &str) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let log_entry = format!("[{}] [{}] {}\n", timestamp, level, message);

        let file_path = match level {
            "ERROR" | "WARN" => &self.error_file_path,
            _ => &self.log_file_path,
        };

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(file_path) {
            let _ = file.write_all(log_entry.as_bytes());
            let _ = file.flush();
        }
    }
}

fn dispatch(level: &str, message: &str) {
    if let Ok(logger_guard) = GATEWAY_LOGGER.lock() {
        if let Some(logger) = logger_guard.as_ref() {
            logger.write_log(level, message);
        }
    }
}

pub fn log_info(message: &str) {
    println!("[INFO] {}", message);
    dispatch("INFO", message);
}

pub fn log_warn(message: &str) {
    eprintln!("[WARN] {}", message);
    dispatch("WARN", message);
}

pub fn log_error(message: &str) {
    eprintln!("[ERROR] {}", message);
    dispatch("ERROR", message);
}

pub fn log_debug(message: &str) {
    println!("[DEBUG] {}", message);
    dispatch("DEBUG", message);
}

/// Convenience macro for logging with format arguments
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_both_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("nested").join("gateway.log");
        let err = dir.path().join("nested").join("gateway.err.log");

        GatewayLogger::init(log.clone(), err.clone()).unwrap();
        log_warn("disk nearly full");

        assert!(log.exists());
        let errors = std::fs::read_to_string(&err).unwrap();
        assert!(errors.contains("[WARN] disk nearly full"));
    }
}
