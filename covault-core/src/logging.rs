//! Security-aware logging for the CoVault wallet core
//!
//! Structured logging with security considerations:
//! - Never logs private keys, passphrases, or decrypted backup material
//! - Truncates potentially sensitive values (addresses, transaction IDs)
//! - Provides both human-readable and machine-parseable (JSON) output
//!
//! Built on the `log` facade with an `env_logger` backend; callers that embed
//! this crate may install their own logger instead and skip [`init`] entirely.

use std::io::Write as IoWrite;
use std::sync::Once;

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default log level
    pub level: LogLevel,
    /// Whether to include source location in log messages
    pub include_source_location: bool,
    /// Whether to use JSON format (machine-readable)
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_source_location: true,
            json_format: false,
        }
    }
}

// Ensure logging is only initialized once
static LOGGING_INIT: Once = Once::new();

/// Initialize the logging system with the given configuration
///
/// Safe to call multiple times; only the first call installs the logger and
/// subsequent calls succeed without effect (common in test runs).
pub fn init(config: &LogConfig) -> Result<(), String> {
    let include_source_location = config.include_source_location;
    let json_format = config.json_format;
    let level = config.level;

    let mut result = Ok(());
    LOGGING_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level.into());
        builder.format(move |buf, record| {
            let location = if include_source_location {
                format!(
                    " [{}:{}]",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0)
                )
            } else {
                String::new()
            };
            if json_format {
                let entry = json!({
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "location": location,
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", entry)
            } else {
                writeln!(buf, "[{}{}] {}", record.level(), location, record.args())
            }
        });
        if let Err(e) = builder.try_init() {
            if !e.to_string().contains("already been initialized") {
                result = Err(e.to_string());
            }
        }
    });
    result
}

/// Update the log level dynamically
pub fn set_log_level(level: LogLevel) {
    log::set_max_level(level.into());
}

/// Sanitize a potentially sensitive string for logging
///
/// Keeps only the first and last few characters of addresses, txids, and
/// similar identifiers; very short strings are masked entirely.
pub fn sanitize_for_logging(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let len = input.len();
    if len <= 8 {
        return "*****".to_string();
    }
    format!("{}...{}", &input[0..4], &input[len - 4..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_truncates_long_values() {
        let txid = "7967a5185e907a25225574544c31f7b059c1a191d65b53dcc1554d339c4f9efc";
        let sanitized = sanitize_for_logging(txid);
        assert_eq!(sanitized, "7967...9efc");
    }

    #[test]
    fn sanitize_masks_short_values() {
        assert_eq!(sanitize_for_logging("abc"), "*****");
        assert_eq!(sanitize_for_logging(""), "");
    }
}
