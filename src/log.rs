//! Env-driven log configuration: installs an `env_logger` formatter
//! honoring `CAT_LOG_*` so runtime output, not just test noise, responds
//! to the usual knobs (destination, timestamps, source position, message
//! truncation).

use std::env;
use std::io::Write;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Where error/notice/warn logs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    Stderr,
}

/// Parsed `CAT_LOG_*` configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub destination: LogDestination,
    pub show_timestamps: bool,
    pub show_timestamps_as_relative: bool,
    pub timestamps_format: Option<String>,
    pub show_source_position: bool,
    pub str_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            destination: LogDestination::Stderr,
            show_timestamps: true,
            show_timestamps_as_relative: false,
            timestamps_format: None,
            show_source_position: false,
            str_size: 64,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let mut cfg = LogConfig::default();

        if let Ok(v) = env::var("CAT_LOG_ERROR_OUTPUT") {
            cfg.destination = match v.as_str() {
                "stdout" => LogDestination::Stdout,
                _ => LogDestination::Stderr,
            };
        }
        if let Ok(v) = env::var("CAT_LOG_SHOW_TIMESTAMPS") {
            cfg.show_timestamps = parse_bool(&v, cfg.show_timestamps);
        }
        if let Ok(v) = env::var("CAT_LOG_SHOW_TIMESTAMPS_AS_RELATIVE") {
            cfg.show_timestamps_as_relative = parse_bool(&v, cfg.show_timestamps_as_relative);
        }
        if let Ok(v) = env::var("CAT_LOG_TIMESTAMPS_FORMAT") {
            cfg.timestamps_format = Some(v);
        }
        if let Ok(v) = env::var("CAT_LOG_SHOW_SOURCE_POSITION") {
            cfg.show_source_position = parse_bool(&v, cfg.show_source_position);
        }
        if let Ok(v) = env::var("CAT_LOG_STR_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.str_size = n;
            }
        }

        cfg
    }

    /// Truncate a string to `str_size` for quoted display in log lines,
    /// appending an ellipsis marker when truncated.
    pub fn truncate_for_log<'a>(&self, s: &'a str) -> std::borrow::Cow<'a, str> {
        if s.len() <= self.str_size {
            std::borrow::Cow::Borrowed(s)
        } else {
            let mut out = s.chars().take(self.str_size).collect::<String>();
            out.push('\u{2026}');
            std::borrow::Cow::Owned(out)
        }
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        _ => default,
    }
}

/// Install a formatted `env_logger` honoring [`LogConfig`]. Idempotent: a
/// repeated call after the global logger is already installed is a no-op,
/// matching `log::set_boxed_logger`'s own one-shot contract.
pub fn init() {
    let cfg = LogConfig::from_env();
    let start = OffsetDateTime::now_utc();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format(move |buf, record| {
        let mut prefix = String::new();
        if cfg.show_timestamps {
            if cfg.show_timestamps_as_relative {
                let elapsed = OffsetDateTime::now_utc() - start;
                prefix.push_str(&format!("+{:.3}s ", elapsed.as_seconds_f64()));
            } else {
                let now = OffsetDateTime::now_utc();
                let formatted = now.format(&Rfc3339).unwrap_or_default();
                prefix.push_str(&formatted);
                prefix.push(' ');
            }
        }
        if cfg.show_source_position {
            if let (Some(file), Some(line)) = (record.file(), record.line()) {
                prefix.push_str(&format!("{}:{} ", file, line));
            }
        }
        writeln!(buf, "{}[{}] {}", prefix, record.level(), record.args())
    });

    match cfg.destination {
        LogDestination::Stdout => builder.target(env_logger::Target::Stdout),
        LogDestination::Stderr => builder.target(env_logger::Target::Stderr),
    };

    let _ = builder.try_init();
}

/// Test-only environment hints.
pub mod cfg {
    use std::env;

    pub fn use_valgrind() -> bool {
        env::var("USE_VALGRIND").map(|v| v == "1").unwrap_or(false)
    }

    pub fn offline() -> bool {
        env::var("OFFLINE").map(|v| v == "1").unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_strings() {
        let cfg = LogConfig { str_size: 4, ..LogConfig::default() };
        assert_eq!(cfg.truncate_for_log("hello"), "hell\u{2026}");
        assert_eq!(cfg.truncate_for_log("hi"), "hi");
    }

    #[test]
    fn parses_bool_env_values() {
        assert!(parse_bool("true", false));
        assert!(!parse_bool("off", true));
        assert!(parse_bool("garbage", true));
    }
}
