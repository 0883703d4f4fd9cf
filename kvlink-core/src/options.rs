//! Loose option maps.
//!
//! Client and server sessions are configured from a JSON object, the same
//! shape an embedding application would pass around. These helpers read
//! individual keys leniently: a value of the wrong shape falls back to the
//! default rather than failing, except for required keys.

use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::time::Duration;

/// An option object as handed to `from_options` constructors.
pub type OptionMap = Map<String, Value>;

/// Port used when none (or an unusable one) is configured.
pub const DEFAULT_PORT: u16 = 8081;

/// Removes a required, non-empty string option.
pub fn take_required_str(options: &mut OptionMap, name: &'static str) -> Result<String, ConfigError> {
    match options.remove(name) {
        None | Some(Value::Null) => Err(ConfigError::MissingOption(name)),
        Some(Value::String(s)) if s.is_empty() => Err(ConfigError::MissingOption(name)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ConfigError::invalid(
            name,
            format!("expected a string, got {}", other),
        )),
    }
}

/// Reads a port. Numbers and numeric strings in `1..=65535` are kept;
/// anything else yields [`DEFAULT_PORT`].
pub fn port(value: Option<&Value>) -> u16 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(p) if (1..=u64::from(u16::MAX)).contains(&p) => p as u16,
        _ => DEFAULT_PORT,
    }
}

/// Reads a boolean flag. Accepts booleans and the strings
/// `true`/`false`/`1`/`0`/`yes`/`no`.
pub fn flag(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        _ => default,
    }
}

/// Reads a non-negative integer from a number or numeric string.
pub fn unsigned(value: Option<&Value>) -> Option<u64> {
    match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads a duration given in seconds.
pub fn seconds(value: Option<&Value>) -> Option<Duration> {
    match value {
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok().map(Duration::from_secs),
        _ => None,
    }
}

/// Reads a duration given in milliseconds.
pub fn millis(value: Option<&Value>) -> Option<Duration> {
    unsigned(value).map(Duration::from_millis)
}
