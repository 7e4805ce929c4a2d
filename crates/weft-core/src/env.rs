//! Environment variable helpers for runtime configuration

use std::str::FromStr;

/// Parse an environment variable as `T`, or return the default.
///
/// Unset variables and parse failures both fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) are true; anything else
/// set is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
