//! Environment toggles.

/// Forces multi-backend interception on or off regardless of discovery.
pub const INTERCEPT_ENV: &str = "UNIMEM_ENABLE_LOADER_INTERCEPT";

/// Parse a boolean toggle. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Read a boolean toggle from the environment.
///
/// Unset variables yield `None`; unrecognized values are ignored with a warning.
pub fn env_to_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    let parsed = parse_bool(&value);
    if parsed.is_none() {
        tracing::warn!("ignoring {}={:?}: expected a boolean", name, value);
    }
    parsed
}
