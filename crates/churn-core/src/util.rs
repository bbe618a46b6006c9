use std::str::FromStr;

/// Parse a boolean-like flag: 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|raw| parse_bool_flag(&raw))
}

/// Trimmed value of `key`; unset and blank are both `None`.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `Some(Err(raw))` when the variable is set but does not parse.
pub fn env_parse<T: FromStr>(key: &str) -> Option<Result<T, String>> {
    env_string(key).map(|raw| raw.parse::<T>().map_err(|_| raw))
}
