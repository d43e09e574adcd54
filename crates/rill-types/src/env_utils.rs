//! Typed environment variable lookups.
//!
//! Config layers overlay `RILL_*` variables on top of defaults. These helpers
//! keep that overlay to one line per setting:
//!
//! ```
//! use rill_types::env_utils::{env_bool, env_var_or};
//!
//! let timeout_ms: u64 = env_var_or("RILL_DOC_TIMEOUT_MS", 30_000);
//! let debug = env_bool("RILL_DOC_DEBUG");
//! assert_eq!(timeout_ms, 30_000);
//! assert!(!debug);
//! ```

use std::str::FromStr;

/// Parse a variable into any `FromStr` type.
///
/// Returns `None` when the variable is unset or does not parse.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a variable, falling back to `default`.
pub fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).unwrap_or(default)
}

fn truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `true` when the variable is set to `1`, `true`, `yes` or `on` (any case).
pub fn env_bool(key: &str) -> bool {
    std::env::var(key).map(|v| truthy(&v)).unwrap_or(false)
}

/// Like [`env_bool`], but an unset variable yields `default`.
pub fn env_bool_or(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => truthy(&v),
        Err(_) => default,
    }
}

/// Split a comma-separated variable, dropping empty entries.
pub fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
