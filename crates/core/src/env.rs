//! Environment variable helpers
//!
//! Environments are kept as sorted maps so every rendered command line is deterministic.

use std::collections::BTreeMap;

/// Prefix applied to stage parameters surfaced as environment variables
pub const PARAMETER_PREFIX: &str = "INFINITY_PARAMETER_";

/// Split `KEY=VALUE` entries into a map; entries without `=` map to an empty value
pub fn to_map<S: AsRef<str>>(entries: &[S]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.as_ref().split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.as_ref().to_string(), String::new()),
        })
        .collect()
}

/// Render a map as `KEY=VALUE` entries in key order
pub fn to_entries(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Overlay `extra` entries on top of `base` entries, later keys win
pub fn overlay<S: AsRef<str>, T: AsRef<str>>(base: &[S], extra: &[T]) -> Vec<String> {
    let mut merged = to_map(base);
    merged.extend(to_map(extra));
    to_entries(&merged)
}

/// Convert a name such as `vulnerabilityThreshold` or `some-key` to `VULNERABILITY_THRESHOLD`
/// or `SOME_KEY`
pub fn to_upper_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_uppercase() && i > 0 && !out.ends_with('_') {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower)
            {
                out.push('_');
            }
        }

        out.extend(c.to_uppercase());
    }

    out.trim_end_matches('_').to_string()
}

/// Environment variable name for a stage parameter
pub fn parameter_name(key: &str) -> String {
    format!("{}{}", PARAMETER_PREFIX, to_upper_snake_case(key))
}
