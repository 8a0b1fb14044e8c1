use std::str::FromStr;

/// Read and parse an environment variable, falling back to `default` when
/// unset or unparsable
pub(crate) fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}

pub(crate) fn string_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
