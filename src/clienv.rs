use std::path::PathBuf;
use std::time::Duration;

const DRACTL_CONFIG_DIR: &str = "DRACTL_CONFIG_DIR";
const DRACTL_LOG: &str = "DRACTL_LOG";
const RUST_LOG: &str = "RUST_LOG";
const DRACTL_CALL_TIMEOUT_SECS: &str = "DRACTL_CALL_TIMEOUT_SECS";

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const DRACTL_SUBDIR: &str = "dractl";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Non-empty value of an environment variable
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory ($DRACTL_CONFIG_DIR or ~/.config/dractl)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(DRACTL_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(DRACTL_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Log filter directive ($DRACTL_LOG, then $RUST_LOG, then "info")
pub fn log_filter() -> String {
    env_opt(DRACTL_LOG)
        .or_else(|| env_opt(RUST_LOG))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Call timeout override ($DRACTL_CALL_TIMEOUT_SECS)
pub fn call_timeout_override() -> Option<Duration> {
    let val = env_opt(DRACTL_CALL_TIMEOUT_SECS);
    let parsed = val.as_deref().and_then(parse_secs);
    if val.is_some() && parsed.is_none() {
        tracing::warn!(value = ?val, "Ignoring invalid {}", DRACTL_CALL_TIMEOUT_SECS);
    }
    tracing::trace!(value = ?parsed, "DRACTL_CALL_TIMEOUT_SECS env var");
    parsed
}

fn parse_secs(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secs() {
        assert_eq!(parse_secs("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_secs(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_secs("0"), None);
        assert_eq!(parse_secs("soon"), None);
    }
}
