//! Environment-backed bridge configuration
//!
//! Configuration comes from the process environment, optionally seeded by a
//! `.env` file in the state directory. `.env` values take precedence over
//! inherited environment variables, matching the behavior of the companion
//! token-acquisition tooling that writes the file.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory name under `$XDG_STATE_HOME` (or `~/.local/state`) holding
/// `.env` and the credential files.
pub const STATE_DIR_NAME: &str = "cardata-bridge";

/// Resolved bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Vendor-registered client UUID; doubles as the upstream MQTT client id
    pub client_id: String,
    /// Account id: upstream MQTT username and first topic segment
    pub account_id: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub local_host: String,
    pub local_port: u16,
    /// Republication prefix, always `/`-terminated
    pub local_prefix: String,
    pub local_user: Option<String>,
    pub local_password: Option<String>,
    /// Directory holding `.env` and the credential files
    pub state_dir: PathBuf,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("state directory missing: {0} (run the token acquisition flow first)")]
    StateDirMissing(PathBuf),
    #[error("{key} missing or placeholder in environment / .env")]
    Placeholder { key: &'static str },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Resolve the state directory: `$XDG_STATE_HOME/cardata-bridge`, falling
/// back to `$HOME/.local/state/cardata-bridge`, then a relative path for
/// environments without HOME.
pub fn state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join(STATE_DIR_NAME);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".local/state").join(STATE_DIR_NAME);
        }
    }
    PathBuf::from("./.local/state").join(STATE_DIR_NAME)
}

/// Parse `.env` content into key/value pairs (pure function).
///
/// Lines are `KEY=value`; `#` lines and blank lines are skipped; a single
/// level of matching single or double quotes around the value is stripped.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    pairs
}

/// Placeholder ids are the all-ones UUID shipped in documentation examples;
/// an empty value counts as missing.
pub fn is_placeholder_uuid(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let all_ones = Regex::new(r"^1{8}-1{4}-1{4}-1{4}-1{12}$").unwrap();
    all_ones.is_match(value)
}

impl BridgeConfig {
    /// Load configuration from the process environment, seeded by
    /// `<state-dir>/.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dir = state_dir();
        if !dir.is_dir() {
            return Err(ConfigError::StateDirMissing(dir));
        }

        let mut overrides = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(dir.join(".env")) {
            overrides.extend(parse_env_file(&content));
        }

        Self::resolve(&dir, |key| {
            overrides
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })
    }

    /// Resolve configuration through a lookup function. Split out from
    /// [`BridgeConfig::from_env`] so resolution is testable without touching
    /// process state.
    pub fn resolve<F>(state_dir: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let client_id = get("CLIENT_ID").unwrap_or_default();
        if is_placeholder_uuid(&client_id) {
            return Err(ConfigError::Placeholder { key: "CLIENT_ID" });
        }
        let account_id = get("GCID").unwrap_or_default();
        if is_placeholder_uuid(&account_id) {
            return Err(ConfigError::Placeholder { key: "GCID" });
        }

        let upstream_port = parse_port("BMW_PORT", get("BMW_PORT"), 9000)?;
        let local_port = parse_port("LOCAL_PORT", get("LOCAL_PORT"), 1883)?;

        let mut local_prefix = get("LOCAL_PREFIX").unwrap_or_else(|| "bmw/".to_string());
        if !local_prefix.ends_with('/') {
            local_prefix.push('/');
        }

        Ok(Self {
            client_id,
            account_id,
            upstream_host: get("BMW_HOST")
                .unwrap_or_else(|| "customer.streaming-cardata.bmwgroup.com".to_string()),
            upstream_port,
            local_host: get("LOCAL_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            local_port,
            local_prefix,
            local_user: get("LOCAL_USER"),
            local_password: get("LOCAL_PASSWORD"),
            state_dir: state_dir.to_path_buf(),
        })
    }

    /// Topic carrying the retained connection status and the last will.
    pub fn status_topic(&self) -> String {
        format!("{}status", self.local_prefix)
    }

    /// Render the configuration for `config --show`, eliding secrets.
    pub fn display_redacted(&self) -> String {
        format!(
            "client_id      = {}\n\
             account_id     = {}\n\
             upstream       = {}:{}\n\
             local          = {}:{}\n\
             local_prefix   = {}\n\
             local_user     = {}\n\
             local_password = {}\n\
             state_dir      = {}",
            self.client_id,
            self.account_id,
            self.upstream_host,
            self.upstream_port,
            self.local_host,
            self.local_port,
            self.local_prefix,
            self.local_user.as_deref().unwrap_or("(unset)"),
            if self.local_password.is_some() { "***" } else { "(unset)" },
            self.state_dir.display(),
        )
    }
}

fn parse_port(key: &'static str, value: Option<String>, default: u16) -> Result<u16, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_parse_env_file_basic() {
        let content = "CLIENT_ID=abc\nGCID=def\n";
        let pairs = parse_env_file(content);
        assert_eq!(
            pairs,
            vec![
                ("CLIENT_ID".to_string(), "abc".to_string()),
                ("GCID".to_string(), "def".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_env_file_quotes_and_comments() {
        let content = r#"
# comment line
CLIENT_ID="quoted-value"
GCID='single quoted'
EMPTY=
BROKEN LINE WITHOUT EQUALS
  SPACED = padded value
"#;
        let pairs = parse_env_file(content);
        assert!(pairs.contains(&("CLIENT_ID".to_string(), "quoted-value".to_string())));
        assert!(pairs.contains(&("GCID".to_string(), "single quoted".to_string())));
        assert!(pairs.contains(&("EMPTY".to_string(), String::new())));
        assert!(pairs.contains(&("SPACED".to_string(), "padded value".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k.contains("BROKEN")));
    }

    #[test]
    fn test_placeholder_uuid_detection() {
        assert!(is_placeholder_uuid(""));
        assert!(is_placeholder_uuid("11111111-1111-1111-1111-111111111111"));
        assert!(!is_placeholder_uuid("11111111-1111-1111-1111-11111111111"));
        assert!(!is_placeholder_uuid("a81c3090-7f10-4b2a-9cde-1f64b1a0c001"));
    }

    #[test]
    fn test_resolve_rejects_placeholder_client_id() {
        let result = BridgeConfig::resolve(
            Path::new("/tmp"),
            lookup_from(&[
                ("CLIENT_ID", "11111111-1111-1111-1111-111111111111"),
                ("GCID", "a81c3090-7f10-4b2a-9cde-1f64b1a0c001"),
            ]),
        );
        assert!(matches!(
            result,
            Err(ConfigError::Placeholder { key: "CLIENT_ID" })
        ));
    }

    #[test]
    fn test_resolve_rejects_missing_account_id() {
        let result = BridgeConfig::resolve(
            Path::new("/tmp"),
            lookup_from(&[("CLIENT_ID", "a81c3090-7f10-4b2a-9cde-1f64b1a0c001")]),
        );
        assert!(matches!(result, Err(ConfigError::Placeholder { key: "GCID" })));
    }

    #[test]
    fn test_resolve_defaults() {
        let config = BridgeConfig::resolve(
            Path::new("/tmp"),
            lookup_from(&[
                ("CLIENT_ID", "a81c3090-7f10-4b2a-9cde-1f64b1a0c001"),
                ("GCID", "b92d41a1-8e21-4c3b-8def-2a75c2b1d002"),
            ]),
        )
        .unwrap();

        assert_eq!(config.upstream_host, "customer.streaming-cardata.bmwgroup.com");
        assert_eq!(config.upstream_port, 9000);
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.local_port, 1883);
        assert_eq!(config.local_prefix, "bmw/");
        assert_eq!(config.status_topic(), "bmw/status");
        assert!(config.local_user.is_none());
    }

    #[test]
    fn test_resolve_appends_prefix_slash() {
        let config = BridgeConfig::resolve(
            Path::new("/tmp"),
            lookup_from(&[
                ("CLIENT_ID", "a81c3090-7f10-4b2a-9cde-1f64b1a0c001"),
                ("GCID", "b92d41a1-8e21-4c3b-8def-2a75c2b1d002"),
                ("LOCAL_PREFIX", "garage/cars"),
            ]),
        )
        .unwrap();
        assert_eq!(config.local_prefix, "garage/cars/");
        assert_eq!(config.status_topic(), "garage/cars/status");
    }

    #[test]
    fn test_resolve_invalid_port() {
        let result = BridgeConfig::resolve(
            Path::new("/tmp"),
            lookup_from(&[
                ("CLIENT_ID", "a81c3090-7f10-4b2a-9cde-1f64b1a0c001"),
                ("GCID", "b92d41a1-8e21-4c3b-8def-2a75c2b1d002"),
                ("BMW_PORT", "not-a-port"),
            ]),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "BMW_PORT", .. })
        ));
    }

    #[test]
    fn test_display_redacted_hides_password() {
        let config = BridgeConfig::resolve(
            Path::new("/tmp"),
            lookup_from(&[
                ("CLIENT_ID", "a81c3090-7f10-4b2a-9cde-1f64b1a0c001"),
                ("GCID", "b92d41a1-8e21-4c3b-8def-2a75c2b1d002"),
                ("LOCAL_USER", "mosquitto"),
                ("LOCAL_PASSWORD", "hunter2"),
            ]),
        )
        .unwrap();
        let shown = config.display_redacted();
        assert!(shown.contains("mosquitto"));
        assert!(!shown.contains("hunter2"));
    }
}
