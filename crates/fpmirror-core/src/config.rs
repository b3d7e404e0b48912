//! Configuration resolution for fpmirror.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`~/.config/fpmirror/settings.json` or an explicit path)
//! 3. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Length of an Ed25519 public key as carried in `trusted_senders`.
const SENDER_KEY_LEN: usize = 32;

/// Complete fpmirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Handshake engine policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Consecutive key-unwrap failures tolerated before the session is
    /// declared failed.
    pub max_unwrap_failures: u32,
    /// Hex-encoded Ed25519 public keys of senders allowed to pair.
    /// Empty means any sender that proves possession of its key.
    pub trusted_senders: Vec<String>,
    /// File holding the receiver's 32-byte Ed25519 secret.
    pub identity_key_path: Option<PathBuf>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_unwrap_failures: 8,
            trusted_senders: Vec::new(),
            identity_key_path: None,
        }
    }
}

impl HandshakeConfig {
    /// Decode `trusted_senders` into raw public keys.
    pub fn trusted_sender_keys(&self) -> Result<Vec<[u8; SENDER_KEY_LEN]>> {
        self.trusted_senders
            .iter()
            .map(|entry| {
                let bytes = hex::decode(entry.trim()).map_err(|e| {
                    Error::Config(format!("trusted sender key {entry:?} is not hex: {e}"))
                })?;
                <[u8; SENDER_KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
                    Error::Config(format!(
                        "trusted sender key {entry:?} must be {SENDER_KEY_LEN} bytes, got {}",
                        bytes.len()
                    ))
                })
            })
            .collect()
    }

    /// Reject settings the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_unwrap_failures == 0 {
            return Err(Error::Config(
                "handshake.max_unwrap_failures must be at least 1".to_string(),
            ));
        }
        self.trusted_sender_keys().map(|_| ())
    }
}

/// Log output settings consumed by [`crate::tracing_init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "fpmirror=info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit_path` takes precedence over the global settings file.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut config = match explicit_path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global_path) if global_path.exists() => load_config_file(&global_path)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config);
    config.handshake.validate()?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".fpmirror").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/fpmirror/settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("fpmirror").join("settings.json"))
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup so tests don't touch the process
/// environment.
fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let max_failures = lookup("FPMIRROR_MAX_UNWRAP_FAILURES");
    if let Some(n) = max_failures.and_then(|val| val.parse().ok()) {
        config.handshake.max_unwrap_failures = n;
    }
    if let Some(val) = lookup("FPMIRROR_IDENTITY_KEY") {
        config.handshake.identity_key_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("FPMIRROR_LOG_FILTER") {
        config.logging.filter = val;
    }
    if let Some(val) = lookup("FPMIRROR_LOG_JSON") {
        config.logging.json = matches!(val.as_str(), "1" | "true" | "yes");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_allows_eight_unwrap_failures() {
        let config = Config::default();
        assert_eq!(config.handshake.max_unwrap_failures, 8);
        assert!(config.handshake.trusted_senders.is_empty());
        assert!(config.handshake.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"handshake": {"max_unwrap_failures": 3}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.handshake.max_unwrap_failures, 3);
        assert_eq!(config.logging.filter, "fpmirror=info");
        assert!(config.handshake.identity_key_path.is_none());
    }

    #[test]
    fn explicit_path_is_loaded_and_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"handshake": {"max_unwrap_failures": 0}}"#).unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("FPMIRROR_MAX_UNWRAP_FAILURES", "2"),
            ("FPMIRROR_IDENTITY_KEY", "/var/lib/fpmirror/identity.key"),
            ("FPMIRROR_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides(&mut config, |key| env.get(key).map(ToString::to_string));

        assert_eq!(config.handshake.max_unwrap_failures, 2);
        assert_eq!(
            config.handshake.identity_key_path.as_deref(),
            Some(Path::new("/var/lib/fpmirror/identity.key"))
        );
        assert!(config.logging.json);
        assert_eq!(config.logging.filter, "fpmirror=info");
    }

    #[test]
    fn unparsable_numeric_override_is_ignored() {
        let mut config = Config::default();
        apply_overrides(&mut config, |key| {
            (key == "FPMIRROR_MAX_UNWRAP_FAILURES").then(|| "many".to_string())
        });
        assert_eq!(config.handshake.max_unwrap_failures, 8);
    }

    #[test]
    fn trusted_sender_keys_decode() {
        let config = HandshakeConfig {
            trusted_senders: vec!["ab".repeat(32)],
            ..HandshakeConfig::default()
        };
        let keys = config.trusted_sender_keys().unwrap();
        assert_eq!(keys, vec![[0xab; 32]]);
    }

    #[test]
    fn trusted_sender_keys_reject_bad_entries() {
        let short = HandshakeConfig {
            trusted_senders: vec!["abcd".to_string()],
            ..HandshakeConfig::default()
        };
        assert!(short.validate().is_err());

        let not_hex = HandshakeConfig {
            trusted_senders: vec!["zz".repeat(32)],
            ..HandshakeConfig::default()
        };
        assert!(not_hex.validate().is_err());
    }
}
