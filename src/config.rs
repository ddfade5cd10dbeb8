//! Configuration for panebox.
//!
//! Settings are read from `~/.panebox/config.toml` (or the file given with
//! `--config`). Every field is optional; command-line flags take precedence.
//!
//! ```toml
//! # Pane height in lines
//! height = 20
//!
//! # Key that ends the session: "ctrl-q", "^Q", "17" or "0x11"
//! quit_key = "ctrl-q"
//!
//! # How long to wait for more child output before painting (milliseconds)
//! flush_interval_ms = 5
//!
//! # Send Ctrl-L to the child after the host terminal is resized
//! redraw_on_resize = true
//!
//! # "pane": every erase-in-display clears the whole pane
//! # "cursor": erase below/above the cursor only
//! erase_policy = "pane"
//!
//! log_level = "info"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory under `$HOME` holding the config and log files
const CONFIG_DIR: &str = ".panebox";
const CONFIG_FILE: &str = "config.toml";
const LOG_FILE: &str = "panebox.log";

pub const DEFAULT_HEIGHT: u16 = 20;
pub const DEFAULT_QUIT_KEY: &str = "ctrl-q";
pub const DEFAULT_FLUSH_INTERVAL_MS: u16 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid quit key `{0}` (expected e.g. ctrl-q, ^Q or 0x11)")]
    QuitKey(String),

    #[error("Pane height must be at least 1")]
    Height,

    #[error("flush_interval_ms must be at least 1")]
    FlushInterval,
}

/// How erase-in-display requests are confined to the pane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErasePolicy {
    /// Any erase-in-display clears the whole pane
    #[default]
    Pane,
    /// Erase below/above clear from the cursor only
    Cursor,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pane height in lines
    pub height: u16,
    /// Quit key specification
    pub quit_key: String,
    /// Output batching interval
    pub flush_interval_ms: u16,
    /// Nudge the child to repaint after a resize
    pub redraw_on_resize: bool,
    /// Erase-in-display confinement
    pub erase_policy: ErasePolicy,
    /// Default log filter when `PANEBOX_LOG` is unset
    pub log_level: String,
    /// Log file override
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            height: DEFAULT_HEIGHT,
            quit_key: DEFAULT_QUIT_KEY.to_string(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            redraw_on_resize: true,
            erase_policy: ErasePolicy::default(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. The default location may be missing,
    /// in which case the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.height == 0 {
            return Err(ConfigError::Height);
        }
        // A zero poll timeout would spin the relay loop
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::FlushInterval);
        }
        self.quit_byte().map(|_| ())
    }

    /// The quit key as the raw byte read from the terminal
    pub fn quit_byte(&self) -> Result<u8, ConfigError> {
        parse_key(&self.quit_key).ok_or_else(|| ConfigError::QuitKey(self.quit_key.clone()))
    }

    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Get log file path, creating its directory if needed
    pub fn log_path(&self) -> Option<PathBuf> {
        let path = match &self.log_file {
            Some(path) => path.clone(),
            None => config_dir()?.join(LOG_FILE),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let _ = fs::create_dir_all(parent);
            }
        }
        Some(path)
    }
}

/// Parse a key specification into the byte the terminal sends for it.
///
/// Accepts `ctrl-x` / `ctrl+x` / `c-x`, caret notation `^X`, and plain
/// decimal or `0x` hex byte values.
pub fn parse_key(spec: &str) -> Option<u8> {
    let spec = spec.trim();
    let lower = spec.to_ascii_lowercase();

    let control = ["ctrl-", "ctrl+", "c-"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .or_else(|| lower.strip_prefix('^'));
    if let Some(rest) = control {
        return match rest.as_bytes() {
            [c @ b'a'..=b'z'] => Some(c & 0x1F),
            [c @ (b'@' | b'[' | b'\\' | b']' | b'_')] => Some(c & 0x1F),
            _ => None,
        };
    }

    if let Some(hex) = lower.strip_prefix("0x") {
        return u8::from_str_radix(hex, 16).ok();
    }
    spec.parse().ok()
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn config_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(CONFIG_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("ctrl-q"), Some(0x11));
        assert_eq!(parse_key("Ctrl+Q"), Some(0x11));
        assert_eq!(parse_key("C-a"), Some(0x01));
        assert_eq!(parse_key("^Q"), Some(0x11));
        assert_eq!(parse_key("^]"), Some(0x1D));
        assert_eq!(parse_key("17"), Some(0x11));
        assert_eq!(parse_key("0x1d"), Some(0x1D));
        assert_eq!(parse_key("ctrl-"), None);
        assert_eq!(parse_key("ctrl-qq"), None);
        assert_eq!(parse_key("300"), None);
        assert_eq!(parse_key("q!"), None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.height, 20);
        assert_eq!(config.quit_byte().unwrap(), 0x11);
        assert_eq!(config.flush_interval_ms, 5);
        assert!(config.redraw_on_resize);
        assert_eq!(config.erase_policy, ErasePolicy::Pane);
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config("height = 12\nerase_policy = \"cursor\"\n");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.height, 12);
        assert_eq!(config.erase_policy, ErasePolicy::Cursor);
        assert_eq!(config.quit_key, DEFAULT_QUIT_KEY);
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let file = write_config("erase_policy = \"everything\"\n");
        assert!(matches!(Config::load_from(file.path()), Err(ConfigError::Parse { .. })));

        let file = write_config("quit_key = \"hyper-q\"\n");
        assert!(matches!(Config::load_from(file.path()), Err(ConfigError::QuitKey(_))));

        let file = write_config("height = 0\n");
        assert!(matches!(Config::load_from(file.path()), Err(ConfigError::Height)));

        let file = write_config("flush_interval_ms = 0\n");
        assert!(matches!(Config::load_from(file.path()), Err(ConfigError::FlushInterval)));
    }

    #[test]
    fn test_validate_merged_values() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            flush_interval_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::FlushInterval)));

        let config = Config {
            quit_key: "ctrl-".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::QuitKey(_))));
    }

    #[test]
    fn test_explicit_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(Config::load(Some(&missing)), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_log_path_override() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            log_file: Some(dir.path().join("logs").join("pane.log")),
            ..Config::default()
        };
        let path = config.log_path().unwrap();
        assert!(path.parent().unwrap().exists());
        assert!(path.ends_with("logs/pane.log"));
    }
}
