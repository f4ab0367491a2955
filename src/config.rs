//! Configuration for tterm.
//!
//! Loaded from `~/.tterm/config.toml`. Every field has a default, and a
//! missing or malformed file simply yields the defaults.
//!
//! ```toml
//! term_type = "xterm"
//! cols = 80
//! rows = 25
//!
//! # SSH keepalive interval in seconds, 0 disables it
//! keepalive = 0
//! connect_timeout = 10
//! prompt_timeout = 300
//! wait_timeout = 30
//!
//! known_hosts = "~/.ssh/known_hosts"
//! identity_files = ["~/.ssh/id_ed25519", "~/.ssh/id_rsa"]
//!
//! local_echo = false
//! log_level = "info"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::Settings;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Terminal type sent with the pty request and the telnet TERMINAL-TYPE answer
    pub term_type: String,
    /// Initial geometry when the host terminal size is unknown
    pub cols: u16,
    pub rows: u16,
    /// SSH keepalive interval in seconds, 0 = disabled
    pub keepalive: u32,
    /// TCP connect timeout in seconds
    pub connect_timeout: u64,
    /// How long an interactive prompt waits for an answer, in seconds
    pub prompt_timeout: u64,
    /// Default `#Waitfor` / `#Send` wait, in seconds
    pub wait_timeout: u64,
    /// OpenSSH known-hosts file
    pub known_hosts: String,
    /// Private keys tried for public-key authentication
    pub identity_files: Vec<String>,
    /// Echo keystrokes locally on pipe and serial sessions
    pub local_echo: bool,
    /// tracing filter directive
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            term_type: "xterm".to_string(),
            cols: 80,
            rows: 25,
            keepalive: 0,
            connect_timeout: 10,
            prompt_timeout: 300,
            wait_timeout: 30,
            known_hosts: "~/.ssh/known_hosts".to_string(),
            identity_files: vec![
                "~/.ssh/id_ed25519".to_string(),
                "~/.ssh/id_rsa".to_string(),
            ],
            local_echo: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `~/.tterm/config.toml`
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match toml::from_str(&content) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("ignoring malformed {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        data_dir().map(|dir| dir.join("config.toml"))
    }

    /// Transport settings derived from this configuration
    pub fn settings(&self) -> Settings {
        Settings {
            term_type: self.term_type.clone(),
            cols: self.cols,
            rows: self.rows,
            keepalive: self.keepalive,
            connect_timeout: Duration::from_secs(self.connect_timeout.max(1)),
            prompt_timeout: Duration::from_secs(self.prompt_timeout.max(1)),
            known_hosts: expand_tilde(&self.known_hosts),
            identity_files: self.identity_files.iter().map(|p| expand_tilde(p)).collect(),
            local_echo: self.local_echo,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }
}

/// `~/.tterm`, created on first use
pub fn data_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".tterm");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

/// Replace a leading `~` with the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some(rest) => match home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None if path == "~" => home_dir().unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

// Get home directory
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
