//! Configuration for vivado-remote.
//!
//! Settings are read from `~/.vivado-remote/config.toml`; every field has a
//! default and command-line flags override what the file says.
//!
//! # Configuration File
//!
//! ```toml
//! host = "localhost"
//! port = 9191
//!
//! [server]
//! exec_path = "~/Xilinx/Vivado/2023.2/bin/vivado"
//! args = ["-mode", "tcl", "-nolog", "-nojournal"]
//! poll_interval_ms = 200
//! raw_mode = true
//!
//! [client]
//! verbose = false
//! # Unset waits forever for long-running commands
//! command_timeout_secs = 7200
//! # Extra message ids never treated as failures
//! benign_messages = ["Route 35-328"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::client::classify::{Classifier, MessageId};

/// Directory under the home directory holding config and logs
pub const APP_DIR: &str = ".vivado-remote";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid benign message id: {0}")]
    MessageId(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host the server binds / the client connects to
    pub host: String,
    pub port: u16,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9191,
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Server side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path to the Vivado executable (`~` is expanded)
    pub exec_path: String,
    pub args: Vec<String>,
    pub poll_interval_ms: u64,
    /// Forward the operator's keystrokes to the shell
    pub relay_stdin: bool,
    /// Mirror shell output on the operator's terminal
    pub echo_output: bool,
    pub raw_mode: bool,
    /// Byproducts removed from the working directory after the session
    pub temp_files: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            exec_path: "vivado".to_string(),
            args: ["-mode", "tcl", "-nolog", "-nojournal"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            poll_interval_ms: 200,
            relay_stdin: true,
            echo_output: true,
            raw_mode: true,
            temp_files: [
                "usage_statistics_webtalk.html",
                "usage_statistics_webtalk.xml",
                "webtalk.log",
                "webtalk.jou",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Executable path with a leading `~` expanded
    pub fn program(&self) -> String {
        expand_home(&self.exec_path)
    }

    #[cfg(unix)]
    pub fn relay_mode(&self) -> crate::core::process::RelayMode {
        use crate::core::process::RelayMode;

        let mut mode = RelayMode::empty();
        mode.set(RelayMode::TEE_STDIN, self.relay_stdin);
        mode.set(RelayMode::TEE_STDOUT, self.echo_output);
        mode.set(RelayMode::RAW_MODE, self.raw_mode);
        mode
    }
}

/// Client side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub verbose: bool,
    pub command_timeout_secs: Option<u64>,
    pub connect_timeout_ms: u64,
    /// `"Category code"` ids added to the built-in deny-list
    pub benign_messages: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            command_timeout_secs: None,
            connect_timeout_ms: 200,
            benign_messages: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn classifier(&self) -> Result<Classifier, ConfigError> {
        let extra = self
            .benign_messages
            .iter()
            .map(|id| id.parse::<MessageId>().map_err(ConfigError::MessageId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Classifier::with_benign(extra))
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// A missing file yields defaults; an unreadable one is logged and ignored.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring config: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.vivado-remote`, created on demand
    pub fn app_dir() -> Option<PathBuf> {
        let dir = dirs::home_dir()?.join(APP_DIR);
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    fn config_path() -> Option<PathBuf> {
        Self::app_dir().map(|dir| dir.join("config.toml"))
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
