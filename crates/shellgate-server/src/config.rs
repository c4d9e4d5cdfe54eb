//! Server configuration: TOML file + environment + CLI overrides.

use crate::session::DEFAULT_IDLE_TIMEOUT;
use serde::Deserialize;
use shellgate_core::{GateError, GateResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable holding a comma-separated list of accepted tokens.
pub const TOKENS_ENV: &str = "SHELLGATE_TOKENS";

/// How shells are attached to sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// Pseudo-terminal via portable-pty; supports resize.
    Pty,
    /// Plain stdin/stdout/stderr pipes; resize is accepted but ignored.
    Pipe,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub screen: ScreenSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_mode")]
    pub mode: SpawnMode,
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_sessions: default_max_sessions(),
            idle_timeout: default_idle_timeout(),
            mode: default_mode(),
            shell: None,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// `[screen]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScreenSection {
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4422
}
fn default_path() -> String {
    "/ws/terminal".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}
fn default_mode() -> SpawnMode {
    SpawnMode::Pty
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub mode: Option<SpawnMode>,
    pub shell: Option<String>,
    pub max_sessions: Option<usize>,
    pub idle_timeout: Option<u64>,
}

/// Resolved server configuration. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub path: String,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub mode: SpawnMode,
    pub shell: Option<String>,
    pub tokens: Vec<String>,
    pub extra_patterns: Vec<String>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply env tokens and CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        env_tokens: Option<&str>,
        overrides: ConfigOverrides,
    ) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, env_tokens, overrides)
    }

    /// Parse the TOML body of a config file.
    pub fn parse_file(content: &str) -> GateResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| GateError::Config(format!("config parse error: {e}")))
    }

    fn resolve(
        file: ConfigFile,
        env_tokens: Option<&str>,
        overrides: ConfigOverrides,
    ) -> GateResult<Self> {
        let idle_secs = overrides.idle_timeout.unwrap_or(file.server.idle_timeout);
        // A zero timeout would end every session as soon as it started.
        if idle_secs == 0 {
            return Err(GateError::Config(
                "idle_timeout must be greater than zero".into(),
            ));
        }

        let tokens = match env_tokens {
            Some(list) => parse_token_list(list),
            None => file.auth.tokens,
        };

        Ok(Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            path: file.server.path,
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            idle_timeout: Duration::from_secs(idle_secs),
            mode: overrides.mode.unwrap_or(file.server.mode),
            shell: overrides.shell.or(file.server.shell),
            tokens,
            extra_patterns: file.screen.extra_patterns,
        })
    }

    /// `host:port` string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Split a comma-separated token list, dropping blanks.
pub fn parse_token_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
