//! Configuration for the Kiln build server.
//!
//! Every section and field is optional; [`KilnConfig`] accessors fall back
//! to the defaults below. The file lives at `~/.kiln/config.toml` unless
//! `KILN_CONFIG` points elsewhere.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8212;
pub const DEFAULT_BACKLOG: u32 = 10;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_REAPER_DELAY_MS: u64 = 100;

const CONFIG_ENV_VAR: &str = "KILN_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct KilnConfig {
    pub server: Option<ServerSection>,
    pub dispatcher: Option<DispatcherSection>,
    pub reaper: Option<ReaperSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerSection {
    /// `"tcp"` or `"unix"`.
    pub transport: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backlog: Option<u32>,
    pub socket_path: Option<String>,
    /// `"loop"` (default) or `"single"`.
    pub accept: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DispatcherSection {
    pub workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReaperSection {
    pub delay_ms: Option<u64>,
    pub clients_dir: Option<String>,
}

/// Transport selected by `[server] transport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChoice {
    Tcp {
        host: String,
        port: u16,
        backlog: u32,
    },
    Unix {
        path: PathBuf,
    },
}

/// Whether the server keeps accepting after the first connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptChoice {
    #[default]
    Loop,
    Single,
}

/// Expand `${VAR}` references. Unset variables expand to the empty string.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    out
}

impl KilnConfig {
    /// Load from the default location. Missing or unreadable files yield `None`.
    pub fn load() -> Option<Self> {
        let path = config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return None;
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                None
            }
        }
    }

    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn transport(&self) -> TransportChoice {
        let server = self.server.as_ref();
        let kind = server
            .and_then(|s| s.transport.as_deref())
            .map(|t| t.trim().to_ascii_lowercase());

        if kind.as_deref() == Some("unix") {
            let path = server
                .and_then(|s| s.socket_path.as_deref())
                .map(|p| PathBuf::from(expand_env_vars(p)))
                .unwrap_or_else(default_socket_path);
            return TransportChoice::Unix { path };
        }

        if let Some(other) = kind.as_deref()
            && other != "tcp"
        {
            tracing::warn!("Unknown transport in config: {other}; using tcp");
        }

        TransportChoice::Tcp {
            host: server
                .and_then(|s| s.host.clone())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: server.and_then(|s| s.port).unwrap_or(DEFAULT_PORT),
            backlog: server.and_then(|s| s.backlog).unwrap_or(DEFAULT_BACKLOG),
        }
    }

    #[must_use]
    pub fn accept(&self) -> AcceptChoice {
        let raw = self.server.as_ref().and_then(|s| s.accept.as_deref());
        match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            None | Some("loop") => AcceptChoice::Loop,
            Some("single") => AcceptChoice::Single,
            Some(other) => {
                tracing::warn!("Unknown accept mode in config: {other}; using loop");
                AcceptChoice::Loop
            }
        }
    }

    /// Dispatcher pool size, never below one.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.dispatcher
            .as_ref()
            .and_then(|d| d.workers)
            .unwrap_or(DEFAULT_WORKERS)
            .max(1)
    }

    #[must_use]
    pub fn reaper_delay(&self) -> Duration {
        let ms = self
            .reaper
            .as_ref()
            .and_then(|r| r.delay_ms)
            .unwrap_or(DEFAULT_REAPER_DELAY_MS);
        Duration::from_millis(ms)
    }

    #[must_use]
    pub fn clients_dir(&self) -> PathBuf {
        self.reaper
            .as_ref()
            .and_then(|r| r.clients_dir.as_deref())
            .map(|p| PathBuf::from(expand_env_vars(p)))
            .unwrap_or_else(default_clients_dir)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(explicit) = env::var(CONFIG_ENV_VAR)
        && !explicit.trim().is_empty()
    {
        return Some(PathBuf::from(explicit));
    }
    kiln_home().map(|home| home.join("config.toml"))
}

/// `~/.kiln`, when a home directory is known.
#[must_use]
pub fn kiln_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kiln"))
}

fn default_socket_path() -> PathBuf {
    kiln_home()
        .unwrap_or_else(|| PathBuf::from(".kiln"))
        .join("kiln.sock")
}

fn default_clients_dir() -> PathBuf {
    kiln_home()
        .unwrap_or_else(|| PathBuf::from(".kiln"))
        .join("clients")
}
