// Configuration loading and parsing (hub.toml, credentials.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to create {path}: {message}")]
    SeedFailed { path: PathBuf, message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
    pub tournament: TournamentConfig,
    pub credentials: CredentialsConfig,
    pub db_path: PathBuf,
}

// ---------------------------------------------------------------------------
// hub.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire hub.toml file.
#[derive(Debug, Clone, Deserialize)]
struct HubFile {
    hub: HubConfig,
    #[serde(default)]
    connection: ConnectionConfig,
    tournament: TournamentConfig,
    #[serde(default)]
    database: DatabaseSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DatabaseSection {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Base URL for the request/response administrative API.
    pub api_base_url: String,
    /// Streaming endpoints in the order they are tried. Derived from
    /// `api_base_url` when left empty.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_client_name() -> String {
    "dartplan".into()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_secure_timeout")]
    pub secure_connect_timeout_secs: u64,
    #[serde(default = "default_plain_timeout")]
    pub plain_connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Upper bound on each administrative HTTP call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_secure_timeout() -> u64 {
    15
}
fn default_plain_timeout() -> u64 {
    8
}
fn default_read_timeout() -> u64 {
    60
}
fn default_keepalive() -> u64 {
    25
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_status_interval() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            secure_connect_timeout_secs: default_secure_timeout(),
            plain_connect_timeout_secs: default_plain_timeout(),
            read_timeout_secs: default_read_timeout(),
            keepalive_interval_secs: default_keepalive(),
            reconnect_delay_secs: default_reconnect_delay(),
            status_interval_secs: default_status_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ConnectionConfig {
    /// Connect timeout for an endpoint: secure endpoints get the longer one.
    pub fn connect_timeout(&self, url: &str) -> Duration {
        if url.starts_with("wss://") {
            Duration::from_secs(self.secure_connect_timeout_secs)
        } else {
            Duration::from_secs(self.plain_connect_timeout_secs)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TournamentConfig {
    /// Fixed tournament id. When empty the most recently stored tournament is
    /// reused, or a new id is generated.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Read `config/hub.toml` and, when present, `config/credentials.toml` under
/// `base_dir`, fill in derived endpoints and the database path, and validate.
/// Nothing is seeded here; see `ensure_config_files`.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let file: HubFile = parse_toml(&config_dir.join("hub.toml"))?;
    let HubFile {
        mut hub,
        connection,
        tournament,
        database,
    } = file;
    if hub.endpoints.is_empty() {
        hub.endpoints = derive_endpoints(&hub.api_base_url);
    }

    let credentials_path = config_dir.join("credentials.toml");
    let credentials: CredentialsConfig = if credentials_path.exists() {
        parse_toml(&credentials_path)?
    } else {
        CredentialsConfig::default()
    };

    let db_path = match database.path.trim() {
        "" => default_db_path(),
        relative => base_dir.join(relative),
    };

    let config = Config {
        hub,
        connection,
        tournament,
        credentials,
        db_path,
    };
    validate(&config)?;
    Ok(config)
}

/// hub.toml as shipped, used when no `defaults/hub.toml` sits next to the
/// working directory.
const BUILTIN_HUB_TOML: &str = include_str!("../defaults/hub.toml");

/// Make sure `config/hub.toml` exists so the Hub client can start on a fresh
/// machine. The seed is `defaults/hub.toml` when present, else the built-in
/// copy. An existing hub.toml is never touched, and credentials.toml is never
/// created: the API key stays opt-in. Returns the path written, if any.
pub fn ensure_config_files(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let config_dir = base_dir.join("config");
    let target = config_dir.join("hub.toml");
    if target.exists() {
        return Ok(None);
    }

    let local_defaults = base_dir.join("defaults").join("hub.toml");
    let seed = if local_defaults.is_file() {
        std::fs::read_to_string(&local_defaults).map_err(|e| seed_failed(&local_defaults, e))?
    } else {
        BUILTIN_HUB_TOML.to_string()
    };

    std::fs::create_dir_all(&config_dir).map_err(|e| seed_failed(&config_dir, e))?;
    // create_new: a hub.toml written concurrently by someone else wins.
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(seed_failed(&target, e)),
    };
    std::io::Write::write_all(&mut file, seed.as_bytes()).map_err(|e| seed_failed(&target, e))?;

    info!("created {} with default Hub settings", target.display());
    if !config_dir.join("credentials.toml").exists() {
        info!("no credentials.toml; administrative Hub calls go out without an API key");
    }
    Ok(Some(target))
}

fn seed_failed(path: &Path, e: std::io::Error) -> ConfigError {
    ConfigError::SeedFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Load configuration relative to the working directory, seeding hub.toml
/// first if it is missing.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Streaming endpoints implied by the API base URL: secure first, then
/// plaintext, both at `/ws`.
pub fn derive_endpoints(api_base_url: &str) -> Vec<String> {
    let trimmed = api_base_url.trim().trim_end_matches('/');
    let host = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    if host.is_empty() {
        return Vec::new();
    }
    let host = host.split('/').next().unwrap_or(host);
    vec![format!("wss://{host}/ws"), format!("ws://{host}/ws")]
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "dartplan")
        .map(|dirs| dirs.data_dir().join("dartplan.db"))
        .unwrap_or_else(|| PathBuf::from("dartplan.db"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.hub.endpoints.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "hub.endpoints".into(),
            message: "no streaming endpoint configured and none derivable from api_base_url"
                .into(),
        });
    }
    for url in &config.hub.endpoints {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::ValidationError {
                field: "hub.endpoints".into(),
                message: format!("must start with ws:// or wss://, got {url}"),
            });
        }
    }

    let c = &config.connection;
    let intervals: &[(&str, u64)] = &[
        ("connection.secure_connect_timeout_secs", c.secure_connect_timeout_secs),
        ("connection.plain_connect_timeout_secs", c.plain_connect_timeout_secs),
        ("connection.read_timeout_secs", c.read_timeout_secs),
        ("connection.keepalive_interval_secs", c.keepalive_interval_secs),
        ("connection.reconnect_delay_secs", c.reconnect_delay_secs),
        ("connection.status_interval_secs", c.status_interval_secs),
        ("connection.request_timeout_secs", c.request_timeout_secs),
    ];
    for (name, val) in intervals {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }
    if c.read_timeout_secs <= c.keepalive_interval_secs {
        return Err(ConfigError::ValidationError {
            field: "connection.read_timeout_secs".into(),
            message: format!(
                "must be greater than keepalive_interval_secs ({}), got {}",
                c.keepalive_interval_secs, c.read_timeout_secs
            ),
        });
    }

    if config.tournament.name.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "tournament.name".into(),
            message: "must not be empty".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
