//! Host configuration loading.
//!
//! TOML files are the primary source.  Merge order:
//! 1. built-in defaults
//! 2. each file named in `SIDEBOARD_CONFIG_FILES` (semicolon-separated), in
//!    order; a listed file that does not exist is an error
//! 3. `SIDEBOARD_<section>_<key>` environment scalars (dots in section
//!    names normalized to underscores), parsed as bool/int/float/string
//!
//! # Remote services
//! `[rpc_services]` maps service name -> host.  A sibling table keyed by
//! the *host* supplies per-host overrides (client cert material,
//! `jsonrpc_only`):
//!
//! ```toml
//! [rpc_services]
//! warehouse = "warehouse.example.com"
//!
//! [rpc_services."warehouse.example.com"]
//! client_cert = "/etc/sideboard/warehouse.crt"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SIDEBOARD";

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    /// Bind address for the HTTP/WebSocket listener.
    pub listen: String,
    /// Filesystem root for plugin discovery.
    pub plugins_dir: String,
    /// Default mTLS material for upstream connections.
    pub tls: TlsMaterial,
    pub ws: WsOptions,
    pub rpc_services: BTreeMap<String, RpcService>,
}

/// Client certificate material; any subset may be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub client_key: Option<String>,
    pub client_cert: Option<String>,
    pub ca: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WsOptions {
    /// Wait bound for a synchronous upstream call.
    pub call_timeout: Duration,
    /// Interval between keepalive polls on upstream clients.
    pub poll_interval: Duration,
    /// Cap on exponential reconnect back-off.
    pub reconnect_interval: Duration,
    /// Responder pool size.
    pub thread_pool: usize,
    /// Whether `/ws` requires session authentication.
    pub auth_required: bool,
}

/// One remote service registration resolved from `[rpc_services]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcService {
    pub host: String,
    /// Register only the synchronous jsonrpc proxy, no websocket client.
    pub jsonrpc_only: bool,
    /// Per-host cert overrides; falls back to the top-level material.
    pub tls: TlsMaterial,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            listen: "127.0.0.1:8282".to_owned(),
            plugins_dir: "/opt/sideboard/plugins".to_owned(),
            tls: TlsMaterial::default(),
            ws: WsOptions {
                call_timeout: Duration::from_secs(10),
                poll_interval: Duration::from_secs(30),
                reconnect_interval: Duration::from_secs(60),
                thread_pool: 10,
                auth_required: true,
            },
            rpc_services: BTreeMap::new(),
        }
    }
}

impl Config {
    /// mTLS material for a given remote service: per-host overrides first,
    /// top-level defaults for anything not overridden.
    pub fn tls_for(&self, service: &RpcService) -> TlsMaterial {
        TlsMaterial {
            client_key: service.tls.client_key.clone().or_else(|| self.tls.client_key.clone()),
            client_cert: service.tls.client_cert.clone().or_else(|| self.tls.client_cert.clone()),
            ca: service.tls.ca.clone().or_else(|| self.tls.ca.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    debug: Option<bool>,
    listen: Option<String>,
    plugins_dir: Option<String>,
    client_key: Option<String>,
    client_cert: Option<String>,
    ca: Option<String>,
    ws: Option<RawWsOptions>,
    rpc_services: Option<BTreeMap<String, toml::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWsOptions {
    call_timeout: Option<f64>,
    poll_interval: Option<f64>,
    reconnect_interval: Option<f64>,
    thread_pool: Option<usize>,
    auth_required: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRpcOverrides {
    jsonrpc_only: Option<bool>,
    client_key: Option<String>,
    client_cert: Option<String>,
    ca: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from `SIDEBOARD_CONFIG_FILES` plus environment overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    let files = std::env::var(format!("{ENV_PREFIX}_CONFIG_FILES")).unwrap_or_default();
    let paths: Vec<String> =
        files.split(';').map(str::trim).filter(|p| !p.is_empty()).map(ToOwned::to_owned).collect();
    load_config_from(&paths, std::env::vars())
}

/// Load config from an explicit file list plus an explicit environment.
/// Split out for tests, which pass synthetic environments.
pub fn load_config_from(
    paths: &[impl AsRef<Path>],
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<Config, ConfigError> {
    let mut merged = toml::Table::new();
    for path in paths {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("reading config file '{}': {}", path.display(), e))
        })?;
        let table: toml::Table =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        merge_tables(&mut merged, table);
    }
    apply_env_overrides(&mut merged, env);
    validate(merged)
}

/// Parse a single TOML string (no files, no environment).
pub fn load_config_from_str(text: &str) -> Result<Config, ConfigError> {
    let table: toml::Table = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(table)
}

// ---------------------------------------------------------------------------
// Merge + environment overrides
// ---------------------------------------------------------------------------

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let both_tables = matches!(value, toml::Value::Table(_))
            && matches!(base.get(&key), Some(toml::Value::Table(_)));
        if both_tables {
            if let (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) =
                (base.get_mut(&key), value)
            {
                merge_tables(existing, incoming);
            }
        } else {
            base.insert(key, value);
        }
    }
}

/// Sections that may be targeted by `SIDEBOARD_<section>_<key>` variables.
/// Dots in section names are normalized to underscores on the variable side.
const ENV_SECTIONS: [&str; 2] = ["ws", "rpc_services"];

fn apply_env_overrides(
    table: &mut toml::Table,
    env: impl IntoIterator<Item = (String, String)>,
) {
    let prefix = format!("{ENV_PREFIX}_");
    for (name, raw) in env {
        let Some(rest) = name.strip_prefix(&prefix) else { continue };
        if rest == "CONFIG_FILES" {
            continue;
        }
        let value = parse_scalar(&raw);
        let section = ENV_SECTIONS
            .iter()
            .find_map(|s| rest.strip_prefix(&format!("{s}_")).map(|key| (*s, key)));
        match section {
            Some((section, key)) => {
                let entry = table
                    .entry(section.to_owned())
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                if let toml::Value::Table(section_table) = entry {
                    section_table.insert(key.to_owned(), value);
                }
            }
            None => {
                table.insert(rest.to_owned(), value);
            }
        }
    }
}

/// Environment values are plain text; interpret them as the scalar they
/// spell (bool, integer, float) and fall back to a string.
fn parse_scalar(raw: &str) -> toml::Value {
    let trimmed = raw.trim();
    if let Ok(b) = trimmed.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(trimmed.to_owned())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(table: toml::Table) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::Value::Table(table)
        .try_into()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = Config::default();

    let raw_ws = raw.ws.unwrap_or_default();
    let ws = WsOptions {
        call_timeout: seconds_option("ws.call_timeout", raw_ws.call_timeout)?
            .unwrap_or(defaults.ws.call_timeout),
        poll_interval: seconds_option("ws.poll_interval", raw_ws.poll_interval)?
            .unwrap_or(defaults.ws.poll_interval),
        reconnect_interval: seconds_option("ws.reconnect_interval", raw_ws.reconnect_interval)?
            .unwrap_or(defaults.ws.reconnect_interval),
        thread_pool: match raw_ws.thread_pool {
            Some(0) => {
                return Err(ConfigError::InvalidValue(
                    "ws.thread_pool must be at least 1".to_owned(),
                ));
            }
            Some(n) => n,
            None => defaults.ws.thread_pool,
        },
        auth_required: raw_ws.auth_required.unwrap_or(defaults.ws.auth_required),
    };

    let top_tls = TlsMaterial {
        client_key: raw.client_key,
        client_cert: raw.client_cert,
        ca: raw.ca,
    };

    let mut rpc_services = BTreeMap::new();
    let raw_services = raw.rpc_services.unwrap_or_default();
    for (name, value) in &raw_services {
        let toml::Value::String(host) = value else {
            // Tables keyed by host carry per-host overrides, handled below.
            continue;
        };
        let overrides: RawRpcOverrides = match raw_services.get(host) {
            Some(section) => section
                .clone()
                .try_into()
                .map_err(|e| ConfigError::Parse(format!("rpc_services.{host}: {e}")))?,
            None => RawRpcOverrides::default(),
        };
        rpc_services.insert(
            name.clone(),
            RpcService {
                host: host.clone(),
                jsonrpc_only: overrides.jsonrpc_only.unwrap_or(false),
                tls: TlsMaterial {
                    client_key: overrides.client_key,
                    client_cert: overrides.client_cert,
                    ca: overrides.ca,
                },
            },
        );
    }

    Ok(Config {
        debug: raw.debug.unwrap_or(defaults.debug),
        listen: raw.listen.unwrap_or(defaults.listen),
        plugins_dir: raw.plugins_dir.unwrap_or(defaults.plugins_dir),
        tls: top_tls,
        ws,
        rpc_services,
    })
}

fn seconds_option(key: &str, value: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    match value {
        None => Ok(None),
        Some(secs) if secs >= 0.0 && secs.is_finite() => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(ConfigError::InvalidValue(format!("{key} must be non-negative, got {secs}"))),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
