use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::{env_bool, env_parse, env_string};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_ITERATIONS: u64 = 10;
pub const DEFAULT_PACING_MS: u64 = 1000;
pub const DEFAULT_SETTLE_MS: u64 = 2000;
pub const DEFAULT_WARMUP_MS: u64 = 4000;
pub const DEFAULT_CHURN_INTERVAL_SECS: u64 = 180;
pub const DEFAULT_RECONNECT_TIMEOUT_SECS: u64 = 4;
pub const DEFAULT_STORE_DIR: &str = "state";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process broker.
    #[default]
    Local,
    Nats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,
    /// NATS server URL, e.g. <nats://127.0.0.1:4222>
    #[serde(default)]
    pub nats_url: Option<String>,
}

impl BrokerConfig {
    pub fn transport(&self) -> TransportKind {
        self.transport.unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Number of workload actions ("packets").
    #[serde(default)]
    pub iterations: Option<u64>,
    /// Size of the topic universe; defaults to the iteration count.
    #[serde(default)]
    pub topics: Option<usize>,
    /// Delay after every action and every received message.
    #[serde(default)]
    pub pacing_ms: Option<u64>,
    /// Wait between a successful connect and its CONNECT event.
    #[serde(default)]
    pub settle_ms: Option<u64>,
    /// Wait between the initial connect and the first action.
    #[serde(default)]
    pub warmup_ms: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Fixed client id instead of a generated one.
    #[serde(default)]
    pub client_id: Option<String>,
}

impl RunConfig {
    pub fn topic_count(&self, iterations: u64) -> usize {
        self.topics
            .unwrap_or_else(|| usize::try_from(iterations).unwrap_or(usize::MAX))
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms.unwrap_or(DEFAULT_PACING_MS))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms.unwrap_or(DEFAULT_SETTLE_MS))
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms.unwrap_or(DEFAULT_WARMUP_MS))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChurnConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub reconnect_timeout_secs: Option<u64>,
}

impl ChurnConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(DEFAULT_CHURN_INTERVAL_SECS))
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.reconnect_timeout_secs
                .unwrap_or(DEFAULT_RECONNECT_TIMEOUT_SECS),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Option<StoreBackend>,
    /// Directory holding the SQLite audit database.
    #[serde(default)]
    pub dir: Option<String>,
}

impl StoreConfig {
    pub fn backend(&self) -> StoreBackend {
        self.backend.unwrap_or_default()
    }

    pub fn dir(&self) -> &Path {
        Path::new(self.dir.as_deref().unwrap_or(DEFAULT_STORE_DIR))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default)]
    pub log_topic: Option<String>,
    #[serde(default)]
    pub disconnect_topic: Option<String>,
}

impl AuditConfig {
    pub fn log_topic(&self) -> &str {
        self.log_topic
            .as_deref()
            .unwrap_or(churn_topics::TOPIC_CONNECTION_LOGS)
    }

    pub fn disconnect_topic(&self) -> &str {
        self.disconnect_topic
            .as_deref()
            .unwrap_or(churn_topics::TOPIC_DISCONNECTION_LOGS)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub churn: ChurnConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Config {
    /// Apply `CHURN_*` environment overrides on top of file values.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = env_string("CHURN_BROKER_HOST") {
            self.broker.host = Some(host);
        }
        match env_parse::<u16>("CHURN_BROKER_PORT") {
            Some(Ok(port)) => self.broker.port = Some(port),
            Some(Err(raw)) => warn!(value = %raw, "ignoring invalid CHURN_BROKER_PORT"),
            None => {}
        }
        if let Some(url) = env_string("CHURN_NATS_URL") {
            self.broker.nats_url = Some(url);
        }
        if let Some(dir) = env_string("CHURN_STORE_DIR") {
            self.store.dir = Some(dir);
        }
        if let Some(enabled) = env_bool("CHURN_CHURN_ENABLED") {
            self.churn.enabled = Some(enabled);
        }
    }
}

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_value(&schema)?)
}

static CONFIG_VALIDATOR: Lazy<Result<Validator, String>> = Lazy::new(|| {
    let schema = config_schema_json().map_err(|e| e.to_string())?;
    validator_for(&schema).map_err(|e| e.to_string())
});

/// Compiled once per process and shared by every parse.
fn config_validator() -> Result<&'static Validator> {
    CONFIG_VALIDATOR
        .as_ref()
        .map_err(|e| anyhow!("invalid config schema: {e}"))
}

/// Validate TOML text against the schema, then deserialize it.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validator = config_validator()?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("loading config {}", path.display()))
}
