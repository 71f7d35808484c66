//! Layered configuration: defaults, TOML file, `SPARKLES_LOGTAIL__*` env vars.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelSettings, DEFAULT_SERVER_NAME};
use crate::credentials::{
    CLUSTER_KEYS_KIND, CLUSTER_KEYS_NAME, DatastoreStore, RecordKey, TokenProvider,
};
use crate::error::{LogTailError, Result};
use crate::poller::{DEFAULT_CHUNK_SIZE, PollOptions};
use crate::retry::RetryPolicy;

pub const APP_NAME: &str = "sparkles-logtail";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub datastore: DatastoreConfig,
    pub channel: ChannelConfig,
    pub poll: PollConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// Where the cluster credential record lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Google Cloud project; falls back to `GOOGLE_CLOUD_PROJECT`.
    pub project_id: Option<String>,
    pub namespace: Option<String>,
    /// Service account key file; falls back to `GOOGLE_APPLICATION_CREDENTIALS`,
    /// then to the metadata server.
    pub credentials_file: Option<String>,
    /// `host:port` of a Datastore emulator; falls back to `DATASTORE_EMULATOR_HOST`.
    pub emulator_host: Option<String>,
    pub key_kind: String,
    pub key_name: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            namespace: None,
            credentials_file: None,
            emulator_host: None,
            key_kind: CLUSTER_KEYS_KIND.to_string(),
            key_name: CLUSTER_KEYS_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub server_name: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub chunk_size: u32,
    pub idle_delay_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 0 retries forever.
    pub max_attempts: u32,
    /// 0 disables the time ceiling.
    pub max_elapsed_secs: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts.unwrap_or(0),
            max_elapsed_secs: policy.max_elapsed.map_or(0, |d| d.as_secs()),
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.datastore.key_kind, &self.datastore.key_name)
    }

    pub fn channel_settings(&self, address: &str) -> Result<ChannelSettings> {
        if self.channel.request_timeout_secs == 0 {
            return Err(LogTailError::Config(
                "channel.request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(ChannelSettings {
            address: address.to_string(),
            server_name: self.channel.server_name.clone(),
            connect_timeout: Duration::from_secs(self.channel.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.channel.request_timeout_secs),
        })
    }

    pub fn poll_options(&self) -> Result<PollOptions> {
        if self.poll.chunk_size == 0 || self.poll.chunk_size > i32::MAX as u32 {
            return Err(LogTailError::Config(format!(
                "poll.chunk_size must be between 1 and {}",
                i32::MAX
            )));
        }
        if self.channel.request_timeout_secs == 0 {
            return Err(LogTailError::Config(
                "channel.request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(PollOptions {
            chunk_size: self.poll.chunk_size,
            idle_delay: Duration::from_millis(self.poll.idle_delay_ms),
            request_timeout: Duration::from_secs(self.channel.request_timeout_secs),
        })
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let retry = &self.retry;
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(LogTailError::Config(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(RetryPolicy {
            max_attempts: (retry.max_attempts > 0).then_some(retry.max_attempts),
            max_elapsed: (retry.max_elapsed_secs > 0)
                .then(|| Duration::from_secs(retry.max_elapsed_secs)),
            initial_delay: Duration::from_millis(retry.initial_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            multiplier: retry.multiplier,
            jitter: retry.jitter,
        })
    }

    /// Build the Datastore client from process environment fallbacks.
    pub fn credential_store(&self) -> Result<DatastoreStore> {
        self.credential_store_with(|name| env::var(name).ok())
    }

    /// Build the Datastore client, reading fallbacks through `lookup_env`.
    pub fn credential_store_with<F>(&self, lookup_env: F) -> Result<DatastoreStore>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let ds = &self.datastore;

        let project_id = non_empty(ds.project_id.clone())
            .or_else(|| non_empty(lookup_env("GOOGLE_CLOUD_PROJECT")))
            .or_else(|| non_empty(lookup_env("DATASTORE_PROJECT_ID")))
            .ok_or_else(|| {
                LogTailError::Config(
                    "no Google Cloud project configured (datastore.project_id or GOOGLE_CLOUD_PROJECT)"
                        .to_string(),
                )
            })?;

        let store = if let Some(host) = non_empty(ds.emulator_host.clone())
            .or_else(|| non_empty(lookup_env("DATASTORE_EMULATOR_HOST")))
        {
            DatastoreStore::emulator(&host, project_id)
        } else {
            let tokens = match non_empty(ds.credentials_file.clone())
                .or_else(|| non_empty(lookup_env("GOOGLE_APPLICATION_CREDENTIALS")))
            {
                Some(path) => {
                    let path = expand_str_path(&path)
                        .map_err(|e| LogTailError::Config(format!("{e:#}")))?;
                    TokenProvider::from_key_file(&path)?
                }
                None => TokenProvider::metadata(),
            };
            DatastoreStore::new(project_id, tokens)
        };

        Ok(store.with_namespace(ds.namespace.clone()))
    }
}

/// Load configuration from `config_file` (if present) and the environment.
pub fn load_config(config_file: &Path) -> anyhow::Result<AppConfig> {
    load_config_with_env(
        config_file,
        Environment::with_prefix(&env_prefix()).separator("__"),
    )
}

/// Like [`load_config`] with an explicit environment source.
pub fn load_config_with_env(
    config_file: &Path,
    environment: Environment,
) -> anyhow::Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(environment)
        .build()
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    let config: AppConfig = built
        .try_deserialize()
        .context("parsing configuration")?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

/// Resolve the config file path from an optional `--config` override.
pub fn discover_config_file(override_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

fn expand_path(path: PathBuf) -> anyhow::Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> anyhow::Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
