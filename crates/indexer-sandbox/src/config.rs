use std::{collections::BTreeMap, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use serde::Deserialize;
use tracing::level_filters::LevelFilter;

use crate::{net::NetworkPolicy, policy::SecurityPolicy};

pub const ENV_UNSAFE: &str = "SANDBOX_UNSAFE";
pub const ENV_TIMEOUT_MS: &str = "SANDBOX_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "SANDBOX_LOG_LEVEL";
pub const ENV_PROJECT_ROOT: &str = "SANDBOX_PROJECT_ROOT";
pub const ENV_MAX_MEMORY: &str = "SANDBOX_MAX_MEMORY";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// Unsafe mode needs the host's elevated API to bind `unsafeApi`.
    #[error("unsafe mode requires an api service for `unsafeApi`")]
    MissingUnsafeApi,
}

/// Host log verbosity. Decides whether failing calls carry an argument dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LogLevel {
    #[must_use]
    pub const fn filter(self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error | Self::Fatal => LevelFilter::ERROR,
            Self::Silent => LevelFilter::OFF,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "silent" | "off" => Ok(Self::Silent),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Host configuration consumed by the sandbox layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Disables the capability whitelist and binds `unsafeApi`.
    #[serde(rename = "unsafe")]
    pub unsafe_mode: bool,
    /// Per-call budget for compiling and invoking mapping code.
    #[serde(rename = "timeoutMs", deserialize_with = "duration_ms")]
    pub timeout: Duration,
    pub log_level: LogLevel,
    pub project_root: PathBuf,
    pub max_memory: usize,
    /// Environment passed through to sandboxed code.
    pub env: BTreeMap<String, String>,
    /// Gate for outbound connections; everything is allowed when unset.
    #[serde(skip)]
    pub network: Option<Arc<dyn NetworkPolicy>>,
}

impl SandboxConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }

    /// # Errors
    /// Returns an error if one of the `SANDBOX_*` variables holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the `SANDBOX_*` keys through `lookup`, keeping defaults for
    /// missing keys.
    ///
    /// # Errors
    /// Returns an error if a present key holds an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(value) = lookup(ENV_UNSAFE) {
            cfg.unsafe_mode = parse_bool(ENV_UNSAFE, &value)?;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            let millis = value.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: ENV_TIMEOUT_MS,
                value: value.clone(),
                reason: e.to_string(),
            })?;
            cfg.timeout = Duration::from_millis(millis);
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL) {
            cfg.log_level = value.parse().map_err(|reason| ConfigError::Invalid {
                key: ENV_LOG_LEVEL,
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(value) = lookup(ENV_PROJECT_ROOT) {
            cfg.project_root = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_MAX_MEMORY) {
            cfg.max_memory = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    key: ENV_MAX_MEMORY,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(cfg)
    }

    #[must_use]
    pub const fn unsafe_mode(mut self, unsafe_mode: bool) -> Self {
        self.unsafe_mode = unsafe_mode;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    #[must_use]
    pub const fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn network(mut self, policy: impl NetworkPolicy) -> Self {
        self.network = Some(Arc::new(policy));
        self
    }

    /// Policy implied by this configuration: the whitelist, or everything in
    /// unsafe mode.
    #[must_use]
    pub fn policy(&self) -> SecurityPolicy {
        let builder = SecurityPolicy::builder()
            .unrestricted(self.unsafe_mode)
            .max_memory(self.max_memory)
            .envs(self.env.clone());
        match &self.network {
            Some(network) => builder.network_arc(Arc::clone(network)),
            None => builder,
        }
        .build()
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            unsafe_mode: false,
            timeout: Self::DEFAULT_TIMEOUT,
            log_level: LogLevel::default(),
            project_root: PathBuf::from("."),
            max_memory: SecurityPolicy::DEFAULT_MAX_MEMORY,
            env: BTreeMap::new(),
            network: None,
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
