// Client configuration: defaults, environment overrides, optional YAML file.
use anyhow::{Context, Result};
use logline_transport::{TransportConfig, TrustMode};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::flow::FlowControl;
use crate::pool::Endpoint;

pub const DEFAULT_SERVERS: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8123;
pub(crate) const DEFAULT_CONNECTION_RETRY: Duration = Duration::from_millis(2500);
pub(crate) const DEFAULT_CONNECTION_RETRY_COUNT: u32 = 5;
pub(crate) const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_millis(5000);
pub(crate) const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Hard cap for a single frame read from the store.
///
/// Readers allocate `header.length` bytes up front, so an unchecked length
/// from a buggy peer would allocate without bound.
/// Override with `LOGLINE_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Comma separated `host[:port]` list.
    pub servers: String,
    pub flow_control: FlowControl,
    /// PEM file with the certificate(s) to trust. `None` accepts any server.
    pub cert_file: Option<PathBuf>,
    pub token: Option<String>,
    pub context: Option<String>,
    pub connection_retry: Duration,
    pub connection_retry_count: u32,
    /// Interval between keep-alive pings. Zero picks one that keeps an idle
    /// connection inside `keep_alive_timeout`.
    pub keep_alive_time: Duration,
    /// How long a ping may go unanswered before the connection is dead.
    pub keep_alive_timeout: Duration,
    /// Not used by streaming; carried for unary calls built on this client.
    pub commit_timeout: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    servers: Option<String>,
    initial_permits: Option<u64>,
    refill_permits: Option<u64>,
    refill_threshold: Option<u64>,
    cert_file: Option<PathBuf>,
    token: Option<String>,
    context: Option<String>,
    connection_retry_ms: Option<u64>,
    connection_retry_count: Option<u32>,
    keep_alive_ms: Option<u64>,
    keep_alive_timeout_ms: Option<u64>,
    commit_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_SERVERS.to_string(),
            flow_control: FlowControl::default(),
            cert_file: None,
            token: None,
            context: None,
            connection_retry: DEFAULT_CONNECTION_RETRY,
            connection_retry_count: DEFAULT_CONNECTION_RETRY_COUNT,
            keep_alive_time: Duration::ZERO,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    /// Defaults, then `LOGLINE_*` variables, then the YAML file named by
    /// `config_path` or `LOGLINE_CLIENT_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("LOGLINE_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn builder(servers: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self {
                servers: servers.into(),
                ..Self::default()
            },
        }
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("LOGLINE_SERVERS")
            && !value.trim().is_empty()
        {
            config.servers = value;
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_INITIAL_PERMITS") {
            config.flow_control.initial_permits = value;
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_REFILL_PERMITS") {
            config.flow_control.refill_amount = value;
        }
        // Zero is a valid threshold.
        if let Some(value) = read_u64_env("LOGLINE_REFILL_THRESHOLD") {
            config.flow_control.refill_threshold = value;
        }
        if let Some(value) = read_string_env("LOGLINE_CERT_FILE") {
            config.cert_file = Some(PathBuf::from(value));
        }
        if let Some(value) = read_string_env("LOGLINE_TOKEN") {
            config.token = Some(value);
        }
        if let Some(value) = read_string_env("LOGLINE_CONTEXT") {
            config.context = Some(value);
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_CONNECTION_RETRY_MS") {
            config.connection_retry = Duration::from_millis(value);
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_CONNECTION_RETRY_COUNT") {
            config.connection_retry_count = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = read_u64_env("LOGLINE_KEEP_ALIVE_MS") {
            config.keep_alive_time = Duration::from_millis(value);
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_KEEP_ALIVE_TIMEOUT_MS") {
            config.keep_alive_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_COMMIT_TIMEOUT_MS") {
            config.commit_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_positive_u64_env("LOGLINE_MAX_FRAME_BYTES") {
            config.max_frame_bytes = usize::try_from(value).unwrap_or(usize::MAX);
        }
        config
    }

    /// Parse `servers` into endpoints; a missing port means [`DEFAULT_PORT`].
    /// IPv6 literals are refused because the client endpoint binds IPv4.
    pub fn server_nodes(&self) -> Result<Vec<Endpoint>, ConfigError> {
        let mut nodes = Vec::new();
        for entry in self.servers.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.starts_with('[') || entry.matches(':').count() > 1 {
                return Err(ConfigError::InvalidServer {
                    entry: entry.to_string(),
                    reason: "IPv6 addresses are not supported".to_string(),
                });
            }
            let (host, port) = match entry.split_once(':') {
                Some((host, port)) => {
                    let port = port
                        .trim()
                        .parse::<u16>()
                        .map_err(|err| ConfigError::InvalidServer {
                            entry: entry.to_string(),
                            reason: err.to_string(),
                        })?;
                    (host.trim(), port)
                }
                None => (entry, DEFAULT_PORT),
            };
            if host.is_empty() {
                return Err(ConfigError::InvalidServer {
                    entry: entry.to_string(),
                    reason: "missing host".to_string(),
                });
            }
            nodes.push(Endpoint::new(host, port));
        }
        if nodes.is_empty() {
            return Err(ConfigError::NoServers);
        }
        Ok(nodes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flow_control.validate()?;
        self.server_nodes()?;
        Ok(())
    }

    pub fn trust_mode(&self) -> TrustMode {
        TrustMode::from_cert_file(self.cert_file.as_deref())
    }

    /// QUIC liveness settings. A stream parked at the head of the log sends
    /// nothing, so pings always run; otherwise the idle timeout would tear
    /// down healthy connections.
    pub fn transport_config(&self) -> TransportConfig {
        let (interval, idle) = if self.keep_alive_time.is_zero() {
            (self.keep_alive_timeout / 2, self.keep_alive_timeout)
        } else {
            (
                self.keep_alive_time,
                self.keep_alive_time.saturating_add(self.keep_alive_timeout),
            )
        };
        TransportConfig {
            keep_alive_interval: Some(interval),
            idle_timeout: Some(idle),
            ..TransportConfig::default()
        }
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.servers
            && !value.trim().is_empty()
        {
            config.servers = value.clone();
        }
        if let Some(value) = self.initial_permits
            && value > 0
        {
            config.flow_control.initial_permits = value;
        }
        if let Some(value) = self.refill_permits
            && value > 0
        {
            config.flow_control.refill_amount = value;
        }
        if let Some(value) = self.refill_threshold {
            config.flow_control.refill_threshold = value;
        }
        if let Some(value) = &self.cert_file {
            config.cert_file = Some(value.clone());
        }
        if let Some(value) = &self.token {
            config.token = Some(value.clone());
        }
        if let Some(value) = &self.context {
            config.context = Some(value.clone());
        }
        if let Some(value) = self.connection_retry_ms
            && value > 0
        {
            config.connection_retry = Duration::from_millis(value);
        }
        if let Some(value) = self.connection_retry_count
            && value > 0
        {
            config.connection_retry_count = value;
        }
        if let Some(value) = self.keep_alive_ms {
            config.keep_alive_time = Duration::from_millis(value);
        }
        if let Some(value) = self.keep_alive_timeout_ms
            && value > 0
        {
            config.keep_alive_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.commit_timeout_ms
            && value > 0
        {
            config.commit_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
    }
}

/// Fluent construction for code that does not read the environment.
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cert_file = Some(path.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.config.context = Some(context.into());
        self
    }

    pub fn connection_retry(mut self, delay: Duration, count: u32) -> Self {
        self.config.connection_retry = delay;
        self.config.connection_retry_count = count;
        self
    }

    pub fn flow_control(mut self, initial_permits: u64, refill_amount: u64, threshold: u64) -> Self {
        self.config.flow_control = FlowControl::new(initial_permits, refill_amount, threshold);
        self
    }

    pub fn keep_alive(mut self, time: Duration, timeout: Duration) -> Self {
        self.config.keep_alive_time = time;
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.config.commit_timeout = timeout;
        self
    }

    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.config.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_positive_u64_env(key: &str) -> Option<u64> {
    read_u64_env(key).filter(|value| *value > 0)
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
