use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Global budget of node launches in flight across all provider requests.
pub const MAX_CONCURRENT_LAUNCHES: usize = 10;
/// Nodes requested from the provider in one call.
pub const MAX_LAUNCH_BATCH: usize = 5;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8001";
pub const DEFAULT_PROVIDER: &str = "mock";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    NotPositive { var: &'static str, value: String },

    #[error("{var} must be a non-negative integer, got '{value}'")]
    NotANumber { var: &'static str, value: String },

    #[error("{var} is not a valid socket address: '{value}'")]
    InvalidAddr { var: &'static str, value: String },
}

/// Concurrency limits of the instance launcher. Both are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LauncherConfig {
    max_concurrent_requests: usize,
    max_nodes_per_request: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self::from_budget(MAX_CONCURRENT_LAUNCHES, MAX_LAUNCH_BATCH)
    }
}

impl LauncherConfig {
    /// Both limits are clamped to at least 1.
    pub fn new(max_concurrent_requests: usize, max_nodes_per_request: usize) -> Self {
        Self {
            max_concurrent_requests: max_concurrent_requests.max(1),
            max_nodes_per_request: max_nodes_per_request.max(1),
        }
    }

    /// Provider requests allowed in flight at once.
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Upper bound on nodes asked for in one provider request.
    pub fn max_nodes_per_request(&self) -> usize {
        self.max_nodes_per_request
    }

    /// Derive the request concurrency from a node budget: `ceil(launches / batch)`.
    pub fn from_budget(max_concurrent_launches: usize, max_launch_batch: usize) -> Self {
        let batch = max_launch_batch.max(1);
        Self::new(max_concurrent_launches.div_ceil(batch), batch)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overrides:
    /// - NODEPOOL_MAX_CONCURRENT_LAUNCHES: node budget (default 10)
    /// - NODEPOOL_MAX_LAUNCH_BATCH: nodes per provider request (default 5)
    /// - NODEPOOL_MAX_CONCURRENT_REQUESTS: bypasses the derived request concurrency
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let launches = positive(&lookup, "NODEPOOL_MAX_CONCURRENT_LAUNCHES")?
            .unwrap_or(MAX_CONCURRENT_LAUNCHES);
        let batch = positive(&lookup, "NODEPOOL_MAX_LAUNCH_BATCH")?.unwrap_or(MAX_LAUNCH_BATCH);

        let mut config = Self::from_budget(launches, batch);
        if let Some(requests) = positive(&lookup, "NODEPOOL_MAX_CONCURRENT_REQUESTS")? {
            config.max_concurrent_requests = requests;
        }
        Ok(config)
    }
}

/// Settings for the in-memory mock provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockProviderSettings {
    /// Max live nodes per instance type (None = unlimited).
    pub quota: Option<usize>,
    pub latency: Duration,
}

/// Process-level settings of the orchestrator binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub bind_addr: SocketAddr,
    pub provider: String,
    pub launcher: LauncherConfig,
    pub mock: MockProviderSettings,
}

impl OrchestratorSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_addr = non_empty(&lookup, "NODEPOOL_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr.parse().map_err(|_| ConfigError::InvalidAddr {
            var: "NODEPOOL_BIND_ADDR",
            value: raw_addr.clone(),
        })?;

        let provider = non_empty(&lookup, "PROVIDER")
            .map(|p| p.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        let latency_ms = match non_empty(&lookup, "MOCK_PROVIDER_LATENCY_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::NotANumber {
                var: "MOCK_PROVIDER_LATENCY_MS",
                value: raw.clone(),
            })?,
            None => 0,
        };

        Ok(Self {
            bind_addr,
            provider,
            launcher: LauncherConfig::from_lookup(&lookup)?,
            mock: MockProviderSettings {
                quota: positive(&lookup, "MOCK_PROVIDER_QUOTA")?,
                latency: Duration::from_millis(latency_ms),
            },
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = non_empty(lookup, var) else {
        return Ok(None);
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ConfigError::NotPositive { var, value: raw }),
    }
}
