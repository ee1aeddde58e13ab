//! Gateway configuration loaded from YAML.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{Error, Result};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub federation: FederationConfig,
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
    pub websocket: WebSocketConfig,
    pub providers: ProviderConfig,
    pub transport: TransportMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            federation: FederationConfig::default(),
            registry: RegistryConfig::default(),
            executor: ExecutorConfig::default(),
            websocket: WebSocketConfig::default(),
            providers: ProviderConfig::default(),
            transport: TransportMode::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. Relative `schema_file` paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&contents)?;
        let config_dir = path.parent().unwrap_or_else(|| Path::new(""));
        for subgraph in &mut config.federation.subgraphs {
            if let Some(file) = subgraph.schema_file.as_mut() {
                if file.is_relative() {
                    *file = config_dir.join(&*file);
                }
            }
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for subgraph in &self.federation.subgraphs {
            if subgraph.name.is_empty() {
                return Err(Error::Config("subgraph name must not be empty".into()));
            }
            if !seen.insert(subgraph.name.as_str()) {
                return Err(Error::Config(format!(
                    "subgraph '{}' is listed twice",
                    subgraph.name
                )));
            }
        }
        if self.executor.plan_cache_size == 0 {
            return Err(Error::Config("executor.plan_cache_size must be > 0".into()));
        }
        let websocket = &self.websocket;
        for (name, value) in [
            ("read_timeout", websocket.read_timeout),
            ("write_timeout", websocket.write_timeout),
            ("connection_init_timeout", websocket.connection_init_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("websocket.{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

/// Subgraphs to federate and whether to expose the playground
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub playground: bool,
    pub subgraphs: Vec<SubgraphEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphEndpoint {
    pub name: String,
    pub url: String,
    /// Serve this SDL instead of polling the subgraph for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub broker_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(600),
            request_timeout: Duration::from_secs(10),
            broker_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub plan_cache_size: usize,
    pub propagate_subgraph_errors: bool,
    pub enable_introspection: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            plan_cache_size: 1024,
            propagate_subgraph_errors: true,
            enable_introspection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connection_init_timeout: Duration,
    /// Zero disables server keep-alive frames
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    pub max_subscriptions_per_connection: usize,
    /// Serve all sockets from a single multiplexing poller task
    pub use_poller: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            connection_init_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(15),
            max_subscriptions_per_connection: 100,
            use_poller: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// How the gateway talks to subgraphs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Http,
    Broker,
}
