//! Event-driven data-source providers and their batched lifecycle.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::composition::ComposedConfiguration;
use crate::error::{Error, Result};

/// A long-lived data source (e.g. a message-bus consumer) owned by one composition
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    async fn startup(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
}

/// Derives the providers a composition needs
pub trait ProviderFactory: Send + Sync {
    fn providers(&self, config: &ComposedConfiguration) -> Vec<Arc<dyn Provider>>;
}

/// Compositions without event-driven data sources
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProviders;

impl ProviderFactory for NoProviders {
    fn providers(&self, _config: &ComposedConfiguration) -> Vec<Arc<dyn Provider>> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Startup,
    Shutdown,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Startup => "startup",
            Action::Shutdown => "shutdown",
        }
    }
}

/// Start every provider concurrently under one deadline
pub async fn start_providers(providers: &[Arc<dyn Provider>], timeout: Duration) -> Result<()> {
    run_batch(providers, Action::Startup, timeout).await
}

/// Shut down every provider concurrently under one deadline. Individual failures are
/// aggregated rather than short-circuiting the batch.
pub async fn shutdown_providers(providers: &[Arc<dyn Provider>], timeout: Duration) -> Result<()> {
    run_batch(providers, Action::Shutdown, timeout).await
}

async fn run_batch(providers: &[Arc<dyn Provider>], action: Action, timeout: Duration) -> Result<()> {
    if providers.is_empty() {
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for provider in providers {
        let provider = provider.clone();
        tasks.spawn(async move {
            let result = match action {
                Action::Startup => provider.startup().await,
                Action::Shutdown => provider.shutdown().await,
            };
            result.map_err(|e| format!("{}: {}", provider.id(), e))
        });
    }

    let collect = async {
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(format!("provider task failed: {}", e)),
            }
        }
        errors
    };

    let outcome = tokio::time::timeout(timeout, collect).await;
    let errors = match outcome {
        Ok(errors) => errors,
        Err(_) => {
            tasks.abort_all();
            warn!(action = action.as_str(), ?timeout, "provider batch timed out");
            return Err(Error::ProviderTimeout {
                action: action.as_str(),
                timeout,
            });
        }
    };

    if errors.is_empty() {
        debug!(action = action.as_str(), count = providers.len(), "provider batch finished");
        Ok(())
    } else {
        Err(Error::Providers {
            action: action.as_str(),
            errors,
        })
    }
}
