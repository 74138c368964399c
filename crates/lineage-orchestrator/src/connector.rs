//! Resolution of the process service for an endpoint.

use std::sync::Arc;
use std::time::Duration;

use lineage_client::{ClientError, ProcessService, RestConfig, RestProcessService};
use lineage_core::config::ClientSettings;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::job::Endpoint;

/// Hands out the process service to talk to.
pub trait Connector: Send + Sync {
    /// The service for `endpoint`. A default endpoint is the configured
    /// service.
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ProcessService>>;
}

/// Connects to the configured REST service, building a new client for
/// endpoint overrides.
pub struct RestConnector {
    settings: ClientSettings,
    default: Option<Arc<dyn ProcessService>>,
}

impl RestConnector {
    /// A connector for `settings`. The default client is built eagerly when a
    /// base URL is configured.
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let default = match &settings.base_url {
            Some(url) => Some(Self::build(
                url,
                settings.api_key.clone(),
                settings.request_timeout_secs,
            )?),
            None => None,
        };
        Ok(Self {
            settings: settings.clone(),
            default,
        })
    }

    fn build(
        base_url: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn ProcessService>> {
        let config = RestConfig {
            api_key,
            request_timeout: Duration::from_secs(timeout_secs),
            ..RestConfig::new(base_url)
        };
        let client = RestProcessService::new(&config).map_err(|e| match e {
            ClientError::Config(msg) => OrchestratorError::invalid(msg),
            other => OrchestratorError::remote("connect", other),
        })?;
        Ok(Arc::new(client))
    }
}

impl Connector for RestConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ProcessService>> {
        if endpoint.is_default()
            && let Some(service) = &self.default
        {
            return Ok(Arc::clone(service));
        }

        let base_url = endpoint
            .base_url
            .as_deref()
            .or(self.settings.base_url.as_deref())
            .ok_or_else(|| {
                OrchestratorError::invalid("no process service base URL configured")
            })?;
        let api_key = endpoint
            .api_key
            .clone()
            .or_else(|| self.settings.api_key.clone());

        debug!(base_url, "Connecting to process service");
        Self::build(base_url, api_key, self.settings.request_timeout_secs)
    }
}

/// Always returns the same service, whatever the endpoint.
pub struct FixedConnector {
    service: Arc<dyn ProcessService>,
}

impl FixedConnector {
    pub fn new(service: Arc<dyn ProcessService>) -> Self {
        Self { service }
    }
}

impl Connector for FixedConnector {
    fn connect(&self, _endpoint: &Endpoint) -> Result<Arc<dyn ProcessService>> {
        Ok(Arc::clone(&self.service))
    }
}
