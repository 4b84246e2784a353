/*!
 * Endpoint discovery.
 *
 * Discovery sources produce candidate [`RemoteDeviceEndpoint`]s; the
 * discoverer merges them and drops duplicates. How a source finds devices
 * (static configuration, a broadcast responder list, ...) is its own
 * business.
 */
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use starflow_core::config::DeviceConfig;

use crate::device::RemoteDeviceEndpoint;
use crate::error::Result;

/// A provider of candidate endpoints
#[async_trait]
pub trait EndpointSource: Send + Sync + Debug {
    /// Source name for logs
    fn name(&self) -> &str;

    /// Produce the current candidate list
    async fn endpoints(&self) -> Result<Vec<RemoteDeviceEndpoint>>;
}

/// Endpoints listed in configuration
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints {
    endpoints: Vec<RemoteDeviceEndpoint>,
}

impl StaticEndpoints {
    /// Wrap a fixed list
    pub fn new(endpoints: Vec<RemoteDeviceEndpoint>) -> Self {
        Self { endpoints }
    }

    /// Build from `[[devices]]` entries
    pub fn from_config(devices: &[DeviceConfig]) -> Result<Self> {
        let endpoints = devices
            .iter()
            .map(RemoteDeviceEndpoint::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(endpoints))
    }
}

#[async_trait]
impl EndpointSource for StaticEndpoints {
    fn name(&self) -> &str {
        "static"
    }

    async fn endpoints(&self) -> Result<Vec<RemoteDeviceEndpoint>> {
        Ok(self.endpoints.clone())
    }
}

/// Merges every registered source
#[derive(Debug, Default)]
pub struct EndpointDiscoverer {
    sources: Vec<Arc<dyn EndpointSource>>,
}

impl EndpointDiscoverer {
    /// Create a discoverer with no sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source
    pub fn add_source<S: EndpointSource + 'static>(&mut self, source: S) {
        self.sources.push(Arc::new(source));
    }

    /// Query every source; failing sources are logged and skipped
    ///
    /// The first endpoint seen for a given server, type and number wins.
    pub async fn discover(&self) -> Vec<RemoteDeviceEndpoint> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for source in &self.sources {
            match source.endpoints().await {
                Ok(endpoints) => {
                    debug!(source = source.name(), count = endpoints.len(), "Source answered");
                    for endpoint in endpoints {
                        let key = (endpoint.authority(), endpoint.device_type, endpoint.device_number);
                        if seen.insert(key) {
                            found.push(endpoint);
                        }
                    }
                }
                Err(e) => warn!(source = source.name(), "Discovery source failed: {}", e),
            }
        }

        info!("Discovered {} endpoints", found.len());
        found
    }
}
