//! `SourceConnector` that opens [`WsEventSource`]s.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use wsrelay_core::config::SourceConfig;
use wsrelay_core::error::SourceError;
use wsrelay_core::policy::ReconnectPolicy;
use wsrelay_core::source::SourceConnector;

use crate::source::{WsEventSource, WsSourceConfig};

/// Opens one WebSocket event source per target, all sharing one config.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsSourceConfig,
}

impl WsConnector {
    pub fn new(config: WsSourceConfig) -> Self {
        Self { config }
    }

    /// Replace the reconnect policy built from configuration.
    pub fn with_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn config(&self) -> &WsSourceConfig {
        &self.config
    }
}

impl From<&SourceConfig> for WsConnector {
    fn from(config: &SourceConfig) -> Self {
        Self::new(WsSourceConfig::from(config))
    }
}

#[async_trait]
impl SourceConnector for WsConnector {
    type Source = WsEventSource;

    async fn connect(&self, target: Url) -> Result<WsEventSource, SourceError> {
        WsEventSource::connect(target, self.config.clone()).await
    }
}
