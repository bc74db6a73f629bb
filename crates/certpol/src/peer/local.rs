//! In-process channel: routes calls straight to [`CaServer`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use certpol_core::{PeerReplyEnvelope, PeerRequestEnvelope, SIGN_PROCEDURE};
use tracing::{debug, warn};

use super::{CaServer, PeerChannel};
use crate::config::Config;

/// Channel to CA servers living in the same process.
///
/// `identity` plays the part of the transport's authentication: it is the
/// requester identity every server sees, whatever the envelope claims.
#[derive(Clone, Default)]
pub struct LocalChannel {
    servers: HashMap<String, Arc<CaServer>>,
    identity: Option<String>,
}

impl LocalChannel {
    #[must_use]
    pub fn new(identity: Option<String>) -> Self {
        Self {
            servers: HashMap::new(),
            identity,
        }
    }

    /// Channel identified as the node's configured identity
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.peer.identity.clone())
    }

    /// Register `server` under the peer name `name`
    #[must_use]
    pub fn with_server(mut self, name: impl Into<String>, server: Arc<CaServer>) -> Self {
        self.servers.insert(name.into(), server);
        self
    }
}

#[async_trait]
impl PeerChannel for LocalChannel {
    async fn call(
        &self,
        peer: &str,
        procedure: &str,
        args: serde_json::Value,
    ) -> BTreeMap<String, serde_json::Value> {
        if procedure != SIGN_PROCEDURE {
            warn!(procedure = %procedure, "Refusing unknown procedure");
            return BTreeMap::new();
        }
        let Some(server) = self.servers.get(peer) else {
            debug!(peer = %peer, "No such peer");
            return BTreeMap::new();
        };

        let reply = match serde_json::from_value::<PeerRequestEnvelope>(args) {
            Ok(mut envelope) => {
                envelope.requester_identity.clone_from(&self.identity);
                server.handle(envelope).await
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Invalid signing request");
                PeerReplyEnvelope::err(vec![format!("invalid request: {e}")])
            }
        };
        match serde_json::to_value(reply) {
            Ok(value) => BTreeMap::from([(peer.to_string(), value)]),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Could not encode reply");
                BTreeMap::new()
            }
        }
    }
}
