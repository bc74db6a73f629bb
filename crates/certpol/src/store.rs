//! Policy stores: where a CA node looks up its signing policies.

use std::sync::Arc;

use certpol_core::{CertificateKind, Result, SigningPolicy};
use tracing::debug;

use crate::config::{Config, PolicyTables};

/// Named signing policies of one node.
pub trait PolicyStore: Send + Sync {
    /// Look up a policy. `Ok(None)` when no such policy exists.
    fn get_policy(&self, kind: CertificateKind, name: &str) -> Result<Option<SigningPolicy>>;
}

impl PolicyStore for PolicyTables {
    fn get_policy(&self, kind: CertificateKind, name: &str) -> Result<Option<SigningPolicy>> {
        self.get(kind, name)
    }
}

/// Stores consulted in order, first hit wins.
///
/// A policy is taken whole from the first store that has it; entries of
/// the same name in later stores are not merged in.
#[derive(Clone, Default)]
pub struct LayeredStore {
    layers: Vec<Arc<dyn PolicyStore>>,
}

impl LayeredStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a store below the existing ones
    #[must_use]
    pub fn with_layer(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.layers.push(store);
        self
    }

    /// Node overrides first, then the config's own tables
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut store = Self::new();
        if let Some(node) = config.load_node_overrides()? {
            store = store.with_layer(Arc::new(node));
        }
        Ok(store.with_layer(Arc::new(config.policies.clone())))
    }
}

impl PolicyStore for LayeredStore {
    fn get_policy(&self, kind: CertificateKind, name: &str) -> Result<Option<SigningPolicy>> {
        for (depth, layer) in self.layers.iter().enumerate() {
            if let Some(policy) = layer.get_policy(kind, name)? {
                debug!(policy = %name, kind = %kind, layer = depth, "Found signing policy");
                return Ok(Some(policy));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(src: &str) -> Arc<dyn PolicyStore> {
        Arc::new(toml::from_str::<PolicyTables>(src).unwrap())
    }

    #[test]
    fn test_first_layer_wins() {
        let store = LayeredStore::new()
            .with_layer(tables("[x509_signing_policies.www]\nCN = \"node\"\n"))
            .with_layer(tables(
                "[x509_signing_policies.www]\nCN = \"global\"\n[x509_signing_policies.other]\nO = \"Org\"\n",
            ));

        let www = store.get_policy(CertificateKind::X509, "www").unwrap().unwrap();
        assert_eq!(www.name_attributes[0].1, "node");
        assert!(store.get_policy(CertificateKind::X509, "other").unwrap().is_some());
        assert!(store.get_policy(CertificateKind::X509, "missing").unwrap().is_none());
        assert!(store.get_policy(CertificateKind::Ssh, "www").unwrap().is_none());
    }

    #[test]
    fn test_lookups_hand_out_copies() {
        let store = LayeredStore::new().with_layer(tables("[ssh_signing_policies.u]\nttl = 60\n"));
        let mut first = store.get_policy(CertificateKind::Ssh, "u").unwrap().unwrap();
        first.ttl = Some(1);
        let second = store.get_policy(CertificateKind::Ssh, "u").unwrap().unwrap();
        assert_eq!(second.ttl, Some(60));
    }
}
