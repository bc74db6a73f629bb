//! Per-run cache of policies fetched from CA peers.

use std::collections::HashMap;
use std::future::Future;

use certpol_core::{CertificateKind, PolicyDescription, TransportError};
use tokio::sync::Mutex;
use tracing::debug;

type Key = (String, CertificateKind, String);

/// Policies fetched with `get_policy_only`, keyed by peer and policy name.
///
/// Filled lazily and never invalidated: build one per run and drop it when
/// the run ends. Lookups hand out copies, so callers may change what they
/// get without affecting later lookups.
#[derive(Debug, Default)]
pub struct PolicyCache {
    entries: Mutex<HashMap<Key, PolicyDescription>>,
}

impl PolicyCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached description, or run `fetch` and remember its result.
    ///
    /// Failures are not cached. The lock is held across `fetch` so
    /// concurrent lookups of the same policy cause a single round trip.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        peer: &str,
        kind: CertificateKind,
        policy: &str,
        fetch: F,
    ) -> Result<PolicyDescription, TransportError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<PolicyDescription, TransportError>> + Send,
    {
        let key = (peer.to_string(), kind, policy.to_string());
        let mut entries = self.entries.lock().await;
        if let Some(hit) = entries.get(&key) {
            debug!(peer = %peer, policy = %policy, "Policy cache hit");
            return Ok(hit.clone());
        }
        let description = fetch().await?;
        entries.insert(key, description.clone());
        Ok(description)
    }

    /// Number of cached policies
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certpol_core::{Material, SigningPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn description() -> PolicyDescription {
        PolicyDescription {
            policy: SigningPolicy::new(CertificateKind::X509),
            signer_public_key: Material::inline("key"),
            signer_certificate: None,
        }
    }

    #[tokio::test]
    async fn test_fetches_once_per_key() {
        let cache = PolicyCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_fetch("ca", CertificateKind::X509, "www", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(description())
                })
                .await
                .unwrap();
        }
        cache
            .get_or_fetch("other-ca", CertificateKind::X509, "www", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(description())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = PolicyCache::new();
        let err = cache
            .get_or_fetch("ca", CertificateKind::Ssh, "u", || async {
                Err(TransportError::NoResponse { peer: "ca".into() })
            })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_hands_out_copies() {
        let cache = PolicyCache::new();
        let mut first = cache
            .get_or_fetch("ca", CertificateKind::X509, "www", || async { Ok(description()) })
            .await
            .unwrap();
        first.policy.ttl = Some(1);
        let second = cache
            .get_or_fetch("ca", CertificateKind::X509, "www", || async {
                Err(TransportError::MalformedReply("should have been cached".into()))
            })
            .await
            .unwrap();
        assert_eq!(second.policy.ttl, None);
    }
}
