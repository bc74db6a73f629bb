//! Requester matching for policies that restrict who may use them.
//!
//! Plain globs (`web*`, `db[0-9]`) are evaluated locally. Compound
//! expressions, recognised by an `@` such as `G@role:ca and web*`, need
//! data about the requester this node does not hold, so they are handed to
//! a [`TrustedMatcher`]. They are never evaluated locally, not even their
//! glob parts.

use std::sync::Arc;

use async_trait::async_trait;
use certpol_core::PolicyError;
use glob::Pattern;
use tracing::{debug, warn};

/// A third party trusted to evaluate compound matcher expressions
#[async_trait]
pub trait TrustedMatcher: Send + Sync {
    /// Whether `identity` satisfies `expression`. `None` when the matcher
    /// could not be asked or gave no usable answer.
    async fn compound_matches(&self, expression: &str, identity: &str) -> Option<bool>;
}

/// Evaluates a policy's requester matcher against a verified identity
#[derive(Clone, Default)]
pub struct RequesterMatcher {
    trusted: Option<Arc<dyn TrustedMatcher>>,
}

/// Whether an expression needs the trusted matcher
#[must_use]
pub fn is_compound(expression: &str) -> bool {
    expression.contains('@')
}

impl RequesterMatcher {
    /// Glob matching only; compound expressions fail with
    /// [`PolicyError::MatcherUnavailable`]
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_trusted(trusted: Arc<dyn TrustedMatcher>) -> Self {
        Self {
            trusted: Some(trusted),
        }
    }

    /// Check `identity` against `expression`
    pub async fn matches(&self, expression: &str, identity: &str) -> Result<bool, PolicyError> {
        if is_compound(expression) {
            let trusted = self.trusted.as_ref().ok_or(PolicyError::MatcherUnavailable)?;
            let matched = trusted
                .compound_matches(expression, identity)
                .await
                .ok_or(PolicyError::MatcherUnavailable)?;
            debug!(identity = %identity, matched, "Compound requester match");
            return Ok(matched);
        }
        match Pattern::new(expression) {
            Ok(pattern) => Ok(pattern.matches(identity)),
            Err(e) => {
                warn!(error = %e, "Invalid requester glob, denying");
                Ok(false)
            }
        }
    }
}

/// A trusted matcher with a fixed answer table, for tests and for nodes
/// that receive compound results out of band.
#[derive(Debug, Clone, Default)]
pub struct StaticMatcher {
    answers: Vec<(String, String, bool)>,
}

impl StaticMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the answer for one expression and identity
    #[must_use]
    pub fn answer(mut self, expression: &str, identity: &str, matched: bool) -> Self {
        self.answers
            .push((expression.to_string(), identity.to_string(), matched));
        self
    }
}

#[async_trait]
impl TrustedMatcher for StaticMatcher {
    async fn compound_matches(&self, expression: &str, identity: &str) -> Option<bool> {
        self.answers
            .iter()
            .find(|(e, i, _)| e == expression && i == identity)
            .map(|(_, _, matched)| *matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_glob() {
        let m = RequesterMatcher::local();
        assert!(m.matches("web*", "web1").await.unwrap());
        assert!(!m.matches("web*", "db1").await.unwrap());
        assert!(m.matches("db[0-9]", "db7").await.unwrap());
        assert!(!m.matches("[", "web1").await.unwrap());
    }

    #[tokio::test]
    async fn test_compound_needs_trusted_matcher() {
        let m = RequesterMatcher::local();
        assert_eq!(
            m.matches("G@role:ca and web*", "web1").await,
            Err(PolicyError::MatcherUnavailable)
        );
    }

    #[tokio::test]
    async fn test_compound_uses_only_trusted_answer() {
        // The glob part alone would match web1; the trusted answer is authoritative.
        let trusted = StaticMatcher::new().answer("G@role:ca and web*", "web1", false);
        let m = RequesterMatcher::with_trusted(Arc::new(trusted));
        assert!(!m.matches("G@role:ca and web*", "web1").await.unwrap());
        assert_eq!(
            m.matches("G@role:ca and web*", "web2").await,
            Err(PolicyError::MatcherUnavailable)
        );
    }
}
