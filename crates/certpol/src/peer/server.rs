//! CA side of the peer protocol.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use certpol_backend::backend_for;
use certpol_core::{
    merge, CertificateRequest, EncodeOptions, Error, Material, PeerReplyEnvelope,
    PeerRequestEnvelope, PolicyDescription, PolicyError, ReplyData, ResolvedRequest, Result,
    ResultExt, SigningPolicy, Stage,
};
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::fs::FileSink;
use crate::issue::LocalIssuer;
use crate::matcher::RequesterMatcher;
use crate::store::PolicyStore;

const POLICY_FAILURE: &str = "Failed building the signing policy. See CA server log for details.";
const INTERNAL_ERROR: &str = "Internal error. This is most likely a bug.";

/// Serves signing requests under locally configured policies.
///
/// Every failure becomes an error reply. Nothing a requester sends can make
/// the handler return early with a transport fault or take the node down.
#[derive(Clone)]
pub struct CaServer {
    store: Arc<dyn PolicyStore>,
    fs: Arc<dyn FileSink>,
    matcher: RequesterMatcher,
}

impl CaServer {
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>, fs: Arc<dyn FileSink>) -> Self {
        Self {
            store,
            fs,
            matcher: RequesterMatcher::local(),
        }
    }

    /// Use `matcher` for policies with a requester matcher
    #[must_use]
    pub fn with_matcher(mut self, matcher: RequesterMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Handle one request
    pub async fn handle(&self, envelope: PeerRequestEnvelope) -> PeerReplyEnvelope {
        let policy = envelope.signing_policy_name.clone();
        match AssertUnwindSafe(self.serve(envelope)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!(policy = %policy, "Signing request handler panicked");
                PeerReplyEnvelope::err(vec![INTERNAL_ERROR.into()])
            }
        }
    }

    async fn serve(&self, envelope: PeerRequestEnvelope) -> PeerReplyEnvelope {
        let name = &envelope.signing_policy_name;
        let policy = match self.authorize(&envelope).await {
            Ok(policy) => policy,
            Err(e) if e.stage() == Some(Stage::LoadingPolicy) => {
                error!(policy = %name, error = %e, "Could not build signing policy");
                return PeerReplyEnvelope::err(vec![POLICY_FAILURE.into()]);
            }
            Err(e) => {
                warn!(policy = %name, requester = ?envelope.requester_identity, error = %e, "Rejected signing request");
                return PeerReplyEnvelope::err(e.remote_messages());
            }
        };

        if envelope.get_policy_only {
            return match self.describe(&policy).await {
                Ok(description) => PeerReplyEnvelope::ok(ReplyData::Policy(description)),
                Err(e) => {
                    error!(policy = %name, error = %e, "Could not describe signing policy");
                    PeerReplyEnvelope::err(e.remote_messages())
                }
            };
        }

        let request = sanitize(envelope.request_kwargs);
        let resolved = merge(Some(&policy), &request);
        match self.issue(&resolved).await {
            Ok(bytes) => {
                info!(policy = %name, requester = ?envelope.requester_identity, "Signed remote request");
                PeerReplyEnvelope::ok(ReplyData::Certificate(bytes))
            }
            Err(e) => {
                error!(policy = %name, error = %e, "Remote signing failed");
                PeerReplyEnvelope::err(e.remote_messages())
            }
        }
    }

    /// Look up the policy and check the requester may use it. The returned
    /// policy no longer carries its matcher. Store failures come back tagged
    /// with [`Stage::LoadingPolicy`].
    async fn authorize(&self, envelope: &PeerRequestEnvelope) -> Result<SigningPolicy> {
        let name = &envelope.signing_policy_name;
        let kind = envelope.request_kwargs.kind;
        let mut policy = match self.store.get_policy(kind, name) {
            Ok(Some(policy)) => policy,
            Ok(None) => return Err(PolicyError::NotFound { name: name.clone() }.into()),
            Err(e) => return Err(e.at(Stage::LoadingPolicy)),
        };

        if let Some(expression) = policy.requester_matcher.take() {
            let identity = envelope
                .requester_identity
                .as_deref()
                .ok_or(PolicyError::RequesterUnidentified)?;
            debug!(policy = %name, matcher = %expression, identity = %identity, "Checking requester");
            if !self.matcher.matches(&expression, identity).await? {
                return Err(PolicyError::RequesterNotPermitted.into());
            }
        }
        Ok(policy)
    }

    /// Redacted policy plus the CA's public identity
    async fn describe(&self, policy: &SigningPolicy) -> Result<PolicyDescription> {
        let backend = backend_for(policy.kind);
        let issuer = LocalIssuer::new(backend.as_ref(), self.fs.as_ref());
        let resolved = merge(Some(policy), &CertificateRequest::new(policy.kind));

        let identity = match issuer.signer(&resolved).await? {
            Some(signing) => signing.identity,
            None => issuer
                .signer_identity(&resolved)
                .await?
                .ok_or(Error::MissingSigningKey)?,
        };
        let signer_public_key = Material::Inline(
            backend
                .encode_public_key(&identity.public_key)
                .stage(Stage::Encoding)?,
        );
        let signer_certificate = identity
            .certificate
            .as_ref()
            .map(|cert| backend.encode(cert, backend.default_encoding(), EncodeOptions::default()))
            .transpose()
            .stage(Stage::Encoding)?
            .map(Material::Inline);

        Ok(PolicyDescription {
            policy: policy.redacted(),
            signer_public_key,
            signer_certificate,
        })
    }

    async fn issue(&self, resolved: &ResolvedRequest) -> Result<Vec<u8>> {
        let backend = backend_for(resolved.kind);
        let issuer = LocalIssuer::new(backend.as_ref(), self.fs.as_ref());
        let cert = issuer.issue(resolved).await?;
        backend
            .encode(&cert, backend.default_encoding(), EncodeOptions::default())
            .stage(Stage::Encoding)
    }
}

/// Drop everything a requester must not choose on the CA: signing
/// material, output options, and paths on the CA's filesystem.
fn sanitize(mut request: CertificateRequest) -> CertificateRequest {
    let is_path = |m: &Option<Material>| matches!(m, Some(Material::Path(_)));
    if is_path(&request.public_key) {
        request.public_key = None;
    }
    if is_path(&request.csr) {
        request.csr = None;
    }
    request.private_key = None;
    request.private_key_passphrase = None;
    request.signing_private_key = None;
    request.signing_private_key_passphrase = None;
    request.signing_cert = None;
    request.signing_public_key = None;
    request.copypath = None;
    request.prepend_cn = false;
    request.append_certs.clear();
    request.pkcs12_passphrase = None;
    request.revoked.clear();
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyTables;
    use crate::fs::LocalFs;
    use crate::matcher::StaticMatcher;
    use certpol_core::{load_certificate, CertificateBackend, CertificateKind, KeyAlgorithm};
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        server: CaServer,
        leaf: Material,
    }

    fn fixture(policy_extra: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_for(CertificateKind::X509);
        let ca = backend.generate_private_key(KeyAlgorithm::EcdsaP256).unwrap();
        let ca_path = dir.path().join("ca.key");
        std::fs::write(&ca_path, backend.encode_private_key(&ca, None).unwrap()).unwrap();
        let leaf = backend.generate_private_key(KeyAlgorithm::Ed25519).unwrap();
        let leaf_pub = backend
            .encode_public_key(&backend.derive_public_key(&leaf).unwrap())
            .unwrap();

        let src = format!(
            "[x509_signing_policies.www]\nsigning_private_key = {:?}\nsigning_private_key_passphrase = \"unused\"\nCN = \"www.example.com\"\n{policy_extra}",
            path_str(&ca_path)
        );
        let tables: PolicyTables = toml::from_str(&src).unwrap();
        Fixture {
            _dir: dir,
            server: CaServer::new(Arc::new(tables), Arc::new(LocalFs::new())),
            leaf: Material::Inline(leaf_pub),
        }
    }

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    fn envelope(policy: &str, request: CertificateRequest, identity: Option<&str>) -> PeerRequestEnvelope {
        PeerRequestEnvelope {
            signing_policy_name: policy.into(),
            request_kwargs: request,
            get_policy_only: false,
            requester_identity: identity.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let f = fixture("");
        let reply = f
            .server
            .handle(envelope("nope", CertificateRequest::x509(), None))
            .await;
        assert_eq!(
            reply.errors,
            vec!["signing_policy must be specified and defined on signing minion".to_string()]
        );
    }

    #[tokio::test]
    async fn test_signs_under_policy() {
        let f = fixture("");
        let mut req = CertificateRequest::x509();
        req.public_key = Some(f.leaf.clone());
        req.name_attributes = vec![(certpol_core::NameAttribute::CN, "evil.example.com".into())];
        let reply = f.server.handle(envelope("www", req, None)).await;
        let Some(ReplyData::Certificate(bytes)) = reply.data else {
            panic!("expected certificate, got {:?}", reply.errors);
        };
        let backend = backend_for(CertificateKind::X509);
        let cert = load_certificate(backend.as_ref(), &bytes, None).unwrap().certificate;
        assert_eq!(cert.info.common_name(), Some("www.example.com"));
    }

    #[tokio::test]
    async fn test_requester_matcher() {
        let f = fixture("minions = \"web*\"\n");
        let mut req = CertificateRequest::x509();
        req.public_key = Some(f.leaf.clone());

        let reply = f.server.handle(envelope("www", req.clone(), None)).await;
        assert_eq!(
            reply.errors,
            vec!["requester sending this request could not be identified".to_string()]
        );

        let reply = f.server.handle(envelope("www", req.clone(), Some("db1"))).await;
        assert_eq!(
            reply.errors,
            vec!["requester not permitted to use specified signing policy".to_string()]
        );
        assert!(!reply.errors.iter().any(|e| e.contains("web*")));

        let reply = f.server.handle(envelope("www", req, Some("web1"))).await;
        assert!(reply.errors.is_empty(), "{:?}", reply.errors);
    }

    #[tokio::test]
    async fn test_compound_matcher_is_delegated() {
        let f = fixture("minions = \"G@role:ca and web*\"\n");
        let mut req = CertificateRequest::x509();
        req.public_key = Some(f.leaf.clone());

        // no trusted matcher: refuse rather than evaluate the glob part
        let reply = f.server.handle(envelope("www", req.clone(), Some("web1"))).await;
        assert!(reply.data.is_none());

        let server = f.server.clone().with_matcher(RequesterMatcher::with_trusted(Arc::new(
            StaticMatcher::new().answer("G@role:ca and web*", "web1", true),
        )));
        let reply = server.handle(envelope("www", req, Some("web1"))).await;
        assert!(reply.errors.is_empty(), "{:?}", reply.errors);
    }

    #[tokio::test]
    async fn test_policy_only_reply_is_redacted() {
        let f = fixture("minions = \"web*\"\n");
        let mut env = envelope("www", CertificateRequest::x509(), Some("web1"));
        env.get_policy_only = true;
        let reply = f.server.handle(env).await;
        let Some(ReplyData::Policy(description)) = reply.data else {
            panic!("expected policy, got {:?}", reply.errors);
        };
        assert!(!description.policy.has_secrets());
        assert!(description.policy.requester_matcher.is_none());
        let json = serde_json::to_string(&description).unwrap();
        assert!(!json.contains("signing_private_key"));
        assert!(!json.contains("unused"));

        let backend = backend_for(CertificateKind::X509);
        let Material::Inline(pk) = description.signer_public_key else {
            panic!("public key must be inline");
        };
        assert!(backend.load_public_key(&pk).is_ok());
    }

    #[tokio::test]
    async fn test_issuance_errors_become_replies() {
        let f = fixture("signing_cert = \"/nonexistent/ca.crt\"\n");
        let mut req = CertificateRequest::x509();
        req.public_key = Some(f.leaf.clone());
        let reply = f.server.handle(envelope("www", req, None)).await;
        assert!(reply.data.is_none());
        assert_eq!(reply.errors.len(), 1);
        assert!(reply.errors[0].starts_with("while loading signing certificate"));
        assert!(!reply.errors[0].contains("/nonexistent"), "{}", reply.errors[0]);
    }

    #[tokio::test]
    async fn test_requester_cn_stays_inside_copypath() {
        let f = fixture("");
        let root = f._dir.path();
        let issued = root.join("a").join("issued");
        let src = format!(
            "[x509_signing_policies.open]\nsigning_private_key = {:?}\ncopypath = {:?}\nprepend_cn = true\n",
            path_str(&root.join("ca.key")),
            path_str(&issued),
        );
        let tables: PolicyTables = toml::from_str(&src).unwrap();
        let server = CaServer::new(Arc::new(tables), Arc::new(LocalFs::new()));

        let mut req = CertificateRequest::x509();
        req.public_key = Some(f.leaf.clone());
        req.name_attributes = vec![(certpol_core::NameAttribute::CN, "../../escaped".into())];
        let reply = server.handle(envelope("open", req, None)).await;
        assert!(reply.errors.is_empty(), "{:?}", reply.errors);

        let escaped = std::fs::read_dir(root)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with("escaped"));
        assert!(!escaped);
        assert_eq!(std::fs::read_dir(&issued).unwrap().count(), 1);
    }

    /// File sink that blows up on every read
    struct PanickingFs;

    #[async_trait::async_trait]
    impl FileSink for PanickingFs {
        async fn exists(&self, _path: &Path) -> bool {
            true
        }
        async fn is_symlink(&self, _path: &Path) -> bool {
            false
        }
        async fn read(&self, _path: &Path) -> crate::fs::FsResult<Vec<u8>> {
            panic!("disk on fire")
        }
        async fn write_atomic(
            &self,
            _path: &Path,
            _contents: &[u8],
            _mode: u32,
        ) -> crate::fs::FsResult<()> {
            Ok(())
        }
        async fn backup(&self, _path: &Path) -> crate::fs::FsResult<Option<std::path::PathBuf>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error_reply() {
        let f = fixture("");
        let server = CaServer {
            fs: Arc::new(PanickingFs),
            ..f.server.clone()
        };
        let mut req = CertificateRequest::x509();
        req.public_key = Some(f.leaf.clone());
        let reply = server.handle(envelope("www", req, None)).await;
        assert_eq!(reply.errors, vec![INTERNAL_ERROR.to_string()]);
    }

    #[tokio::test]
    async fn test_broken_policy_is_sanitized() {
        let f = fixture("digest = \"md5\"\n");
        let reply = f
            .server
            .handle(envelope("www", CertificateRequest::x509(), None))
            .await;
        assert_eq!(reply.errors, vec![POLICY_FAILURE.to_string()]);
    }

    #[test]
    fn test_sanitize_strips_ca_side_fields() {
        let mut req = CertificateRequest::x509();
        req.public_key = Some(Material::Path("/etc/shadow".into()));
        req.signing_private_key = Some(Material::inline("key"));
        req.copypath = Some("/tmp".into());
        let clean = sanitize(req);
        assert!(clean.public_key.is_none());
        assert!(clean.signing_private_key.is_none());
        assert!(clean.copypath.is_none());
    }
}
