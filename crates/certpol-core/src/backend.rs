//! Certificate backend contract.
//!
//! The engines never touch ASN.1 or the OpenSSH wire format. They work on
//! the handle types below, which a [`CertificateBackend`] produces from
//! encoded bytes and turns back into bytes.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::types::{
    ArtifactKind, CertificateKind, Digest, DistinguishedName, Encoding, ExtensionSet,
    KeyAlgorithm, Principals, ResolvedRequest, Revocation, SerialNumber, SshCertType,
};

/// Result alias for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Decrypted private key.
///
/// Holds PKCS#8 DER for X.509 keys and unencrypted OpenSSH text for
/// OpenSSH keys.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    kind: CertificateKind,
    algorithm: KeyAlgorithm,
    encoded: Vec<u8>,
}

impl PrivateKey {
    #[must_use]
    pub const fn new(kind: CertificateKind, algorithm: KeyAlgorithm, encoded: Vec<u8>) -> Self {
        Self {
            kind,
            algorithm,
            encoded,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CertificateKind {
        self.kind
    }

    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Backend-specific unencrypted encoding
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("kind", &self.kind)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Public key. Two keys are equal when their encodings are equal.
///
/// Holds SubjectPublicKeyInfo DER for X.509 keys and the comment-free
/// OpenSSH line for OpenSSH keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    kind: CertificateKind,
    algorithm: KeyAlgorithm,
    #[serde(with = "crate::serde_b64")]
    encoded: Vec<u8>,
}

impl PublicKey {
    #[must_use]
    pub const fn new(kind: CertificateKind, algorithm: KeyAlgorithm, encoded: Vec<u8>) -> Self {
        Self {
            kind,
            algorithm,
            encoded,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CertificateKind {
        self.kind
    }

    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }
}

/// Backend-independent view of a certificate, CSR or CRL.
///
/// For CRLs `serial_number` holds the CRL number, `not_before` and
/// `not_after` the this/next update times, and `public_key` the issuer key
/// when known (drafts and freshly signed CRLs). CRLs read back from disk
/// carry an empty key; their issuer is checked by signature instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub kind: CertificateKind,
    pub artifact: ArtifactKind,
    pub public_key: PublicKey,
    pub serial_number: Option<SerialNumber>,
    /// Subject (X.509)
    pub subject: Option<DistinguishedName>,
    /// Issuer (X.509 certificates)
    pub issuer: Option<DistinguishedName>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// X.509 extensions or OpenSSH extensions
    pub extensions: ExtensionSet,
    /// OpenSSH critical options
    pub options: ExtensionSet,
    pub principals: Principals,
    pub key_id: Option<String>,
    pub cert_type: Option<SshCertType>,
    /// Digest of the signature, `None` when fixed by the algorithm
    pub digest: Option<Digest>,
    /// CRL entries
    pub revoked: Vec<Revocation>,
}

impl CertificateInfo {
    /// Expires before `now + threshold`
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.not_after.is_some_and(|na| na < now + threshold)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after.is_some_and(|na| na <= now)
    }

    /// Common name of the subject, if any
    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.subject.as_ref().and_then(DistinguishedName::common_name)
    }
}

/// Signed certificate or CSR plus its parsed view.
///
/// `encoded` is DER for X.509 artifacts and the OpenSSH line for OpenSSH
/// certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub encoded: Vec<u8>,
    pub info: CertificateInfo,
}

impl Certificate {
    /// SHA-256 of the encoded artifact, lowercase hex
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(ring::digest::digest(&ring::digest::SHA256, &self.encoded))
    }
}

/// Public identity of the signer: enough to build a draft and verify an
/// existing signature, not enough to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerIdentity {
    pub public_key: PublicKey,
    /// CA certificate (X.509); issuance is self-signed style without one
    pub certificate: Option<Certificate>,
}

/// Unsigned artifact: the resolved request plus the view the signed
/// artifact will have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub request: ResolvedRequest,
    pub signer: SignerIdentity,
    pub info: CertificateInfo,
}

/// Artifact read back from storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedArtifact {
    pub certificate: Certificate,
    pub encoding: Encoding,
    /// Additional certificates stored after the first one
    pub chain: Vec<Certificate>,
    /// PKCS#12 friendly name
    pub friendly_name: Option<String>,
    /// Container was passphrase protected
    pub protected: bool,
}

impl LoadedArtifact {
    /// Unprotected artifact without a friendly name
    #[must_use]
    pub const fn new(certificate: Certificate, encoding: Encoding, chain: Vec<Certificate>) -> Self {
        Self {
            certificate,
            encoding,
            chain,
            friendly_name: None,
            protected: false,
        }
    }
}

/// Options for [`CertificateBackend::encode`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions<'a> {
    /// Certificates to append after the leaf
    pub chain: &'a [Certificate],
    /// Private key to embed (PKCS#12)
    pub embed_key: Option<&'a PrivateKey>,
    /// Export passphrase (PKCS#12)
    pub passphrase: Option<&'a str>,
    /// Friendly name (PKCS#12)
    pub friendly_name: Option<&'a str>,
}

/// Cryptographic library adapter.
///
/// Object safe: the orchestrator holds backends as `Arc<dyn CertificateBackend>`.
pub trait CertificateBackend: Send + Sync {
    /// Certificate family handled by this backend
    fn kind(&self) -> CertificateKind;

    /// Encodings [`CertificateBackend::decode_certificate`] understands, in
    /// load order
    fn load_order(&self) -> &'static [Encoding];

    /// Encoding a freshly signed artifact is returned in by default
    fn default_encoding(&self) -> Encoding;

    fn generate_private_key(&self, algorithm: KeyAlgorithm) -> BackendResult<PrivateKey>;

    fn load_private_key(&self, bytes: &[u8], passphrase: Option<&str>) -> BackendResult<PrivateKey>;

    /// Serialize a private key, encrypted when a passphrase is given
    fn encode_private_key(&self, key: &PrivateKey, passphrase: Option<&str>)
        -> BackendResult<Vec<u8>>;

    fn load_public_key(&self, bytes: &[u8]) -> BackendResult<PublicKey>;

    fn derive_public_key(&self, key: &PrivateKey) -> BackendResult<PublicKey>;

    fn encode_public_key(&self, key: &PublicKey) -> BackendResult<Vec<u8>>;

    /// Decode an artifact stored in exactly `encoding`: the leaf, any chain
    /// certificates and the container's metadata.
    fn decode_certificate(
        &self,
        bytes: &[u8],
        encoding: Encoding,
        passphrase: Option<&str>,
    ) -> BackendResult<LoadedArtifact>;

    /// Load a certificate signing request
    fn load_csr(&self, bytes: &[u8]) -> BackendResult<Certificate>;

    /// Load a certificate revocation list in PEM or DER form
    fn load_crl(&self, _bytes: &[u8]) -> BackendResult<LoadedArtifact> {
        Err(BackendError::Unrecognized { what: "crl" })
    }

    /// Assemble an unsigned draft. Needs only the signer's public identity.
    fn build_draft(
        &self,
        artifact: ArtifactKind,
        request: &ResolvedRequest,
        subject_key: &PublicKey,
        signer: &SignerIdentity,
    ) -> BackendResult<Draft>;

    /// Sign a draft. `digest` is ignored for algorithms with a fixed digest.
    fn sign(
        &self,
        draft: &Draft,
        key: &PrivateKey,
        digest: Option<Digest>,
    ) -> BackendResult<Certificate>;

    /// Whether `certificate` was signed by `key`. Never fails on mismatch.
    fn verify_signature(&self, certificate: &Certificate, key: &PublicKey) -> bool;

    fn is_key_pair(&self, public: &PublicKey, private: &PrivateKey) -> bool {
        self.derive_public_key(private)
            .is_ok_and(|derived| &derived == public)
    }

    fn encode(
        &self,
        certificate: &Certificate,
        encoding: Encoding,
        options: EncodeOptions<'_>,
    ) -> BackendResult<Vec<u8>>;
}

/// Load a certificate of unknown encoding by trying every encoding the
/// backend supports, in its load order.
///
/// Encodings the backend cannot handle count as "did not parse". Fails with
/// [`BackendError::Unrecognized`] only if nothing parsed, except that a
/// passphrase problem is reported as such.
pub fn load_certificate(
    backend: &dyn CertificateBackend,
    bytes: &[u8],
    passphrase: Option<&str>,
) -> BackendResult<LoadedArtifact> {
    let mut passphrase_error = None;
    for encoding in backend.load_order() {
        match backend.decode_certificate(bytes, *encoding, passphrase) {
            Ok(loaded) => return Ok(loaded),
            Err(e @ (BackendError::Encrypted | BackendError::WrongPassphrase)) => {
                passphrase_error = Some(e);
            }
            Err(_) => {}
        }
    }
    Err(passphrase_error.unwrap_or(BackendError::Unrecognized {
        what: "certificate",
    }))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_load_certificate_unrecognized_when_nothing_parses() {
        let backend = FakeBackend::default();
        let err = load_certificate(&backend, b"pkcs12:xx", None).unwrap_err();
        assert_eq!(err, BackendError::Unrecognized { what: "certificate" });
    }

    #[test]
    fn test_load_certificate_reports_passphrase_problems() {
        let backend = FakeBackend::default();
        let err = load_certificate(&backend, b"pkcs12:locked", None).unwrap_err();
        assert_eq!(err, BackendError::Encrypted);
    }

    #[test]
    fn test_fake_signature_roundtrip() {
        let backend = FakeBackend::default();
        let req = ResolvedRequest::unrestricted(crate::types::CertificateRequest::x509());
        let draft = backend
            .build_draft(ArtifactKind::Certificate, &req, &public_key("leaf"), &signer("ca"))
            .unwrap();
        let cert = backend.sign(&draft, &private_key("ca"), None).unwrap();
        assert!(backend.verify_signature(&cert, &public_key("ca")));
        assert!(!backend.verify_signature(&cert, &public_key("other")));
        assert!(backend.is_key_pair(&public_key("ca"), &private_key("ca")));
    }

    #[test]
    fn test_info_expiry_helpers() {
        let backend = FakeBackend::default();
        let mut req = crate::types::CertificateRequest::x509();
        req.ttl = Some(3_600);
        let draft = backend
            .build_draft(
                ArtifactKind::Certificate,
                &ResolvedRequest::unrestricted(req),
                &public_key("leaf"),
                &signer("ca"),
            )
            .unwrap();
        let now = Utc::now();
        assert!(!draft.info.is_expired(now));
        assert!(draft.info.expires_within(now, Duration::hours(2)));
        assert!(!draft.info.expires_within(now, Duration::minutes(30)));
    }
}
