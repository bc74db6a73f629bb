//! Certificate requests and the small value types they are built from.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{ExtensionSet, NameAttribute, RevokedCertificate, SubjectSpec};
use crate::BackendError;

/// Certificate family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateKind {
    X509,
    Ssh,
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X509 => "x509",
            Self::Ssh => "ssh",
        })
    }
}

/// What a draft turns into when signed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Signed certificate
    Certificate,
    /// Certificate signing request (X.509 only)
    Csr,
    /// Certificate revocation list (X.509 only)
    Crl,
}

/// Serialized form of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Pem,
    Der,
    Pkcs7,
    Pkcs12,
    /// OpenSSH certificate line
    OpenSsh,
}

impl Encoding {
    /// Load order for X.509 artifacts of unknown encoding
    pub const X509_LOAD_ORDER: [Self; 4] = [Self::Pem, Self::Der, Self::Pkcs7, Self::Pkcs12];

    /// Whether additional certificates can travel in this encoding
    #[must_use]
    pub const fn supports_chain(self) -> bool {
        matches!(self, Self::Pem | Self::Pkcs7 | Self::Pkcs12)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pem => "pem",
            Self::Der => "der",
            Self::Pkcs7 => "pkcs7_pem",
            Self::Pkcs12 => "pkcs12",
            Self::OpenSsh => "openssh",
        })
    }
}

/// Signature digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Digest {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha512_224,
    Sha512_256,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
}

impl Digest {
    pub const ALL: [Self; 11] = [
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
        Self::Sha512_224,
        Self::Sha512_256,
        Self::Sha3_224,
        Self::Sha3_256,
        Self::Sha3_384,
        Self::Sha3_512,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
            Self::Sha512_224 => "sha512_224",
            Self::Sha512_256 => "sha512_256",
            Self::Sha3_224 => "sha3_224",
            Self::Sha3_256 => "sha3_256",
            Self::Sha3_384 => "sha3_384",
            Self::Sha3_512 => "sha3_512",
        }
    }
}

impl FromStr for Digest {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|d| d.name() == lower)
            .ok_or_else(|| BackendError::UnsupportedDigest(s.to_string()))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key algorithm of a private or public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
    EcdsaP384,
    Rsa,
}

impl KeyAlgorithm {
    /// Digest the algorithm signs with when none is requested. `None` for
    /// algorithms whose digest is fixed by the scheme.
    #[must_use]
    pub const fn natural_digest(self) -> Option<Digest> {
        match self {
            Self::Ed25519 => None,
            Self::EcdsaP256 | Self::Rsa => Some(Digest::Sha256),
            Self::EcdsaP384 => Some(Digest::Sha384),
        }
    }
}

/// OpenSSH certificate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshCertType {
    #[default]
    User,
    Host,
}

impl fmt::Display for SshCertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Host => "host",
        })
    }
}

/// Big-endian serial number, written as colon-free lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    /// Serial from big-endian bytes, leading zero bytes stripped
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let mut trimmed = bytes[first..].to_vec();
        if trimmed.is_empty() {
            trimmed.push(0);
        }
        Self(trimmed)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Low 64 bits, for formats with a fixed-width serial
    #[must_use]
    pub fn to_u64(&self) -> u64 {
        self.0
            .iter()
            .rev()
            .take(8)
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl From<u64> for SerialNumber {
    fn from(n: u64) -> Self {
        Self::from_bytes(&n.to_be_bytes())
    }
}

impl FromStr for SerialNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':').collect();
        let padded = if cleaned.len() % 2 == 1 {
            format!("0{cleaned}")
        } else {
            cleaned
        };
        hex::decode(&padded)
            .map(|b| Self::from_bytes(&b))
            .map_err(|e| format!("invalid serial number {s:?}: {e}"))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Serialize for SerialNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SerialNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key, certificate or CSR material, either on disk or inline
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Material {
    /// Path readable by the node doing the work
    Path(PathBuf),
    /// Encoded bytes (PEM text, DER, OpenSSH text)
    Inline(#[serde(with = "crate::serde_b64")] Vec<u8>),
}

impl Material {
    /// Inline material from text such as PEM
    pub fn inline(text: impl AsRef<[u8]>) -> Self {
        Self::Inline(text.as_ref().to_vec())
    }

    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self, Self::Inline(_))
    }
}

// Inline material may be a private key.
impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::Inline(b) => write!(f, "Inline(<{} bytes>)", b.len()),
        }
    }
}

/// Principals of an OpenSSH certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principals {
    /// Nothing requested
    #[default]
    Unspecified,
    /// Explicit list
    List(Vec<String>),
    /// Valid for every principal
    All,
}

impl Principals {
    #[must_use]
    pub const fn is_unspecified(&self) -> bool {
        matches!(self, Self::Unspecified)
    }
}

/// Requester-supplied specification of a certificate or CSR.
///
/// The same shape is used before and after policy merge; see
/// [`ResolvedRequest`] for the merged form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    /// Certificate family
    pub kind: CertificateKind,

    /// Subject public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Material>,
    /// Subject private key (public key is derived from it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Material>,
    /// Passphrase for `private_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,
    /// CSR to take the public key from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<Material>,

    /// Full subject (X.509)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectSpec>,
    /// Individual name attributes (X.509), e.g. `CN`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_attributes: Vec<(NameAttribute, String)>,
    /// Principals (OpenSSH)
    #[serde(default, skip_serializing_if = "Principals::is_unspecified")]
    pub principals: Principals,
    /// Key identifier (OpenSSH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// User or host certificate (OpenSSH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_type: Option<SshCertType>,

    /// OpenSSH critical options
    #[serde(default, skip_serializing_if = "ExtensionSet::is_empty")]
    pub options: ExtensionSet,
    /// X.509 extensions or OpenSSH extensions
    #[serde(default, skip_serializing_if = "ExtensionSet::is_empty")]
    pub extensions: ExtensionSet,

    /// Start of validity, defaults to now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// End of validity, takes precedence over `ttl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    /// Validity in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Explicit serial, random when absent. For CRLs this is the CRL
    /// number, one past the previous CRL's when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<SerialNumber>,
    /// Signature digest, the signing key's natural digest when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,

    /// CA private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_private_key: Option<Material>,
    /// Passphrase for `signing_private_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_private_key_passphrase: Option<String>,
    /// CA certificate (X.509), self-signed issuance when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_cert: Option<Material>,
    /// CA public key, used when the private key is not available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_public_key: Option<Material>,

    /// Directory receiving a serial-named copy of issued certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copypath: Option<PathBuf>,
    /// Prefix copypath file names with the common name
    #[serde(default)]
    pub prepend_cn: bool,

    /// Output encoding
    #[serde(default)]
    pub encoding: Encoding,
    /// Certificates appended after the issued one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_certs: Vec<Material>,
    /// PKCS#12 friendly name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs12_friendlyname: Option<String>,
    /// PKCS#12 export passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs12_passphrase: Option<String>,

    /// Certificates listed in a CRL
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revoked: Vec<RevokedCertificate>,
    /// Keep CRL entries for certificates that have already expired
    #[serde(default)]
    pub include_expired: bool,
}

impl CertificateRequest {
    /// Empty request of the given kind
    #[must_use]
    pub fn new(kind: CertificateKind) -> Self {
        Self {
            kind,
            public_key: None,
            private_key: None,
            private_key_passphrase: None,
            csr: None,
            subject: None,
            name_attributes: Vec::new(),
            principals: Principals::Unspecified,
            key_id: None,
            cert_type: None,
            options: ExtensionSet::new(),
            extensions: ExtensionSet::new(),
            not_before: None,
            not_after: None,
            ttl: None,
            serial_number: None,
            digest: None,
            signing_private_key: None,
            signing_private_key_passphrase: None,
            signing_cert: None,
            signing_public_key: None,
            copypath: None,
            prepend_cn: false,
            encoding: if kind == CertificateKind::Ssh {
                Encoding::OpenSsh
            } else {
                Encoding::Pem
            },
            append_certs: Vec::new(),
            pkcs12_friendlyname: None,
            pkcs12_passphrase: None,
            revoked: Vec::new(),
            include_expired: false,
        }
    }

    /// Empty X.509 request
    #[must_use]
    pub fn x509() -> Self {
        Self::new(CertificateKind::X509)
    }

    /// Empty OpenSSH request
    #[must_use]
    pub fn ssh() -> Self {
        Self::new(CertificateKind::Ssh)
    }

    /// Validity expressed in days
    #[must_use]
    pub fn days_valid(mut self, days: u64) -> Self {
        self.ttl = Some(days * 86_400);
        self
    }

    /// Copy for sending to a remote CA: local key material and output
    /// options stay on this node.
    #[must_use]
    pub fn for_remote(&self) -> Self {
        let mut out = self.clone();
        out.private_key = None;
        out.private_key_passphrase = None;
        out.signing_private_key = None;
        out.signing_private_key_passphrase = None;
        out.copypath = None;
        out.append_certs.clear();
        out.pkcs12_passphrase = None;
        out.revoked.clear();
        out
    }
}

/// A request after policy merge. Guaranteed policy-compliant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedRequest(CertificateRequest);

impl ResolvedRequest {
    /// Treat a request as resolved without a policy (local unrestricted issuance)
    #[must_use]
    pub const fn unrestricted(request: CertificateRequest) -> Self {
        Self(request)
    }

    #[must_use]
    pub fn into_inner(self) -> CertificateRequest {
        self.0
    }

    /// Apply a change to the resolved request. Only for node-local
    /// defaults (fallback ttl, inline key material), never for policy data.
    #[must_use]
    pub fn map(self, f: impl FnOnce(CertificateRequest) -> CertificateRequest) -> Self {
        Self(f(self.0))
    }
}

impl Deref for ResolvedRequest {
    type Target = CertificateRequest;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_names() {
        assert_eq!("SHA256".parse::<Digest>().unwrap(), Digest::Sha256);
        assert_eq!("sha3_512".parse::<Digest>().unwrap(), Digest::Sha3_512);
        assert_eq!(
            "md5".parse::<Digest>().unwrap_err(),
            BackendError::UnsupportedDigest("md5".into())
        );
    }

    #[test]
    fn test_serial_number_parsing() {
        let s: SerialNumber = "00:0a:ff".parse().unwrap();
        assert_eq!(s.as_bytes(), &[0x0a, 0xff]);
        assert_eq!(s.to_string(), "0aff");
        assert_eq!(s.to_u64(), 0x0aff);
        let odd: SerialNumber = "abc".parse().unwrap();
        assert_eq!(odd.as_bytes(), &[0x0a, 0xbc]);
        assert!("zz".parse::<SerialNumber>().is_err());
        assert_eq!(SerialNumber::from(0).as_bytes(), &[0]);
    }

    #[test]
    fn test_chain_support() {
        assert!(Encoding::Pem.supports_chain());
        assert!(!Encoding::Der.supports_chain());
    }

    #[test]
    fn test_for_remote_strips_local_secrets() {
        let mut req = CertificateRequest::x509();
        req.private_key = Some(Material::inline("key"));
        req.signing_private_key = Some(Material::inline("ca key"));
        req.copypath = Some("/tmp/issued".into());
        let remote = req.for_remote();
        assert!(remote.private_key.is_none());
        assert!(remote.signing_private_key.is_none());
        assert!(remote.copypath.is_none());
    }

    #[test]
    fn test_request_json_shape() {
        let mut req = CertificateRequest::ssh().days_valid(1);
        req.principals = Principals::List(vec!["alice".into()]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "ssh");
        assert_eq!(json["ttl"], 86_400);
        assert_eq!(json["encoding"], "openssh");
        let back: CertificateRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
