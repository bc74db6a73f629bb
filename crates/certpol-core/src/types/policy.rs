//! CA-side signing policies.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Allowed, CertificateKind, Digest, ExtensionSet, Material, NameAttribute, Principals,
    SerialNumber, SshCertType, SubjectSpec,
};

/// Constraints a CA applies to requests signed under one policy name.
///
/// Policies are read-only once loaded: the merge engine works on its own
/// copy and never writes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPolicy {
    /// Certificate family the policy applies to
    pub kind: CertificateKind,

    /// Critical options that are always applied (OpenSSH)
    #[serde(default, skip_serializing_if = "ExtensionSet::is_empty")]
    pub forced_options: ExtensionSet,
    /// Critical options used when the requester sets none of their own
    #[serde(default, skip_serializing_if = "ExtensionSet::is_empty")]
    pub default_options: ExtensionSet,
    /// Critical options a requester may set
    #[serde(default)]
    pub allowed_options: Allowed,

    /// Extensions that are always applied
    #[serde(default, skip_serializing_if = "ExtensionSet::is_empty")]
    pub forced_extensions: ExtensionSet,
    /// Extensions used unless the requester sets them
    #[serde(default, skip_serializing_if = "ExtensionSet::is_empty")]
    pub default_extensions: ExtensionSet,
    /// Extensions a requester may set
    #[serde(default)]
    pub allowed_extensions: Allowed,

    /// Principals a requester may ask for (OpenSSH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_principals: Option<Vec<String>>,
    /// Principals used when the requester asks for none (OpenSSH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_principals: Option<Vec<String>>,
    /// Principals that replace whatever was requested (OpenSSH)
    #[serde(default, skip_serializing_if = "Principals::is_unspecified")]
    pub principals: Principals,

    /// Full subject constraint (X.509)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectSpec>,
    /// Individual name attributes that replace the requested subject (X.509)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_attributes: Vec<(NameAttribute, String)>,

    /// Default validity in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Validity ceiling in seconds, defaults to `ttl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<u64>,

    /// Restricts which requester identities may use the policy: a glob,
    /// or a compound expression evaluated by a trusted matcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_matcher: Option<String>,

    /// Fields copied onto every resolved request
    #[serde(default)]
    pub overrides: PolicyOverrides,
}

/// Fields a policy sets authoritatively, replacing any requested value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_private_key: Option<Material>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_private_key_passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_cert: Option<Material>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_public_key: Option<Material>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_type: Option<SshCertType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<SerialNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copypath: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepend_cn: Option<bool>,
}

impl SigningPolicy {
    /// Unrestricted policy of the given kind
    #[must_use]
    pub fn new(kind: CertificateKind) -> Self {
        Self {
            kind,
            forced_options: ExtensionSet::new(),
            default_options: ExtensionSet::new(),
            allowed_options: Allowed::Any,
            forced_extensions: ExtensionSet::new(),
            default_extensions: ExtensionSet::new(),
            allowed_extensions: Allowed::Any,
            allowed_principals: None,
            default_principals: None,
            principals: Principals::Unspecified,
            subject: None,
            name_attributes: Vec::new(),
            ttl: None,
            max_ttl: None,
            requester_matcher: None,
            overrides: PolicyOverrides::default(),
        }
    }

    /// Whether the policy carries secrets that must not leave the CA
    #[must_use]
    pub const fn has_secrets(&self) -> bool {
        self.overrides.signing_private_key.is_some()
            || self.overrides.signing_private_key_passphrase.is_some()
    }

    /// Copy with the signing key, its passphrase and the requester matcher
    /// removed. This is the only form of a policy that may be sent to a
    /// requester.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        out.overrides.signing_private_key = None;
        out.overrides.signing_private_key_passphrase = None;
        out.requester_matcher = None;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_strips_secrets() {
        let mut policy = SigningPolicy::new(CertificateKind::X509);
        policy.overrides.signing_private_key = Some(Material::Path("/etc/pki/ca.key".into()));
        policy.overrides.signing_private_key_passphrase = Some("hunter2".into());
        policy.overrides.signing_cert = Some(Material::Path("/etc/pki/ca.crt".into()));
        policy.requester_matcher = Some("web*".into());
        assert!(policy.has_secrets());

        let redacted = policy.redacted();
        assert!(!redacted.has_secrets());
        assert!(redacted.requester_matcher.is_none());
        assert_eq!(redacted.overrides.signing_cert, policy.overrides.signing_cert);

        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("signing_private_key"));
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_minimal_policy_deserializes() {
        let policy: SigningPolicy = serde_json::from_str(r#"{"kind":"ssh"}"#).unwrap();
        assert_eq!(policy, SigningPolicy::new(CertificateKind::Ssh));
    }
}
