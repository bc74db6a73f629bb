//! Structured difference between an artifact on disk and the desired one.

use serde::{Deserialize, Serialize};

use super::RevocationsDiff;
use crate::compare::ExtensionDiff;

/// Marker used in principal diffs for "valid for every principal"
pub const ALL_PRINCIPALS: &str = "*ALL*";

/// Principals gained and lost
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalsDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Everything that differs between an existing artifact and a resolved request.
///
/// An empty change set means nothing needs to happen. A change set holding
/// only metadata fields (`encoding`, `additional_certs`, PKCS#12 settings)
/// means the existing certificate can be re-encoded instead of reissued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Explicitly requested serial differs
    #[serde(default, skip_serializing_if = "is_false")]
    pub serial_number: bool,
    /// Subject public key differs
    #[serde(default, skip_serializing_if = "is_false")]
    pub private_key: bool,
    /// Existing signature does not verify against the CA key
    #[serde(default, skip_serializing_if = "is_false")]
    pub signing_private_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub subject_name: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub issuer_name: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub key_id: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cert_type: bool,
    /// Remaining validity is below the renewal threshold
    #[serde(default, skip_serializing_if = "is_false")]
    pub expiration: bool,
    /// Signature digest differs
    #[serde(default, skip_serializing_if = "is_false")]
    pub digest: bool,
    /// X.509 extensions or OpenSSH extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<ExtensionDiff>,
    /// OpenSSH critical options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_options: Option<ExtensionDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principals: Option<PrincipalsDiff>,
    /// CRL entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocations: Option<RevocationsDiff>,

    /// Output encoding differs
    #[serde(default, skip_serializing_if = "is_false")]
    pub encoding: bool,
    /// Appended chain differs
    #[serde(default, skip_serializing_if = "is_false")]
    pub additional_certs: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pkcs12_friendlyname: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pkcs12_passphrase: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(b: &bool) -> bool {
    !*b
}

impl ChangeSet {
    /// No difference at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.requires_reissue() && !self.has_metadata_changes()
    }

    /// Some difference that a new signature is needed for
    #[must_use]
    pub fn requires_reissue(&self) -> bool {
        self.serial_number
            || self.private_key
            || self.signing_private_key
            || self.subject_name
            || self.issuer_name
            || self.key_id
            || self.cert_type
            || self.expiration
            || self.digest
            || self.extensions.is_some()
            || self.critical_options.is_some()
            || self.principals.is_some()
            || self.revocations.is_some()
    }

    /// Some difference in how the artifact is serialized
    #[must_use]
    pub const fn has_metadata_changes(&self) -> bool {
        self.encoding || self.additional_certs || self.pkcs12_friendlyname || self.pkcs12_passphrase
    }

    /// Only serialization differs; the certificate itself can be kept
    #[must_use]
    pub fn is_metadata_only(&self) -> bool {
        self.has_metadata_changes() && !self.requires_reissue()
    }

    /// Names of the fields that differ, for logging and reporting
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let flags = [
            (self.serial_number, "serial_number"),
            (self.private_key, "private_key"),
            (self.signing_private_key, "signing_private_key"),
            (self.subject_name, "subject_name"),
            (self.issuer_name, "issuer_name"),
            (self.key_id, "key_id"),
            (self.cert_type, "cert_type"),
            (self.expiration, "expiration"),
            (self.digest, "digest"),
            (self.extensions.is_some(), "extensions"),
            (self.critical_options.is_some(), "critical_options"),
            (self.principals.is_some(), "principals"),
            (self.revocations.is_some(), "revocations"),
            (self.encoding, "encoding"),
            (self.additional_certs, "additional_certs"),
            (self.pkcs12_friendlyname, "pkcs12_friendlyname"),
            (self.pkcs12_passphrase, "pkcs12_passphrase"),
        ];
        flags
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect()
    }
}
