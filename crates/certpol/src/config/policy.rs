//! Signing policies as written in TOML.
//!
//! The file form is friendlier than [`SigningPolicy`]'s wire form:
//! extension values are compact strings (`"critical,CA:true"`), key
//! material is a path or inline PEM, and name attributes or extensions may
//! sit at the top level of the table.
//!
//! ```toml
//! [x509_signing_policies.www]
//! signing_private_key = "/etc/pki/ca.key"
//! signing_cert = "/etc/pki/ca.crt"
//! CN = "www.example.com"
//! basicConstraints = "critical,CA:false"
//! allowed_extensions = ["subjectAltName"]
//! ttl = "30d"
//! minions = "web*"
//! ```
//!
//! A policy may also be a list of single-key tables, which is flattened
//! into one table with later entries winning.

use std::collections::BTreeMap;
use std::path::PathBuf;

use certpol_core::{
    Allowed, CertificateKind, Digest, Error, ExtensionKind, ExtensionSet, Material,
    NameAttribute, PolicyOverrides, Principals, Result, SerialNumber, SigningPolicy,
    SshCertType, SshSection, SubjectSpec,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::HumanDuration;

/// A policy entry: one table, or a list of tables merged in order
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PolicyEntry {
    Table(toml::Table),
    List(Vec<toml::Table>),
}

impl PolicyEntry {
    fn flatten(&self) -> toml::Table {
        match self {
            Self::Table(table) => table.clone(),
            Self::List(items) => {
                let mut out = toml::Table::new();
                for item in items {
                    out.extend(item.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                out
            }
        }
    }

    /// Resolve into a policy of the given kind
    pub fn to_policy(&self, kind: CertificateKind, name: &str) -> Result<SigningPolicy> {
        let raw: RawPolicy = toml::Value::Table(self.flatten())
            .try_into()
            .map_err(|e| Error::Config(format!("signing policy {name:?}: {e}")))?;
        raw.into_policy(kind)
            .map_err(|e| Error::Config(format!("signing policy {name:?}: {e}")))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicy {
    #[serde(default)]
    forced_options: BTreeMap<String, String>,
    #[serde(default)]
    default_options: BTreeMap<String, String>,
    #[serde(default)]
    allowed_options: Option<Allowed>,
    #[serde(default)]
    forced_extensions: BTreeMap<String, String>,
    #[serde(default)]
    default_extensions: BTreeMap<String, String>,
    #[serde(default)]
    allowed_extensions: Option<Allowed>,

    #[serde(default, alias = "allowed_valid_principals")]
    allowed_principals: Option<Vec<String>>,
    #[serde(default, alias = "default_valid_principals")]
    default_principals: Option<Vec<String>>,
    #[serde(default, alias = "valid_principals")]
    principals: Option<Vec<String>>,
    #[serde(default)]
    all_principals: bool,

    #[serde(default)]
    subject: Option<SubjectSpec>,

    #[serde(default)]
    ttl: Option<HumanDuration>,
    #[serde(default)]
    max_ttl: Option<HumanDuration>,
    #[serde(default)]
    days_valid: Option<u64>,

    #[serde(default, alias = "minions")]
    requester_matcher: Option<String>,

    #[serde(default)]
    signing_private_key: Option<String>,
    #[serde(default)]
    signing_private_key_passphrase: Option<String>,
    #[serde(default)]
    signing_cert: Option<String>,
    #[serde(default)]
    signing_public_key: Option<String>,
    #[serde(default)]
    cert_type: Option<SshCertType>,
    #[serde(default)]
    key_id: Option<String>,
    #[serde(default)]
    digest: Option<Digest>,
    #[serde(default)]
    serial_number: Option<SerialNumber>,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    copypath: Option<PathBuf>,
    #[serde(default)]
    prepend_cn: Option<bool>,

    /// Name attributes and extensions given at the top level
    #[serde(flatten)]
    rest: BTreeMap<String, toml::Value>,
}

/// Key material written in a policy: inline when it looks like PEM or an
/// OpenSSH key line, a path otherwise.
#[must_use]
pub fn material(value: &str) -> Material {
    let trimmed = value.trim_start();
    if trimmed.starts_with("-----BEGIN") || trimmed.starts_with("ssh-") || trimmed.starts_with("ecdsa-") {
        Material::inline(value)
    } else {
        Material::Path(PathBuf::from(value))
    }
}

fn extension_set(entries: &BTreeMap<String, String>) -> std::result::Result<ExtensionSet, String> {
    let mut set = ExtensionSet::new();
    for (name, raw) in entries {
        let kind = ExtensionKind::from_name(name)
            .ok_or_else(|| format!("unknown extension or option {name:?}"))?;
        set.insert_raw(kind, raw);
    }
    Ok(set)
}

fn text_value(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

impl RawPolicy {
    fn into_policy(self, kind: CertificateKind) -> std::result::Result<SigningPolicy, String> {
        let mut policy = SigningPolicy::new(kind);
        policy.forced_options = extension_set(&self.forced_options)?;
        policy.default_options = extension_set(&self.default_options)?;
        policy.allowed_options = self.allowed_options.unwrap_or_default();
        policy.forced_extensions = extension_set(&self.forced_extensions)?;
        policy.default_extensions = extension_set(&self.default_extensions)?;
        policy.allowed_extensions = self.allowed_extensions.unwrap_or_default();

        // Top-level keys are either name attributes or forced extensions
        for (key, value) in &self.rest {
            let text = text_value(value).ok_or_else(|| format!("{key:?} must be a string"))?;
            if let Some(attr) = NameAttribute::from_short_name(key) {
                policy.name_attributes.push((attr, text));
            } else if let Some(ext) = ExtensionKind::from_name(key) {
                match ext.ssh_section() {
                    Some(SshSection::CriticalOption) => policy.forced_options.insert_raw(ext, &text),
                    _ => policy.forced_extensions.insert_raw(ext, &text),
                }
            } else {
                return Err(format!("unknown field {key:?}"));
            }
        }

        policy.allowed_principals = self.allowed_principals;
        policy.default_principals = self.default_principals;
        policy.principals = match (self.all_principals, self.principals) {
            (true, _) => Principals::All,
            (false, Some(names)) => Principals::List(names),
            (false, None) => Principals::Unspecified,
        };
        policy.subject = self.subject;

        policy.ttl = self
            .ttl
            .map(HumanDuration::as_secs)
            .or_else(|| self.days_valid.map(|d| d * 86_400));
        policy.max_ttl = self.max_ttl.map(HumanDuration::as_secs);
        policy.requester_matcher = self.requester_matcher;

        policy.overrides = PolicyOverrides {
            signing_private_key: self.signing_private_key.as_deref().map(material),
            signing_private_key_passphrase: self.signing_private_key_passphrase,
            signing_cert: self.signing_cert.as_deref().map(material),
            signing_public_key: self.signing_public_key.as_deref().map(material),
            cert_type: self.cert_type,
            key_id: self.key_id,
            digest: self.digest,
            serial_number: self.serial_number,
            not_before: self.not_before,
            not_after: self.not_after,
            copypath: self.copypath,
            prepend_cn: self.prepend_cn,
        };
        Ok(policy)
    }
}
