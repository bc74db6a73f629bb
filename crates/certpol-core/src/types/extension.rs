//! Extension and critical-option vocabulary.
//!
//! Every extension or option that reaches the engines is named by an
//! [`ExtensionKind`]. Alias and long-form names are resolved at the
//! boundary (config parsing, certificate parsing) and never appear in an
//! [`ExtensionSet`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{AttributeValue, CertificateKind};

/// Closed set of extensions and options the engines understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionKind {
    // X.509 v3 extensions
    BasicConstraints,
    KeyUsage,
    ExtendedKeyUsage,
    SubjectKeyIdentifier,
    AuthorityKeyIdentifier,
    IssuerAltName,
    AuthorityInfoAccess,
    SubjectAltName,
    CrlDistributionPoints,
    CertificatePolicies,
    PolicyConstraints,
    InhibitAnyPolicy,
    NameConstraints,
    NoCheck,
    TlsFeature,
    NsComment,
    NsCertType,

    // OpenSSH critical options
    ForceCommand,
    SourceAddress,
    VerifyRequired,

    // OpenSSH extensions
    NoTouchRequired,
    PermitX11Forwarding,
    PermitAgentForwarding,
    PermitPortForwarding,
    PermitPty,
    PermitUserRc,
}

/// Where an OpenSSH attribute lives in the certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshSection {
    /// `critical options` field
    CriticalOption,
    /// `extensions` field
    Extension,
}

impl ExtensionKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 26] = [
        Self::BasicConstraints,
        Self::KeyUsage,
        Self::ExtendedKeyUsage,
        Self::SubjectKeyIdentifier,
        Self::AuthorityKeyIdentifier,
        Self::IssuerAltName,
        Self::AuthorityInfoAccess,
        Self::SubjectAltName,
        Self::CrlDistributionPoints,
        Self::CertificatePolicies,
        Self::PolicyConstraints,
        Self::InhibitAnyPolicy,
        Self::NameConstraints,
        Self::NoCheck,
        Self::TlsFeature,
        Self::NsComment,
        Self::NsCertType,
        Self::ForceCommand,
        Self::SourceAddress,
        Self::VerifyRequired,
        Self::NoTouchRequired,
        Self::PermitX11Forwarding,
        Self::PermitAgentForwarding,
        Self::PermitPortForwarding,
        Self::PermitPty,
        Self::PermitUserRc,
    ];

    /// Canonical name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BasicConstraints => "basicConstraints",
            Self::KeyUsage => "keyUsage",
            Self::ExtendedKeyUsage => "extendedKeyUsage",
            Self::SubjectKeyIdentifier => "subjectKeyIdentifier",
            Self::AuthorityKeyIdentifier => "authorityKeyIdentifier",
            Self::IssuerAltName => "issuerAltName",
            Self::AuthorityInfoAccess => "authorityInfoAccess",
            Self::SubjectAltName => "subjectAltName",
            Self::CrlDistributionPoints => "crlDistributionPoints",
            Self::CertificatePolicies => "certificatePolicies",
            Self::PolicyConstraints => "policyConstraints",
            Self::InhibitAnyPolicy => "inhibitAnyPolicy",
            Self::NameConstraints => "nameConstraints",
            Self::NoCheck => "noCheck",
            Self::TlsFeature => "tlsfeature",
            Self::NsComment => "nsComment",
            Self::NsCertType => "nsCertType",
            Self::ForceCommand => "force-command",
            Self::SourceAddress => "source-address",
            Self::VerifyRequired => "verify-required",
            Self::NoTouchRequired => "no-touch-required",
            Self::PermitX11Forwarding => "permit-X11-forwarding",
            Self::PermitAgentForwarding => "permit-agent-forwarding",
            Self::PermitPortForwarding => "permit-port-forwarding",
            Self::PermitPty => "permit-pty",
            Self::PermitUserRc => "permit-user-rc",
        }
    }

    /// Look up a kind by canonical name. Only canonical names are accepted.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Certificate kind this name belongs to
    #[must_use]
    pub const fn certificate_kind(self) -> CertificateKind {
        match self.ssh_section() {
            Some(_) => CertificateKind::Ssh,
            None => CertificateKind::X509,
        }
    }

    /// OpenSSH section, `None` for X.509 extensions
    #[must_use]
    pub const fn ssh_section(self) -> Option<SshSection> {
        match self {
            Self::ForceCommand | Self::SourceAddress | Self::VerifyRequired => {
                Some(SshSection::CriticalOption)
            }
            Self::NoTouchRequired
            | Self::PermitX11Forwarding
            | Self::PermitAgentForwarding
            | Self::PermitPortForwarding
            | Self::PermitPty
            | Self::PermitUserRc => Some(SshSection::Extension),
            _ => None,
        }
    }

    /// Parse a compact config string such as `"critical,CA:true,pathlen:0"`.
    ///
    /// X.509 values split on commas and a leading `critical` token sets the
    /// flag. OpenSSH values are kept whole (a forced command may contain
    /// commas); an empty value or `true` means the flag is simply present.
    #[must_use]
    pub fn parse_value(self, raw: &str) -> ExtensionValue {
        match self.ssh_section() {
            Some(section) => {
                let raw = raw.trim();
                let value = if raw.is_empty() || raw.eq_ignore_ascii_case("true") {
                    AttributeValue::Present
                } else {
                    AttributeValue::Text(raw.to_string())
                };
                ExtensionValue {
                    critical: section == SshSection::CriticalOption,
                    value,
                }
            }
            None => {
                let mut tokens: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect();
                let critical = tokens.first().is_some_and(|t| t == "critical");
                if critical {
                    tokens.remove(0);
                }
                ExtensionValue {
                    critical,
                    value: AttributeValue::from_tokens(tokens),
                }
            }
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for ExtensionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ExtensionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown extension or option {name:?}")))
    }
}

/// Criticality plus value of one extension or option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionValue {
    /// Relying parties must understand this extension
    pub critical: bool,
    /// Payload
    pub value: AttributeValue,
}

impl ExtensionValue {
    /// Non-critical value
    #[must_use]
    pub const fn new(value: AttributeValue) -> Self {
        Self {
            critical: false,
            value,
        }
    }

    /// Critical value
    #[must_use]
    pub const fn critical(value: AttributeValue) -> Self {
        Self {
            critical: true,
            value,
        }
    }
}

/// Ordered map of canonical extension name to value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionSet(BTreeMap<ExtensionKind, ExtensionValue>);

impl ExtensionSet {
    /// Empty set
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, kind: ExtensionKind, value: ExtensionValue) -> Option<ExtensionValue> {
        self.0.insert(kind, value)
    }

    /// Parse `raw` with [`ExtensionKind::parse_value`] and insert it
    pub fn insert_raw(&mut self, kind: ExtensionKind, raw: &str) {
        self.0.insert(kind, kind.parse_value(raw));
    }

    /// Builder-style [`ExtensionSet::insert_raw`]
    #[must_use]
    pub fn with(mut self, kind: ExtensionKind, raw: &str) -> Self {
        self.insert_raw(kind, raw);
        self
    }

    #[must_use]
    pub fn get(&self, kind: ExtensionKind) -> Option<&ExtensionValue> {
        self.0.get(&kind)
    }

    #[must_use]
    pub fn contains(&self, kind: ExtensionKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn remove(&mut self, kind: ExtensionKind) -> Option<ExtensionValue> {
        self.0.remove(&kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExtensionKind, &ExtensionValue)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    /// Entry names in canonical order
    pub fn kinds(&self) -> impl Iterator<Item = ExtensionKind> + '_ {
        self.0.keys().copied()
    }

    /// Copy every entry of `other` over this set
    pub fn overlay(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(*k, v.clone());
        }
    }

    /// Keep only the entries `f` accepts
    pub fn retain(&mut self, mut f: impl FnMut(ExtensionKind, &ExtensionValue) -> bool) {
        self.0.retain(|k, v| f(*k, v));
    }
}

impl FromIterator<(ExtensionKind, ExtensionValue)> for ExtensionSet {
    fn from_iter<I: IntoIterator<Item = (ExtensionKind, ExtensionValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ExtensionSet {
    type Item = (&'a ExtensionKind, &'a ExtensionValue);
    type IntoIter = std::collections::btree_map::Iter<'a, ExtensionKind, ExtensionValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Allow-list of extension or option names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Allowed {
    /// `*`: no restriction
    #[default]
    Any,
    /// Only these names
    Only(BTreeSet<ExtensionKind>),
}

impl Allowed {
    /// Whether `kind` passes this allow-list
    #[must_use]
    pub fn permits(&self, kind: ExtensionKind) -> bool {
        match self {
            Self::Any => true,
            Self::Only(names) => names.contains(&kind),
        }
    }
}

impl FromIterator<ExtensionKind> for Allowed {
    fn from_iter<I: IntoIterator<Item = ExtensionKind>>(iter: I) -> Self {
        Self::Only(iter.into_iter().collect())
    }
}

impl Serialize for Allowed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Any => vec!["*"].serialize(serializer),
            Self::Only(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Allowed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        if names.iter().any(|n| n == "*") {
            return Ok(Self::Any);
        }
        names
            .iter()
            .map(|n| {
                ExtensionKind::from_name(n).ok_or_else(|| {
                    serde::de::Error::custom(format!("unknown extension or option {n:?}"))
                })
            })
            .collect()
    }
}
