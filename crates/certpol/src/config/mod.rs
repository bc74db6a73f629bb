//! Node configuration for certpol.
//!
//! ```toml
//! node_overrides = "/etc/certpol/node.toml"
//!
//! [peer]
//! identity = "web1"
//! timeout_secs = 30
//!
//! [renewal]
//! x509_remaining = "7d"
//! ssh_user_remaining = "1h"
//! ssh_host_remaining = "7d"
//!
//! [issuance]
//! x509_ttl = "30d"
//! ssh_ttl = "30d"
//!
//! [x509_signing_policies.www]
//! signing_private_key = "/etc/pki/ca.key"
//! ```

mod duration;
mod policy;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use certpol_core::{CertificateKind, Digest, Error, Result, SigningPolicy, SshCertType};
use serde::{Deserialize, Serialize};

pub use duration::HumanDuration;
pub use policy::{material, PolicyEntry};

/// Configuration for a certpol node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node-local policy file, consulted before the policies below
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_overrides: Option<PathBuf>,

    /// Remote signing settings
    #[serde(default)]
    pub peer: PeerConfig,

    /// When existing certificates are renewed
    #[serde(default)]
    pub renewal: RenewalConfig,

    /// Defaults for locally issued certificates
    #[serde(default)]
    pub issuance: IssuanceConfig,

    /// Policy tables, as read from the file
    #[serde(flatten)]
    pub policies: PolicyTables,
}

/// The two policy tables a config or override file carries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTables {
    #[serde(default, skip_serializing)]
    pub x509_signing_policies: BTreeMap<String, PolicyEntry>,
    #[serde(default, skip_serializing)]
    pub ssh_signing_policies: BTreeMap<String, PolicyEntry>,
}

/// Peer protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Verified identity of this node when it acts as a requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// How long to wait for a CA peer (default: 30s)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Remaining validity below which certificates are renewed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    #[serde(default = "default_x509_remaining")]
    pub x509_remaining: HumanDuration,
    #[serde(default = "default_ssh_user_remaining")]
    pub ssh_user_remaining: HumanDuration,
    #[serde(default = "default_ssh_host_remaining")]
    pub ssh_host_remaining: HumanDuration,
    /// Time left before a CRL's next update
    #[serde(default = "default_crl_remaining")]
    pub crl_remaining: HumanDuration,
}

/// Issuance defaults applied after policy merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    /// Validity when neither policy nor request sets one
    #[serde(default = "default_ttl")]
    pub x509_ttl: HumanDuration,
    #[serde(default = "default_ttl")]
    pub ssh_ttl: HumanDuration,
    /// Time from a CRL's this update to its next update
    #[serde(default = "default_crl_ttl")]
    pub crl_ttl: HumanDuration,
    /// Signature digest, the signing key's natural digest when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            identity: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            x509_remaining: default_x509_remaining(),
            ssh_user_remaining: default_ssh_user_remaining(),
            ssh_host_remaining: default_ssh_host_remaining(),
            crl_remaining: default_crl_remaining(),
        }
    }
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            x509_ttl: default_ttl(),
            ssh_ttl: default_ttl(),
            crl_ttl: default_crl_ttl(),
            digest: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from TOML text. Every policy is validated eagerly.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.policies.validate()?;
        Ok(config)
    }

    /// Node override policies, if configured and present
    pub fn load_node_overrides(&self) -> Result<Option<PolicyTables>> {
        let Some(path) = &self.node_overrides else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let tables: PolicyTables =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        tables.validate()?;
        Ok(Some(tables))
    }

    /// Renewal threshold for a certificate family
    #[must_use]
    pub fn renewal_threshold(
        &self,
        kind: CertificateKind,
        cert_type: Option<SshCertType>,
    ) -> chrono::Duration {
        match (kind, cert_type.unwrap_or_default()) {
            (CertificateKind::X509, _) => self.renewal.x509_remaining,
            (CertificateKind::Ssh, SshCertType::User) => self.renewal.ssh_user_remaining,
            (CertificateKind::Ssh, SshCertType::Host) => self.renewal.ssh_host_remaining,
        }
        .to_chrono()
    }

    /// Fallback validity for a certificate family
    #[must_use]
    pub const fn default_ttl(&self, kind: CertificateKind) -> HumanDuration {
        match kind {
            CertificateKind::X509 => self.issuance.x509_ttl,
            CertificateKind::Ssh => self.issuance.ssh_ttl,
        }
    }
}

impl PolicyTables {
    fn table(&self, kind: CertificateKind) -> &BTreeMap<String, PolicyEntry> {
        match kind {
            CertificateKind::X509 => &self.x509_signing_policies,
            CertificateKind::Ssh => &self.ssh_signing_policies,
        }
    }

    /// Resolve one named policy
    pub fn get(&self, kind: CertificateKind, name: &str) -> Result<Option<SigningPolicy>> {
        self.table(kind)
            .get(name)
            .map(|entry| entry.to_policy(kind, name))
            .transpose()
    }

    /// Names of every configured policy of a kind
    pub fn names(&self, kind: CertificateKind) -> impl Iterator<Item = &str> {
        self.table(kind).keys().map(String::as_str)
    }

    fn validate(&self) -> Result<()> {
        for kind in [CertificateKind::X509, CertificateKind::Ssh] {
            for (name, entry) in self.table(kind) {
                entry.to_policy(kind, name)?;
            }
        }
        Ok(())
    }
}

// Default value functions for serde.
const fn default_timeout() -> u64 {
    30
}

const fn default_x509_remaining() -> HumanDuration {
    HumanDuration::from_secs(7 * 86_400)
}

const fn default_ssh_user_remaining() -> HumanDuration {
    HumanDuration::from_secs(3_600)
}

const fn default_ssh_host_remaining() -> HumanDuration {
    HumanDuration::from_secs(7 * 86_400)
}

const fn default_ttl() -> HumanDuration {
    HumanDuration::from_secs(30 * 86_400)
}

const fn default_crl_remaining() -> HumanDuration {
    HumanDuration::from_secs(3 * 86_400)
}

const fn default_crl_ttl() -> HumanDuration {
    HumanDuration::from_secs(7 * 86_400)
}
