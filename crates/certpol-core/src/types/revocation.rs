//! Certificate revocation list entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Material, SerialNumber};

/// CRLReason values (RFC 5280 section 5.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevocationReason {
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "keyCompromise")]
    KeyCompromise,
    #[serde(rename = "CACompromise")]
    CaCompromise,
    #[serde(rename = "affiliationChanged")]
    AffiliationChanged,
    #[serde(rename = "superseded")]
    Superseded,
    #[serde(rename = "cessationOfOperation")]
    CessationOfOperation,
    #[serde(rename = "certificateHold")]
    CertificateHold,
    #[serde(rename = "removeFromCRL")]
    RemoveFromCrl,
    #[serde(rename = "privilegeWithdrawn")]
    PrivilegeWithdrawn,
    #[serde(rename = "aACompromise")]
    AaCompromise,
}

impl RevocationReason {
    /// Every reason, in code order
    pub const ALL: [Self; 10] = [
        Self::Unspecified,
        Self::KeyCompromise,
        Self::CaCompromise,
        Self::AffiliationChanged,
        Self::Superseded,
        Self::CessationOfOperation,
        Self::CertificateHold,
        Self::RemoveFromCrl,
        Self::PrivilegeWithdrawn,
        Self::AaCompromise,
    ];

    /// Wire code. 7 is unused.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "keyCompromise",
            Self::CaCompromise => "CACompromise",
            Self::AffiliationChanged => "affiliationChanged",
            Self::Superseded => "superseded",
            Self::CessationOfOperation => "cessationOfOperation",
            Self::CertificateHold => "certificateHold",
            Self::RemoveFromCrl => "removeFromCRL",
            Self::PrivilegeWithdrawn => "privilegeWithdrawn",
            Self::AaCompromise => "aACompromise",
        })
    }
}

/// A certificate to revoke, as requested.
///
/// Names either `serial_number` or `certificate`. The orchestrator turns
/// these into [`Revocation`]s before a CRL draft is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RevokedCertificate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<SerialNumber>,
    /// Certificate to take the serial number and expiry from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Material>,
    /// Defaults to the time the CRL is built
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_date: Option<DateTime<Utc>>,
    /// Expiry of the revoked certificate, when only the serial is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RevocationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidity_date: Option<DateTime<Utc>>,
}

impl RevokedCertificate {
    /// Entry for a bare serial number
    #[must_use]
    pub fn serial(serial_number: impl Into<SerialNumber>) -> Self {
        Self {
            serial_number: Some(serial_number.into()),
            ..Self::default()
        }
    }
}

/// One entry of a built or parsed CRL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub serial_number: SerialNumber,
    pub revocation_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RevocationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidity_date: Option<DateTime<Utc>>,
}

impl Revocation {
    /// Same entry apart from the revocation date
    #[must_use]
    pub fn same_entry(&self, other: &Self) -> bool {
        self.serial_number == other.serial_number
            && self.reason == other.reason
            && self.invalidity_date == other.invalidity_date
    }
}

/// Serials gained, changed and dropped between two CRLs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationsDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl RevocationsDiff {
    /// Compare entries by serial number. Revocation dates are ignored.
    #[must_use]
    pub fn between(have: &[Revocation], want: &[Revocation]) -> Option<Self> {
        let mut diff = Self::default();
        for entry in want {
            match have.iter().find(|h| h.serial_number == entry.serial_number) {
                None => diff.added.push(entry.serial_number.to_string()),
                Some(current) if !current.same_entry(entry) => {
                    diff.changed.push(entry.serial_number.to_string());
                }
                Some(_) => {}
            }
        }
        diff.removed = have
            .iter()
            .filter(|h| !want.iter().any(|w| w.serial_number == h.serial_number))
            .map(|h| h.serial_number.to_string())
            .collect();
        (!diff.added.is_empty() || !diff.changed.is_empty() || !diff.removed.is_empty())
            .then_some(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(serial: u64, reason: Option<RevocationReason>) -> Revocation {
        Revocation {
            serial_number: serial.into(),
            revocation_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            reason,
            invalidity_date: None,
        }
    }

    #[test]
    fn test_reason_codes() {
        for reason in RevocationReason::ALL {
            assert_eq!(RevocationReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(RevocationReason::from_code(7), None);
        let parsed: RevocationReason = serde_json::from_str("\"CACompromise\"").unwrap();
        assert_eq!(parsed, RevocationReason::CaCompromise);
        assert_eq!(parsed.to_string(), "CACompromise");
    }

    #[test]
    fn test_diff_ignores_revocation_date() {
        let have = vec![entry(1, None), entry(2, Some(RevocationReason::Superseded))];
        let mut moved = have.clone();
        moved[0].revocation_date = Utc::now();
        assert_eq!(RevocationsDiff::between(&have, &moved), None);

        let want = vec![entry(2, Some(RevocationReason::KeyCompromise)), entry(3, None)];
        let diff = RevocationsDiff::between(&have, &want).unwrap();
        assert_eq!(diff.added, vec!["03".to_string()]);
        assert_eq!(diff.changed, vec!["02".to_string()]);
        assert_eq!(diff.removed, vec!["01".to_string()]);
    }

    #[test]
    fn test_requested_entry_shape() {
        let parsed: RevokedCertificate = serde_json::from_value(serde_json::json!({
            "serial_number": "d6:d2",
            "reason": "cessationOfOperation",
        }))
        .unwrap();
        assert_eq!(parsed.serial_number, Some(SerialNumber::from(0xd6d2)));
        assert!(serde_json::from_value::<RevokedCertificate>(serde_json::json!({"bogus": 1})).is_err());
    }
}
