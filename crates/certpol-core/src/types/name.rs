//! Distinguished names and the subject shapes a request or policy may use.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name attribute types accepted in subjects
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NameAttribute {
    C,
    ST,
    L,
    STREET,
    O,
    OU,
    CN,
    MAIL,
    SN,
    GN,
    UID,
    SERIALNUMBER,
}

impl NameAttribute {
    pub const ALL: [Self; 12] = [
        Self::C,
        Self::ST,
        Self::L,
        Self::STREET,
        Self::O,
        Self::OU,
        Self::CN,
        Self::MAIL,
        Self::SN,
        Self::GN,
        Self::UID,
        Self::SERIALNUMBER,
    ];

    /// Short name as written in `CN=...` strings
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::C => "C",
            Self::ST => "ST",
            Self::L => "L",
            Self::STREET => "STREET",
            Self::O => "O",
            Self::OU => "OU",
            Self::CN => "CN",
            Self::MAIL => "MAIL",
            Self::SN => "SN",
            Self::GN => "GN",
            Self::UID => "UID",
            Self::SERIALNUMBER => "SERIALNUMBER",
        }
    }

    /// Dotted OID of the attribute type
    #[must_use]
    pub const fn oid(self) -> &'static str {
        match self {
            Self::C => "2.5.4.6",
            Self::ST => "2.5.4.8",
            Self::L => "2.5.4.7",
            Self::STREET => "2.5.4.9",
            Self::O => "2.5.4.10",
            Self::OU => "2.5.4.11",
            Self::CN => "2.5.4.3",
            Self::MAIL => "1.2.840.113549.1.9.1",
            Self::SN => "2.5.4.4",
            Self::GN => "2.5.4.42",
            Self::UID => "0.9.2342.19200300.100.1.1",
            Self::SERIALNUMBER => "2.5.4.5",
        }
    }

    /// Case-insensitive lookup by short name
    #[must_use]
    pub fn from_short_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.short_name().eq_ignore_ascii_case(name.trim()))
    }

    #[must_use]
    pub fn from_oid(oid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.oid() == oid)
    }
}

impl fmt::Display for NameAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Ordered list of name attributes.
///
/// Each attribute type appears at most once: pushing an attribute that is
/// already present replaces its value but keeps its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinguishedName(Vec<(NameAttribute, String)>);

impl DistinguishedName {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, attr: NameAttribute, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(a, _)| *a == attr) {
            Some(entry) => entry.1 = value,
            None => self.0.push((attr, value)),
        }
    }

    #[must_use]
    pub fn get(&self, attr: NameAttribute) -> Option<&str> {
        self.0
            .iter()
            .find(|(a, _)| *a == attr)
            .map(|(_, v)| v.as_str())
    }

    /// Common name, if any
    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.get(NameAttribute::CN)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NameAttribute, &str)> {
        self.0.iter().map(|(a, v)| (*a, v.as_str()))
    }

    /// Parse `CN=host,O=Org`. Commas inside values are escaped as `\,`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut dn = Self::new();
        for rdn in split_unescaped(s) {
            if rdn.trim().is_empty() {
                continue;
            }
            dn.push_rdn(&rdn)?;
        }
        Ok(dn)
    }

    fn push_rdn(&mut self, rdn: &str) -> Result<(), String> {
        let (attr, value) = rdn
            .split_once('=')
            .ok_or_else(|| format!("{rdn:?} is not of the form ATTR=value"))?;
        let attr = NameAttribute::from_short_name(attr)
            .ok_or_else(|| format!("unknown name attribute {:?}", attr.trim()))?;
        self.push(attr, value.trim());
        Ok(())
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (attr, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{attr}={}", value.replace(',', "\\,"))?;
        }
        Ok(())
    }
}

impl FromIterator<(NameAttribute, String)> for DistinguishedName {
    fn from_iter<I: IntoIterator<Item = (NameAttribute, String)>>(iter: I) -> Self {
        let mut dn = Self::new();
        for (a, v) in iter {
            dn.push(a, v);
        }
        dn
    }
}

/// Subject as written in a request or policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubjectSpec {
    /// `"CN=host,O=Org"`
    Text(String),
    /// `["CN=host", "O=Org"]`
    List(Vec<String>),
    /// `{CN = "host", O = "Org"}`
    Map(BTreeMap<String, String>),
}

impl SubjectSpec {
    /// Resolve into a distinguished name.
    ///
    /// Map entries are ordered by attribute type, not by key spelling.
    pub fn to_dn(&self) -> Result<DistinguishedName, String> {
        match self {
            Self::Text(s) => DistinguishedName::parse(s),
            Self::List(items) => {
                let mut dn = DistinguishedName::new();
                for item in items {
                    dn.push_rdn(item)?;
                }
                Ok(dn)
            }
            Self::Map(map) => {
                let mut entries = map
                    .iter()
                    .map(|(k, v)| {
                        NameAttribute::from_short_name(k)
                            .map(|a| (a, v.clone()))
                            .ok_or_else(|| format!("unknown name attribute {k:?}"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                entries.sort_by_key(|(a, _)| *a);
                Ok(entries.into_iter().collect())
            }
        }
    }
}

fn split_unescaped(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}
