//! X.509 extensions: request values into rcgen parameters, parsed
//! certificates back into canonical [`ExtensionValue`]s.
//!
//! Drafts are rendered through rcgen and parsed back (see
//! `X509Backend::build_draft`), so only the parsing direction defines the
//! canonical form. Whatever spelling a request uses, the draft and the
//! signed certificate end up with identical extension sets.

use std::collections::BTreeMap;
use std::net::IpAddr;

use certpol_core::{
    AttributeValue, BackendError, BackendResult, ExtensionKind, ExtensionSet, ExtensionValue,
};
use rcgen::{
    BasicConstraints, CertificateParams, CidrSubnet, CrlDistributionPoint, CustomExtension,
    ExtendedKeyUsagePurpose, GeneralSubtree, IsCa, KeyUsagePurpose, NameConstraints, SanType,
};
use x509_parser::extensions::{
    DistributionPointName, GeneralName, ParsedExtension, X509Extension,
};

use super::keys::SubjectKey;

const OID_SUBJECT_KEY_IDENTIFIER: &[u64] = &[2, 5, 29, 14];
const OID_NO_CHECK: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 5];
const OID_NS_COMMENT: &[u64] = &[2, 16, 840, 1, 113_730, 1, 13];

/// Dotted OID of each X.509 extension kind
const fn oid(kind: ExtensionKind) -> Option<&'static str> {
    Some(match kind {
        ExtensionKind::BasicConstraints => "2.5.29.19",
        ExtensionKind::KeyUsage => "2.5.29.15",
        ExtensionKind::ExtendedKeyUsage => "2.5.29.37",
        ExtensionKind::SubjectKeyIdentifier => "2.5.29.14",
        ExtensionKind::AuthorityKeyIdentifier => "2.5.29.35",
        ExtensionKind::IssuerAltName => "2.5.29.18",
        ExtensionKind::AuthorityInfoAccess => "1.3.6.1.5.5.7.1.1",
        ExtensionKind::SubjectAltName => "2.5.29.17",
        ExtensionKind::CrlDistributionPoints => "2.5.29.31",
        ExtensionKind::CertificatePolicies => "2.5.29.32",
        ExtensionKind::PolicyConstraints => "2.5.29.36",
        ExtensionKind::InhibitAnyPolicy => "2.5.29.54",
        ExtensionKind::NameConstraints => "2.5.29.30",
        ExtensionKind::NoCheck => "1.3.6.1.5.5.7.48.1.5",
        ExtensionKind::TlsFeature => "1.3.6.1.5.5.7.1.24",
        ExtensionKind::NsComment => "2.16.840.1.113730.1.13",
        ExtensionKind::NsCertType => "2.16.840.1.113730.1.1",
        _ => return None,
    })
}

fn kind_for_oid(dotted: &str) -> Option<ExtensionKind> {
    ExtensionKind::ALL
        .into_iter()
        .find(|k| oid(*k) == Some(dotted))
}

const KEY_USAGES: [(&str, KeyUsagePurpose); 9] = [
    ("digitalSignature", KeyUsagePurpose::DigitalSignature),
    ("nonRepudiation", KeyUsagePurpose::ContentCommitment),
    ("keyEncipherment", KeyUsagePurpose::KeyEncipherment),
    ("dataEncipherment", KeyUsagePurpose::DataEncipherment),
    ("keyAgreement", KeyUsagePurpose::KeyAgreement),
    ("keyCertSign", KeyUsagePurpose::KeyCertSign),
    ("cRLSign", KeyUsagePurpose::CrlSign),
    ("encipherOnly", KeyUsagePurpose::EncipherOnly),
    ("decipherOnly", KeyUsagePurpose::DecipherOnly),
];

const EXTENDED_KEY_USAGES: [(&str, ExtendedKeyUsagePurpose); 7] = [
    ("serverAuth", ExtendedKeyUsagePurpose::ServerAuth),
    ("clientAuth", ExtendedKeyUsagePurpose::ClientAuth),
    ("codeSigning", ExtendedKeyUsagePurpose::CodeSigning),
    ("emailProtection", ExtendedKeyUsagePurpose::EmailProtection),
    ("timeStamping", ExtendedKeyUsagePurpose::TimeStamping),
    ("OCSPSigning", ExtendedKeyUsagePurpose::OcspSigning),
    ("anyExtendedKeyUsage", ExtendedKeyUsagePurpose::Any),
];

// ---------------------------------------------------------------------------
// Request -> rcgen
// ---------------------------------------------------------------------------

/// Apply requested extensions to `params`.
pub fn apply(
    params: &mut CertificateParams,
    extensions: &ExtensionSet,
    subject: &SubjectKey,
) -> BackendResult<()> {
    let mut subject_key_identifier = false;
    for (kind, value) in extensions.iter() {
        let tokens = tokens(kind, value)?;
        match kind {
            ExtensionKind::BasicConstraints => params.is_ca = basic_constraints(&tokens)?,
            ExtensionKind::KeyUsage => {
                params.key_usages = tokens
                    .iter()
                    .map(|t| lookup(kind, &KEY_USAGES, t))
                    .collect::<BackendResult<_>>()?;
            }
            ExtensionKind::ExtendedKeyUsage => {
                params.extended_key_usages = tokens
                    .iter()
                    .map(|t| extended_key_usage(t))
                    .collect::<BackendResult<_>>()?;
            }
            ExtensionKind::SubjectKeyIdentifier => subject_key_identifier = true,
            ExtensionKind::AuthorityKeyIdentifier => {
                params.use_authority_key_identifier_extension = true;
            }
            ExtensionKind::SubjectAltName => {
                params.subject_alt_names = tokens
                    .iter()
                    .map(|t| san(t))
                    .collect::<BackendResult<_>>()?;
            }
            ExtensionKind::CrlDistributionPoints => {
                params.crl_distribution_points = tokens
                    .iter()
                    .map(|t| {
                        let uri = t.strip_prefix("URI:").ok_or_else(|| {
                            BackendError::invalid(kind.name(), format!("expected URI:<uri>, got {t:?}"))
                        })?;
                        Ok(CrlDistributionPoint {
                            uris: vec![uri.to_string()],
                        })
                    })
                    .collect::<BackendResult<_>>()?;
            }
            ExtensionKind::NameConstraints => {
                params.name_constraints = Some(name_constraints(&tokens)?);
            }
            ExtensionKind::NoCheck => params
                .custom_extensions
                .push(CustomExtension::from_oid_content(OID_NO_CHECK, vec![0x05, 0x00])),
            ExtensionKind::NsComment => {
                let comment = tokens.join(",");
                if !comment.is_ascii() {
                    return Err(BackendError::invalid(kind.name(), "comment must be ASCII"));
                }
                params.custom_extensions.push(CustomExtension::from_oid_content(
                    OID_NS_COMMENT,
                    yasna::construct_der(|w| w.write_ia5_string(&comment)),
                ));
            }
            other => {
                return Err(BackendError::invalid(
                    other.name(),
                    "extension is not supported by the X.509 backend",
                ))
            }
        }
    }

    // rcgen writes the identifier itself alongside basicConstraints
    if subject_key_identifier && matches!(params.is_ca, IsCa::NoCa) {
        params.custom_extensions.push(CustomExtension::from_oid_content(
            OID_SUBJECT_KEY_IDENTIFIER,
            yasna::construct_der(|w| w.write_bytes(&subject.key_identifier())),
        ));
    }
    Ok(())
}

fn tokens(kind: ExtensionKind, value: &ExtensionValue) -> BackendResult<Vec<String>> {
    if kind.ssh_section().is_some() {
        return Err(BackendError::invalid(
            kind.name(),
            "OpenSSH option in an X.509 request",
        ));
    }
    value
        .value
        .tokens()
        .ok_or_else(|| BackendError::invalid(kind.name(), "value must be text or a list of text"))
}

fn lookup<T: Clone>(kind: ExtensionKind, table: &[(&str, T)], token: &str) -> BackendResult<T> {
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(token))
        .map(|(_, v)| v.clone())
        .ok_or_else(|| BackendError::invalid(kind.name(), format!("unknown value {token:?}")))
}

fn basic_constraints(tokens: &[String]) -> BackendResult<IsCa> {
    let field = ExtensionKind::BasicConstraints.name();
    let mut ca = None;
    let mut path_len = None;
    for token in tokens {
        let (key, value) = token
            .split_once(':')
            .ok_or_else(|| BackendError::invalid(field, format!("expected key:value, got {token:?}")))?;
        match key.trim().to_ascii_lowercase().as_str() {
            "ca" => ca = Some(value.trim().eq_ignore_ascii_case("true")),
            "pathlen" => {
                path_len = Some(value.trim().parse::<u8>().map_err(|_| {
                    BackendError::invalid(field, format!("invalid pathlen {value:?}"))
                })?);
            }
            _ => return Err(BackendError::invalid(field, format!("unknown key {key:?}"))),
        }
    }
    match (ca, path_len) {
        (Some(true), None) => Ok(IsCa::Ca(BasicConstraints::Unconstrained)),
        (Some(true), Some(n)) => Ok(IsCa::Ca(BasicConstraints::Constrained(n))),
        (Some(false), None) => Ok(IsCa::ExplicitNoCa),
        (Some(false), Some(_)) => Err(BackendError::invalid(field, "pathlen requires CA:TRUE")),
        (None, _) => Err(BackendError::invalid(field, "CA:TRUE or CA:FALSE is required")),
    }
}

fn extended_key_usage(token: &str) -> BackendResult<ExtendedKeyUsagePurpose> {
    if token.contains('.') {
        let arcs = token
            .split('.')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                BackendError::invalid(
                    ExtensionKind::ExtendedKeyUsage.name(),
                    format!("invalid OID {token:?}"),
                )
            })?;
        return Ok(ExtendedKeyUsagePurpose::Other(arcs));
    }
    lookup(ExtensionKind::ExtendedKeyUsage, &EXTENDED_KEY_USAGES, token)
}

fn ia5(field: &str, value: &str) -> BackendResult<rcgen::string::Ia5String> {
    rcgen::string::Ia5String::try_from(value.to_string())
        .map_err(|_| BackendError::invalid(field, format!("{value:?} is not IA5 text")))
}

fn san(token: &str) -> BackendResult<SanType> {
    let field = ExtensionKind::SubjectAltName.name();
    let (prefix, value) = token
        .split_once(':')
        .ok_or_else(|| BackendError::invalid(field, format!("expected TYPE:value, got {token:?}")))?;
    match prefix.to_ascii_lowercase().as_str() {
        "dns" => Ok(SanType::DnsName(ia5(field, value)?)),
        "email" => Ok(SanType::Rfc822Name(ia5(field, value)?)),
        "uri" => Ok(SanType::URI(ia5(field, value)?)),
        "ip" | "ip address" => value
            .parse::<IpAddr>()
            .map(SanType::IpAddress)
            .map_err(|_| BackendError::invalid(field, format!("invalid IP address {value:?}"))),
        _ => Err(BackendError::invalid(
            field,
            format!("unsupported name type {prefix:?}"),
        )),
    }
}

/// `permitted;DNS:example.com`, `excluded;IP:10.0.0.0/8`
fn name_constraints(tokens: &[String]) -> BackendResult<NameConstraints> {
    let field = ExtensionKind::NameConstraints.name();
    let mut constraints = NameConstraints {
        permitted_subtrees: Vec::new(),
        excluded_subtrees: Vec::new(),
    };
    for token in tokens {
        let (which, name) = token.split_once(';').ok_or_else(|| {
            BackendError::invalid(field, format!("expected permitted;... or excluded;..., got {token:?}"))
        })?;
        let (prefix, value) = name
            .split_once(':')
            .ok_or_else(|| BackendError::invalid(field, format!("expected TYPE:value, got {name:?}")))?;
        let subtree = match prefix.to_ascii_lowercase().as_str() {
            "dns" => GeneralSubtree::DnsName(value.to_string()),
            "email" => GeneralSubtree::Rfc822Name(value.to_string()),
            "ip" => GeneralSubtree::IpAddress(cidr(value).ok_or_else(|| {
                BackendError::invalid(field, format!("invalid CIDR {value:?}"))
            })?),
            _ => {
                return Err(BackendError::invalid(
                    field,
                    format!("unsupported name type {prefix:?}"),
                ))
            }
        };
        match which.trim() {
            "permitted" => constraints.permitted_subtrees.push(subtree),
            "excluded" => constraints.excluded_subtrees.push(subtree),
            other => return Err(BackendError::invalid(field, format!("unknown list {other:?}"))),
        }
    }
    Ok(constraints)
}

fn cidr(value: &str) -> Option<CidrSubnet> {
    let (addr, prefix) = value.split_once('/')?;
    let prefix: u8 = prefix.parse().ok()?;
    match addr.parse::<IpAddr>().ok()? {
        IpAddr::V4(a) if prefix <= 32 => Some(CidrSubnet::from_v4_prefix(a.octets(), prefix)),
        IpAddr::V6(a) if prefix <= 128 => Some(CidrSubnet::from_v6_prefix(a.octets(), prefix)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Parsed certificate -> canonical values
// ---------------------------------------------------------------------------

/// Canonical extension set of a parsed certificate. Extensions outside the
/// known vocabulary are ignored.
pub fn from_certificate<'a>(extensions: impl IntoIterator<Item = &'a X509Extension<'a>>) -> ExtensionSet {
    extensions
        .into_iter()
        .filter_map(|ext| {
            let kind = kind_for_oid(&ext.oid.to_id_string())?;
            let value = canonical(kind, ext.parsed_extension(), ext.value);
            Some((
                kind,
                ExtensionValue {
                    critical: ext.critical,
                    value,
                },
            ))
        })
        .collect()
}

/// Canonical extension set of a CSR extension request. CSRs carry no
/// criticality through the parser, so the flag rcgen writes is assumed.
pub fn from_request<'a>(
    extensions: impl IntoIterator<Item = &'a ParsedExtension<'a>>,
    subject_is_empty: bool,
) -> ExtensionSet {
    extensions
        .into_iter()
        .filter_map(|parsed| {
            let kind = match parsed {
                ParsedExtension::BasicConstraints(_) => ExtensionKind::BasicConstraints,
                ParsedExtension::KeyUsage(_) => ExtensionKind::KeyUsage,
                ParsedExtension::ExtendedKeyUsage(_) => ExtensionKind::ExtendedKeyUsage,
                ParsedExtension::SubjectKeyIdentifier(_) => ExtensionKind::SubjectKeyIdentifier,
                ParsedExtension::SubjectAlternativeName(_) => ExtensionKind::SubjectAltName,
                ParsedExtension::CRLDistributionPoints(_) => ExtensionKind::CrlDistributionPoints,
                ParsedExtension::NameConstraints(_) => ExtensionKind::NameConstraints,
                _ => return None,
            };
            let critical = match kind {
                ExtensionKind::BasicConstraints
                | ExtensionKind::KeyUsage
                | ExtensionKind::NameConstraints => true,
                ExtensionKind::SubjectAltName => subject_is_empty,
                _ => false,
            };
            Some((
                kind,
                ExtensionValue {
                    critical,
                    value: canonical(kind, parsed, &[]),
                },
            ))
        })
        .collect()
}

fn canonical(kind: ExtensionKind, parsed: &ParsedExtension<'_>, raw: &[u8]) -> AttributeValue {
    match parsed {
        ParsedExtension::BasicConstraints(bc) => {
            let mut tokens = vec![if bc.ca { "CA:TRUE" } else { "CA:FALSE" }.to_string()];
            if let Some(n) = bc.path_len_constraint {
                tokens.push(format!("pathlen:{n}"));
            }
            AttributeValue::from_tokens(tokens)
        }
        ParsedExtension::KeyUsage(ku) => {
            let bits = [
                ku.digital_signature(),
                ku.non_repudiation(),
                ku.key_encipherment(),
                ku.data_encipherment(),
                ku.key_agreement(),
                ku.key_cert_sign(),
                ku.crl_sign(),
                ku.encipher_only(),
                ku.decipher_only(),
            ];
            AttributeValue::from_tokens(
                KEY_USAGES
                    .iter()
                    .zip(bits)
                    .filter(|(_, set)| *set)
                    .map(|((name, _), _)| (*name).to_string())
                    .collect(),
            )
        }
        ParsedExtension::ExtendedKeyUsage(eku) => {
            let flags = [
                eku.server_auth,
                eku.client_auth,
                eku.code_signing,
                eku.email_protection,
                eku.time_stamping,
                eku.ocsp_signing,
                eku.any,
            ];
            let mut tokens: Vec<String> = EXTENDED_KEY_USAGES
                .iter()
                .zip(flags)
                .filter(|(_, set)| *set)
                .map(|((name, _), _)| (*name).to_string())
                .collect();
            tokens.extend(eku.other.iter().map(|oid| oid.to_id_string()));
            AttributeValue::from_tokens(tokens)
        }
        ParsedExtension::SubjectKeyIdentifier(_) | ParsedExtension::AuthorityKeyIdentifier(_) => {
            AttributeValue::Present
        }
        ParsedExtension::SubjectAlternativeName(san) => {
            AttributeValue::from_tokens(san.general_names.iter().map(general_name).collect())
        }
        ParsedExtension::CRLDistributionPoints(points) => {
            let mut tokens = Vec::new();
            for point in &points.points {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    tokens.extend(names.iter().map(general_name));
                }
            }
            AttributeValue::from_tokens(tokens)
        }
        ParsedExtension::NameConstraints(nc) => {
            let mut map = BTreeMap::new();
            for (label, subtrees) in [
                ("permitted", &nc.permitted_subtrees),
                ("excluded", &nc.excluded_subtrees),
            ] {
                if let Some(subtrees) = subtrees {
                    if !subtrees.is_empty() {
                        map.insert(
                            label.to_string(),
                            AttributeValue::from_tokens(
                                subtrees.iter().map(|s| subtree_name(&s.base)).collect(),
                            ),
                        );
                    }
                }
            }
            AttributeValue::Map(map)
        }
        _ if kind == ExtensionKind::NsComment => yasna::parse_der(raw, |r| r.read_ia5_string())
            .map_or_else(|_| AttributeValue::Bytes(raw.to_vec()), AttributeValue::Text),
        _ if kind == ExtensionKind::NoCheck => AttributeValue::Present,
        _ => AttributeValue::Bytes(raw.to_vec()),
    }
}

fn general_name(name: &GeneralName<'_>) -> String {
    match name {
        GeneralName::DNSName(s) => format!("DNS:{s}"),
        GeneralName::RFC822Name(s) => format!("email:{s}"),
        GeneralName::URI(s) => format!("URI:{s}"),
        GeneralName::IPAddress(bytes) => ip_from_bytes(bytes)
            .map_or_else(|| format!("IP:{}", hex::encode(bytes)), |ip| format!("IP:{ip}")),
        other => format!("other:{other:?}"),
    }
}

fn subtree_name(name: &GeneralName<'_>) -> String {
    match name {
        GeneralName::IPAddress(bytes) => {
            let (addr, mask) = bytes.split_at(bytes.len() / 2);
            let prefix: u32 = mask.iter().map(|b| b.count_ones()).sum();
            ip_from_bytes(addr).map_or_else(
                || format!("IP:{}", hex::encode(bytes)),
                |ip| format!("IP:{ip}/{prefix}"),
            )
        }
        other => general_name(other),
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}
