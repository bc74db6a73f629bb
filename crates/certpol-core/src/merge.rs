//! Signing policy merge engine.
//!
//! [`merge`] turns a requester's [`CertificateRequest`] into a
//! [`ResolvedRequest`] that cannot violate the policy: forced values always
//! win, requested values survive only if the policy allows them, and the
//! policy is authoritative for every field it sets outright.

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{
    Allowed, CertificateKind, CertificateRequest, ExtensionSet, Principals, ResolvedRequest,
    SigningPolicy, SubjectSpec,
};

/// Resolve `request` against `policy`.
///
/// Total over well-formed input. Neither argument is modified; the result
/// shares no state with them.
pub fn merge(policy: Option<&SigningPolicy>, request: &CertificateRequest) -> ResolvedRequest {
    let Some(policy) = policy else {
        return ResolvedRequest::unrestricted(request.clone());
    };
    let policy = policy.clone();
    let mut out = request.clone();

    out.options = merge_set(
        &policy.default_options,
        &policy.allowed_options,
        &policy.forced_options,
        &request.options,
    );
    out.extensions = merge_set(
        &policy.default_extensions,
        &policy.allowed_extensions,
        &policy.forced_extensions,
        &request.extensions,
    );

    match policy.kind {
        CertificateKind::Ssh => out.principals = resolve_principals(&policy, &request.principals),
        CertificateKind::X509 => resolve_subject(&policy, &mut out),
    }

    resolve_validity(&policy, &mut out);
    apply_overrides(policy, &mut out);

    ResolvedRequest::unrestricted(out)
}

/// Defaults, then allowed requested entries, then forced entries.
fn merge_set(
    defaults: &ExtensionSet,
    allowed: &Allowed,
    forced: &ExtensionSet,
    requested: &ExtensionSet,
) -> ExtensionSet {
    let mut out = defaults.clone();
    for (kind, value) in requested.iter() {
        if allowed.permits(kind) {
            out.insert(kind, value.clone());
        } else {
            debug!(name = %kind, "dropping entry not allowed by signing policy");
        }
    }
    out.overlay(forced);
    out
}

fn resolve_principals(policy: &SigningPolicy, requested: &Principals) -> Principals {
    if !policy.principals.is_unspecified() {
        return policy.principals.clone();
    }
    let allowed = policy.allowed_principals.as_ref();
    let defaults = policy.default_principals.as_ref();
    match requested {
        Principals::List(names) => match allowed {
            Some(allowed) => Principals::List(
                names
                    .iter()
                    .filter(|n| allowed.contains(n))
                    .cloned()
                    .collect(),
            ),
            None => Principals::List(names.clone()),
        },
        Principals::All => match (allowed, defaults) {
            (Some(allowed), _) => Principals::List(allowed.clone()),
            (None, Some(defaults)) => Principals::List(defaults.clone()),
            (None, None) => Principals::All,
        },
        Principals::Unspecified => match (defaults, allowed) {
            (Some(defaults), _) => Principals::List(defaults.clone()),
            (None, Some(allowed)) => Principals::List(allowed.clone()),
            (None, None) => Principals::Unspecified,
        },
    }
}

fn resolve_subject(policy: &SigningPolicy, out: &mut CertificateRequest) {
    if !policy.name_attributes.is_empty() {
        out.subject = None;
        for (attr, value) in &policy.name_attributes {
            match out.name_attributes.iter_mut().find(|(a, _)| a == attr) {
                Some(entry) => entry.1.clone_from(value),
                None => out.name_attributes.push((*attr, value.clone())),
            }
        }
    }

    let Some(forced) = &policy.subject else {
        return;
    };
    out.subject = Some(match out.subject.take() {
        Some(SubjectSpec::Map(requested)) => match forced {
            SubjectSpec::Map(forced) => {
                let mut merged: BTreeMap<String, String> = requested;
                merged.extend(forced.iter().map(|(k, v)| (k.clone(), v.clone())));
                SubjectSpec::Map(merged)
            }
            other => other.clone(),
        },
        Some(SubjectSpec::List(mut requested)) => match forced {
            SubjectSpec::List(forced) => {
                requested.extend(forced.iter().cloned());
                SubjectSpec::List(requested)
            }
            other => other.clone(),
        },
        Some(SubjectSpec::Text(_)) | None => forced.clone(),
    });
}

fn resolve_validity(policy: &SigningPolicy, out: &mut CertificateRequest) {
    let default_ttl = policy.ttl;
    let max_ttl = policy.max_ttl.or(default_ttl);

    let mut requested_ttl = out.ttl;
    if let (Some(max), Some(not_after)) = (max_ttl, out.not_after) {
        // an explicit end date must not slip past the ceiling
        let span = out.not_before.map(|nb| (not_after - nb).num_seconds());
        requested_ttl = span.map(|s| u64::try_from(s).unwrap_or(0)).or(requested_ttl);
        out.not_after = None;
        debug!(max_ttl = max, "converted requested not_after into a ttl");
    }

    out.ttl = match requested_ttl {
        None => default_ttl.or(max_ttl),
        Some(requested) => match max_ttl {
            Some(max) if requested > max => {
                debug!(requested, max, "capping requested ttl at policy maximum");
                Some(max)
            }
            _ => Some(requested),
        },
    };
}

fn apply_overrides(policy: SigningPolicy, out: &mut CertificateRequest) {
    let o = policy.overrides;
    if o.signing_private_key.is_some() {
        out.signing_private_key = o.signing_private_key;
        out.signing_private_key_passphrase = o.signing_private_key_passphrase;
    } else if o.signing_private_key_passphrase.is_some() {
        out.signing_private_key_passphrase = o.signing_private_key_passphrase;
    }
    if o.signing_cert.is_some() {
        out.signing_cert = o.signing_cert;
    }
    if o.signing_public_key.is_some() {
        out.signing_public_key = o.signing_public_key;
    }
    if o.cert_type.is_some() {
        out.cert_type = o.cert_type;
    }
    if o.key_id.is_some() {
        out.key_id = o.key_id;
    }
    if o.digest.is_some() {
        out.digest = o.digest;
    }
    if o.serial_number.is_some() {
        out.serial_number = o.serial_number;
    }
    if o.not_before.is_some() {
        out.not_before = o.not_before;
    }
    if o.not_after.is_some() {
        out.not_after = o.not_after;
    }
    if o.copypath.is_some() {
        out.copypath = o.copypath;
    }
    if let Some(prepend_cn) = o.prepend_cn {
        out.prepend_cn = prepend_cn;
    }
}
