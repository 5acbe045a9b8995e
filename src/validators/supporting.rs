//! Supporting-token validators, one per combination of signed, endorsing
//! and encrypted.

use super::{settle, ValidatorParameters};
use crate::assertion::{AssertionEntry, SecurityAssertion};
use crate::coverage::{check_elements, check_parts, CoverageScope, CoverageType};
use crate::parser::NodeId;
use crate::policy::{SupportingTokenKind, SupportingTokensPolicy, TokenRequirement};
use crate::results::{EngineResult, SignatureResult, SigningKey};
use crate::xpath::XPathEvaluator;

/// A received token that may satisfy a token requirement.
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    id: Option<&'a str>,
    element: Option<NodeId>,
    /// Bare key value carried inside a signature's KeyInfo
    key_value: bool,
}

fn token_candidate(result: &EngineResult) -> Candidate<'_> {
    Candidate {
        id: result.token_id(),
        element: result.token_element(),
        key_value: false,
    }
}

impl Candidate<'_> {
    fn keyed(&self, key: &SigningKey) -> bool {
        if self.key_value {
            return matches!(key, SigningKey::KeyValue { .. });
        }
        match (self.id, key.token_id()) {
            (Some(id), Some(key_id)) => id.trim_start_matches('#') == key_id.trim_start_matches('#'),
            _ => false,
        }
    }

    fn covered_by(&self, signature: &SignatureResult) -> bool {
        self.element.is_some_and(|e| signature.covers_element(e))
            || self.id.is_some_and(|id| signature.covers_id(id))
    }
}

fn label(requirement: &TokenRequirement) -> &'static str {
    match requirement {
        TokenRequirement::UsernameToken(_) => "UsernameToken",
        TokenRequirement::X509Token(_) => "X509Token",
        TokenRequirement::SamlToken(_) => "SamlToken",
        TokenRequirement::SecurityContextToken(_) => "SecurityContextToken",
        TokenRequirement::KeyValueToken => "KeyValueToken",
        TokenRequirement::IssuedToken { .. } => "IssuedToken",
    }
}

fn candidates<'a>(params: &ValidatorParameters<'a>, requirement: &TokenRequirement) -> Vec<Candidate<'a>> {
    let results = params.results;
    let of = |keep: fn(&EngineResult) -> bool| -> Vec<Candidate<'a>> {
        results.iter().filter(|r| keep(r)).map(token_candidate).collect()
    };
    match requirement {
        TokenRequirement::UsernameToken(_) => of(|r| matches!(r, EngineResult::UsernameToken(_))),
        TokenRequirement::X509Token(_) => of(|r| matches!(r, EngineResult::X509Token(_))),
        TokenRequirement::SamlToken(_) => of(|r| matches!(r, EngineResult::SamlToken(_))),
        TokenRequirement::SecurityContextToken(_) => of(|r| matches!(r, EngineResult::SecurityContextToken(_))),
        TokenRequirement::IssuedToken { .. } => {
            of(|r| matches!(r, EngineResult::SamlToken(_) | EngineResult::SecurityContextToken(_)))
        }
        TokenRequirement::KeyValueToken => params
            .signatures()
            .filter(|s| matches!(s.key, SigningKey::KeyValue { .. }))
            .map(|_| Candidate {
                id: None,
                element: None,
                key_value: true,
            })
            .collect(),
    }
}

struct Requirements<'p, 'a> {
    kind: SupportingTokenKind,
    params: &'p ValidatorParameters<'a>,
    primary: Option<&'a SignatureResult>,
    /// TLS protects the message as a whole
    tls: bool,
}

impl Requirements<'_, '_> {
    fn signed(&self, candidate: &Candidate<'_>) -> bool {
        self.tls || self.primary.is_some_and(|p| candidate.covered_by(p))
    }

    fn encrypted(&self, candidate: &Candidate<'_>) -> bool {
        self.tls
            || candidate
                .element
                .is_some_and(|e| self.params.encrypted_refs.iter().any(|r| r.element == Some(e)))
    }

    /// A signature made with the token's key over the primary signature, or
    /// over the timestamp when there is no primary signature.
    fn endorsing(&self, candidate: &Candidate<'_>) -> bool {
        self.params.signatures().any(|signature| {
            if !candidate.keyed(&signature.key) {
                return false;
            }
            match self.primary {
                Some(primary) if std::ptr::eq(primary, signature) => false,
                Some(primary) => super::signs(signature, primary),
                None => self.params.timestamp.is_some_and(|ts| {
                    ts.element.is_some_and(|e| signature.covers_element(e))
                        || ts.id.as_deref().is_some_and(|id| signature.covers_id(id))
                }),
            }
        })
    }

    fn satisfied_by(&self, candidate: &Candidate<'_>) -> bool {
        (!self.kind.is_signed() || self.signed(candidate))
            && (!self.kind.is_encrypted() || self.encrypted(candidate))
            && (!self.kind.is_endorsing() || self.endorsing(candidate))
    }
}

fn check_protection(params: &ValidatorParameters<'_>, policy: &SupportingTokensPolicy, reasons: &mut Vec<String>) {
    let soap = params.soap();
    let attachments = &params.message.attachments;
    if let Some(parts) = &policy.signed_parts {
        reasons.extend(check_parts(soap, attachments, params.signed_refs, parts, CoverageType::Signed));
    }
    if let Some(parts) = &policy.encrypted_parts {
        reasons.extend(check_parts(soap, attachments, params.encrypted_refs, parts, CoverageType::Encrypted));
    }

    if policy.signed_elements.is_none() && policy.encrypted_elements.is_none() {
        return;
    }
    let mut xpath = XPathEvaluator::new(params.document());
    if let Some(elements) = &policy.signed_elements {
        reasons.extend(check_elements(
            &mut xpath,
            soap,
            params.signed_refs,
            elements,
            CoverageType::Signed,
            CoverageScope::Element,
        ));
    }
    if let Some(elements) = &policy.encrypted_elements {
        reasons.extend(check_elements(
            &mut xpath,
            soap,
            params.encrypted_refs,
            elements,
            CoverageType::Encrypted,
            CoverageScope::Element,
        ));
    }
}

pub(super) fn validate(kind: SupportingTokenKind, params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    let requirements = Requirements {
        kind,
        params,
        primary: params.primary_signature(),
        tls: params.message.context.tls_session.is_some(),
    };

    for entry in assertions {
        let SecurityAssertion::SupportingTokens(policy) = entry.assertion() else {
            continue;
        };
        let mut reasons = Vec::new();
        for requirement in &policy.tokens {
            if !requirement.inclusion().is_required_inbound(params.is_requestor()) {
                continue;
            }
            let found = candidates(params, requirement)
                .iter()
                .any(|c| requirements.satisfied_by(c));
            if !found {
                reasons.push(format!(
                    "{} requirement not met by any received {}",
                    kind.as_str(),
                    label(requirement)
                ));
            }
        }
        check_protection(params, policy, &mut reasons);
        settle(entry, reasons);
    }
}
