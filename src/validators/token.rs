//! Token validators: X.509, UsernameToken, SAML, SecurityContextToken, WSS11.

use super::{settle, ValidatorParameters};
use crate::assertion::{AssertionCategory, AssertionEntry, RequirementMarker, SecurityAssertion};
use crate::policy::{PasswordType, TokenInclusion};
use crate::results::{EngineResult, KeyReference, PasswordKind, SamlConfirmation, SigningKey};
use tracing::debug;

/// Confirm an assertion whose token is not expected inbound. Returns whether
/// the token is required.
fn required_inbound(entry: &AssertionEntry, inclusion: TokenInclusion, params: &ValidatorParameters<'_>) -> bool {
    if inclusion.is_required_inbound(params.is_requestor()) {
        return true;
    }
    debug!(category = %entry.category(), "Token not expected in this direction");
    entry.confirm();
    false
}

pub(super) fn validate_username_token(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    for entry in assertions {
        let SecurityAssertion::UsernameToken(policy) = entry.assertion() else {
            continue;
        };
        if !required_inbound(entry, policy.inclusion, params) {
            continue;
        }
        if params.username_token_results.is_empty() {
            entry.falsify("Received message does not contain a UsernameToken");
            continue;
        }

        let mut reasons = Vec::new();
        for token in &params.username_token_results {
            match (policy.password_type, token.password) {
                (PasswordType::HashPassword, Some(PasswordKind::Digest)) => {}
                (PasswordType::HashPassword, _) => reasons.push("Password hashing policy not enforced".to_string()),
                (PasswordType::NoPassword, None) => {}
                (PasswordType::NoPassword, Some(_)) => {
                    reasons.push("UsernameToken NoPassword policy not enforced".to_string())
                }
                (PasswordType::Text, None) => reasons.push("UsernameToken carries no password".to_string()),
                (PasswordType::Text, Some(_)) => {}
            }
            if policy.require_nonce && token.nonce.is_none() {
                reasons.push("UsernameToken does not contain a Nonce".to_string());
            }
            if policy.require_created && token.created.is_none() {
                reasons.push("UsernameToken does not contain a Created".to_string());
            }
            // The engine only checks passwords when it was handed a callback.
            if params.ut_with_callbacks && token.password.is_some() && !token.password_verified {
                reasons.push(format!("Password of UsernameToken '{}' was not verified", token.username));
            }
        }
        settle(entry, reasons);
    }
}

pub(super) fn validate_x509(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    let tokens: Vec<_> = params
        .results
        .iter()
        .filter_map(|r| match r {
            EngineResult::X509Token(t) => Some(t),
            _ => None,
        })
        .collect();
    let references: Vec<KeyReference> = params
        .signatures()
        .filter_map(|s| match s.key {
            SigningKey::X509 { reference, .. } => Some(reference),
            _ => None,
        })
        .collect();

    for entry in assertions {
        let SecurityAssertion::X509Token(policy) = entry.assertion() else {
            continue;
        };
        if !required_inbound(entry, policy.inclusion, params) {
            continue;
        }
        if tokens.is_empty() && references.is_empty() {
            entry.falsify("Received message does not contain an X509 token");
            continue;
        }

        let mut reasons = Vec::new();
        if let Some(wanted) = policy.token_type {
            if !tokens.is_empty() && !tokens.iter().any(|t| t.token_type == wanted) {
                reasons.push(format!("X509 token of type {:?} not found", wanted));
            }
        }
        let required = [
            (policy.require_issuer_serial_reference, KeyReference::IssuerSerial, "IssuerSerial"),
            (policy.require_thumbprint_reference, KeyReference::Thumbprint, "Thumbprint"),
            (policy.require_key_identifier_reference, KeyReference::KeyIdentifier, "KeyIdentifier"),
        ];
        for (needed, kind, label) in required {
            if needed && !references.contains(&kind) {
                reasons.push(format!("{} key reference not used by any X509 signature", label));
            }
        }
        settle(entry, reasons);
    }
}

pub(super) fn validate_saml(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    for entry in assertions {
        let SecurityAssertion::SamlToken(policy) = entry.assertion() else {
            continue;
        };
        if !required_inbound(entry, policy.inclusion, params) {
            continue;
        }
        if params.saml_results.is_empty() {
            entry.falsify("Received message does not contain a SAML assertion");
            continue;
        }

        let mut reasons = Vec::new();
        if let Some(version) = policy.version {
            if !params.saml_results.iter().any(|s| s.version == version) {
                reasons.push(format!("SAML assertion of version {:?} required", version));
            }
        }
        for saml in &params.saml_results {
            match saml.confirmation {
                SamlConfirmation::HolderOfKey => {
                    let proven = saml.id.as_deref().is_some_and(|id| {
                        params.signatures().any(|s| {
                            matches!(&s.key, SigningKey::SamlAssertion { token_id, .. } if token_id == id)
                        })
                    });
                    if !proven {
                        reasons.push("Holder-of-key SAML assertion was not used to sign the message".to_string());
                    }
                }
                SamlConfirmation::SenderVouches => {
                    let signed = saml.element.is_some_and(|e| params.signed_refs.iter().any(|r| r.element == Some(e)))
                        || saml
                            .id
                            .as_deref()
                            .is_some_and(|id| params.signatures().any(|s| s.covers_id(id)));
                    if !signed {
                        reasons.push("Sender-vouches SAML assertion is not signed".to_string());
                    }
                }
                SamlConfirmation::Bearer => {}
            }
        }
        settle(entry, reasons);
    }
}

pub(super) fn validate_security_context_token(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    let tokens: Vec<_> = params
        .results
        .iter()
        .filter_map(|r| match r {
            EngineResult::SecurityContextToken(t) => Some(t),
            _ => None,
        })
        .collect();

    for entry in assertions {
        let SecurityAssertion::SecurityContextToken(policy) = entry.assertion() else {
            continue;
        };
        if !required_inbound(entry, policy.inclusion, params) {
            continue;
        }
        if tokens.is_empty() {
            entry.falsify("Received message does not contain a SecurityContextToken");
            continue;
        }
        if policy.require_external_uri_reference && !tokens.iter().any(|t| t.external_reference) {
            entry.falsify("SecurityContextToken is not referenced by an external URI");
            continue;
        }
        entry.confirm();
    }
}

pub(super) fn validate_wss11(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    let confirmations = params
        .results
        .iter()
        .filter(|r| matches!(r, EngineResult::SignatureConfirmation(_)))
        .count();

    for entry in assertions {
        let SecurityAssertion::Wss11(policy) = entry.assertion() else {
            continue;
        };
        if policy.require_signature_confirmation && params.is_requestor() && confirmations == 0 {
            let reason = "Signature confirmation required but not received";
            entry.falsify(reason);
            for marker in params
                .registry
                .all_of(AssertionCategory::Requirement(RequirementMarker::RequireSignatureConfirmation))
            {
                marker.falsify(reason);
            }
            continue;
        }
        entry.confirm();
    }

    for marker in RequirementMarker::WSS10.iter().chain(RequirementMarker::WSS11.iter()) {
        params.registry.confirm_all(AssertionCategory::Requirement(*marker));
    }
}
