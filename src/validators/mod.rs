//! Per-category policy validators.
//!
//! Each validator looks at the assertions of one category and the engine's
//! results, and flips verdicts in place. Validators never talk to each
//! other; a message is accepted when every verdict still holds afterwards.

mod binding;
mod supporting;
mod token;

use crate::assertion::{AssertionCategory, AssertionEntry, AssertionRegistry};
use crate::context::InboundMessage;
use crate::parser::{Document, NodeId, SoapDocument};
use crate::policy::SupportingTokenKind;
use crate::results::{
    DataRefSet, EngineOutcome, EngineResult, SamlTokenResult, SignatureResult, TimestampResult,
    UsernameTokenResult,
};
use tracing::debug;

/// Evidence handed to every validator for one message.
pub struct ValidatorParameters<'a> {
    pub registry: &'a AssertionRegistry,
    pub message: &'a InboundMessage,
    pub results: &'a [EngineResult],
    pub signed_results: Vec<&'a EngineResult>,
    pub encrypted_results: Vec<&'a EngineResult>,
    /// Signed references, already reconciled with `encrypted_refs`
    pub signed_refs: &'a DataRefSet,
    pub encrypted_refs: &'a DataRefSet,
    pub username_token_results: Vec<&'a UsernameTokenResult>,
    pub saml_results: Vec<&'a SamlTokenResult>,
    pub timestamp: Option<&'a TimestampResult>,
    pub ut_with_callbacks: bool,
}

impl<'a> ValidatorParameters<'a> {
    pub fn new(
        registry: &'a AssertionRegistry,
        message: &'a InboundMessage,
        outcome: &'a EngineOutcome,
        signed_refs: &'a DataRefSet,
        encrypted_refs: &'a DataRefSet,
    ) -> Self {
        let username_token_results = outcome
            .username_token_results()
            .into_iter()
            .filter_map(|r| match r {
                EngineResult::UsernameToken(ut) => Some(ut),
                _ => None,
            })
            .collect();
        let saml_results = outcome
            .saml_results()
            .into_iter()
            .filter_map(|r| match r {
                EngineResult::SamlToken(saml) => Some(saml),
                _ => None,
            })
            .collect();

        Self {
            registry,
            message,
            results: &outcome.results,
            signed_results: outcome.signed_results(),
            encrypted_results: outcome.encrypted_results(),
            signed_refs,
            encrypted_refs,
            username_token_results,
            saml_results,
            timestamp: outcome.timestamp(),
            ut_with_callbacks: outcome.ut_with_callbacks,
        }
    }

    pub fn soap(&self) -> &'a SoapDocument {
        &self.message.envelope
    }

    pub fn document(&self) -> &'a Document {
        &self.message.envelope.document
    }

    pub fn header(&self) -> Option<NodeId> {
        self.message.envelope.header
    }

    pub fn body(&self) -> NodeId {
        self.message.envelope.body
    }

    pub fn is_requestor(&self) -> bool {
        self.message.context.is_requestor
    }

    pub fn signatures(&self) -> impl Iterator<Item = &'a SignatureResult> {
        self.results.iter().filter_map(EngineResult::as_signature)
    }

    /// The first signature that does not itself sign another signature.
    pub fn primary_signature(&self) -> Option<&'a SignatureResult> {
        let signatures: Vec<&SignatureResult> = self.signatures().collect();
        signatures.iter().copied().find(|candidate| {
            !signatures
                .iter()
                .any(|other| !std::ptr::eq(*candidate, *other) && signs(candidate, other))
        })
    }

    /// Signatures over the primary signature.
    pub fn endorsing_signatures(&self) -> Vec<&'a SignatureResult> {
        let Some(primary) = self.primary_signature() else {
            return Vec::new();
        };
        self.signatures()
            .filter(|s| !std::ptr::eq(*s, primary) && signs(s, primary))
            .collect()
    }

    /// Position of a result in processing order.
    pub fn index_of(&self, result: &EngineResult) -> Option<usize> {
        self.results.iter().position(|r| std::ptr::eq(r, result))
    }
}

/// Whether `signature` references the element of `other`.
pub(crate) fn signs(signature: &SignatureResult, other: &SignatureResult) -> bool {
    other.element.is_some_and(|e| signature.covers_element(e))
        || other.id.as_deref().is_some_and(|id| signature.covers_id(id))
}

/// The fixed set of validators, one per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyValidator {
    X509Token,
    UsernameToken,
    SamlToken,
    SecurityContextToken,
    Wss11,
    TransportBinding,
    SymmetricBinding,
    AsymmetricBinding,
    AlgorithmSuite,
    Layout,
    SupportingTokens(SupportingTokenKind),
}

impl PolicyValidator {
    /// Every validator in dispatch order: tokens, bindings, supporting tokens.
    pub fn all() -> Vec<PolicyValidator> {
        let mut validators = vec![
            Self::X509Token,
            Self::UsernameToken,
            Self::SamlToken,
            Self::SecurityContextToken,
            Self::Wss11,
            Self::TransportBinding,
            Self::SymmetricBinding,
            Self::AsymmetricBinding,
            Self::AlgorithmSuite,
            Self::Layout,
        ];
        validators.extend(SupportingTokenKind::ALL.into_iter().map(Self::SupportingTokens));
        validators
    }

    pub fn category(&self) -> AssertionCategory {
        match self {
            Self::X509Token => AssertionCategory::X509Token,
            Self::UsernameToken => AssertionCategory::UsernameToken,
            Self::SamlToken => AssertionCategory::SamlToken,
            Self::SecurityContextToken => AssertionCategory::SecurityContextToken,
            Self::Wss11 => AssertionCategory::Wss11,
            Self::TransportBinding => AssertionCategory::TransportBinding,
            Self::SymmetricBinding => AssertionCategory::SymmetricBinding,
            Self::AsymmetricBinding => AssertionCategory::AsymmetricBinding,
            Self::AlgorithmSuite => AssertionCategory::AlgorithmSuite,
            Self::Layout => AssertionCategory::Layout,
            Self::SupportingTokens(kind) => AssertionCategory::SupportingTokens(*kind),
        }
    }

    pub fn validate(&self, params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
        match self {
            Self::X509Token => token::validate_x509(params, assertions),
            Self::UsernameToken => token::validate_username_token(params, assertions),
            Self::SamlToken => token::validate_saml(params, assertions),
            Self::SecurityContextToken => token::validate_security_context_token(params, assertions),
            Self::Wss11 => token::validate_wss11(params, assertions),
            Self::TransportBinding => binding::validate_transport(params, assertions),
            Self::SymmetricBinding => binding::validate_symmetric(params, assertions),
            Self::AsymmetricBinding => binding::validate_asymmetric(params, assertions),
            Self::AlgorithmSuite => binding::validate_algorithm_suite(params, assertions),
            Self::Layout => binding::validate_layout(params, assertions),
            Self::SupportingTokens(kind) => supporting::validate(*kind, params, assertions),
        }
    }
}

/// Run every validator whose category is present in the registry.
pub fn validate_all(params: &ValidatorParameters<'_>) {
    for validator in PolicyValidator::all() {
        let assertions = params.registry.all_of(validator.category());
        if assertions.is_empty() {
            continue;
        }
        debug!(validator = ?validator, count = assertions.len(), "Running policy validator");
        validator.validate(params, assertions);
    }
}

/// Falsify with every reason, or confirm when there are none.
pub(crate) fn settle(entry: &AssertionEntry, reasons: Vec<String>) {
    if reasons.is_empty() {
        entry.confirm();
    }
    for reason in reasons {
        entry.falsify(reason);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_dispatch_order() {
        let all = PolicyValidator::all();
        assert_eq!(all.len(), 18);
        assert_eq!(all[0], PolicyValidator::X509Token);
        assert_eq!(all[4], PolicyValidator::Wss11);
        assert_eq!(all[5], PolicyValidator::TransportBinding);
        assert_eq!(all[9], PolicyValidator::Layout);
        assert_eq!(
            all[10],
            PolicyValidator::SupportingTokens(SupportingTokenKind::Supporting)
        );
        assert_eq!(
            all[17],
            PolicyValidator::SupportingTokens(SupportingTokenKind::SignedEndorsingEncrypted)
        );
    }

    #[test]
    fn test_primary_and_endorsing_signatures() {
        let msg = message(vec![]);
        let primary = signature(&msg, "SIG-1", x509_key(None), &["Body-1", "TS-1"]);
        let endorsing = signature(&msg, "SIG-2", x509_key(Some("X509-1")), &["SIG-1"]);
        let outcome = EngineOutcome::new(vec![
            EngineResult::Signature(endorsing),
            EngineResult::Signature(primary),
        ]);
        let signed = outcome.signed_refs();
        let encrypted = outcome.encrypted_refs();
        let registry = msg.policy.as_ref().unwrap();
        let params = ValidatorParameters::new(registry, &msg, &outcome, &signed, &encrypted);

        assert_eq!(params.primary_signature().unwrap().id.as_deref(), Some("SIG-1"));
        let endorsing = params.endorsing_signatures();
        assert_eq!(endorsing.len(), 1);
        assert_eq!(endorsing[0].id.as_deref(), Some("SIG-2"));
    }

    #[test]
    fn test_validate_all_skips_absent_categories() {
        let msg = message(vec![]);
        let outcome = EngineOutcome::default();
        let registry = msg.policy.as_ref().unwrap();
        let signed = DataRefSet::new();
        let params = ValidatorParameters::new(registry, &msg, &outcome, &signed, &signed);
        validate_all(&params);
        assert!(registry.is_satisfied());
    }
}
