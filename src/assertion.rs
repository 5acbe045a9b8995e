//! Assertion registry: the asserted requirements of the effective policy and
//! their per-message verdicts.

use crate::error::PolicyViolation;
use crate::policy::{
    AlgorithmSuite, AsymmetricBinding, BindingProperties, ElementsRequirement, LayoutKind,
    ProtectedParts, RequiredParts, SamlTokenPolicy, SecurityContextTokenPolicy, SupportingTokenKind,
    SupportingTokensPolicy, SymmetricBinding, TransportBinding, Trust10, Trust13, UsernameTokenPolicy,
    Wss10, Wss11, X509TokenPolicy,
};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Nested marker requirements that carry no payload of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequirementMarker {
    MustSupportRefKeyIdentifier,
    MustSupportRefIssuerSerial,
    #[serde(rename = "MustSupportRefExternalURI")]
    MustSupportRefExternalUri,
    MustSupportRefEmbeddedToken,
    MustSupportRefThumbprint,
    MustSupportRefEncryptedKey,
    RequireSignatureConfirmation,
    MustSupportClientChallenge,
    MustSupportServerChallenge,
    RequireClientEntropy,
    RequireServerEntropy,
    MustSupportIssuedTokens,
    RequireRequestSecurityTokenCollection,
    RequireAppliesTo,
    ScopePolicy15,
    MustSupportInteractiveChallenge,
}

impl RequirementMarker {
    pub const WSS10: [RequirementMarker; 4] = [
        Self::MustSupportRefKeyIdentifier,
        Self::MustSupportRefIssuerSerial,
        Self::MustSupportRefExternalUri,
        Self::MustSupportRefEmbeddedToken,
    ];

    pub const WSS11: [RequirementMarker; 3] = [
        Self::MustSupportRefThumbprint,
        Self::MustSupportRefEncryptedKey,
        Self::RequireSignatureConfirmation,
    ];

    pub const TRUST10: [RequirementMarker; 5] = [
        Self::MustSupportClientChallenge,
        Self::MustSupportServerChallenge,
        Self::RequireClientEntropy,
        Self::RequireServerEntropy,
        Self::MustSupportIssuedTokens,
    ];

    pub const TRUST13: [RequirementMarker; 4] = [
        Self::RequireRequestSecurityTokenCollection,
        Self::RequireAppliesTo,
        Self::ScopePolicy15,
        Self::MustSupportInteractiveChallenge,
    ];

    const ALL: [RequirementMarker; 16] = [
        Self::MustSupportRefKeyIdentifier,
        Self::MustSupportRefIssuerSerial,
        Self::MustSupportRefExternalUri,
        Self::MustSupportRefEmbeddedToken,
        Self::MustSupportRefThumbprint,
        Self::MustSupportRefEncryptedKey,
        Self::RequireSignatureConfirmation,
        Self::MustSupportClientChallenge,
        Self::MustSupportServerChallenge,
        Self::RequireClientEntropy,
        Self::RequireServerEntropy,
        Self::MustSupportIssuedTokens,
        Self::RequireRequestSecurityTokenCollection,
        Self::RequireAppliesTo,
        Self::ScopePolicy15,
        Self::MustSupportInteractiveChallenge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MustSupportRefKeyIdentifier => "MustSupportRefKeyIdentifier",
            Self::MustSupportRefIssuerSerial => "MustSupportRefIssuerSerial",
            Self::MustSupportRefExternalUri => "MustSupportRefExternalURI",
            Self::MustSupportRefEmbeddedToken => "MustSupportRefEmbeddedToken",
            Self::MustSupportRefThumbprint => "MustSupportRefThumbprint",
            Self::MustSupportRefEncryptedKey => "MustSupportRefEncryptedKey",
            Self::RequireSignatureConfirmation => "RequireSignatureConfirmation",
            Self::MustSupportClientChallenge => "MustSupportClientChallenge",
            Self::MustSupportServerChallenge => "MustSupportServerChallenge",
            Self::RequireClientEntropy => "RequireClientEntropy",
            Self::RequireServerEntropy => "RequireServerEntropy",
            Self::MustSupportIssuedTokens => "MustSupportIssuedTokens",
            Self::RequireRequestSecurityTokenCollection => "RequireRequestSecurityTokenCollection",
            Self::RequireAppliesTo => "RequireAppliesTo",
            Self::ScopePolicy15 => "ScopePolicy15",
            Self::MustSupportInteractiveChallenge => "MustSupportInteractiveChallenge",
        }
    }
}

/// Category an assertion is registered and looked up under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AssertionCategory {
    TransportBinding,
    SymmetricBinding,
    AsymmetricBinding,
    AlgorithmSuite,
    Layout,
    IncludeTimestamp,
    UsernameToken,
    X509Token,
    SamlToken,
    SecurityContextToken,
    KeyValueToken,
    RsaKeyValue,
    Wss10,
    Wss11,
    Trust10,
    Trust13,
    SignedParts,
    EncryptedParts,
    SignedElements,
    EncryptedElements,
    ContentEncryptedElements,
    RequiredElements,
    RequiredParts,
    SupportingTokens(SupportingTokenKind),
    Requirement(RequirementMarker),
}

impl AssertionCategory {
    const PLAIN: [AssertionCategory; 23] = [
        Self::TransportBinding,
        Self::SymmetricBinding,
        Self::AsymmetricBinding,
        Self::AlgorithmSuite,
        Self::Layout,
        Self::IncludeTimestamp,
        Self::UsernameToken,
        Self::X509Token,
        Self::SamlToken,
        Self::SecurityContextToken,
        Self::KeyValueToken,
        Self::RsaKeyValue,
        Self::Wss10,
        Self::Wss11,
        Self::Trust10,
        Self::Trust13,
        Self::SignedParts,
        Self::EncryptedParts,
        Self::SignedElements,
        Self::EncryptedElements,
        Self::ContentEncryptedElements,
        Self::RequiredElements,
        Self::RequiredParts,
    ];

    /// Policy local name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportBinding => "TransportBinding",
            Self::SymmetricBinding => "SymmetricBinding",
            Self::AsymmetricBinding => "AsymmetricBinding",
            Self::AlgorithmSuite => "AlgorithmSuite",
            Self::Layout => "Layout",
            Self::IncludeTimestamp => "IncludeTimestamp",
            Self::UsernameToken => "UsernameToken",
            Self::X509Token => "X509Token",
            Self::SamlToken => "SamlToken",
            Self::SecurityContextToken => "SecurityContextToken",
            Self::KeyValueToken => "KeyValueToken",
            Self::RsaKeyValue => "RsaKeyValue",
            Self::Wss10 => "Wss10",
            Self::Wss11 => "Wss11",
            Self::Trust10 => "Trust10",
            Self::Trust13 => "Trust13",
            Self::SignedParts => "SignedParts",
            Self::EncryptedParts => "EncryptedParts",
            Self::SignedElements => "SignedElements",
            Self::EncryptedElements => "EncryptedElements",
            Self::ContentEncryptedElements => "ContentEncryptedElements",
            Self::RequiredElements => "RequiredElements",
            Self::RequiredParts => "RequiredParts",
            Self::SupportingTokens(kind) => kind.as_str(),
            Self::Requirement(marker) => marker.as_str(),
        }
    }
}

impl fmt::Display for AssertionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssertionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PLAIN
            .iter()
            .copied()
            .chain(SupportingTokenKind::ALL.iter().map(|k| Self::SupportingTokens(*k)))
            .chain(RequirementMarker::ALL.iter().map(|m| Self::Requirement(*m)))
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown assertion category '{}'", s))
    }
}

impl From<AssertionCategory> for String {
    fn from(category: AssertionCategory) -> Self {
        category.as_str().to_string()
    }
}

impl TryFrom<String> for AssertionCategory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One requirement extracted from the effective policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "policy", rename_all = "snake_case")]
pub enum SecurityAssertion {
    TransportBinding(TransportBinding),
    SymmetricBinding(SymmetricBinding),
    AsymmetricBinding(AsymmetricBinding),
    AlgorithmSuite(AlgorithmSuite),
    Layout(LayoutKind),
    IncludeTimestamp,
    UsernameToken(UsernameTokenPolicy),
    X509Token(X509TokenPolicy),
    SamlToken(SamlTokenPolicy),
    SecurityContextToken(SecurityContextTokenPolicy),
    KeyValueToken,
    RsaKeyValue,
    Wss10(Wss10),
    Wss11(Wss11),
    Trust10(Trust10),
    Trust13(Trust13),
    SignedParts(ProtectedParts),
    EncryptedParts(ProtectedParts),
    SignedElements(ElementsRequirement),
    EncryptedElements(ElementsRequirement),
    ContentEncryptedElements(ElementsRequirement),
    RequiredElements(ElementsRequirement),
    RequiredParts(RequiredParts),
    SupportingTokens(SupportingTokensPolicy),
    Requirement(RequirementMarker),
}

impl SecurityAssertion {
    pub fn category(&self) -> AssertionCategory {
        use AssertionCategory as C;
        match self {
            Self::TransportBinding(_) => C::TransportBinding,
            Self::SymmetricBinding(_) => C::SymmetricBinding,
            Self::AsymmetricBinding(_) => C::AsymmetricBinding,
            Self::AlgorithmSuite(_) => C::AlgorithmSuite,
            Self::Layout(_) => C::Layout,
            Self::IncludeTimestamp => C::IncludeTimestamp,
            Self::UsernameToken(_) => C::UsernameToken,
            Self::X509Token(_) => C::X509Token,
            Self::SamlToken(_) => C::SamlToken,
            Self::SecurityContextToken(_) => C::SecurityContextToken,
            Self::KeyValueToken => C::KeyValueToken,
            Self::RsaKeyValue => C::RsaKeyValue,
            Self::Wss10(_) => C::Wss10,
            Self::Wss11(_) => C::Wss11,
            Self::Trust10(_) => C::Trust10,
            Self::Trust13(_) => C::Trust13,
            Self::SignedParts(_) => C::SignedParts,
            Self::EncryptedParts(_) => C::EncryptedParts,
            Self::SignedElements(_) => C::SignedElements,
            Self::EncryptedElements(_) => C::EncryptedElements,
            Self::ContentEncryptedElements(_) => C::ContentEncryptedElements,
            Self::RequiredElements(_) => C::RequiredElements,
            Self::RequiredParts(_) => C::RequiredParts,
            Self::SupportingTokens(p) => C::SupportingTokens(p.kind),
            Self::Requirement(m) => C::Requirement(*m),
        }
    }

    pub fn protected_parts(&self) -> Option<&ProtectedParts> {
        match self {
            Self::SignedParts(p) | Self::EncryptedParts(p) => Some(p),
            _ => None,
        }
    }

    pub fn elements(&self) -> Option<&ElementsRequirement> {
        match self {
            Self::SignedElements(e)
            | Self::EncryptedElements(e)
            | Self::ContentEncryptedElements(e)
            | Self::RequiredElements(e) => Some(e),
            _ => None,
        }
    }

    pub fn binding_properties(&self) -> Option<&BindingProperties> {
        match self {
            Self::TransportBinding(b) => Some(&b.properties),
            Self::SymmetricBinding(b) => Some(&b.properties),
            Self::AsymmetricBinding(b) => Some(&b.properties),
            _ => None,
        }
    }

    /// Nested assertions a policy parser would register alongside this one.
    fn nested(&self) -> Vec<SecurityAssertion> {
        let mut nested = Vec::new();
        if self.binding_properties().is_some_and(|p| p.include_timestamp) {
            nested.push(Self::IncludeTimestamp);
        }

        let mut markers: Vec<(bool, RequirementMarker)> = Vec::new();
        let wss10 = |w: &Wss10, markers: &mut Vec<(bool, RequirementMarker)>| {
            markers.push((w.must_support_ref_key_identifier, RequirementMarker::MustSupportRefKeyIdentifier));
            markers.push((w.must_support_ref_issuer_serial, RequirementMarker::MustSupportRefIssuerSerial));
            markers.push((w.must_support_ref_external_uri, RequirementMarker::MustSupportRefExternalUri));
            markers.push((w.must_support_ref_embedded_token, RequirementMarker::MustSupportRefEmbeddedToken));
        };
        let trust10 = |t: &Trust10, markers: &mut Vec<(bool, RequirementMarker)>| {
            markers.push((t.must_support_client_challenge, RequirementMarker::MustSupportClientChallenge));
            markers.push((t.must_support_server_challenge, RequirementMarker::MustSupportServerChallenge));
            markers.push((t.require_client_entropy, RequirementMarker::RequireClientEntropy));
            markers.push((t.require_server_entropy, RequirementMarker::RequireServerEntropy));
            markers.push((t.must_support_issued_tokens, RequirementMarker::MustSupportIssuedTokens));
        };

        match self {
            Self::Wss10(w) => wss10(w, &mut markers),
            Self::Wss11(w) => {
                wss10(&w.wss10, &mut markers);
                markers.push((w.must_support_ref_thumbprint, RequirementMarker::MustSupportRefThumbprint));
                markers.push((w.must_support_ref_encrypted_key, RequirementMarker::MustSupportRefEncryptedKey));
                markers.push((w.require_signature_confirmation, RequirementMarker::RequireSignatureConfirmation));
            }
            Self::Trust10(t) => trust10(t, &mut markers),
            Self::Trust13(t) => {
                trust10(&t.trust10, &mut markers);
                markers.push((
                    t.require_request_security_token_collection,
                    RequirementMarker::RequireRequestSecurityTokenCollection,
                ));
                markers.push((t.require_applies_to, RequirementMarker::RequireAppliesTo));
                markers.push((t.scope_policy15, RequirementMarker::ScopePolicy15));
                markers.push((
                    t.must_support_interactive_challenge,
                    RequirementMarker::MustSupportInteractiveChallenge,
                ));
            }
            _ => {}
        }

        nested.extend(
            markers
                .into_iter()
                .filter(|(set, _)| *set)
                .map(|(_, marker)| Self::Requirement(marker)),
        );
        nested
    }
}

/// Mutable satisfaction state of one assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionVerdict {
    pub asserted: bool,
    pub reason: Option<String>,
    /// Some component positively checked the assertion
    pub confirmed: bool,
}

impl Default for AssertionVerdict {
    fn default() -> Self {
        Self {
            asserted: true,
            reason: None,
            confirmed: false,
        }
    }
}

/// An assertion together with its verdict.
#[derive(Debug)]
pub struct AssertionEntry {
    assertion: SecurityAssertion,
    verdict: RefCell<AssertionVerdict>,
}

impl AssertionEntry {
    pub fn new(assertion: SecurityAssertion) -> Self {
        Self {
            assertion,
            verdict: RefCell::new(AssertionVerdict::default()),
        }
    }

    pub fn assertion(&self) -> &SecurityAssertion {
        &self.assertion
    }

    pub fn category(&self) -> AssertionCategory {
        self.assertion.category()
    }

    pub fn verdict(&self) -> AssertionVerdict {
        self.verdict.borrow().clone()
    }

    pub fn is_asserted(&self) -> bool {
        self.verdict.borrow().asserted
    }

    pub fn reason(&self) -> Option<String> {
        self.verdict.borrow().reason.clone()
    }

    /// Record a positive check. Never clears an earlier falsification.
    pub fn confirm(&self) {
        self.verdict.borrow_mut().confirmed = true;
    }

    /// Mark the assertion unsatisfied. Reasons accumulate.
    pub fn falsify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(
            category = %self.category(),
            reason = %reason,
            "Assertion not satisfied"
        );
        let mut verdict = self.verdict.borrow_mut();
        verdict.asserted = false;
        verdict.reason = Some(match verdict.reason.take() {
            Some(existing) => format!("{}; {}", existing, reason),
            None => reason,
        });
    }
}

/// Category-keyed view of the effective policy for one message.
///
/// Verdicts are flipped through shared references during a single-threaded
/// verification pass, so the registry is `!Sync`.
#[derive(Debug, Default)]
pub struct AssertionRegistry {
    entries: BTreeMap<AssertionCategory, Vec<AssertionEntry>>,
    queries: Cell<usize>,
}

impl AssertionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an assertion and the nested requirements it implies.
    pub fn insert(&mut self, assertion: SecurityAssertion) {
        let nested = assertion.nested();
        self.push(assertion);
        for child in nested {
            self.push(child);
        }
    }

    fn push(&mut self, assertion: SecurityAssertion) {
        self.entries
            .entry(assertion.category())
            .or_default()
            .push(AssertionEntry::new(assertion));
    }

    /// All assertions of a category, in insertion order.
    pub fn all_of(&self, category: AssertionCategory) -> &[AssertionEntry] {
        self.queries.set(self.queries.get() + 1);
        self.entries.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first_of(&self, category: AssertionCategory) -> Option<&AssertionEntry> {
        self.all_of(category).first()
    }

    pub fn contains(&self, category: AssertionCategory) -> bool {
        self.first_of(category).is_some()
    }

    /// Mutable access to the payloads of a category.
    pub fn assertions_mut(
        &mut self,
        category: AssertionCategory,
    ) -> impl Iterator<Item = &mut SecurityAssertion> {
        self.queries.set(self.queries.get() + 1);
        self.entries
            .get_mut(&category)
            .into_iter()
            .flat_map(|entries| entries.iter_mut().map(|e| &mut e.assertion))
    }

    /// Confirm every assertion of a category without further evidence.
    pub fn confirm_all(&self, category: AssertionCategory) {
        for entry in self.all_of(category) {
            entry.confirm();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssertionEntry> {
        self.entries.values().flatten()
    }

    /// Every falsified assertion, as violations.
    pub fn violations(&self) -> Vec<PolicyViolation> {
        self.iter()
            .filter(|e| !e.is_asserted())
            .map(|e| {
                PolicyViolation::new(
                    e.category(),
                    e.reason()
                        .unwrap_or_else(|| format!("{} not satisfied", e.category())),
                )
            })
            .collect()
    }

    pub fn is_satisfied(&self) -> bool {
        self.iter().all(AssertionEntry::is_asserted)
    }

    /// Number of category lookups made so far.
    pub fn query_count(&self) -> usize {
        self.queries.get()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<SecurityAssertion> for AssertionRegistry {
    fn from_iter<T: IntoIterator<Item = SecurityAssertion>>(iter: T) -> Self {
        let mut registry = Self::new();
        for assertion in iter {
            registry.insert(assertion);
        }
        registry
    }
}
