//! Checks that the parts and elements a policy requires to be signed or
//! encrypted actually were, and that required headers are present.

use crate::assertion::{AssertionCategory, AssertionEntry, AssertionRegistry, SecurityAssertion};
use crate::context::{Attachment, InboundMessage};
use crate::error::PolicyError;
use crate::parser::{NodeId, SoapDocument};
use crate::policy::{ElementsRequirement, ProtectedParts};
use crate::results::{DataRefSet, DataReference};
use crate::xpath::{NamespaceContext, XPathEvaluator};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Signature transform selecting only the attachment content.
pub const ATTACHMENT_CONTENT_TRANSFORM: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-SwAProfile-1.1#Attachment-Content-Signature-Transform";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageType {
    Signed,
    Encrypted,
}

impl fmt::Display for CoverageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signed => f.write_str("signed"),
            Self::Encrypted => f.write_str("encrypted"),
        }
    }
}

/// Whether the element itself or only its content must be protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageScope {
    Element,
    Content,
}

/// Attribute signatures made over encrypted data to the decrypted element.
///
/// Every encrypted reference whose id matches a signed reference's id (with
/// or without a leading `#`) yields an extra signed reference pointing at
/// the decrypted element. Idempotent.
pub fn reconcile_encrypted_signed_refs(signed: &mut DataRefSet, encrypted: &DataRefSet) {
    let mut additions = Vec::new();
    for encrypted_ref in encrypted {
        let Some(encrypted_id) = encrypted_ref.bare_id() else {
            continue;
        };
        for signed_ref in signed.iter() {
            if signed_ref.bare_id() == Some(encrypted_id) {
                additions.push(DataReference {
                    wsu_id: signed_ref.wsu_id.clone(),
                    element: encrypted_ref.element,
                    content: false,
                    attachment_id: None,
                    algorithm: None,
                    digest_algorithm: signed_ref.digest_algorithm.clone(),
                    transforms: signed_ref.transforms.clone(),
                });
            }
        }
    }
    signed.extend(additions);
}

fn matches_scope(reference: &DataReference, kind: CoverageType, scope: CoverageScope) -> bool {
    match (kind, scope) {
        (CoverageType::Signed, _) => true,
        (CoverageType::Encrypted, CoverageScope::Element) => !reference.content,
        (CoverageType::Encrypted, CoverageScope::Content) => reference.content,
    }
}

fn is_covered(element: NodeId, refs: &DataRefSet, kind: CoverageType, scope: CoverageScope) -> bool {
    refs.iter()
        .any(|r| r.element == Some(element) && matches_scope(r, kind, scope))
}

fn attachment_covered(
    attachment: &Attachment,
    refs: &DataRefSet,
    kind: CoverageType,
    scope: CoverageScope,
) -> bool {
    let cid = attachment.cid();
    refs.iter().any(|r| {
        r.attachment_id.as_deref() == Some(cid.as_str())
            && match (kind, scope) {
                (CoverageType::Signed, CoverageScope::Content) => {
                    r.transforms.iter().any(|t| t == ATTACHMENT_CONTENT_TRANSFORM)
                }
                _ => matches_scope(r, kind, scope),
            }
    })
}

/// Check a SignedParts / EncryptedParts payload. Returns failure reasons.
///
/// A body failure ends the check; header failures do not block the
/// remaining headers.
pub(crate) fn check_parts(
    soap: &SoapDocument,
    attachments: &[Attachment],
    refs: &DataRefSet,
    parts: &ProtectedParts,
    kind: CoverageType,
) -> Vec<String> {
    let mut reasons = Vec::new();

    if parts.body {
        let scope = match kind {
            CoverageType::Signed => CoverageScope::Element,
            CoverageType::Encrypted => CoverageScope::Content,
        };
        if !is_covered(soap.body, refs, kind, scope) {
            reasons.push(format!("{} not {}", soap.body_name(), kind));
            return reasons;
        }
    }

    for selector in &parts.headers {
        let uncovered = soap.header_children().iter().any(|child| {
            soap.document.name(*child).is_some_and(|name| selector.matches(name))
                && !is_covered(*child, refs, kind, CoverageScope::Element)
        });
        if uncovered {
            reasons.push(format!(
                "{}:{} not {}",
                selector.namespace,
                selector.name.as_deref().unwrap_or("*"),
                kind
            ));
        }
    }

    if let Some(requirement) = &parts.attachments {
        let scope = if requirement.content_signature_transform {
            CoverageScope::Content
        } else {
            CoverageScope::Element
        };
        if !attachments.iter().all(|a| attachment_covered(a, refs, kind, scope)) {
            reasons.push("An attachment was not signed/encrypted".to_string());
        }
    }

    reasons
}

fn namespace_context(elements: &ElementsRequirement) -> NamespaceContext {
    let mut namespaces = NamespaceContext::new();
    for selector in &elements.xpaths {
        namespaces.add_namespaces(&selector.namespaces);
    }
    namespaces
}

/// Check an XPath-based elements payload. Every element selected by each
/// expression must be covered; returns the grouped failure reason.
pub(crate) fn check_elements(
    xpath: &mut XPathEvaluator<'_>,
    soap: &SoapDocument,
    refs: &DataRefSet,
    elements: &ElementsRequirement,
    kind: CoverageType,
    scope: CoverageScope,
) -> Option<String> {
    if elements.xpaths.is_empty() {
        return None;
    }
    xpath.set_namespace_context(namespace_context(elements));

    let mut covered = true;
    for selector in &elements.xpaths {
        match xpath.evaluate(&selector.expression, soap.envelope) {
            Ok(nodes) => {
                if !nodes.iter().all(|n| is_covered(*n, refs, kind, scope)) {
                    covered = false;
                    break;
                }
            }
            Err(e) => {
                let error = PolicyError::MalformedXPath {
                    expression: selector.expression.clone(),
                    reason: e.to_string(),
                };
                debug!(error = %error, "XPath coverage check failed");
                covered = false;
                break;
            }
        }
    }

    if covered {
        None
    } else {
        let expressions: Vec<&str> = elements.xpaths.iter().map(|s| s.expression.as_str()).collect();
        Some(format!(
            "No {} element found matching one of the XPaths [{}]",
            kind,
            expressions.join(", ")
        ))
    }
}

/// Runs the coverage checks of one verification pass.
pub struct CoverageVerifier<'a> {
    registry: &'a AssertionRegistry,
    message: &'a InboundMessage,
    signed: &'a DataRefSet,
    encrypted: &'a DataRefSet,
}

impl<'a> CoverageVerifier<'a> {
    /// `signed` must already be reconciled with `encrypted`.
    pub fn new(
        registry: &'a AssertionRegistry,
        message: &'a InboundMessage,
        signed: &'a DataRefSet,
        encrypted: &'a DataRefSet,
    ) -> Self {
        Self {
            registry,
            message,
            signed,
            encrypted,
        }
    }

    pub fn verify(&self) {
        if !self.is_transport_binding() {
            self.check_protected_parts(AssertionCategory::SignedParts, self.signed, CoverageType::Signed);
            self.check_protected_parts(AssertionCategory::EncryptedParts, self.encrypted, CoverageType::Encrypted);
        }

        if self.contains_xpath_policy() {
            let mut xpath = XPathEvaluator::new(&self.message.envelope.document);
            self.check_xpath_elements(
                &mut xpath,
                AssertionCategory::SignedElements,
                self.signed,
                CoverageType::Signed,
                CoverageScope::Element,
            );
            self.check_xpath_elements(
                &mut xpath,
                AssertionCategory::EncryptedElements,
                self.encrypted,
                CoverageType::Encrypted,
                CoverageScope::Element,
            );
            self.check_xpath_elements(
                &mut xpath,
                AssertionCategory::ContentEncryptedElements,
                self.encrypted,
                CoverageType::Encrypted,
                CoverageScope::Content,
            );
        }

        self.check_required_parts();
        self.check_required_elements();
    }

    /// Transport-level protection replaces part-level requirements.
    fn is_transport_binding(&self) -> bool {
        if self.registry.contains(AssertionCategory::SymmetricBinding)
            || self.registry.contains(AssertionCategory::AsymmetricBinding)
        {
            return false;
        }
        if self.registry.contains(AssertionCategory::TransportBinding) {
            return true;
        }
        if self.message.context.tls_session.is_some() {
            debug!("No binding asserted, message arrived over TLS");
            self.registry.confirm_all(AssertionCategory::SignedParts);
            self.registry.confirm_all(AssertionCategory::EncryptedParts);
            return true;
        }
        false
    }

    fn contains_xpath_policy(&self) -> bool {
        self.registry.contains(AssertionCategory::SignedElements)
            || self.registry.contains(AssertionCategory::EncryptedElements)
            || self.registry.contains(AssertionCategory::ContentEncryptedElements)
    }

    fn check_protected_parts(&self, category: AssertionCategory, refs: &DataRefSet, kind: CoverageType) {
        for entry in self.registry.all_of(category) {
            entry.confirm();
            let Some(parts) = entry.assertion().protected_parts() else {
                continue;
            };
            for reason in check_parts(&self.message.envelope, &self.message.attachments, refs, parts, kind) {
                entry.falsify(reason);
            }
        }
    }

    fn check_xpath_elements(
        &self,
        xpath: &mut XPathEvaluator<'_>,
        category: AssertionCategory,
        refs: &DataRefSet,
        kind: CoverageType,
        scope: CoverageScope,
    ) {
        for entry in self.registry.all_of(category) {
            entry.confirm();
            let Some(elements) = entry.assertion().elements() else {
                continue;
            };
            if let Some(reason) = check_elements(xpath, &self.message.envelope, refs, elements, kind, scope) {
                entry.falsify(reason);
            }
        }
    }

    fn check_required_parts(&self) {
        let soap = &self.message.envelope;
        for entry in self.registry.all_of(AssertionCategory::RequiredParts) {
            entry.confirm();
            let SecurityAssertion::RequiredParts(parts) = entry.assertion() else {
                continue;
            };
            for name in &parts.headers {
                let present = soap
                    .header
                    .and_then(|h| soap.document.first_child_named(h, name))
                    .is_some();
                if !present {
                    entry.falsify(format!("No header element of name {} found.", name));
                }
            }
        }
    }

    fn check_required_elements(&self) {
        let soap = &self.message.envelope;
        for entry in self.registry.all_of(AssertionCategory::RequiredElements) {
            entry.confirm();
            let Some(elements) = entry.assertion().elements() else {
                continue;
            };
            for selector in &elements.xpaths {
                check_required_element(entry, soap, &selector.expression, &selector.namespaces);
            }
        }
    }
}

fn check_required_element(
    entry: &AssertionEntry,
    soap: &SoapDocument,
    expression: &str,
    namespaces: &BTreeMap<String, String>,
) {
    let mut xpath = XPathEvaluator::new(&soap.document);
    xpath.set_namespace_context(NamespaceContext::from(namespaces.clone()));

    let Some(header) = soap.header else {
        entry.falsify(format!("No header element matching XPath {} found.", expression));
        return;
    };
    match xpath.evaluate(expression, header) {
        Ok(nodes) if nodes.is_empty() => {
            entry.falsify(format!("No header element matching XPath {} found.", expression));
        }
        Ok(_) => {}
        Err(e) => entry.falsify(format!("Invalid XPath expression {} {}", expression, e)),
    }
}
