//! Integration tests for the zentinel-wss-policy crate.
//!
//! These tests exercise the public API surface end-to-end, combining
//! action computation, the security engine seam, coverage checks and
//! validation together.

use proptest::prelude::*;
use std::cell::Cell;
use zentinel_wss_policy::actions::ActionComputer;
use zentinel_wss_policy::assertion::RequirementMarker;
use zentinel_wss_policy::config::{FailAction, SoapVersion};
use zentinel_wss_policy::context::TlsSessionInfo;
use zentinel_wss_policy::coverage::reconcile_encrypted_signed_refs;
use zentinel_wss_policy::credentials::{
    CredentialProperties, CredentialProvider, KeystoreCredentials, PropertiesCredentialResolver,
};
use zentinel_wss_policy::parser::{parse_envelope, SoapDocument};
use zentinel_wss_policy::policy::{
    algorithms, AlgorithmSuite, AsymmetricBinding, ElementsRequirement, ProtectedParts, SymmetricBinding,
    TransportBinding, Trust13, XPathSelector,
};
use zentinel_wss_policy::results::{
    DataRefSet, DataReference, KeyReference, SignatureResult, SigningKey, SymmetricKeySource,
};
use zentinel_wss_policy::{
    AssertionCategory, AssertionRegistry, EnforcementOutcome, EnforcerConfig, EngineConfiguration,
    EngineOutcome, EngineResult, InboundMessage, MessageContext, PolicyEnforcer, PolicyError,
    SecurityAssertion,
};

// ============================================================================
// Helpers
// ============================================================================

const NS_TEST: &str = "urn:zentinel:test";

const PING: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
    xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"
    xmlns:t="urn:zentinel:test">
  <soap:Header/>
  <soap:Body wsu:Id="Body-1">
    <t:Ping>
      <t:Foo wsu:Id="Foo-1">one</t:Foo>
      <t:Foo wsu:Id="Foo-2">two</t:Foo>
      <t:Bar wsu:Id="Bar-1">three</t:Bar>
    </t:Ping>
  </soap:Body>
</soap:Envelope>"#;

fn message(policy: Vec<SecurityAssertion>) -> InboundMessage {
    InboundMessage::from_bytes(PING.as_bytes())
        .unwrap()
        .with_policy(policy.into_iter().collect())
}

fn hmac_signature(refs: Vec<DataReference>) -> EngineResult {
    EngineResult::Signature(SignatureResult {
        id: Some("SIG-1".to_string()),
        element: None,
        signature_method: algorithms::HMAC_SHA1.to_string(),
        c14n_method: algorithms::EXC_C14N.to_string(),
        key: SigningKey::Symmetric {
            token_id: None,
            source: SymmetricKeySource::EncryptedKey,
        },
        data_refs: refs,
    })
}

fn by_id(envelope: &SoapDocument, id: &str) -> DataReference {
    let element = envelope.document.element_by_wsu_id(id).unwrap();
    DataReference::element(element).with_wsu_id(format!("#{}", id))
}

fn keystore(file: &str) -> CredentialProperties {
    CredentialProperties::new()
        .with(KeystoreCredentials::PROVIDER, "merlin")
        .with(KeystoreCredentials::FILE, file)
}

fn foo_elements() -> ElementsRequirement {
    ElementsRequirement {
        xpaths: vec![XPathSelector::new("//t:Foo").with_namespace("t", NS_TEST)],
    }
}

// ============================================================================
// Full pipeline
// ============================================================================

#[test]
fn test_signed_body_accepted() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![
        SecurityAssertion::SymmetricBinding(SymmetricBinding::default()),
        SecurityAssertion::SignedParts(ProtectedParts {
            body: true,
            ..Default::default()
        }),
    ]);

    let engine = |envelope: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::new(vec![hmac_signature(vec![by_id(envelope, "Body-1")])]))
    };

    let outcome = enforcer.process(&mut msg, &engine).unwrap();
    assert_eq!(outcome, EnforcementOutcome::Accepted);

    let registry = msg.policy.as_ref().unwrap();
    let parts = registry.first_of(AssertionCategory::SignedParts).unwrap().verdict();
    assert!(parts.asserted);
    assert!(parts.confirmed);
}

#[test]
fn test_unsigned_body_rejected_with_fault() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![
        SecurityAssertion::SymmetricBinding(SymmetricBinding::default()),
        SecurityAssertion::SignedParts(ProtectedParts {
            body: true,
            ..Default::default()
        }),
    ]);

    let engine = |_: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::default())
    };

    let outcome = enforcer.process(&mut msg, &engine).unwrap();
    assert!(outcome.is_rejected());

    let error = outcome.into_result().unwrap_err();
    let fault = enforcer.fault_response(&error, Some(SoapVersion::Soap11));
    assert!(fault.contains("wsse:InvalidSecurity"));
    assert!(fault.contains("not signed"));
}

#[test]
fn test_allow_mode_accepts_violations() {
    let mut config = EnforcerConfig::default();
    config.settings.fail_action = FailAction::Allow;
    let enforcer = PolicyEnforcer::new(config);
    let mut msg = message(vec![SecurityAssertion::SignedElements(foo_elements())]);

    let engine = |_: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::default())
    };

    assert_eq!(enforcer.process(&mut msg, &engine).unwrap(), EnforcementOutcome::Accepted);
    assert!(!msg.policy.as_ref().unwrap().is_satisfied());
}

#[test]
fn test_no_policy_never_consults_registry_or_engine() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let calls = Cell::new(0);
    let engine = |_: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        calls.set(calls.get() + 1);
        Ok(EngineOutcome::default())
    };

    let mut msg = InboundMessage::from_bytes(PING.as_bytes()).unwrap();
    assert_eq!(enforcer.process(&mut msg, &engine).unwrap(), EnforcementOutcome::PassedThrough);
    assert_eq!(calls.get(), 0);

    let mut empty = message(Vec::new());
    let registry = empty.policy.as_ref().unwrap();
    assert_eq!(registry.query_count(), 0);
    assert!(enforcer.prepare(&mut empty).unwrap().is_some());
}

#[test]
fn test_streaming_leaves_policy_unqueried() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::SignedElements(foo_elements())]).with_context(MessageContext {
        enable_streaming: Some(true),
        ..Default::default()
    });

    assert!(enforcer.prepare(&mut msg).unwrap().is_none());
    assert_eq!(msg.policy.as_ref().unwrap().query_count(), 0);
}

// ============================================================================
// XPath element coverage
// ============================================================================

#[test]
fn test_signed_elements_every_match_covered() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::SignedElements(foo_elements())]);

    let engine = |envelope: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::new(vec![hmac_signature(vec![
            by_id(envelope, "Foo-1"),
            by_id(envelope, "Foo-2"),
        ])]))
    };

    enforcer.process(&mut msg, &engine).unwrap();
    let registry = msg.policy.as_ref().unwrap();
    assert!(registry.first_of(AssertionCategory::SignedElements).unwrap().is_asserted());
}

#[test]
fn test_signed_elements_partial_coverage_fails() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::SignedElements(foo_elements())]);

    let engine = |envelope: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::new(vec![hmac_signature(vec![
            by_id(envelope, "Foo-1"),
            by_id(envelope, "Bar-1"),
        ])]))
    };

    let outcome = enforcer.process(&mut msg, &engine).unwrap();
    let EnforcementOutcome::Rejected(violations) = outcome else {
        panic!("expected rejection");
    };
    let elements = violations
        .iter()
        .find(|v| v.category == AssertionCategory::SignedElements)
        .unwrap();
    assert_eq!(
        elements.reason,
        "No signed element found matching one of the XPaths [//t:Foo]"
    );
}

#[test]
fn test_signed_elements_by_local_name() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let policy = || {
        vec![SecurityAssertion::SignedElements(ElementsRequirement {
            xpaths: vec![XPathSelector::new("//*[local-name()='Bar']")],
        })]
    };

    let mut signed = message(policy());
    let engine = |envelope: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::new(vec![hmac_signature(vec![by_id(envelope, "Bar-1")])]))
    };
    assert_eq!(enforcer.process(&mut signed, &engine).unwrap(), EnforcementOutcome::Accepted);

    let mut unsigned = message(policy());
    let engine = |_: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::default())
    };
    let EnforcementOutcome::Rejected(violations) = enforcer.process(&mut unsigned, &engine).unwrap() else {
        panic!("expected rejection");
    };
    assert!(violations[0].reason.contains("//*[local-name()='Bar']"));
}

#[test]
fn test_xpath_without_matches_passes() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::EncryptedElements(ElementsRequirement {
        xpaths: vec![XPathSelector::new("//t:Missing").with_namespace("t", NS_TEST)],
    })]);

    let engine = |_: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::default())
    };

    enforcer.process(&mut msg, &engine).unwrap();
    let registry = msg.policy.as_ref().unwrap();
    assert!(registry.first_of(AssertionCategory::EncryptedElements).unwrap().is_asserted());
}

// ============================================================================
// Action computation
// ============================================================================

#[test]
fn test_asymmetric_signature_algorithm_override() {
    let config = EnforcerConfig::default();
    let mut registry: AssertionRegistry = vec![
        SecurityAssertion::AsymmetricBinding(AsymmetricBinding::default()),
        SecurityAssertion::AlgorithmSuite(AlgorithmSuite::basic256()),
    ]
    .into_iter()
    .collect();
    let context = MessageContext {
        asymmetric_signature_algorithm: Some(algorithms::RSA_SHA512.to_string()),
        ..Default::default()
    };

    let engine = ActionComputer::new(&config, &PropertiesCredentialResolver)
        .compute(&mut registry, &context)
        .unwrap();
    let suite = engine.algorithm_suite.unwrap();
    assert_eq!(suite.signature_methods, vec![algorithms::RSA_SHA512.to_string()]);
    assert!(!suite.accepts_signature(algorithms::RSA_SHA1));
}

#[test]
fn test_trust13_alone_confirms_trust10_markers() {
    let config = EnforcerConfig::default();
    let mut registry: AssertionRegistry = vec![SecurityAssertion::Trust13(Trust13 {
        require_applies_to: true,
        ..Default::default()
    })]
    .into_iter()
    .collect();
    // Markers a policy source registered on its own
    for marker in RequirementMarker::TRUST10 {
        registry.insert(SecurityAssertion::Requirement(marker));
    }

    ActionComputer::new(&config, &PropertiesCredentialResolver)
        .compute(&mut registry, &MessageContext::default())
        .unwrap();

    for marker in RequirementMarker::TRUST10.iter().chain(&[RequirementMarker::RequireAppliesTo]) {
        let entry = registry.first_of(AssertionCategory::Requirement(*marker)).unwrap();
        assert!(entry.verdict().confirmed, "{} not confirmed", marker.as_str());
    }
}

#[test]
fn test_symmetric_credentials_follow_direction() {
    let config = EnforcerConfig::default();
    let policy = || -> AssertionRegistry {
        vec![SecurityAssertion::SymmetricBinding(SymmetricBinding::default())]
            .into_iter()
            .collect()
    };
    let context = |is_requestor| MessageContext {
        is_requestor,
        signature_properties: Some(keystore("sign.jks")),
        encryption_properties: Some(keystore("enc.jks")),
        ..Default::default()
    };
    let computer = ActionComputer::new(&config, &PropertiesCredentialResolver);
    let name = |p: &Option<std::sync::Arc<dyn CredentialProvider>>| {
        p.as_ref().map(|p| p.name().to_string()).unwrap()
    };

    let requestor = computer.compute(&mut policy(), &context(true)).unwrap();
    assert_eq!(name(&requestor.credentials.signature_verification), "merlin:enc.jks");
    assert_eq!(name(&requestor.credentials.decryption), "merlin:sign.jks");

    let responder = computer.compute(&mut policy(), &context(false)).unwrap();
    assert_eq!(name(&responder.credentials.signature_verification), "merlin:sign.jks");
    assert_eq!(name(&responder.credentials.decryption), "merlin:enc.jks");
}

#[test]
fn test_incomplete_keystore_properties_fail_resolution() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::AsymmetricBinding(AsymmetricBinding::default())]).with_context(
        MessageContext {
            signature_properties: Some(CredentialProperties::new().with(KeystoreCredentials::FILE, "a.jks")),
            ..Default::default()
        },
    );

    let err = enforcer.prepare(&mut msg).unwrap_err();
    assert!(matches!(err, PolicyError::CredentialResolution { .. }));
    let fault = enforcer.fault_response(&err, None);
    assert!(fault.contains("SecurityTokenUnavailable"));
}

// ============================================================================
// Transport binding
// ============================================================================

#[test]
fn test_transport_binding_skips_message_coverage() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![
        SecurityAssertion::TransportBinding(TransportBinding::default()),
        SecurityAssertion::SignedParts(ProtectedParts {
            body: true,
            ..Default::default()
        }),
        SecurityAssertion::EncryptedParts(ProtectedParts {
            body: true,
            ..Default::default()
        }),
    ])
    .with_context(MessageContext {
        tls_session: Some(TlsSessionInfo {
            cipher_suite: "TLS_AES_128_GCM_SHA256".to_string(),
            client_certificate: None,
        }),
        ..Default::default()
    });

    let engine = |_: &mut SoapDocument, configuration: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        assert_eq!(configuration.actions.to_string(), "Encrypt Signature");
        Ok(EngineOutcome::default())
    };

    assert_eq!(enforcer.process(&mut msg, &engine).unwrap(), EnforcementOutcome::Accepted);
    let registry = msg.policy.as_ref().unwrap();
    assert!(registry.first_of(AssertionCategory::SignedParts).unwrap().is_asserted());
    assert!(registry.first_of(AssertionCategory::EncryptedParts).unwrap().is_asserted());
    assert!(registry.first_of(AssertionCategory::TransportBinding).unwrap().verdict().confirmed);
}

#[test]
fn test_transport_binding_without_tls_rejected() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::TransportBinding(TransportBinding::default())]);

    let engine = |_: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        Ok(EngineOutcome::default())
    };

    let EnforcementOutcome::Rejected(violations) = enforcer.process(&mut msg, &engine).unwrap() else {
        panic!("expected rejection");
    };
    assert_eq!(violations[0].category, AssertionCategory::TransportBinding);
    assert_eq!(violations[0].reason, "Transport binding requires a TLS session");
}

// ============================================================================
// Signature over encrypted data
// ============================================================================

#[test]
fn test_signature_over_encrypted_body_counts_as_signed() {
    let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
    let mut msg = message(vec![SecurityAssertion::SignedParts(ProtectedParts {
        body: true,
        ..Default::default()
    })]);

    // The signature references the EncryptedData id; the encryption result
    // carries the same id and points at the decrypted Body.
    let engine = |envelope: &mut SoapDocument, _: &EngineConfiguration| -> Result<EngineOutcome, PolicyError> {
        let body = envelope.body;
        Ok(EngineOutcome::new(vec![
            EngineResult::Signature(SignatureResult {
                id: Some("SIG-1".to_string()),
                element: None,
                signature_method: algorithms::RSA_SHA1.to_string(),
                c14n_method: algorithms::EXC_C14N.to_string(),
                key: SigningKey::X509 {
                    token_id: None,
                    reference: KeyReference::IssuerSerial,
                    key_length_bits: 2048,
                },
                data_refs: vec![DataReference {
                    wsu_id: Some("#ED-1".to_string()),
                    element: None,
                    content: false,
                    attachment_id: None,
                    algorithm: None,
                    digest_algorithm: Some(algorithms::SHA1.to_string()),
                    transforms: Vec::new(),
                }],
            }),
            EngineResult::Encryption(zentinel_wss_policy::results::EncryptionResult {
                key_wrap_algorithm: Some(algorithms::KW_RSA_OAEP.to_string()),
                data_refs: vec![DataReference::element(body).with_wsu_id("ED-1")],
            }),
        ]))
    };

    enforcer.process(&mut msg, &engine).unwrap();
    let registry = msg.policy.as_ref().unwrap();
    assert!(registry.first_of(AssertionCategory::SignedParts).unwrap().is_asserted());
}

proptest! {
    #[test]
    fn reconcile_is_idempotent(
        signed_ids in proptest::collection::vec(0usize..4, 0..4),
        encrypted_ids in proptest::collection::vec(0usize..4, 0..4),
        hashed in proptest::bool::ANY,
    ) {
        let envelope = parse_envelope(PING.as_bytes()).unwrap();
        let ids = ["Body-1", "Foo-1", "Foo-2", "Bar-1"];

        let mut signed: DataRefSet = signed_ids
            .iter()
            .map(|i| {
                let id = if hashed { format!("#{}", ids[*i]) } else { ids[*i].to_string() };
                DataReference {
                    wsu_id: Some(id),
                    element: None,
                    content: false,
                    attachment_id: None,
                    algorithm: None,
                    digest_algorithm: None,
                    transforms: Vec::new(),
                }
            })
            .collect();
        let encrypted: DataRefSet = encrypted_ids.iter().map(|i| by_id(&envelope, ids[*i])).collect();

        reconcile_encrypted_signed_refs(&mut signed, &encrypted);
        let once = signed.clone();
        reconcile_encrypted_signed_refs(&mut signed, &encrypted);
        prop_assert_eq!(once, signed);
    }
}
