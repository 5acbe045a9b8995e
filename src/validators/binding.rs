//! Binding validators: Transport, Symmetric, Asymmetric, AlgorithmSuite and
//! Layout.

use super::{settle, ValidatorParameters};
use crate::assertion::{AssertionCategory, AssertionEntry, SecurityAssertion};
use crate::parser::NodeId;
use crate::policy::{AlgorithmSuite, BindingProperties, LayoutKind, ProtectionOrder};
use crate::results::{EngineResult, ResultAction, SignatureResult};

fn check_timestamp(params: &ValidatorParameters<'_>, properties: &BindingProperties, reasons: &mut Vec<String>) {
    if !properties.include_timestamp {
        return;
    }
    let timestamps = params.registry.all_of(AssertionCategory::IncludeTimestamp);
    if params.timestamp.is_some() {
        timestamps.iter().for_each(AssertionEntry::confirm);
    } else {
        let reason = "Received message does not contain a required Timestamp";
        timestamps.iter().for_each(|e| e.falsify(reason));
        reasons.push(reason.to_string());
    }
}

fn first_index(params: &ValidatorParameters<'_>, action: ResultAction) -> Option<usize> {
    params.results.iter().position(|r| r.action() == action)
}

fn is_signature_element(params: &ValidatorParameters<'_>, element: NodeId) -> bool {
    params.signatures().any(|s| s.element == Some(element))
}

/// Signed elements must be the Body or a direct child of the Header.
fn signs_only_entire_parts(params: &ValidatorParameters<'_>) -> bool {
    let soap = params.soap();
    params.signed_refs.iter().all(|r| {
        let Some(element) = r.element else {
            return true;
        };
        let in_security_header = soap.security_header.is_some_and(|security| {
            let mut current = Some(element);
            while let Some(node) = current {
                if node == security {
                    return true;
                }
                current = soap.document.parent(node);
            }
            false
        });
        if in_security_header || is_signature_element(params, element) {
            return true;
        }
        let entire_part = element == soap.body || (soap.header.is_some() && soap.document.parent(element) == soap.header);
        entire_part && !r.content
    })
}

/// Checks every message-level binding shares.
fn check_common(params: &ValidatorParameters<'_>, properties: &BindingProperties, reasons: &mut Vec<String>) {
    check_timestamp(params, properties, reasons);

    let signature_index = first_index(params, ResultAction::Signature);
    let encryption_index = first_index(params, ResultAction::Encryption);
    if let (Some(signature_index), Some(encryption_index)) = (signature_index, encryption_index) {
        match properties.protection_order {
            ProtectionOrder::SignBeforeEncrypting if signature_index < encryption_index => {
                reasons.push("Not signed before encrypted".to_string());
            }
            ProtectionOrder::EncryptBeforeSigning if encryption_index < signature_index => {
                reasons.push("Not encrypted before signed".to_string());
            }
            _ => {}
        }
    }

    let primary = params.primary_signature();
    if properties.encrypt_signature {
        let encrypted = primary
            .and_then(|s| s.element)
            .is_some_and(|e| params.encrypted_refs.iter().any(|r| r.element == Some(e)));
        if !encrypted {
            reasons.push("The signature is not protected".to_string());
        }
    }
    if properties.protect_tokens {
        if let Some(signature) = primary {
            if let Some(token_id) = signature.key.token_id() {
                if !signature.covers_id(token_id) {
                    reasons.push("The signature does not protect the signing token".to_string());
                }
            }
        }
    }
    if properties.only_sign_entire_headers_and_body && !signs_only_entire_parts(params) {
        reasons.push("OnlySignEntireHeadersAndBody not enforced".to_string());
    }
}

pub(super) fn validate_transport(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    for entry in assertions {
        let SecurityAssertion::TransportBinding(binding) = entry.assertion() else {
            continue;
        };
        let mut reasons = Vec::new();
        match &params.message.context.tls_session {
            None => reasons.push("Transport binding requires a TLS session".to_string()),
            Some(tls) => {
                let wants_certificate = binding
                    .transport_token
                    .as_ref()
                    .is_some_and(|t| t.require_client_certificate);
                if wants_certificate && tls.client_certificate.is_none() {
                    reasons.push("HTTPS client certificate required".to_string());
                }
            }
        }
        check_timestamp(params, &binding.properties, &mut reasons);
        settle(entry, reasons);
    }
}

fn validate_message_binding(
    params: &ValidatorParameters<'_>,
    assertions: &[AssertionEntry],
    symmetric: bool,
) {
    for entry in assertions {
        let Some(properties) = entry.assertion().binding_properties() else {
            continue;
        };
        let mut reasons = Vec::new();
        check_common(params, properties, &mut reasons);

        if let Some(signature) = params.primary_signature() {
            if symmetric && !signature.key.is_symmetric() {
                reasons.push("Symmetric binding requires a symmetric signing key".to_string());
            }
            if !symmetric && !signature.key.is_asymmetric() {
                reasons.push("Asymmetric binding requires an asymmetric signing key".to_string());
            }
        }
        settle(entry, reasons);
    }
}

pub(super) fn validate_symmetric(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    validate_message_binding(params, assertions, true);
}

pub(super) fn validate_asymmetric(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    validate_message_binding(params, assertions, false);
}

fn check_signature_algorithms(suite: &AlgorithmSuite, signature: &SignatureResult, reasons: &mut Vec<String>) {
    let method_ok = if signature.key.is_symmetric() {
        signature.signature_method == suite.symmetric_signature
    } else {
        suite.signature_methods.iter().any(|m| *m == signature.signature_method)
    };
    if !method_ok {
        reasons.push(format!(
            "The signature method {} does not match the requirement",
            signature.signature_method
        ));
    }
    if signature.c14n_method != suite.c14n {
        reasons.push(format!(
            "The c14n method {} does not match the requirement",
            signature.c14n_method
        ));
    }
    for digest in signature.data_refs.iter().filter_map(|r| r.digest_algorithm.as_deref()) {
        if digest != suite.digest {
            reasons.push(format!("The digest method {} does not match the requirement", digest));
        }
    }
    if let Some(length) = signature.key.asymmetric_key_length() {
        if length < suite.min_asymmetric_key_length || length > suite.max_asymmetric_key_length {
            reasons.push(format!("The asymmetric key length {} does not match the requirement", length));
        }
    }
}

pub(super) fn validate_algorithm_suite(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    for entry in assertions {
        let SecurityAssertion::AlgorithmSuite(suite) = entry.assertion() else {
            continue;
        };
        let mut reasons = Vec::new();
        for signature in params.signatures() {
            check_signature_algorithms(suite, signature, &mut reasons);
        }
        for result in &params.encrypted_results {
            let EngineResult::Encryption(encryption) = result else {
                continue;
            };
            for algorithm in encryption.data_refs.iter().filter_map(|r| r.algorithm.as_deref()) {
                if algorithm != suite.encryption {
                    reasons.push(format!("The encryption algorithm {} does not match the requirement", algorithm));
                }
            }
            if let Some(key_wrap) = encryption.key_wrap_algorithm.as_deref() {
                if !suite.accepts_key_wrap(key_wrap) {
                    reasons.push(format!("The key transport method {} does not match the requirement", key_wrap));
                }
            }
        }
        reasons.dedup();
        settle(entry, reasons);
    }
}

pub(super) fn validate_layout(params: &ValidatorParameters<'_>, assertions: &[AssertionEntry]) {
    let timestamp_index = first_index(params, ResultAction::Timestamp);
    let last = params.results.len().checked_sub(1);

    for entry in assertions {
        let SecurityAssertion::Layout(kind) = entry.assertion() else {
            continue;
        };
        let satisfied = match kind {
            LayoutKind::Lax => true,
            LayoutKind::LaxTsFirst => timestamp_index == Some(0),
            LayoutKind::LaxTsLast => timestamp_index.is_some() && timestamp_index == last,
            LayoutKind::Strict => {
                timestamp_index.map_or(true, |i| i == 0) && tokens_precede_signatures(params)
            }
        };
        if satisfied {
            entry.confirm();
        } else {
            entry.falsify(format!("Layout {:?} does not match the security header", kind));
        }
    }
}

/// Every signing token must be processed before the signature using it.
fn tokens_precede_signatures(params: &ValidatorParameters<'_>) -> bool {
    params.results.iter().enumerate().all(|(index, result)| {
        let Some(token_id) = result.as_signature().and_then(|s| s.key.token_id()) else {
            return true;
        };
        let token_id = token_id.trim_start_matches('#');
        params
            .results
            .iter()
            .position(|r| r.token_id() == Some(token_id))
            .map_or(true, |token_index| token_index < index)
    })
}
