//! Error types for WS-SecurityPolicy enforcement.

use crate::assertion::AssertionCategory;
use crate::config::SoapVersion;
use crate::credentials::CredentialRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Policy enforcement errors.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("cannot resolve {role} credentials: {reason}")]
    CredentialResolution { role: CredentialRole, reason: String },

    #[error("security policy violated: {}", summarize(.violations))]
    PolicyViolation { violations: Vec<PolicyViolation> },

    #[error("malformed XPath expression '{expression}': {reason}")]
    MalformedXPath { expression: String, reason: String },

    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("security engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    /// WS-Security fault code a collaborator should surface for this error.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            Self::CredentialResolution { .. } => FaultCode::SecurityTokenUnavailable,
            Self::Engine(_) => FaultCode::FailedCheck,
            _ => FaultCode::InvalidSecurity,
        }
    }
}

fn summarize(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Standard WS-Security fault codes (WSS 1.1 SOAP Message Security, section 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// An error was discovered processing the Security header
    InvalidSecurity,
    /// An invalid security token was provided
    InvalidSecurityToken,
    /// The security token could not be authenticated or authorized
    FailedAuthentication,
    /// The signature or decryption was invalid
    FailedCheck,
    /// Referenced security token could not be retrieved
    SecurityTokenUnavailable,
    /// An unsupported signature or encryption algorithm was used
    UnsupportedAlgorithm,
}

impl FaultCode {
    /// Get the local part of the fault code QName.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSecurity => "InvalidSecurity",
            Self::InvalidSecurityToken => "InvalidSecurityToken",
            Self::FailedAuthentication => "FailedAuthentication",
            Self::FailedCheck => "FailedCheck",
            Self::SecurityTokenUnavailable => "SecurityTokenUnavailable",
            Self::UnsupportedAlgorithm => "UnsupportedAlgorithm",
        }
    }
}

/// A policy assertion that was not satisfied by the inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Category of the failed assertion
    pub category: AssertionCategory,
    /// Human-readable reason recorded when the verdict was falsified
    pub reason: String,
}

impl PolicyViolation {
    /// Create a new violation.
    pub fn new(category: AssertionCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category, self.reason)
    }
}

const WSSE_FAULT_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

/// Generate a SOAP Fault response for a rejected message.
pub fn security_fault_response(
    code: FaultCode,
    violations: &[PolicyViolation],
    soap_version: Option<SoapVersion>,
) -> String {
    match soap_version.unwrap_or(SoapVersion::Soap11) {
        SoapVersion::Soap11 => soap_11_fault(code, violations),
        SoapVersion::Soap12 => soap_12_fault(code, violations),
    }
}

fn fault_reason(violations: &[PolicyViolation]) -> String {
    if violations.is_empty() {
        "An error was discovered processing the <wsse:Security> header".to_string()
    } else {
        summarize(violations)
    }
}

fn violation_details(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(|v| {
            format!(
                "          <zentinel:violation assertion=\"{}\">{}</zentinel:violation>",
                v.category,
                xml_escape(&v.reason)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn soap_11_fault(code: FaultCode, violations: &[PolicyViolation]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode xmlns:wsse="{}">wsse:{}</faultcode>
      <faultstring>{}</faultstring>
      <detail>
        <zentinel:violations xmlns:zentinel="urn:zentinel:wss:policy">
{}
        </zentinel:violations>
      </detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        WSSE_FAULT_NS,
        code.as_str(),
        xml_escape(&fault_reason(violations)),
        violation_details(violations)
    )
}

fn soap_12_fault(code: FaultCode, violations: &[PolicyViolation]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>soap:Sender</soap:Value>
        <soap:Subcode>
          <soap:Value xmlns:wsse="{}">wsse:{}</soap:Value>
        </soap:Subcode>
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">{}</soap:Text>
      </soap:Reason>
      <soap:Detail>
        <zentinel:violations xmlns:zentinel="urn:zentinel:wss:policy">
{}
        </zentinel:violations>
      </soap:Detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        WSSE_FAULT_NS,
        code.as_str(),
        xml_escape(&fault_reason(violations)),
        violation_details(violations)
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_code_as_str() {
        assert_eq!(FaultCode::InvalidSecurity.as_str(), "InvalidSecurity");
        assert_eq!(FaultCode::FailedCheck.as_str(), "FailedCheck");
    }

    #[test]
    fn test_soap_11_fault() {
        let violations = vec![PolicyViolation::new(
            AssertionCategory::SignedParts,
            "{http://schemas.xmlsoap.org/soap/envelope/}Body not signed",
        )];
        let fault = security_fault_response(
            FaultCode::InvalidSecurity,
            &violations,
            Some(SoapVersion::Soap11),
        );
        assert!(fault.contains("http://schemas.xmlsoap.org/soap/envelope/"));
        assert!(fault.contains("wsse:InvalidSecurity"));
        assert!(fault.contains("assertion=\"SignedParts\""));
        assert!(fault.contains("Body not signed"));
    }

    #[test]
    fn test_soap_12_fault() {
        let violations = vec![PolicyViolation::new(
            AssertionCategory::UsernameToken,
            "Password hashing policy not enforced",
        )];
        let fault = security_fault_response(
            FaultCode::FailedAuthentication,
            &violations,
            Some(SoapVersion::Soap12),
        );
        assert!(fault.contains("http://www.w3.org/2003/05/soap-envelope"));
        assert!(fault.contains("soap:Sender"));
        assert!(fault.contains("wsse:FailedAuthentication"));
    }

    #[test]
    fn test_fault_escapes_reason() {
        let violations = vec![PolicyViolation::new(
            AssertionCategory::RequiredElements,
            "No header element matching XPath //*[local-name()='To'] found.",
        )];
        let fault = security_fault_response(FaultCode::InvalidSecurity, &violations, None);
        assert!(fault.contains("local-name()=&apos;To&apos;"));
    }

    #[test]
    fn test_policy_violation_error_message() {
        let err = PolicyError::PolicyViolation {
            violations: vec![
                PolicyViolation::new(AssertionCategory::SignedParts, "a"),
                PolicyViolation::new(AssertionCategory::EncryptedParts, "b"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "security policy violated: [SignedParts] a; [EncryptedParts] b"
        );
        assert_eq!(err.fault_code(), FaultCode::InvalidSecurity);
    }
}
