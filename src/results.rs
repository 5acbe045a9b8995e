//! What the security engine reports after processing a message.
//!
//! Results are listed in processing order. Signature and encryption results
//! carry the [`DataReference`]s they protected; token results point at the
//! token element inside the (decrypted) document.

use crate::parser::NodeId;
use crate::policy::{SamlVersion, X509TokenType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Locator of one protected message fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataReference {
    /// `wsu:Id` the reference was made through, if any
    pub wsu_id: Option<String>,
    /// Protected element; `None` for attachments
    pub element: Option<NodeId>,
    /// Only the element's content was protected
    pub content: bool,
    /// `cid:` URI for attachment references
    pub attachment_id: Option<String>,
    /// Data encryption algorithm (encryption references)
    pub algorithm: Option<String>,
    /// Digest algorithm (signature references)
    pub digest_algorithm: Option<String>,
    pub transforms: Vec<String>,
}

impl DataReference {
    pub fn element(element: NodeId) -> Self {
        Self {
            wsu_id: None,
            element: Some(element),
            content: false,
            attachment_id: None,
            algorithm: None,
            digest_algorithm: None,
            transforms: Vec::new(),
        }
    }

    pub fn content(element: NodeId) -> Self {
        Self {
            content: true,
            ..Self::element(element)
        }
    }

    pub fn attachment(cid: impl Into<String>) -> Self {
        Self {
            wsu_id: None,
            element: None,
            content: false,
            attachment_id: Some(cid.into()),
            algorithm: None,
            digest_algorithm: None,
            transforms: Vec::new(),
        }
    }

    pub fn with_wsu_id(mut self, id: impl Into<String>) -> Self {
        self.wsu_id = Some(id.into());
        self
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }

    pub fn with_digest_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.digest_algorithm = Some(algorithm.into());
        self
    }

    pub fn with_content(mut self, content: bool) -> Self {
        self.content = content;
        self
    }

    /// The wsu:Id without a leading `#`.
    pub fn bare_id(&self) -> Option<&str> {
        self.wsu_id.as_deref().map(|id| id.trim_start_matches('#'))
    }
}

/// Set of protected fragments; duplicates collapse.
pub type DataRefSet = BTreeSet<DataReference>;

/// How an X.509 signing certificate was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyReference {
    DirectReference,
    IssuerSerial,
    Thumbprint,
    KeyIdentifier,
    Embedded,
}

/// Where a symmetric signing key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymmetricKeySource {
    EncryptedKey,
    SecurityContextToken,
    DerivedKey,
    Kerberos,
}

/// The key a signature was made with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SigningKey {
    X509 {
        #[serde(default)]
        token_id: Option<String>,
        reference: KeyReference,
        key_length_bits: u32,
    },
    KeyValue {
        key_length_bits: u32,
    },
    Symmetric {
        #[serde(default)]
        token_id: Option<String>,
        source: SymmetricKeySource,
    },
    /// Key derived from a UsernameToken
    UsernameToken { token_id: String },
    /// Holder-of-key confirmation key of a SAML assertion
    SamlAssertion {
        token_id: String,
        #[serde(default)]
        symmetric: bool,
    },
}

impl SigningKey {
    pub fn is_symmetric(&self) -> bool {
        match self {
            Self::Symmetric { .. } | Self::UsernameToken { .. } => true,
            Self::SamlAssertion { symmetric, .. } => *symmetric,
            Self::X509 { .. } | Self::KeyValue { .. } => false,
        }
    }

    pub fn is_asymmetric(&self) -> bool {
        !self.is_symmetric()
    }

    /// Id of the token that supplied the key.
    pub fn token_id(&self) -> Option<&str> {
        match self {
            Self::X509 { token_id, .. } | Self::Symmetric { token_id, .. } => token_id.as_deref(),
            Self::UsernameToken { token_id } | Self::SamlAssertion { token_id, .. } => Some(token_id),
            Self::KeyValue { .. } => None,
        }
    }

    pub fn asymmetric_key_length(&self) -> Option<u32> {
        match self {
            Self::X509 { key_length_bits, .. } | Self::KeyValue { key_length_bits } => Some(*key_length_bits),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureResult {
    pub id: Option<String>,
    pub element: Option<NodeId>,
    pub signature_method: String,
    pub c14n_method: String,
    pub key: SigningKey,
    pub data_refs: Vec<DataReference>,
}

impl SignatureResult {
    /// Whether one of the references covers the element with the given id.
    pub fn covers_id(&self, id: &str) -> bool {
        let id = id.trim_start_matches('#');
        self.data_refs.iter().any(|r| r.bare_id() == Some(id))
    }

    pub fn covers_element(&self, element: NodeId) -> bool {
        self.data_refs.iter().any(|r| r.element == Some(element))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionResult {
    pub key_wrap_algorithm: Option<String>,
    pub data_refs: Vec<DataReference>,
}

/// Password form found in a UsernameToken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordKind {
    Text,
    Digest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsernameTokenResult {
    pub id: Option<String>,
    pub element: Option<NodeId>,
    pub username: String,
    pub password: Option<PasswordKind>,
    /// The engine checked the password itself
    pub password_verified: bool,
    pub nonce: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamlConfirmation {
    Bearer,
    HolderOfKey,
    SenderVouches,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamlTokenResult {
    pub id: Option<String>,
    pub element: Option<NodeId>,
    pub version: SamlVersion,
    /// The assertion carried its own signature
    pub signed: bool,
    pub confirmation: SamlConfirmation,
    pub data_refs: Vec<DataReference>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimestampResult {
    pub id: Option<String>,
    pub element: Option<NodeId>,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct X509TokenResult {
    pub id: Option<String>,
    pub element: Option<NodeId>,
    pub token_type: X509TokenType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityContextTokenResult {
    pub id: Option<String>,
    pub element: Option<NodeId>,
    /// Referenced by an external URI rather than included
    pub external_reference: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureConfirmationResult {
    pub value: Option<String>,
}

/// Operation kind a result was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultAction {
    Signature,
    UsernameTokenSignature,
    Encryption,
    UsernameToken,
    UsernameTokenNoPassword,
    SamlTokenSigned,
    SamlTokenUnsigned,
    Timestamp,
    BinarySecurityToken,
    SecurityContextToken,
    SignatureConfirmation,
}

/// One record of the engine's output.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineResult {
    Signature(SignatureResult),
    Encryption(EncryptionResult),
    UsernameToken(UsernameTokenResult),
    SamlToken(SamlTokenResult),
    Timestamp(TimestampResult),
    X509Token(X509TokenResult),
    SecurityContextToken(SecurityContextTokenResult),
    SignatureConfirmation(SignatureConfirmationResult),
}

impl EngineResult {
    pub fn action(&self) -> ResultAction {
        match self {
            Self::Signature(s) => match s.key {
                SigningKey::UsernameToken { .. } => ResultAction::UsernameTokenSignature,
                _ => ResultAction::Signature,
            },
            Self::Encryption(_) => ResultAction::Encryption,
            Self::UsernameToken(ut) if ut.password.is_none() => ResultAction::UsernameTokenNoPassword,
            Self::UsernameToken(_) => ResultAction::UsernameToken,
            Self::SamlToken(saml) if saml.signed => ResultAction::SamlTokenSigned,
            Self::SamlToken(_) => ResultAction::SamlTokenUnsigned,
            Self::Timestamp(_) => ResultAction::Timestamp,
            Self::X509Token(_) => ResultAction::BinarySecurityToken,
            Self::SecurityContextToken(_) => ResultAction::SecurityContextToken,
            Self::SignatureConfirmation(_) => ResultAction::SignatureConfirmation,
        }
    }

    /// Protected references carried by this result.
    pub fn data_refs(&self) -> &[DataReference] {
        match self {
            Self::Signature(s) => &s.data_refs,
            Self::Encryption(e) => &e.data_refs,
            Self::SamlToken(s) => &s.data_refs,
            _ => &[],
        }
    }

    /// Element of the token this result describes, if it is a token.
    pub fn token_element(&self) -> Option<NodeId> {
        match self {
            Self::UsernameToken(r) => r.element,
            Self::SamlToken(r) => r.element,
            Self::X509Token(r) => r.element,
            Self::SecurityContextToken(r) => r.element,
            _ => None,
        }
    }

    pub fn token_id(&self) -> Option<&str> {
        match self {
            Self::UsernameToken(r) => r.id.as_deref(),
            Self::SamlToken(r) => r.id.as_deref(),
            Self::X509Token(r) => r.id.as_deref(),
            Self::SecurityContextToken(r) => r.id.as_deref(),
            _ => None,
        }
    }

    pub fn as_signature(&self) -> Option<&SignatureResult> {
        match self {
            Self::Signature(s) => Some(s),
            _ => None,
        }
    }
}

/// The engine's full output for one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutcome {
    pub results: Vec<EngineResult>,
    /// Password checks were left to an external callback
    pub ut_with_callbacks: bool,
}

impl EngineOutcome {
    pub fn new(results: Vec<EngineResult>) -> Self {
        Self {
            results,
            ut_with_callbacks: false,
        }
    }

    /// All results whose action is one of `actions`, in processing order.
    pub fn fetch_all(&self, actions: &[ResultAction]) -> Vec<&EngineResult> {
        self.results
            .iter()
            .filter(|r| actions.contains(&r.action()))
            .collect()
    }

    pub fn fetch_first(&self, action: ResultAction) -> Option<&EngineResult> {
        self.results.iter().find(|r| r.action() == action)
    }

    pub fn signed_results(&self) -> Vec<&EngineResult> {
        self.fetch_all(&[
            ResultAction::Signature,
            ResultAction::UsernameTokenSignature,
            ResultAction::SamlTokenSigned,
        ])
    }

    pub fn encrypted_results(&self) -> Vec<&EngineResult> {
        self.fetch_all(&[ResultAction::Encryption])
    }

    pub fn username_token_results(&self) -> Vec<&EngineResult> {
        self.fetch_all(&[ResultAction::UsernameToken, ResultAction::UsernameTokenNoPassword])
    }

    pub fn saml_results(&self) -> Vec<&EngineResult> {
        self.fetch_all(&[ResultAction::SamlTokenSigned, ResultAction::SamlTokenUnsigned])
    }

    pub fn timestamp(&self) -> Option<&TimestampResult> {
        match self.fetch_first(ResultAction::Timestamp) {
            Some(EngineResult::Timestamp(ts)) => Some(ts),
            _ => None,
        }
    }

    pub fn signatures(&self) -> impl Iterator<Item = &SignatureResult> {
        self.results.iter().filter_map(EngineResult::as_signature)
    }

    pub fn signed_refs(&self) -> DataRefSet {
        collect_refs(&self.signed_results())
    }

    pub fn encrypted_refs(&self) -> DataRefSet {
        collect_refs(&self.encrypted_results())
    }
}

fn collect_refs(results: &[&EngineResult]) -> DataRefSet {
    results
        .iter()
        .flat_map(|r| r.data_refs().iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_envelope;

    const MSG: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header/>
  <soap:Body><Ping/></soap:Body>
</soap:Envelope>"#;

    fn signature(key: SigningKey, refs: Vec<DataReference>) -> EngineResult {
        EngineResult::Signature(SignatureResult {
            id: Some("SIG-1".to_string()),
            element: None,
            signature_method: "urn:rsa".to_string(),
            c14n_method: "urn:c14n".to_string(),
            key,
            data_refs: refs,
        })
    }

    #[test]
    fn test_result_actions() {
        let ut_sig = signature(
            SigningKey::UsernameToken {
                token_id: "UT-1".to_string(),
            },
            vec![],
        );
        assert_eq!(ut_sig.action(), ResultAction::UsernameTokenSignature);

        let ut = EngineResult::UsernameToken(UsernameTokenResult {
            id: None,
            element: None,
            username: "alice".to_string(),
            password: None,
            password_verified: false,
            nonce: None,
            created: None,
        });
        assert_eq!(ut.action(), ResultAction::UsernameTokenNoPassword);
    }

    #[test]
    fn test_signed_refs_collapse_duplicates() {
        let soap = parse_envelope(MSG.as_bytes()).unwrap();
        let body = DataReference::element(soap.body).with_wsu_id("#Body");
        let key = SigningKey::KeyValue { key_length_bits: 2048 };
        let outcome = EngineOutcome::new(vec![
            signature(key.clone(), vec![body.clone()]),
            signature(key, vec![body.clone()]),
            EngineResult::Encryption(EncryptionResult {
                key_wrap_algorithm: None,
                data_refs: vec![DataReference::content(soap.body)],
            }),
        ]);
        assert_eq!(outcome.signed_refs().len(), 1);
        assert_eq!(outcome.encrypted_refs().len(), 1);
        assert_eq!(outcome.signed_results().len(), 2);
        assert!(outcome.timestamp().is_none());
    }

    #[test]
    fn test_signing_key_kinds() {
        let x509 = SigningKey::X509 {
            token_id: Some("X509-1".to_string()),
            reference: KeyReference::IssuerSerial,
            key_length_bits: 2048,
        };
        assert!(x509.is_asymmetric());
        assert_eq!(x509.token_id(), Some("X509-1"));
        assert_eq!(x509.asymmetric_key_length(), Some(2048));

        let hok = SigningKey::SamlAssertion {
            token_id: "SAML-1".to_string(),
            symmetric: true,
        };
        assert!(hok.is_symmetric());
        assert_eq!(hok.asymmetric_key_length(), None);
    }

    #[test]
    fn test_signature_covers_id() {
        let soap = parse_envelope(MSG.as_bytes()).unwrap();
        let sig = signature(
            SigningKey::KeyValue { key_length_bits: 1024 },
            vec![DataReference::element(soap.body).with_wsu_id("#TS-1")],
        );
        let sig = sig.as_signature().unwrap();
        assert!(sig.covers_id("TS-1"));
        assert!(sig.covers_id("#TS-1"));
        assert!(!sig.covers_id("TS-2"));
        assert!(sig.covers_element(soap.body));
    }
}
