//! Typed WS-SecurityPolicy assertion payloads.
//!
//! Policies arrive already parsed; these types are what a policy source
//! hands over. All of them deserialize from YAML so recorded cases can be
//! replayed.

use crate::parser::QName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known algorithm URIs.
pub mod algorithms {
    pub const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
    pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
    pub const SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

    pub const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
    pub const AES192_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes192-cbc";
    pub const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";
    pub const TRIPLE_DES: &str = "http://www.w3.org/2001/04/xmlenc#tripledes-cbc";

    pub const KW_AES128: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes128";
    pub const KW_AES192: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes192";
    pub const KW_AES256: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";
    pub const KW_TRIPLE_DES: &str = "http://www.w3.org/2001/04/xmlenc#kw-tripledes";
    pub const KW_RSA_OAEP: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";

    pub const HMAC_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#hmac-sha1";
    pub const HMAC_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256";
    pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
    pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
    pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";

    pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
}

// --- Token policies ---

/// Which direction a token is expected to travel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenInclusion {
    Never,
    Once,
    AlwaysToRecipient,
    AlwaysToInitiator,
    #[default]
    Always,
}

impl TokenInclusion {
    /// Whether an inbound message must carry the token.
    pub fn is_required_inbound(&self, is_requestor: bool) -> bool {
        match self {
            Self::Never => false,
            Self::AlwaysToRecipient => !is_requestor,
            Self::AlwaysToInitiator => is_requestor,
            Self::Once | Self::Always => true,
        }
    }
}

/// UsernameToken password requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordType {
    #[default]
    Text,
    HashPassword,
    NoPassword,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsernameTokenPolicy {
    pub inclusion: TokenInclusion,
    pub password_type: PasswordType,
    pub require_nonce: bool,
    pub require_created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum X509TokenType {
    V1,
    V3,
    PkiPathV1,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct X509TokenPolicy {
    pub inclusion: TokenInclusion,
    pub token_type: Option<X509TokenType>,
    pub require_issuer_serial_reference: bool,
    pub require_thumbprint_reference: bool,
    pub require_key_identifier_reference: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamlVersion {
    #[serde(rename = "1.1")]
    V11,
    #[serde(rename = "2.0")]
    V20,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamlTokenPolicy {
    pub inclusion: TokenInclusion,
    pub version: Option<SamlVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityContextTokenPolicy {
    pub inclusion: TokenInclusion,
    pub require_external_uri_reference: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsTokenPolicy {
    pub require_client_certificate: bool,
}

/// A token named inside a supporting-tokens assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenRequirement {
    UsernameToken(UsernameTokenPolicy),
    X509Token(X509TokenPolicy),
    SamlToken(SamlTokenPolicy),
    SecurityContextToken(SecurityContextTokenPolicy),
    KeyValueToken,
    IssuedToken {
        #[serde(default)]
        inclusion: TokenInclusion,
    },
}

impl TokenRequirement {
    pub fn inclusion(&self) -> TokenInclusion {
        match self {
            Self::UsernameToken(p) => p.inclusion,
            Self::X509Token(p) => p.inclusion,
            Self::SamlToken(p) => p.inclusion,
            Self::SecurityContextToken(p) => p.inclusion,
            Self::KeyValueToken => TokenInclusion::Always,
            Self::IssuedToken { inclusion } => *inclusion,
        }
    }
}

// --- Bindings ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionOrder {
    #[default]
    SignBeforeEncrypting,
    EncryptBeforeSigning,
}

/// Properties shared by all bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingProperties {
    pub include_timestamp: bool,
    pub protection_order: ProtectionOrder,
    pub encrypt_signature: bool,
    pub protect_tokens: bool,
    pub only_sign_entire_headers_and_body: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportBinding {
    pub transport_token: Option<HttpsTokenPolicy>,
    #[serde(flatten)]
    pub properties: BindingProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymmetricBinding {
    #[serde(flatten)]
    pub properties: BindingProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsymmetricBinding {
    #[serde(flatten)]
    pub properties: BindingProperties,
}

// --- Algorithm suite ---

/// Acceptable algorithms for a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AlgorithmSuiteDef")]
pub struct AlgorithmSuite {
    pub name: String,
    pub digest: String,
    pub encryption: String,
    pub symmetric_key_wrap: String,
    pub asymmetric_key_wrap: String,
    pub symmetric_signature: String,
    /// Accepted asymmetric signature methods
    pub signature_methods: Vec<String>,
    pub c14n: String,
    pub min_asymmetric_key_length: u32,
    pub max_asymmetric_key_length: u32,
}

impl AlgorithmSuite {
    fn build(
        name: &str,
        digest: &str,
        encryption: &str,
        symmetric_key_wrap: &str,
        symmetric_signature: &str,
        asymmetric_signature: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            digest: digest.to_string(),
            encryption: encryption.to_string(),
            symmetric_key_wrap: symmetric_key_wrap.to_string(),
            asymmetric_key_wrap: algorithms::KW_RSA_OAEP.to_string(),
            symmetric_signature: symmetric_signature.to_string(),
            signature_methods: vec![asymmetric_signature.to_string()],
            c14n: algorithms::EXC_C14N.to_string(),
            min_asymmetric_key_length: 1024,
            max_asymmetric_key_length: 4096,
        }
    }

    pub fn basic128() -> Self {
        use algorithms::*;
        Self::build("Basic128", SHA1, AES128_CBC, KW_AES128, HMAC_SHA1, RSA_SHA1)
    }

    pub fn basic192() -> Self {
        use algorithms::*;
        Self::build("Basic192", SHA1, AES192_CBC, KW_AES192, HMAC_SHA1, RSA_SHA1)
    }

    pub fn basic256() -> Self {
        use algorithms::*;
        Self::build("Basic256", SHA1, AES256_CBC, KW_AES256, HMAC_SHA1, RSA_SHA1)
    }

    pub fn basic256_sha256() -> Self {
        use algorithms::*;
        Self::build("Basic256Sha256", SHA256, AES256_CBC, KW_AES256, HMAC_SHA256, RSA_SHA256)
    }

    pub fn triple_des() -> Self {
        use algorithms::*;
        Self::build("TripleDes", SHA1, TRIPLE_DES, KW_TRIPLE_DES, HMAC_SHA1, RSA_SHA1)
    }

    /// Look a suite up by its policy name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "Basic128" => Some(Self::basic128()),
            "Basic192" => Some(Self::basic192()),
            "Basic256" => Some(Self::basic256()),
            "Basic256Sha256" => Some(Self::basic256_sha256()),
            "TripleDes" => Some(Self::triple_des()),
            _ => None,
        }
    }

    /// Replace the accepted asymmetric signature methods with exactly one.
    pub fn set_asymmetric_signature(&mut self, algorithm: impl Into<String>) {
        self.signature_methods.clear();
        self.signature_methods.push(algorithm.into());
    }

    pub fn accepts_signature(&self, algorithm: &str) -> bool {
        algorithm == self.symmetric_signature || self.signature_methods.iter().any(|m| m == algorithm)
    }

    pub fn accepts_key_wrap(&self, algorithm: &str) -> bool {
        algorithm == self.symmetric_key_wrap || algorithm == self.asymmetric_key_wrap
    }
}

/// Serialized form: a suite name plus optional overrides.
#[derive(Deserialize)]
struct AlgorithmSuiteDef {
    name: String,
    #[serde(default)]
    signature_methods: Option<Vec<String>>,
    #[serde(default)]
    min_asymmetric_key_length: Option<u32>,
    #[serde(default)]
    max_asymmetric_key_length: Option<u32>,
}

impl TryFrom<AlgorithmSuiteDef> for AlgorithmSuite {
    type Error = String;

    fn try_from(def: AlgorithmSuiteDef) -> Result<Self, Self::Error> {
        let mut suite =
            Self::by_name(&def.name).ok_or_else(|| format!("unknown algorithm suite '{}'", def.name))?;
        if let Some(methods) = def.signature_methods {
            suite.signature_methods = methods;
        }
        if let Some(min) = def.min_asymmetric_key_length {
            suite.min_asymmetric_key_length = min;
        }
        if let Some(max) = def.max_asymmetric_key_length {
            suite.max_asymmetric_key_length = max;
        }
        Ok(suite)
    }
}

// --- Layout / WSS / Trust ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Strict,
    #[default]
    Lax,
    LaxTsFirst,
    LaxTsLast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wss10 {
    pub must_support_ref_key_identifier: bool,
    pub must_support_ref_issuer_serial: bool,
    pub must_support_ref_external_uri: bool,
    pub must_support_ref_embedded_token: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wss11 {
    #[serde(flatten)]
    pub wss10: Wss10,
    pub must_support_ref_thumbprint: bool,
    pub must_support_ref_encrypted_key: bool,
    pub require_signature_confirmation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trust10 {
    pub must_support_client_challenge: bool,
    pub must_support_server_challenge: bool,
    pub require_client_entropy: bool,
    pub require_server_entropy: bool,
    pub must_support_issued_tokens: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trust13 {
    #[serde(flatten)]
    pub trust10: Trust10,
    pub require_request_security_token_collection: bool,
    pub require_applies_to: bool,
    pub scope_policy15: bool,
    pub must_support_interactive_challenge: bool,
}

// --- Parts and elements ---

/// A header selected by namespace and, optionally, local name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSelector {
    pub namespace: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl HeaderSelector {
    pub fn new(namespace: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn matches(&self, qname: &QName) -> bool {
        qname.namespace == self.namespace
            && self.name.as_deref().map_or(true, |n| n == qname.local_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentsRequirement {
    pub content_signature_transform: bool,
}

/// Payload of SignedParts / EncryptedParts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectedParts {
    pub body: bool,
    pub headers: Vec<HeaderSelector>,
    pub attachments: Option<AttachmentsRequirement>,
}

/// One XPath expression with the prefixes it uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XPathSelector {
    pub expression: String,
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
}

impl XPathSelector {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            namespaces: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.insert(prefix.into(), uri.into());
        self
    }
}

/// Payload of SignedElements / EncryptedElements / ContentEncryptedElements /
/// RequiredElements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementsRequirement {
    pub xpaths: Vec<XPathSelector>,
}

/// Payload of RequiredParts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequiredParts {
    pub headers: Vec<QName>,
}

// --- Supporting tokens ---

/// The eight supporting-token flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportingTokenKind {
    Supporting,
    Signed,
    Endorsing,
    SignedEndorsing,
    SignedEncrypted,
    Encrypted,
    EndorsingEncrypted,
    SignedEndorsingEncrypted,
}

impl SupportingTokenKind {
    pub const ALL: [SupportingTokenKind; 8] = [
        Self::Supporting,
        Self::Signed,
        Self::Endorsing,
        Self::SignedEndorsing,
        Self::SignedEncrypted,
        Self::Encrypted,
        Self::EndorsingEncrypted,
        Self::SignedEndorsingEncrypted,
    ];

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::Signed | Self::SignedEndorsing | Self::SignedEncrypted | Self::SignedEndorsingEncrypted
        )
    }

    pub fn is_endorsing(&self) -> bool {
        matches!(
            self,
            Self::Endorsing | Self::SignedEndorsing | Self::EndorsingEncrypted | Self::SignedEndorsingEncrypted
        )
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            Self::SignedEncrypted | Self::Encrypted | Self::EndorsingEncrypted | Self::SignedEndorsingEncrypted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supporting => "SupportingTokens",
            Self::Signed => "SignedSupportingTokens",
            Self::Endorsing => "EndorsingSupportingTokens",
            Self::SignedEndorsing => "SignedEndorsingSupportingTokens",
            Self::SignedEncrypted => "SignedEncryptedSupportingTokens",
            Self::Encrypted => "EncryptedSupportingTokens",
            Self::EndorsingEncrypted => "EndorsingEncryptedSupportingTokens",
            Self::SignedEndorsingEncrypted => "SignedEndorsingEncryptedSupportingTokens",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportingTokensPolicy {
    pub kind: SupportingTokenKind,
    #[serde(default)]
    pub tokens: Vec<TokenRequirement>,
    #[serde(default)]
    pub signed_parts: Option<ProtectedParts>,
    #[serde(default)]
    pub encrypted_parts: Option<ProtectedParts>,
    #[serde(default)]
    pub signed_elements: Option<ElementsRequirement>,
    #[serde(default)]
    pub encrypted_elements: Option<ElementsRequirement>,
}

impl SupportingTokensPolicy {
    pub fn new(kind: SupportingTokenKind, tokens: Vec<TokenRequirement>) -> Self {
        Self {
            kind,
            tokens,
            signed_parts: None,
            encrypted_parts: None,
            signed_elements: None,
            encrypted_elements: None,
        }
    }
}
