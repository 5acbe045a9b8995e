//! Per-message context: contextual properties, attachments and the attached
//! policy.

use crate::assertion::AssertionRegistry;
use crate::config::EnforcerConfig;
use crate::credentials::{CredentialProperties, CredentialProvider, CredentialSource};
use crate::error::PolicyError;
use crate::parser::{parse_envelope, SoapDocument};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// TLS session the message arrived over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSessionInfo {
    pub cipher_suite: String,
    /// Subject of the client certificate, when one was presented
    pub client_certificate: Option<String>,
}

/// A MIME attachment of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Content-ID without angle brackets
    pub id: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Attachment {
    /// The `cid:` URI references use for this attachment.
    pub fn cid(&self) -> String {
        format!("cid:{}", self.id)
    }
}

/// Contextual properties of one message.
///
/// Unset properties fall back to the engine-wide [`EnforcerConfig`].
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    /// This side initiated the exchange (the message is a response)
    pub is_requestor: bool,
    /// Actions already requested for the engine, whitespace separated
    pub actions: Option<String>,
    pub signature_crypto: Option<Arc<dyn CredentialProvider>>,
    pub signature_properties: Option<CredentialProperties>,
    pub encryption_crypto: Option<Arc<dyn CredentialProvider>>,
    pub encryption_properties: Option<CredentialProperties>,
    pub asymmetric_signature_algorithm: Option<String>,
    pub enable_streaming: Option<bool>,
    pub tls_session: Option<TlsSessionInfo>,
}

impl MessageContext {
    /// Signature credential: provider, then properties, then config default.
    pub fn signature_source(&self, config: &EnforcerConfig) -> Option<CredentialSource> {
        source(
            &self.signature_crypto,
            &self.signature_properties,
            &config.credentials.signature_properties,
        )
    }

    /// Encryption credential: provider, then properties, then config default.
    pub fn encryption_source(&self, config: &EnforcerConfig) -> Option<CredentialSource> {
        source(
            &self.encryption_crypto,
            &self.encryption_properties,
            &config.credentials.encryption_properties,
        )
    }

    pub fn asymmetric_signature_algorithm<'a>(&'a self, config: &'a EnforcerConfig) -> Option<&'a str> {
        self.asymmetric_signature_algorithm
            .as_deref()
            .or(config.algorithms.asymmetric_signature_algorithm.as_deref())
    }

    pub fn streaming_enabled(&self, config: &EnforcerConfig) -> bool {
        self.enable_streaming.unwrap_or(config.settings.enable_streaming)
    }

    pub fn base_actions<'a>(&'a self, config: &'a EnforcerConfig) -> Option<&'a str> {
        self.actions
            .as_deref()
            .or(config.settings.default_actions.as_deref())
    }
}

fn source(
    provider: &Option<Arc<dyn CredentialProvider>>,
    properties: &Option<CredentialProperties>,
    default: &Option<CredentialProperties>,
) -> Option<CredentialSource> {
    if let Some(provider) = provider {
        return Some(CredentialSource::Provider(Arc::clone(provider)));
    }
    properties
        .as_ref()
        .or(default.as_ref())
        .map(|p| CredentialSource::Properties(p.clone()))
}

/// An inbound message as the enforcer sees it.
#[derive(Debug)]
pub struct InboundMessage {
    pub envelope: SoapDocument,
    pub context: MessageContext,
    pub attachments: Vec<Attachment>,
    /// Effective policy; `None` means no policy applies
    pub policy: Option<AssertionRegistry>,
}

impl InboundMessage {
    pub fn new(envelope: SoapDocument) -> Self {
        Self {
            envelope,
            context: MessageContext::default(),
            attachments: Vec::new(),
            policy: None,
        }
    }

    /// Parse the envelope from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PolicyError> {
        Ok(Self::new(parse_envelope(data)?))
    }

    pub fn with_policy(mut self, policy: AssertionRegistry) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_context(mut self, context: MessageContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}
