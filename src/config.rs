//! Configuration types for the policy enforcer.
//!
//! Everything here is engine-wide and read-only once loaded: per-message
//! overrides live in [`crate::context::MessageContext`] and fall back to
//! these values.

use crate::credentials::CredentialProperties;
use serde::{Deserialize, Serialize};

/// Main configuration for the policy enforcer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcerConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Default credential configuration
    pub credentials: CredentialsConfig,

    /// Algorithm overrides
    pub algorithms: AlgorithmConfig,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            credentials: CredentialsConfig::default(),
            algorithms: AlgorithmConfig::default(),
        }
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Action on policy failure: "block" or "allow"
    pub fail_action: FailAction,

    /// Hand messages to the streaming security pipeline instead
    pub enable_streaming: bool,

    /// Whitespace-separated actions the engine always performs
    pub default_actions: Option<String>,

    /// SOAP version used for faults when the envelope version is unknown
    pub fault_version: SoapVersion,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            fail_action: FailAction::Block,
            enable_streaming: false,
            default_actions: None,
            fault_version: SoapVersion::Soap11,
        }
    }
}

/// Failure action when policy violations are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Reject the message
    #[default]
    Block,
    /// Accept the message (log only)
    Allow,
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    /// Envelope namespace URI for this version.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => crate::parser::SOAP_11_NS,
            Self::Soap12 => crate::parser::SOAP_12_NS,
        }
    }
}

/// Engine-wide default credentials.
///
/// Used when neither a credential provider nor a property set is attached
/// to the message itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Properties describing the signature credential
    pub signature_properties: Option<CredentialProperties>,

    /// Properties describing the encryption credential
    pub encryption_properties: Option<CredentialProperties>,
}

/// Algorithm overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// Non-standard asymmetric signature algorithm forced into every
    /// algorithm suite (e.g. RSA-SHA512)
    pub asymmetric_signature_algorithm: Option<String>,
}
