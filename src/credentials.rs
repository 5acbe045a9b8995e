//! Credential material handed to the security engine.
//!
//! The enforcer never loads keys itself. It decides which configured
//! credential source backs signature verification and which backs
//! decryption, resolves each source once through a [`CredentialResolver`],
//! and passes the resulting handles to the engine in [`CredentialBindings`].

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The two roles a credential can play for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRole {
    /// Key source for verifying signatures
    Signature,
    /// Key source for decrypting content
    Encryption,
}

impl fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signature => f.write_str("signature"),
            Self::Encryption => f.write_str("encryption"),
        }
    }
}

/// A resolved credential provider (keystore, HSM session, ...).
pub trait CredentialProvider: fmt::Debug + Send + Sync {
    /// Stable, human-readable name for logging.
    fn name(&self) -> &str;
}

/// Flat key/value description of a credential, e.g. `keystore.file`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialProperties(BTreeMap<String, String>);

impl CredentialProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for CredentialProperties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Where a role's credential comes from, before resolution.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// An already constructed provider attached to the message
    Provider(Arc<dyn CredentialProvider>),
    /// Properties the resolver turns into a provider
    Properties(CredentialProperties),
}

impl CredentialSource {
    /// Whether both sources denote the same configured credential object.
    ///
    /// Providers compare by identity, property sets by value.
    pub fn same_as(&self, other: &CredentialSource) -> bool {
        match (self, other) {
            (Self::Provider(a), Self::Provider(b)) => Arc::ptr_eq(a, b),
            (Self::Properties(a), Self::Properties(b)) => a == b,
            _ => false,
        }
    }
}

/// Turns a [`CredentialSource`] into a provider handle.
pub trait CredentialResolver: Send + Sync {
    fn resolve(
        &self,
        role: CredentialRole,
        source: &CredentialSource,
    ) -> Result<Arc<dyn CredentialProvider>, PolicyError>;
}

/// Keystore description built from credential properties.
///
/// Only the description is validated here; opening the keystore is the
/// engine's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreCredentials {
    name: String,
    pub provider: String,
    pub keystore_type: String,
    pub file: String,
    pub alias: Option<String>,
}

impl KeystoreCredentials {
    pub const PROVIDER: &'static str = "crypto.provider";
    pub const FILE: &'static str = "keystore.file";
    pub const TYPE: &'static str = "keystore.type";
    pub const ALIAS: &'static str = "keystore.alias";

    pub fn from_properties(
        role: CredentialRole,
        properties: &CredentialProperties,
    ) -> Result<Self, PolicyError> {
        let required = |key: &str| {
            properties
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| PolicyError::CredentialResolution {
                    role,
                    reason: format!("missing property '{}'", key),
                })
        };

        let provider = required(Self::PROVIDER)?;
        let file = required(Self::FILE)?;
        let keystore_type = properties.get(Self::TYPE).unwrap_or("jks").to_string();
        let alias = properties.get(Self::ALIAS).map(str::to_string);
        let name = match &alias {
            Some(alias) => format!("{}:{}#{}", provider, file, alias),
            None => format!("{}:{}", provider, file),
        };

        Ok(Self {
            name,
            provider,
            keystore_type,
            file,
            alias,
        })
    }
}

impl CredentialProvider for KeystoreCredentials {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Default resolver: passes providers through and builds
/// [`KeystoreCredentials`] from property sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertiesCredentialResolver;

impl CredentialResolver for PropertiesCredentialResolver {
    fn resolve(
        &self,
        role: CredentialRole,
        source: &CredentialSource,
    ) -> Result<Arc<dyn CredentialProvider>, PolicyError> {
        match source {
            CredentialSource::Provider(provider) => Ok(Arc::clone(provider)),
            CredentialSource::Properties(properties) => {
                Ok(Arc::new(KeystoreCredentials::from_properties(role, properties)?))
            }
        }
    }
}

/// Resolved credential handles for one message.
#[derive(Debug, Clone, Default)]
pub struct CredentialBindings {
    /// Key source for verifying inbound signatures
    pub signature_verification: Option<Arc<dyn CredentialProvider>>,
    /// Key source for decrypting inbound content
    pub decryption: Option<Arc<dyn CredentialProvider>>,
}

impl CredentialBindings {
    /// True when both roles resolved to the very same provider instance.
    pub fn is_shared(&self) -> bool {
        match (&self.signature_verification, &self.decryption) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
