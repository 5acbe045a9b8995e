//! Translation of the asserted policy into the operations the security
//! engine must perform, and the credentials it performs them with.

use crate::assertion::{AssertionCategory, AssertionRegistry, RequirementMarker, SecurityAssertion};
use crate::config::EnforcerConfig;
use crate::context::MessageContext;
use crate::credentials::{CredentialBindings, CredentialProvider, CredentialResolver, CredentialRole};
use crate::error::PolicyError;
use crate::policy::{AlgorithmSuite, PasswordType};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// One engine operation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityAction {
    UsernameToken,
    UsernameTokenSignature,
    Signature,
    Encrypt,
    Timestamp,
    SamlTokenSigned,
    SamlTokenUnsigned,
    NoSecurity,
}

impl SecurityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsernameToken => "UsernameToken",
            Self::UsernameTokenSignature => "UsernameTokenSignature",
            Self::Signature => "Signature",
            Self::Encrypt => "Encrypt",
            Self::Timestamp => "Timestamp",
            Self::SamlTokenSigned => "SAMLTokenSigned",
            Self::SamlTokenUnsigned => "SAMLTokenUnsigned",
            Self::NoSecurity => "NoSecurity",
        }
    }
}

impl fmt::Display for SecurityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityAction {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UsernameToken" => Self::UsernameToken,
            "UsernameTokenSignature" => Self::UsernameTokenSignature,
            "Signature" => Self::Signature,
            "Encrypt" => Self::Encrypt,
            "Timestamp" => Self::Timestamp,
            "SAMLTokenSigned" => Self::SamlTokenSigned,
            "SAMLTokenUnsigned" => Self::SamlTokenUnsigned,
            "NoSecurity" => Self::NoSecurity,
            other => return Err(PolicyError::Config(format!("unknown security action '{}'", other))),
        })
    }
}

/// Where a new action goes relative to the existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Prepend,
    Append,
}

/// Ordered operation list; each action appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionList(Vec<SecurityAction>);

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whitespace separated action string.
    pub fn parse(actions: &str) -> Result<Self, PolicyError> {
        let mut list = Self::new();
        for token in actions.split_whitespace() {
            list.add(token.parse()?, Placement::Append);
        }
        Ok(list)
    }

    /// Add an action unless already present.
    pub fn add(&mut self, action: SecurityAction, placement: Placement) {
        if self.contains(action) {
            return;
        }
        match placement {
            Placement::Prepend => self.0.insert(0, action),
            Placement::Append => self.0.push(action),
        }
    }

    pub fn contains(&self, action: SecurityAction) -> bool {
        self.0.contains(&action)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecurityAction> {
        self.0.iter()
    }
}

impl fmt::Display for ActionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().map(SecurityAction::as_str).collect::<Vec<_>>().join(" ");
        f.write_str(joined.trim())
    }
}

/// Everything the engine needs to process one message.
#[derive(Debug, Clone, Default)]
pub struct EngineConfiguration {
    pub actions: ActionList,
    pub credentials: CredentialBindings,
    pub enable_signature_confirmation: bool,
    pub allow_username_token_no_password: bool,
    /// First algorithm suite of the policy, with overrides applied
    pub algorithm_suite: Option<AlgorithmSuite>,
    pub nonce_cache_required: bool,
    pub timestamp_cache_required: bool,
    pub saml_cache_required: bool,
}

/// Computes the [`EngineConfiguration`] for a message before the engine runs.
pub struct ActionComputer<'a> {
    config: &'a EnforcerConfig,
    resolver: &'a dyn CredentialResolver,
}

type Provider = Arc<dyn CredentialProvider>;

impl<'a> ActionComputer<'a> {
    pub fn new(config: &'a EnforcerConfig, resolver: &'a dyn CredentialResolver) -> Self {
        Self { config, resolver }
    }

    pub fn compute(
        &self,
        registry: &mut AssertionRegistry,
        context: &MessageContext,
    ) -> Result<EngineConfiguration, PolicyError> {
        let mut engine = EngineConfiguration {
            actions: ActionList::parse(context.base_actions(self.config).unwrap_or_default())?,
            ..Default::default()
        };

        engine.enable_signature_confirmation = context.is_requestor
            && registry.all_of(AssertionCategory::Wss11).iter().any(|e| {
                matches!(e.assertion(), SecurityAssertion::Wss11(w) if w.require_signature_confirmation)
            });

        let asymmetric = registry.contains(AssertionCategory::AsymmetricBinding);
        let symmetric = registry.contains(AssertionCategory::SymmetricBinding);
        let transport = registry.contains(AssertionCategory::TransportBinding);

        if asymmetric {
            engine.credentials = self.asymmetric_bindings(&mut engine.actions, context, "asymmetric")?;
        } else if symmetric {
            engine.credentials = self.symmetric_bindings(&mut engine.actions, context)?;
        } else if engine.actions.is_empty() || transport {
            // Intentional: a transport binding still gets the default signature and
            // encryption actions when actions were already configured. Do not
            // narrow this to the empty case.
            engine.credentials = self.asymmetric_bindings(&mut engine.actions, context, "default")?;
        }

        if let Some(algorithm) = context.asymmetric_signature_algorithm(self.config) {
            for assertion in registry.assertions_mut(AssertionCategory::AlgorithmSuite) {
                if let SecurityAssertion::AlgorithmSuite(suite) = assertion {
                    debug!(suite = %suite.name, algorithm = %algorithm, "Overriding asymmetric signature algorithm");
                    suite.set_asymmetric_signature(algorithm);
                }
            }
        }
        engine.algorithm_suite = registry
            .first_of(AssertionCategory::AlgorithmSuite)
            .and_then(|e| match e.assertion() {
                SecurityAssertion::AlgorithmSuite(suite) => Some(suite.clone()),
                _ => None,
            });

        engine.allow_username_token_no_password = registry
            .all_of(AssertionCategory::UsernameToken)
            .iter()
            .any(|e| {
                matches!(e.assertion(), SecurityAssertion::UsernameToken(p) if p.password_type == PasswordType::NoPassword)
            });

        confirm_trivial_requirements(registry);

        engine.nonce_cache_required = registry.contains(AssertionCategory::UsernameToken);
        engine.timestamp_cache_required = registry.contains(AssertionCategory::IncludeTimestamp);
        engine.saml_cache_required = registry.contains(AssertionCategory::SamlToken);

        debug!(
            actions = %engine.actions,
            signature_confirmation = engine.enable_signature_confirmation,
            shared_credentials = engine.credentials.is_shared(),
            "Computed security actions"
        );

        Ok(engine)
    }

    /// Resolve (signature, encryption) providers, reusing one instance when
    /// both roles are configured with the same credential.
    fn resolve_providers(
        &self,
        context: &MessageContext,
    ) -> Result<(Option<Provider>, Option<Provider>), PolicyError> {
        let signature_source = context.signature_source(self.config);
        let encryption_source = context.encryption_source(self.config);

        let encryption = encryption_source
            .as_ref()
            .map(|source| self.resolver.resolve(CredentialRole::Encryption, source))
            .transpose()?;

        let signature = match (&encryption_source, &signature_source) {
            (Some(e), Some(s)) if e.same_as(s) => encryption.clone(),
            _ => signature_source
                .as_ref()
                .map(|source| self.resolver.resolve(CredentialRole::Signature, source))
                .transpose()?,
        };

        Ok((signature, encryption))
    }

    fn asymmetric_bindings(
        &self,
        actions: &mut ActionList,
        context: &MessageContext,
        binding: &str,
    ) -> Result<CredentialBindings, PolicyError> {
        actions.add(SecurityAction::Signature, Placement::Prepend);
        actions.add(SecurityAction::Encrypt, Placement::Prepend);

        let (signature, encryption) = self.resolve_providers(context)?;
        debug!(binding, "Resolved credentials");
        Ok(CredentialBindings {
            decryption: signature.clone(),
            signature_verification: encryption.or(signature),
        })
    }

    fn symmetric_bindings(
        &self,
        actions: &mut ActionList,
        context: &MessageContext,
    ) -> Result<CredentialBindings, PolicyError> {
        actions.add(SecurityAction::Signature, Placement::Prepend);
        actions.add(SecurityAction::Encrypt, Placement::Prepend);

        let (signature, encryption) = self.resolve_providers(context)?;
        debug!(binding = "symmetric", requestor = context.is_requestor, "Resolved credentials");
        Ok(if context.is_requestor {
            CredentialBindings {
                signature_verification: encryption.clone().or_else(|| signature.clone()),
                decryption: signature.or(encryption),
            }
        } else {
            CredentialBindings {
                signature_verification: signature.clone().or_else(|| encryption.clone()),
                decryption: encryption.or(signature),
            }
        })
    }
}

/// Categories confirmed as soon as they are present.
fn confirm_trivial_requirements(registry: &AssertionRegistry) {
    registry.confirm_all(AssertionCategory::KeyValueToken);
    registry.confirm_all(AssertionCategory::RsaKeyValue);

    let confirm_markers = |markers: &[RequirementMarker]| {
        for marker in markers {
            registry.confirm_all(AssertionCategory::Requirement(*marker));
        }
    };

    if registry.contains(AssertionCategory::Wss10) {
        registry.confirm_all(AssertionCategory::Wss10);
        confirm_markers(&RequirementMarker::WSS10);
    }

    let trust10 = registry.contains(AssertionCategory::Trust10);
    if trust10 {
        registry.confirm_all(AssertionCategory::Trust10);
        confirm_markers(&RequirementMarker::TRUST10);
    }

    if registry.contains(AssertionCategory::Trust13) {
        registry.confirm_all(AssertionCategory::Trust13);
        confirm_markers(&RequirementMarker::TRUST13);
        if !trust10 {
            confirm_markers(&RequirementMarker::TRUST10);
        }
    }
}
