//! Per-message enforcement of an attached WS-SecurityPolicy.
//!
//! A message moves through a fixed sequence: actions are computed from the
//! policy, the security engine processes the message, coverage is checked
//! and the validators run. Acceptance is derived from the verdicts left in
//! the message's registry.

use crate::actions::{ActionComputer, EngineConfiguration};
use crate::assertion::AssertionRegistry;
use crate::config::{EnforcerConfig, FailAction, SoapVersion};
use crate::context::InboundMessage;
use crate::coverage::{reconcile_encrypted_signed_refs, CoverageVerifier};
use crate::credentials::{CredentialResolver, PropertiesCredentialResolver};
use crate::error::{security_fault_response, PolicyError, PolicyViolation};
use crate::parser::SoapDocument;
use crate::results::EngineOutcome;
use crate::validators::{validate_all, ValidatorParameters};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The cryptographic engine that processes the security header.
///
/// It receives the computed configuration, may decrypt the document in
/// place, and reports what it verified.
pub trait SecurityEngine {
    fn process(
        &self,
        envelope: &mut SoapDocument,
        configuration: &EngineConfiguration,
    ) -> Result<EngineOutcome, PolicyError>;
}

impl<F> SecurityEngine for F
where
    F: Fn(&mut SoapDocument, &EngineConfiguration) -> Result<EngineOutcome, PolicyError>,
{
    fn process(
        &self,
        envelope: &mut SoapDocument,
        configuration: &EngineConfiguration,
    ) -> Result<EngineOutcome, PolicyError> {
        self(envelope, configuration)
    }
}

/// Result of enforcing a policy on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementOutcome {
    /// No policy applied; the message was left untouched
    PassedThrough,
    Accepted,
    Rejected(Vec<PolicyViolation>),
}

impl EnforcementOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Turn a rejection into [`PolicyError::PolicyViolation`].
    pub fn into_result(self) -> Result<(), PolicyError> {
        match self {
            Self::Rejected(violations) => Err(PolicyError::PolicyViolation { violations }),
            Self::PassedThrough | Self::Accepted => Ok(()),
        }
    }
}

/// Enforces policies on inbound messages.
///
/// Holds only read-only, engine-wide state; one enforcer serves every
/// message of a pipeline.
#[derive(Clone)]
pub struct PolicyEnforcer {
    config: Arc<EnforcerConfig>,
    resolver: Arc<dyn CredentialResolver>,
}

impl PolicyEnforcer {
    /// Create an enforcer that resolves credentials from property sets.
    pub fn new(config: EnforcerConfig) -> Self {
        Self::with_resolver(Arc::new(config), Arc::new(PropertiesCredentialResolver))
    }

    pub fn with_resolver(config: Arc<EnforcerConfig>, resolver: Arc<dyn CredentialResolver>) -> Self {
        Self { config, resolver }
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    /// Compute the engine configuration for a message.
    ///
    /// Returns `None` when no policy is attached or the message belongs to
    /// the streaming pipeline; the policy is then not consulted at all.
    pub fn prepare(&self, message: &mut InboundMessage) -> Result<Option<EngineConfiguration>, PolicyError> {
        let Some(registry) = message.policy.as_mut() else {
            debug!("No policy attached, passing message through");
            return Ok(None);
        };
        if message.context.streaming_enabled(&self.config) {
            debug!("Streaming enabled, leaving message to the streaming pipeline");
            return Ok(None);
        }

        let computer = ActionComputer::new(&self.config, self.resolver.as_ref());
        let configuration = computer.compute(registry, &message.context)?;
        debug!(
            actions = %configuration.actions,
            assertions = registry.len(),
            "Actions computed"
        );
        Ok(Some(configuration))
    }

    /// Check coverage and run every validator against the engine's results.
    pub fn verify(&self, message: &InboundMessage, outcome: &EngineOutcome) -> EnforcementOutcome {
        let Some(registry) = message.policy.as_ref() else {
            return EnforcementOutcome::PassedThrough;
        };

        let mut signed = outcome.signed_refs();
        let encrypted = outcome.encrypted_refs();
        reconcile_encrypted_signed_refs(&mut signed, &encrypted);

        CoverageVerifier::new(registry, message, &signed, &encrypted).verify();
        debug!(
            signed_refs = signed.len(),
            encrypted_refs = encrypted.len(),
            "Coverage checked"
        );

        let params = ValidatorParameters::new(registry, message, outcome, &signed, &encrypted);
        validate_all(&params);

        self.decide(registry)
    }

    /// Run the whole enforcement sequence for one message.
    pub fn process(
        &self,
        message: &mut InboundMessage,
        engine: &dyn SecurityEngine,
    ) -> Result<EnforcementOutcome, PolicyError> {
        let Some(configuration) = self.prepare(message)? else {
            return Ok(EnforcementOutcome::PassedThrough);
        };

        let outcome = engine
            .process(&mut message.envelope, &configuration)
            .map_err(|e| match e {
                PolicyError::Engine(_) | PolicyError::CredentialResolution { .. } => e,
                other => PolicyError::Engine(other.to_string()),
            })?;
        debug!(results = outcome.results.len(), "Security engine finished");

        Ok(self.verify(message, &outcome))
    }

    fn decide(&self, registry: &AssertionRegistry) -> EnforcementOutcome {
        let violations = registry.violations();
        if violations.is_empty() {
            debug!("Message satisfies the security policy");
            return EnforcementOutcome::Accepted;
        }

        warn!(
            violation_count = violations.len(),
            "Security policy violations detected"
        );
        for violation in &violations {
            debug!(
                category = %violation.category,
                reason = %violation.reason,
                "Violation"
            );
        }

        match self.config.settings.fail_action {
            FailAction::Block => EnforcementOutcome::Rejected(violations),
            FailAction::Allow => {
                info!("Violations detected but accepting message (fail_action=allow)");
                EnforcementOutcome::Accepted
            }
        }
    }

    /// Render the SOAP fault for an enforcement error.
    pub fn fault_response(&self, error: &PolicyError, version: Option<SoapVersion>) -> String {
        let version = version.unwrap_or(self.config.settings.fault_version);
        let violations: &[PolicyViolation] = match error {
            PolicyError::PolicyViolation { violations } => violations,
            _ => &[],
        };
        security_fault_response(error.fault_code(), violations, Some(version))
    }
}
