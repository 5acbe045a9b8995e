//! WS-SecurityPolicy enforcement for inbound SOAP messages
//!
//! Takes the effective security policy attached to a message, tells the
//! cryptographic engine what to process, and checks the engine's results
//! against every assertion of the policy.
//!
//! # Features
//!
//! - Security action computation for transport, symmetric and asymmetric bindings
//! - Direction-aware credential selection for signature verification and decryption
//! - Signed/encrypted parts and XPath element coverage checks
//! - Required header and element presence checks
//! - Token, binding, algorithm suite, layout and supporting-token validation
//! - WS-Security SOAP Fault response generation
//!
//! # Example
//!
//! ```ignore
//! use zentinel_wss_policy::{EnforcerConfig, InboundMessage, PolicyEnforcer};
//!
//! let enforcer = PolicyEnforcer::new(EnforcerConfig::default());
//! let mut message = InboundMessage::from_bytes(body)?.with_policy(policy);
//! let outcome = enforcer.process(&mut message, &engine)?;
//! outcome.into_result()?;
//! ```

pub mod actions;
pub mod assertion;
pub mod config;
pub mod context;
pub mod coverage;
pub mod credentials;
pub mod enforcer;
pub mod error;
pub mod parser;
pub mod policy;
pub mod results;
pub mod validators;
pub mod xpath;

pub use actions::{ActionComputer, ActionList, EngineConfiguration, SecurityAction};
pub use assertion::{AssertionCategory, AssertionRegistry, SecurityAssertion};
pub use config::EnforcerConfig;
pub use context::{InboundMessage, MessageContext};
pub use enforcer::{EnforcementOutcome, PolicyEnforcer, SecurityEngine};
pub use error::{PolicyError, PolicyViolation};
pub use results::{EngineOutcome, EngineResult};
