//! Zentinel WS-SecurityPolicy replay tool.
//!
//! Run with: `zentinel-wss-policy --config config.yaml --replay case.yaml`
//!
//! Replays a recorded message through the policy enforcer: the security
//! engine's results come from the case file instead of a live engine.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zentinel_wss_policy::context::{Attachment, TlsSessionInfo};
use zentinel_wss_policy::credentials::CredentialProperties;
use zentinel_wss_policy::parser::{NodeId, SoapDocument};
use zentinel_wss_policy::policy::{SamlVersion, X509TokenType};
use zentinel_wss_policy::results::{
    DataReference, EncryptionResult, PasswordKind, SamlConfirmation, SamlTokenResult,
    SecurityContextTokenResult, SignatureConfirmationResult, SignatureResult, SigningKey, TimestampResult,
    UsernameTokenResult, X509TokenResult,
};
use zentinel_wss_policy::xpath::{NamespaceContext, XPathEvaluator};
use zentinel_wss_policy::{
    EnforcementOutcome, EnforcerConfig, EngineConfiguration, EngineOutcome, EngineResult, InboundMessage,
    MessageContext, PolicyEnforcer, PolicyError, SecurityAssertion, SecurityEngine,
};

/// Replays recorded SOAP messages through the WS-SecurityPolicy enforcer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Recorded case to replay (YAML)
    #[arg(short, long)]
    replay: PathBuf,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

/// One recorded message with the results the engine produced for it.
#[derive(Debug, Deserialize)]
struct ReplayCase {
    message: String,
    #[serde(default)]
    context: RecordedContext,
    #[serde(default)]
    attachments: Vec<Attachment>,
    /// Absent means no policy applies to the message
    #[serde(default)]
    policy: Option<Vec<SecurityAssertion>>,
    #[serde(default)]
    results: Vec<RecordedResult>,
    #[serde(default)]
    ut_with_callbacks: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecordedContext {
    is_requestor: bool,
    actions: Option<String>,
    asymmetric_signature_algorithm: Option<String>,
    enable_streaming: Option<bool>,
    tls_session: Option<TlsSessionInfo>,
    signature_properties: Option<CredentialProperties>,
    encryption_properties: Option<CredentialProperties>,
}

impl From<RecordedContext> for MessageContext {
    fn from(recorded: RecordedContext) -> Self {
        MessageContext {
            is_requestor: recorded.is_requestor,
            actions: recorded.actions,
            asymmetric_signature_algorithm: recorded.asymmetric_signature_algorithm,
            enable_streaming: recorded.enable_streaming,
            tls_session: recorded.tls_session,
            signature_properties: recorded.signature_properties,
            encryption_properties: recorded.encryption_properties,
            ..Default::default()
        }
    }
}

/// A protected fragment, located by `wsu:Id`, XPath or attachment id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RecordedRef {
    id: Option<String>,
    xpath: Option<String>,
    namespaces: BTreeMap<String, String>,
    attachment: Option<String>,
    content: bool,
    algorithm: Option<String>,
    digest_algorithm: Option<String>,
    transforms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RecordedResult {
    Signature {
        #[serde(default)]
        id: Option<String>,
        signature_method: String,
        c14n_method: String,
        key: SigningKey,
        #[serde(default)]
        refs: Vec<RecordedRef>,
    },
    Encryption {
        #[serde(default)]
        key_wrap_algorithm: Option<String>,
        #[serde(default)]
        refs: Vec<RecordedRef>,
    },
    UsernameToken {
        #[serde(default)]
        id: Option<String>,
        username: String,
        #[serde(default)]
        password: Option<PasswordKind>,
        #[serde(default)]
        password_verified: bool,
        #[serde(default)]
        nonce: Option<String>,
        #[serde(default)]
        created: Option<DateTime<Utc>>,
    },
    SamlToken {
        #[serde(default)]
        id: Option<String>,
        version: SamlVersion,
        #[serde(default)]
        signed: bool,
        confirmation: SamlConfirmation,
        #[serde(default)]
        refs: Vec<RecordedRef>,
    },
    Timestamp {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        created: Option<DateTime<Utc>>,
        #[serde(default)]
        expires: Option<DateTime<Utc>>,
    },
    X509Token {
        #[serde(default)]
        id: Option<String>,
        token_type: X509TokenType,
    },
    SecurityContextToken {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        external_reference: bool,
    },
    SignatureConfirmation {
        #[serde(default)]
        value: Option<String>,
    },
}

/// Security engine answering from a recorded case.
struct RecordedEngine {
    results: Vec<RecordedResult>,
    ut_with_callbacks: bool,
    actions: RefCell<Option<String>>,
}

impl RecordedEngine {
    fn element(envelope: &SoapDocument, id: Option<&str>) -> Option<NodeId> {
        id.and_then(|id| envelope.document.element_by_wsu_id(id))
    }

    fn resolve_refs(envelope: &SoapDocument, refs: &[RecordedRef]) -> Result<Vec<DataReference>, PolicyError> {
        let mut resolved = Vec::new();
        for recorded in refs {
            let base = |reference: DataReference| DataReference {
                content: recorded.content,
                algorithm: recorded.algorithm.clone(),
                digest_algorithm: recorded.digest_algorithm.clone(),
                transforms: recorded.transforms.clone(),
                ..reference
            };

            if let Some(cid) = &recorded.attachment {
                resolved.push(base(DataReference::attachment(cid.clone())));
            } else if let Some(id) = &recorded.id {
                let element = envelope
                    .document
                    .element_by_wsu_id(id)
                    .ok_or_else(|| PolicyError::Engine(format!("no element with id '{}'", id)))?;
                resolved.push(base(DataReference::element(element).with_wsu_id(format!("#{}", id))));
            } else if let Some(expression) = &recorded.xpath {
                let mut xpath = XPathEvaluator::new(&envelope.document);
                xpath.set_namespace_context(NamespaceContext::from(recorded.namespaces.clone()));
                let nodes = xpath
                    .evaluate(expression, envelope.envelope)
                    .map_err(|e| PolicyError::Engine(format!("reference '{}': {}", expression, e)))?;
                resolved.extend(nodes.into_iter().map(|n| base(DataReference::element(n))));
            } else {
                return Err(PolicyError::Engine(
                    "reference needs an id, an xpath or an attachment".to_string(),
                ));
            }
        }
        Ok(resolved)
    }

    fn resolve(envelope: &SoapDocument, recorded: &RecordedResult) -> Result<EngineResult, PolicyError> {
        Ok(match recorded.clone() {
            RecordedResult::Signature {
                id,
                signature_method,
                c14n_method,
                key,
                refs,
            } => EngineResult::Signature(SignatureResult {
                element: Self::element(envelope, id.as_deref()),
                id,
                signature_method,
                c14n_method,
                key,
                data_refs: Self::resolve_refs(envelope, &refs)?,
            }),
            RecordedResult::Encryption {
                key_wrap_algorithm,
                refs,
            } => EngineResult::Encryption(EncryptionResult {
                key_wrap_algorithm,
                data_refs: Self::resolve_refs(envelope, &refs)?,
            }),
            RecordedResult::UsernameToken {
                id,
                username,
                password,
                password_verified,
                nonce,
                created,
            } => EngineResult::UsernameToken(UsernameTokenResult {
                element: Self::element(envelope, id.as_deref()),
                id,
                username,
                password,
                password_verified,
                nonce,
                created,
            }),
            RecordedResult::SamlToken {
                id,
                version,
                signed,
                confirmation,
                refs,
            } => EngineResult::SamlToken(SamlTokenResult {
                element: Self::element(envelope, id.as_deref()),
                id,
                version,
                signed,
                confirmation,
                data_refs: Self::resolve_refs(envelope, &refs)?,
            }),
            RecordedResult::Timestamp { id, created, expires } => EngineResult::Timestamp(TimestampResult {
                element: Self::element(envelope, id.as_deref()),
                id,
                created,
                expires,
            }),
            RecordedResult::X509Token { id, token_type } => EngineResult::X509Token(X509TokenResult {
                element: Self::element(envelope, id.as_deref()),
                id,
                token_type,
            }),
            RecordedResult::SecurityContextToken { id, external_reference } => {
                EngineResult::SecurityContextToken(SecurityContextTokenResult {
                    element: Self::element(envelope, id.as_deref()),
                    id,
                    external_reference,
                })
            }
            RecordedResult::SignatureConfirmation { value } => {
                EngineResult::SignatureConfirmation(SignatureConfirmationResult { value })
            }
        })
    }
}

impl SecurityEngine for RecordedEngine {
    fn process(
        &self,
        envelope: &mut SoapDocument,
        configuration: &EngineConfiguration,
    ) -> Result<EngineOutcome, PolicyError> {
        debug!(actions = %configuration.actions, "Replaying recorded engine results");
        self.actions.replace(Some(configuration.actions.to_string()));

        let results = self
            .results
            .iter()
            .map(|r| Self::resolve(envelope, r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EngineOutcome {
            results,
            ut_with_callbacks: self.ut_with_callbacks,
        })
    }
}

#[derive(Debug, Serialize)]
struct VerdictReport {
    category: String,
    asserted: bool,
    confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    actions: Option<String>,
    verdicts: Vec<VerdictReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<String>,
}

impl Report {
    fn print_text(&self) {
        println!("outcome: {}", self.outcome);
        if let Some(actions) = &self.actions {
            println!("actions: {}", actions);
        }
        for verdict in &self.verdicts {
            let status = if !verdict.asserted {
                "FAIL"
            } else if verdict.confirmed {
                "ok"
            } else {
                "-"
            };
            match &verdict.reason {
                Some(reason) => println!("  [{:>4}] {}: {}", status, verdict.category, reason),
                None => println!("  [{:>4}] {}", status, verdict.category),
            }
        }
        if let Some(fault) = &self.fault {
            println!();
            println!("{}", fault);
        }
    }
}

fn load_config(path: &Path) -> Result<EnforcerConfig> {
    if !path.exists() {
        info!("Config file not found, using defaults");
        return Ok(EnforcerConfig::default());
    }
    let content = std::fs::read_to_string(path).context("Failed to read config file")?;
    serde_yaml::from_str(&content).context("Failed to parse config file")
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel WS-SecurityPolicy replay v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    let case: ReplayCase = serde_yaml::from_str(
        &std::fs::read_to_string(&args.replay).context("Failed to read replay case")?,
    )
    .context("Failed to parse replay case")?;

    info!(
        assertions = case.policy.as_ref().map_or(0, Vec::len),
        results = case.results.len(),
        "Replay case loaded"
    );

    let mut message = InboundMessage::from_bytes(case.message.as_bytes())
        .context("Failed to parse recorded message")?
        .with_context(case.context.into())
        .with_attachments(case.attachments);
    if let Some(policy) = case.policy {
        message = message.with_policy(policy.into_iter().collect());
    }

    let engine = RecordedEngine {
        results: case.results,
        ut_with_callbacks: case.ut_with_callbacks,
        actions: RefCell::new(None),
    };
    let enforcer = PolicyEnforcer::new(config);
    let version = Some(message.envelope.version);

    let (label, fault) = match enforcer.process(&mut message, &engine) {
        Ok(EnforcementOutcome::PassedThrough) => ("passed_through", None),
        Ok(EnforcementOutcome::Accepted) => ("accepted", None),
        Ok(rejected @ EnforcementOutcome::Rejected(_)) => {
            let fault = rejected
                .into_result()
                .err()
                .map(|e| enforcer.fault_response(&e, version));
            ("rejected", fault)
        }
        Err(e) => ("rejected", Some(enforcer.fault_response(&e, version))),
    };

    let verdicts = message
        .policy
        .iter()
        .flat_map(|registry| registry.iter())
        .map(|entry| {
            let verdict = entry.verdict();
            VerdictReport {
                category: entry.category().to_string(),
                asserted: verdict.asserted,
                confirmed: verdict.confirmed,
                reason: verdict.reason,
            }
        })
        .collect();

    let report = Report {
        outcome: label,
        actions: engine.actions.into_inner(),
        verdicts,
        fault,
    };
    match args.format {
        Format::Text => report.print_text(),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to render report")?
        ),
    }

    Ok(if report.outcome == "rejected" {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}
