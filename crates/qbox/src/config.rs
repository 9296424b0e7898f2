//! Typed view over the declarative saga configuration.
//!
//! Configuration is a stream of YAML documents at
//! `configuration/config.yaml`; each document is an independent saga
//! config. The store validates every document at load time and never
//! reloads. The directory mounting in production is handled by Kubernetes
//! ConfigMaps.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default location of the mounted configuration stream.
pub const CONFIGURATION_PATH: &str = "configuration/config.yaml";

/// Methods accepted anywhere a request is described.
const METHODS: [&str; 6] = ["GET", "HEAD", "PUT", "PATCH", "DELETE", "POST"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One saga configuration: the pattern that triggers it, the transactions
/// to run, and the templates shaping the final response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaConfig {
    /// Deployment metadata; not consulted by the engine.
    pub host: String,

    /// Pattern an inbound request must match to initiate this saga.
    pub match_request: RequestPattern,

    /// Ordered transactions dispatched once the pattern matches.
    pub on_matched_request: Vec<TransactionSpec>,

    /// Response template when every transaction succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_all_succeeded: Option<ResponseSpec>,

    /// Response template when any transaction fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_any_failed: Option<ResponseSpec>,
}

/// The request pattern an inbound request is compared against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPattern {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// One outbound transaction. URL, header values, and body may contain
/// interpolation expressions, resolved right before sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSpec {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Hard cap on one dispatch attempt, in milliseconds.
    pub timeout: u64,

    /// Total attempts when dispatches time out. Absent: one attempt for
    /// transactions, unbounded for compensations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries_on_timeout: Option<u32>,

    /// Responses that mark the transaction as succeeded. Any response
    /// matching none of these fails the transaction.
    pub is_success_if_receives: Vec<ResponseMatch>,

    /// Compensating requests issued when a later transaction fails.
    pub on_failure: Vec<CompensationSpec>,
}

/// A compensating request: a transaction without its own `onFailure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationSpec {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries_on_timeout: Option<u32>,
    pub is_success_if_receives: Vec<ResponseMatch>,
}

/// A response a transaction's reply is compared to. An empty header map or
/// missing body imposes no constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMatch {
    #[serde(rename = "status-code")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Template for the response the gateway writes back to the initiating
/// client. Header values and body may contain interpolation expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(rename = "status-code")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl SagaConfig {
    /// Validate one document beyond what deserialization enforces.
    fn validate(&self) -> Result<(), ConfigError> {
        check_method(&self.match_request.method, "matchRequest")?;
        for (i, transaction) in self.on_matched_request.iter().enumerate() {
            let at = format!("onMatchedRequest[{i}]");
            check_method(&transaction.method, &at)?;
            for (j, compensation) in transaction.on_failure.iter().enumerate() {
                check_method(&compensation.method, &format!("{at}.onFailure[{j}]"))?;
            }
        }
        Ok(())
    }
}

fn check_method(method: &str, at: &str) -> Result<(), ConfigError> {
    if METHODS.contains(&method) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{at}: unsupported method {method:?}"
        )))
    }
}

/// All loaded saga configurations, in file order.
#[derive(Debug, Default)]
pub struct ConfigStore {
    configs: Vec<SagaConfig>,
}

impl ConfigStore {
    /// Load and validate every YAML document at `path`. A missing file
    /// yields an empty store; the gateway then proxies all traffic.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Parse a multi-document YAML stream.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut configs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(raw) {
            let config = SagaConfig::deserialize(document)?;
            config.validate()?;
            configs.push(config);
        }
        Ok(Self { configs })
    }

    pub fn from_configs(configs: Vec<SagaConfig>) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &[SagaConfig] {
        &self.configs
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
