//! Named admission policies and the registry that resolves them.
//!
//! Policy names form a closed set. String names coming from call sites are
//! mapped onto it with [`PolicyName::resolve`], which substitutes the default
//! policy for anything it does not recognise.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TollgateError};

/// Route categories that carry a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyName {
    /// Login and other credential attempts.
    Authentication,
    /// Anonymous form submissions.
    PublicSubmission,
    /// Administrative mutation APIs.
    Administrative,
    /// Anything unclassified.
    Default,
}

impl PolicyName {
    /// All policy names, in table order.
    pub const ALL: [PolicyName; 4] = [
        PolicyName::Authentication,
        PolicyName::PublicSubmission,
        PolicyName::Administrative,
        PolicyName::Default,
    ];

    /// The canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::Authentication => "authentication",
            PolicyName::PublicSubmission => "public-submission",
            PolicyName::Administrative => "administrative",
            PolicyName::Default => "default",
        }
    }

    /// Map a string name to a policy, falling back to [`PolicyName::Default`].
    ///
    /// Unknown names are logged so a mistyped call site shows up in the logs
    /// instead of silently running under the default quota.
    pub fn resolve(name: &str) -> PolicyName {
        match name.parse() {
            Ok(policy) => policy,
            Err(_) => {
                warn!(policy = %name, "Unknown policy name, using default policy");
                PolicyName::Default
            }
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown policy name: {0}")]
pub struct UnknownPolicy(pub String);

impl FromStr for PolicyName {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PolicyName::ALL
            .into_iter()
            .find(|policy| policy.as_str() == s)
            .ok_or_else(|| UnknownPolicy(s.to_string()))
    }
}

/// What to do when the window store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request and log a warning.
    Open,
    /// Refuse the request.
    Closed,
}

/// A quota applied to one route category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Policy name.
    pub name: PolicyName,
    /// Admissions allowed per window. Zero denies everything.
    pub limit: u64,
    /// Length of the fixed window.
    pub window: Duration,
    /// Behaviour when the store is unavailable.
    pub on_store_failure: FailureMode,
}

impl Policy {
    fn builtin(name: PolicyName) -> Self {
        let (limit, window, on_store_failure) = match name {
            PolicyName::Authentication => (5, minutes(15), FailureMode::Closed),
            PolicyName::PublicSubmission => (10, minutes(60), FailureMode::Closed),
            PolicyName::Administrative => (100, minutes(1), FailureMode::Closed),
            PolicyName::Default => (1000, minutes(1), FailureMode::Open),
        };

        Self {
            name,
            limit,
            window,
            on_store_failure,
        }
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// One entry of a policy table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Admissions allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Store failure behaviour; keeps the built-in mode when absent
    #[serde(default)]
    pub on_store_failure: Option<FailureMode>,
}

/// Policy overrides, keyed by policy name.
///
/// ```yaml
/// policies:
///   authentication:
///     limit: 3
///     window_secs: 600
///   default:
///     limit: 500
///     window_secs: 60
///     on_store_failure: closed
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Overrides by policy name
    #[serde(default)]
    pub policies: HashMap<PolicyName, PolicyRule>,
}

impl PolicyTable {
    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a policy table from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy table: {}", e)))
    }
}

/// Maps policy names to quotas.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<PolicyName, Policy>,
}

impl PolicyRegistry {
    /// Registry holding the built-in policy table.
    pub fn new() -> Self {
        let policies = PolicyName::ALL
            .into_iter()
            .map(|name| (name, Policy::builtin(name)))
            .collect();
        Self { policies }
    }

    /// Built-in table with `table` applied on top.
    pub fn with_table(table: &PolicyTable) -> Result<Self> {
        let mut registry = Self::new();
        for (name, rule) in &table.policies {
            if rule.window_secs == 0 {
                return Err(TollgateError::Config(format!(
                    "policy {} has a zero-length window",
                    name
                )));
            }

            let builtin = Policy::builtin(*name);
            registry.policies.insert(
                *name,
                Policy {
                    name: *name,
                    limit: rule.limit,
                    window: Duration::from_secs(rule.window_secs),
                    on_store_failure: rule.on_store_failure.unwrap_or(builtin.on_store_failure),
                },
            );
        }
        Ok(registry)
    }

    /// Look up a policy. Every name is registered, so this cannot miss;
    /// the default-policy branch only guards against a registry built by hand.
    pub fn resolve(&self, name: PolicyName) -> &Policy {
        self.policies
            .get(&name)
            .or_else(|| self.policies.get(&PolicyName::Default))
            .unwrap_or(&DEFAULT_POLICY)
    }

    /// Iterate over the registered policies.
    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT_POLICY: Policy = Policy {
    name: PolicyName::Default,
    limit: 1000,
    window: Duration::from_secs(60),
    on_store_failure: FailureMode::Open,
};
