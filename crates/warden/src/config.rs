//! Controller configuration document (strict parsing).
//!
//! ```yaml
//! policiesDownloadDir: /var/lib/warden/policies
//! limits:
//!   timeoutMs: 2000
//! policies:
//!   privileged-pods:
//!     module: registry://ghcr.io/acme/policies/pod-privileged:v0.2.1
//!     rules:
//!       - apiGroups: [""]
//!         apiVersions: ["v1"]
//!         resources: ["pods"]
//!         operations: ["CREATE", "UPDATE"]
//! ```
//!
//! Defaults are applied while parsing, so every [`PolicySpec`] handed to the
//! rest of the crate is fully resolved.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::admission::ReviewVersion;
use crate::limits::ResourceLimits;
use crate::policy::{LabelSelector, RuleWithOperations};

/// Errors raised while loading the configuration document
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path of the document
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid YAML or does not have the expected shape
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The document is not valid JSON or does not have the expected shape
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
    /// The document parsed but describes an invalid configuration
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Whether a policy's rejection blocks the request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Rejections block the request
    #[default]
    Protect,
    /// Rejections are recorded, the request goes through
    Monitor,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::Protect => f.write_str("protect"),
            PolicyMode::Monitor => f.write_str("monitor"),
        }
    }
}

/// How an error while invoking the policy is handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// The error is logged and the policy is treated as accepting
    Ignore,
    /// The error rejects the request
    #[default]
    Fail,
}

/// How rules are matched against requests for other versions of a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Only the exact group/version/resource in the rules match
    Exact,
    /// Requests for equivalent resources match and are converted
    #[default]
    Equivalent,
}

/// Configuration of one policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySpec {
    /// Location of the Wasm module: `file://`, `http(s)://`, `registry://`
    /// or a bare OCI reference
    #[serde(default)]
    pub module: String,
    /// Execution mode
    #[serde(default)]
    pub mode: PolicyMode,
    /// Free-form settings handed to the module untouched
    #[serde(default = "empty_settings", deserialize_with = "settings_or_empty")]
    pub settings: Value,
    /// Operations and resources this policy cares about
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    /// What to do when invoking the policy fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Whether the policy may return a mutated object
    #[serde(default)]
    pub mutating: bool,
    /// How rules match other versions of a resource
    #[serde(default)]
    pub match_policy: MatchPolicy,
    /// Restricts the policy to namespaces with matching labels
    #[serde(default)]
    pub namespace_selector: LabelSelector,
    /// Restricts the policy to objects with matching labels
    #[serde(default)]
    pub object_selector: LabelSelector,
    /// Review versions the policy accepts, in order of preference
    #[serde(default = "default_review_versions")]
    pub admission_review_versions: Vec<ReviewVersion>,
    /// Per-policy deadline overriding the global one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl PolicySpec {
    /// A protect-mode spec for `module` with every other field defaulted.
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            mode: PolicyMode::default(),
            settings: empty_settings(),
            rules: Vec::new(),
            failure_policy: FailurePolicy::default(),
            mutating: false,
            match_policy: MatchPolicy::default(),
            namespace_selector: LabelSelector::default(),
            object_selector: LabelSelector::default(),
            admission_review_versions: default_review_versions(),
            timeout_seconds: None,
        }
    }

    fn problems(&self, name: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if self.module.trim().is_empty() {
            problems.push(format!("policy {name}: module must not be empty"));
        }
        if self.rules.is_empty() {
            problems.push(format!("policy {name}: at least one rule is required"));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            problems.extend(
                rule.problems()
                    .into_iter()
                    .map(|p| format!("policy {name}: rules[{i}]: {p}")),
            );
        }
        problems.extend(
            self.namespace_selector
                .problems()
                .map(|p| format!("policy {name}: namespaceSelector: {p}")),
        );
        problems.extend(
            self.object_selector
                .problems()
                .map(|p| format!("policy {name}: objectSelector: {p}")),
        );
        if self.admission_review_versions.is_empty() {
            problems.push(format!(
                "policy {name}: admissionReviewVersions must not be empty"
            ));
        }
        if let Some(timeout) = self.timeout_seconds
            && !(1..=30).contains(&timeout)
        {
            problems.push(format!(
                "policy {name}: timeoutSeconds must be between 1 and 30"
            ));
        }
        problems
    }
}

/// The configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// Directory where downloaded modules are cached
    pub policies_download_dir: PathBuf,
    /// Limits applied to every policy instance
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Log guest writes to stdout/stderr at info level rather than debug
    #[serde(default)]
    pub forward_guest_output: bool,
    /// Policies by name, in document order
    #[serde(default, with = "ordered_policies")]
    pub policies: Vec<(String, PolicySpec)>,
}

impl Settings {
    /// Check the document, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.policies_download_dir.as_os_str().is_empty() {
            problems.push("policiesDownloadDir must not be empty".to_string());
        }
        if self.limits.timeout.is_zero() {
            problems.push("limits.timeoutMs must be greater than zero".to_string());
        }
        for (i, (name, spec)) in self.policies.iter().enumerate() {
            if name.trim().is_empty() {
                problems.push(format!("policies[{i}]: name must not be empty"));
            }
            if self.policies[..i].iter().any(|(other, _)| other == name) {
                problems.push(format!("policy {name}: defined more than once"));
            }
            problems.extend(spec.problems(name));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Look up a policy spec by name.
    pub fn policy(&self, name: &str) -> Option<&PolicySpec> {
        self.policies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }
}

/// Load and validate the configuration document at `path`.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&s)
}

/// Parse and validate a configuration document.
///
/// JSON documents are read with `serde_json` so that policy settings keep
/// numbers YAML would round to `f64`.
pub fn load_from_str(s: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = if s.trim_start().starts_with('{') {
        serde_json::from_str(s)?
    } else {
        serde_yaml::from_str(s)?
    };
    settings.validate()?;
    Ok(settings)
}

fn empty_settings() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_review_versions() -> Vec<ReviewVersion> {
    ReviewVersion::SUPPORTED.to_vec()
}

fn settings_or_empty<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => empty_settings(),
        Some(value) => value,
    })
}

/// Helper for keeping `policies` in document order
mod ordered_policies {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::PolicySpec;

    pub fn serialize<S>(policies: &[(String, PolicySpec)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(policies.len()))?;
        for (name, spec) in policies {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, PolicySpec)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PoliciesVisitor;

        impl<'de> Visitor<'de> for PoliciesVisitor {
            type Value = Vec<(String, PolicySpec)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of policy names to policy specs")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut policies = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry::<String, PolicySpec>()? {
                    policies.push(entry);
                }
                Ok(policies)
            }
        }

        deserializer.deserialize_map(PoliciesVisitor)
    }
}
