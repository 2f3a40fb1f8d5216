//! Loaded policies.
//!
//! A [`Policy`] ties together what the configuration says about a policy
//! ([`PolicySpec`]), the precomputed [`Hook`] deciding which requests it sees,
//! and the running guest that evaluates them.
//!
//! ## Example
//!
//! ```rust,ignore
//! let module = PolicyModule::from_file(path, router, limits, false)?;
//! let policy = Policy::new("pod-privileged", spec, module.instantiate("pod-privileged").await?);
//!
//! let settings = policy.validate_settings().await?;
//! let response = policy.validate(&versioned_request).await?;
//! ```

mod hook;
mod selector;

use std::time::Duration;

use thiserror::Error;

use crate::admission::VersionedRequest;
use crate::config::{PolicyMode, PolicySpec};
use crate::fetch::FetchError;
use crate::protocol::{
    self, ProtocolError, SettingsValidationResponse, VALIDATE, VALIDATE_SETTINGS,
    ValidationResponse,
};
use crate::runtime::{InvocationStats, PolicyInstance, RuntimeError};

pub use hook::{Hook, Invocation, MatchError, OperationType, RuleScope, RuleWithOperations};
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};

/// Errors attributed to a single policy
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The module cannot be fetched
    #[error("policy {policy}: cannot fetch module: {source}")]
    Fetch {
        /// Policy name
        policy: String,
        /// Underlying error
        #[source]
        source: FetchError,
    },
    /// The module cannot be loaded or the guest failed
    #[error("policy {policy}: {source}")]
    Runtime {
        /// Policy name
        policy: String,
        /// Underlying error
        #[source]
        source: RuntimeError,
    },
    /// The guest exchanged a malformed message
    #[error("policy {policy}: {source}")]
    Protocol {
        /// Policy name
        policy: String,
        /// Underlying error
        #[source]
        source: ProtocolError,
    },
}

impl PolicyError {
    /// Name of the policy the error belongs to.
    pub fn policy(&self) -> &str {
        match self {
            PolicyError::Fetch { policy, .. }
            | PolicyError::Runtime { policy, .. }
            | PolicyError::Protocol { policy, .. } => policy,
        }
    }
}

/// A policy ready to evaluate requests.
#[derive(Debug)]
pub struct Policy {
    name: String,
    spec: PolicySpec,
    hook: Hook,
    instance: PolicyInstance,
}

impl Policy {
    /// Assemble a policy from its spec and the instance running its module.
    pub fn new(name: impl Into<String>, spec: PolicySpec, instance: PolicyInstance) -> Self {
        let name = name.into();
        let hook = Hook::new(name.clone(), &spec);
        Self {
            name,
            spec,
            hook,
            instance,
        }
    }

    /// Policy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy configuration.
    pub fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    /// Execution mode.
    pub fn mode(&self) -> PolicyMode {
        self.spec.mode
    }

    /// Match rule of this policy.
    pub fn hook(&self) -> &Hook {
        &self.hook
    }

    /// Statistics of the underlying instance.
    pub fn stats(&self) -> InvocationStats {
        self.instance.stats()
    }

    /// Deadline for one call: `timeoutSeconds` if set, the global limit otherwise.
    pub fn timeout(&self) -> Duration {
        self.spec
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.instance.limits().timeout)
    }

    /// Evaluate `request` with this policy's settings.
    pub async fn validate(
        &self,
        request: &VersionedRequest,
    ) -> Result<ValidationResponse, PolicyError> {
        self.validate_with_timeout(request, self.timeout()).await
    }

    /// Evaluate `request`, trapping the guest after `timeout`.
    pub async fn validate_with_timeout(
        &self,
        request: &VersionedRequest,
        timeout: Duration,
    ) -> Result<ValidationResponse, PolicyError> {
        let payload = protocol::encode_validation_request(request, &self.spec.settings)
            .map_err(|e| self.protocol_error(e))?;
        let response = self
            .instance
            .invoke_with_timeout(VALIDATE, &payload, timeout)
            .await
            .map_err(|e| self.runtime_error(e))?;
        protocol::decode_validation_response(&response).map_err(|e| self.protocol_error(e))
    }

    /// Ask the guest whether its settings are valid.
    pub async fn validate_settings(&self) -> Result<SettingsValidationResponse, PolicyError> {
        let payload =
            protocol::encode_settings(&self.spec.settings).map_err(|e| self.protocol_error(e))?;
        let response = self
            .instance
            .invoke_with_timeout(VALIDATE_SETTINGS, &payload, self.timeout())
            .await
            .map_err(|e| self.runtime_error(e))?;
        protocol::decode_settings_validation_response(&response)
            .map_err(|e| self.protocol_error(e))
    }

    fn runtime_error(&self, source: RuntimeError) -> PolicyError {
        PolicyError::Runtime {
            policy: self.name.clone(),
            source,
        }
    }

    fn protocol_error(&self, source: ProtocolError) -> PolicyError {
        PolicyError::Protocol {
            policy: self.name.clone(),
            source,
        }
    }
}
