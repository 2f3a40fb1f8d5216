//! The set of loaded policies.
//!
//! Loading is all-or-nothing: every configured policy is attempted and every
//! failure is reported, but a registry is only returned when all of them
//! loaded.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PolicySpec, Settings};
use crate::fetch::ArtifactFetcher;
use crate::policy::{Policy, PolicyError};
use crate::runtime::{HostCallRouter, PolicyModule};

/// A policy whose settings were refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsFailure {
    /// Policy name
    pub policy: String,
    /// Why the settings were refused
    pub message: String,
}

impl fmt::Display for SettingsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "policy {}: {}", self.policy, self.message)
    }
}

/// Errors raised while building or checking a registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Some policies failed to load
    #[error("{} policies failed to load: {}", .0.len(), join(.0))]
    Load(Vec<PolicyError>),
    /// Some policies refused their settings
    #[error("{} policies have invalid settings: {}", .0.len(), join(.0))]
    Settings(Vec<SettingsFailure>),
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Host services shared by every policy of a registry.
#[derive(Clone, Debug, Default)]
pub struct RegistryOptions {
    /// Resolves module references to local files
    pub fetcher: ArtifactFetcher,
    /// Capabilities guests may call
    pub router: Arc<HostCallRouter>,
}

/// Loaded policies in configuration order.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: Vec<Policy>,
}

impl PolicyRegistry {
    /// Fetch, compile and instantiate every policy of `settings`.
    pub async fn load(settings: &Settings, options: RegistryOptions) -> Result<Self, RegistryError> {
        settings.validate()?;

        let loads = settings
            .policies
            .iter()
            .map(|(name, spec)| load_policy(name, spec, settings, &options));
        let mut policies = Vec::with_capacity(settings.policies.len());
        let mut errors = Vec::new();
        for result in join_all(loads).await {
            match result {
                Ok(policy) => policies.push(policy),
                Err(e) => {
                    error!(policy = %e.policy(), error = %e, "cannot load policy");
                    errors.push(e);
                }
            }
        }

        if !errors.is_empty() {
            return Err(RegistryError::Load(errors));
        }
        info!(count = policies.len(), "policies loaded");
        Ok(Self { policies })
    }

    /// Build a registry from already loaded policies, keeping their order.
    pub fn from_policies(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// Policies in configuration order.
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Look a policy up by name.
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name() == name)
    }

    /// Number of policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the registry holds no policy.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Ask every policy to validate its settings, one after the other.
    ///
    /// Every policy is asked even after a failure, so that the error lists all
    /// of them.
    pub async fn validate_all(&self) -> Result<(), RegistryError> {
        let mut failures = Vec::new();
        for policy in &self.policies {
            let message = match policy.validate_settings().await {
                Ok(response) if response.valid => {
                    debug!(policy = %policy.name(), "settings are valid");
                    continue;
                }
                Ok(response) => response
                    .message
                    .unwrap_or_else(|| "settings are not valid".to_string()),
                Err(e) => e.to_string(),
            };
            warn!(policy = %policy.name(), %message, "settings rejected");
            failures.push(SettingsFailure {
                policy: policy.name().to_string(),
                message,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Settings(failures))
        }
    }
}

async fn load_policy(
    name: &str,
    spec: &PolicySpec,
    settings: &Settings,
    options: &RegistryOptions,
) -> Result<Policy, PolicyError> {
    let path = options
        .fetcher
        .fetch(&spec.module, &settings.policies_download_dir)
        .await
        .map_err(|source| PolicyError::Fetch {
            policy: name.to_string(),
            source,
        })?;
    debug!(policy = %name, path = %path.display(), "compiling policy module");

    let runtime_error = |source| PolicyError::Runtime {
        policy: name.to_string(),
        source,
    };
    let module = compile(&path, settings, options).map_err(runtime_error)?;
    let instance = module.instantiate(name).await.map_err(runtime_error)?;

    Ok(Policy::new(name, spec.clone(), instance))
}

fn compile(
    path: &Path,
    settings: &Settings,
    options: &RegistryOptions,
) -> Result<PolicyModule, crate::runtime::RuntimeError> {
    PolicyModule::from_file(
        path,
        Arc::clone(&options.router),
        settings.limits.clone(),
        settings.forward_guest_output,
    )
}
