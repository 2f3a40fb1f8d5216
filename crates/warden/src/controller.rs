//! Admission decisions.
//!
//! The [`Controller`] evaluates a request against the registry and folds the
//! answers of the matched policies into one [`Decision`]:
//!
//! - no policy matches: allowed, nothing recorded;
//! - a protect-mode policy rejects: rejected right away, later policies are
//!   not invoked;
//! - a monitor-mode policy rejects: an event is recorded, evaluation goes on;
//! - a policy cannot be evaluated: its failure policy decides.
//!
//! ```rust,ignore
//! let registry = PolicyRegistry::load(&settings, RegistryOptions::default()).await?;
//! let controller = Controller::builder(registry)
//!     .schema(StaticSchema::new())
//!     .recorder(TracingRecorder)
//!     .initialize()
//!     .await?;
//!
//! match controller.validate(&request).await {
//!     Decision::Allowed(_) => {}
//!     Decision::Rejected(rejection) => eprintln!("{}: {}", rejection.policy, rejection.message),
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionRequest;
use crate::config::{FailurePolicy, PolicyMode};
use crate::dispatch::{self, MatchedPolicy, RequestVersions};
use crate::events::{AdmissionEvent, EventKind, EventRecorder, TracingRecorder};
use crate::policy::{MatchError, Policy, PolicyError};
use crate::protocol::ValidationResponse;
use crate::registry::{PolicyRegistry, RegistryError};
use crate::schema::{ConversionError, ResourceSchema, StaticSchema};

/// Status code of rejections that do not carry one.
pub const DEFAULT_REJECTION_CODE: u16 = 403;

/// Status code of rejections caused by a failed evaluation.
pub const INTERNAL_ERROR_CODE: u16 = 500;

/// Message returned when a policy cannot be evaluated. Details are logged.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while evaluating policy";

/// Outcome of evaluating a request.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// The request may proceed
    Allowed(Allowed),
    /// The request is denied
    Rejected(Rejection),
}

/// Details of an allowed request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Allowed {
    /// Objects proposed by mutating policies, in evaluation order
    pub mutations: Vec<Mutation>,
}

/// An object proposed by a mutating policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Policy proposing the object
    pub policy: String,
    /// The mutated object
    pub object: Value,
}

/// Why a request was denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The policy rejected the request
    Policy,
    /// The policy could not be evaluated
    Internal,
}

/// Details of a denied request.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    /// Policy responsible for the rejection
    pub policy: String,
    /// Message for the client
    pub message: String,
    /// HTTP-like status code
    pub code: u16,
    /// Why the request was denied
    pub reason: RejectionReason,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    /// The rejection, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Rejected(rejection) => Some(rejection),
            Decision::Allowed(_) => None,
        }
    }

    /// Render as the `response` of an `AdmissionReview`.
    pub fn into_response(self, uid: &str) -> Value {
        match self {
            Decision::Allowed(_) => json!({
                "uid": uid,
                "allowed": true,
            }),
            Decision::Rejected(rejection) => json!({
                "uid": uid,
                "allowed": false,
                "status": {
                    "code": rejection.code,
                    "message": rejection.message,
                },
            }),
        }
    }
}

#[derive(Debug, Error)]
enum EvaluationError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("cannot convert request: {0}")]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    registry: PolicyRegistry,
    schema: Arc<dyn ResourceSchema>,
    recorder: Arc<dyn EventRecorder>,
}

impl std::fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ControllerBuilder {
    /// Resource schema used for equivalent matching and conversions.
    ///
    /// Defaults to an empty [`StaticSchema`].
    pub fn schema(mut self, schema: impl ResourceSchema + 'static) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Where events go. Defaults to [`TracingRecorder`].
    pub fn recorder(mut self, recorder: impl EventRecorder + 'static) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Validate the settings of every policy and build the controller.
    pub async fn initialize(self) -> Result<Controller, RegistryError> {
        self.registry.validate_all().await?;
        info!(policies = self.registry.len(), "admission controller ready");
        Ok(Controller {
            registry: self.registry,
            schema: self.schema,
            recorder: self.recorder,
        })
    }
}

/// Evaluates admission requests against a registry of policies.
///
/// `Controller` is `Send + Sync`; share it behind an `Arc` to evaluate
/// requests concurrently.
pub struct Controller {
    registry: PolicyRegistry,
    schema: Arc<dyn ResourceSchema>,
    recorder: Arc<dyn EventRecorder>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Start building a controller around `registry`.
    pub fn builder(registry: PolicyRegistry) -> ControllerBuilder {
        ControllerBuilder {
            registry,
            schema: Arc::new(StaticSchema::new()),
            recorder: Arc::new(TracingRecorder),
        }
    }

    /// The policies this controller evaluates.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Evaluate `request`, each policy under its own deadline.
    pub async fn validate(&self, request: &AdmissionRequest) -> Decision {
        self.evaluate(request, None).await
    }

    /// Evaluate `request`, each policy under `timeout`.
    pub async fn validate_with_timeout(
        &self,
        request: &AdmissionRequest,
        timeout: Duration,
    ) -> Decision {
        self.evaluate(request, Some(timeout)).await
    }

    async fn evaluate(&self, request: &AdmissionRequest, timeout: Option<Duration>) -> Decision {
        let matched = dispatch::match_policies(request, self.registry.policies(), &*self.schema);
        if matched.is_empty() {
            debug!(uid = %request.uid, kind = %request.kind, "no policy matches");
            return Decision::Allowed(Allowed::default());
        }

        let mut versions = RequestVersions::new(request, &*self.schema);
        let mut mutations = Vec::new();
        for MatchedPolicy { policy, invocation } in matched {
            let outcome = match invocation {
                Ok(invocation) => Self::invoke(policy, &invocation, &mut versions, timeout).await,
                Err(e) => Err(e.into()),
            };

            match outcome {
                Err(e) => {
                    if let Some(rejection) = self.on_error(policy, request, e) {
                        return Decision::Rejected(rejection);
                    }
                }
                Ok(response) if !response.accepted => {
                    if let Some(rejection) = self.on_rejection(policy, request, response) {
                        return Decision::Rejected(rejection);
                    }
                }
                Ok(response) => {
                    let Some(object) = response.mutated_object else {
                        continue;
                    };
                    if policy.mode() == PolicyMode::Protect && policy.spec().mutating {
                        debug!(policy = %policy.name(), uid = %request.uid, "policy mutated the object");
                        mutations.push(Mutation {
                            policy: policy.name().to_string(),
                            object,
                        });
                    } else {
                        warn!(
                            policy = %policy.name(),
                            mode = %policy.mode(),
                            uid = %request.uid,
                            "discarding mutated object from a policy not allowed to mutate"
                        );
                    }
                }
            }
        }

        Decision::Allowed(Allowed { mutations })
    }

    async fn invoke(
        policy: &Policy,
        invocation: &crate::policy::Invocation,
        versions: &mut RequestVersions<'_>,
        timeout: Option<Duration>,
    ) -> Result<ValidationResponse, EvaluationError> {
        let versioned = versions.get(invocation)?;
        let response = match timeout {
            Some(timeout) => policy.validate_with_timeout(&versioned, timeout).await?,
            None => policy.validate(&versioned).await?,
        };
        Ok(response)
    }

    fn on_rejection(
        &self,
        policy: &Policy,
        request: &AdmissionRequest,
        response: ValidationResponse,
    ) -> Option<Rejection> {
        let code = response.code.unwrap_or(DEFAULT_REJECTION_CODE);
        let message = response
            .message
            .unwrap_or_else(|| format!("rejected by policy {}", policy.name()));

        self.recorder.record(
            AdmissionEvent::new(
                policy.name(),
                policy.mode(),
                EventKind::Rejection,
                message.clone(),
                request,
            )
            .with_code(code),
        );

        match policy.mode() {
            PolicyMode::Monitor => {
                info!(policy = %policy.name(), uid = %request.uid, %message, "monitor-mode policy rejected request");
                None
            }
            PolicyMode::Protect => {
                info!(policy = %policy.name(), uid = %request.uid, code, %message, "request rejected");
                Some(Rejection {
                    policy: policy.name().to_string(),
                    message,
                    code,
                    reason: RejectionReason::Policy,
                })
            }
        }
    }

    fn on_error(
        &self,
        policy: &Policy,
        request: &AdmissionRequest,
        error: EvaluationError,
    ) -> Option<Rejection> {
        error!(
            policy = %policy.name(),
            mode = %policy.mode(),
            failure_policy = ?policy.spec().failure_policy,
            uid = %request.uid,
            error = %error,
            "policy evaluation failed"
        );

        if policy.mode() == PolicyMode::Monitor {
            self.record_error(policy, request, &error);
            return None;
        }

        match policy.spec().failure_policy {
            FailurePolicy::Ignore => None,
            FailurePolicy::Fail => {
                self.record_error(policy, request, &error);
                Some(Rejection {
                    policy: policy.name().to_string(),
                    message: INTERNAL_ERROR_MESSAGE.to_string(),
                    code: INTERNAL_ERROR_CODE,
                    reason: RejectionReason::Internal,
                })
            }
        }
    }

    fn record_error(&self, policy: &Policy, request: &AdmissionRequest, error: &EvaluationError) {
        self.recorder.record(AdmissionEvent::new(
            policy.name(),
            policy.mode(),
            EventKind::InvocationError,
            error.to_string(),
            request,
        ));
    }
}
