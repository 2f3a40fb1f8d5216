//! Warden: Wasm Policy Admission Controller
//!
//! Warden evaluates Kubernetes-style admission requests against policies
//! compiled to WebAssembly. Policies are fetched from local files, HTTP
//! servers or OCI registries, run in sandboxed wasmtime instances speaking
//! the waPC protocol, and their answers are folded into a single admit or
//! reject decision.

pub mod admission;
pub mod config;
mod controller;
pub mod dispatch;
pub mod events;
pub mod fetch;
mod limits;
pub mod policy;
pub mod protocol;
mod registry;
pub mod runtime;
pub mod schema;

pub use admission::{AdmissionRequest, AdmissionReview, ReviewVersion, VersionedRequest};
pub use config::{ConfigError, FailurePolicy, MatchPolicy, PolicyMode, PolicySpec, Settings};
pub use controller::{
    Allowed, Controller, ControllerBuilder, DEFAULT_REJECTION_CODE, Decision, INTERNAL_ERROR_CODE,
    INTERNAL_ERROR_MESSAGE, Mutation, Rejection, RejectionReason,
};
pub use events::{AdmissionEvent, ChannelRecorder, EventRecorder, MemoryRecorder, TracingRecorder};
pub use fetch::{ArtifactFetcher, FetchError};
pub use limits::ResourceLimits;
pub use policy::{Policy, PolicyError};
pub use protocol::ProtocolError;
pub use registry::{PolicyRegistry, RegistryError, RegistryOptions, SettingsFailure};
pub use runtime::{HostCallRouter, InvocationStats, PolicyInstance, PolicyModule, RuntimeError};
pub use schema::{ResourceSchema, StaticSchema};
