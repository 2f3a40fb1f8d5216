//! Admission events emitted while evaluating requests.
//!
//! Events are how monitor-mode policies report, and how operators learn which
//! policy rejected what. Recording sits on the request path, so
//! [`EventRecorder::record`] must neither block nor fail.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::admission::{AdmissionRequest, GroupVersionKind, Operation};
use crate::config::PolicyMode;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// The policy rejected the request
    Rejection,
    /// The policy could not be evaluated
    InvocationError,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Rejection => f.write_str("rejection"),
            EventKind::InvocationError => f.write_str("invocation error"),
        }
    }
}

/// An event about one policy and one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionEvent {
    /// Policy the event is about
    pub policy: String,
    /// Mode of that policy
    pub mode: PolicyMode,
    /// What happened
    pub kind: EventKind,
    /// Message from the policy, or the error
    pub message: String,
    /// Status code returned by the policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Uid of the admission request
    pub uid: String,
    /// Kind of the object under review
    pub target: GroupVersionKind,
    /// Namespace of the object, empty when cluster scoped
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Name of the object
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Operation under review
    pub operation: Operation,
}

impl AdmissionEvent {
    /// An event about `request` attributed to `policy`.
    pub fn new(
        policy: impl Into<String>,
        mode: PolicyMode,
        kind: EventKind,
        message: impl Into<String>,
        request: &AdmissionRequest,
    ) -> Self {
        Self {
            policy: policy.into(),
            mode,
            kind,
            message: message.into(),
            code: None,
            uid: request.uid.clone(),
            target: request.kind.clone(),
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            operation: request.operation,
        }
    }

    /// Attach the status code returned by the policy.
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }
}

/// Sink for admission events.
pub trait EventRecorder: Send + Sync {
    /// Record an event. Must not block.
    fn record(&self, event: AdmissionEvent);
}

/// Logs events with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: AdmissionEvent) {
        info!(
            policy = %event.policy,
            mode = %event.mode,
            kind = %event.kind,
            uid = %event.uid,
            api_version = %event.target.api_version(),
            target = %event.target.kind,
            namespace = %event.namespace,
            name = %event.name,
            operation = %event.operation,
            code = ?event.code,
            "{}",
            event.message
        );
    }
}

/// Forwards events to a bounded channel.
///
/// When the channel is full the event is dropped with a warning, so a slow
/// consumer never stalls admission.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    tx: mpsc::Sender<AdmissionEvent>,
}

impl ChannelRecorder {
    /// Create a recorder and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AdmissionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventRecorder for ChannelRecorder {
    fn record(&self, event: AdmissionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(event) => ("channel full", event),
                mpsc::error::TrySendError::Closed(event) => ("channel closed", event),
            };
            warn!(policy = %event.policy, uid = %event.uid, reason, "dropping admission event");
        }
    }
}

/// Keeps events in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
}

impl MemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: AdmissionEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(policy: &str) -> AdmissionEvent {
        let request: AdmissionRequest = serde_json::from_value(json!({
            "uid": "abc",
            "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
            "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
            "name": "web",
            "namespace": "prod",
            "operation": "UPDATE",
        }))
        .unwrap();
        AdmissionEvent::new(
            policy,
            PolicyMode::Monitor,
            EventKind::Rejection,
            "replicas too high",
            &request,
        )
        .with_code(400)
    }

    #[test]
    fn test_event_describes_request() {
        let event = event("replicas");
        assert_eq!(event.target.api_version(), "apps/v1");
        assert_eq!(event.target.kind, "Deployment");
        assert_eq!(event.namespace, "prod");
        assert_eq!(event.name, "web");
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.code, Some(400));
    }

    #[test]
    fn test_memory_recorder_shares_buffer() {
        let recorder = MemoryRecorder::new();
        let clone = recorder.clone();
        clone.record(event("a"));
        recorder.record(event("b"));

        let policies: Vec<_> = recorder.events().into_iter().map(|e| e.policy).collect();
        assert_eq!(policies, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_channel_recorder_drops_when_full() {
        let (recorder, mut rx) = ChannelRecorder::new(1);
        recorder.record(event("first"));
        // Does not block even though nobody is receiving
        recorder.record(event("second"));

        assert_eq!(rx.recv().await.unwrap().policy, "first");
        assert!(rx.try_recv().is_err());

        drop(rx);
        recorder.record(event("closed"));
    }

    #[test]
    fn test_tracing_recorder_does_not_panic() {
        TracingRecorder.record(event("logged"));
    }
}
