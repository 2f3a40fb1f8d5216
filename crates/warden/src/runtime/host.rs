//! Host capabilities exposed to guests through `__host_call`.
//!
//! A guest names a capability with a (namespace, operation) pair. Each pair is
//! routed to a [`HostCallHandler`]; pairs without a route answer with
//! [`DEFAULT_RESPONSE`] so that guests probing optional capabilities keep
//! working on hosts that do not provide them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

/// Response returned for host calls without a route.
pub const DEFAULT_RESPONSE: &[u8] = b"default";

/// A host call issued by a guest.
#[derive(Debug, Clone)]
pub struct HostCall {
    /// Name of the policy whose guest issued the call
    pub policy: Arc<str>,
    /// Binding the guest addressed (free form, guest defined)
    pub binding: String,
    /// Capability namespace
    pub namespace: String,
    /// Capability operation
    pub operation: String,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Outcome of a host call: response bytes, or an error message handed back
/// to the guest.
pub type HostCallResult = Result<Vec<u8>, String>;

/// Handler for one host capability.
///
/// ```rust,ignore
/// let router = HostCallRouter::new().route("crypto", "verify", |call: HostCall| async move {
///     HostCallResult::Ok(b"true".to_vec())
/// });
/// ```
#[async_trait]
pub trait HostCallHandler: Send + Sync {
    /// Serve a call from the guest.
    async fn call(&self, call: HostCall) -> HostCallResult;
}

/// Blanket implementation for async closures.
#[async_trait]
impl<F, Fut> HostCallHandler for F
where
    F: Fn(HostCall) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HostCallResult> + Send,
{
    async fn call(&self, call: HostCall) -> HostCallResult {
        self(call).await
    }
}

/// Capability table keyed by (namespace, operation).
#[derive(Clone, Default)]
pub struct HostCallRouter {
    routes: HashMap<(String, String), Arc<dyn HostCallHandler>>,
}

impl fmt::Debug for HostCallRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<_> = self
            .routes
            .keys()
            .map(|(ns, op)| format!("{ns}/{op}"))
            .collect();
        routes.sort();
        f.debug_struct("HostCallRouter")
            .field("routes", &routes)
            .finish()
    }
}

impl HostCallRouter {
    /// Create a router without routes: every call gets the default response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `namespace`/`operation` to `handler`, replacing any previous route.
    pub fn route(
        mut self,
        namespace: impl Into<String>,
        operation: impl Into<String>,
        handler: impl HostCallHandler + 'static,
    ) -> Self {
        self.routes
            .insert((namespace.into(), operation.into()), Arc::new(handler));
        self
    }

    /// Whether a route exists for `namespace`/`operation`.
    pub fn handles(&self, namespace: &str, operation: &str) -> bool {
        self.routes
            .contains_key(&(namespace.to_string(), operation.to_string()))
    }

    /// Serve a call.
    pub async fn dispatch(&self, call: HostCall) -> HostCallResult {
        let key = (call.namespace.clone(), call.operation.clone());
        match self.routes.get(&key) {
            Some(handler) => handler.call(call).await,
            None => {
                debug!(
                    policy = %call.policy,
                    binding = %call.binding,
                    namespace = %call.namespace,
                    operation = %call.operation,
                    "no route for host call"
                );
                Ok(DEFAULT_RESPONSE.to_vec())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call(namespace: &str, operation: &str, payload: &[u8]) -> HostCall {
        HostCall {
            policy: Arc::from("test"),
            binding: "warden".to_string(),
            namespace: namespace.to_string(),
            operation: operation.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_unrouted_call_gets_default() {
        let router = HostCallRouter::new();
        let response = router.dispatch(call("oci", "manifest", b"{}")).await;
        assert_eq!(response.unwrap(), DEFAULT_RESPONSE);
    }

    #[tokio::test]
    async fn test_routed_call() {
        let router = HostCallRouter::new()
            .route("test", "echo", |call: HostCall| async move { HostCallResult::Ok(call.payload) })
            .route("test", "fail", |call: HostCall| async move {
                HostCallResult::Err(format!("{} is not allowed", call.operation))
            });

        assert!(router.handles("test", "echo"));
        assert!(!router.handles("test", "other"));
        assert_eq!(
            router.dispatch(call("test", "echo", b"ping")).await.unwrap(),
            b"ping"
        );
        assert_eq!(
            router.dispatch(call("test", "fail", b"")).await.unwrap_err(),
            "fail is not allowed"
        );
        // Same operation, other namespace
        assert_eq!(
            router.dispatch(call("other", "echo", b"ping")).await.unwrap(),
            DEFAULT_RESPONSE
        );
    }

    #[tokio::test]
    async fn test_handler_sees_policy_and_binding() {
        let router = HostCallRouter::new().route("meta", "whoami", |call: HostCall| async move {
            HostCallResult::Ok(format!("{}@{}", call.policy, call.binding).into_bytes())
        });

        let response = router.dispatch(call("meta", "whoami", b"")).await.unwrap();
        assert_eq!(response, b"test@warden");
    }
}
