//! Admission request data model.
//!
//! These types mirror the `admission.k8s.io` request shape. They are supplied by
//! the host framework and treated as read-only input: the controller never
//! mutates an incoming request, it only derives versioned copies of it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operation being admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// A resource is being created
    Create,
    /// A resource is being updated
    Update,
    /// A resource is being deleted
    Delete,
    /// A connect request (exec, attach, port-forward, ...)
    Connect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        };
        f.write_str(name)
    }
}

/// Identifies a kind of object: `group/version, Kind=kind`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Object kind
    pub kind: String,
}

impl GroupVersionKind {
    /// Create a new kind.
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// The `apiVersion` string (`v1` for the core group, `apps/v1` otherwise).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// True when no kind is set.
    pub fn is_empty(&self) -> bool {
        self.group.is_empty() && self.version.is_empty() && self.kind.is_empty()
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identifies a resource endpoint: `group/version/resource`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionResource {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
}

impl GroupVersionResource {
    /// Create a new resource.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// True for the core `v1/namespaces` resource.
    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.version == "v1" && self.resource == "namespaces"
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Information about the user issuing the request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// User name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// User UID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Groups the user belongs to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Additional authenticator-provided information
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// A pending change submitted for an admission decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Unique identifier of this admission call
    pub uid: String,
    /// Kind of the object being submitted
    pub kind: GroupVersionKind,
    /// Resource being requested
    pub resource: GroupVersionResource,
    /// Subresource being requested, if any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_resource: String,
    /// Kind of the original request, when it was converted before evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    /// Resource of the original request, when it was converted before evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    /// Subresource of the original request
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_sub_resource: String,
    /// Name of the object, may be empty on CREATE with generated names
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Namespace of the object, empty for cluster-scoped resources
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Operation being performed
    pub operation: Operation,
    /// Requesting user
    #[serde(default)]
    pub user_info: UserInfo,
    /// The new object, absent on DELETE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// The existing object, present on UPDATE and DELETE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,
    /// Whether this is a dry run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    /// Operation options (CreateOptions, UpdateOptions, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl AdmissionRequest {
    /// Labels of the new object, if it has any.
    pub fn object_labels(&self) -> Option<BTreeMap<String, String>> {
        self.object.as_ref().and_then(labels_of)
    }

    /// Labels of the existing object, if it has any.
    pub fn old_object_labels(&self) -> Option<BTreeMap<String, String>> {
        self.old_object.as_ref().and_then(labels_of)
    }
}

/// Extract `metadata.labels` from an object.
///
/// Returns `None` for objects that cannot carry labels (no `metadata`).
pub fn labels_of(object: &Value) -> Option<BTreeMap<String, String>> {
    let metadata = object.get("metadata")?.as_object()?;
    let labels = match metadata.get("labels") {
        Some(Value::Object(labels)) => labels
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    };
    Some(labels)
}

/// Admission review API versions understood by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewVersion {
    /// `admission.k8s.io/v1`
    #[serde(rename = "v1")]
    V1,
    /// `admission.k8s.io/v1beta1`
    #[serde(rename = "v1beta1")]
    V1Beta1,
}

impl ReviewVersion {
    /// Versions in order of preference.
    pub const SUPPORTED: [ReviewVersion; 2] = [ReviewVersion::V1, ReviewVersion::V1Beta1];

    /// The fully qualified `apiVersion`.
    pub fn api_version(&self) -> &'static str {
        match self {
            ReviewVersion::V1 => "admission.k8s.io/v1",
            ReviewVersion::V1Beta1 => "admission.k8s.io/v1beta1",
        }
    }
}

/// An admission request encoded for a specific review version.
///
/// Both versions share the same request layout; the tag only decides which
/// version the request is advertised as.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VersionedRequest {
    /// `admission.k8s.io/v1` request
    V1(AdmissionRequest),
    /// `admission.k8s.io/v1beta1` request
    V1Beta1(AdmissionRequest),
}

impl VersionedRequest {
    /// Wrap a request for the given review version.
    pub fn new(version: ReviewVersion, request: AdmissionRequest) -> Self {
        match version {
            ReviewVersion::V1 => VersionedRequest::V1(request),
            ReviewVersion::V1Beta1 => VersionedRequest::V1Beta1(request),
        }
    }

    /// The review version of this request.
    pub fn version(&self) -> ReviewVersion {
        match self {
            VersionedRequest::V1(_) => ReviewVersion::V1,
            VersionedRequest::V1Beta1(_) => ReviewVersion::V1Beta1,
        }
    }

    /// The wrapped request.
    pub fn request(&self) -> &AdmissionRequest {
        match self {
            VersionedRequest::V1(request) | VersionedRequest::V1Beta1(request) => request,
        }
    }

    /// Kind of the object as presented to the policy.
    pub fn kind(&self) -> &GroupVersionKind {
        &self.request().kind
    }

    /// Resource as presented to the policy.
    pub fn resource(&self) -> &GroupVersionResource {
        &self.request().resource
    }
}

/// An `AdmissionReview` envelope as exchanged with admission webhooks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    /// `admission.k8s.io/v1` or `admission.k8s.io/v1beta1`
    #[serde(default)]
    pub api_version: String,
    /// Always `AdmissionReview`
    #[serde(default)]
    pub kind: String,
    /// The request, set on the way in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    /// The response, set on the way out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod_request() -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "nginx",
            "namespace": "default",
            "operation": "CREATE",
            "userInfo": {"username": "admin", "groups": ["system:authenticated"]},
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "nginx", "labels": {"app": "web"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_request_deserializes() {
        let request = pod_request();
        assert_eq!(request.operation, Operation::Create);
        assert_eq!(request.kind.kind, "Pod");
        assert_eq!(request.resource.resource, "pods");
        assert!(request.old_object.is_none());
        assert_eq!(request.user_info.username, "admin");
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let mut request = pod_request();
        request.old_object = Some(json!({"metadata": {}}));
        let value = serde_json::to_value(&request).unwrap();

        assert!(value.get("oldObject").is_some());
        assert!(value.get("userInfo").is_some());
        // Empty optional fields are omitted
        assert!(value.get("subResource").is_none());
        assert!(value.get("requestKind").is_none());
    }

    #[test]
    fn test_object_labels() {
        let request = pod_request();
        let labels = request.object_labels().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert!(request.old_object_labels().is_none());
    }

    #[test]
    fn test_labels_of_object_without_metadata() {
        assert!(labels_of(&json!({"spec": {}})).is_none());
        assert_eq!(labels_of(&json!({"metadata": {}})), Some(BTreeMap::new()));
    }

    #[test]
    fn test_api_version() {
        assert_eq!(GroupVersionKind::new("", "v1", "Pod").api_version(), "v1");
        assert_eq!(
            GroupVersionKind::new("apps", "v1", "Deployment").api_version(),
            "apps/v1"
        );
    }

    #[test]
    fn test_namespace_resource() {
        assert!(GroupVersionResource::new("", "v1", "namespaces").is_namespace());
        assert!(!GroupVersionResource::new("", "v1", "pods").is_namespace());
    }

    #[test]
    fn test_versioned_request_accessors() {
        let request = VersionedRequest::new(ReviewVersion::V1Beta1, pod_request());
        assert_eq!(request.version(), ReviewVersion::V1Beta1);
        assert_eq!(request.kind().kind, "Pod");
        assert_eq!(request.resource().resource, "pods");

        // Both versions serialize to the same request layout
        let v1 = serde_json::to_value(VersionedRequest::new(ReviewVersion::V1, pod_request())).unwrap();
        let v1beta1 = serde_json::to_value(&request).unwrap();
        assert_eq!(v1, v1beta1);
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(Operation::Connect.to_string(), "CONNECT");
        let op: Operation = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(op, Operation::Delete);
    }
}
