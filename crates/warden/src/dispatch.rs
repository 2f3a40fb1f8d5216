//! Selecting the policies that evaluate a request.
//!
//! [`match_policies`] returns the applicable policies in registry order.
//! [`RequestVersions`] then hands each of them the request as it must see it:
//! converted to the kind its rule matched, and tagged with its review version.
//! Conversions run once per target kind, whatever the review versions asking
//! for it, and the versioned copies are shared.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::admission::{
    AdmissionRequest, GroupVersionKind, GroupVersionResource, ReviewVersion, VersionedRequest,
};
use crate::policy::{Invocation, MatchError, Policy};
use crate::schema::{ConversionError, ResourceSchema};

/// A policy selected for a request.
#[derive(Debug)]
pub struct MatchedPolicy<'a> {
    /// The policy
    pub policy: &'a Policy,
    /// How the policy sees the request, or why that could not be decided
    pub invocation: Result<Invocation, MatchError>,
}

/// Policies of `policies` that apply to `request`, in order.
///
/// A policy whose hook fails to decide is kept along with its error, so that
/// its failure policy decides what happens.
pub fn match_policies<'a>(
    request: &AdmissionRequest,
    policies: &'a [Policy],
    schema: &dyn ResourceSchema,
) -> Vec<MatchedPolicy<'a>> {
    policies
        .iter()
        .filter_map(|policy| {
            let invocation = policy.hook().should_call(request, schema).transpose()?;
            Some(MatchedPolicy { policy, invocation })
        })
        .collect()
}

type TargetKey = (GroupVersionKind, GroupVersionResource, String);
type VersionKey = (TargetKey, ReviewVersion);

/// Versioned copies of one request, built on demand.
pub struct RequestVersions<'r> {
    request: &'r AdmissionRequest,
    schema: &'r dyn ResourceSchema,
    converted: HashMap<TargetKey, AdmissionRequest>,
    cache: HashMap<VersionKey, Arc<VersionedRequest>>,
}

impl std::fmt::Debug for RequestVersions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestVersions")
            .field("uid", &self.request.uid)
            .field("converted", &self.converted.len())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<'r> RequestVersions<'r> {
    /// Start with no copy built.
    pub fn new(request: &'r AdmissionRequest, schema: &'r dyn ResourceSchema) -> Self {
        Self {
            request,
            schema,
            converted: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    /// The request as seen through `invocation`.
    pub fn get(&mut self, invocation: &Invocation) -> Result<Arc<VersionedRequest>, ConversionError> {
        let target = (
            invocation.kind.clone(),
            invocation.resource.clone(),
            invocation.sub_resource.clone(),
        );
        let key = (target, invocation.review_version);
        if let Some(versioned) = self.cache.get(&key) {
            return Ok(Arc::clone(versioned));
        }

        let converted = match self.converted.get(&key.0) {
            Some(converted) => converted.clone(),
            None => {
                let converted = convert_request(self.request, invocation, self.schema)?;
                self.converted.insert(key.0.clone(), converted.clone());
                converted
            }
        };
        let versioned = Arc::new(VersionedRequest::new(invocation.review_version, converted));
        self.cache.insert(key, Arc::clone(&versioned));
        Ok(versioned)
    }

    /// Number of distinct copies built so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no copy was built yet.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Rewrite `request` for `invocation`.
///
/// `kind`, `resource` and `subResource` become the invocation's while the
/// `request*` fields keep what the client actually sent. Objects are only
/// converted when the kind differs.
fn convert_request(
    request: &AdmissionRequest,
    invocation: &Invocation,
    schema: &dyn ResourceSchema,
) -> Result<AdmissionRequest, ConversionError> {
    let mut converted = request.clone();
    converted
        .request_kind
        .get_or_insert_with(|| request.kind.clone());
    converted
        .request_resource
        .get_or_insert_with(|| request.resource.clone());
    if converted.request_sub_resource.is_empty() {
        converted.request_sub_resource = request.sub_resource.clone();
    }

    if invocation.kind != request.kind {
        debug!(uid = %request.uid, from = %request.kind, to = %invocation.kind, "converting request");
        converted.object = request
            .object
            .as_ref()
            .map(|o| schema.convert(o, &invocation.kind))
            .transpose()?;
        converted.old_object = request
            .old_object
            .as_ref()
            .map(|o| schema.convert(o, &invocation.kind))
            .transpose()?;
    }
    converted.kind = invocation.kind.clone();
    converted.resource = invocation.resource.clone();
    converted.sub_resource = invocation.sub_resource.clone();

    Ok(converted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::schema::StaticSchema;

    fn deployment_request() -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "1",
            "kind": {"group": "extensions", "version": "v1beta1", "kind": "Deployment"},
            "resource": {"group": "extensions", "version": "v1beta1", "resource": "deployments"},
            "operation": "CREATE",
            "namespace": "default",
            "object": {
                "apiVersion": "extensions/v1beta1",
                "kind": "Deployment",
                "metadata": {"name": "web"},
            },
        }))
        .unwrap()
    }

    fn apps_v1() -> (GroupVersionResource, GroupVersionKind) {
        (
            GroupVersionResource::new("apps", "v1", "deployments"),
            GroupVersionKind::new("apps", "v1", "Deployment"),
        )
    }

    fn schema() -> StaticSchema {
        StaticSchema::new().with_equivalents([
            apps_v1(),
            (
                GroupVersionResource::new("extensions", "v1beta1", "deployments"),
                GroupVersionKind::new("extensions", "v1beta1", "Deployment"),
            ),
        ])
    }

    fn invocation(version: ReviewVersion) -> Invocation {
        let (resource, kind) = apps_v1();
        Invocation {
            resource,
            sub_resource: String::new(),
            kind,
            review_version: version,
        }
    }

    #[test]
    fn test_conversion_keeps_original_coordinates() {
        let request = deployment_request();
        let schema = schema();
        let mut versions = RequestVersions::new(&request, &schema);

        let versioned = versions.get(&invocation(ReviewVersion::V1)).unwrap();
        let converted = versioned.request();

        assert_eq!(converted.kind, GroupVersionKind::new("apps", "v1", "Deployment"));
        assert_eq!(
            converted.resource,
            GroupVersionResource::new("apps", "v1", "deployments")
        );
        assert_eq!(converted.request_kind.as_ref(), Some(&request.kind));
        assert_eq!(converted.request_resource.as_ref(), Some(&request.resource));
        assert_eq!(converted.object.as_ref().unwrap()["apiVersion"], "apps/v1");
        // The original is untouched
        assert_eq!(request.object.as_ref().unwrap()["apiVersion"], "extensions/v1beta1");
    }

    #[test]
    fn test_conversion_is_shared() {
        let request = deployment_request();
        let schema = schema();
        let mut versions = RequestVersions::new(&request, &schema);

        let first = versions.get(&invocation(ReviewVersion::V1)).unwrap();
        let second = versions.get(&invocation(ReviewVersion::V1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(versions.len(), 1);

        let beta = versions.get(&invocation(ReviewVersion::V1Beta1)).unwrap();
        assert_eq!(beta.version(), ReviewVersion::V1Beta1);
        assert_eq!(beta.request(), first.request());
        assert_eq!(versions.len(), 2);
    }

    /// Counts the conversions it performs.
    struct CountingSchema {
        inner: StaticSchema,
        conversions: AtomicUsize,
    }

    impl ResourceSchema for CountingSchema {
        fn equivalent_resources(
            &self,
            resource: &GroupVersionResource,
            sub_resource: &str,
        ) -> Vec<GroupVersionResource> {
            self.inner.equivalent_resources(resource, sub_resource)
        }

        fn kind_for(
            &self,
            resource: &GroupVersionResource,
            sub_resource: &str,
        ) -> Option<GroupVersionKind> {
            self.inner.kind_for(resource, sub_resource)
        }

        fn convert(&self, object: &Value, to: &GroupVersionKind) -> Result<Value, ConversionError> {
            self.conversions.fetch_add(1, Ordering::SeqCst);
            self.inner.convert(object, to)
        }

        fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
            self.inner.namespace_labels(namespace)
        }
    }

    #[test]
    fn test_review_versions_share_one_conversion() {
        let request = deployment_request();
        let schema = CountingSchema {
            inner: schema(),
            conversions: AtomicUsize::new(0),
        };
        let mut versions = RequestVersions::new(&request, &schema);

        let v1 = versions.get(&invocation(ReviewVersion::V1)).unwrap();
        let beta = versions.get(&invocation(ReviewVersion::V1Beta1)).unwrap();
        versions.get(&invocation(ReviewVersion::V1)).unwrap();

        // Only `object` is set, so a single conversion call
        assert_eq!(schema.conversions.load(Ordering::SeqCst), 1);
        assert_eq!(v1.request(), beta.request());
        assert_eq!(beta.request().object.as_ref().unwrap()["apiVersion"], "apps/v1");
    }

    #[test]
    fn test_same_kind_is_not_converted() {
        let request = deployment_request();
        let schema = StaticSchema::new();
        let mut versions = RequestVersions::new(&request, &schema);

        let own = Invocation {
            resource: request.resource.clone(),
            sub_resource: String::new(),
            kind: request.kind.clone(),
            review_version: ReviewVersion::V1,
        };
        let versioned = versions.get(&own).unwrap();
        assert_eq!(versioned.request().object, request.object);
        assert_eq!(versioned.kind(), &request.kind);
    }
}
