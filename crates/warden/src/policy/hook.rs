//! Match rules binding a policy to the requests it evaluates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::selector::LabelSelector;
use crate::admission::{
    AdmissionRequest, GroupVersionKind, GroupVersionResource, Operation, ReviewVersion,
};
use crate::config::{MatchPolicy, PolicySpec};
use crate::schema::ResourceSchema;

/// Errors raised while deciding whether a hook applies
#[derive(Debug, Error)]
pub enum MatchError {
    /// An equivalent resource matched but the host does not know its kind
    #[error("no kind registered for equivalent resource {0}")]
    UnknownKind(GroupVersionResource),
}

/// Operation filter in a rule. `*` matches every operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// Every operation
    #[serde(rename = "*")]
    All,
    /// CREATE
    #[serde(rename = "CREATE")]
    Create,
    /// UPDATE
    #[serde(rename = "UPDATE")]
    Update,
    /// DELETE
    #[serde(rename = "DELETE")]
    Delete,
    /// CONNECT
    #[serde(rename = "CONNECT")]
    Connect,
}

impl OperationType {
    fn matches(&self, operation: Operation) -> bool {
        matches!(
            (self, operation),
            (OperationType::All, _)
                | (OperationType::Create, Operation::Create)
                | (OperationType::Update, Operation::Update)
                | (OperationType::Delete, Operation::Delete)
                | (OperationType::Connect, Operation::Connect)
        )
    }
}

/// Which resources a rule applies to by scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleScope {
    /// Cluster-scoped and namespaced resources
    #[default]
    #[serde(rename = "*")]
    All,
    /// Only cluster-scoped resources (namespaces included)
    Cluster,
    /// Only namespaced resources
    Namespaced,
}

/// A rule: operations on group/version/resource combinations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleWithOperations {
    /// Operations the rule applies to
    #[serde(default)]
    pub operations: Vec<OperationType>,
    /// API groups, `""` is the core group, `*` all groups
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// API versions, `*` all versions
    #[serde(default)]
    pub api_versions: Vec<String>,
    /// Resources, optionally with `/subresource`; `*` and `*/*` are wildcards
    #[serde(default)]
    pub resources: Vec<String>,
    /// Scope restriction
    #[serde(default)]
    pub scope: RuleScope,
}

impl RuleWithOperations {
    /// Whether this rule applies to an operation on `resource`.
    ///
    /// `resource` may differ from the request's own resource when evaluating
    /// equivalent resources.
    pub fn matches(
        &self,
        request: &AdmissionRequest,
        resource: &GroupVersionResource,
        sub_resource: &str,
    ) -> bool {
        self.matches_scope(request, resource)
            && self.operations.iter().any(|o| o.matches(request.operation))
            && contains_or_wildcard(&self.api_groups, &resource.group)
            && contains_or_wildcard(&self.api_versions, &resource.version)
            && self.matches_resource(&resource.resource, sub_resource)
    }

    fn matches_scope(&self, request: &AdmissionRequest, resource: &GroupVersionResource) -> bool {
        match self.scope {
            RuleScope::All => true,
            RuleScope::Namespaced => !resource.is_namespace() && !request.namespace.is_empty(),
            RuleScope::Cluster => resource.is_namespace() || request.namespace.is_empty(),
        }
    }

    fn matches_resource(&self, resource: &str, sub_resource: &str) -> bool {
        self.resources.iter().any(|r| {
            let (res, sub) = r.split_once('/').unwrap_or((r.as_str(), ""));
            (res == "*" || res == resource) && (sub == "*" || sub == sub_resource)
        })
    }

    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (field, empty) in [
            ("operations", self.operations.is_empty()),
            ("apiGroups", self.api_groups.is_empty()),
            ("apiVersions", self.api_versions.is_empty()),
            ("resources", self.resources.is_empty()),
        ] {
            if empty {
                problems.push(format!("{field} must not be empty"));
            }
        }
        problems
    }
}

fn contains_or_wildcard(values: &[String], value: &str) -> bool {
    values.iter().any(|v| v == "*" || v == value)
}

/// A request that a hook decided to evaluate, and against which version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Resource the policy sees
    pub resource: GroupVersionResource,
    /// Subresource the policy sees
    pub sub_resource: String,
    /// Kind the policy sees; differs from the request's when converted
    pub kind: GroupVersionKind,
    /// Review version the request is encoded as
    pub review_version: ReviewVersion,
}

/// The precomputed match rule of a policy.
///
/// Every policy owns exactly one hook. Its name doubles as the provenance tag
/// on events and errors.
#[derive(Clone, Debug)]
pub struct Hook {
    name: String,
    rules: Vec<RuleWithOperations>,
    match_policy: MatchPolicy,
    namespace_selector: LabelSelector,
    object_selector: LabelSelector,
    review_version: ReviewVersion,
}

impl Hook {
    /// Build the hook for a policy.
    pub fn new(name: impl Into<String>, spec: &PolicySpec) -> Self {
        // First preferred version we support; config validation guarantees the
        // list is not empty and serde only admits supported versions.
        let review_version = spec
            .admission_review_versions
            .first()
            .copied()
            .unwrap_or(ReviewVersion::V1);

        Self {
            name: name.into(),
            rules: spec.rules.clone(),
            match_policy: spec.match_policy,
            namespace_selector: spec.namespace_selector.clone(),
            object_selector: spec.object_selector.clone(),
            review_version,
        }
    }

    /// Name of the policy owning this hook.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Review version requests are encoded as.
    pub fn review_version(&self) -> ReviewVersion {
        self.review_version
    }

    /// Decide whether the policy must evaluate `request`.
    ///
    /// Returns `None` when the policy does not apply.
    pub fn should_call(
        &self,
        request: &AdmissionRequest,
        schema: &dyn ResourceSchema,
    ) -> Result<Option<Invocation>, MatchError> {
        if !self.matches_namespace(request, schema) || !self.matches_object(request) {
            return Ok(None);
        }

        if self
            .rules
            .iter()
            .any(|r| r.matches(request, &request.resource, &request.sub_resource))
        {
            return Ok(Some(Invocation {
                resource: request.resource.clone(),
                sub_resource: request.sub_resource.clone(),
                kind: request.kind.clone(),
                review_version: self.review_version,
            }));
        }

        if self.match_policy != MatchPolicy::Equivalent {
            return Ok(None);
        }

        let equivalents =
            schema.equivalent_resources(&request.resource, &request.sub_resource);
        // Earlier rules win over later ones
        for rule in &self.rules {
            for equivalent in equivalents.iter().filter(|e| **e != request.resource) {
                if !rule.matches(request, equivalent, &request.sub_resource) {
                    continue;
                }
                let kind = schema
                    .kind_for(equivalent, &request.sub_resource)
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| MatchError::UnknownKind(equivalent.clone()))?;
                return Ok(Some(Invocation {
                    resource: equivalent.clone(),
                    sub_resource: request.sub_resource.clone(),
                    kind,
                    review_version: self.review_version,
                }));
            }
        }

        Ok(None)
    }

    fn matches_namespace(&self, request: &AdmissionRequest, schema: &dyn ResourceSchema) -> bool {
        let is_namespace = request.resource.is_namespace() && request.sub_resource.is_empty();
        // Cluster-scoped resources other than namespaces are never filtered
        if request.namespace.is_empty() && !is_namespace {
            return true;
        }
        if self.namespace_selector.is_empty() {
            return true;
        }

        let labels = if is_namespace {
            // For namespace objects the object itself carries the labels
            request
                .object_labels()
                .or_else(|| request.old_object_labels())
                .unwrap_or_default()
        } else {
            schema
                .namespace_labels(&request.namespace)
                .unwrap_or_default()
        };
        self.namespace_selector.matches(&labels)
    }

    fn matches_object(&self, request: &AdmissionRequest) -> bool {
        if self.object_selector.is_empty() {
            return true;
        }
        [request.object_labels(), request.old_object_labels()]
            .into_iter()
            .flatten()
            .any(|labels| self.object_selector.matches(&labels))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::selector::{SelectorOperator, SelectorRequirement};
    use crate::schema::StaticSchema;
    use serde_json::json;

    fn request(operation: Operation, namespace: &str, resource: GroupVersionResource) -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "uid-1",
            "kind": {"group": resource.group.clone(), "version": resource.version.clone(), "kind": "Thing"},
            "resource": resource,
            "namespace": namespace,
            "operation": operation,
            "object": {"metadata": {"labels": {"app": "web"}}},
        }))
        .unwrap()
    }

    fn pods() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "pods")
    }

    fn rule(operations: &[OperationType], groups: &[&str], versions: &[&str], resources: &[&str]) -> RuleWithOperations {
        RuleWithOperations {
            operations: operations.to_vec(),
            api_groups: groups.iter().map(|s| s.to_string()).collect(),
            api_versions: versions.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
            scope: RuleScope::All,
        }
    }

    fn hook_for(rules: Vec<RuleWithOperations>) -> (PolicySpec, Hook) {
        let mut spec = PolicySpec::new("file:///dev/null");
        spec.rules = rules;
        let hook = Hook::new("test", &spec);
        (spec, hook)
    }

    #[test]
    fn test_exact_rule_match() {
        let r = rule(&[OperationType::Create], &[""], &["v1"], &["pods"]);
        assert!(r.matches(&request(Operation::Create, "default", pods()), &pods(), ""));
        assert!(!r.matches(&request(Operation::Delete, "default", pods()), &pods(), ""));

        let deployments = GroupVersionResource::new("apps", "v1", "deployments");
        assert!(!r.matches(&request(Operation::Create, "default", deployments.clone()), &deployments, ""));
    }

    #[test]
    fn test_wildcards() {
        let r = rule(&[OperationType::All], &["*"], &["*"], &["*"]);
        let deployments = GroupVersionResource::new("apps", "v1", "deployments");
        assert!(r.matches(&request(Operation::Connect, "default", deployments.clone()), &deployments, ""));
        // `*` does not cover subresources
        assert!(!r.matches(&request(Operation::Connect, "default", pods()), &pods(), "exec"));
    }

    #[test]
    fn test_subresources() {
        let exec = rule(&[OperationType::Connect], &[""], &["v1"], &["pods/exec"]);
        let req = request(Operation::Connect, "default", pods());
        assert!(exec.matches(&req, &pods(), "exec"));
        assert!(!exec.matches(&req, &pods(), "attach"));
        assert!(!exec.matches(&req, &pods(), ""));

        let any_status = rule(&[OperationType::All], &["*"], &["*"], &["*/status"]);
        assert!(any_status.matches(&req, &pods(), "status"));

        let all = rule(&[OperationType::All], &["*"], &["*"], &["*/*"]);
        assert!(all.matches(&req, &pods(), "attach"));
        assert!(all.matches(&req, &pods(), ""));

        let pod_any = rule(&[OperationType::All], &[""], &["v1"], &["pods/*"]);
        assert!(pod_any.matches(&req, &pods(), "log"));
    }

    #[test]
    fn test_scope() {
        let mut r = rule(&[OperationType::All], &["*"], &["*"], &["*"]);
        let namespaces = GroupVersionResource::new("", "v1", "namespaces");
        let nodes = GroupVersionResource::new("", "v1", "nodes");

        r.scope = RuleScope::Namespaced;
        assert!(r.matches(&request(Operation::Create, "default", pods()), &pods(), ""));
        assert!(!r.matches(&request(Operation::Create, "", nodes.clone()), &nodes, ""));
        // Namespace objects carry their own name as namespace but are cluster scoped
        assert!(!r.matches(&request(Operation::Create, "team-a", namespaces.clone()), &namespaces, ""));

        r.scope = RuleScope::Cluster;
        assert!(!r.matches(&request(Operation::Create, "default", pods()), &pods(), ""));
        assert!(r.matches(&request(Operation::Create, "", nodes.clone()), &nodes, ""));
        assert!(r.matches(&request(Operation::Create, "team-a", namespaces.clone()), &namespaces, ""));
    }

    #[test]
    fn test_should_call_exact() {
        let (_, hook) = hook_for(vec![rule(&[OperationType::Create], &[""], &["v1"], &["pods"])]);
        let schema = StaticSchema::new();

        let invocation = hook
            .should_call(&request(Operation::Create, "default", pods()), &schema)
            .unwrap()
            .unwrap();
        assert_eq!(invocation.resource, pods());
        assert_eq!(invocation.kind.kind, "Thing");
        assert_eq!(invocation.review_version, ReviewVersion::V1);

        assert!(hook
            .should_call(&request(Operation::Update, "default", pods()), &schema)
            .unwrap()
            .is_none());
    }

    fn deployment_schema() -> StaticSchema {
        StaticSchema::new().with_equivalents([
            (
                GroupVersionResource::new("apps", "v1", "deployments"),
                GroupVersionKind::new("apps", "v1", "Deployment"),
            ),
            (
                GroupVersionResource::new("extensions", "v1beta1", "deployments"),
                GroupVersionKind::new("extensions", "v1beta1", "Deployment"),
            ),
        ])
    }

    #[test]
    fn test_should_call_equivalent() {
        let (_, hook) = hook_for(vec![rule(&[OperationType::All], &["apps"], &["v1"], &["deployments"])]);
        let legacy = GroupVersionResource::new("extensions", "v1beta1", "deployments");

        let invocation = hook
            .should_call(&request(Operation::Create, "default", legacy), &deployment_schema())
            .unwrap()
            .unwrap();
        assert_eq!(invocation.resource, GroupVersionResource::new("apps", "v1", "deployments"));
        assert_eq!(invocation.kind, GroupVersionKind::new("apps", "v1", "Deployment"));
    }

    #[test]
    fn test_should_call_exact_policy_ignores_equivalents() {
        let mut spec = PolicySpec::new("file:///dev/null");
        spec.rules = vec![rule(&[OperationType::All], &["apps"], &["v1"], &["deployments"])];
        spec.match_policy = MatchPolicy::Exact;
        let hook = Hook::new("exact", &spec);
        let legacy = GroupVersionResource::new("extensions", "v1beta1", "deployments");

        assert!(hook
            .should_call(&request(Operation::Create, "default", legacy), &deployment_schema())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_equivalent_without_kind_is_an_error() {
        let schema = StaticSchema::new().with_equivalents([
            (GroupVersionResource::new("apps", "v1", "deployments"), GroupVersionKind::default()),
            (
                GroupVersionResource::new("extensions", "v1beta1", "deployments"),
                GroupVersionKind::new("extensions", "v1beta1", "Deployment"),
            ),
        ]);
        let (_, hook) = hook_for(vec![rule(&[OperationType::All], &["apps"], &["v1"], &["deployments"])]);
        let legacy = GroupVersionResource::new("extensions", "v1beta1", "deployments");

        let err = hook
            .should_call(&request(Operation::Create, "default", legacy), &schema)
            .unwrap_err();
        assert!(matches!(err, MatchError::UnknownKind(_)));
    }

    #[test]
    fn test_namespace_selector() {
        let mut spec = PolicySpec::new("file:///dev/null");
        spec.rules = vec![rule(&[OperationType::All], &["*"], &["*"], &["*"])];
        spec.namespace_selector = LabelSelector {
            match_expressions: vec![SelectorRequirement {
                key: "env".to_string(),
                operator: SelectorOperator::In,
                values: vec!["prod".to_string()],
            }],
            ..Default::default()
        };
        let hook = Hook::new("ns", &spec);
        let schema = StaticSchema::new()
            .with_namespace("prod-apps", [("env", "prod")])
            .with_namespace("dev-apps", [("env", "dev")]);

        let check = |namespace: &str, resource: GroupVersionResource| {
            hook.should_call(&request(Operation::Create, namespace, resource), &schema)
                .unwrap()
                .is_some()
        };

        assert!(check("prod-apps", pods()));
        assert!(!check("dev-apps", pods()));
        assert!(!check("unknown", pods()));
        // Cluster-scoped resources skip the namespace selector
        assert!(check("", GroupVersionResource::new("", "v1", "nodes")));
        // Namespace objects are matched on their own labels
        assert!(!check("team-a", GroupVersionResource::new("", "v1", "namespaces")));
    }

    #[test]
    fn test_object_selector_checks_old_and_new() {
        let mut spec = PolicySpec::new("file:///dev/null");
        spec.rules = vec![rule(&[OperationType::All], &["*"], &["*"], &["*"])];
        spec.object_selector = LabelSelector {
            match_labels: [("app".to_string(), "db".to_string())].into(),
            ..Default::default()
        };
        let hook = Hook::new("obj", &spec);
        let schema = StaticSchema::new();

        let mut req = request(Operation::Update, "default", pods());
        assert!(hook.should_call(&req, &schema).unwrap().is_none());

        req.old_object = Some(json!({"metadata": {"labels": {"app": "db"}}}));
        assert!(hook.should_call(&req, &schema).unwrap().is_some());

        // Objects without metadata never match a non-empty selector
        req.object = Some(json!({"spec": {}}));
        req.old_object = None;
        assert!(hook.should_call(&req, &schema).unwrap().is_none());
    }

    #[test]
    fn test_review_version_preference() {
        let mut spec = PolicySpec::new("file:///dev/null");
        spec.admission_review_versions = vec![ReviewVersion::V1Beta1, ReviewVersion::V1];
        assert_eq!(Hook::new("p", &spec).review_version(), ReviewVersion::V1Beta1);
    }

    #[test]
    fn test_rule_problems() {
        let r = rule(&[], &[""], &[], &["pods"]);
        let problems = r.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("operations")));
        assert!(problems.iter().any(|p| p.contains("apiVersions")));
    }
}
