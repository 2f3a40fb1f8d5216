//! Resource schema and conversion helpers supplied by the host.
//!
//! The controller never hard-codes which API versions serve the same objects,
//! nor how objects are converted between them. That knowledge lives with the
//! host and is reached through [`ResourceSchema`].

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use thiserror::Error;

use crate::admission::{GroupVersionKind, GroupVersionResource};

/// Errors raised while converting an object between versions
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The object is not a JSON object
    #[error("cannot convert a non-object value to {0}")]
    NotAnObject(GroupVersionKind),
    /// The host has no conversion for this kind
    #[error("no conversion to {0}")]
    Unsupported(GroupVersionKind),
}

/// Resource schema and conversion capability provided by the host.
///
/// Implementations must be cheap to call; they are consulted for every
/// request that reaches an `Equivalent` match policy.
pub trait ResourceSchema: Send + Sync {
    /// Resources serving the same objects as `resource`, including itself.
    fn equivalent_resources(
        &self,
        resource: &GroupVersionResource,
        sub_resource: &str,
    ) -> Vec<GroupVersionResource>;

    /// The kind served by `resource`, if known.
    fn kind_for(&self, resource: &GroupVersionResource, sub_resource: &str)
    -> Option<GroupVersionKind>;

    /// Convert `object` to the representation of `to`.
    fn convert(&self, object: &Value, to: &GroupVersionKind) -> Result<Value, ConversionError>;

    /// Labels of the named namespace, `None` if the namespace is unknown.
    fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>>;
}

/// A table-driven [`ResourceSchema`].
///
/// Equivalence groups are declared explicitly. Conversion rewrites `apiVersion`
/// and `kind`, which is correct for resources whose versions share a layout.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    groups: Vec<Vec<(GroupVersionResource, GroupVersionKind)>>,
    namespaces: HashMap<String, BTreeMap<String, String>>,
}

impl StaticSchema {
    /// Create an empty schema: no equivalences, no known namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a group of resources that serve the same objects.
    pub fn with_equivalents(
        mut self,
        resources: impl IntoIterator<Item = (GroupVersionResource, GroupVersionKind)>,
    ) -> Self {
        self.groups.push(resources.into_iter().collect());
        self
    }

    /// Register the labels of a namespace.
    pub fn with_namespace<K, V>(
        mut self,
        name: impl Into<String>,
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.namespaces.insert(name.into(), labels);
        self
    }

    fn group_of(
        &self,
        resource: &GroupVersionResource,
    ) -> Option<&Vec<(GroupVersionResource, GroupVersionKind)>> {
        self.groups
            .iter()
            .find(|group| group.iter().any(|(r, _)| r == resource))
    }
}

impl ResourceSchema for StaticSchema {
    fn equivalent_resources(
        &self,
        resource: &GroupVersionResource,
        _sub_resource: &str,
    ) -> Vec<GroupVersionResource> {
        match self.group_of(resource) {
            Some(group) => group.iter().map(|(r, _)| r.clone()).collect(),
            None => vec![resource.clone()],
        }
    }

    fn kind_for(
        &self,
        resource: &GroupVersionResource,
        _sub_resource: &str,
    ) -> Option<GroupVersionKind> {
        self.group_of(resource)?
            .iter()
            .find(|(r, _)| r == resource)
            .map(|(_, kind)| kind.clone())
    }

    fn convert(&self, object: &Value, to: &GroupVersionKind) -> Result<Value, ConversionError> {
        let mut converted = object.clone();
        let map = converted
            .as_object_mut()
            .ok_or_else(|| ConversionError::NotAnObject(to.clone()))?;
        map.insert("apiVersion".to_string(), Value::String(to.api_version()));
        map.insert("kind".to_string(), Value::String(to.kind.clone()));
        Ok(converted)
    }

    fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces.get(namespace).cloned()
    }
}
