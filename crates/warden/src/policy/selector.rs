//! Label selectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Set-based requirement operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    /// The label value is one of `values`
    In,
    /// The label is absent or its value is not one of `values`
    NotIn,
    /// The label is present
    Exists,
    /// The label is absent
    DoesNotExist,
}

/// A single `matchExpressions` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectorRequirement {
    /// Label key
    pub key: String,
    /// How `values` relate to the label
    pub operator: SelectorOperator,
    /// Values for `In` and `NotIn`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }

    /// Describe why this requirement is malformed, if it is.
    pub(crate) fn problem(&self) -> Option<String> {
        match self.operator {
            SelectorOperator::In | SelectorOperator::NotIn if self.values.is_empty() => Some(format!(
                "requirement on {:?} with operator {:?} needs at least one value",
                self.key, self.operator
            )),
            SelectorOperator::Exists | SelectorOperator::DoesNotExist if !self.values.is_empty() => {
                Some(format!(
                    "requirement on {:?} with operator {:?} must not have values",
                    self.key, self.operator
                ))
            }
            _ => None,
        }
    }
}

/// A label query. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabelSelector {
    /// Exact key/value pairs that must all be present
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Requirements that must all hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// True for the selector that matches every object.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Evaluate the selector against a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    pub(crate) fn problems(&self) -> impl Iterator<Item = String> + '_ {
        self.match_expressions.iter().filter_map(SelectorRequirement::problem)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: SelectorOperator, values: &[&str]) -> SelectorRequirement {
        SelectorRequirement {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "web"), ("tier", "front")]),
            ..Default::default()
        };
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front"), ("x", "y")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&labels(&[("app", "db"), ("tier", "front")])));
    }

    #[test]
    fn test_in_and_not_in() {
        let selector = LabelSelector {
            match_expressions: vec![requirement("env", SelectorOperator::In, &["prod", "staging"])],
            ..Default::default()
        };
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&BTreeMap::new()));

        let selector = LabelSelector {
            match_expressions: vec![requirement("runlevel", SelectorOperator::NotIn, &["0", "1"])],
            ..Default::default()
        };
        assert!(selector.matches(&labels(&[("runlevel", "2")])));
        assert!(selector.matches(&BTreeMap::new()));
        assert!(!selector.matches(&labels(&[("runlevel", "0")])));
    }

    #[test]
    fn test_exists_and_does_not_exist() {
        let exists = LabelSelector {
            match_expressions: vec![requirement("team", SelectorOperator::Exists, &[])],
            ..Default::default()
        };
        assert!(exists.matches(&labels(&[("team", "")])));
        assert!(!exists.matches(&BTreeMap::new()));

        let absent = LabelSelector {
            match_expressions: vec![requirement("team", SelectorOperator::DoesNotExist, &[])],
            ..Default::default()
        };
        assert!(absent.matches(&BTreeMap::new()));
        assert!(!absent.matches(&labels(&[("team", "a")])));
    }

    #[test]
    fn test_problems() {
        let selector = LabelSelector {
            match_expressions: vec![
                requirement("a", SelectorOperator::In, &[]),
                requirement("b", SelectorOperator::Exists, &["x"]),
                requirement("c", SelectorOperator::NotIn, &["x"]),
            ],
            ..Default::default()
        };
        assert_eq!(selector.problems().count(), 2);
    }

    #[test]
    fn test_deserialize() {
        let selector: LabelSelector = serde_json::from_str(
            r#"{"matchExpressions":[{"key":"environment","operator":"In","values":["prod","staging"]}]}"#,
        )
        .unwrap();
        assert_eq!(selector.match_expressions[0].operator, SelectorOperator::In);
        assert!(selector.matches(&labels(&[("environment", "staging")])));
    }
}
