//! Label selectors for list operations.
//!
//! Mirrors the Kubernetes `LabelSelector`: `match_labels` must all be equal,
//! and every entry of `match_expressions` must hold. An empty selector
//! matches every object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Operator of a single selector expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One `key <op> values` expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// A selector that matches every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Require the label `key` to be present with any value.
    pub fn exists(self, key: impl Into<String>) -> Self {
        self.with_expression(key, SelectorOperator::Exists, Vec::<String>::new())
    }

    /// Require the label `key` to be absent.
    pub fn does_not_exist(self, key: impl Into<String>) -> Self {
        self.with_expression(key, SelectorOperator::DoesNotExist, Vec::<String>::new())
    }

    /// Require the label `key` to carry one of `values`.
    pub fn key_in<I, S>(self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_expression(key, SelectorOperator::In, values)
    }

    pub fn with_expression<I, S>(
        mut self,
        key: impl Into<String>,
        operator: SelectorOperator,
        values: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.match_expressions.push(SelectorRequirement {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Reject expressions that cannot be evaluated: set operators without
    /// values, existence operators with values, empty keys.
    pub fn validate(&self) -> StoreResult<()> {
        for expr in &self.match_expressions {
            if expr.key.is_empty() {
                return Err(StoreError::InvalidSelector(
                    "expression with empty key".to_string(),
                ));
            }
            match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn if expr.values.is_empty() => {
                    return Err(StoreError::InvalidSelector(format!(
                        "{:?} on {:?} requires at least one value",
                        expr.operator, expr.key
                    )));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !expr.values.is_empty() =>
                {
                    return Err(StoreError::InvalidSelector(format!(
                        "{:?} on {:?} must not list values",
                        expr.operator, expr.key
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// True if `labels` satisfy the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_ok
            && self.match_expressions.iter().all(|expr| {
                let value = labels.get(&expr.key);
                match expr.operator {
                    SelectorOperator::In => value.is_some_and(|v| expr.values.contains(v)),
                    SelectorOperator::NotIn => value.is_none_or(|v| !expr.values.contains(v)),
                    SelectorOperator::Exists => value.is_some(),
                    SelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}
