//! Node mutations (write side) and stored nodes (read side).

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value::NodeValue;

/// Upper bound on `key` and `field` length (`VARCHAR(64)` columns).
pub const MAX_KEY_LEN: usize = 64;

/// One change request: set `field` of node `key` to `value`.
///
/// `state` is the caller's ordering token. It is persisted as-is and never
/// interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMutation {
    pub key: String,
    pub field: String,
    pub value: NodeValue,
    pub state: i64,
    #[serde(default)]
    pub is_relationship: bool,
}

impl NodeMutation {
    pub fn new(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<NodeValue>,
        state: i64,
    ) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            value: value.into(),
            state,
            is_relationship: false,
        }
    }

    /// A field pointing at another node (`target` is that node's key).
    pub fn relationship(
        key: impl Into<String>,
        field: impl Into<String>,
        target: impl Into<String>,
        state: i64,
    ) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            value: NodeValue::Text(target.into()),
            state,
            is_relationship: true,
        }
    }

    /// Reject mutations the value table cannot hold.
    pub fn validate(&self) -> DomainResult<()> {
        check_bounded("key", &self.key)?;
        check_bounded("field", &self.field)
    }
}

fn check_bounded(name: &str, value: &str) -> DomainResult<()> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("{name} must not be empty")));
    }
    let len = value.chars().count();
    if len > MAX_KEY_LEN {
        return Err(DomainError::validation(format!(
            "{name} is {len} characters, limit is {MAX_KEY_LEN}"
        )));
    }
    Ok(())
}

/// A field as read back from storage, with its value reconstructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub id: i64,
    pub key: String,
    pub field: String,
    pub value: NodeValue,
    pub state: i64,
    pub is_relationship: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_mutations_carry_the_flag() {
        let m = NodeMutation::relationship("A", "owner", "B", 3);
        assert!(m.is_relationship);
        assert_eq!(m.value, NodeValue::Text("B".to_string()));
        assert!(m.validate().is_ok());
    }

    #[test]
    fn oversized_and_empty_keys_are_rejected() {
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            NodeMutation::new(long, "f", 1, 0).validate(),
            Err(DomainError::Validation(_))
        ));
        assert!(NodeMutation::new("k", "", 1, 0).validate().is_err());
        assert!(NodeMutation::new("k".repeat(MAX_KEY_LEN), "f", 1, 0).validate().is_ok());
    }

    #[test]
    fn mutations_deserialize_from_host_json() {
        let m: NodeMutation = serde_json::from_value(serde_json::json!({
            "key": "A",
            "field": "x",
            "value": {"type": "number", "value": 1.0},
            "state": 10
        }))
        .unwrap();
        assert_eq!(m, NodeMutation::new("A", "x", 1, 10));
    }
}
