//! Validated table prefix.
//!
//! The prefix is the only token ever interpolated into SQL text, so it is
//! restricted to `[A-Za-z_]+`.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Postgres identifiers are capped at 63 bytes; `_val` is appended.
const MAX_PREFIX_LEN: usize = 59;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TablePrefix(String);

impl TablePrefix {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        if raw.is_empty() {
            return Err(DomainError::invalid_identifier("table prefix is empty"));
        }
        if raw.len() > MAX_PREFIX_LEN {
            return Err(DomainError::invalid_identifier(format!(
                "table prefix exceeds {MAX_PREFIX_LEN} characters"
            )));
        }
        if let Some(bad) = raw.chars().find(|c| !(c.is_ascii_alphabetic() || *c == '_')) {
            return Err(DomainError::invalid_identifier(format!(
                "table prefix contains illegal character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the unified value table.
    pub fn value_table(&self) -> String {
        format!("{}_val", self.0)
    }
}

impl fmt::Display for TablePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TablePrefix {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TablePrefix {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TablePrefix> for String {
    fn from(value: TablePrefix) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_letters_and_underscores() {
        let prefix = TablePrefix::parse("graph_Store").unwrap();
        assert_eq!(prefix.value_table(), "graph_Store_val");
    }

    #[test]
    fn rejects_injection_attempts() {
        for raw in ["", "t; DROP TABLE x", "t1", "t-x", "t\"", "tâble"] {
            assert!(TablePrefix::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn deserialization_validates() {
        let ok: Result<TablePrefix, _> = serde_json::from_str("\"nodes\"");
        assert!(ok.is_ok());
        let bad: Result<TablePrefix, _> = serde_json::from_str("\"nodes;--\"");
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn accepted_prefixes_only_contain_letters_and_underscores(raw in "\\PC{0,12}") {
            if let Ok(prefix) = TablePrefix::parse(&raw) {
                prop_assert!(prefix.as_str().chars().all(|c| c.is_ascii_alphabetic() || c == '_'));
            }
        }
    }
}
