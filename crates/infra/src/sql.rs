//! Statements against the unified value table.
//!
//! Every value travels as a bound parameter. The only text ever interpolated
//! is the table name, which derives from a validated [`TablePrefix`].
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS {prefix}_val (
//!     id BIGSERIAL PRIMARY KEY,
//!     "key" VARCHAR(64) NOT NULL,
//!     field VARCHAR(64) NOT NULL,
//!     state BIGINT,
//!     value TEXT,
//!     value_type SMALLINT,
//!     is_relationship BOOLEAN NOT NULL DEFAULT FALSE
//! )
//! ```

use std::fmt::Write as _;

use graphstore_core::{NodeMutation, NodeValue, StoredNode, TablePrefix, ValueType};

/// Columns written by inserts, in placeholder order.
pub const INSERT_COLUMNS: [&str; 6] = ["key", "field", "value", "value_type", "is_relationship", "state"];

/// Postgres caps a statement at 65535 bind parameters.
pub const MAX_ROWS_PER_INSERT: usize = 65_535 / INSERT_COLUMNS.len();

/// A bind parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    BigInt(i64),
    SmallInt(i16),
    Bool(bool),
}

/// A row to be written, already encoded for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRow {
    pub key: String,
    pub field: String,
    pub value: String,
    pub value_type: i16,
    pub is_relationship: bool,
    pub state: i64,
}

impl NewRow {
    pub fn from_mutation(mutation: &NodeMutation) -> Self {
        Self {
            key: mutation.key.clone(),
            field: mutation.field.clone(),
            value: mutation.value.encode(),
            value_type: mutation.value.value_type().code(),
            is_relationship: mutation.is_relationship,
            state: mutation.state,
        }
    }

    /// Parameters in [`INSERT_COLUMNS`] order.
    pub fn params(&self) -> [SqlParam; 6] {
        [
            SqlParam::Text(self.key.clone()),
            SqlParam::Text(self.field.clone()),
            SqlParam::Text(self.value.clone()),
            SqlParam::SmallInt(self.value_type),
            SqlParam::Bool(self.is_relationship),
            SqlParam::BigInt(self.state),
        ]
    }

    /// Rebuild a row from column values in [`INSERT_COLUMNS`] order.
    ///
    /// Returns `None` when the arity or any column type does not match.
    pub fn from_columns(columns: &[SqlParam]) -> Option<Self> {
        match columns {
            [
                SqlParam::Text(key),
                SqlParam::Text(field),
                SqlParam::Text(value),
                SqlParam::SmallInt(value_type),
                SqlParam::Bool(is_relationship),
                SqlParam::BigInt(state),
            ] => Some(Self {
                key: key.clone(),
                field: field.clone(),
                value: value.clone(),
                value_type: *value_type,
                is_relationship: *is_relationship,
                state: *state,
            }),
            _ => None,
        }
    }
}

/// A row as read back from the value table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRow {
    pub id: i64,
    pub key: String,
    pub field: String,
    pub value: Option<String>,
    pub value_type: Option<i16>,
    pub is_relationship: bool,
    pub state: Option<i64>,
}

impl ValueRow {
    pub fn into_node(self) -> StoredNode {
        // Untagged rows read back as text.
        let value_type = self.value_type.unwrap_or(ValueType::String.code());
        StoredNode {
            id: self.id,
            value: NodeValue::decode(self.value.as_deref(), value_type),
            key: self.key,
            field: self.field,
            state: self.state.unwrap_or_default(),
            is_relationship: self.is_relationship,
        }
    }
}

/// What a [`Query`] does, in structured form.
///
/// Connectors that do not speak SQL (the in-memory one) execute this instead
/// of the statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateTable,
    CreateIndex,
    Lookup {
        key: String,
        field: Option<String>,
        limit: Option<u32>,
    },
    Update {
        id: i64,
        row: NewRow,
    },
    InsertMany {
        rows: Vec<NewRow>,
    },
}

impl Operation {
    /// Label used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateTable => "create_table",
            Operation::CreateIndex => "create_index",
            Operation::Lookup { .. } => "lookup",
            Operation::Update { .. } => "update",
            Operation::InsertMany { .. } => "insert",
        }
    }
}

/// A parameterized statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    sql: String,
    params: Vec<SqlParam>,
    operation: Operation,
}

impl Query {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn name(&self) -> &'static str {
        self.operation.name()
    }
}

const SELECT_COLUMNS: &str = r#"id, "key", field, value, value_type, is_relationship, state"#;

/// The `{prefix}_val` table and the statements issued against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTable {
    prefix: TablePrefix,
    name: String,
}

impl ValueTable {
    pub fn new(prefix: TablePrefix) -> Self {
        let name = prefix.value_table();
        Self { prefix, name }
    }

    pub fn prefix(&self) -> &TablePrefix {
        &self.prefix
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_table(&self) -> Query {
        Query {
            sql: format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
    id BIGSERIAL PRIMARY KEY,
    "key" VARCHAR(64) NOT NULL,
    field VARCHAR(64) NOT NULL,
    state BIGINT,
    value TEXT,
    value_type SMALLINT,
    is_relationship BOOLEAN NOT NULL DEFAULT FALSE
)"#,
                self.name
            ),
            params: Vec::new(),
            operation: Operation::CreateTable,
        }
    }

    pub fn create_index(&self) -> Query {
        Query {
            sql: format!(
                r#"CREATE INDEX IF NOT EXISTS {name}_key_field_idx ON {name} ("key", field)"#,
                name = self.name
            ),
            params: Vec::new(),
            operation: Operation::CreateIndex,
        }
    }

    /// All rows for `key` (optionally one field), in insertion order.
    pub fn lookup(&self, key: &str, field: Option<&str>) -> Query {
        self.select(key, field, None)
    }

    /// At most one row for `(key, field)`.
    pub fn find_one(&self, key: &str, field: &str) -> Query {
        self.select(key, Some(field), Some(1))
    }

    fn select(&self, key: &str, field: Option<&str>, limit: Option<u32>) -> Query {
        let mut sql = format!(r#"SELECT {SELECT_COLUMNS} FROM {} WHERE "key" = $1"#, self.name);
        let mut params = vec![SqlParam::Text(key.to_string())];
        if let Some(field) = field {
            sql.push_str(" AND field = $2");
            params.push(SqlParam::Text(field.to_string()));
        }
        sql.push_str(" ORDER BY id");
        if let Some(limit) = limit {
            let _ = write!(sql, " LIMIT {limit}");
        }

        Query {
            sql,
            params,
            operation: Operation::Lookup {
                key: key.to_string(),
                field: field.map(str::to_string),
                limit,
            },
        }
    }

    /// Overwrite value, type, relationship flag and state of row `id`.
    pub fn update(&self, id: i64, row: &NewRow) -> Query {
        Query {
            sql: format!(
                "UPDATE {} SET value = $1, value_type = $2, is_relationship = $3, state = $4 WHERE id = $5",
                self.name
            ),
            params: vec![
                SqlParam::Text(row.value.clone()),
                SqlParam::SmallInt(row.value_type),
                SqlParam::Bool(row.is_relationship),
                SqlParam::BigInt(row.state),
                SqlParam::BigInt(id),
            ],
            operation: Operation::Update {
                id,
                row: row.clone(),
            },
        }
    }

    /// A single multi-row insert. Callers chunk by [`MAX_ROWS_PER_INSERT`].
    pub fn insert_many(&self, rows: &[NewRow]) -> Query {
        let columns = INSERT_COLUMNS
            .iter()
            .map(|c| if *c == "key" { r#""key""# } else { *c })
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("INSERT INTO {} ({columns}) VALUES ", self.name);
        let mut params = Vec::with_capacity(rows.len() * INSERT_COLUMNS.len());

        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for column in 0..INSERT_COLUMNS.len() {
                if column > 0 {
                    sql.push_str(", ");
                }
                let _ = write!(sql, "${}", params.len() + column + 1);
            }
            sql.push(')');
            params.extend(row.params());
        }

        Query {
            sql,
            params,
            operation: Operation::InsertMany {
                rows: rows.to_vec(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> ValueTable {
        ValueTable::new(TablePrefix::parse("graph").unwrap())
    }

    fn row(key: &str, value: &str) -> NewRow {
        NewRow::from_mutation(&NodeMutation::new(key, "f", value, 1))
    }

    #[test]
    fn insert_binds_every_value() {
        let hostile = "O'Brien'); DROP TABLE graph_val; --";
        let query = table().insert_many(&[row("A", hostile), row("B", "plain")]);

        assert_eq!(
            query.sql(),
            r#"INSERT INTO graph_val ("key", field, value, value_type, is_relationship, state) VALUES ($1, $2, $3, $4, $5, $6), ($7, $8, $9, $10, $11, $12)"#
        );
        assert!(!query.sql().contains("O'Brien"));
        assert_eq!(query.params().len(), 12);
        assert_eq!(query.params()[2], SqlParam::Text(hostile.to_string()));
    }

    #[test]
    fn lookup_with_and_without_field() {
        let all = table().lookup("A", None);
        assert_eq!(
            all.sql(),
            r#"SELECT id, "key", field, value, value_type, is_relationship, state FROM graph_val WHERE "key" = $1 ORDER BY id"#
        );
        assert_eq!(all.params(), &[SqlParam::Text("A".into())]);

        let one = table().find_one("A", "x");
        assert!(one.sql().ends_with(r#"WHERE "key" = $1 AND field = $2 ORDER BY id LIMIT 1"#));
        assert_eq!(one.params().len(), 2);
        assert_eq!(one.name(), "lookup");
    }

    #[test]
    fn update_targets_the_row_id() {
        let query = table().update(7, &row("A", "v"));
        assert!(query.sql().ends_with("WHERE id = $5"));
        assert_eq!(query.params()[4], SqlParam::BigInt(7));
        assert_eq!(query.params()[3], SqlParam::BigInt(1));
    }

    #[test]
    fn columns_rebuild_a_row_only_when_well_formed() {
        let original = row("A", "v");
        assert_eq!(NewRow::from_columns(&original.params()), Some(original.clone()));

        let params = original.params();
        assert_eq!(NewRow::from_columns(&params[..5]), None);

        let mut swapped = params.to_vec();
        swapped.swap(3, 5);
        assert_eq!(NewRow::from_columns(&swapped), None);
    }

    #[test]
    fn rows_decode_through_their_type_tag() {
        let stored = ValueRow {
            id: 1,
            key: "A".into(),
            field: "x".into(),
            value: Some("42".into()),
            value_type: Some(0),
            is_relationship: false,
            state: Some(5),
        }
        .into_node();
        assert_eq!(stored.value, NodeValue::Number(42.0));
        assert_eq!(stored.state, 5);
    }

    #[test]
    fn max_rows_fit_the_parameter_limit() {
        assert!(MAX_ROWS_PER_INSERT * INSERT_COLUMNS.len() <= 65_535);
    }

    proptest! {
        #[test]
        fn placeholders_match_params(n in 1usize..40) {
            let rows: Vec<NewRow> = (0..n).map(|i| row(&format!("k{i}"), "v")).collect();
            let query = table().insert_many(&rows);
            prop_assert_eq!(query.params().len(), n * INSERT_COLUMNS.len());
            prop_assert_eq!(query.sql().matches('$').count(), query.params().len());
            let last = format!("${})", n * INSERT_COLUMNS.len());
            prop_assert!(query.sql().ends_with(&last));
        }
    }
}
