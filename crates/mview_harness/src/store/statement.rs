//! The closed set of statements the harness issues, rendered per dialect.
//!
//! Every row-returning statement projects the full record in the same column
//! order (`uuid, code, user_id, text, is_test, created_at`), so a single
//! decoder in [`crate::model::Record::from_row`] covers all of them.

use std::fmt;

use serde::Serialize;

/// Query language spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Cassandra/Scylla CQL with `?` bind markers.
    Cql,
    /// PostgreSQL wire protocol with `$n` placeholders.
    Postgres,
}

/// Column types returned by row statements, in projection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Uuid,
    Text,
    Bool,
    Timestamp,
}

/// Full record projection shared by every row statement.
pub const RECORD_COLUMNS: [ColumnType; 6] = [
    ColumnType::Uuid,
    ColumnType::Text,
    ColumnType::Text,
    ColumnType::Text,
    ColumnType::Bool,
    ColumnType::Timestamp,
];

/// Statements understood by every [`crate::store::StoreClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    /// Args: `uuid, code, user_id, text, is_test, created_at`.
    InsertRecord,
    /// Args: `user_id, code`.
    SelectRecord,
    /// Args: `is_test, user_id, code`.
    UpdateFlag,
    /// Args: `user_id, code`.
    DeleteRecord,
    /// Args: `user_id`.
    CountPrimary,
    /// Args: `user_id`.
    CountView,
    /// No args.
    CountAll,
    /// Args: `user_id, created_at, code`.
    SelectViewRow,
    /// Args: `user_id, limit`.
    SelectViewRange,
}

/// Result shape of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementShape {
    Write,
    Scalar,
    Rows,
}

impl Statement {
    pub const ALL: [Statement; 9] = [
        Statement::InsertRecord,
        Statement::SelectRecord,
        Statement::UpdateFlag,
        Statement::DeleteRecord,
        Statement::CountPrimary,
        Statement::CountView,
        Statement::CountAll,
        Statement::SelectViewRow,
        Statement::SelectViewRange,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::InsertRecord => "insert_record",
            Self::SelectRecord => "select_record",
            Self::UpdateFlag => "update_flag",
            Self::DeleteRecord => "delete_record",
            Self::CountPrimary => "count_primary",
            Self::CountView => "count_view",
            Self::CountAll => "count_all",
            Self::SelectViewRow => "select_view_row",
            Self::SelectViewRange => "select_view_range",
        }
    }

    pub fn shape(self) -> StatementShape {
        match self {
            Self::InsertRecord | Self::UpdateFlag | Self::DeleteRecord => StatementShape::Write,
            Self::CountPrimary | Self::CountView | Self::CountAll => StatementShape::Scalar,
            Self::SelectRecord | Self::SelectViewRow | Self::SelectViewRange => {
                StatementShape::Rows
            }
        }
    }

    /// Number of bind arguments the statement expects.
    pub fn arity(self) -> usize {
        match self {
            Self::InsertRecord => 6,
            Self::UpdateFlag | Self::SelectViewRow => 3,
            Self::SelectRecord | Self::DeleteRecord | Self::SelectViewRange => 2,
            Self::CountPrimary | Self::CountView => 1,
            Self::CountAll => 0,
        }
    }

    /// Statement text for the given dialect.
    pub fn text(self, dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::Cql => self.cql(),
            Dialect::Postgres => self.postgres(),
        }
    }

    fn cql(self) -> &'static str {
        match self {
            Self::InsertRecord => {
                "INSERT INTO test (uuid, code, user_id, text, is_test, created_at) VALUES (?, ?, ?, ?, ?, ?)"
            }
            Self::SelectRecord => {
                "SELECT uuid, code, user_id, text, is_test, created_at FROM test WHERE user_id = ? AND code = ?"
            }
            Self::UpdateFlag => "UPDATE test SET is_test = ? WHERE user_id = ? AND code = ?",
            Self::DeleteRecord => "DELETE FROM test WHERE user_id = ? AND code = ?",
            Self::CountPrimary => "SELECT count(*) FROM test WHERE user_id = ?",
            Self::CountView => "SELECT count(*) FROM test_by_created_at WHERE user_id = ?",
            Self::CountAll => "SELECT count(*) FROM test",
            Self::SelectViewRow => {
                "SELECT uuid, code, user_id, text, is_test, created_at FROM test_by_created_at WHERE user_id = ? AND created_at = ? AND code = ?"
            }
            Self::SelectViewRange => {
                "SELECT uuid, code, user_id, text, is_test, created_at FROM test_by_created_at WHERE user_id = ? LIMIT ?"
            }
        }
    }

    fn postgres(self) -> &'static str {
        match self {
            Self::InsertRecord => {
                "INSERT INTO test (uuid, code, user_id, text, is_test, created_at) VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (user_id, code) DO UPDATE SET uuid = EXCLUDED.uuid, text = EXCLUDED.text, \
                 is_test = EXCLUDED.is_test, created_at = EXCLUDED.created_at"
            }
            Self::SelectRecord => {
                "SELECT uuid, code, user_id, text, is_test, created_at FROM test WHERE user_id = $1 AND code = $2"
            }
            Self::UpdateFlag => "UPDATE test SET is_test = $1 WHERE user_id = $2 AND code = $3",
            Self::DeleteRecord => "DELETE FROM test WHERE user_id = $1 AND code = $2",
            Self::CountPrimary => "SELECT count(*) FROM test WHERE user_id = $1",
            Self::CountView => "SELECT count(*) FROM test_by_created_at WHERE user_id = $1",
            Self::CountAll => "SELECT count(*) FROM test",
            Self::SelectViewRow => {
                "SELECT uuid, code, user_id, text, is_test, created_at FROM test_by_created_at \
                 WHERE user_id = $1 AND created_at = $2 AND code = $3"
            }
            Self::SelectViewRange => {
                "SELECT uuid, code, user_id, text, is_test, created_at FROM test_by_created_at \
                 WHERE user_id = $1 ORDER BY created_at, code LIMIT $2"
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::{Dialect, Statement};

    #[test]
    fn placeholder_count_matches_arity() {
        for stmt in Statement::ALL {
            let cql = stmt.text(Dialect::Cql).matches('?').count();
            assert_eq!(cql, stmt.arity(), "cql arity for {stmt}");
            let pg = (1..=stmt.arity())
                .filter(|n| stmt.text(Dialect::Postgres).contains(&format!("${n}")))
                .count();
            assert_eq!(pg, stmt.arity(), "postgres arity for {stmt}");
            assert!(!stmt
                .text(Dialect::Postgres)
                .contains(&format!("${}", stmt.arity() + 1)));
        }
    }

    #[test]
    fn view_statements_target_the_view() {
        for stmt in [
            Statement::CountView,
            Statement::SelectViewRow,
            Statement::SelectViewRange,
        ] {
            assert!(stmt.text(Dialect::Cql).contains("test_by_created_at"));
            assert!(stmt.text(Dialect::Postgres).contains("test_by_created_at"));
        }
    }
}
