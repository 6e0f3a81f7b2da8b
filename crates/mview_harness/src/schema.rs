//! DDL for the primary table and its view.

use std::fmt::Write as _;

use crate::store::{Dialect, Statement};

pub const TABLE_NAME: &str = "test";
pub const VIEW_NAME: &str = "test_by_created_at";

const CQL_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS test (
    uuid uuid,
    code text,
    user_id text,
    text text,
    is_test boolean,
    created_at timestamp,
    PRIMARY KEY ((user_id), code)
)",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS test_by_created_at AS
    SELECT uuid, code, user_id, text, is_test, created_at FROM test
    WHERE user_id IS NOT NULL AND created_at IS NOT NULL AND code IS NOT NULL
    PRIMARY KEY ((user_id), created_at, code)
    WITH CLUSTERING ORDER BY (created_at ASC, code ASC)",
];

// A plain view is maintained synchronously, so a PostgreSQL run is the
// zero-lag baseline.
const POSTGRES_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS test (
    uuid uuid NOT NULL,
    code text NOT NULL,
    user_id text NOT NULL,
    text text NOT NULL,
    is_test boolean NOT NULL,
    created_at timestamptz NOT NULL,
    PRIMARY KEY (user_id, code)
)",
    "CREATE OR REPLACE VIEW test_by_created_at AS
    SELECT uuid, code, user_id, text, is_test, created_at FROM test",
    "CREATE INDEX IF NOT EXISTS test_by_created_at_idx ON test (user_id, created_at, code)",
];

/// DDL statements for `dialect`, in execution order.
pub fn ddl(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::Cql => CQL_DDL,
        Dialect::Postgres => POSTGRES_DDL,
    }
}

/// DDL followed by every statement text, ready to print.
pub fn render(dialect: Dialect) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "-- schema ({dialect:?})");
    for stmt in ddl(dialect) {
        let _ = writeln!(out, "{stmt};\n");
    }
    let _ = writeln!(out, "-- statements");
    for stmt in Statement::ALL {
        let _ = writeln!(out, "-- {}\n{};", stmt.name(), stmt.text(dialect));
    }
    out
}
