//! Record schema shared by the primary table and its view.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::store::{Row, Statement, StoreError, Value, RECORD_COLUMNS};

/// Payload written by every task.
pub const RECORD_TEXT: &str = "test";

/// One logical entity, as stored in `test` and projected into
/// `test_by_created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub id: Uuid,
    pub code: String,
    pub group_key: String,
    pub text: String,
    pub flag: bool,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Build a fresh record for insertion: new time-ordered id, `flag = true`,
    /// `created_at = now` truncated to microseconds.
    pub fn new(id: Uuid, code: impl Into<String>, group_key: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            group_key: group_key.into(),
            text: RECORD_TEXT.to_string(),
            flag: true,
            created_at: now_micros(),
        }
    }

    /// Primary key `(user_id, code)`.
    pub fn primary_key(&self) -> (String, String) {
        (self.group_key.clone(), self.code.clone())
    }

    /// View key `(user_id, created_at, code)`.
    pub fn view_key(&self) -> (String, DateTime<Utc>, String) {
        (self.group_key.clone(), self.created_at, self.code.clone())
    }

    /// Bind arguments for [`Statement::InsertRecord`].
    pub fn insert_args(&self) -> Vec<Value> {
        vec![
            Value::Uuid(self.id),
            Value::Text(self.code.clone()),
            Value::Text(self.group_key.clone()),
            Value::Text(self.text.clone()),
            Value::Bool(self.flag),
            Value::Timestamp(self.created_at),
        ]
    }

    pub fn to_row(&self) -> Row {
        Row::new(self.insert_args())
    }

    /// Decode a row in the full record projection.
    pub fn from_row(statement: Statement, row: &Row) -> Result<Self, StoreError> {
        if row.len() != RECORD_COLUMNS.len() {
            return Err(StoreError::Shape {
                statement,
                reason: format!(
                    "expected {} columns, got {}",
                    RECORD_COLUMNS.len(),
                    row.len()
                ),
            });
        }
        let shape = |index: usize, expected: &str| StoreError::Shape {
            statement,
            reason: format!("column {index} is not {expected}"),
        };
        let id = match row.get(0) {
            Some(Value::Uuid(v)) => *v,
            _ => return Err(shape(0, "uuid")),
        };
        let code = match row.get(1) {
            Some(Value::Text(v)) => v.clone(),
            _ => return Err(shape(1, "text")),
        };
        let group_key = match row.get(2) {
            Some(Value::Text(v)) => v.clone(),
            _ => return Err(shape(2, "text")),
        };
        let text = match row.get(3) {
            Some(Value::Text(v)) => v.clone(),
            _ => return Err(shape(3, "text")),
        };
        let flag = match row.get(4) {
            Some(Value::Bool(v)) => *v,
            _ => return Err(shape(4, "bool")),
        };
        let created_at = match row.get(5) {
            Some(Value::Timestamp(v)) => *v,
            _ => return Err(shape(5, "timestamp")),
        };
        Ok(Self {
            id,
            code,
            group_key,
            text,
            flag,
            created_at,
        })
    }

    /// Names of the fields that differ between two projections of a record.
    pub fn diff(&self, other: &Record) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.id != other.id {
            fields.push("uuid");
        }
        if self.code != other.code {
            fields.push("code");
        }
        if self.group_key != other.group_key {
            fields.push("user_id");
        }
        if self.text != other.text {
            fields.push("text");
        }
        if self.flag != other.flag {
            fields.push("is_test");
        }
        if self.created_at != other.created_at {
            fields.push("created_at");
        }
        fields
    }
}

/// Current time at the precision every backend stores.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
