//! Persistence collaborator used by the import engine.
//!
//! The engine only ever sees [`RecordStore`]: one create, update or query per
//! call, no multi-row transactions. [`SqliteStore`] implements it over the
//! workspace connection and refuses tables or columns it does not know.

use crate::db;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Number, Value};
use thiserror::Error;

pub type Fields = Map<String, Value>;

/// Tables the import engine and the IPC surface may touch through the store.
pub const ENTITY_TABLES: &[&str] = &[
    "classes",
    "subjects",
    "staff",
    "students",
    "exam_questions",
    "staff_subjects",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub fields: Fields,
}

impl Record {
    /// Field rendered as operator-facing text; `None` for null or absent.
    pub fn text(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(render_value)
    }
}

pub fn render_value(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(render_number(n)),
        other => Some(other.to_string()),
    }
}

fn render_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) => format!("{}", f),
        None => n.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("unknown field '{field}' on {entity}")]
    UnknownField { entity: String, field: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("referenced record no longer exists: {0}")]
    StaleReference(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),
}

impl StoreError {
    /// The intended target is gone rather than rejected.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::StaleReference(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, msg) = &e {
            let message = msg.clone().unwrap_or_else(|| code.to_string());
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                return Self::StaleReference(message);
            }
            if code.code == ErrorCode::ConstraintViolation {
                return Self::Constraint(message);
            }
        }
        Self::Database(e)
    }
}

pub trait RecordStore {
    fn create(&mut self, entity: &str, fields: &Fields) -> Result<String, StoreError>;
    fn update(&mut self, entity: &str, id: &str, fields: &Fields) -> Result<(), StoreError>;
    /// Equality filter over the given fields; an empty filter returns every row.
    fn query(&self, entity: &str, filter: &Fields) -> Result<Vec<Record>, StoreError>;
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn checked_columns(&self, entity: &str) -> Result<Vec<String>, StoreError> {
        if !ENTITY_TABLES.contains(&entity) {
            return Err(StoreError::UnknownEntity(entity.to_string()));
        }
        Ok(db::table_columns(self.conn, entity)?)
    }

    fn check_fields(entity: &str, columns: &[String], fields: &Fields) -> Result<(), StoreError> {
        for name in fields.keys() {
            if name == "id" || !columns.iter().any(|c| c == name) {
                return Err(StoreError::UnknownField {
                    entity: entity.to_string(),
                    field: name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(v: SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(_) => Value::Null,
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl RecordStore for SqliteStore<'_> {
    fn create(&mut self, entity: &str, fields: &Fields) -> Result<String, StoreError> {
        let columns = self.checked_columns(entity)?;
        Self::check_fields(entity, &columns, fields)?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut names = vec!["id".to_string()];
        let mut values = vec![SqlValue::Text(id.clone())];
        for (k, v) in fields {
            names.push(k.clone());
            values.push(to_sql(v));
        }
        if columns.iter().any(|c| c == "updated_at") && !fields.contains_key("updated_at") {
            names.push("updated_at".to_string());
            values.push(SqlValue::Text(now_rfc3339()));
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {}({}) VALUES({})",
            entity,
            names.join(", "),
            placeholders
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(id)
    }

    fn update(&mut self, entity: &str, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let columns = self.checked_columns(entity)?;
        Self::check_fields(entity, &columns, fields)?;
        if fields.is_empty() {
            return Ok(());
        }

        let mut sets = Vec::new();
        let mut values = Vec::new();
        for (k, v) in fields {
            sets.push(format!("{} = ?", k));
            values.push(to_sql(v));
        }
        if columns.iter().any(|c| c == "updated_at") && !fields.contains_key("updated_at") {
            sets.push("updated_at = ?".to_string());
            values.push(SqlValue::Text(now_rfc3339()));
        }
        values.push(SqlValue::Text(id.to_string()));
        let sql = format!("UPDATE {} SET {} WHERE id = ?", entity, sets.join(", "));
        let changed = self.conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: entity.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn query(&self, entity: &str, filter: &Fields) -> Result<Vec<Record>, StoreError> {
        let columns = self.checked_columns(entity)?;
        for name in filter.keys() {
            if !columns.iter().any(|c| c == name) {
                return Err(StoreError::UnknownField {
                    entity: entity.to_string(),
                    field: name.clone(),
                });
            }
        }

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), entity);
        let mut values = Vec::new();
        if !filter.is_empty() {
            let clauses = filter
                .iter()
                .map(|(k, v)| {
                    if v.is_null() {
                        format!("{} IS NULL", k)
                    } else {
                        values.push(to_sql(v));
                        format!("{} = ?", k)
                    }
                })
                .collect::<Vec<_>>();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                let mut id = String::new();
                let mut fields = Fields::new();
                for (i, name) in columns.iter().enumerate() {
                    let v: SqlValue = r.get(i)?;
                    if name == "id" {
                        if let SqlValue::Text(s) = v {
                            id = s;
                        }
                        continue;
                    }
                    fields.insert(name.clone(), from_sql(v));
                }
                Ok(Record { id, fields })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
