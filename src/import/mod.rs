//! Bulk tabular reconciliation: parse a delimited file for one entity type,
//! validate it, diff it against persisted records and apply the result one
//! unit at a time.

pub mod diff;
pub mod error;
pub mod execute;
pub mod lookup;
pub mod parser;
pub mod schema;
pub mod session;
pub mod template;
pub mod validate;

use serde::Serialize;

pub use error::ImportError;
pub use execute::ExecutorOptions;
pub use session::ImportSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Create,
    Update,
}

impl ImportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Lowercased, trimmed form used for keys, labels and enumerated values.
pub fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}
