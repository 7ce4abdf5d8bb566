use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::import::ImportSession;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// At most one import session per sidecar; tied to the selected workspace.
    pub session: Option<ImportSession>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            session: None,
        }
    }
}
