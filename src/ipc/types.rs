use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::cache::Cache;
use crate::db::SqliteRemote;
use crate::session::SessionContext;
use crate::sync::GroupSession;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub cache: Option<Cache>,
    pub remote: Option<SqliteRemote>,
    pub session: SessionContext,
    /// Open group views, keyed by `Scope::view_key()`.
    pub views: HashMap<String, GroupSession>,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            cache: None,
            remote: None,
            session: SessionContext::new(),
            views: HashMap::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        AppState::new()
    }
}
