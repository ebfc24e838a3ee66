use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::Config;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Transport headers forwarded by the front end (HTTP header names, any case).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
        }
    }
}
