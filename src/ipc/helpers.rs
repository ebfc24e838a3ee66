use chrono::{NaiveDate, Utc};
use rusqlite::Connection;

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn db(code: &'static str) -> impl Fn(rusqlite::Error) -> Self {
        move |e| Self::new(code, e.to_string())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Runs a handler body and folds its error into the wire format.
pub fn respond(
    req: &Request,
    body: impl FnOnce() -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    match body() {
        Ok(result) => crate::ipc::error::ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_i64_range(
    params: &serde_json::Value,
    key: &str,
    min: i64,
    max: i64,
) -> Result<i64, HandlerErr> {
    let n = params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if !(min..=max).contains(&n) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be in {}..={}",
            key, min, max
        )));
    }
    Ok(n)
}

pub fn get_optional_i64_range(
    params: &serde_json::Value,
    key: &str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(_) => get_i64_range(params, key, min, max).map(Some),
    }
}

pub fn parse_date(s: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ranges_and_dates() {
        let p = json!({ "grade": 2, "weekday": 9, "blank": "  " });
        assert_eq!(get_i64_range(&p, "grade", 1, 3).ok(), Some(2));
        assert!(get_i64_range(&p, "weekday", 1, 5).is_err());
        assert!(get_required_str(&p, "blank").is_err());
        assert_eq!(get_optional_i64_range(&p, "missing", 0, 1).ok(), Some(None));
        assert!(parse_date("2026-02-30", "dueDate").is_err());
        assert_eq!(
            parse_date("2026-03-02", "dueDate").ok(),
            NaiveDate::from_ymd_opt(2026, 3, 2)
        );
    }
}
