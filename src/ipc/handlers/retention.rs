use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde_json::json;
use tracing::info;

use crate::db;
use crate::ipc::helpers::{
    get_i64_range, get_optional_i64_range, get_optional_str, parse_date, require_db, respond,
    today, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const RETENTION_KEY: &str = "admin.retention";
pub const MAX_RETENTION_DAYS: i64 = 3650;

fn stored_days(conn: &Connection) -> Result<Option<i64>, HandlerErr> {
    let v = db::settings_get_json(conn, RETENTION_KEY)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(v.and_then(|v| v.get("days").and_then(|d| d.as_i64())))
}

fn effective_days(state: &AppState, conn: &Connection) -> Result<(i64, &'static str), HandlerErr> {
    Ok(match stored_days(conn)? {
        Some(d) => (d, "settings"),
        None => (state.config.retention_days, "config"),
    })
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let (days, source) = effective_days(state, conn)?;
        Ok(json!({ "days": days, "source": source }))
    })
}

fn handle_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let days = get_i64_range(&req.params, "days", 1, MAX_RETENTION_DAYS)?;
        db::settings_set_json(conn, RETENTION_KEY, &json!({ "days": days }))
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        Ok(json!({ "days": days }))
    })
}

/// First day that is kept; anything strictly older goes.
pub fn cutoff_date(now: NaiveDate, days: i64) -> NaiveDate {
    now - Duration::days(days)
}

fn handle_purge(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let days = match get_optional_i64_range(&req.params, "days", 1, MAX_RETENTION_DAYS)? {
            Some(d) => d,
            None => effective_days(state, conn)?.0,
        };
        let now = match get_optional_str(&req.params, "now") {
            Some(s) => parse_date(&s, "now")?,
            None => today(),
        };
        let cutoff = cutoff_date(now, days).format("%Y-%m-%d").to_string();

        let tx = conn
            .unchecked_transaction()
            .map_err(HandlerErr::db("db_tx_failed"))?;
        // Timestamps are ISO-8601 so a string compare against the cutoff date works.
        let access_logs = tx
            .execute("DELETE FROM access_logs WHERE created_at < ?", [&cutoff])
            .map_err(|e| {
                HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "access_logs" }))
            })?;
        let assessment_checks = tx
            .execute(
                "DELETE FROM assessment_checks
                 WHERE assessment_id IN (SELECT id FROM assessments WHERE due_date < ?)",
                [&cutoff],
            )
            .map_err(|e| {
                HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "assessment_checks" }))
            })?;
        let assessments = tx
            .execute("DELETE FROM assessments WHERE due_date < ?", [&cutoff])
            .map_err(|e| {
                HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "assessments" }))
            })?;
        tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

        info!(
            cutoff = %cutoff,
            access_logs,
            assessments,
            "retention purge finished"
        );
        Ok(json!({
            "cutoff": cutoff,
            "days": days,
            "deleted": {
                "accessLogs": access_logs,
                "assessmentChecks": assessment_checks,
                "assessments": assessments,
            }
        }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.retention.get" => Some(handle_get(state, req)),
        "admin.retention.set" => Some(handle_set(state, req)),
        "admin.retention.purge" => Some(handle_purge(state, req)),
        _ => None,
    }
}
