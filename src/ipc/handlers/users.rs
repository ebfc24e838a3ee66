use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::ipc::handlers::timetable::{MAX_CLASS_NO, MAX_GRADE};
use crate::ipc::helpers::{
    get_optional_i64_range, get_optional_str, get_required_str, now_timestamp, require_db,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn handle_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let kakao_id = get_required_str(&req.params, "kakaoId")?;
        let nickname = get_required_str(&req.params, "nickname")?;
        let grade = get_optional_i64_range(&req.params, "grade", 1, MAX_GRADE)?;
        let class_no = get_optional_i64_range(&req.params, "classNo", 1, MAX_CLASS_NO)?;
        let now = now_timestamp();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE kakao_id = ?",
                [&kakao_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db("db_query_failed"))?;

        let (user_id, created) = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE users
                     SET nickname = ?,
                         grade = COALESCE(?, grade),
                         class_no = COALESCE(?, class_no),
                         last_seen_at = ?
                     WHERE id = ?",
                    (&nickname, grade, class_no, &now, &id),
                )
                .map_err(HandlerErr::db("db_update_failed"))?;
                (id, false)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO users(id, kakao_id, nickname, grade, class_no, created_at, last_seen_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)",
                    (&id, &kakao_id, &nickname, grade, class_no, &now, &now),
                )
                .map_err(|e| {
                    HandlerErr::new("db_insert_failed", e.to_string())
                        .with_details(json!({ "table": "users" }))
                })?;
                info!(user_id = %id, "user registered");
                (id, true)
            }
        };

        Ok(json!({ "userId": user_id, "created": created }))
    })
}

fn ip_ban_reason(conn: &Connection, ip: &str) -> Result<Option<Option<String>>, HandlerErr> {
    conn.query_row("SELECT reason FROM banned_ips WHERE ip = ?", [ip], |r| {
        r.get::<_, Option<String>>(0)
    })
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))
}

fn user_ban(conn: &Connection, user_id: &str) -> Result<Option<(bool, Option<String>)>, HandlerErr> {
    conn.query_row(
        "SELECT banned, ban_reason FROM users WHERE id = ?",
        [user_id],
        |r| Ok((r.get::<_, i64>(0)? != 0, r.get::<_, Option<String>>(1)?)),
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))
}

/// Gatekeeper for every front-end page hit: refuses banned IPs and users, logs the rest.
fn handle_access_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let ip = get_required_str(&req.params, "ip")?;
        let ip = ip
            .parse::<std::net::IpAddr>()
            .map(|a| a.to_string())
            .unwrap_or(ip);
        let path = get_required_str(&req.params, "path")?;
        let user_id = get_optional_str(&req.params, "userId");

        if let Some(reason) = ip_ban_reason(conn, &ip)? {
            return Err(HandlerErr::new("forbidden", "ip is banned")
                .with_details(json!({ "ip": ip, "reason": reason })));
        }
        if let Some(uid) = user_id.as_deref() {
            match user_ban(conn, uid)? {
                None => return Err(HandlerErr::new("not_found", "user not found")),
                Some((true, reason)) => {
                    return Err(HandlerErr::new("forbidden", "user is banned")
                        .with_details(json!({ "userId": uid, "reason": reason })));
                }
                Some((false, _)) => {}
            }
        }

        let now = now_timestamp();
        conn.execute(
            "INSERT INTO access_logs(ip, user_id, path, created_at) VALUES(?, ?, ?, ?)",
            (&ip, &user_id, &path, &now),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
        if let Some(uid) = user_id.as_deref() {
            conn.execute(
                "UPDATE users SET last_seen_at = ? WHERE id = ?",
                (&now, uid),
            )
            .map_err(HandlerErr::db("db_update_failed"))?;
        }

        Ok(json!({ "allowed": true }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.upsert" => Some(handle_upsert(state, req)),
        "access.record" => Some(handle_access_record(state, req)),
        _ => None,
    }
}
