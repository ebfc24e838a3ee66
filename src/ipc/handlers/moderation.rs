use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;

use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_timestamp, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let banned_only = req
            .params
            .get("bannedOnly")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut stmt = conn
            .prepare(
                "SELECT id, kakao_id, nickname, grade, class_no, role, banned, ban_reason,
                        created_at, last_seen_at
                 FROM users
                 WHERE (? = 0 OR banned = 1)
                 ORDER BY created_at, id",
            )
            .map_err(HandlerErr::db("db_query_failed"))?;
        let users = stmt
            .query_map([banned_only as i64], |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "kakaoId": row.get::<_, String>(1)?,
                    "nickname": row.get::<_, String>(2)?,
                    "grade": row.get::<_, Option<i64>>(3)?,
                    "classNo": row.get::<_, Option<i64>>(4)?,
                    "role": row.get::<_, String>(5)?,
                    "banned": row.get::<_, i64>(6)? != 0,
                    "banReason": row.get::<_, Option<String>>(7)?,
                    "createdAt": row.get::<_, String>(8)?,
                    "lastSeenAt": row.get::<_, Option<String>>(9)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;

        Ok(json!({ "users": users }))
    })
}

fn handle_users_set_banned(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let user_id = get_required_str(&req.params, "userId")?;
        let banned = req
            .params
            .get("banned")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| HandlerErr::bad_params("banned must be boolean"))?;
        let reason = if banned {
            get_optional_str(&req.params, "reason")
        } else {
            None
        };

        let changed = conn
            .execute(
                "UPDATE users SET banned = ?, ban_reason = ? WHERE id = ?",
                (banned as i64, &reason, &user_id),
            )
            .map_err(HandlerErr::db("db_update_failed"))?;
        if changed == 0 {
            return Err(HandlerErr::new("not_found", "user not found"));
        }

        info!(user_id = %user_id, banned, "user ban updated");
        Ok(json!({ "userId": user_id, "banned": banned }))
    })
}

fn handle_ips_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let mut stmt = conn
            .prepare("SELECT ip, reason, created_at FROM banned_ips ORDER BY created_at, ip")
            .map_err(HandlerErr::db("db_query_failed"))?;
        let ips = stmt
            .query_map([], |row| {
                Ok(json!({
                    "ip": row.get::<_, String>(0)?,
                    "reason": row.get::<_, Option<String>>(1)?,
                    "createdAt": row.get::<_, String>(2)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;
        Ok(json!({ "ips": ips }))
    })
}

fn parse_ip(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, "ip")?;
    raw.parse::<std::net::IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| HandlerErr::bad_params("ip is not a valid address"))
}

fn handle_ips_ban(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let ip = parse_ip(&req.params)?;
        let reason = get_optional_str(&req.params, "reason");

        let already: Option<i64> = conn
            .query_row("SELECT 1 FROM banned_ips WHERE ip = ?", [&ip], |r| r.get(0))
            .optional()
            .map_err(HandlerErr::db("db_query_failed"))?;
        conn.execute(
            "INSERT INTO banned_ips(ip, reason, created_at) VALUES(?, ?, ?)
             ON CONFLICT(ip) DO UPDATE SET reason = excluded.reason",
            (&ip, &reason, now_timestamp()),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;

        info!(ip = %ip, "ip banned");
        Ok(json!({ "ip": ip, "created": already.is_none() }))
    })
}

fn handle_ips_unban(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let ip = parse_ip(&req.params)?;
        let removed = conn
            .execute("DELETE FROM banned_ips WHERE ip = ?", [&ip])
            .map_err(HandlerErr::db("db_delete_failed"))?;
        if removed == 0 {
            return Err(HandlerErr::new("not_found", "ip is not banned"));
        }
        info!(ip = %ip, "ip unbanned");
        Ok(json!({ "ip": ip }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.users.list" => Some(handle_users_list(state, req)),
        "admin.users.setBanned" => Some(handle_users_set_banned(state, req)),
        "admin.ips.list" => Some(handle_ips_list(state, req)),
        "admin.ips.ban" => Some(handle_ips_ban(state, req)),
        "admin.ips.unban" => Some(handle_ips_unban(state, req)),
        _ => None,
    }
}
