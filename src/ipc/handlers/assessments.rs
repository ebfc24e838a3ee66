use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::handlers::timetable::{MAX_CLASS_NO, MAX_GRADE};
use crate::ipc::helpers::{
    get_i64_range, get_optional_i64_range, get_optional_str, get_required_str, now_timestamp,
    parse_date, require_db, respond, today, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

pub const DEFAULT_UPCOMING_DAYS: i64 = 14;

struct AssessmentRow {
    id: String,
    subject: String,
    title: String,
    description: Option<String>,
    due_date: String,
}

impl AssessmentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "subject": self.subject,
            "title": self.title,
            "description": self.description,
            "dueDate": self.due_date,
        })
    }
}

fn class_key(params: &serde_json::Value) -> Result<(i64, i64), HandlerErr> {
    Ok((
        get_i64_range(params, "grade", 1, MAX_GRADE)?,
        get_i64_range(params, "classNo", 1, MAX_CLASS_NO)?,
    ))
}

fn load_for_class(
    conn: &Connection,
    grade: i64,
    class_no: i64,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<AssessmentRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, subject, title, description, due_date
             FROM assessments
             WHERE grade = ? AND class_no = ?
               AND (? IS NULL OR due_date >= ?)
               AND (? IS NULL OR due_date <= ?)
             ORDER BY due_date, subject, title",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    stmt.query_map((grade, class_no, from, from, to, to), |row| {
        Ok(AssessmentRow {
            id: row.get(0)?,
            subject: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            due_date: row.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db("db_query_failed"))
}

fn assessment_exists(conn: &Connection, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM assessments WHERE id = ?", [id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db("db_query_failed"))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let (grade, class_no) = class_key(&req.params)?;
        let subject = get_required_str(&req.params, "subject")?;
        let title = get_required_str(&req.params, "title")?;
        let due = parse_date(&get_required_str(&req.params, "dueDate")?, "dueDate")?;
        let description = get_optional_str(&req.params, "description");
        let created_by = get_optional_str(&req.params, "createdBy");

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO assessments(id, grade, class_no, subject, title, description, due_date, created_by, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                grade,
                class_no,
                &subject,
                &title,
                &description,
                due.format("%Y-%m-%d").to_string(),
                &created_by,
                now_timestamp(),
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "assessments" }))
        })?;

        Ok(json!({ "assessmentId": id }))
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let (grade, class_no) = class_key(&req.params)?;
        let rows = load_for_class(conn, grade, class_no, None, None)?;
        Ok(json!({
            "assessments": rows.iter().map(AssessmentRow::to_json).collect::<Vec<_>>()
        }))
    })
}

/// Assessments due in `[today, today + days]`, each tagged with `daysLeft`.
fn handle_upcoming(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let (grade, class_no) = class_key(&req.params)?;
        let today: NaiveDate = match get_optional_str(&req.params, "today") {
            Some(s) => parse_date(&s, "today")?,
            None => today(),
        };
        let days = get_optional_i64_range(&req.params, "days", 0, 365)?
            .unwrap_or(DEFAULT_UPCOMING_DAYS);
        let until = today + Duration::days(days);

        let from = today.format("%Y-%m-%d").to_string();
        let to = until.format("%Y-%m-%d").to_string();
        let rows = load_for_class(conn, grade, class_no, Some(&from), Some(&to))?;

        let items: Vec<serde_json::Value> = rows
            .iter()
            .map(|r| {
                let mut v = r.to_json();
                if let Ok(due) = NaiveDate::parse_from_str(&r.due_date, "%Y-%m-%d") {
                    v["daysLeft"] = json!((due - today).num_days());
                }
                v
            })
            .collect();
        Ok(json!({ "from": from, "to": to, "assessments": items }))
    })
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let id = get_required_str(&req.params, "assessmentId")?;
        if !assessment_exists(conn, &id)? {
            return Err(HandlerErr::new("not_found", "assessment not found"));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(HandlerErr::db("db_tx_failed"))?;
        // No ON DELETE CASCADE; checks go first.
        tx.execute(
            "DELETE FROM assessment_checks WHERE assessment_id = ?",
            [&id],
        )
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "assessment_checks" }))
        })?;
        tx.execute("DELETE FROM assessments WHERE id = ?", [&id])
            .map_err(|e| {
                HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "assessments" }))
            })?;
        tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

        Ok(json!({ "ok": true }))
    })
}

fn handle_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let id = get_required_str(&req.params, "assessmentId")?;
        let user_id = get_required_str(&req.params, "userId")?;
        let done = req
            .params
            .get("done")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| HandlerErr::bad_params("done must be boolean"))?;
        if !assessment_exists(conn, &id)? {
            return Err(HandlerErr::new("not_found", "assessment not found"));
        }

        conn.execute(
            "INSERT INTO assessment_checks(assessment_id, user_id, done, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(assessment_id, user_id) DO UPDATE SET
               done = excluded.done,
               updated_at = excluded.updated_at",
            (&id, &user_id, done as i64, now_timestamp()),
        )
        .map_err(|e| {
            // FK failure here means the user does not exist.
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "assessment_checks" }))
        })?;

        Ok(json!({ "assessmentId": id, "userId": user_id, "done": done }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.create" => Some(handle_create(state, req)),
        "assessments.list" => Some(handle_list(state, req)),
        "assessments.upcoming" => Some(handle_upcoming(state, req)),
        "assessments.delete" => Some(handle_delete(state, req)),
        "assessments.check" => Some(handle_check(state, req)),
        _ => None,
    }
}
