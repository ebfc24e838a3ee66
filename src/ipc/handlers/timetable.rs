use std::collections::HashSet;

use crate::ipc::helpers::{
    get_i64_range, get_optional_str, now_timestamp, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::info;

pub const WEEKDAYS: i64 = 5;
pub const MAX_PERIOD: i64 = 8;
pub const MAX_GRADE: i64 = 6;
pub const MAX_CLASS_NO: i64 = 30;

fn class_key(params: &serde_json::Value) -> Result<(i64, i64), HandlerErr> {
    Ok((
        get_i64_range(params, "grade", 1, MAX_GRADE)?,
        get_i64_range(params, "classNo", 1, MAX_CLASS_NO)?,
    ))
}

fn handle_week_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let (grade, class_no) = class_key(&req.params)?;

        let mut stmt = conn
            .prepare(
                "SELECT weekday, period, subject, teacher
                 FROM timetable_slots
                 WHERE grade = ? AND class_no = ?
                 ORDER BY weekday, period",
            )
            .map_err(HandlerErr::db("db_query_failed"))?;
        let slots = stmt
            .query_map((grade, class_no), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;

        let mut days: Vec<serde_json::Value> = (1..=WEEKDAYS)
            .map(|d| json!({ "weekday": d, "periods": [] }))
            .collect();
        for (weekday, period, subject, teacher) in slots {
            let Some(day) = days.get_mut((weekday - 1) as usize) else {
                continue;
            };
            if let Some(list) = day["periods"].as_array_mut() {
                list.push(json!({
                    "period": period,
                    "subject": subject,
                    "teacher": teacher,
                }));
            }
        }

        Ok(json!({ "grade": grade, "classNo": class_no, "days": days }))
    })
}

struct SlotIn {
    weekday: i64,
    period: i64,
    subject: String,
    teacher: Option<String>,
}

fn parse_slots(params: &serde_json::Value) -> Result<Vec<SlotIn>, HandlerErr> {
    let Some(raw) = params.get("slots").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing slots"));
    };
    let mut seen: HashSet<(i64, i64)> = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for (i, s) in raw.iter().enumerate() {
        let weekday = get_i64_range(s, "weekday", 1, WEEKDAYS)
            .map_err(|e| e.with_details(json!({ "index": i })))?;
        let period = get_i64_range(s, "period", 1, MAX_PERIOD)
            .map_err(|e| e.with_details(json!({ "index": i })))?;
        let Some(subject) = get_optional_str(s, "subject") else {
            return Err(HandlerErr::bad_params("slot subject must not be empty")
                .with_details(json!({ "index": i })));
        };
        if !seen.insert((weekday, period)) {
            return Err(HandlerErr::bad_params("duplicate slot")
                .with_details(json!({ "index": i, "weekday": weekday, "period": period })));
        }
        out.push(SlotIn {
            weekday,
            period,
            subject,
            teacher: get_optional_str(s, "teacher"),
        });
    }
    Ok(out)
}

fn handle_week_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let (grade, class_no) = class_key(&req.params)?;
        let slots = parse_slots(&req.params)?;
        let now = now_timestamp();

        let tx = conn
            .unchecked_transaction()
            .map_err(HandlerErr::db("db_tx_failed"))?;
        tx.execute(
            "DELETE FROM timetable_slots WHERE grade = ? AND class_no = ?",
            (grade, class_no),
        )
        .map_err(HandlerErr::db("db_delete_failed"))?;
        for s in &slots {
            tx.execute(
                "INSERT INTO timetable_slots(grade, class_no, weekday, period, subject, teacher, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (grade, class_no, s.weekday, s.period, &s.subject, &s.teacher, &now),
            )
            .map_err(HandlerErr::db("db_insert_failed"))?;
        }
        tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

        info!(grade, class_no, slots = slots.len(), "timetable week replaced");
        Ok(json!({ "grade": grade, "classNo": class_no, "slotCount": slots.len() }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.week.get" => Some(handle_week_get(state, req)),
        "timetable.week.replace" => Some(handle_week_replace(state, req)),
        _ => None,
    }
}
