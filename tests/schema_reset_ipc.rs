use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const ADMIN_KEY: &str = "reset-test-key";

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .env("TIMETABLED_ADMIN_KEY", ADMIN_KEY)
        .env_remove("TIMETABLED_WORKSPACE")
        .env_remove("TIMETABLED_RESET_CONFIRM")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_with_key(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    key: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(k) = key {
        payload["headers"] = json!({ "X-Admin-Key": k });
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_with_key(stdin, reader, id, method, params, Some(ADMIN_KEY));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn table_names(result: &serde_json::Value) -> Vec<String> {
    result["tables"]
        .as_array()
        .expect("tables")
        .iter()
        .map(|t| t["name"].as_str().expect("name").to_string())
        .collect()
}

fn strings(v: &serde_json::Value) -> Vec<String> {
    v.as_array()
        .expect("array")
        .iter()
        .map(|s| s.as_str().expect("string").to_string())
        .collect()
}

#[test]
fn reset_requires_admin_key_before_touching_schema() {
    let workspace = temp_dir("timetable-reset-auth");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let params = json!({ "table": "*", "confirm": "RESET ALL DATA" });
    let missing = request_with_key(
        &mut stdin,
        &mut reader,
        "2",
        "admin.db.delete",
        params.clone(),
        None,
    );
    assert_eq!(error_code(&missing), "unauthorized");
    let wrong = request_with_key(
        &mut stdin,
        &mut reader,
        "3",
        "admin.db.delete",
        params,
        Some("nope"),
    );
    assert_eq!(error_code(&wrong), "unauthorized");

    let unconfirmed = request_with_key(
        &mut stdin,
        &mut reader,
        "4",
        "admin.db.delete",
        json!({ "table": "*", "confirm": "reset" }),
        Some(ADMIN_KEY),
    );
    assert_eq!(error_code(&unconfirmed), "confirmation_required");

    let tables = request_ok(&mut stdin, &mut reader, "5", "admin.db.tables", json!({}));
    assert_eq!(table_names(&tables).len(), 7);
}

#[test]
fn reset_drops_dependents_first_and_is_idempotent() {
    let workspace = temp_dir("timetable-reset-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let user = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.upsert",
        json!({ "kakaoId": "k-1", "nickname": "Minji", "grade": 2, "classNo": 3 }),
    );
    let user_id = user["userId"].as_str().expect("userId").to_string();
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({
            "grade": 2, "classNo": 3, "subject": "Math", "title": "Quiz",
            "dueDate": "2026-11-02", "createdBy": user_id
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.check",
        json!({ "assessmentId": created["assessmentId"], "userId": user_id, "done": true }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "access.record",
        json!({ "ip": "10.0.0.1", "userId": user_id, "path": "/" }),
    );

    let reset = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "admin.db.delete",
        json!({ "table": "*", "confirm": "RESET ALL DATA" }),
    );
    let dropped = strings(&reset["dropped"]);
    assert_eq!(reset["droppedCount"], 7);
    assert_eq!(
        dropped,
        vec![
            "access_logs",
            "assessment_checks",
            "banned_ips",
            "settings",
            "timetable_slots",
            "assessments",
            "users",
        ]
    );
    assert!(strings(&reset["unresolved"]).is_empty());
    let steps = strings(&reset["steps"]);
    assert_eq!(steps[0], "PRAGMA defer_foreign_keys = ON");
    assert!(steps
        .iter()
        .any(|s| s == "DELETE FROM sqlite_sequence WHERE name = 'access_logs'"));

    let tables = request_ok(&mut stdin, &mut reader, "7", "admin.db.tables", json!({}));
    assert!(table_names(&tables).is_empty());

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "admin.db.delete",
        json!({ "table": "*", "confirm": "RESET ALL DATA" }),
    );
    assert_eq!(again["droppedCount"], 0);
    assert!(strings(&again["dropped"]).is_empty());

    let init = request_ok(&mut stdin, &mut reader, "9", "admin.db.init", json!({}));
    assert_eq!(strings(&init["tables"]).len(), 7);
}

#[test]
fn reset_handles_cyclic_tables_created_through_raw_sql() {
    let workspace = temp_dir("timetable-reset-cycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "admin.db.query",
        json!({ "sql": "CREATE TABLE \"Club\"(id INTEGER PRIMARY KEY, captain_id INTEGER REFERENCES members(id) DEFERRABLE INITIALLY DEFERRED)" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "admin.db.query",
        json!({ "sql": "CREATE TABLE members(id INTEGER PRIMARY KEY, club_id INTEGER REFERENCES \"CLUB\"(id) DEFERRABLE INITIALLY DEFERRED)" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "admin.db.query",
        json!({ "sql": "INSERT INTO members(id, club_id) VALUES (1, NULL)" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "admin.db.query",
        json!({ "sql": "INSERT INTO \"Club\"(id, captain_id) VALUES (?, ?)", "params": [1, 1] }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "admin.db.query",
        json!({ "sql": "UPDATE members SET club_id = 1 WHERE id = 1" }),
    );

    let reset = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "admin.db.delete",
        json!({ "table": "*", "confirm": "RESET ALL DATA" }),
    );
    let dropped = strings(&reset["dropped"]);
    assert_eq!(dropped.len(), 9);
    let mut unresolved = strings(&reset["unresolved"]);
    unresolved.sort();
    assert_eq!(unresolved, vec!["Club", "members"]);
    assert_eq!(dropped.iter().filter(|n| *n == "Club").count(), 1);
    assert_eq!(dropped.iter().filter(|n| *n == "members").count(), 1);

    let tables = request_ok(&mut stdin, &mut reader, "8", "admin.db.tables", json!({}));
    assert!(table_names(&tables).is_empty());
}
