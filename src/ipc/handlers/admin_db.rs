use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_i64_range, get_required_str, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schema_reset::{self, TableDef};

/// `admin.db.delete` target that wipes every user table.
pub const RESET_ALL_MARKER: &str = "*";
const DEFAULT_MAX_ROWS: i64 = 1000;

fn catalog(conn: &Connection) -> Result<Vec<TableDef>, HandlerErr> {
    schema_reset::introspect_tables(conn).map_err(|e| HandlerErr::new(e.code(), e.to_string()))
}

fn find_table<'a>(tables: &'a [TableDef], name: &str) -> Option<&'a TableDef> {
    let wanted = schema_reset::normalize_identifier(name);
    tables
        .iter()
        .find(|t| schema_reset::normalize_identifier(&t.name) == wanted)
}

fn referenced_by(tables: &[TableDef], name: &str) -> Vec<String> {
    let graph = schema_reset::build_dependency_graph(tables);
    let mut out: Vec<String> = graph
        .iter()
        .filter(|(_, deps)| deps.iter().any(|d| d == name))
        .map(|(t, _)| t.clone())
        .collect();
    out.sort();
    out
}

fn handle_tables(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let tables = catalog(conn)?;
        let graph = schema_reset::build_dependency_graph(&tables);

        let mut out = Vec::with_capacity(tables.len());
        for t in &tables {
            let rows: i64 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {}",
                        schema_reset::quote_identifier(&t.name)
                    ),
                    [],
                    |r| r.get(0),
                )
                .map_err(HandlerErr::db("db_query_failed"))?;
            out.push(json!({
                "name": t.name,
                "rowCount": rows,
                "dependsOn": graph.get(&t.name).cloned().unwrap_or_default(),
            }));
        }
        Ok(json!({ "tables": out }))
    })
}

fn handle_describe(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let name = get_required_str(&req.params, "table")?;
        let tables = catalog(conn)?;
        let Some(table) = find_table(&tables, &name) else {
            return Err(HandlerErr::new("not_found", "table not found")
                .with_details(json!({ "table": name })));
        };

        let mut stmt = conn
            .prepare(&format!(
                "PRAGMA table_info({})",
                schema_reset::quote_identifier(&table.name)
            ))
            .map_err(HandlerErr::db("db_query_failed"))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(json!({
                    "name": row.get::<_, String>(1)?,
                    "type": row.get::<_, String>(2)?,
                    "notNull": row.get::<_, i64>(3)? != 0,
                    "default": row.get::<_, Option<String>>(4)?,
                    "primaryKey": row.get::<_, i64>(5)? > 0,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;

        let graph = schema_reset::build_dependency_graph(&tables);
        Ok(json!({
            "name": table.name,
            "ddl": table.ddl,
            "columns": columns,
            "dependsOn": graph.get(&table.name).cloned().unwrap_or_default(),
            "referencedBy": referenced_by(&tables, &table.name),
        }))
    })
}

fn json_to_sql(v: &serde_json::Value) -> Result<Value, HandlerErr> {
    Ok(match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        _ => return Err(HandlerErr::bad_params("params must be scalars")),
    })
}

fn sql_to_json(v: ValueRef<'_>) -> serde_json::Value {
    match v {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => json!({ "blobBytes": b.len() }),
    }
}

/// Runs one raw SQL statement. Row-producing statements return at most `maxRows` rows.
fn handle_query(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let sql = get_required_str(&req.params, "sql")?;
        let args: Vec<Value> = match req.params.get("params") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => {
                items.iter().map(json_to_sql).collect::<Result<_, _>>()?
            }
            Some(_) => return Err(HandlerErr::bad_params("params must be an array")),
        };
        let max_rows = get_optional_i64_range(&req.params, "maxRows", 1, 100_000)?
            .unwrap_or(DEFAULT_MAX_ROWS) as usize;

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| HandlerErr::new("bad_sql", e.to_string()))?;
        info!(sql = %sql, "admin raw sql");

        if stmt.column_count() == 0 {
            let result = stmt.execute(params_from_iter(args.iter()));
            drop(stmt);
            // A raw BEGIN or SAVEPOINT must not outlive the request.
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("ROLLBACK");
                warn!(sql = %sql, "raw sql left a transaction open; rolled back");
                return Err(HandlerErr::new(
                    "transaction_not_allowed",
                    "transaction control statements are not allowed in raw SQL",
                ));
            }
            let changes = result.map_err(|e| HandlerErr::new("db_exec_failed", e.to_string()))?;
            return Ok(json!({ "changes": changes }));
        }

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let mut rows_out: Vec<serde_json::Value> = Vec::new();
        let mut truncated = false;
        let mut rows = stmt
            .query(params_from_iter(args.iter()))
            .map_err(|e| HandlerErr::new("db_exec_failed", e.to_string()))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| HandlerErr::new("db_exec_failed", e.to_string()))?
        {
            if rows_out.len() >= max_rows {
                truncated = true;
                break;
            }
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                let v = row
                    .get_ref(i)
                    .map_err(|e| HandlerErr::new("db_exec_failed", e.to_string()))?;
                cells.push(sql_to_json(v));
            }
            rows_out.push(serde_json::Value::Array(cells));
        }

        Ok(json!({ "columns": columns, "rows": rows_out, "truncated": truncated }))
    })
}

fn handle_reset_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let confirm = req
        .params
        .get("confirm")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if confirm != state.config.reset_confirm {
        return err(
            &req.id,
            "confirmation_required",
            "confirmation phrase does not match",
            None,
        );
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    warn!("admin requested full schema reset");
    match schema_reset::reset_all(conn) {
        Ok(report) => {
            info!(count = report.dropped.len(), "schema reset complete");
            ok(
                &req.id,
                json!({
                    "droppedCount": report.dropped.len(),
                    "dropped": report.dropped,
                    "unresolved": report.unresolved,
                    "steps": report.steps,
                }),
            )
        }
        Err(e) => {
            warn!(error = %e, "schema reset failed");
            err(
                &req.id,
                e.code(),
                e.to_string(),
                Some(json!({ "attempted": e.attempted() })),
            )
        }
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let target = match get_required_str(&req.params, "table") {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };
    if target == RESET_ALL_MARKER {
        return handle_reset_all(state, req);
    }

    respond(req, || {
        let conn = require_db(state)?;
        let tables = catalog(conn)?;
        let Some(table) = find_table(&tables, &target) else {
            return Err(HandlerErr::new("not_found", "table not found")
                .with_details(json!({ "table": target })));
        };
        let blockers = referenced_by(&tables, &table.name);
        if !blockers.is_empty() {
            return Err(HandlerErr::new(
                "table_referenced",
                "other tables still reference this table",
            )
            .with_details(json!({ "table": table.name, "referencedBy": blockers })));
        }

        let steps = schema_reset::execute_drop_batch(conn, std::slice::from_ref(&table.name))
            .map_err(|e| {
                HandlerErr::new(e.code(), e.to_string())
                    .with_details(json!({ "attempted": e.attempted() }))
            })?;
        info!(table = %table.name, "table dropped");
        Ok(json!({ "dropped": table.name, "steps": steps }))
    })
}

fn handle_init(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        db::ensure_schema(conn).map_err(|e| HandlerErr::new("db_init_failed", format!("{e:?}")))?;
        let tables: Vec<String> = catalog(conn)?.into_iter().map(|t| t.name).collect();
        Ok(json!({ "tables": tables }))
    })
}

fn handle_backup(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = require_db(state)?;
        let Some(workspace) = state.workspace.as_ref() else {
            return Err(HandlerErr::new("no_workspace", "select a workspace first"));
        };
        let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
        let summary = backup::export_backup(workspace, &out_path)
            .map_err(|e| HandlerErr::new("backup_failed", format!("{e:?}")))?;
        Ok(json!({
            "outPath": out_path.to_string_lossy(),
            "bundleFormat": summary.bundle_format,
            "dbSha256": summary.db_sha256,
            "dbBytes": summary.db_bytes,
        }))
    })
}

fn handle_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match get_required_str(&req.params, "inPath") {
        Ok(p) => PathBuf::from(p),
        Err(e) => return e.response(&req.id),
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Release the file before swapping it out.
    state.db = None;
    let imported = backup::import_backup(&in_path, &workspace);
    let reopened = db::open_db(&workspace);

    match (imported, reopened) {
        (Ok(summary), Ok(conn)) => {
            state.db = Some(conn);
            info!(path = %in_path.to_string_lossy(), "database restored from backup");
            ok(
                &req.id,
                json!({
                    "bundleFormat": summary.bundle_format,
                    "dbSha256": summary.db_sha256,
                    "dbBytes": summary.db_bytes,
                }),
            )
        }
        (Err(e), reopened) => {
            state.db = reopened.ok();
            err(&req.id, "restore_failed", format!("{e:?}"), None)
        }
        (Ok(_), Err(e)) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.db.tables" => Some(handle_tables(state, req)),
        "admin.db.describe" => Some(handle_describe(state, req)),
        "admin.db.query" => Some(handle_query(state, req)),
        "admin.db.delete" => Some(handle_delete(state, req)),
        "admin.db.init" => Some(handle_init(state, req)),
        "admin.db.backup" => Some(handle_backup(state, req)),
        "admin.db.restore" => Some(handle_restore(state, req)),
        _ => None,
    }
}
