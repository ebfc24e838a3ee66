//! Dependency-ordered schema reset.
//!
//! Drops every user table in an order where a table is only removed once nothing left
//! in the schema references it. The pipeline is introspect -> dependency graph ->
//! sequence -> one atomic batch.
//!
//! Cyclic foreign keys cannot be satisfied by ordering alone. Tables caught in a cycle
//! are appended at the end of the order and reported as `unresolved`; the batch runs
//! with `defer_foreign_keys` so SQLite only checks constraints at commit, by which point
//! every table involved is gone.

use regex::Regex;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name prefixes owned by the engine itself (SQLite catalog, D1 bookkeeping).
pub const RESERVED_PREFIXES: &[&str] = &["sqlite_", "_cf_"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub ddl: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropPlan {
    pub order: Vec<String>,
    /// Tables that never reached a zero reference count (cycle members and anything
    /// only reachable through a cycle).
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResetReport {
    pub dropped: Vec<String>,
    pub unresolved: Vec<String>,
    pub steps: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("failed to read schema catalog: {0}")]
    Catalog(#[source] rusqlite::Error),

    #[error("drop batch failed: {message}")]
    Batch {
        message: String,
        attempted: Vec<String>,
    },
}

impl ResetError {
    pub fn code(&self) -> &'static str {
        match self {
            ResetError::Catalog(_) => "db_catalog_failed",
            ResetError::Batch { .. } => "db_reset_failed",
        }
    }

    pub fn attempted(&self) -> &[String] {
        match self {
            ResetError::Catalog(_) => &[],
            ResetError::Batch { attempted, .. } => attempted,
        }
    }
}

pub fn is_reserved_table(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Reads every user table and its DDL from the catalog, ordered by name.
pub fn introspect_tables(conn: &Connection) -> Result<Vec<TableDef>, ResetError> {
    let mut stmt = conn
        .prepare(
            "SELECT name, COALESCE(sql, '') FROM sqlite_master
             WHERE type = 'table'
             ORDER BY name",
        )
        .map_err(ResetError::Catalog)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TableDef {
                name: row.get(0)?,
                ddl: row.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ResetError::Catalog)?;

    Ok(rows
        .into_iter()
        .filter(|t| !is_reserved_table(&t.name))
        .collect())
}

fn references_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let ident = r#"(?:"(?:[^"]|"")+"|`[^`]+`|\[[^\]]+\]|[A-Za-z_][A-Za-z0-9_$]*)"#;
        Regex::new(&format!(
            r"(?i)\bREFERENCES\s+({ident}(?:\s*\.\s*{ident})?)"
        ))
        .expect("static REFERENCES pattern")
    })
}

/// Canonical form of a table identifier: unquoted, schema qualifier dropped, case folded.
pub fn normalize_identifier(raw: &str) -> String {
    let last = split_qualified(raw.trim()).pop().unwrap_or_default();
    unquote(&last).to_ascii_lowercase()
}

fn split_qualified(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut close: Option<char> = None;
    for ch in raw.chars() {
        match close {
            Some(c) if ch == c => {
                current.push(ch);
                close = None;
            }
            Some(_) => current.push(ch),
            None => match ch {
                '"' => {
                    current.push(ch);
                    close = Some('"');
                }
                '`' => {
                    current.push(ch);
                    close = Some('`');
                }
                '[' => {
                    current.push(ch);
                    close = Some(']');
                }
                '.' => parts.push(std::mem::take(&mut current).trim().to_string()),
                c if c.is_whitespace() => {}
                c => current.push(c),
            },
        }
    }
    parts.push(current.trim().to_string());
    parts
}

fn unquote(ident: &str) -> String {
    let bytes = ident.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        match (first, last) {
            (b'"', b'"') => return ident[1..ident.len() - 1].replace("\"\"", "\""),
            (b'`', b'`') | (b'[', b']') => return ident[1..ident.len() - 1].to_string(),
            _ => {}
        }
    }
    ident.to_string()
}

/// Blanks string literals and removes comments so only live DDL tokens are scanned.
/// Quoted identifiers (`"x"`, `` `x` ``, `[x]`) are kept as written.
fn strip_literals_and_comments(ddl: &str) -> String {
    let mut out = String::with_capacity(ddl.len());
    let mut chars = ddl.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                while let Some(c) = chars.next() {
                    if c == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                out.push_str("''");
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                out.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            '"' | '`' | '[' => {
                let close = if ch == '[' { ']' } else { ch };
                out.push(ch);
                for c in chars.by_ref() {
                    out.push(c);
                    if c == close {
                        break;
                    }
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Raw targets of every REFERENCES clause in `ddl`, normalized, in order of appearance.
/// Text inside string literals and comments is ignored.
pub fn referenced_tables(ddl: &str) -> Vec<String> {
    let ddl = strip_literals_and_comments(ddl);
    references_regex()
        .captures_iter(&ddl)
        .filter_map(|c| c.get(1))
        .map(|m| normalize_identifier(m.as_str()))
        .collect()
}

/// Maps each table to the tables it references, restricted to `tables` and without
/// self edges. Keys and values use the catalog spelling.
pub fn build_dependency_graph(tables: &[TableDef]) -> HashMap<String, Vec<String>> {
    let by_norm: HashMap<String, &str> = tables
        .iter()
        .map(|t| (normalize_identifier(&t.name), t.name.as_str()))
        .collect();

    let mut graph = HashMap::with_capacity(tables.len());
    for table in tables {
        let own = normalize_identifier(&table.name);
        let mut deps: Vec<String> = Vec::new();
        for target in referenced_tables(&table.ddl) {
            if target == own {
                continue;
            }
            let Some(&actual) = by_norm.get(&target) else {
                debug!(table = %table.name, target = %target, "ignoring reference to unknown table");
                continue;
            };
            if !deps.iter().any(|d| d == actual) {
                deps.push(actual.to_string());
            }
        }
        graph.insert(table.name.clone(), deps);
    }
    graph
}

/// Orders `names` so each table comes before every table it depends on.
///
/// `refCount[T]` counts the tables still pending that reference T; a table is emitted
/// once that count hits zero. Ties resolve in input order. Anything left over sits on
/// a cycle and is appended in input order.
///
/// A table that only hangs off a cycle (referenced by a cycle member, itself acyclic) is
/// appended with the leftovers and can land ahead of the member that references it.
/// Dropping it first relies on deferred foreign-key checks, not on the order.
pub fn sequence_drop_order(names: &[String], graph: &HashMap<String, Vec<String>>) -> DropPlan {
    let mut ref_count: HashMap<&str, usize> = names.iter().map(|n| (n.as_str(), 0)).collect();
    for name in names {
        for dep in graph.get(name).into_iter().flatten() {
            if let Some(c) = ref_count.get_mut(dep.as_str()) {
                *c += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| ref_count.get(n).copied() == Some(0))
        .collect();

    let mut emitted: HashSet<&str> = HashSet::with_capacity(names.len());
    let mut order = Vec::with_capacity(names.len());
    while let Some(name) = queue.pop_front() {
        if !emitted.insert(name) {
            continue;
        }
        order.push(name.to_string());
        for dep in graph.get(name).into_iter().flatten() {
            if let Some(c) = ref_count.get_mut(dep.as_str()) {
                *c = c.saturating_sub(1);
                if *c == 0 {
                    queue.push_back(dep.as_str());
                }
            }
        }
    }

    let mut unresolved = Vec::new();
    for name in names {
        if emitted.insert(name.as_str()) {
            unresolved.push(name.clone());
            order.push(name.clone());
        }
    }

    DropPlan { order, unresolved }
}

pub fn plan_reset(tables: &[TableDef]) -> DropPlan {
    let graph = build_dependency_graph(tables);
    let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    sequence_drop_order(&names, &graph)
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn has_sequence_table(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
        [],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

/// Drops `order` in one transaction with foreign-key checks deferred to commit.
///
/// Nothing is applied unless every statement and the commit succeed.
pub fn execute_drop_batch(conn: &Connection, order: &[String]) -> Result<Vec<String>, ResetError> {
    let mut attempted: Vec<String> = Vec::new();
    let fail = |e: rusqlite::Error, attempted: Vec<String>| ResetError::Batch {
        message: e.to_string(),
        attempted,
    };

    if order.is_empty() {
        return Ok(attempted);
    }

    let cleanup_sequence = match has_sequence_table(conn) {
        Ok(v) => v,
        Err(e) => return Err(fail(e, attempted)),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return Err(fail(e, attempted)),
    };

    let mut steps: Vec<(String, Option<&str>)> =
        vec![("PRAGMA defer_foreign_keys = ON".to_string(), None)];
    for name in order {
        steps.push((format!("DROP TABLE IF EXISTS {}", quote_identifier(name)), None));
        if cleanup_sequence {
            steps.push((
                "DELETE FROM sqlite_sequence WHERE name = ?".to_string(),
                Some(name.as_str()),
            ));
        }
    }

    for (sql, arg) in steps {
        let shown = match arg {
            Some(a) => sql.replace('?', &format!("'{}'", a.replace('\'', "''"))),
            None => sql.clone(),
        };
        attempted.push(shown);
        let res = match arg {
            Some(a) => tx.execute(&sql, [a]).map(|_| ()),
            None => tx.execute_batch(&sql),
        };
        if let Err(e) = res {
            let _ = tx.rollback();
            return Err(fail(e, attempted));
        }
    }

    if let Err(e) = tx.commit() {
        attempted.push("COMMIT".to_string());
        return Err(fail(e, attempted));
    }
    Ok(attempted)
}

/// Introspects, sequences and drops every user table.
///
/// An already empty schema is a successful no-op.
pub fn reset_all(conn: &Connection) -> Result<ResetReport, ResetError> {
    let tables = introspect_tables(conn)?;
    if tables.is_empty() {
        info!("schema reset: no user tables");
        return Ok(ResetReport::default());
    }

    let plan = plan_reset(&tables);
    if !plan.unresolved.is_empty() {
        warn!(tables = ?plan.unresolved, "schema reset: cyclic references, relying on deferred foreign keys");
    }
    info!(count = plan.order.len(), order = ?plan.order, "schema reset: dropping tables");

    let steps = execute_drop_batch(conn, &plan.order)?;
    Ok(ResetReport {
        dropped: plan.order,
        unresolved: plan.unresolved,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, ddl: &str) -> TableDef {
        TableDef {
            name: name.to_string(),
            ddl: ddl.to_string(),
        }
    }

    fn pos(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).expect("table in order")
    }

    #[test]
    fn chain_drops_dependents_first() {
        let tables = vec![
            def("A", "CREATE TABLE A(id INTEGER, b_id INTEGER REFERENCES B(id))"),
            def("B", "CREATE TABLE B(id INTEGER, c_id INTEGER REFERENCES C(id))"),
            def("C", "CREATE TABLE C(id INTEGER PRIMARY KEY)"),
            def("D", "CREATE TABLE D(id INTEGER PRIMARY KEY)"),
        ];
        let plan = plan_reset(&tables);
        assert_eq!(plan.order, vec!["A", "D", "B", "C"]);
        assert!(plan.unresolved.is_empty());
        assert!(pos(&plan.order, "A") < pos(&plan.order, "B"));
        assert!(pos(&plan.order, "B") < pos(&plan.order, "C"));
    }

    #[test]
    fn no_references_keeps_every_table_once() {
        let tables = vec![
            def("x", "CREATE TABLE x(a)"),
            def("y", "CREATE TABLE y(a)"),
            def("z", "CREATE TABLE z(a)"),
        ];
        let plan = plan_reset(&tables);
        assert_eq!(plan.order, vec!["x", "y", "z"]);
    }

    #[test]
    fn mutual_cycle_terminates_with_both_tables() {
        let tables = vec![
            def("X", "CREATE TABLE X(id, y_id REFERENCES Y(id))"),
            def("Y", "CREATE TABLE Y(id, x_id REFERENCES X(id))"),
        ];
        let plan = plan_reset(&tables);
        let mut sorted = plan.order.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["X", "Y"]);
        assert_eq!(plan.unresolved, vec!["X", "Y"]);
    }

    #[test]
    fn cycle_blocks_only_what_hangs_off_it() {
        // leaf -> X <-> Y -> tail; leaf is free, tail stays blocked behind the cycle.
        let tables = vec![
            def("X", "CREATE TABLE X(id, y REFERENCES Y)"),
            def("Y", "CREATE TABLE Y(id, x REFERENCES X, t REFERENCES tail)"),
            def("leaf", "CREATE TABLE leaf(x REFERENCES X)"),
            def("tail", "CREATE TABLE tail(id)"),
        ];
        let plan = plan_reset(&tables);
        assert_eq!(plan.order.len(), 4);
        assert_eq!(plan.order[0], "leaf");
        assert_eq!(plan.unresolved, vec!["X", "Y", "tail"]);
        // Leftovers keep input order, so tail follows both cycle members here.
        assert_eq!(plan.order, vec!["leaf", "X", "Y", "tail"]);
    }

    #[test]
    fn table_hanging_off_cycle_drops_ahead_of_its_referrer() {
        // Y references a_tail, but a_tail sorts before Y among the leftovers.
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE a_tail(id INTEGER PRIMARY KEY);
             CREATE TABLE x(id INTEGER PRIMARY KEY, y_id INTEGER REFERENCES y(id) DEFERRABLE INITIALLY DEFERRED);
             CREATE TABLE y(id INTEGER PRIMARY KEY, x_id INTEGER REFERENCES x(id) DEFERRABLE INITIALLY DEFERRED,
                            t_id INTEGER REFERENCES a_tail(id));
             INSERT INTO a_tail(id) VALUES (1);
             BEGIN;
             INSERT INTO x(id, y_id) VALUES (1, 1);
             INSERT INTO y(id, x_id, t_id) VALUES (1, 1, 1);
             COMMIT;",
        )
        .expect("seed");

        let report = reset_all(&conn).expect("reset");
        assert_eq!(report.dropped, vec!["a_tail", "x", "y"]);
        assert_eq!(report.unresolved, vec!["a_tail", "x", "y"]);
        assert!(introspect_tables(&conn).expect("introspect").is_empty());
    }

    #[test]
    fn literals_and_comments_do_not_create_edges() {
        let tables = vec![
            def(
                "a",
                "CREATE TABLE a(
                    id INTEGER PRIMARY KEY,
                    note TEXT DEFAULT 'REFERENCES b', -- REFERENCES c
                    memo TEXT DEFAULT 'it''s REFERENCES b' /* REFERENCES b(id) */
                 )",
            ),
            def("b", "CREATE TABLE b(id INTEGER, y INTEGER REFERENCES a(id))"),
            def("c", "CREATE TABLE \"c\"(id INTEGER, \"x--y\" INTEGER REFERENCES [a](id))"),
        ];
        assert!(referenced_tables(&tables[0].ddl).is_empty());
        assert_eq!(referenced_tables(&tables[2].ddl), vec!["a"]);

        let graph = build_dependency_graph(&tables);
        assert!(graph["a"].is_empty());

        let plan = plan_reset(&tables);
        assert_eq!(plan.order, vec!["b", "c", "a"]);
        assert!(plan.unresolved.is_empty());
    }

    #[test]
    fn quoted_and_qualified_references_are_normalized() {
        let tables = vec![
            def(
                "Scores",
                r#"CREATE TABLE "Scores"(s TEXT REFERENCES "main"."STUDENTS"(id), a TEXT REFERENCES [assessments](id))"#,
            ),
            def("students", "CREATE TABLE students(id TEXT PRIMARY KEY)"),
            def("assessments", "CREATE TABLE `assessments`(id TEXT, FOREIGN KEY(id) REFERENCES `Students`(id))"),
        ];
        let graph = build_dependency_graph(&tables);
        assert_eq!(graph["Scores"], vec!["students", "assessments"]);
        assert_eq!(graph["assessments"], vec!["students"]);

        let plan = plan_reset(&tables);
        assert_eq!(plan.order, vec!["Scores", "assessments", "students"]);
    }

    #[test]
    fn self_and_unknown_references_are_dropped() {
        let tables = vec![def(
            "nodes",
            "CREATE TABLE nodes(id, parent REFERENCES nodes(id), ext REFERENCES elsewhere(id))",
        )];
        let graph = build_dependency_graph(&tables);
        assert!(graph["nodes"].is_empty());
        assert_eq!(plan_reset(&tables).order, vec!["nodes"]);
    }

    #[test]
    fn duplicate_references_count_once() {
        let tables = vec![
            def(
                "pairs",
                "CREATE TABLE pairs(a REFERENCES people(id), b REFERENCES people(id))",
            ),
            def("people", "CREATE TABLE people(id)"),
        ];
        let graph = build_dependency_graph(&tables);
        assert_eq!(graph["pairs"], vec!["people"]);
        assert_eq!(plan_reset(&tables).order, vec!["pairs", "people"]);
    }

    #[test]
    fn reserved_prefixes_are_detected() {
        assert!(is_reserved_table("sqlite_sequence"));
        assert!(is_reserved_table("_cf_KV"));
        assert!(!is_reserved_table("users"));
    }

    #[test]
    fn reset_on_empty_schema_is_ok() {
        let conn = Connection::open_in_memory().expect("open");
        let report = reset_all(&conn).expect("reset");
        assert!(report.dropped.is_empty());
        assert!(report.steps.is_empty());
    }

    #[test]
    fn reset_drops_populated_tables_with_cycle_and_autoincrement() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parents(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);
             CREATE TABLE children(id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parents(id));
             CREATE TABLE ping(id INTEGER PRIMARY KEY, pong_id INTEGER REFERENCES pong(id) DEFERRABLE INITIALLY DEFERRED);
             CREATE TABLE pong(id INTEGER PRIMARY KEY, ping_id INTEGER REFERENCES ping(id) DEFERRABLE INITIALLY DEFERRED);
             INSERT INTO parents(name) VALUES ('a');
             INSERT INTO children(id, parent_id) VALUES (1, 1);
             BEGIN;
             INSERT INTO ping(id, pong_id) VALUES (1, 1);
             INSERT INTO pong(id, ping_id) VALUES (1, 1);
             COMMIT;",
        )
        .expect("seed");

        let report = reset_all(&conn).expect("reset");
        assert_eq!(report.dropped.len(), 4);
        assert!(pos(&report.dropped, "children") < pos(&report.dropped, "parents"));
        assert_eq!(report.unresolved, vec!["ping", "pong"]);
        assert!(introspect_tables(&conn).expect("introspect").is_empty());

        let again = reset_all(&conn).expect("second reset");
        assert!(again.dropped.is_empty());
    }

    #[test]
    fn failed_batch_rolls_back_and_reports_attempts() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parents(id INTEGER PRIMARY KEY);
             CREATE TABLE children(id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parents(id));
             INSERT INTO parents(id) VALUES (1);
             INSERT INTO children(id, parent_id) VALUES (1, 1);",
        )
        .expect("seed");

        // Dropping the referenced table alone leaves a dangling child row at commit.
        let err = execute_drop_batch(&conn, &["parents".to_string()])
            .expect_err("commit rejects dangling reference");
        assert_eq!(err.code(), "db_reset_failed");
        assert!(err
            .attempted()
            .iter()
            .any(|s| s == "DROP TABLE IF EXISTS \"parents\""));
        assert_eq!(err.attempted().last().map(String::as_str), Some("COMMIT"));

        let names: Vec<String> = introspect_tables(&conn)
            .expect("introspect")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["children", "parents"]);
    }

    #[test]
    fn unreadable_catalog_is_reported_without_attempts() {
        let path = std::env::temp_dir().join(format!(
            "timetabled-not-a-db-{}.sqlite3",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::write(&path, vec![b'x'; 4096]).expect("write junk file");
        let conn = Connection::open(&path).expect("open is lazy");

        let err = introspect_tables(&conn).expect_err("junk file has no catalog");
        assert!(matches!(err, ResetError::Catalog(_)));
        assert_eq!(err.code(), "db_catalog_failed");
        assert!(err.attempted().is_empty());

        let err = reset_all(&conn).expect_err("reset stops at the catalog");
        assert_eq!(err.code(), "db_catalog_failed");
        assert!(err.attempted().is_empty());

        drop(conn);
        let _ = std::fs::remove_file(&path);
    }
}
