mod auth;
mod backup;
mod config;
mod db;
mod ipc;
mod schema_reset;

use std::io::{self, BufRead, IsTerminal, Write};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, LogFormat};

fn init_tracing(format: LogFormat) {
    // stdout carries the protocol; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn main() {
    let config = Config::from_env();
    init_tracing(config.log_format);
    for message in &config.warnings {
        warn!("{message}");
    }

    let mut state = ipc::AppState::new(config);
    if let Some(path) = state.config.workspace.clone() {
        match db::open_db(&path) {
            Ok(conn) => {
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => warn!(error = %e, "startup workspace could not be opened"),
        }
    }
    if state.config.admin_key.is_none() {
        warn!("TIMETABLED_ADMIN_KEY not set; admin methods are disabled");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "timetabled ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                warn!(error = %e, "unparseable request line");
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
