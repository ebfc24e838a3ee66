use tracing::{debug, warn};

use super::handlers;
use super::types::{AppState, Request};
use crate::auth::{check_admin_key, AdminCheck, ADMIN_KEY_HEADER};
use crate::ipc::error::err;

fn is_admin_method(method: &str) -> bool {
    method.starts_with("admin.")
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!(id = %req.id, method = %req.method, "request");

    if is_admin_method(&req.method) {
        match check_admin_key(state.config.admin_key.as_deref(), req.header(ADMIN_KEY_HEADER)) {
            AdminCheck::Granted => {}
            AdminCheck::Disabled => {
                warn!(method = %req.method, "admin method called but no admin key is configured");
                return err(&req.id, "unauthorized", "admin access is disabled", None);
            }
            AdminCheck::Missing | AdminCheck::Rejected => {
                warn!(method = %req.method, "admin method rejected: bad credential");
                return err(&req.id, "unauthorized", "invalid admin credential", None);
            }
        }
    }

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::timetable::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::assessments::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::users::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::moderation::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::retention::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::admin_db::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
