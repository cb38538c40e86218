use crate::config;
use crate::ipc::helpers::{db_update_err, get_required_obj, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::time::Duration;

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let res = require_db(state).map(|_| json!({ "config": state.config.to_json() }));
    respond(&req.id, res)
}

fn config_update(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let patch = get_required_obj(params, "patch")?;
    let mut next = state.config;
    next.merge_patch(patch).map_err(HandlerErr::bad_params)?;
    config::save(conn, &next).map_err(db_update_err)?;
    conn.busy_timeout(Duration::from_millis(next.busy_timeout_ms))
        .map_err(db_update_err)?;
    state.config = next;
    Ok(json!({ "config": next.to_json() }))
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let res = config_update(state, &req.params);
    respond(&req.id, res)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}
