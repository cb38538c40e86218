use crate::config::RecordsConfig;
use crate::ipc::handlers::courses::course_code;
use crate::ipc::helpers::{
    db_query_err, get_optional_i64, get_optional_str, get_required_str, require_db, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sequence::{self, IdentifierKind, ScopePattern};
use rusqlite::Connection;
use serde_json::{json, Value};

fn parse_kind(params: &Value) -> Result<IdentifierKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    IdentifierKind::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params("kind must be one of: registration, receipt, examPass")
    })
}

/// Builds the scope pattern for `kind`, resolving `courseId` to its code when
/// given. `year` defaults to the current year.
fn pattern_for(
    conn: &Connection,
    config: &RecordsConfig,
    kind: IdentifierKind,
    params: &Value,
) -> Result<ScopePattern, HandlerErr> {
    let year = match get_optional_i64(params, "year")? {
        Some(y) if (1900..=9999).contains(&y) => y as i32,
        Some(_) => return Err(HandlerErr::bad_params("year must be between 1900 and 9999")),
        None => sequence::current_year(),
    };
    Ok(match kind {
        IdentifierKind::Registration => {
            let code = match get_optional_str(params, "courseId")? {
                Some(cid) => Some(
                    course_code(conn, &cid)?
                        .ok_or_else(|| HandlerErr::not_found("course not found"))?,
                ),
                None => get_optional_str(params, "courseCode")?,
            };
            ScopePattern::registration(year, code.as_deref(), config.registration_width)
        }
        IdentifierKind::Receipt => ScopePattern::receipt(year),
        IdentifierKind::ExamPass => ScopePattern::exam_pass(year),
    })
}

fn sequences_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let counters = sequence::list_counters(conn).map_err(db_query_err)?;
    Ok(json!({ "counters": counters }))
}

fn sequences_peek(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let kind = parse_kind(params)?;
    let pattern = pattern_for(conn, &state.config, kind, params)?;
    let (current, next) = sequence::peek(conn, kind, &pattern)?;
    Ok(json!({
        "kind": kind.as_str(),
        "scopeKey": pattern.scope_key(),
        "lastValue": current,
        "nextIdentifier": next,
    }))
}

fn sequences_allocate(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let kind = parse_kind(params)?;
    let pattern = pattern_for(conn, &state.config, kind, params)?;
    let allocation = sequence::allocate(conn, kind, &pattern)?;
    Ok(json!({ "kind": kind.as_str(), "allocation": allocation }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "sequences.list" => require_db(state).and_then(sequences_list),
        "sequences.peek" => sequences_peek(state, &req.params),
        "sequences.allocate" => sequences_allocate(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
