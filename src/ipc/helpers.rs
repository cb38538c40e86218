use rusqlite::Connection;
use serde_json::Value;

use crate::grading::DeriveError;
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::sequence::AllocError;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<AllocError> for HandlerErr {
    fn from(e: AllocError) -> Self {
        let code = e.code();
        let message = match &e {
            AllocError::AllocationExhausted { .. } => {
                "could not generate identifier, please retry".to_string()
            }
            other => other.to_string(),
        };
        let details = match &e {
            AllocError::AllocationExhausted {
                scope_key,
                attempts,
            } => Some(serde_json::json!({ "scopeKey": scope_key, "attempts": attempts })),
            AllocError::AllocationConflict {
                scope_key,
                identifier,
            } => Some(serde_json::json!({ "scopeKey": scope_key, "identifier": identifier })),
            _ => None,
        };
        Self {
            code,
            message,
            details,
        }
    }
}

impl From<DeriveError> for HandlerErr {
    fn from(e: DeriveError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            details: Some(e.details()),
        }
    }
}

pub fn db_query_err(e: impl ToString) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_insert_err(table: &str, e: impl ToString) -> HandlerErr {
    HandlerErr::new("db_insert_failed", e.to_string())
        .with_details(serde_json::json!({ "table": table }))
}

pub fn db_update_err(e: impl ToString) -> HandlerErr {
    HandlerErr::new("db_update_failed", e.to_string())
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    }
    Ok(s)
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_required_obj<'a>(
    params: &'a Value,
    key: &str,
) -> Result<&'a serde_json::Map<String, Value>, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an object", key)))
}

/// Accepts one of `allowed`, or `default` when the key is absent.
pub fn get_enum_str(
    params: &Value,
    key: &str,
    allowed: &[&'static str],
    default: Option<&'static str>,
) -> Result<&'static str, HandlerErr> {
    match get_optional_str(params, key)? {
        Some(s) => allowed
            .iter()
            .copied()
            .find(|a| *a == s)
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("{} must be one of: {}", key, allowed.join(", ")))
            }),
        None => default.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key))),
    }
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn respond(id: &str, res: Result<Value, HandlerErr>) -> Value {
    match res {
        Ok(v) => crate::ipc::error::ok(id, v),
        Err(e) => e.response(id),
    }
}
