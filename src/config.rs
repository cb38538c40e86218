use crate::db;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CONFIG_KEY: &str = "records.config";

/// Workspace-level knobs, stored as JSON in the `settings` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsConfig {
    pub max_allocation_attempts: u32,
    pub exam_pass_validity_days: i64,
    pub registration_width: usize,
    pub busy_timeout_ms: u64,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            max_allocation_attempts: 5,
            exam_pass_validity_days: 90,
            registration_width: crate::sequence::REGISTRATION_WIDTH,
            busy_timeout_ms: db::DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl RecordsConfig {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Applies a partial update. Unknown keys and out-of-range values are rejected
    /// without touching `self`.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = *self;
        for (k, v) in patch {
            match k.as_str() {
                "maxAllocationAttempts" => {
                    next.max_allocation_attempts = parse_int_range(v, k, 1, 20)? as u32;
                }
                "examPassValidityDays" => {
                    next.exam_pass_validity_days = parse_int_range(v, k, 1, 3650)?;
                }
                "registrationWidth" => {
                    next.registration_width = parse_int_range(v, k, 3, 6)? as usize;
                }
                "busyTimeoutMs" => {
                    next.busy_timeout_ms = parse_int_range(v, k, 0, 60_000)? as u64;
                }
                _ => return Err(format!("unknown config field: {}", k)),
            }
        }
        *self = next;
        Ok(())
    }
}

fn parse_int_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let Some(n) = v.as_i64() else {
        return Err(format!("{} must be an integer", key));
    };
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}

pub fn load(conn: &Connection) -> anyhow::Result<RecordsConfig> {
    let mut current = RecordsConfig::default();
    if let Some(saved) = db::settings_get_json(conn, CONFIG_KEY)? {
        if let Some(obj) = saved.as_object() {
            // A malformed saved value must not block the workspace from opening.
            if let Err(msg) = current.merge_patch(obj) {
                tracing::warn!(error = %msg, "ignoring invalid saved config");
            }
        }
    }
    Ok(current)
}

pub fn save(conn: &Connection, config: &RecordsConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, CONFIG_KEY, &config.to_json())
}
