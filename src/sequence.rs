//! Scoped sequence allocation for human-readable identifiers.
//!
//! Each scope (`25/BSE`, `RCP-2025`, ...) owns one row in `sequence_counters`.
//! The row is only ever advanced by a single upsert executed under SQLite's write
//! lock, so two connections allocating in the same scope can never observe the
//! same value. Counters are never rolled back: a value handed to a caller whose
//! insert later fails is simply skipped.

use chrono::{Datelike, Local};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db;

pub const DEFAULT_COURSE_CODE: &str = "GEN";
pub const REGISTRATION_WIDTH: usize = 3;
pub const RECEIPT_WIDTH: usize = 6;
pub const EXAM_PASS_WIDTH: usize = 6;

/// Largest value a counter may hold. `last_value` is an SQLite INTEGER, so the
/// next increment must still fit in an `i64`.
pub const MAX_SEQUENCE: u64 = (i64::MAX - 1) as u64;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("scope key must not be empty")]
    InvalidScope,
    #[error("identifier {identifier} already exists in scope {scope_key}")]
    AllocationConflict {
        scope_key: String,
        identifier: String,
    },
    #[error("could not generate identifier in scope {scope_key} after {attempts} attempts, please retry")]
    AllocationExhausted { scope_key: String, attempts: u32 },
    #[error("sequence in scope {scope_key} has reached its maximum value")]
    SequenceOverflow { scope_key: String },
    #[error("sequence store error: {0}")]
    Store(#[from] rusqlite::Error),
    /// The owning record's write failed for a reason other than the identifier.
    #[error("{0}")]
    Persist(#[source] rusqlite::Error),
}

impl AllocError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidScope => "invalid_scope",
            Self::AllocationConflict { .. } => "conflict",
            Self::AllocationExhausted { .. } => "allocation_exhausted",
            Self::SequenceOverflow { .. } => "sequence_overflow",
            Self::Store(_) => "db_update_failed",
            Self::Persist(_) => "db_insert_failed",
        }
    }
}

/// The three identifier families, each bound to the column that stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Registration,
    Receipt,
    ExamPass,
}

impl IdentifierKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(Self::Registration),
            "receipt" => Some(Self::Receipt),
            "examPass" => Some(Self::ExamPass),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Receipt => "receipt",
            Self::ExamPass => "examPass",
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Registration => "students",
            Self::Receipt => "payments",
            Self::ExamPass => "exam_passes",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::Registration => "registration_no",
            Self::Receipt => "receipt_number",
            Self::ExamPass => "pass_number",
        }
    }
}

/// Prefix, separator and zero-pad width of one scope's identifiers.
///
/// `scope_key + separator + zero_pad(n, width)`; values wider than `width` are
/// printed in full rather than truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePattern {
    scope_key: String,
    separator: &'static str,
    width: usize,
}

impl ScopePattern {
    #[allow(dead_code)]
    pub fn new(
        scope_key: impl Into<String>,
        separator: &'static str,
        width: usize,
    ) -> Result<Self, AllocError> {
        let scope_key = scope_key.into();
        if scope_key.trim().is_empty() {
            return Err(AllocError::InvalidScope);
        }
        Ok(Self {
            scope_key,
            separator,
            width,
        })
    }

    /// `YY/CCC`, where `CCC` is the first three characters of the course code,
    /// uppercased, or `GEN` without a usable code.
    pub fn registration(year: i32, course_code: Option<&str>, width: usize) -> Self {
        let code: String = course_code
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_COURSE_CODE)
            .chars()
            .take(3)
            .collect::<String>()
            .to_uppercase();
        Self {
            scope_key: format!("{:02}/{}", year.rem_euclid(100), code),
            separator: "/",
            width,
        }
    }

    pub fn receipt(year: i32) -> Self {
        Self {
            scope_key: format!("RCP-{}", year),
            separator: "-",
            width: RECEIPT_WIDTH,
        }
    }

    pub fn exam_pass(year: i32) -> Self {
        Self {
            scope_key: format!("EP-{}", year),
            separator: "-",
            width: EXAM_PASS_WIDTH,
        }
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn prefix(&self) -> String {
        format!("{}{}", self.scope_key, self.separator)
    }

    pub fn format(&self, n: u64) -> String {
        format!("{}{:0width$}", self.prefix(), n, width = self.width)
    }

    /// Sequence number embedded in `identifier`, if it belongs to this scope.
    /// The prefix is matched case-insensitively and any digit count is accepted,
    /// so identifiers minted under older padding rules still count. Values above
    /// [`MAX_SEQUENCE`] are not sequence numbers and are ignored.
    pub fn parse(&self, identifier: &str) -> Option<u64> {
        let prefix = self.prefix();
        let head = identifier.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(&prefix) {
            return None;
        }
        match sequence_digits(&identifier[prefix.len()..]) {
            Some(Ok(n)) => Some(n),
            _ => None,
        }
    }
}

/// `None` if `digits` is not a non-empty run of ASCII digits, `Some(Err(()))` if
/// it is but the value exceeds [`MAX_SEQUENCE`].
fn sequence_digits(digits: &str) -> Option<Result<u64, ()>> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(match digits.parse::<u64>() {
        Ok(n) if n <= MAX_SEQUENCE => Ok(n),
        _ => Err(()),
    })
}

/// Numeric tail of a hand-entered identifier (the part after the last
/// `separator`), or `None` when the tail is not numeric. Rejects tails a
/// counter could never reach.
pub fn trailing_value(identifier: &str, separator: &str) -> Result<Option<u64>, AllocError> {
    let Some((head, tail)) = identifier.rsplit_once(separator) else {
        return Ok(None);
    };
    match sequence_digits(tail) {
        None => Ok(None),
        Some(Ok(n)) => Ok(Some(n)),
        Some(Err(())) => Err(AllocError::SequenceOverflow {
            scope_key: head.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub scope_key: String,
    pub value: u64,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterRow {
    pub scope_key: String,
    pub last_value: u64,
    pub updated_at: Option<String>,
}

pub fn current_year() -> i32 {
    Local::now().year()
}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Highest sequence number already persisted under the scope's prefix, 0 if none.
pub fn bootstrap_seed(
    conn: &Connection,
    kind: IdentifierKind,
    pattern: &ScopePattern,
) -> rusqlite::Result<u64> {
    let prefix = pattern.prefix();
    let sql = format!(
        "SELECT {col} FROM {table}
         WHERE {col} IS NOT NULL AND upper(substr({col}, 1, ?1)) = upper(?2)",
        col = kind.column(),
        table = kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map((prefix.chars().count() as i64, &prefix), |r| {
            r.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids
        .iter()
        .filter_map(|id| pattern.parse(id))
        .max()
        .unwrap_or(0))
}

/// Advances the scope's counter by one and returns the new value formatted.
///
/// A missing counter is seeded from existing identifiers inside the same write
/// transaction, so bootstrapping races the same way an ordinary increment does.
pub fn allocate(
    conn: &Connection,
    kind: IdentifierKind,
    pattern: &ScopePattern,
) -> Result<Allocation, AllocError> {
    if pattern.scope_key().trim().is_empty() {
        return Err(AllocError::InvalidScope);
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let existing: Option<i64> = tx
        .query_row(
            "SELECT last_value FROM sequence_counters WHERE scope_key = ?",
            [pattern.scope_key()],
            |r| r.get(0),
        )
        .optional()?;
    let seed = match existing {
        Some(v) if v >= MAX_SEQUENCE as i64 => {
            return Err(AllocError::SequenceOverflow {
                scope_key: pattern.scope_key().to_string(),
            });
        }
        Some(_) => 0,
        None => {
            let seed = bootstrap_seed(&tx, kind, pattern)?;
            info!(
                scope = pattern.scope_key(),
                seed,
                kind = kind.as_str(),
                "initializing sequence counter"
            );
            seed
        }
    };
    let value: i64 = tx.query_row(
        "INSERT INTO sequence_counters(scope_key, last_value, updated_at)
         VALUES(?1, ?2 + 1, ?3)
         ON CONFLICT(scope_key) DO UPDATE SET
           last_value = last_value + 1,
           updated_at = excluded.updated_at
         RETURNING last_value",
        (pattern.scope_key(), seed as i64, now_stamp()),
        |r| r.get(0),
    )?;
    tx.commit()?;

    let value = value as u64;
    debug!(scope = pattern.scope_key(), value, "allocated sequence value");
    Ok(Allocation {
        scope_key: pattern.scope_key().to_string(),
        value,
        identifier: pattern.format(value),
    })
}

/// Raises the counter to the highest persisted identifier. Used after a
/// conflict, when a hand-entered identifier has overtaken the counter.
fn resync(conn: &Connection, kind: IdentifierKind, pattern: &ScopePattern) -> rusqlite::Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let seed = bootstrap_seed(&tx, kind, pattern)?;
    tx.execute(
        "UPDATE sequence_counters
         SET last_value = max(last_value, ?2), updated_at = ?3
         WHERE scope_key = ?1",
        (pattern.scope_key(), seed as i64, now_stamp()),
    )?;
    tx.commit()
}

/// Allocates an identifier and hands it to `persist`, which writes the owning
/// record. A uniqueness violation on the identifier column is retried with a
/// fresh allocation up to `max_attempts` times; any other persist error comes
/// back as [`AllocError::Persist`] for the caller to map.
pub fn allocate_and_persist<T, F>(
    conn: &Connection,
    kind: IdentifierKind,
    pattern: &ScopePattern,
    max_attempts: u32,
    mut persist: F,
) -> Result<(Allocation, T), AllocError>
where
    F: FnMut(&Allocation) -> rusqlite::Result<T>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let allocation = allocate(conn, kind, pattern)?;
        match persist(&allocation) {
            Ok(v) => return Ok((allocation, v)),
            Err(e) if conflicts_on(&e, kind) => {
                let conflict = AllocError::AllocationConflict {
                    scope_key: allocation.scope_key.clone(),
                    identifier: allocation.identifier.clone(),
                };
                warn!(attempt, max_attempts = attempts, error = %conflict, "retrying allocation");
                resync(conn, kind, pattern)?;
            }
            Err(e) => return Err(AllocError::Persist(e)),
        }
    }
    Err(AllocError::AllocationExhausted {
        scope_key: pattern.scope_key().to_string(),
        attempts,
    })
}

fn conflicts_on(e: &rusqlite::Error, kind: IdentifierKind) -> bool {
    if !db::is_unique_violation(e) {
        return false;
    }
    let needle = format!("{}.{}", kind.table(), kind.column());
    match e {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.contains(&needle),
        _ => false,
    }
}

/// Current counter for the scope, or the bootstrap seed when none exists yet,
/// together with the identifier the next allocation would produce.
pub fn peek(
    conn: &Connection,
    kind: IdentifierKind,
    pattern: &ScopePattern,
) -> Result<(u64, String), AllocError> {
    if pattern.scope_key().trim().is_empty() {
        return Err(AllocError::InvalidScope);
    }
    let existing: Option<i64> = conn
        .query_row(
            "SELECT last_value FROM sequence_counters WHERE scope_key = ?",
            [pattern.scope_key()],
            |r| r.get(0),
        )
        .optional()?;
    let current = match existing {
        Some(v) => v as u64,
        None => bootstrap_seed(conn, kind, pattern)?,
    };
    Ok((current, pattern.format(current + 1)))
}

pub fn list_counters(conn: &Connection) -> rusqlite::Result<Vec<CounterRow>> {
    let mut stmt = conn.prepare(
        "SELECT scope_key, last_value, updated_at FROM sequence_counters ORDER BY scope_key",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CounterRow {
                scope_key: r.get(0)?,
                last_value: r.get::<_, i64>(1)? as u64,
                updated_at: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
