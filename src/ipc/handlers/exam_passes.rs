use crate::config::RecordsConfig;
use crate::ipc::helpers::{
    db_insert_err, db_query_err, db_update_err, get_optional_str, get_required_str, now_stamp,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sequence::{self, AllocError, IdentifierKind, ScopePattern};
use chrono::{Datelike, Duration, Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const EXAM_TYPES: &[&str] = &["Mid-Term", "End-Term", "Final", "Supplementary"];
const DATE_FMT: &str = "%Y-%m-%d";

/// The payment fields an exam pass is minted from.
pub struct PassSource<'a> {
    pub payment_id: &'a str,
    pub student_id: &'a str,
    pub semester: &'a str,
    pub academic_year: &'a str,
    pub receipt_number: &'a str,
}

/// Short digest printed on the pass so a scanned number can be checked offline.
pub fn verification_code(pass_number: &str, student_id: &str, payment_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pass_number.as_bytes());
    hasher.update(b"|");
    hasher.update(student_id.as_bytes());
    hasher.update(b"|");
    hasher.update(payment_id.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02X}", b)).collect()
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Mints a pass for an exam-fee payment and links it back to the payment in
/// one transaction. With `confirm_pending` the payment's `Pending → Confirmed`
/// transition joins that transaction, so either all three writes land or none.
pub fn issue_exam_pass(
    conn: &Connection,
    config: &RecordsConfig,
    source: &PassSource<'_>,
    exam_type: &str,
    notes: &str,
    confirm_pending: bool,
) -> Result<Value, HandlerErr> {
    let issue_date = today();
    let expiry_date = issue_date + Duration::days(config.exam_pass_validity_days);
    let pass_id = Uuid::new_v4().to_string();
    // The pass number year follows the issue date, not a second clock read.
    let pattern = ScopePattern::exam_pass(issue_date.year());

    let (allocation, issued) = sequence::allocate_and_persist(
        conn,
        IdentifierKind::ExamPass,
        &pattern,
        config.max_allocation_attempts,
        |a| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            if confirm_pending {
                let now = now_stamp();
                let n = tx.execute(
                    "UPDATE payments SET status = 'Confirmed', confirmed_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status = 'Pending'",
                    (source.payment_id, &now),
                )?;
                if n == 0 {
                    // Dropping `tx` rolls back; the allocated number is burned.
                    return Ok(false);
                }
            }
            tx.execute(
                "INSERT INTO exam_passes(
                   id, student_id, payment_id, semester, academic_year, exam_type, pass_number,
                   issue_date, expiry_date, status, notes, verification_code, created_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'Active', ?, ?, ?)",
                rusqlite::params![
                    pass_id,
                    source.student_id,
                    source.payment_id,
                    source.semester,
                    source.academic_year,
                    exam_type,
                    a.identifier,
                    issue_date.format(DATE_FMT).to_string(),
                    expiry_date.format(DATE_FMT).to_string(),
                    notes,
                    verification_code(&a.identifier, source.student_id, source.payment_id),
                    now_stamp(),
                ],
            )?;
            tx.execute(
                "UPDATE payments SET exam_pass_id = ?, updated_at = ? WHERE id = ?",
                (&pass_id, now_stamp(), source.payment_id),
            )?;
            tx.commit()?;
            Ok(true)
        },
    )
    .map_err(|e| match e {
        AllocError::Persist(e) if crate::db::is_unique_violation(&e) => HandlerErr::new(
            "conflict",
            "exam pass already generated for this payment",
        ),
        AllocError::Persist(e) => db_insert_err("exam_passes", e),
        other => other.into(),
    })?;
    if !issued {
        return Err(HandlerErr::new("conflict", "payment already processed"));
    }
    tracing::info!(
        pass_number = %allocation.identifier,
        receipt_number = source.receipt_number,
        "exam pass issued"
    );
    exam_pass_by(conn, "id", &pass_id)?
        .ok_or_else(|| HandlerErr::not_found("exam pass not found"))
}

fn is_valid(status: &str, expiry_date: &str, today: NaiveDate) -> bool {
    let Ok(expiry) = NaiveDate::parse_from_str(expiry_date, DATE_FMT) else {
        return false;
    };
    status == "Active" && today < expiry
}

fn pass_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let status: String = r.get(9)?;
    let expiry: String = r.get(8)?;
    let valid = is_valid(&status, &expiry, today());
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "paymentId": r.get::<_, String>(2)?,
        "semester": r.get::<_, String>(3)?,
        "academicYear": r.get::<_, String>(4)?,
        "examType": r.get::<_, String>(5)?,
        "passNumber": r.get::<_, String>(6)?,
        "issueDate": r.get::<_, String>(7)?,
        "expiryDate": expiry,
        "status": status,
        "notes": r.get::<_, Option<String>>(10)?,
        "verificationCode": r.get::<_, String>(11)?,
        "createdAt": r.get::<_, String>(12)?,
        "studentName": r.get::<_, Option<String>>(13)?,
        "registrationNo": r.get::<_, Option<String>>(14)?,
        "isValid": valid,
    }))
}

const PASS_SELECT: &str = "SELECT e.id, e.student_id, e.payment_id, e.semester, e.academic_year,
        e.exam_type, e.pass_number, e.issue_date, e.expiry_date, e.status, e.notes,
        e.verification_code, e.created_at, s.name, s.registration_no
 FROM exam_passes e
 LEFT JOIN students s ON s.id = e.student_id";

fn exam_pass_by(conn: &Connection, column: &str, value: &str) -> Result<Option<Value>, HandlerErr> {
    let sql = format!("{} WHERE e.{} = ?", PASS_SELECT, column);
    conn.query_row(&sql, [value], pass_json)
        .optional()
        .map_err(db_query_err)
}

fn exam_passes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let sql = format!(
        "{} WHERE (?1 IS NULL OR e.student_id = ?1) ORDER BY e.created_at DESC, e.rowid DESC",
        PASS_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map([student_id.as_deref()], pass_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "examPasses": rows }))
}

fn exam_passes_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pass_id = get_required_str(params, "examPassId")?;
    match exam_pass_by(conn, "id", &pass_id)? {
        Some(p) => Ok(json!({ "examPass": p })),
        None => Err(HandlerErr::not_found("exam pass not found")),
    }
}

fn exam_passes_revoke(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pass_id = get_required_str(params, "examPassId")?;
    let reason = get_optional_str(params, "reason")?.unwrap_or_else(|| "No reason provided".to_string());
    let n = conn
        .execute(
            "UPDATE exam_passes
             SET status = 'Revoked',
                 notes = CASE WHEN notes IS NULL OR notes = '' THEN ?2 ELSE notes || char(10) || ?2 END
             WHERE id = ?1",
            (&pass_id, format!("Revoked: {}", reason)),
        )
        .map_err(db_update_err)?;
    if n == 0 {
        return Err(HandlerErr::not_found("exam pass not found"));
    }
    tracing::info!(exam_pass_id = %pass_id, "exam pass revoked");
    exam_passes_get(conn, &json!({ "examPassId": pass_id }))
}

fn exam_passes_verify(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pass_number = get_required_str(params, "passNumber")?;
    let Some(pass) = exam_pass_by(conn, "pass_number", &pass_number)? else {
        return Err(HandlerErr::not_found("invalid exam pass number"));
    };
    let code_matches = match get_optional_str(params, "verificationCode")? {
        Some(code) => pass
            .get("verificationCode")
            .and_then(|v| v.as_str())
            .map(|v| v.eq_ignore_ascii_case(&code))
            .unwrap_or(false),
        None => true,
    };
    let valid = code_matches && pass.get("isValid").and_then(|v| v.as_bool()).unwrap_or(false);
    let message = if !code_matches {
        "verification code does not match"
    } else if valid {
        "valid exam pass"
    } else {
        "exam pass is not valid (expired or revoked)"
    };
    Ok(json!({ "examPass": pass, "isValid": valid, "message": message }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "examPasses.list" => require_db(state).and_then(|c| exam_passes_list(c, &req.params)),
        "examPasses.get" => require_db(state).and_then(|c| exam_passes_get(c, &req.params)),
        "examPasses.revoke" => require_db(state).and_then(|c| exam_passes_revoke(c, &req.params)),
        "examPasses.verify" => require_db(state).and_then(|c| exam_passes_verify(c, &req.params)),
        _ => return None,
    };
    Some(respond(&req.id, res))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_code_is_stable_and_input_sensitive() {
        let a = verification_code("EP-2025-000001", "s1", "p1");
        assert_eq!(a.len(), 16);
        assert_eq!(a, verification_code("EP-2025-000001", "s1", "p1"));
        assert_ne!(a, verification_code("EP-2025-000002", "s1", "p1"));
    }

    #[test]
    fn validity_requires_active_status_and_future_expiry() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).expect("date");
        assert!(is_valid("Active", "2025-03-02", today));
        assert!(!is_valid("Active", "2025-03-01", today));
        assert!(!is_valid("Revoked", "2025-06-01", today));
        assert!(!is_valid("Active", "not a date", today));
    }
}
