use crate::ipc::handlers::exam_passes::{issue_exam_pass, PassSource, EXAM_TYPES};
use crate::ipc::handlers::students::require_student;
use crate::ipc::helpers::{
    db_query_err, db_update_err, get_enum_str, get_optional_str, get_required_str, now_stamp,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sequence::{self, IdentifierKind, ScopePattern};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

pub const PAYMENT_TYPES: &[&str] = &[
    "Tuition Fee",
    "Exam Fee",
    "Registration Fee",
    "Library Fee",
    "Other",
];
pub const PAYMENT_METHODS: &[&str] = &[
    "Cash",
    "Bank Transfer",
    "Mobile Money",
    "Cheque",
    "Online Payment",
];
const EXAM_FEE: &str = "Exam Fee";

#[derive(Debug, Clone)]
struct PaymentRow {
    id: String,
    student_id: String,
    semester: String,
    academic_year: String,
    payment_type: String,
    receipt_number: String,
    status: String,
    exam_pass_id: Option<String>,
}

fn load_payment(conn: &Connection, payment_id: &str) -> Result<PaymentRow, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, semester, academic_year, payment_type, receipt_number,
                status, exam_pass_id
         FROM payments WHERE id = ?",
        [payment_id],
        |r| {
            Ok(PaymentRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                semester: r.get(2)?,
                academic_year: r.get(3)?,
                payment_type: r.get(4)?,
                receipt_number: r.get(5)?,
                status: r.get(6)?,
                exam_pass_id: r.get(7)?,
            })
        },
    )
    .optional()
    .map_err(db_query_err)?
    .ok_or_else(|| HandlerErr::not_found("payment not found"))
}

fn payment_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "semester": r.get::<_, String>(2)?,
        "academicYear": r.get::<_, String>(3)?,
        "amount": r.get::<_, f64>(4)?,
        "paymentType": r.get::<_, String>(5)?,
        "paymentMethod": r.get::<_, String>(6)?,
        "transactionReference": r.get::<_, Option<String>>(7)?,
        "receiptNumber": r.get::<_, String>(8)?,
        "status": r.get::<_, String>(9)?,
        "confirmedAt": r.get::<_, Option<String>>(10)?,
        "rejectionReason": r.get::<_, Option<String>>(11)?,
        "description": r.get::<_, Option<String>>(12)?,
        "examPassId": r.get::<_, Option<String>>(13)?,
        "examPassGenerated": r.get::<_, Option<String>>(13)?.is_some(),
        "passNumber": r.get::<_, Option<String>>(14)?,
        "createdAt": r.get::<_, String>(15)?,
        "studentName": r.get::<_, Option<String>>(16)?,
        "registrationNo": r.get::<_, Option<String>>(17)?,
    }))
}

const PAYMENT_SELECT: &str = "SELECT p.id, p.student_id, p.semester, p.academic_year, p.amount,
        p.payment_type, p.payment_method, p.transaction_reference, p.receipt_number, p.status,
        p.confirmed_at, p.rejection_reason, p.description, p.exam_pass_id, e.pass_number,
        p.created_at, s.name, s.registration_no
 FROM payments p
 LEFT JOIN exam_passes e ON e.id = p.exam_pass_id
 LEFT JOIN students s ON s.id = p.student_id";

fn payment_by_id(conn: &Connection, payment_id: &str) -> Result<Value, HandlerErr> {
    let sql = format!("{} WHERE p.id = ?", PAYMENT_SELECT);
    conn.query_row(&sql, [payment_id], payment_json)
        .optional()
        .map_err(db_query_err)?
        .ok_or_else(|| HandlerErr::not_found("payment not found"))
}

fn payments_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let semester = get_required_str(params, "semester")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let Some(amount) = params.get("amount").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("amount must be a number"));
    };
    if !(amount.is_finite() && amount > 0.0) {
        return Err(HandlerErr::bad_params("amount must be greater than zero"));
    }
    let payment_type = get_enum_str(params, "paymentType", PAYMENT_TYPES, None)?;
    let payment_method = get_enum_str(params, "paymentMethod", PAYMENT_METHODS, None)?;
    let transaction_reference = get_optional_str(params, "transactionReference")?;
    let description = get_optional_str(params, "description")?;
    require_student(conn, &student_id)?;

    let payment_id = Uuid::new_v4().to_string();
    let pattern = ScopePattern::receipt(sequence::current_year());
    let (allocation, _) = sequence::allocate_and_persist(
        conn,
        IdentifierKind::Receipt,
        &pattern,
        state.config.max_allocation_attempts,
        |a| {
            let now = now_stamp();
            conn.execute(
                "INSERT INTO payments(
                   id, student_id, semester, academic_year, amount, payment_type, payment_method,
                   transaction_reference, receipt_number, status, description, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'Pending', ?, ?, ?)",
                rusqlite::params![
                    payment_id,
                    student_id,
                    semester,
                    academic_year,
                    amount,
                    payment_type,
                    payment_method,
                    transaction_reference,
                    a.identifier,
                    description,
                    now,
                    now,
                ],
            )
        },
    )?;
    tracing::info!(receipt_number = %allocation.identifier, "payment submitted");
    Ok(json!({
        "paymentId": payment_id,
        "receiptNumber": allocation.identifier,
        "message": "Payment submitted for approval",
    }))
}

fn payments_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let sql = format!(
        "{} WHERE (?1 IS NULL OR p.student_id = ?1) ORDER BY p.created_at DESC, p.rowid DESC",
        PAYMENT_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map([student_id.as_deref()], payment_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "payments": rows }))
}

/// Moves a payment out of `Pending`. The status guard in the `WHERE` clause makes
/// a second concurrent decision a no-op instead of a double transition.
fn decide(
    conn: &Connection,
    payment_id: &str,
    status: &str,
    rejection_reason: Option<&str>,
) -> Result<(), HandlerErr> {
    let now = now_stamp();
    let n = conn
        .execute(
            "UPDATE payments
             SET status = ?2, confirmed_at = ?3, rejection_reason = ?4, updated_at = ?3
             WHERE id = ?1 AND status = 'Pending'",
            (payment_id, status, &now, rejection_reason),
        )
        .map_err(db_update_err)?;
    if n == 0 {
        return Err(HandlerErr::new("conflict", "payment already processed"));
    }
    Ok(())
}

fn mint_pass(
    state: &AppState,
    payment: &PaymentRow,
    exam_type: &str,
    how: &str,
    confirm_pending: bool,
) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let source = PassSource {
        payment_id: &payment.id,
        student_id: &payment.student_id,
        semester: &payment.semester,
        academic_year: &payment.academic_year,
        receipt_number: &payment.receipt_number,
    };
    let notes = format!("{} from payment {}", how, payment.receipt_number);
    issue_exam_pass(conn, &state.config, &source, exam_type, &notes, confirm_pending)
}

fn payments_confirm(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let payment_id = get_required_str(params, "paymentId")?;
    let exam_type = get_enum_str(params, "examType", EXAM_TYPES, Some("End-Term"))?;
    let payment = load_payment(conn, &payment_id)?;
    if payment.status != "Pending" {
        return Err(HandlerErr::new("conflict", "payment already processed"));
    }

    // An exam fee is confirmed in the same transaction that issues its pass.
    let exam_pass = if payment.payment_type == EXAM_FEE && payment.exam_pass_id.is_none() {
        Some(mint_pass(state, &payment, exam_type, "Auto-generated", true)?)
    } else {
        decide(conn, &payment_id, "Confirmed", None)?;
        None
    };
    let message = if exam_pass.is_some() {
        "Payment confirmed and exam pass generated"
    } else {
        "Payment confirmed successfully"
    };
    Ok(json!({
        "payment": payment_by_id(conn, &payment_id)?,
        "examPass": exam_pass,
        "message": message,
    }))
}

fn payments_reject(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let payment_id = get_required_str(params, "paymentId")?;
    let reason = get_optional_str(params, "reason")?.unwrap_or_else(|| "No reason provided".to_string());
    load_payment(conn, &payment_id)?;
    decide(conn, &payment_id, "Rejected", Some(&reason))?;
    Ok(json!({
        "payment": payment_by_id(conn, &payment_id)?,
        "message": "Payment rejected",
    }))
}

fn payments_generate_exam_pass(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let payment_id = get_required_str(params, "paymentId")?;
    let exam_type = get_enum_str(params, "examType", EXAM_TYPES, Some("End-Term"))?;
    let payment = load_payment(conn, &payment_id)?;
    if payment.status != "Confirmed" {
        return Err(HandlerErr::bad_params("payment must be confirmed first"));
    }
    if payment.payment_type != EXAM_FEE {
        return Err(HandlerErr::bad_params("payment is not for exam fee"));
    }
    if payment.exam_pass_id.is_some() {
        return Err(HandlerErr::new(
            "conflict",
            "exam pass already generated for this payment",
        ));
    }
    let exam_pass = mint_pass(state, &payment, exam_type, "Manually generated", false)?;
    Ok(json!({
        "payment": payment_by_id(conn, &payment_id)?,
        "examPass": exam_pass,
        "message": "Exam pass generated successfully",
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "payments.create" => payments_create(state, &req.params),
        "payments.list" => require_db(state).and_then(|c| payments_list(c, &req.params)),
        "payments.confirm" => payments_confirm(state, &req.params),
        "payments.reject" => require_db(state).and_then(|c| payments_reject(c, &req.params)),
        "payments.generateExamPass" => payments_generate_exam_pass(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
