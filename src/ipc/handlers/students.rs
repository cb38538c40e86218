use crate::ipc::handlers::courses::course_code;
use crate::ipc::helpers::{
    db_insert_err, db_query_err, db_update_err, get_optional_i64, get_optional_str,
    get_required_obj, get_required_str, now_stamp, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sequence::{self, AllocError, IdentifierKind, ScopePattern};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StudentFields {
    name: String,
    age: Option<i64>,
    gender: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    address: Option<String>,
}

fn parse_course_ids(params: &Value) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(raw) = params.get("courseIds") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params("courseIds must be an array"));
    };
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for v in items {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params("courseIds must contain strings"));
        };
        let t = s.trim();
        if !t.is_empty() && !out.iter().any(|x| x == t) {
            out.push(t.to_string());
        }
    }
    Ok(Some(out))
}

/// Looks up every course and returns the primary course's code.
fn check_courses(conn: &Connection, course_ids: &[String]) -> Result<Option<String>, HandlerErr> {
    let mut primary = None;
    for (i, cid) in course_ids.iter().enumerate() {
        let Some(code) = course_code(conn, cid)? else {
            return Err(HandlerErr::not_found(format!("course not found: {}", cid)));
        };
        if i == 0 {
            primary = Some(code);
        }
    }
    Ok(primary)
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query_err)
}

pub(crate) fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if student_exists(conn, student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student not found"))
    }
}

fn insert_student(
    conn: &Connection,
    student_id: &str,
    fields: &StudentFields,
    registration_no: Option<&str>,
    student_number: Option<u64>,
    course_ids: &[String],
) -> rusqlite::Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Deferred)?;
    let now = now_stamp();
    tx.execute(
        "INSERT INTO students(
           id, name, registration_no, student_number, age, gender, phone, email, address,
           created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            student_id,
            fields.name,
            registration_no,
            student_number.map(|n| n as i64),
            fields.age,
            fields.gender,
            fields.phone,
            fields.email,
            fields.address,
            now,
            now,
        ],
    )?;
    for (i, cid) in course_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO student_courses(student_id, course_id, sort_order) VALUES(?, ?, ?)",
            (student_id, cid, i as i64),
        )?;
    }
    tx.commit()
}

fn parse_age(params: &Value) -> Result<Option<i64>, HandlerErr> {
    let age = get_optional_i64(params, "age")?;
    if let Some(a) = age {
        if !(0..=150).contains(&a) {
            return Err(HandlerErr::bad_params("age must be between 0 and 150"));
        }
    }
    Ok(age)
}

/// Uppercases a hand-entered registration number and reads the sequence number
/// from its tail, if numeric.
fn normalize_registration_no(raw: &str) -> Result<(String, Option<u64>), HandlerErr> {
    let reg = raw.trim().to_uppercase();
    let value = sequence::trailing_value(&reg, "/").map_err(|_| {
        HandlerErr::bad_params(format!("registration number is out of range: {}", reg))
    })?;
    Ok((reg, value))
}

fn registration_in_use(reg: &str) -> HandlerErr {
    HandlerErr::new(
        "conflict",
        format!("registration number already in use: {}", reg),
    )
}

fn parse_fields(params: &Value) -> Result<StudentFields, HandlerErr> {
    let age = parse_age(params)?;
    Ok(StudentFields {
        name: get_required_str(params, "name")?,
        age,
        gender: get_optional_str(params, "gender")?,
        phone: get_optional_str(params, "phone")?,
        email: get_optional_str(params, "email")?,
        address: get_optional_str(params, "address")?,
    })
}

fn students_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let fields = parse_fields(params)?;
    let course_ids = parse_course_ids(params)?.unwrap_or_default();
    let primary_code = check_courses(conn, &course_ids)?;
    let student_id = Uuid::new_v4().to_string();

    if let Some(raw) = get_optional_str(params, "registrationNo")? {
        let (reg, number) = normalize_registration_no(&raw)?;
        return match insert_student(conn, &student_id, &fields, Some(reg.as_str()), number, &course_ids) {
            Ok(()) => Ok(json!({
                "studentId": student_id,
                "registrationNo": reg,
                "studentNumber": number,
            })),
            Err(e) if crate::db::is_unique_violation(&e) => Err(registration_in_use(&reg)),
            Err(e) => Err(db_insert_err("students", e)),
        };
    }

    let pattern = ScopePattern::registration(
        sequence::current_year(),
        primary_code.as_deref(),
        state.config.registration_width,
    );
    let (allocation, ()) = sequence::allocate_and_persist(
        conn,
        IdentifierKind::Registration,
        &pattern,
        state.config.max_allocation_attempts,
        |a| {
            insert_student(
                conn,
                &student_id,
                &fields,
                Some(a.identifier.as_str()),
                Some(a.value),
                &course_ids,
            )
        },
    )?;
    tracing::info!(
        student_id = %student_id,
        registration_no = %allocation.identifier,
        "student created"
    );
    Ok(json!({
        "studentId": student_id,
        "registrationNo": allocation.identifier,
        "studentNumber": allocation.value,
    }))
}

fn student_json(conn: &Connection, r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let id: String = r.get(0)?;
    let mut stmt = conn.prepare_cached(
        "SELECT c.id, c.code FROM student_courses sc
         JOIN courses c ON c.id = sc.course_id
         WHERE sc.student_id = ?
         ORDER BY sc.sort_order",
    )?;
    let courses = stmt
        .query_map([&id], |cr| {
            Ok(json!({ "id": cr.get::<_, String>(0)?, "code": cr.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "id": id,
        "name": r.get::<_, String>(1)?,
        "registrationNo": r.get::<_, Option<String>>(2)?,
        "studentNumber": r.get::<_, Option<i64>>(3)?,
        "age": r.get::<_, Option<i64>>(4)?,
        "gender": r.get::<_, Option<String>>(5)?,
        "phone": r.get::<_, Option<String>>(6)?,
        "email": r.get::<_, Option<String>>(7)?,
        "address": r.get::<_, Option<String>>(8)?,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, Option<String>>(10)?,
        "courses": courses,
    }))
}

const STUDENT_COLUMNS: &str = "id, name, registration_no, student_number, age, gender, phone, email, address, created_at, updated_at";

fn students_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM students ORDER BY created_at, rowid",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map([], |r| student_json(conn, r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "students": rows }))
}

fn students_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    let student = conn
        .query_row(&sql, [&student_id], |r| student_json(conn, r))
        .optional()
        .map_err(db_query_err)?;
    match student {
        Some(s) => Ok(json!({ "student": s })),
        None => Err(HandlerErr::not_found("student not found")),
    }
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let patch = get_required_obj(params, "patch")?;
    let patch_value = Value::Object(patch.clone());
    let current_reg: Option<Option<String>> = conn
        .query_row(
            "SELECT registration_no FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some(current_reg) = current_reg else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate).map_err(db_update_err)?;
    for (k, _) in patch {
        match k.as_str() {
            "name" => {
                let v = get_required_str(&patch_value, "name")?;
                tx.execute("UPDATE students SET name = ? WHERE id = ?", (&v, &student_id))
                    .map_err(db_update_err)?;
            }
            "age" => {
                let v = parse_age(&patch_value)?;
                tx.execute("UPDATE students SET age = ? WHERE id = ?", (v, &student_id))
                    .map_err(db_update_err)?;
            }
            "gender" | "phone" | "email" | "address" => {
                let v = get_optional_str(&patch_value, k)?;
                let sql = format!("UPDATE students SET {} = ? WHERE id = ?", k);
                tx.execute(&sql, (v.as_deref(), &student_id))
                    .map_err(db_update_err)?;
            }
            "registrationNo" => {
                if current_reg.is_some() {
                    return Err(HandlerErr::bad_params(
                        "registrationNo cannot be changed once assigned",
                    ));
                }
                let raw = get_required_str(&patch_value, "registrationNo")?;
                let (reg, number) = normalize_registration_no(&raw)?;
                tx.execute(
                    "UPDATE students SET registration_no = ?, student_number = ? WHERE id = ?",
                    (&reg, number.map(|n| n as i64), &student_id),
                )
                .map_err(|e| {
                    if crate::db::is_unique_violation(&e) {
                        registration_in_use(&reg)
                    } else {
                        db_update_err(e)
                    }
                })?;
            }
            "courseIds" => {
                let ids = parse_course_ids(&patch_value)?.unwrap_or_default();
                check_courses(&tx, &ids)?;
                tx.execute("DELETE FROM student_courses WHERE student_id = ?", [&student_id])
                    .map_err(db_update_err)?;
                for (i, cid) in ids.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO student_courses(student_id, course_id, sort_order) VALUES(?, ?, ?)",
                        (&student_id, cid, i as i64),
                    )
                    .map_err(db_update_err)?;
                }
            }
            other => return Err(HandlerErr::bad_params(format!("unknown student field: {}", other))),
        }
    }
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (now_stamp(), &student_id),
    )
    .map_err(db_update_err)?;
    tx.commit().map_err(db_update_err)?;
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let n = conn
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(db_update_err)?;
    if n == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Assigns registration numbers to students created before numbering existed,
/// oldest first. The counter for each scope bootstraps from whatever numbers
/// are already present.
fn students_backfill_registration(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id,
                    (SELECT c.code FROM student_courses sc
                     JOIN courses c ON c.id = sc.course_id
                     WHERE sc.student_id = s.id
                     ORDER BY sc.sort_order LIMIT 1)
             FROM students s
             WHERE s.registration_no IS NULL
             ORDER BY s.created_at, s.rowid",
        )
        .map_err(db_query_err)?;
    let pending = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    drop(stmt);

    let year = sequence::current_year();
    let mut assigned = Vec::with_capacity(pending.len());
    for (student_id, code) in pending {
        let pattern =
            ScopePattern::registration(year, code.as_deref(), state.config.registration_width);
        let (allocation, updated) = sequence::allocate_and_persist(
            conn,
            IdentifierKind::Registration,
            &pattern,
            state.config.max_allocation_attempts,
            |a| {
                conn.execute(
                    "UPDATE students SET registration_no = ?, student_number = ?, updated_at = ?
                     WHERE id = ? AND registration_no IS NULL",
                    (&a.identifier, a.value as i64, now_stamp(), &student_id),
                )
            },
        )
        .map_err(|e| match e {
            AllocError::Persist(e) => db_update_err(e),
            other => other.into(),
        })?;
        if updated == 0 {
            // Someone else numbered this student in the meantime; the value is burned.
            tracing::warn!(student_id = %student_id, "student already numbered, skipping");
            continue;
        }
        assigned.push(json!({
            "studentId": student_id,
            "registrationNo": allocation.identifier,
        }));
    }
    tracing::info!(count = assigned.len(), "registration backfill complete");
    Ok(json!({ "assigned": assigned }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "students.list" => require_db(state).and_then(students_list),
        "students.get" => require_db(state).and_then(|c| students_get(c, &req.params)),
        "students.create" => students_create(state, &req.params),
        "students.update" => require_db(state).and_then(|c| students_update(c, &req.params)),
        "students.delete" => require_db(state).and_then(|c| students_delete(c, &req.params)),
        "students.backfillRegistration" => students_backfill_registration(state),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
