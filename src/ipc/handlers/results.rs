use crate::grading::{
    self, parse_subject_items, DeriveError, DerivedResult, SubjectInput, SubjectParseError,
    SUBJECT_COUNT,
};
use crate::ipc::handlers::students::require_student;
use crate::ipc::helpers::{
    db_insert_err, db_query_err, db_update_err, get_optional_str, get_required_obj,
    get_required_str, now_stamp, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_subjects(raw: Option<&Value>) -> Result<Vec<SubjectInput>, HandlerErr> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };
    if items.len() != SUBJECT_COUNT {
        return Err(DeriveError::InvalidSubjectCount { found: items.len() }.into());
    }
    parse_subject_items(items).map_err(|e| match e {
        SubjectParseError::Shape(msg) => HandlerErr::bad_params(msg),
        SubjectParseError::Derive(d) => d.into(),
    })
}

fn derive(raw: Option<&Value>) -> Result<DerivedResult, HandlerErr> {
    let subjects = parse_subjects(raw)?;
    Ok(grading::derive_result(&subjects)?)
}

fn subjects_json(derived: &DerivedResult) -> Result<String, HandlerErr> {
    serde_json::to_string(&derived.subjects).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

const RESULT_COLUMNS: &str = "id, student_id, semester, academic_year, subjects_json, total_marks, average_marks, overall_grade, gpa, status, remarks, created_at, updated_at";

fn result_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let subjects_raw: String = r.get(4)?;
    let subjects: Value = serde_json::from_str(&subjects_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "semester": r.get::<_, String>(2)?,
        "academicYear": r.get::<_, String>(3)?,
        "subjects": subjects,
        "totalMarks": r.get::<_, i64>(5)?,
        "averageMarks": r.get::<_, f64>(6)?,
        "overallGrade": r.get::<_, String>(7)?,
        "gpa": r.get::<_, f64>(8)?,
        "status": r.get::<_, String>(9)?,
        "remarks": r.get::<_, Option<String>>(10)?,
        "createdAt": r.get::<_, String>(11)?,
        "updatedAt": r.get::<_, Option<String>>(12)?,
    }))
}

fn results_derive(params: &Value) -> Result<Value, HandlerErr> {
    let derived = derive(params.get("subjects"))?;
    Ok(json!({ "derived": derived }))
}

fn results_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let semester = get_required_str(params, "semester")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let remarks = get_optional_str(params, "remarks")?;
    // Derive before touching the database: a failed derivation writes nothing.
    let derived = derive(params.get("subjects"))?;
    require_student(conn, &student_id)?;

    let result_id = Uuid::new_v4().to_string();
    let now = now_stamp();
    conn.execute(
        "INSERT INTO results(
           id, student_id, semester, academic_year, subjects_json, total_marks,
           average_marks, overall_grade, gpa, status, remarks, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            result_id,
            student_id,
            semester,
            academic_year,
            subjects_json(&derived)?,
            derived.total_marks,
            derived.average_marks,
            derived.overall_grade.as_str(),
            derived.gpa,
            derived.status.as_str(),
            remarks,
            now,
            now,
        ],
    )
    .map_err(|e| db_insert_err("results", e))?;
    tracing::debug!(result_id = %result_id, status = derived.status.as_str(), "result created");
    Ok(json!({ "resultId": result_id, "derived": derived }))
}

fn results_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let patch = get_required_obj(params, "patch")?;
    let patch_value = Value::Object(patch.clone());

    let mut semester = None;
    let mut academic_year = None;
    let mut remarks = None;
    let mut derived = None;
    for k in patch.keys() {
        match k.as_str() {
            "semester" => semester = Some(get_required_str(&patch_value, "semester")?),
            "academicYear" => academic_year = Some(get_required_str(&patch_value, "academicYear")?),
            "remarks" => remarks = Some(get_optional_str(&patch_value, "remarks")?),
            "subjects" => derived = Some(derive(patch.get("subjects"))?),
            other => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown result field: {}",
                    other
                )))
            }
        }
    }

    let exists = conn
        .query_row("SELECT 1 FROM results WHERE id = ?", [&result_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("result not found"));
    }

    let subjects_raw = match &derived {
        Some(d) => Some(subjects_json(d)?),
        None => None,
    };
    // One statement so raw subjects and every derived column change together.
    conn.execute(
        "UPDATE results SET
           semester = COALESCE(?2, semester),
           academic_year = COALESCE(?3, academic_year),
           remarks = CASE WHEN ?4 THEN ?5 ELSE remarks END,
           subjects_json = COALESCE(?6, subjects_json),
           total_marks = COALESCE(?7, total_marks),
           average_marks = COALESCE(?8, average_marks),
           overall_grade = COALESCE(?9, overall_grade),
           gpa = COALESCE(?10, gpa),
           status = COALESCE(?11, status),
           updated_at = ?12
         WHERE id = ?1",
        rusqlite::params![
            result_id,
            semester,
            academic_year,
            remarks.is_some(),
            remarks.flatten(),
            subjects_raw,
            derived.as_ref().map(|d| d.total_marks),
            derived.as_ref().map(|d| d.average_marks),
            derived.as_ref().map(|d| d.overall_grade.as_str()),
            derived.as_ref().map(|d| d.gpa),
            derived.as_ref().map(|d| d.status.as_str()),
            now_stamp(),
        ],
    )
    .map_err(db_update_err)?;

    results_get_by_id(conn, &result_id)
}

fn results_get_by_id(conn: &Connection, result_id: &str) -> Result<Value, HandlerErr> {
    let sql = format!("SELECT {} FROM results WHERE id = ?", RESULT_COLUMNS);
    let row = conn
        .query_row(&sql, [result_id], result_json)
        .optional()
        .map_err(db_query_err)?;
    match row {
        Some(r) => Ok(json!({ "result": r })),
        None => Err(HandlerErr::not_found("result not found")),
    }
}

fn results_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    results_get_by_id(conn, &result_id)
}

fn results_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let sql = format!(
        "SELECT {} FROM results WHERE (?1 IS NULL OR student_id = ?1)
         ORDER BY created_at DESC, rowid DESC",
        RESULT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map([student_id.as_deref()], result_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "results": rows }))
}

fn results_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let n = conn
        .execute("DELETE FROM results WHERE id = ?", [&result_id])
        .map_err(db_update_err)?;
    if n == 0 {
        return Err(HandlerErr::not_found("result not found"));
    }
    Ok(json!({ "ok": true }))
}

fn results_student_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let listed = results_list(conn, &json!({ "studentId": student_id }))?;
    let rows = listed
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let overall_gpa = grading::summarize_gpa(rows.iter().filter_map(|r| r.get("gpa")?.as_f64()));
    Ok(json!({
        "studentId": student_id,
        "overallGpa": overall_gpa,
        "totalResults": rows.len(),
        "passed": rows.iter().filter(|r| r.get("status").and_then(|s| s.as_str()) == Some("Pass")).count(),
        "results": rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "results.derive" => results_derive(&req.params),
        "results.create" => require_db(state).and_then(|c| results_create(c, &req.params)),
        "results.update" => require_db(state).and_then(|c| results_update(c, &req.params)),
        "results.get" => require_db(state).and_then(|c| results_get(c, &req.params)),
        "results.list" => require_db(state).and_then(|c| results_list(c, &req.params)),
        "results.delete" => require_db(state).and_then(|c| results_delete(c, &req.params)),
        "results.studentSummary" => {
            require_db(state).and_then(|c| results_student_summary(c, &req.params))
        }
        _ => return None,
    };
    Some(respond(&req.id, res))
}
