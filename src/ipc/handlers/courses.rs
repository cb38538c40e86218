use crate::ipc::helpers::{
    db_insert_err, db_query_err, db_update_err, get_optional_str, get_required_str, now_stamp,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(crate) fn course_code(conn: &Connection, course_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT code FROM courses WHERE id = ?",
        [course_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(db_query_err)
}

fn courses_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.code, c.teacher_name,
                    (SELECT COUNT(*) FROM student_courses sc WHERE sc.course_id = c.id)
             FROM courses c
             ORDER BY c.code, c.name",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "teacherName": r.get::<_, Option<String>>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "courses": rows }))
}

fn courses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?;
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(HandlerErr::bad_params("code must be letters and digits only"));
    }
    let teacher_name = get_optional_str(params, "teacherName")?;
    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, code, teacher_name, created_at) VALUES(?, ?, ?, ?, ?)",
        (&course_id, &name, &code, teacher_name.as_deref(), now_stamp()),
    )
    .map_err(|e| db_insert_err("courses", e))?;
    Ok(json!({ "courseId": course_id }))
}

fn courses_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let enrolled: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM student_courses WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .map_err(db_query_err)?;
    if enrolled > 0 {
        return Err(HandlerErr::new("conflict", "course still has enrolled students")
            .with_details(json!({ "studentCount": enrolled })));
    }
    let n = conn
        .execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(db_update_err)?;
    if n == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "courses.list" => require_db(state).and_then(courses_list),
        "courses.create" => require_db(state).and_then(|c| courses_create(c, &req.params)),
        "courses.delete" => require_db(state).and_then(|c| courses_delete(c, &req.params)),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
