use crate::calc::MAX_CREDIT_UNITS;
use crate::db;
use crate::ipc::helpers::{db_err, get_required_str, with_db, HandlerErr, Invalidation};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn items<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a Vec<serde_json::Value>, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))
}

fn item_str(item: &serde_json::Value, index: usize, key: &str) -> Result<String, HandlerErr> {
    get_required_str(item, key).map_err(|e| e.with_details(json!({ "index": index })))
}

fn students_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let list = items(params, "students")?;
    let mut rows = Vec::with_capacity(list.len());
    for (i, item) in list.iter().enumerate() {
        rows.push((
            item_str(item, i, "matricNo")?,
            item_str(item, i, "fullName")?,
            item_str(item, i, "departmentId")?,
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let mut out = Vec::with_capacity(rows.len());
    let mut inv = Invalidation::default();
    for (matric_no, full_name, department_id) in &rows {
        let now = db::now_timestamp();
        tx.execute(
            "INSERT INTO students(id, matric_no, full_name, department_id, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(matric_no) DO UPDATE SET
               full_name = excluded.full_name,
               department_id = excluded.department_id,
               updated_at = excluded.updated_at",
            (Uuid::new_v4().to_string(), matric_no, full_name, department_id, now),
        )
        .map_err(db_err("db_insert_failed"))?;
        let student_id: String = tx
            .query_row(
                "SELECT id FROM students WHERE matric_no = ?",
                [matric_no],
                |r| r.get(0),
            )
            .map_err(db_err("db_query_failed"))?;
        inv.student(&student_id);
        out.push(json!({ "matricNo": matric_no, "studentId": student_id }));
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    Ok(json!({
        "upserted": out.len(),
        "students": out,
        "invalidates": inv.to_json(),
    }))
}

fn students_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let students = db::list_students(conn).map_err(db_err("db_query_failed"))?;
    let items: Vec<serde_json::Value> = students
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "matricNo": s.matric_no,
                "fullName": s.full_name,
                "departmentId": s.department_id,
            })
        })
        .collect();
    Ok(json!({ "students": items }))
}

fn courses_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let list = items(params, "courses")?;
    let mut rows = Vec::with_capacity(list.len());
    for (i, item) in list.iter().enumerate() {
        let credit_units = item
            .get("creditUnits")
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n <= MAX_CREDIT_UNITS)
            .ok_or_else(|| {
                HandlerErr::bad_params(format!(
                    "creditUnits must be an integer in 0..={}",
                    MAX_CREDIT_UNITS
                ))
                .with_details(json!({ "index": i }))
            })?;
        rows.push((
            item_str(item, i, "code")?,
            item_str(item, i, "title")?,
            credit_units,
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let mut out = Vec::with_capacity(rows.len());
    for (code, title, credit_units) in &rows {
        tx.execute(
            "INSERT INTO courses(id, code, title, credit_units, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET
               title = excluded.title,
               credit_units = excluded.credit_units,
               updated_at = excluded.updated_at",
            (Uuid::new_v4().to_string(), code, title, credit_units, db::now_timestamp()),
        )
        .map_err(db_err("db_insert_failed"))?;
        let course_id: String = tx
            .query_row("SELECT id FROM courses WHERE code = ?", [code], |r| r.get(0))
            .map_err(db_err("db_query_failed"))?;
        out.push(json!({ "code": code, "courseId": course_id }));
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    // Credit units feed every transcript that lists the course.
    Ok(json!({
        "upserted": out.len(),
        "courses": out,
        "invalidates": ["transcript:*"],
    }))
}

fn courses_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code, title, credit_units FROM courses ORDER BY code")
        .map_err(db_err("db_query_failed"))?;
    let courses = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "creditUnits": r.get::<_, u32>(3)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "courses": courses }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.upsert" => Some(with_db(state, req, students_upsert)),
        "students.list" => Some(with_db(state, req, students_list)),
        "courses.upsert" => Some(with_db(state, req, courses_upsert)),
        "courses.list" => Some(with_db(state, req, courses_list)),
        _ => None,
    }
}
