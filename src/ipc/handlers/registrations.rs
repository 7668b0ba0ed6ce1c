use crate::db::{self, RegistrationFilter};
use crate::ipc::handlers::setup::load_upload_defaults;
use crate::ipc::helpers::{
    db_err, get_optional_bool, get_optional_semester, get_optional_str, get_required_str, with_db,
    HandlerErr, Invalidation,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{reconcile, reconcile_registration_lines, ReconcileContext};
use crate::upload::{parse_upload, UploadKind};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn registrations_bulk_upload(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let text = params
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing text"))?;
    let defaults = load_upload_defaults(conn).map_err(db_err("db_query_failed"))?;
    let semester = get_optional_semester(params, "semester")?.or(defaults.semester);
    let session = get_optional_str(params, "session").or(defaults.session);
    let has_header = get_optional_bool(params, "hasHeader")?.unwrap_or(true);

    let students = db::student_index(conn).map_err(db_err("db_query_failed"))?;
    let courses = db::course_index(conn).map_err(db_err("db_query_failed"))?;
    let existing = match (semester, session.as_deref()) {
        (Some(sem), Some(sess)) => {
            Some(db::registration_keys(conn, sem, sess).map_err(db_err("db_query_failed"))?)
        }
        _ => None,
    };

    let ctx = ReconcileContext {
        semester,
        session: session.as_deref(),
        existing: existing.as_ref(),
        ..ReconcileContext::new(&students, &courses)
    };
    let outcome = if has_header {
        let parsed = parse_upload(UploadKind::Registration, text)
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        reconcile(parsed, &ctx)
    } else {
        let lines: Vec<&str> = text.lines().collect();
        reconcile_registration_lines(&lines, &ctx)
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let mut created = 0usize;
    let mut raced = 0usize;
    let mut inv = Invalidation::default();
    for reg in &outcome.accepted {
        if db::insert_registration(&tx, reg).map_err(db_err("db_insert_failed"))? {
            created += 1;
            inv.student(&reg.student_id);
        } else {
            // Another writer stored the same key since the snapshot was read.
            raced += 1;
        }
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    Ok(json!({
        "accepted": outcome.accepted_rows,
        "rejected": outcome.rejected.len(),
        "duplicates": outcome.duplicates + raced,
        "rowsTotal": outcome.rows_total,
        "registrationsCreated": created,
        "rejections": outcome.rejected,
        "invalidates": inv.to_json(),
    }))
}

fn registrations_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let filter = RegistrationFilter {
        student_id: get_optional_str(params, "studentId"),
        semester: get_optional_semester(params, "semester")?,
        session: get_optional_str(params, "session"),
    };
    let registrations = db::list_registrations(conn, &filter).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "registrations": registrations }))
}

fn registrations_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let registration_id = get_required_str(params, "registrationId")?;
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT student_id, status FROM course_registrations WHERE id = ?",
            [&registration_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((student_id, status)) = row else {
        return Err(HandlerErr::new("not_found", "registration not found"));
    };
    if status == "finalized" {
        return Err(HandlerErr::new(
            "registration_finalized",
            "finalized registrations cannot be removed",
        )
        .with_details(json!({ "registrationId": registration_id })));
    }
    conn.execute(
        "DELETE FROM course_registrations WHERE id = ?",
        [&registration_id],
    )
    .map_err(db_err("db_delete_failed"))?;

    let mut inv = Invalidation::default();
    inv.student(&student_id);
    Ok(json!({ "ok": true, "invalidates": inv.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "registrations.bulkUpload" => Some(with_db(state, req, registrations_bulk_upload)),
        "registrations.list" => Some(with_db(state, req, registrations_list)),
        "registrations.delete" => Some(with_db(state, req, registrations_delete)),
        _ => None,
    }
}
