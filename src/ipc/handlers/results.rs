use crate::calc::{
    aggregate, GradingContext, RegistrationKey, RegistrationStatus, SemesterKey, SemesterSummary,
};
use crate::db::{self, RegistrationFilter, ScoreWrite, StudentRecord};
use crate::grading::{evaluate, GradingTemplate};
use crate::ipc::handlers::setup::{load_grading_config, load_upload_defaults, GradingConfig};
use crate::ipc::helpers::{
    db_err, get_optional_bool, get_optional_semester, get_optional_str, get_required_semester,
    get_required_str, with_db, HandlerErr, Invalidation,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{reconcile, reconcile_result_lines, ReconcileContext};
use crate::transcript::{build_transcript, build_transcripts, CumulativeTotals, StudentSlice};
use crate::upload::{parse_upload, UploadKind};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

fn require_student(conn: &Connection, student_id: &str) -> Result<StudentRecord, HandlerErr> {
    db::student_by_id(conn, student_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id }))
        })
}

fn grading_config(conn: &Connection) -> Result<GradingConfig, HandlerErr> {
    load_grading_config(conn).map_err(db_err("db_query_failed"))
}

fn semester_key(params: &serde_json::Value) -> Result<SemesterKey, HandlerErr> {
    Ok(SemesterKey {
        student_id: get_required_str(params, "studentId")?,
        semester: get_required_semester(params, "semester")?,
        session: get_required_str(params, "session")?,
    })
}

fn student_slice(conn: &Connection, student: &StudentRecord) -> Result<StudentSlice, HandlerErr> {
    let registrations = db::list_registrations(
        conn,
        &RegistrationFilter {
            student_id: Some(student.id.clone()),
            ..RegistrationFilter::default()
        },
    )
    .map_err(db_err("db_query_failed"))?;
    Ok(StudentSlice {
        student_id: student.id.clone(),
        department_id: student.department_id.clone(),
        registrations,
    })
}

/// Grade stored alongside a score; `None` when no template applies or the
/// score matches no band.
fn derived_grade(template: Option<&GradingTemplate>, score: f64) -> Option<String> {
    template
        .map(|t| evaluate(score, t))
        .and_then(|o| o.grade().map(str::to_string))
}

fn compute_semester(
    conn: &Connection,
    key: &SemesterKey,
    config: &GradingConfig,
) -> Result<(StudentRecord, SemesterSummary), HandlerErr> {
    let student = require_student(conn, &key.student_id)?;
    let registrations = db::list_registrations(
        conn,
        &RegistrationFilter {
            student_id: Some(key.student_id.clone()),
            semester: Some(key.semester),
            session: Some(key.session.clone()),
        },
    )
    .map_err(db_err("db_query_failed"))?;
    let template =
        db::template_for_department(conn, &student.department_id).map_err(db_err("db_query_failed"))?;
    let ctx = GradingContext {
        department_id: &student.department_id,
        template: template.as_ref(),
        classification: &config.classification,
        policy: &config.policy,
    };
    let summary = aggregate(key, &registrations, &ctx)?;
    Ok((student, summary))
}

fn results_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student = require_student(conn, &get_required_str(params, "studentId")?)?;
    let course_id = get_required_str(params, "courseId")?;
    let semester = get_required_semester(params, "semester")?;
    let session = get_required_str(params, "session")?;
    let score = params
        .get("score")
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| HandlerErr::new("invalid_score", "score must be a number"))?;
    let regrade = get_optional_bool(params, "regrade")?.unwrap_or(false);

    let course_exists = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if !course_exists {
        return Err(HandlerErr::new("not_found", "course not found")
            .with_details(json!({ "courseId": course_id })));
    }

    let key = RegistrationKey {
        student_id: student.id.clone(),
        course_id,
        semester,
        session,
    };
    let template =
        db::template_for_department(conn, &student.department_id).map_err(db_err("db_query_failed"))?;
    let grade = derived_grade(template.as_ref(), score);
    let write = db::upsert_score(conn, &key, score, grade.as_deref(), regrade)
        .map_err(db_err("db_update_failed"))?;
    if write == ScoreWrite::Finalized {
        return Err(HandlerErr::new(
            "registration_finalized",
            "result is finalized; pass regrade to change it",
        )
        .with_details(json!(key)));
    }

    let mut inv = Invalidation::default();
    inv.student(&student.id);
    Ok(json!({
        "score": score,
        "grade": grade,
        "status": RegistrationStatus::Scored,
        "registrationCreated": write == ScoreWrite::Created,
        "invalidates": inv.to_json(),
    }))
}

fn results_bulk_upload(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let text = params
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing text"))?;
    let defaults = load_upload_defaults(conn).map_err(db_err("db_query_failed"))?;
    let semester = get_optional_semester(params, "semester")?.or(defaults.semester);
    let session = get_optional_str(params, "session").or(defaults.session);
    let course_code = get_optional_str(params, "courseCode");
    let regrade = get_optional_bool(params, "regrade")?.unwrap_or(false);
    let has_header = get_optional_bool(params, "hasHeader")?.unwrap_or(true);

    let students = db::student_index(conn).map_err(db_err("db_query_failed"))?;
    let courses = db::course_index(conn).map_err(db_err("db_query_failed"))?;
    let ctx = ReconcileContext {
        semester,
        session: session.as_deref(),
        course_code: course_code.as_deref(),
        ..ReconcileContext::new(&students, &courses)
    };
    let outcome = if has_header {
        let parsed = parse_upload(UploadKind::Result, text)
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        reconcile(parsed, &ctx)
    } else {
        let lines: Vec<&str> = text.lines().collect();
        reconcile_result_lines(&lines, &ctx)
    };

    let departments: HashMap<String, String> = db::list_students(conn)
        .map_err(db_err("db_query_failed"))?
        .into_iter()
        .map(|s| (s.id, s.department_id))
        .collect();
    let templates = db::load_template_store(conn).map_err(db_err("db_query_failed"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let mut recorded = 0usize;
    let mut created = 0usize;
    let mut skipped = Vec::new();
    let mut inv = Invalidation::default();
    for reg in &outcome.accepted {
        let Some(score) = reg.score else {
            continue;
        };
        let template = departments
            .get(&reg.student_id)
            .and_then(|dept| templates.get(dept));
        let grade = derived_grade(template, score);
        let write = db::upsert_score(&tx, &reg.key(), score, grade.as_deref(), regrade)
            .map_err(db_err("db_update_failed"))?;
        match write {
            ScoreWrite::Finalized => {
                skipped.push(json!({
                    "studentId": reg.student_id,
                    "courseCode": reg.course_code,
                    "semester": reg.semester,
                    "session": reg.session,
                }));
                continue;
            }
            ScoreWrite::Created => created += 1,
            ScoreWrite::Updated => {}
        }
        recorded += 1;
        inv.student(&reg.student_id);
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    Ok(json!({
        "accepted": outcome.accepted_rows,
        "rejected": outcome.rejected.len(),
        "duplicates": outcome.duplicates,
        "rowsTotal": outcome.rows_total,
        "scoresRecorded": recorded,
        "registrationsCreated": created,
        "skippedFinalized": skipped,
        "rejections": outcome.rejected,
        "invalidates": inv.to_json(),
    }))
}

fn results_semester(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = semester_key(params)?;
    let config = grading_config(conn)?;
    let (_, summary) = compute_semester(conn, &key, &config)?;
    Ok(json!({ "summary": summary }))
}

fn results_finalize(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = semester_key(params)?;
    let config = grading_config(conn)?;
    // Computing first means a blocked template refuses finalization.
    let (_, summary) = compute_semester(conn, &key, &config)?;
    let finalized = db::finalize_group(conn, &key.student_id, key.semester, &key.session)
        .map_err(db_err("db_update_failed"))?;

    let mut inv = Invalidation::default();
    inv.student(&key.student_id);
    Ok(json!({
        "finalized": finalized,
        "summary": summary,
        "invalidates": inv.to_json(),
    }))
}

fn results_transcript(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student = require_student(conn, &get_required_str(params, "studentId")?)?;
    let config = grading_config(conn)?;
    let templates = db::load_template_store(conn).map_err(db_err("db_query_failed"))?;
    let slice = student_slice(conn, &student)?;
    let transcript = build_transcript(&slice, &templates, &config.classification, &config.policy)?;
    Ok(json!(transcript))
}

/// One course line of a printed result slip.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseDisplay {
    code: String,
    title: String,
    credit_units: u32,
    score: Option<f64>,
    grade: Option<String>,
    point: f64,
    grade_points: f64,
    remark: String,
}

fn results_report(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = semester_key(params)?;
    let student = require_student(conn, &key.student_id)?;
    let config = grading_config(conn)?;
    let templates = db::load_template_store(conn).map_err(db_err("db_query_failed"))?;
    let slice = student_slice(conn, &student)?;
    let transcript = build_transcript(&slice, &templates, &config.classification, &config.policy)?;
    let Some(entry) = transcript
        .entries
        .iter()
        .find(|e| e.summary.semester == key.semester && e.summary.session == key.session)
    else {
        return Err(HandlerErr::new("not_found", "no registrations for that semester")
            .with_details(json!(key)));
    };

    let titles: HashMap<String, String> = {
        let mut stmt = conn
            .prepare("SELECT id, title FROM courses")
            .map_err(db_err("db_query_failed"))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(db_err("db_query_failed"))?;
        rows.into_iter().collect()
    };
    let courses: Vec<CourseDisplay> = entry
        .summary
        .courses
        .iter()
        .map(|c| CourseDisplay {
            code: c.course_code.clone(),
            title: titles.get(&c.course_id).cloned().unwrap_or_default(),
            credit_units: c.credit_units,
            score: c.score,
            grade: c.grade.clone(),
            point: c.point,
            grade_points: c.grade_points,
            remark: c.remark.clone(),
        })
        .collect();

    let totals = |t: &CumulativeTotals| {
        json!({
            "tcu": t.tcu,
            "tgp": t.tgp,
            "cgpa": t.cgpa,
            "remark": config.classification.classify(t.cgpa),
        })
    };
    Ok(json!({
        "studentData": {
            "id": student.id,
            "matricNo": student.matric_no,
            "fullName": student.full_name,
            "departmentId": student.department_id,
        },
        "semester": key.semester,
        "session": key.session,
        "courses": courses,
        "summary": {
            "current": {
                "tcu": entry.summary.tcu,
                "tgp": entry.summary.tgp,
                "gpa": entry.summary.gpa,
                "remark": entry.summary.remark,
            },
            "previous": entry.previous.as_ref().map(totals),
            "cumulative": totals(&entry.cumulative),
        },
    }))
}

fn results_transcripts_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let students: Vec<StudentRecord> = match params.get("studentIds") {
        None | Some(serde_json::Value::Null) => {
            db::list_students(conn).map_err(db_err("db_query_failed"))?
        }
        Some(v) => {
            let ids = v
                .as_array()
                .ok_or_else(|| HandlerErr::bad_params("studentIds must be an array"))?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let id = id
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("studentIds must contain strings"))?;
                out.push(require_student(conn, id)?);
            }
            out
        }
    };
    let config = grading_config(conn)?;
    let templates = db::load_template_store(conn).map_err(db_err("db_query_failed"))?;

    // Each student's registrations are read separately; the computation below
    // then runs without touching the connection.
    let mut slices = Vec::with_capacity(students.len());
    for student in &students {
        slices.push(student_slice(conn, student)?);
    }
    let results = build_transcripts(
        &slices,
        &templates,
        &config.classification,
        &config.policy,
        config.transcript_workers,
    );

    let items: Vec<serde_json::Value> = slices
        .iter()
        .zip(results)
        .map(|(slice, result)| match result {
            Ok(t) => json!({ "studentId": t.student_id, "ok": true, "entries": t.entries }),
            Err(e) => json!({
                "studentId": slice.student_id,
                "ok": false,
                "error": { "code": e.code(), "message": e.to_string(), "details": e.details() },
            }),
        })
        .collect();
    Ok(json!({ "transcripts": items, "workers": config.transcript_workers }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.record" => Some(with_db(state, req, results_record)),
        "results.bulkUpload" => Some(with_db(state, req, results_bulk_upload)),
        "results.semester" => Some(with_db(state, req, results_semester)),
        "results.finalize" => Some(with_db(state, req, results_finalize)),
        "results.transcript" => Some(with_db(state, req, results_transcript)),
        "results.report" => Some(with_db(state, req, results_report)),
        "results.transcriptsBatch" => Some(with_db(state, req, results_transcripts_batch)),
        _ => None,
    }
}
