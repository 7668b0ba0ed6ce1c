use crate::calc::{
    CourseRegistration, RegistrationKey, RegistrationStatus, Semester, MAX_CREDIT_UNITS,
};
use crate::grading::{GradeBand, GradingTemplate, TemplateStore};
use crate::reconcile::{CourseIndex, CourseRef, StudentIndex};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("resultd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            matric_no TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            department_id TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS courses(
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                credit_units INTEGER NOT NULL CHECK(credit_units BETWEEN 0 AND {MAX_CREDIT_UNITS}),
                updated_at TEXT
            )"
        ),
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_templates(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            department_id TEXT NOT NULL UNIQUE,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            template_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            grade TEXT NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            point REAL NOT NULL,
            PRIMARY KEY(template_id, sort_order),
            FOREIGN KEY(template_id) REFERENCES grading_templates(id)
        )",
        [],
    )?;

    // The (student, course, semester, session) constraint is what keeps
    // concurrent uploads from creating duplicate registrations.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_registrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            session TEXT NOT NULL,
            score REAL,
            grade TEXT,
            status TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(student_id, course_id, semester, session)
        )",
        [],
    )?;
    ensure_registrations_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_student ON course_registrations(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_term ON course_registrations(semester, session)",
        [],
    )?;

    Ok(conn)
}

fn ensure_registrations_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "course_registrations", "updated_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE course_registrations ADD COLUMN updated_at TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: String,
    pub matric_no: String,
    pub full_name: String,
    pub department_id: String,
}

pub fn student_by_id(conn: &Connection, student_id: &str) -> anyhow::Result<Option<StudentRecord>> {
    Ok(conn
        .query_row(
            "SELECT id, matric_no, full_name, department_id FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok(StudentRecord {
                    id: r.get(0)?,
                    matric_no: r.get(1)?,
                    full_name: r.get(2)?,
                    department_id: r.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn list_students(conn: &Connection) -> anyhow::Result<Vec<StudentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, matric_no, full_name, department_id FROM students ORDER BY matric_no",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StudentRecord {
                id: r.get(0)?,
                matric_no: r.get(1)?,
                full_name: r.get(2)?,
                department_id: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn student_index(conn: &Connection) -> anyhow::Result<StudentIndex> {
    Ok(list_students(conn)?
        .into_iter()
        .map(|s| (s.matric_no, s.id))
        .collect())
}

pub fn course_index(conn: &Connection) -> anyhow::Result<CourseIndex> {
    let mut stmt = conn.prepare("SELECT id, code, credit_units FROM courses")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CourseRef {
                id: r.get(0)?,
                code: r.get(1)?,
                credit_units: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|c| (c.code.clone(), c)).collect())
}

fn load_bands(conn: &Connection, template_id: &str) -> anyhow::Result<Vec<GradeBand>> {
    let mut stmt = conn.prepare(
        "SELECT grade, min_score, max_score, point
         FROM grade_bands
         WHERE template_id = ?
         ORDER BY sort_order",
    )?;
    let bands = stmt
        .query_map([template_id], |r| {
            Ok(GradeBand {
                grade: r.get(0)?,
                min_score: r.get(1)?,
                max_score: r.get(2)?,
                point: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bands)
}

fn load_template_where(
    conn: &Connection,
    column: &str,
    value: &str,
) -> anyhow::Result<Option<GradingTemplate>> {
    let sql = format!(
        "SELECT id, name, department_id FROM grading_templates WHERE {} = ?",
        column
    );
    let head: Option<(String, String, String)> = conn
        .query_row(&sql, [value], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .optional()?;
    let Some((id, name, department_id)) = head else {
        return Ok(None);
    };
    let grade_bands = load_bands(conn, &id)?;
    Ok(Some(GradingTemplate {
        id,
        name,
        department_id,
        grade_bands,
    }))
}

pub fn template_by_id(conn: &Connection, template_id: &str) -> anyhow::Result<Option<GradingTemplate>> {
    load_template_where(conn, "id", template_id)
}

pub fn template_for_department(
    conn: &Connection,
    department_id: &str,
) -> anyhow::Result<Option<GradingTemplate>> {
    load_template_where(conn, "department_id", department_id)
}

pub fn list_templates(conn: &Connection) -> anyhow::Result<Vec<GradingTemplate>> {
    let mut stmt =
        conn.prepare("SELECT id, name, department_id FROM grading_templates ORDER BY name")?;
    let heads = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(heads.len());
    for (id, name, department_id) in heads {
        let grade_bands = load_bands(conn, &id)?;
        out.push(GradingTemplate {
            id,
            name,
            department_id,
            grade_bands,
        });
    }
    Ok(out)
}

pub fn load_template_store(conn: &Connection) -> anyhow::Result<TemplateStore> {
    Ok(list_templates(conn)?.into_iter().collect())
}

/// Replace a template's bands wholesale; callers wrap this in a transaction.
pub fn write_bands(conn: &Connection, template_id: &str, bands: &[GradeBand]) -> anyhow::Result<()> {
    conn.execute("DELETE FROM grade_bands WHERE template_id = ?", [template_id])?;
    for (i, b) in bands.iter().enumerate() {
        conn.execute(
            "INSERT INTO grade_bands(template_id, sort_order, grade, min_score, max_score, point)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                template_id,
                i as i64,
                b.grade.trim(),
                b.min_score,
                b.max_score,
                b.point,
            ),
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationFilter {
    pub student_id: Option<String>,
    pub semester: Option<Semester>,
    pub session: Option<String>,
}

fn registration_from_row(r: &Row<'_>) -> rusqlite::Result<CourseRegistration> {
    let semester_raw: String = r.get(4)?;
    let semester = Semester::parse(&semester_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown semester {}", semester_raw).into(),
        )
    })?;
    let status_raw: String = r.get(9)?;
    Ok(CourseRegistration {
        id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        course_code: r.get(3)?,
        semester,
        session: r.get(5)?,
        score: r.get(6)?,
        grade: r.get(7)?,
        credit_units: r.get(8)?,
        status: RegistrationStatus::parse(&status_raw).unwrap_or(RegistrationStatus::Registered),
    })
}

pub fn list_registrations(
    conn: &Connection,
    filter: &RegistrationFilter,
) -> anyhow::Result<Vec<CourseRegistration>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(student_id) = &filter.student_id {
        clauses.push("r.student_id = ?");
        binds.push(Value::Text(student_id.clone()));
    }
    if let Some(semester) = filter.semester {
        clauses.push("r.semester = ?");
        binds.push(Value::Text(semester.as_str().to_string()));
    }
    if let Some(session) = &filter.session {
        clauses.push("r.session = ?");
        binds.push(Value::Text(session.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT r.id, r.student_id, r.course_id, c.code, r.semester, r.session,
                r.score, r.grade, c.credit_units, r.status
         FROM course_registrations r
         JOIN courses c ON c.id = r.course_id
         {}
         ORDER BY r.student_id, r.session, r.semester, c.code",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), registration_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn registration_keys(
    conn: &Connection,
    semester: Semester,
    session: &str,
) -> anyhow::Result<HashSet<RegistrationKey>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, course_id FROM course_registrations WHERE semester = ? AND session = ?",
    )?;
    let keys = stmt
        .query_map((semester.as_str(), session), |r| {
            Ok(RegistrationKey {
                student_id: r.get(0)?,
                course_id: r.get(1)?,
                semester,
                session: session.to_string(),
            })
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(keys)
}

/// Insert a registration unless its key already exists. Returns whether a row
/// was written.
pub fn insert_registration(conn: &Connection, reg: &CourseRegistration) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "INSERT INTO course_registrations(id, student_id, course_id, semester, session, score, grade, status, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id, semester, session) DO NOTHING",
        (
            &reg.id,
            &reg.student_id,
            &reg.course_id,
            reg.semester.as_str(),
            &reg.session,
            reg.score,
            &reg.grade,
            reg.status.as_str(),
            now_timestamp(),
        ),
    )?;
    Ok(changed > 0)
}

/// What a score write did to its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreWrite {
    /// No registration existed for the key; one was created already scored.
    Created,
    Updated,
    /// The registration is finalized and `regrade` was not set; nothing changed.
    Finalized,
}

/// Record a score (and its derived grade) against a key, creating the
/// registration when it does not exist yet. A finalized registration is only
/// overwritten when `regrade` is set; the check runs inside the upsert itself.
pub fn upsert_score(
    conn: &Connection,
    key: &RegistrationKey,
    score: f64,
    grade: Option<&str>,
    regrade: bool,
) -> anyhow::Result<ScoreWrite> {
    let new_id = uuid::Uuid::new_v4().to_string();
    let stored_id: Option<String> = conn
        .query_row(
            "INSERT INTO course_registrations(id, student_id, course_id, semester, session, score, grade, status, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 'scored', ?8)
             ON CONFLICT(student_id, course_id, semester, session) DO UPDATE SET
               score = excluded.score,
               grade = excluded.grade,
               status = 'scored',
               updated_at = excluded.updated_at
             WHERE course_registrations.status != 'finalized' OR ?9
             RETURNING id",
            (
                &new_id,
                &key.student_id,
                &key.course_id,
                key.semester.as_str(),
                &key.session,
                score,
                grade,
                now_timestamp(),
                regrade,
            ),
            |r| r.get(0),
        )
        .optional()?;
    Ok(match stored_id {
        None => ScoreWrite::Finalized,
        Some(id) if id == new_id => ScoreWrite::Created,
        Some(_) => ScoreWrite::Updated,
    })
}

pub fn finalize_group(
    conn: &Connection,
    student_id: &str,
    semester: Semester,
    session: &str,
) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "UPDATE course_registrations
         SET status = 'finalized', updated_at = ?
         WHERE student_id = ? AND semester = ? AND session = ? AND score IS NOT NULL",
        (now_timestamp(), student_id, semester.as_str(), session),
    )?)
}
