use crate::calc::{CourseRegistration, RegistrationKey, RegistrationStatus, Semester};
use crate::upload::{
    parse_registration_row, parse_result_row, ParsedUpload, RegistrationRow, ResultColumns,
    ResultRow, RowError, UploadRow,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Why a bulk row was not turned into registrations. Always row-scoped; a
/// rejection never aborts the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    StudentNotFound,
    InvalidScore,
    NoResolvableCourses,
    MalformedRow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRef {
    pub id: String,
    pub code: String,
    pub credit_units: u32,
}

/// Matric number to student id.
pub type StudentIndex = HashMap<String, String>;
/// Course code to course identity.
pub type CourseIndex = HashMap<String, CourseRef>;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub students: &'a StudentIndex,
    pub courses: &'a CourseIndex,
    /// Target semester/session; result rows may override both per row.
    pub semester: Option<Semester>,
    pub session: Option<&'a str>,
    /// Course applied to result rows that carry no course column.
    pub course_code: Option<&'a str>,
    /// Keys already registered in the store.
    pub existing: Option<&'a HashSet<RegistrationKey>>,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(students: &'a StudentIndex, courses: &'a CourseIndex) -> Self {
        Self {
            students,
            courses,
            semester: None,
            session: None,
            course_code: None,
            existing: None,
        }
    }

    fn already_registered(&self, key: &RegistrationKey) -> bool {
        self.existing.map(|e| e.contains(key)).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub line: usize,
    pub row: String,
    pub reason: RejectReason,
    pub message: String,
}

impl From<RowError> for Rejection {
    fn from(e: RowError) -> Self {
        Self {
            line: e.line,
            row: e.raw,
            reason: e.reason,
            message: e.message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// One entry per distinct registration key, ordered by key.
    pub accepted: Vec<CourseRegistration>,
    pub rejected: Vec<Rejection>,
    /// Rows that resolved, including rows whose keys were all duplicates.
    pub accepted_rows: usize,
    /// Keys dropped because they repeated within the batch or already exist.
    pub duplicates: usize,
    pub rows_total: usize,
}

fn reject(line: usize, raw: &str, reason: RejectReason, message: impl Into<String>) -> Rejection {
    Rejection {
        line,
        row: raw.to_string(),
        reason,
        message: message.into(),
    }
}

struct Batch<'c, 'a> {
    ctx: &'c ReconcileContext<'a>,
    keyed: BTreeMap<RegistrationKey, CourseRegistration>,
    duplicates: usize,
}

impl Batch<'_, '_> {
    /// Keep the first registration seen for a key.
    fn admit(&mut self, reg: CourseRegistration, skip_existing: bool) {
        let key = reg.key();
        if self.keyed.contains_key(&key) || (skip_existing && self.ctx.already_registered(&key)) {
            self.duplicates += 1;
            return;
        }
        self.keyed.insert(key, reg);
    }

    fn student_id(&self, line: usize, raw: &str, matric_no: &str) -> Result<String, Rejection> {
        self.ctx.students.get(matric_no).cloned().ok_or_else(|| {
            reject(
                line,
                raw,
                RejectReason::StudentNotFound,
                format!("no student with matric number {}", matric_no),
            )
        })
    }

    fn registration_row(&mut self, row: &RegistrationRow) -> Result<(), Rejection> {
        let student_id = self.student_id(row.line, &row.raw, &row.matric_no)?;
        let (Some(semester), Some(session)) = (self.ctx.semester, self.ctx.session) else {
            return Err(reject(
                row.line,
                &row.raw,
                RejectReason::MalformedRow,
                "semester and session are required",
            ));
        };
        let courses = self.ctx.courses;
        let resolved: Vec<&CourseRef> = row
            .course_codes
            .iter()
            .filter_map(|code| courses.get(code))
            .collect();
        if resolved.is_empty() {
            return Err(reject(
                row.line,
                &row.raw,
                RejectReason::NoResolvableCourses,
                "none of the listed course codes exist",
            ));
        }
        for course in resolved {
            self.admit(
                CourseRegistration {
                    id: Uuid::new_v4().to_string(),
                    student_id: student_id.clone(),
                    course_id: course.id.clone(),
                    course_code: course.code.clone(),
                    credit_units: course.credit_units,
                    semester,
                    session: session.to_string(),
                    score: None,
                    grade: None,
                    status: RegistrationStatus::Registered,
                },
                true,
            );
        }
        Ok(())
    }

    fn result_row(&mut self, row: &ResultRow) -> Result<(), Rejection> {
        let student_id = self.student_id(row.line, &row.raw, &row.matric_no)?;
        let Some(code) = row.course_code.as_deref().or(self.ctx.course_code) else {
            return Err(reject(
                row.line,
                &row.raw,
                RejectReason::NoResolvableCourses,
                "no course code given",
            ));
        };
        let courses = self.ctx.courses;
        let Some(course) = courses.get(code) else {
            return Err(reject(
                row.line,
                &row.raw,
                RejectReason::NoResolvableCourses,
                format!("no course with code {}", code),
            ));
        };
        let semester = row.semester.or(self.ctx.semester);
        let session = row.session.as_deref().or(self.ctx.session);
        let (Some(semester), Some(session)) = (semester, session) else {
            return Err(reject(
                row.line,
                &row.raw,
                RejectReason::MalformedRow,
                "semester and session are required",
            ));
        };
        // Stored keys are not duplicates here: a result updates its registration.
        self.admit(
            CourseRegistration {
                id: Uuid::new_v4().to_string(),
                student_id,
                course_id: course.id.clone(),
                course_code: course.code.clone(),
                credit_units: course.credit_units,
                semester,
                session: session.to_string(),
                score: Some(row.score),
                grade: None,
                status: RegistrationStatus::Scored,
            },
            false,
        );
        Ok(())
    }
}

/// Resolve parsed upload rows against the identity indexes.
///
/// Rows whose student is unknown are rejected whole. Unknown course codes are
/// dropped from an otherwise valid row, which is rejected only when no course
/// resolves. Registrations are collected by key, so a key appearing more than
/// once yields a single registration.
pub fn reconcile(parsed: ParsedUpload, ctx: &ReconcileContext<'_>) -> Reconciliation {
    let mut rejected: Vec<Rejection> = parsed.errors.into_iter().map(Rejection::from).collect();
    let mut batch = Batch {
        ctx,
        keyed: BTreeMap::new(),
        duplicates: 0,
    };
    let mut accepted_rows = 0usize;

    for row in &parsed.rows {
        let outcome = match row {
            UploadRow::Registration(r) => batch.registration_row(r),
            UploadRow::Result(r) => batch.result_row(r),
        };
        match outcome {
            Ok(()) => accepted_rows += 1,
            Err(rejection) => rejected.push(rejection),
        }
    }
    rejected.sort_by_key(|r| r.line);

    Reconciliation {
        accepted: batch.keyed.into_values().collect(),
        rejected,
        accepted_rows,
        duplicates: batch.duplicates,
        rows_total: parsed.rows_total,
    }
}

fn parse_lines<F>(rows: &[&str], parse: F) -> ParsedUpload
where
    F: Fn(usize, &str) -> Result<UploadRow, RowError>,
{
    let mut parsed = ParsedUpload::default();
    for (i, raw) in rows.iter().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        parsed.rows_total += 1;
        match parse(i + 1, raw.trim()) {
            Ok(r) => parsed.rows.push(r),
            Err(e) => parsed.errors.push(e),
        }
    }
    parsed
}

/// Reconcile header-less registration rows (`matricNo,code;code`).
pub fn reconcile_registration_lines(rows: &[&str], ctx: &ReconcileContext<'_>) -> Reconciliation {
    let parsed = parse_lines(rows, |line, raw| {
        parse_registration_row(line, raw).map(UploadRow::Registration)
    });
    reconcile(parsed, ctx)
}

/// Reconcile header-less result rows (`matricNo,score[,course,semester,session]`).
pub fn reconcile_result_lines(rows: &[&str], ctx: &ReconcileContext<'_>) -> Reconciliation {
    let cols = ResultColumns::positional();
    let parsed = parse_lines(rows, |line, raw| {
        parse_result_row(line, raw, &cols).map(UploadRow::Result)
    });
    reconcile(parsed, ctx)
}
