use crate::error::EngineError;
use crate::grading::{evaluate, ClassificationTable, GradingTemplate, NOT_GRADED};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NOT_SCORED: &str = "Not Scored";

/// Upper bound on a course's credit units accepted into the catalog.
pub const MAX_CREDIT_UNITS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Semester {
    First,
    Second,
}

impl Semester {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "1" | "1st" => Some(Semester::First),
            "second" | "2" | "2nd" => Some(Semester::Second),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Semester::First => "First",
            Semester::Second => "Second",
        }
    }
}

impl fmt::Display for Semester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One student's results for one semester of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterKey {
    pub student_id: String,
    pub semester: Semester,
    pub session: String,
}

impl fmt::Display for SemesterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.student_id, self.semester, self.session)
    }
}

/// Natural uniqueness key of a course registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationKey {
    pub student_id: String,
    pub course_id: String,
    pub semester: Semester,
    pub session: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Registered,
    Scored,
    Finalized,
}

impl RegistrationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(Self::Registered),
            "scored" => Some(Self::Scored),
            "finalized" => Some(Self::Finalized),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Scored => "scored",
            Self::Finalized => "finalized",
        }
    }
}

/// A course registration as read back from the store, with the course's code
/// and credit units joined in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRegistration {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub course_code: String,
    pub credit_units: u32,
    pub semester: Semester,
    pub session: String,
    pub score: Option<f64>,
    pub grade: Option<String>,
    pub status: RegistrationStatus,
}

impl CourseRegistration {
    pub fn key(&self) -> RegistrationKey {
        RegistrationKey {
            student_id: self.student_id.clone(),
            course_id: self.course_id.clone(),
            semester: self.semester,
            session: self.session.clone(),
        }
    }

    pub fn semester_key(&self) -> SemesterKey {
        SemesterKey {
            student_id: self.student_id.clone(),
            semester: self.semester,
            session: self.session.clone(),
        }
    }

    fn belongs_to(&self, key: &SemesterKey) -> bool {
        self.student_id == key.student_id
            && self.semester == key.semester
            && self.session == key.session
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTemplatePolicy {
    /// Refuse to compute results that need a grade.
    Block,
    /// Treat every recorded score as unclassified.
    Unclassified,
}

impl MissingTemplatePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Some(Self::Block),
            "unclassified" => Some(Self::Unclassified),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Unclassified => "unclassified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationPolicy {
    /// Whether a recorded score matching no grade band still adds its credit
    /// units to TCU. Absent scores never count.
    pub count_unclassified_credits: bool,
    pub missing_template: MissingTemplatePolicy,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            count_unclassified_credits: true,
            missing_template: MissingTemplatePolicy::Block,
        }
    }
}

/// Everything the aggregator needs besides the registrations themselves.
#[derive(Debug, Clone, Copy)]
pub struct GradingContext<'a> {
    pub department_id: &'a str,
    pub template: Option<&'a GradingTemplate>,
    pub classification: &'a ClassificationTable,
    pub policy: &'a AggregationPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResult {
    pub registration_id: String,
    pub course_id: String,
    pub course_code: String,
    pub credit_units: u32,
    pub score: Option<f64>,
    pub grade: Option<String>,
    pub point: f64,
    pub grade_points: f64,
    /// Whether the credit units were added to TCU.
    pub counted: bool,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterSummary {
    pub student_id: String,
    pub semester: Semester,
    pub session: String,
    pub tcu: u64,
    pub tgp: f64,
    pub gpa: f64,
    pub remark: String,
    pub courses: Vec<CourseResult>,
}

pub fn gpa(tgp: f64, tcu: u64) -> f64 {
    if tcu > 0 {
        tgp / tcu as f64
    } else {
        0.0
    }
}

/// Compute TCU, TGP and GPA for one (student, semester, session) group.
///
/// Every registration must belong to `key`; the aggregator does not partition
/// mixed input. A missing template only matters once a recorded score needs a
/// grade, and then `ctx.policy.missing_template` decides between failing and
/// grading everything as unclassified.
pub fn aggregate(
    key: &SemesterKey,
    registrations: &[CourseRegistration],
    ctx: &GradingContext<'_>,
) -> Result<SemesterSummary, EngineError> {
    if let Some(stray) = registrations.iter().find(|r| !r.belongs_to(key)) {
        return Err(EngineError::InvalidGrouping {
            expected: key.clone(),
            found: stray.semester_key(),
            registration_id: stray.id.clone(),
        });
    }

    let needs_template = registrations.iter().any(|r| r.score.is_some());
    if needs_template
        && ctx.template.is_none()
        && ctx.policy.missing_template == MissingTemplatePolicy::Block
    {
        return Err(EngineError::TemplateNotFound {
            department_id: ctx.department_id.to_string(),
            group: Some(key.clone()),
        });
    }

    // A sum of u32 credit units can exceed u32::MAX.
    let mut tcu: u64 = 0;
    let mut tgp: f64 = 0.0;
    let mut courses = Vec::with_capacity(registrations.len());

    for r in registrations {
        let Some(score) = r.score else {
            courses.push(CourseResult {
                registration_id: r.id.clone(),
                course_id: r.course_id.clone(),
                course_code: r.course_code.clone(),
                credit_units: r.credit_units,
                score: None,
                grade: None,
                point: 0.0,
                grade_points: 0.0,
                counted: false,
                remark: NOT_SCORED.to_string(),
            });
            continue;
        };

        let outcome = ctx.template.map(|t| evaluate(score, t));
        let classified = outcome.as_ref().map(|o| o.is_classified()).unwrap_or(false);
        let point = outcome.as_ref().map(|o| o.point()).unwrap_or(0.0);
        let counted = classified || ctx.policy.count_unclassified_credits;
        let grade_points = if counted {
            point * f64::from(r.credit_units)
        } else {
            0.0
        };
        if counted {
            tcu += u64::from(r.credit_units);
            tgp += grade_points;
        }

        let remark = if !classified {
            NOT_GRADED
        } else if point > 0.0 {
            "Passed"
        } else {
            "Failed"
        };
        courses.push(CourseResult {
            registration_id: r.id.clone(),
            course_id: r.course_id.clone(),
            course_code: r.course_code.clone(),
            credit_units: r.credit_units,
            score: Some(score),
            grade: outcome.as_ref().and_then(|o| o.grade()).map(str::to_string),
            point,
            grade_points,
            counted,
            remark: remark.to_string(),
        });
    }

    let gpa = gpa(tgp, tcu);
    let remark = if tcu > 0 {
        ctx.classification.classify(gpa).to_string()
    } else {
        NOT_GRADED.to_string()
    };

    Ok(SemesterSummary {
        student_id: key.student_id.clone(),
        semester: key.semester,
        session: key.session.clone(),
        tcu,
        tgp,
        gpa,
        remark,
        courses,
    })
}
