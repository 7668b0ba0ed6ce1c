use crate::calc::SemesterKey;
use serde_json::json;
use thiserror::Error;

/// Structural failures that abort one unit of result computation.
///
/// Row-level bulk upload problems are not errors; they are collected as
/// [`crate::reconcile::RejectReason`] alongside the accepted rows.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// No grading template is mapped to the student's department.
    #[error("no grading template for department '{department_id}'")]
    TemplateNotFound {
        department_id: String,
        group: Option<SemesterKey>,
    },

    /// A registration outside the requested (student, semester, session) group
    /// was passed to the aggregator.
    #[error("registration {registration_id} belongs to {found}, expected {expected}")]
    InvalidGrouping {
        expected: SemesterKey,
        found: SemesterKey,
        registration_id: String,
    },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::TemplateNotFound { .. } => "template_not_found",
            EngineError::InvalidGrouping { .. } => "invalid_grouping",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            EngineError::TemplateNotFound {
                department_id,
                group,
            } => {
                let mut d = json!({ "departmentId": department_id });
                if let Some(g) = group {
                    d["studentId"] = json!(g.student_id);
                    d["semester"] = json!(g.semester);
                    d["session"] = json!(g.session);
                }
                d
            }
            EngineError::InvalidGrouping {
                expected,
                found,
                registration_id,
            } => json!({
                "registrationId": registration_id,
                "studentId": expected.student_id,
                "semester": expected.semester,
                "session": expected.session,
                "found": found,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::Semester;

    fn key() -> SemesterKey {
        SemesterKey {
            student_id: "stu-1".into(),
            semester: Semester::First,
            session: "2022/2023".into(),
        }
    }

    #[test]
    fn template_not_found_reports_group_context() {
        let e = EngineError::TemplateNotFound {
            department_id: "csc".into(),
            group: Some(key()),
        };
        assert_eq!(e.to_string(), "no grading template for department 'csc'");
        let d = e.details();
        assert_eq!(d["studentId"], "stu-1");
        assert_eq!(d["semester"], "First");
        assert_eq!(d["session"], "2022/2023");
    }

    #[test]
    fn invalid_grouping_message_names_both_groups() {
        let mut other = key();
        other.semester = Semester::Second;
        let e = EngineError::InvalidGrouping {
            expected: key(),
            found: other,
            registration_id: "reg-9".into(),
        };
        assert_eq!(e.code(), "invalid_grouping");
        assert_eq!(
            e.to_string(),
            "registration reg-9 belongs to stu-1 Second 2022/2023, expected stu-1 First 2022/2023"
        );
    }
}
