use crate::calc::{
    aggregate, gpa, AggregationPolicy, CourseRegistration, GradingContext, Semester, SemesterKey,
    SemesterSummary,
};
use crate::error::EngineError;
use crate::grading::{ClassificationTable, TemplateStore};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeTotals {
    pub tcu: u64,
    pub tgp: f64,
    pub cgpa: f64,
}

impl CumulativeTotals {
    fn add(self, summary: &SemesterSummary) -> Self {
        let tcu = self.tcu.saturating_add(summary.tcu);
        let tgp = self.tgp + summary.tgp;
        Self {
            tcu,
            tgp,
            cgpa: gpa(tgp, tcu),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    #[serde(flatten)]
    pub summary: SemesterSummary,
    pub cumulative: CumulativeTotals,
    /// Cumulative figures as they stood before this semester.
    pub previous: Option<CumulativeTotals>,
}

/// Roll semester summaries into a transcript.
///
/// Summaries must already be in chronological order; they are not re-sorted.
pub fn accumulate(summaries: &[SemesterSummary]) -> Vec<TranscriptEntry> {
    let running: Vec<CumulativeTotals> = summaries
        .iter()
        .scan(CumulativeTotals::default(), |acc, s| {
            *acc = acc.add(s);
            Some(*acc)
        })
        .collect();

    summaries
        .iter()
        .enumerate()
        .map(|(i, s)| TranscriptEntry {
            summary: s.clone(),
            cumulative: running[i],
            previous: i.checked_sub(1).map(|p| running[p]),
        })
        .collect()
}

/// Sort key for a session label such as "2022/2023": the first run of digits
/// as a year, then the raw label. Labels without a year sort last.
pub fn session_sort_key(session: &str) -> (u32, String) {
    let digits: String = session
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let year = digits.parse::<u32>().unwrap_or(u32::MAX);
    (year, session.to_string())
}

pub fn chronological_cmp(a: (&str, Semester), b: (&str, Semester)) -> Ordering {
    session_sort_key(a.0)
        .cmp(&session_sort_key(b.0))
        .then(a.1.cmp(&b.1))
}

/// One student's registrations, fetched independently of every other student.
#[derive(Debug, Clone)]
pub struct StudentSlice {
    pub student_id: String,
    pub department_id: String,
    pub registrations: Vec<CourseRegistration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTranscript {
    pub student_id: String,
    pub entries: Vec<TranscriptEntry>,
}

/// Group a student's registrations by semester in chronological order,
/// aggregate each group and roll the results up.
pub fn build_transcript(
    slice: &StudentSlice,
    templates: &TemplateStore,
    classification: &ClassificationTable,
    policy: &AggregationPolicy,
) -> Result<StudentTranscript, EngineError> {
    let mut by_semester: HashMap<(String, Semester), Vec<CourseRegistration>> = HashMap::new();
    for r in &slice.registrations {
        by_semester
            .entry((r.session.clone(), r.semester))
            .or_default()
            .push(r.clone());
    }
    let mut groups: Vec<_> = by_semester.into_iter().collect();
    groups.sort_by(|((a_session, a_sem), _), ((b_session, b_sem), _)| {
        chronological_cmp((a_session.as_str(), *a_sem), (b_session.as_str(), *b_sem))
    });

    let ctx = GradingContext {
        department_id: &slice.department_id,
        template: templates.get(&slice.department_id),
        classification,
        policy,
    };
    let mut summaries = Vec::with_capacity(groups.len());
    for ((session, semester), regs) in groups {
        let key = SemesterKey {
            student_id: slice.student_id.clone(),
            semester,
            session,
        };
        summaries.push(aggregate(&key, &regs, &ctx)?);
    }

    Ok(StudentTranscript {
        student_id: slice.student_id.clone(),
        entries: accumulate(&summaries),
    })
}

/// Build transcripts for many students on up to `workers` threads. Each worker
/// owns a disjoint chunk of slices; results come back in input order.
pub fn build_transcripts(
    slices: &[StudentSlice],
    templates: &TemplateStore,
    classification: &ClassificationTable,
    policy: &AggregationPolicy,
    workers: usize,
) -> Vec<Result<StudentTranscript, EngineError>> {
    if slices.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, slices.len());
    let chunk_size = slices.len().div_ceil(workers);

    std::thread::scope(|scope| {
        let handles: Vec<_> = slices
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|s| build_transcript(s, templates, classification, policy))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(results) => results,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
