use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Remark shown for any score or GPA that falls outside every band.
pub const NOT_GRADED: &str = "Not Graded";

/// Lowest and highest raw score a grade band may cover.
pub const SCORE_FLOOR: f64 = 0.0;
pub const SCORE_CEILING: f64 = 100.0;

/// Two-decimal rounding in the same `Int(100*x + 0.5) / 100` form used for
/// published GPA figures.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Anything with an inclusive numeric range that a value can be located in.
pub trait Banded {
    fn bounds(&self) -> (f64, f64);
}

/// Locate `value` in `bands`, returning the first band whose inclusive range
/// contains it. Course grading and GPA classification both go through here.
pub fn match_band<B: Banded>(value: f64, bands: &[B]) -> Option<&B> {
    if !value.is_finite() {
        return None;
    }
    bands.iter().find(|b| {
        let (lo, hi) = b.bounds();
        lo <= value && value <= hi
    })
}

/// Index pairs `(i, j)` with `i < j` whose ranges share at least one value
/// inside `[floor, ceiling]`.
pub fn find_overlaps<B: Banded>(bands: &[B], floor: f64, ceiling: f64) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for (i, a) in bands.iter().enumerate() {
        for (j, b) in bands.iter().enumerate().skip(i + 1) {
            let (a_lo, a_hi) = a.bounds();
            let (b_lo, b_hi) = b.bounds();
            let lo = a_lo.max(b_lo).max(floor);
            let hi = a_hi.min(b_hi).min(ceiling);
            if lo <= hi {
                out.push((i, j));
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub grade: String,
    pub min_score: f64,
    pub max_score: f64,
    pub point: f64,
}

impl Banded for GradeBand {
    fn bounds(&self) -> (f64, f64) {
        (self.min_score, self.max_score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingTemplate {
    pub id: String,
    pub name: String,
    pub department_id: String,
    pub grade_bands: Vec<GradeBand>,
}

impl GradingTemplate {
    /// Highest point value any band awards, 0 for an empty template.
    pub fn max_point(&self) -> f64 {
        self.grade_bands
            .iter()
            .map(|b| b.point)
            .fold(0.0_f64, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GradeOutcome {
    Graded { grade: String, point: f64 },
    Unclassified,
}

impl GradeOutcome {
    pub fn grade(&self) -> Option<&str> {
        match self {
            GradeOutcome::Graded { grade, .. } => Some(grade.as_str()),
            GradeOutcome::Unclassified => None,
        }
    }

    /// Point contribution; unclassified scores contribute nothing.
    pub fn point(&self) -> f64 {
        match self {
            GradeOutcome::Graded { point, .. } => *point,
            GradeOutcome::Unclassified => 0.0,
        }
    }

    pub fn is_classified(&self) -> bool {
        matches!(self, GradeOutcome::Graded { .. })
    }
}

/// Grade a raw score against a template. Out-of-range scores are not clamped;
/// they simply match nothing.
pub fn evaluate(score: f64, template: &GradingTemplate) -> GradeOutcome {
    match match_band(score, &template.grade_bands) {
        Some(band) => GradeOutcome::Graded {
            grade: band.grade.clone(),
            point: band.point,
        },
        None => GradeOutcome::Unclassified,
    }
}

/// Per-department grading templates, at most one per department.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    by_department: HashMap<String, GradingTemplate>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the department's template, returning the previous one.
    pub fn insert(&mut self, template: GradingTemplate) -> Option<GradingTemplate> {
        self.by_department
            .insert(template.department_id.clone(), template)
    }

    pub fn get(&self, department_id: &str) -> Option<&GradingTemplate> {
        self.by_department.get(department_id)
    }

    pub fn require(&self, department_id: &str) -> Result<&GradingTemplate, EngineError> {
        self.get(department_id)
            .ok_or_else(|| EngineError::TemplateNotFound {
                department_id: department_id.to_string(),
                group: None,
            })
    }
}

impl FromIterator<GradingTemplate> for TemplateStore {
    fn from_iter<I: IntoIterator<Item = GradingTemplate>>(iter: I) -> Self {
        let mut store = TemplateStore::new();
        for t in iter {
            store.insert(t);
        }
        store
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum TemplateIssue {
    EmptyGrade {
        index: usize,
    },
    NonFinite {
        index: usize,
        grade: String,
    },
    InvertedRange {
        index: usize,
        grade: String,
    },
    OutOfRange {
        index: usize,
        grade: String,
    },
    NegativePoint {
        index: usize,
        grade: String,
    },
    Overlap {
        first: usize,
        second: usize,
        #[serde(rename = "firstGrade")]
        first_grade: String,
        #[serde(rename = "secondGrade")]
        second_grade: String,
    },
}

impl TemplateIssue {
    pub fn message(&self) -> String {
        match self {
            TemplateIssue::EmptyGrade { index } => format!("band {} has an empty grade", index),
            TemplateIssue::NonFinite { grade, .. } => {
                format!("band {} has a non-numeric score or point", grade)
            }
            TemplateIssue::InvertedRange { grade, .. } => {
                format!("band {} has minScore greater than maxScore", grade)
            }
            TemplateIssue::OutOfRange { grade, .. } => {
                format!("band {} extends outside 0..=100", grade)
            }
            TemplateIssue::NegativePoint { grade, .. } => {
                format!("band {} has a negative point value", grade)
            }
            TemplateIssue::Overlap {
                first_grade,
                second_grade,
                ..
            } => format!("bands {} and {} overlap", first_grade, second_grade),
        }
    }
}

/// Structural check for a set of grade bands. An empty result means every
/// score in 0..=100 matches at most one band.
pub fn validate_bands(bands: &[GradeBand]) -> Vec<TemplateIssue> {
    let mut issues = Vec::new();
    for (index, b) in bands.iter().enumerate() {
        let grade = b.grade.trim().to_string();
        if grade.is_empty() {
            issues.push(TemplateIssue::EmptyGrade { index });
        }
        if !(b.min_score.is_finite() && b.max_score.is_finite() && b.point.is_finite()) {
            issues.push(TemplateIssue::NonFinite { index, grade });
            continue;
        }
        if b.min_score > b.max_score {
            issues.push(TemplateIssue::InvertedRange {
                index,
                grade: grade.clone(),
            });
        }
        if b.min_score < SCORE_FLOOR || b.max_score > SCORE_CEILING {
            issues.push(TemplateIssue::OutOfRange {
                index,
                grade: grade.clone(),
            });
        }
        if b.point < 0.0 {
            issues.push(TemplateIssue::NegativePoint { index, grade });
        }
    }
    for (first, second) in find_overlaps(bands, SCORE_FLOOR, SCORE_CEILING) {
        issues.push(TemplateIssue::Overlap {
            first,
            second,
            first_grade: bands[first].grade.clone(),
            second_grade: bands[second].grade.clone(),
        });
    }
    issues
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationBand {
    pub label: String,
    pub min_gpa: f64,
    pub max_gpa: f64,
}

impl Banded for ClassificationBand {
    fn bounds(&self) -> (f64, f64) {
        (self.min_gpa, self.max_gpa)
    }
}

/// GPA/CGPA classification bands. Kept separate from course grade bands since
/// the two live on different scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTable {
    pub bands: Vec<ClassificationBand>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        let band = |label: &str, min_gpa: f64, max_gpa: f64| ClassificationBand {
            label: label.to_string(),
            min_gpa,
            max_gpa,
        };
        Self {
            bands: vec![
                band("Distinction", 4.50, 5.00),
                band("Very Good", 3.50, 4.49),
                band("Good", 2.40, 3.49),
                band("Pass", 1.00, 2.39),
                band("Fail", 0.00, 0.99),
            ],
        }
    }
}

impl ClassificationTable {
    /// Classify a GPA after rounding it to two decimals, so values such as
    /// 4.496 land in a band rather than the gap between 4.49 and 4.50.
    pub fn classify(&self, gpa: f64) -> &str {
        match match_band(round_off_2_decimals(gpa), &self.bands) {
            Some(band) => band.label.as_str(),
            None => NOT_GRADED,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for b in &self.bands {
            if b.label.trim().is_empty() {
                return Err("classification label must not be empty".into());
            }
            if !(b.min_gpa.is_finite() && b.max_gpa.is_finite()) || b.min_gpa > b.max_gpa {
                return Err(format!("classification {} has an invalid range", b.label));
            }
        }
        if let Some((i, j)) = find_overlaps(&self.bands, f64::MIN, f64::MAX).first() {
            return Err(format!(
                "classifications {} and {} overlap",
                self.bands[*i].label, self.bands[*j].label
            ));
        }
        Ok(())
    }
}
