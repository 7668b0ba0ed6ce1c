use crate::calc::Semester;
use crate::reconcile::RejectReason;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// `matricNo,courseCode[;courseCode...]`
    Registration,
    /// `matricNo,score[,course,semester,session]`
    Result,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRow {
    pub line: usize,
    pub raw: String,
    pub matric_no: String,
    pub course_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub line: usize,
    pub raw: String,
    pub matric_no: String,
    pub score: f64,
    pub course_code: Option<String>,
    pub semester: Option<Semester>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadRow {
    Registration(RegistrationRow),
    Result(ResultRow),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub raw: String,
    pub reason: RejectReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedUpload {
    pub rows: Vec<UploadRow>,
    pub errors: Vec<RowError>,
    /// Non-blank data lines seen, header excluded.
    pub rows_total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("upload has no header row")]
    Empty,
    #[error("header is missing required column '{0}'")]
    MissingColumn(&'static str),
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn row_error(line: usize, raw: &str, reason: RejectReason, message: impl Into<String>) -> RowError {
    RowError {
        line,
        raw: raw.to_string(),
        reason,
        message: message.into(),
    }
}

/// Header names compare case-insensitively and ignore separator punctuation,
/// so "Matric No", "matric_no" and "MATRICNO" are the same column.
fn normalize_header(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '.' | '-'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Column positions for result uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultColumns {
    pub matric_no: usize,
    pub score: usize,
    pub course: Option<usize>,
    pub semester: Option<usize>,
    pub session: Option<usize>,
}

impl ResultColumns {
    /// Layout used when rows arrive without a header.
    pub fn positional() -> Self {
        Self {
            matric_no: 0,
            score: 1,
            course: Some(2),
            semester: Some(3),
            session: Some(4),
        }
    }

    pub fn from_header(header: &str) -> Result<Self, HeaderError> {
        let mut idx = HashMap::<String, usize>::new();
        for (i, f) in parse_csv_record(header).iter().enumerate() {
            idx.entry(normalize_header(f)).or_insert(i);
        }
        let matric_no = idx
            .get("matricno")
            .or_else(|| idx.get("matricnumber"))
            .copied()
            .ok_or(HeaderError::MissingColumn("matricno"))?;
        let score = idx
            .get("score")
            .copied()
            .ok_or(HeaderError::MissingColumn("score"))?;
        let course = idx
            .get("course")
            .or_else(|| idx.get("coursecode"))
            .copied();
        Ok(Self {
            matric_no,
            score,
            course,
            semester: idx.get("semester").copied(),
            session: idx.get("session").copied(),
        })
    }
}

pub fn parse_registration_row(line: usize, raw: &str) -> Result<RegistrationRow, RowError> {
    let fields = parse_csv_record(raw);
    if fields.len() < 2 {
        return Err(row_error(
            line,
            raw,
            RejectReason::MalformedRow,
            "expected matricNo,courseCode[;courseCode...]",
        ));
    }
    let Some(matric_no) = non_empty_trimmed(&fields[0]) else {
        return Err(row_error(
            line,
            raw,
            RejectReason::MalformedRow,
            "matric number is empty",
        ));
    };
    // Course codes normally share the second column separated by ';', but a
    // comma-separated tail is tolerated.
    let course_codes = fields[1..]
        .iter()
        .flat_map(|f| f.split(';'))
        .filter_map(non_empty_trimmed)
        .collect();
    Ok(RegistrationRow {
        line,
        raw: raw.to_string(),
        matric_no,
        course_codes,
    })
}

pub fn parse_result_row(
    line: usize,
    raw: &str,
    cols: &ResultColumns,
) -> Result<ResultRow, RowError> {
    let fields = parse_csv_record(raw);
    let cell = |i: Option<usize>| i.and_then(|i| fields.get(i)).and_then(|s| non_empty_trimmed(s));

    let Some(matric_no) = cell(Some(cols.matric_no)) else {
        return Err(row_error(
            line,
            raw,
            RejectReason::MalformedRow,
            "matric number is empty",
        ));
    };
    let score_token = cell(Some(cols.score)).unwrap_or_default();
    let score = match score_token.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            return Err(row_error(
                line,
                raw,
                RejectReason::InvalidScore,
                format!("score '{}' is not a number", score_token),
            ))
        }
    };
    let semester = match cell(cols.semester) {
        None => None,
        Some(s) => match Semester::parse(&s) {
            Some(v) => Some(v),
            None => {
                return Err(row_error(
                    line,
                    raw,
                    RejectReason::MalformedRow,
                    format!("semester '{}' must be First or Second", s),
                ))
            }
        },
    };

    Ok(ResultRow {
        line,
        raw: raw.to_string(),
        matric_no,
        score,
        course_code: cell(cols.course),
        semester,
        session: cell(cols.session),
    })
}

/// Parse a whole upload. The first non-blank line is the header: ignored for
/// registration uploads, used to locate columns for result uploads.
pub fn parse_upload(kind: UploadKind, text: &str) -> Result<ParsedUpload, HeaderError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());

    let Some((_, header)) = lines.next() else {
        return Err(HeaderError::Empty);
    };
    let cols = match kind {
        UploadKind::Result => Some(ResultColumns::from_header(header)?),
        UploadKind::Registration => None,
    };

    let mut parsed = ParsedUpload::default();
    for (line, raw) in lines {
        parsed.rows_total += 1;
        let row = match cols {
            Some(ref cols) => parse_result_row(line, raw.trim(), cols).map(UploadRow::Result),
            None => parse_registration_row(line, raw.trim()).map(UploadRow::Registration),
        };
        match row {
            Ok(r) => parsed.rows.push(r),
            Err(e) => parsed.errors.push(e),
        }
    }
    Ok(parsed)
}
