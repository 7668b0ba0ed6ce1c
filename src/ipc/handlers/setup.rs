use crate::calc::{AggregationPolicy, MissingTemplatePolicy, Semester};
use crate::db;
use crate::grading::{ClassificationBand, ClassificationTable};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Upload,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Upload => "setup.upload",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "countUnclassifiedCredits": true,
            "missingTemplate": "block",
            "classificationBands": ClassificationTable::default().bands,
            "transcriptWorkers": 4
        }),
        SetupSection::Upload => json!({
            "defaultSemester": null,
            "defaultSession": null
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_classification(v: &Value, key: &str) -> Result<Vec<ClassificationBand>, String> {
    let bands: Vec<ClassificationBand> = serde_json::from_value(v.clone())
        .map_err(|e| format!("{} must be a list of {{label, minGpa, maxGpa}}: {}", key, e))?;
    if bands.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    let table = ClassificationTable { bands };
    table.validate()?;
    Ok(table.bands)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "countUnclassifiedCredits" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "missingTemplate" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(policy) = MissingTemplatePolicy::parse(&s) else {
                        return Err("missingTemplate must be one of: block, unclassified".into());
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "classificationBands" => {
                    obj.insert(k.clone(), json!(parse_classification(v, k)?));
                }
                "transcriptWorkers" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 16)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Upload => match k.as_str() {
                "defaultSemester" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                        continue;
                    }
                    let s = parse_string_max(v, k, 16)?;
                    let Some(semester) = Semester::parse(&s) else {
                        return Err("defaultSemester must be one of: First, Second".into());
                    };
                    obj.insert(k.clone(), Value::String(semester.as_str().to_string()));
                }
                "defaultSession" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                        continue;
                    }
                    let s = parse_string_max(v, k, 32)?;
                    let value = if s.is_empty() { Value::Null } else { Value::String(s) };
                    obj.insert(k.clone(), value);
                }
                _ => return Err(format!("unknown upload field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Defaults overlaid with each saved field that still validates. A stale
/// field keeps its default without discarding its siblings.
fn overlay_saved(section: SetupSection, saved: &Map<String, Value>) -> Value {
    let mut current = default_section(section);
    for (k, v) in saved {
        let mut single = Map::new();
        single.insert(k.clone(), v.clone());
        let _ = merge_section_patch(section, &mut current, &single);
    }
    current
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let saved = db::settings_get_json(conn, section.key())?;
    Ok(match saved.as_ref().and_then(|v| v.as_object()) {
        Some(saved_obj) => overlay_saved(section, saved_obj),
        None => default_section(section),
    })
}

/// Engine policy handed to every result computation.
#[derive(Debug, Clone)]
pub struct GradingConfig {
    pub policy: AggregationPolicy,
    pub classification: ClassificationTable,
    pub transcript_workers: usize,
}

pub fn load_grading_config(conn: &rusqlite::Connection) -> anyhow::Result<GradingConfig> {
    let section = load_section(conn, SetupSection::Grading)?;
    let defaults = AggregationPolicy::default();
    let count_unclassified_credits = section
        .get("countUnclassifiedCredits")
        .and_then(|v| v.as_bool())
        .unwrap_or(defaults.count_unclassified_credits);
    let missing_template = section
        .get("missingTemplate")
        .and_then(|v| v.as_str())
        .and_then(MissingTemplatePolicy::parse)
        .unwrap_or(defaults.missing_template);
    let bands: Vec<ClassificationBand> = match section.get("classificationBands") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => ClassificationTable::default().bands,
    };
    let transcript_workers = section
        .get("transcriptWorkers")
        .and_then(|v| v.as_u64())
        .unwrap_or(4) as usize;
    Ok(GradingConfig {
        policy: AggregationPolicy {
            count_unclassified_credits,
            missing_template,
        },
        classification: ClassificationTable { bands },
        transcript_workers,
    })
}

#[derive(Debug, Clone, Default)]
pub struct UploadDefaults {
    pub semester: Option<Semester>,
    pub session: Option<String>,
}

pub fn load_upload_defaults(conn: &rusqlite::Connection) -> anyhow::Result<UploadDefaults> {
    let section = load_section(conn, SetupSection::Upload)?;
    Ok(UploadDefaults {
        semester: section
            .get("defaultSemester")
            .and_then(|v| v.as_str())
            .and_then(Semester::parse),
        session: section
            .get("defaultSession")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let upload = match load_section(conn, SetupSection::Upload) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "upload": upload
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    // Grading policy feeds every derived result, so all transcripts go stale.
    let invalidates = match section {
        SetupSection::Grading => json!(["transcript:*"]),
        SetupSection::Upload => json!([]),
    };
    ok(&req.id, json!({ "ok": true, "invalidates": invalidates }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_patch_normalizes_and_validates() {
        let mut current = default_section(SetupSection::Grading);
        let patch = json!({ "missingTemplate": "Unclassified", "transcriptWorkers": 2 });
        merge_section_patch(
            SetupSection::Grading,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("merge");
        assert_eq!(current["missingTemplate"], json!("unclassified"));
        assert_eq!(current["transcriptWorkers"], json!(2));

        let bad = json!({ "transcriptWorkers": 0 });
        assert!(merge_section_patch(
            SetupSection::Grading,
            &mut current,
            bad.as_object().expect("object")
        )
        .is_err());
    }

    #[test]
    fn stale_saved_field_keeps_its_default_without_dropping_others() {
        // "countUnclassifiedCredits" sorts before "transcriptWorkers".
        let saved = json!({
            "countUnclassifiedCredits": "garbage",
            "missingTemplate": "unclassified",
            "transcriptWorkers": 2,
            "retiredField": true
        });
        let current = overlay_saved(SetupSection::Grading, saved.as_object().expect("object"));
        assert_eq!(current["countUnclassifiedCredits"], json!(true));
        assert_eq!(current["missingTemplate"], json!("unclassified"));
        assert_eq!(current["transcriptWorkers"], json!(2));
        assert!(current.get("retiredField").is_none());
    }

    #[test]
    fn overlapping_classification_bands_are_refused() {
        let mut current = default_section(SetupSection::Grading);
        let patch = json!({
            "classificationBands": [
                { "label": "High", "minGpa": 3.0, "maxGpa": 5.0 },
                { "label": "Low", "minGpa": 0.0, "maxGpa": 3.0 }
            ]
        });
        let e = merge_section_patch(
            SetupSection::Grading,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect_err("overlap");
        assert!(e.contains("overlap"));
    }

    #[test]
    fn upload_defaults_accept_null_and_canonicalize_semester() {
        let mut current = default_section(SetupSection::Upload);
        let patch = json!({ "defaultSemester": "2nd", "defaultSession": " 2023/2024 " });
        merge_section_patch(
            SetupSection::Upload,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("merge");
        assert_eq!(current["defaultSemester"], json!("Second"));
        assert_eq!(current["defaultSession"], json!("2023/2024"));

        let clear = json!({ "defaultSemester": null });
        merge_section_patch(
            SetupSection::Upload,
            &mut current,
            clear.as_object().expect("object"),
        )
        .expect("merge");
        assert!(current["defaultSemester"].is_null());
    }
}
