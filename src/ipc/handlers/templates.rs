use crate::db;
use crate::grading::{evaluate, validate_bands, GradeBand, GradingTemplate, TemplateIssue};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, with_db, HandlerErr, Invalidation,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn issues_json(issues: &[TemplateIssue]) -> serde_json::Value {
    let items: Vec<serde_json::Value> = issues
        .iter()
        .map(|issue| {
            let mut v = json!(issue);
            v["message"] = json!(issue.message());
            v
        })
        .collect();
    json!(items)
}

fn parse_bands(v: Option<&serde_json::Value>) -> Result<Vec<GradeBand>, HandlerErr> {
    let Some(v) = v else {
        return Err(HandlerErr::bad_params("missing gradeBands"));
    };
    let bands: Vec<GradeBand> = serde_json::from_value(v.clone()).map_err(|e| {
        HandlerErr::bad_params(format!(
            "gradeBands must be a list of {{grade, minScore, maxScore, point}}: {}",
            e
        ))
    })?;
    if bands.is_empty() {
        return Err(HandlerErr::bad_params("gradeBands must not be empty"));
    }
    Ok(bands)
}

/// Refuse bands that would let a score match two grades, or none sensibly.
fn require_valid(bands: &[GradeBand]) -> Result<(), HandlerErr> {
    let issues = validate_bands(bands);
    if issues.is_empty() {
        return Ok(());
    }
    Err(
        HandlerErr::new("invalid_template", format!("{} band issue(s)", issues.len()))
            .with_details(json!({ "issues": issues_json(&issues) })),
    )
}

fn find_template(conn: &Connection, params: &serde_json::Value) -> Result<GradingTemplate, HandlerErr> {
    let found = if let Some(template_id) = get_optional_str(params, "templateId") {
        db::template_by_id(conn, &template_id)
    } else if let Some(department_id) = get_optional_str(params, "departmentId") {
        db::template_for_department(conn, &department_id)
    } else {
        return Err(HandlerErr::bad_params("missing templateId or departmentId"));
    };
    found
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::new("not_found", "template not found"))
}

fn templates_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let templates = db::list_templates(conn).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "templates": templates }))
}

fn templates_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let template = find_template(conn, params)?;
    Ok(json!({ "template": template }))
}

fn templates_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let department_id = get_required_str(params, "departmentId")?;
    let bands = parse_bands(params.get("gradeBands"))?;
    require_valid(&bands)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grading_templates WHERE department_id = ?",
            [&department_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(existing_id) = existing {
        return Err(HandlerErr::new(
            "template_exists",
            format!("department {} already has a grading template", department_id),
        )
        .with_details(json!({ "templateId": existing_id, "departmentId": department_id })));
    }

    let template_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO grading_templates(id, name, department_id, updated_at) VALUES(?, ?, ?, ?)",
        (&template_id, &name, &department_id, db::now_timestamp()),
    )
    .map_err(db_err("db_insert_failed"))?;
    db::write_bands(&tx, &template_id, &bands).map_err(db_err("db_insert_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    let mut inv = Invalidation::default();
    inv.template(&department_id);
    Ok(json!({ "templateId": template_id, "invalidates": inv.to_json() }))
}

fn templates_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let template_id = get_required_str(params, "templateId")?;
    let Some(patch) = params.get("patch").filter(|p| p.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let template = db::template_by_id(conn, &template_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::new("not_found", "template not found"))?;

    let name = match patch.get("name") {
        None => None,
        Some(_) => Some(get_required_str(patch, "name")?),
    };
    let bands = match patch.get("gradeBands") {
        None => None,
        Some(v) => {
            let bands = parse_bands(Some(v))?;
            require_valid(&bands)?;
            Some(bands)
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE grading_templates SET name = ?, updated_at = ? WHERE id = ?",
        (
            name.as_deref().unwrap_or(&template.name),
            db::now_timestamp(),
            &template_id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    if let Some(bands) = &bands {
        db::write_bands(&tx, &template_id, bands).map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    let mut inv = Invalidation::default();
    inv.template(&template.department_id);
    Ok(json!({ "ok": true, "invalidates": inv.to_json() }))
}

fn templates_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let template_id = get_required_str(params, "templateId")?;
    let template = db::template_by_id(conn, &template_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::new("not_found", "template not found"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute("DELETE FROM grade_bands WHERE template_id = ?", [&template_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM grading_templates WHERE id = ?", [&template_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    let mut inv = Invalidation::default();
    inv.template(&template.department_id);
    Ok(json!({ "ok": true, "invalidates": inv.to_json() }))
}

fn templates_validate(_conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let bands = parse_bands(params.get("gradeBands"))?;
    let issues = validate_bands(&bands);
    Ok(json!({ "valid": issues.is_empty(), "issues": issues_json(&issues) }))
}

fn templates_evaluate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    let score = params
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("score must be a number"))?;
    let store = db::load_template_store(conn).map_err(db_err("db_query_failed"))?;
    let template = store.require(&department_id)?;
    let outcome = evaluate(score, template);
    Ok(json!({
        "templateId": template.id,
        "score": score,
        "outcome": outcome,
        "grade": outcome.grade(),
        "point": outcome.point(),
        "maxPoint": template.max_point(),
        "classified": outcome.is_classified(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.list" => Some(with_db(state, req, templates_list)),
        "templates.get" => Some(with_db(state, req, templates_get)),
        "templates.create" => Some(with_db(state, req, templates_create)),
        "templates.update" => Some(with_db(state, req, templates_update)),
        "templates.delete" => Some(with_db(state, req, templates_delete)),
        "templates.validate" => Some(with_db(state, req, templates_validate)),
        "templates.evaluate" => Some(with_db(state, req, templates_evaluate)),
        _ => None,
    }
}
