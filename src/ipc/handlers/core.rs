use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

/// Row counts reported alongside the workspace so a caller can tell an empty
/// workspace from a populated one without listing anything.
fn catalog_counts(conn: &Connection) -> anyhow::Result<serde_json::Value> {
    let count = |table: &str| -> anyhow::Result<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
    };
    Ok(json!({
        "students": count("students")?,
        "courses": count("courses")?,
        "templates": count("grading_templates")?,
        "registrations": count("course_registrations")?,
    }))
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    let catalog = match state.db.as_ref().map(catalog_counts) {
        None => serde_json::Value::Null,
        Some(Ok(v)) => v,
        Some(Err(e)) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "catalog": catalog,
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
    let Some(path) = path else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => {
            return err(
                &req.id,
                "db_open_failed",
                format!("{e:?}"),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };
    let catalog = match catalog_counts(&conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // The previous connection, if any, closes when replaced.
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    ok(
        &req.id,
        json!({ "workspacePath": path.to_string_lossy(), "catalog": catalog }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
