use crate::calc::Semester;
use crate::error::EngineError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details: Some(e.details()),
        }
    }
}

/// Map a storage error onto a wire code, e.g. `.map_err(db_err("db_query_failed"))`.
pub fn db_err<E: std::fmt::Display>(code: &'static str) -> impl Fn(E) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

/// Run a handler body against the open workspace database.
pub fn with_db<F>(state: &AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    respond(req, f(conn, &req.params))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_optional_semester(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Semester>, HandlerErr> {
    match get_optional_str(params, key) {
        None => Ok(None),
        Some(s) => Semester::parse(&s).map(Some).ok_or_else(|| {
            HandlerErr::bad_params(format!("{} must be First or Second", key))
        }),
    }
}

pub fn get_required_semester(params: &serde_json::Value, key: &str) -> Result<Semester, HandlerErr> {
    get_optional_semester(params, key)?
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Cache scopes a mutation makes stale. Presentation layers holding derived
/// views (registration lists, transcripts, grading templates) drop them on
/// receipt instead of polling.
#[derive(Debug, Default)]
pub struct Invalidation {
    scopes: std::collections::BTreeSet<String>,
}

impl Invalidation {
    pub fn student(&mut self, student_id: &str) -> &mut Self {
        self.scopes.insert(format!("registrations:{}", student_id));
        self.scopes.insert(format!("transcript:{}", student_id));
        self
    }

    pub fn template(&mut self, department_id: &str) -> &mut Self {
        self.scopes.insert(format!("template:{}", department_id));
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!(self.scopes)
    }
}
