#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Error code of a failed response, asserting that it did fail.
pub fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "expected failure: {}",
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

pub fn five_point_bands() -> serde_json::Value {
    json!([
        { "grade": "A", "minScore": 70.0, "maxScore": 100.0, "point": 5.0 },
        { "grade": "B", "minScore": 60.0, "maxScore": 69.99, "point": 4.0 },
        { "grade": "C", "minScore": 50.0, "maxScore": 59.99, "point": 3.0 },
        { "grade": "D", "minScore": 45.0, "maxScore": 49.99, "point": 2.0 },
        { "grade": "E", "minScore": 40.0, "maxScore": 44.99, "point": 1.0 },
        { "grade": "F", "minScore": 0.0, "maxScore": 39.99, "point": 0.0 }
    ])
}

/// Two Computer Science students, one Physics student, and a handful of
/// courses. Returns `(jane_id, john_id, ada_id)`; Ada is in Physics.
pub fn seed_catalog(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, String, String) {
    let students = request_ok(
        stdin,
        reader,
        "seed-students",
        "students.upsert",
        json!({
            "students": [
                { "matricNo": "CSC/22/001", "fullName": "Jane Okafor", "departmentId": "csc" },
                { "matricNo": "CSC/22/002", "fullName": "John Bello", "departmentId": "csc" },
                { "matricNo": "PHY/22/001", "fullName": "Ada Musa", "departmentId": "phy" }
            ]
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-courses",
        "courses.upsert",
        json!({
            "courses": [
                { "code": "CSC101", "title": "Introduction to Computing", "creditUnits": 9 },
                { "code": "CSC102", "title": "Programming I", "creditUnits": 9 },
                { "code": "CSC201", "title": "Data Structures", "creditUnits": 15 },
                { "code": "MTH101", "title": "Calculus I", "creditUnits": 3 }
            ]
        }),
    );
    let id = |i: usize| {
        students
            .pointer(&format!("/students/{}/studentId", i))
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string()
    };
    (id(0), id(1), id(2))
}

pub fn course_id(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
) -> String {
    let list = request_ok(stdin, reader, "course-lookup", "courses.list", json!({}));
    list.get("courses")
        .and_then(|v| v.as_array())
        .and_then(|courses| {
            courses
                .iter()
                .find(|c| c.get("code").and_then(|v| v.as_str()) == Some(code))
        })
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string()
}
