mod calc;
mod db;
mod error;
mod grading;
mod ipc;
mod reconcile;
mod transcript;
mod upload;

use std::io::{self, BufRead, Write};

fn main() {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // No id to echo back; the caller matches this by position.
            Err(e) => serde_json::json!({
                "ok": false,
                "error": { "code": "bad_json", "message": e.to_string() }
            }),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
