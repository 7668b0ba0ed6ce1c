mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, seed_catalog, spawn_sidecar, temp_dir};

fn count(v: &serde_json::Value, key: &str) -> u64 {
    v.get(key).and_then(|v| v.as_u64()).unwrap_or(u64::MAX)
}

#[test]
fn known_rows_register_and_unknown_students_are_itemized() {
    let workspace = temp_dir("resultd-reg-upload");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (jane, john, _) = seed_catalog(&mut stdin, &mut reader);

    let text = "matricNo,courses\n\
                CSC/22/001,CSC101;CSC102\n\
                UNKNOWN/99/999,CSC101\n\
                CSC/22/002,BIO999;CHM111\n\
                CSC/22/002,MTH101;BIO999\n";
    let out = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registrations.bulkUpload",
        json!({ "text": text, "semester": "First", "session": "2022/2023" }),
    );
    assert_eq!(count(&out, "rowsTotal"), 4);
    assert_eq!(count(&out, "accepted"), 2);
    assert_eq!(count(&out, "rejected"), 2);
    assert_eq!(count(&out, "registrationsCreated"), 3);
    assert_eq!(
        out.pointer("/rejections/0/reason").and_then(|v| v.as_str()),
        Some("student_not_found")
    );
    assert_eq!(out.pointer("/rejections/0/line").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(
        out.pointer("/rejections/1/reason").and_then(|v| v.as_str()),
        Some("no_resolvable_courses")
    );
    let invalidates = out.get("invalidates").and_then(|v| v.as_array()).expect("invalidates");
    assert!(invalidates.contains(&json!(format!("transcript:{}", jane))));
    assert!(invalidates.contains(&json!(format!("registrations:{}", john))));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registrations.list",
        json!({ "studentId": jane }),
    );
    let regs = listed
        .get("registrations")
        .and_then(|v| v.as_array())
        .expect("registrations");
    assert_eq!(regs.len(), 2);
    assert!(regs.iter().all(|r| r.get("score").map(|s| s.is_null()).unwrap_or(false)));
    assert!(regs
        .iter()
        .all(|r| r.get("status").and_then(|v| v.as_str()) == Some("registered")));
    assert_eq!(regs[0].get("creditUnits").and_then(|v| v.as_u64()), Some(9));
}

#[test]
fn repeated_uploads_never_duplicate_a_registration() {
    let workspace = temp_dir("resultd-reg-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (jane, _, _) = seed_catalog(&mut stdin, &mut reader);

    let text = "matricNo,courses\nCSC/22/001,CSC101;CSC101\nCSC/22/001,CSC101\n";
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registrations.bulkUpload",
        json!({ "text": text, "semester": "First", "session": "2022/2023" }),
    );
    assert_eq!(count(&first, "registrationsCreated"), 1);
    assert_eq!(count(&first, "duplicates"), 2);

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registrations.bulkUpload",
        json!({ "text": text, "semester": "First", "session": "2022/2023" }),
    );
    assert_eq!(count(&again, "registrationsCreated"), 0);
    assert_eq!(count(&again, "accepted"), 2);
    assert_eq!(count(&again, "duplicates"), 3);
    assert_eq!(again.get("invalidates"), Some(&json!([])));

    // Same course in another semester is a distinct key.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "registrations.bulkUpload",
        json!({ "text": text, "semester": "Second", "session": "2022/2023" }),
    );
    assert_eq!(count(&second, "registrationsCreated"), 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "registrations.list",
        json!({ "studentId": jane }),
    );
    assert_eq!(
        listed.get("registrations").and_then(|v| v.as_array()).map(|r| r.len()),
        Some(2)
    );
}

#[test]
fn upload_defaults_supply_missing_semester_and_session() {
    let workspace = temp_dir("resultd-reg-defaults");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = seed_catalog(&mut stdin, &mut reader);

    let text = "matricNo,courses\nCSC/22/001,MTH101\n";
    let without = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registrations.bulkUpload",
        json!({ "text": text }),
    );
    assert_eq!(count(&without, "registrationsCreated"), 0);
    assert_eq!(
        without.pointer("/rejections/0/reason").and_then(|v| v.as_str()),
        Some("malformed_row")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "upload", "patch": { "defaultSemester": "second", "defaultSession": "2023/2024" } }),
    );
    let with = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "registrations.bulkUpload",
        json!({ "text": text }),
    );
    assert_eq!(count(&with, "registrationsCreated"), 1);
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "registrations.list",
        json!({ "semester": "Second", "session": "2023/2024" }),
    );
    assert_eq!(
        listed.pointer("/registrations/0/courseCode").and_then(|v| v.as_str()),
        Some("MTH101")
    );

    let headerless = request_ok(
        &mut stdin,
        &mut reader,
        "6a",
        "registrations.bulkUpload",
        json!({
            "text": "CSC/22/002,MTH101;CSC102\n",
            "semester": "First",
            "session": "2023/2024",
            "hasHeader": false
        }),
    );
    assert_eq!(count(&headerless, "rowsTotal"), 1);
    assert_eq!(count(&headerless, "registrationsCreated"), 2);

    let empty = request(
        &mut stdin,
        &mut reader,
        "6",
        "registrations.bulkUpload",
        json!({ "text": "   \n" }),
    );
    assert_eq!(error_code(&empty), "bad_params");
}
