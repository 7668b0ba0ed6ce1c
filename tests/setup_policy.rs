mod test_support;

use serde_json::json;
use test_support::{
    course_id, error_code, five_point_bands, request, request_ok, seed_catalog, spawn_sidecar,
    temp_dir,
};

#[test]
fn grading_defaults_and_validation() {
    let workspace = temp_dir("resultd-setup-defaults");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let initial = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        initial.pointer("/grading/countUnclassifiedCredits").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        initial.pointer("/grading/missingTemplate").and_then(|v| v.as_str()),
        Some("block")
    );
    assert_eq!(
        initial.pointer("/grading/transcriptWorkers").and_then(|v| v.as_i64()),
        Some(4)
    );
    assert_eq!(
        initial.pointer("/grading/classificationBands/0/label").and_then(|v| v.as_str()),
        Some("Distinction")
    );
    assert!(initial
        .pointer("/upload/defaultSession")
        .map(|v| v.is_null())
        .unwrap_or(false));

    for (i, patch) in [
        json!({ "missingTemplate": "ignore" }),
        json!({ "transcriptWorkers": 64 }),
        json!({ "countUnclassifiedCredits": "yes" }),
        json!({ "unknownField": 1 }),
        json!({ "classificationBands": [] }),
    ]
    .into_iter()
    .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "setup.update",
            json!({ "section": "grading", "patch": patch }),
        );
        assert_eq!(error_code(&resp), "bad_params", "{}", patch);
    }

    let unknown = request(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "printer", "patch": {} }),
    );
    assert_eq!(error_code(&unknown), "bad_params");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "grading", "patch": { "transcriptWorkers": 2 } }),
    );
    assert_eq!(updated.get("invalidates"), Some(&json!(["transcript:*"])));

    // Settings survive a daemon restart.
    drop(stdin);
    let (_child2, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reloaded = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(
        reloaded.pointer("/grading/transcriptWorkers").and_then(|v| v.as_i64()),
        Some(2)
    );
}

#[test]
fn unclassified_credit_flag_and_custom_classification_apply() {
    let workspace = temp_dir("resultd-setup-policy");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (jane, _, _) = seed_catalog(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "templates.create",
        json!({ "name": "Five point", "departmentId": "csc", "gradeBands": five_point_bands() }),
    );

    let csc101 = course_id(&mut stdin, &mut reader, "CSC101");
    let mth101 = course_id(&mut stdin, &mut reader, "MTH101");
    for (i, (course, score)) in [(csc101, 72.0), (mth101, 120.0)].into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("rec{}", i),
            "results.record",
            json!({
                "studentId": jane,
                "courseId": course,
                "semester": "First",
                "session": "2022/2023",
                "score": score
            }),
        );
    }
    let semester = json!({ "studentId": jane, "semester": "First", "session": "2022/2023" });

    // 120 matches no band: counted by default, so 45 / 12.
    let counted = request_ok(&mut stdin, &mut reader, "3", "results.semester", semester.clone());
    assert_eq!(counted.pointer("/summary/tcu").and_then(|v| v.as_u64()), Some(12));
    assert_eq!(counted.pointer("/summary/tgp").and_then(|v| v.as_f64()), Some(45.0));
    assert_eq!(counted.pointer("/summary/gpa").and_then(|v| v.as_f64()), Some(3.75));
    assert_eq!(
        counted.pointer("/summary/remark").and_then(|v| v.as_str()),
        Some("Very Good")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "grading", "patch": { "countUnclassifiedCredits": false } }),
    );
    let excluded = request_ok(&mut stdin, &mut reader, "5", "results.semester", semester.clone());
    assert_eq!(excluded.pointer("/summary/tcu").and_then(|v| v.as_u64()), Some(9));
    assert_eq!(excluded.pointer("/summary/gpa").and_then(|v| v.as_f64()), Some(5.0));
    assert_eq!(
        excluded.pointer("/summary/remark").and_then(|v| v.as_str()),
        Some("Distinction")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({
            "section": "grading",
            "patch": {
                "classificationBands": [
                    { "label": "First Class", "minGpa": 4.5, "maxGpa": 5.0 },
                    { "label": "Other", "minGpa": 0.0, "maxGpa": 4.49 }
                ]
            }
        }),
    );
    let relabelled = request_ok(&mut stdin, &mut reader, "7", "results.semester", semester);
    assert_eq!(
        relabelled.pointer("/summary/remark").and_then(|v| v.as_str()),
        Some("First Class")
    );
}
