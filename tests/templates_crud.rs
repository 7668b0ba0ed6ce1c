mod test_support;

use serde_json::json;
use test_support::{error_code, five_point_bands, request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn template_lifecycle_enforces_one_per_department() {
    let workspace = temp_dir("resultd-templates-crud");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "templates.create",
        json!({ "name": "Five point", "departmentId": "csc", "gradeBands": five_point_bands() }),
    );
    let template_id = created
        .get("templateId")
        .and_then(|v| v.as_str())
        .expect("templateId")
        .to_string();
    assert_eq!(created.get("invalidates"), Some(&json!(["template:csc"])));

    let second = request(
        &mut stdin,
        &mut reader,
        "3",
        "templates.create",
        json!({ "name": "Another", "departmentId": "csc", "gradeBands": five_point_bands() }),
    );
    assert_eq!(error_code(&second), "template_exists");

    let by_dept = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "templates.get",
        json!({ "departmentId": "csc" }),
    );
    assert_eq!(
        by_dept.pointer("/template/id").and_then(|v| v.as_str()),
        Some(template_id.as_str())
    );
    assert_eq!(
        by_dept
            .pointer("/template/gradeBands")
            .and_then(|v| v.as_array())
            .map(|b| b.len()),
        Some(6)
    );
    assert_eq!(
        by_dept.pointer("/template/gradeBands/0/grade").and_then(|v| v.as_str()),
        Some("A")
    );

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "templates.evaluate",
        json!({ "departmentId": "csc", "score": 64.5 }),
    );
    assert_eq!(graded.get("grade").and_then(|v| v.as_str()), Some("B"));
    assert_eq!(graded.get("point").and_then(|v| v.as_f64()), Some(4.0));
    assert_eq!(graded.get("maxPoint").and_then(|v| v.as_f64()), Some(5.0));

    let outside = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "templates.evaluate",
        json!({ "departmentId": "csc", "score": 104.0 }),
    );
    assert_eq!(outside.get("classified").and_then(|v| v.as_bool()), Some(false));
    assert!(outside.get("grade").map(|v| v.is_null()).unwrap_or(false));

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "templates.evaluate",
        json!({ "departmentId": "phy", "score": 50.0 }),
    );
    assert_eq!(error_code(&missing), "template_not_found");
    assert_eq!(
        missing.pointer("/error/details/departmentId").and_then(|v| v.as_str()),
        Some("phy")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "templates.update",
        json!({
            "templateId": template_id,
            "patch": {
                "name": "Pass/fail",
                "gradeBands": [
                    { "grade": "P", "minScore": 40.0, "maxScore": 100.0, "point": 1.0 },
                    { "grade": "F", "minScore": 0.0, "maxScore": 39.99, "point": 0.0 }
                ]
            }
        }),
    );
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "templates.get",
        json!({ "templateId": template_id }),
    );
    assert_eq!(updated.pointer("/template/name").and_then(|v| v.as_str()), Some("Pass/fail"));
    assert_eq!(
        updated
            .pointer("/template/gradeBands")
            .and_then(|v| v.as_array())
            .map(|b| b.len()),
        Some(2)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "templates.delete",
        json!({ "templateId": template_id }),
    );
    let list = request_ok(&mut stdin, &mut reader, "11", "templates.list", json!({}));
    assert_eq!(list.get("templates"), Some(&json!([])));
    let gone = request(
        &mut stdin,
        &mut reader,
        "12",
        "templates.get",
        json!({ "templateId": template_id }),
    );
    assert_eq!(error_code(&gone), "not_found");
}

#[test]
fn invalid_bands_are_itemized_and_never_stored() {
    let workspace = temp_dir("resultd-templates-invalid");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bands = json!([
        { "grade": "A", "minScore": 70.0, "maxScore": 100.0, "point": 5.0 },
        { "grade": "B", "minScore": 60.0, "maxScore": 70.0, "point": 4.0 },
        { "grade": "C", "minScore": 59.0, "maxScore": 50.0, "point": 3.0 },
        { "grade": "X", "minScore": 0.0, "maxScore": 10.0, "point": -1.0 }
    ]);
    let checked = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "templates.validate",
        json!({ "gradeBands": bands }),
    );
    assert_eq!(checked.get("valid").and_then(|v| v.as_bool()), Some(false));
    let codes: Vec<&str> = checked
        .get("issues")
        .and_then(|v| v.as_array())
        .expect("issues")
        .iter()
        .filter_map(|i| i.get("code").and_then(|v| v.as_str()))
        .collect();
    assert!(codes.contains(&"overlap"), "{:?}", codes);
    assert!(codes.contains(&"inverted_range"), "{:?}", codes);
    assert!(codes.contains(&"negative_point"), "{:?}", codes);

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "templates.create",
        json!({ "name": "Broken", "departmentId": "csc", "gradeBands": bands }),
    );
    assert_eq!(error_code(&refused), "invalid_template");
    assert!(refused
        .pointer("/error/details/issues")
        .and_then(|v| v.as_array())
        .map(|i| !i.is_empty())
        .unwrap_or(false));

    let list = request_ok(&mut stdin, &mut reader, "4", "templates.list", json!({}));
    assert_eq!(list.get("templates"), Some(&json!([])));

    let clean = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "templates.validate",
        json!({ "gradeBands": five_point_bands() }),
    );
    assert_eq!(clean.get("valid").and_then(|v| v.as_bool()), Some(true));
}
