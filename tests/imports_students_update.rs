mod test_support;

use serde_json::json;
use std::fs;
use test_support::{request_err, request_ok, spawn_sidecar, temp_workspace};

const STUDENTS: &str = "\
admission_no,first_name,last_name,gender,date_of_birth,class_name
STU001,Amani,Otieno,male,21/04/2015,G1A
STU002,Wanjiru,Mwangi,female,2015-09-02,Grade 1 A
";

#[test]
fn exported_students_reimport_as_no_ops_and_class_moves_are_diffed() {
    let workspace = temp_workspace();
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 1 A", "code": "G1A", "level": "Grade 1", "stream": "A" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Grade 2 A", "code": "G2A", "level": "Grade 2", "stream": "A" }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "imports.open",
        json!({ "entityType": "students", "mode": "create" }),
    );
    let csv_path = workspace.path().join("incoming").join("students.csv");
    fs::create_dir_all(csv_path.parent().expect("parent")).expect("mkdir");
    fs::write(&csv_path, STUDENTS).expect("write csv");
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "imports.load",
        json!({ "inPath": csv_path.to_string_lossy() }),
    );
    assert_eq!(preview["source"]["name"], "students.csv");
    assert_eq!(preview["errorCount"], 0);
    let done = request_ok(&mut stdin, &mut reader, "6", "imports.execute", json!({}));
    assert_eq!(done["session"]["outcome"]["created"], 2);

    let export_path = workspace.path().join("exports").join("students.csv");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "imports.export",
        json!({ "entityType": "students", "outPath": export_path.to_string_lossy() }),
    );
    assert_eq!(exported["fileName"], "students_export.csv");
    let export_text = fs::read_to_string(&export_path).expect("read export");
    assert!(export_text.starts_with("admission_no,"));
    assert!(export_text.contains("2015-04-21"));
    assert!(export_text.contains("Grade 1 A"));

    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "imports.open",
        json!({ "entityType": "students", "mode": "update" }),
    );
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "imports.load",
        json!({ "inPath": export_path.to_string_lossy() }),
    );
    assert_eq!(preview["errorCount"], 0);
    assert_eq!(preview["changes"].as_array().map(Vec::len), Some(0));
    assert_eq!(preview["unchanged"].as_array().map(Vec::len), Some(2));
    assert_eq!(preview["canExecute"], false);
    let (code, _) = request_err(&mut stdin, &mut reader, "10", "imports.execute", json!({}));
    assert_eq!(code, "nothing_to_apply");

    request_ok(&mut stdin, &mut reader, "11", "imports.discard", json!({}));
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "imports.load",
        json!({ "text": "admission_no,class_name\nSTU002,g2a\n" }),
    );
    assert_eq!(preview["errorCount"], 0);
    let changes = preview["changes"].as_array().expect("changes");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["businessKey"], "STU002");
    assert_eq!(changes[0]["field"], "class");
    assert_eq!(changes[0]["oldValue"], "Grade 1 A");
    assert_eq!(preview["pendingUnits"], 1);

    let done = request_ok(&mut stdin, &mut reader, "13", "imports.execute", json!({}));
    assert_eq!(done["session"]["outcome"]["updated"], 1);
    assert_eq!(done["session"]["outcome"]["created"], 0);

    let classes = request_ok(&mut stdin, &mut reader, "14", "classes.list", json!({}));
    let counts = classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .map(|c| (c["code"].as_str().unwrap_or_default().to_string(), c["studentCount"].as_i64()))
        .collect::<Vec<_>>();
    assert!(counts.contains(&("G1A".to_string(), Some(1))));
    assert!(counts.contains(&("G2A".to_string(), Some(1))));

    let history = request_ok(&mut stdin, &mut reader, "15", "imports.history", json!({}));
    let runs = history["runs"].as_array().expect("runs");
    assert_eq!(runs.len(), 2);
}

#[test]
fn update_with_unknown_key_is_reported_per_row() {
    let workspace = temp_workspace();
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "imports.open",
        json!({ "entityType": "students", "mode": "update" }),
    );
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "imports.load",
        json!({ "text": "admission_no,first_name\nSTU404,Ghost\n" }),
    );
    assert_eq!(preview["errorCount"], 1);
    assert_eq!(preview["errors"][0]["row"], 2);
    assert_eq!(preview["errors"][0]["message"], "Admission No. 'STU404' not found");
}
