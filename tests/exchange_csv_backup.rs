use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_monitord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn monitord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn result_of(value: &serde_json::Value, method: &str) -> serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

#[test]
fn group_csv_export_flattens_roster_and_marks() {
    let workspace = temp_dir("monitord-exchange-csv");
    let csv_out = workspace.join("export").join("grades.csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "password": "teacherme" }),
    );
    let created = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "teachers.add",
            json!({ "name": "CSV Teacher" }),
        ),
        "teachers.add",
    );
    let teacher_id = created["teacherId"].as_str().expect("teacherId").to_string();

    let add_student = |stdin: &mut ChildStdin,
                       reader: &mut BufReader<ChildStdout>,
                       id: &str,
                       name: &str|
     -> String {
        let added = result_of(
            &request(
                stdin,
                reader,
                id,
                "students.add",
                json!({
                    "teacherId": teacher_id,
                    "name": name,
                    "proficiencyLevel": "Grades 5-6"
                }),
            ),
            "students.add",
        );
        added["student"]["id"].as_str().expect("id").to_string()
    };
    let marked = add_student(&mut stdin, &mut reader, "4", "Marked, Kid");
    let _unmarked = add_student(&mut stdin, &mut reader, "5", "Blank Kid");

    let group = json!({ "teacherId": teacher_id, "groupTitle": "Grades 5-6" });
    let _ = result_of(
        &request(&mut stdin, &mut reader, "6", "group.open", group.clone()),
        "group.open",
    );
    let mut set_date = group.clone();
    set_date["dateIdx"] = json!(0);
    set_date["value"] = json!("2024-01-10");
    let _ = result_of(
        &request(&mut stdin, &mut reader, "7", "group.setDate", set_date),
        "group.setDate",
    );
    for (id, value) in [("8", "done"), ("9", "late")] {
        let mut toggle = group.clone();
        toggle["studentId"] = json!(marked);
        toggle["dateIdx"] = json!(0);
        toggle["value"] = json!(value);
        let _ = result_of(
            &request(&mut stdin, &mut reader, id, "group.toggleGrade", toggle),
            "group.toggleGrade",
        );
    }

    let exported = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "10",
            "exchange.exportGroupCsv",
            json!({
                "teacherId": teacher_id,
                "groupTitle": "Grades 5-6",
                "outPath": csv_out.to_string_lossy()
            }),
        ),
        "exchange.exportGroupCsv",
    );
    assert_eq!(exported["rowsExported"], json!(2));

    let body = std::fs::read_to_string(&csv_out).expect("read csv");
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "student,2024-01-10,slot 2,slot 3");
    // Comma in the name forces quoting; both symbols share the cell.
    assert_eq!(lines[1], "\"Marked, Kid\",done late,,");
    assert_eq!(lines[2], "Blank Kid,,,");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workspace_bundle_restores_data_into_a_fresh_workspace() {
    let workspace_a = temp_dir("monitord-backup-src");
    let workspace_b = temp_dir("monitord-backup-dst");
    let bundle = workspace_a.join("transfer.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace_a.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "password": "teacherme" }),
    );
    let created = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "teachers.add",
            json!({ "name": "Bundled Teacher" }),
        ),
        "teachers.add",
    );
    let teacher_id = created["teacherId"].as_str().expect("teacherId").to_string();
    let group = json!({ "teacherId": teacher_id, "groupTitle": "Grades 5-6" });
    let _ = result_of(
        &request(&mut stdin, &mut reader, "4", "group.open", group.clone()),
        "group.open",
    );
    let mut notes = group.clone();
    notes["notes"] = json!("travels in the bundle");
    let _ = result_of(
        &request(&mut stdin, &mut reader, "5", "group.setNotes", notes),
        "group.setNotes",
    );
    let _ = result_of(
        &request(&mut stdin, &mut reader, "6", "group.close", group.clone()),
        "group.close",
    );

    let exported = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "7",
            "backup.exportWorkspaceBundle",
            json!({ "outPath": bundle.to_string_lossy() }),
        ),
        "backup.exportWorkspaceBundle",
    );
    assert_eq!(exported["bundleFormat"], json!("monitor-workspace-v1"));
    assert_eq!(exported["entryCount"], json!(3));

    // Import into a brand new workspace and read the data back.
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "workspace.select",
        json!({ "path": workspace_b.to_string_lossy() }),
    );
    let imported = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "9",
            "backup.importWorkspaceBundle",
            json!({ "inPath": bundle.to_string_lossy() }),
        ),
        "backup.importWorkspaceBundle",
    );
    assert_eq!(
        imported["bundleFormatDetected"],
        json!("monitor-workspace-v1")
    );

    let listed = result_of(
        &request(&mut stdin, &mut reader, "10", "teachers.list", json!({})),
        "teachers.list",
    );
    assert_eq!(listed["teachers"][0]["name"], json!("Bundled Teacher"));
    let reopened = result_of(
        &request(&mut stdin, &mut reader, "11", "group.open", group),
        "group.open",
    );
    assert_eq!(reopened.get("notes"), Some(&json!("travels in the bundle")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace_a);
    let _ = std::fs::remove_dir_all(workspace_b);
}
