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
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
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

fn request_ok(
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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn slot<'a>(grid: &'a serde_json::Value, id: &str) -> &'a serde_json::Value {
    grid.get("timeslots")
        .and_then(|v| v.as_array())
        .and_then(|a| a.iter().find(|s| s.get("id").and_then(|v| v.as_str()) == Some(id)))
        .unwrap_or_else(|| panic!("timeslot {} missing", id))
}

#[test]
fn preview_grid_fills_defaults_and_reports_mini_break() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "term.previewGrid",
        json!({ "config": { "term": "1-2567", "miniBreak": { "minutes": 10, "slot": 3 } } }),
    );
    let slots = grid.get("timeslots").and_then(|v| v.as_array()).expect("timeslots");
    assert_eq!(slots.len(), 40);
    assert_eq!(grid.pointer("/config/periodsPerDay").and_then(|v| v.as_u64()), Some(8));

    let mon1 = slot(&grid, "1-2567-MON1");
    assert_eq!(mon1.get("start").and_then(|v| v.as_str()), Some("08:30"));
    assert_eq!(mon1.get("end").and_then(|v| v.as_str()), Some("09:20"));
    assert_eq!(mon1.get("breakKind").and_then(|v| v.as_str()), Some("NOT_BREAK"));

    let mon3 = slot(&grid, "1-2567-MON3");
    assert_eq!(mon3.get("start").and_then(|v| v.as_str()), Some("10:20"));
    assert_eq!(
        slot(&grid, "1-2567-FRI4").get("breakKind").and_then(|v| v.as_str()),
        Some("BREAK_JUNIOR")
    );
    assert_eq!(
        slot(&grid, "1-2567-FRI5").get("breakKind").and_then(|v| v.as_str()),
        Some("BREAK_SENIOR")
    );
    assert_eq!(
        grid.pointer("/miniBreakWindow/start").and_then(|v| v.as_str()),
        Some("10:10")
    );
    assert_eq!(
        grid.pointer("/miniBreakWindow/end").and_then(|v| v.as_str()),
        Some("10:20")
    );

    let invalid = request(
        &mut stdin,
        &mut reader,
        "2",
        "term.previewGrid",
        json!({ "config": { "term": "1-2567", "periodsPerDay": 20 } }),
    );
    assert_eq!(error_code(&invalid), Some("config_invalid"));
    assert_eq!(
        invalid.pointer("/error/details/field").and_then(|v| v.as_str()),
        Some("periodsPerDay")
    );

    let same_period = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "term.previewGrid",
        json!({ "config": { "term": "1-2567", "juniorBreak": 5, "seniorBreak": 5 } }),
    );
    assert_eq!(
        slot(&same_period, "1-2567-TUE5").get("breakKind").and_then(|v| v.as_str()),
        Some("BREAK_BOTH")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn term_lifecycle_create_copy_delete() {
    let workspace = temp_dir("timetabled-term-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
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
        "term.create",
        json!({ "config": { "term": "1-2567", "periodsPerDay": 9, "startTime": "08:00" } }),
    );
    assert_eq!(created.get("timeslotCount").and_then(|v| v.as_u64()), Some(45));

    let again = request(
        &mut stdin,
        &mut reader,
        "3",
        "term.create",
        json!({ "config": { "term": "1-2567" } }),
    );
    assert_eq!(error_code(&again), Some("already_exists"));

    let stored = request_ok(&mut stdin, &mut reader, "4", "term.get", json!({ "term": "1-2567" }));
    assert_eq!(stored.pointer("/config/periodsPerDay").and_then(|v| v.as_u64()), Some(9));
    assert_eq!(
        slot(&stored, "1-2567-WED9").get("start").and_then(|v| v.as_str()),
        Some("14:40")
    );

    let copied = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "term.copyConfig",
        json!({ "from": "1-2567", "to": "2-2567" }),
    );
    assert_eq!(copied.get("timeslotCount").and_then(|v| v.as_u64()), Some(45));
    let second = request_ok(&mut stdin, &mut reader, "6", "term.get", json!({ "term": "2-2567" }));
    assert_eq!(
        slot(&second, "2-2567-MON1").get("start").and_then(|v| v.as_str()),
        Some("08:00")
    );

    let listed = request_ok(&mut stdin, &mut reader, "7", "term.list", json!({}));
    assert_eq!(
        listed.get("terms").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let deleted = request_ok(&mut stdin, &mut reader, "8", "term.delete", json!({ "term": "2-2567" }));
    assert_eq!(deleted.pointer("/deleted/timeslots").and_then(|v| v.as_u64()), Some(45));
    let gone = request(&mut stdin, &mut reader, "9", "term.get", json!({ "term": "2-2567" }));
    assert_eq!(error_code(&gone), Some("not_found"));

    let bad_term = request(&mut stdin, &mut reader, "10", "term.get", json!({ "term": "9-2567" }));
    assert_eq!(error_code(&bad_term), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn misspelled_config_and_foreign_resp_ids_are_refused() {
    let workspace = temp_dir("timetabled-term-refusals");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let misspelled = request(
        &mut stdin,
        &mut reader,
        "2",
        "term.create",
        json!({ "config": { "term": "1-2567", "periodPerDay": 9 } }),
    );
    assert_eq!(error_code(&misspelled), Some("bad_params"));
    let listed = request_ok(&mut stdin, &mut reader, "3", "term.list", json!({}));
    assert_eq!(
        listed.get("terms").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let _ = request_ok(&mut stdin, &mut reader, "4", "term.create", json!({ "config": { "term": "1-2567" } }));
    let _ = request_ok(&mut stdin, &mut reader, "5", "term.create", json!({ "config": { "term": "2-2567" } }));
    let catalog = |term: &str, subject: &str| {
        json!({
            "term": term,
            "responsibilities": [
                { "respId": 1, "subjectCode": subject, "teacherId": 1, "grade": "101", "periods": 2 }
            ]
        })
    };
    let _ = request_ok(&mut stdin, &mut reader, "6", "catalog.import", catalog("1-2567", "MATH"));

    let foreign = request(&mut stdin, &mut reader, "7", "catalog.import", catalog("2-2567", "SCI"));
    assert_eq!(error_code(&foreign), Some("bad_params"));
    assert_eq!(
        foreign.pointer("/error/details/term").and_then(|v| v.as_str()),
        Some("1-2567")
    );

    let first = request_ok(&mut stdin, &mut reader, "8", "catalog.get", json!({ "term": "1-2567" }));
    assert_eq!(
        first.pointer("/responsibilities/0/subjectCode").and_then(|v| v.as_str()),
        Some("MATH")
    );
    let second = request_ok(&mut stdin, &mut reader, "9", "catalog.get", json!({ "term": "2-2567" }));
    assert_eq!(
        second.get("responsibilities").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // Re-importing into the owning term replaces the row in place.
    let _ = request_ok(&mut stdin, &mut reader, "10", "catalog.import", catalog("1-2567", "ART"));
    let first = request_ok(&mut stdin, &mut reader, "11", "catalog.get", json!({ "term": "1-2567" }));
    assert_eq!(
        first.pointer("/responsibilities/0/subjectCode").and_then(|v| v.as_str()),
        Some("ART")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
