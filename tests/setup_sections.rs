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
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
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

fn bad_patch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    section: &str,
    patch: serde_json::Value,
    expected_message: &str,
) {
    let value = request(
        stdin,
        reader,
        id,
        "setup.update",
        json!({ "section": section, "patch": patch }),
    );
    assert_eq!(value["ok"].as_bool(), Some(false), "patch accepted: {}", value);
    assert_eq!(value["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(value["error"]["message"].as_str(), Some(expected_message));
}

#[test]
fn defaults_are_served_until_a_patch_overrides_them() {
    let workspace = temp_dir("campus-setup-defaults");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let no_ws = request(&mut stdin, &mut reader, "1", "setup.get", json!({}));
    assert_eq!(no_ws["ok"].as_bool(), Some(false));
    assert_eq!(no_ws["error"]["code"].as_str(), Some("no_workspace"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fresh = request_ok(&mut stdin, &mut reader, "3", "setup.get", json!({}));
    assert_eq!(
        fresh["enrollment"],
        json!({
            "defaultAcademicYear": "2025/26",
            "maxSubjectsPerYear": 12,
            "requireProgramMatch": true
        })
    );
    assert_eq!(
        fresh["library"],
        json!({ "loanPeriodDays": 21, "maxActiveLoans": 5 })
    );
    assert_eq!(
        fresh["requests"],
        json!({ "autoCloseDays": 30, "requireResponseOnReject": true })
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({
            "section": "enrollment",
            "patch": { "defaultAcademicYear": "2026/27", "maxSubjectsPerYear": 6 }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "section": "library", "patch": { "loanPeriodDays": 30 } }),
    );

    let merged = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(
        merged["enrollment"]["defaultAcademicYear"].as_str(),
        Some("2026/27")
    );
    assert_eq!(merged["enrollment"]["maxSubjectsPerYear"].as_i64(), Some(6));
    // Untouched fields keep their defaults.
    assert_eq!(merged["enrollment"]["requireProgramMatch"].as_bool(), Some(true));
    assert_eq!(merged["library"]["loanPeriodDays"].as_i64(), Some(30));
    assert_eq!(merged["library"]["maxActiveLoans"].as_i64(), Some(5));

    // Saved values survive reopening the workspace.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reopened = request_ok(&mut stdin, &mut reader, "8", "setup.get", json!({}));
    assert_eq!(
        reopened["enrollment"]["defaultAcademicYear"].as_str(),
        Some("2026/27")
    );
    assert_eq!(reopened["library"]["loanPeriodDays"].as_i64(), Some(30));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn patches_are_validated_field_by_field() {
    let workspace = temp_dir("campus-setup-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_section = request(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "patch": { "loanPeriodDays": 10 } }),
    );
    assert_eq!(no_section["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(no_section["error"]["message"].as_str(), Some("missing section"));

    bad_patch(
        &mut stdin,
        &mut reader,
        "3",
        "grading",
        json!({ "passThreshold": 60 }),
        "unknown section",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "4",
        "library",
        json!({ "finePerDay": 5 }),
        "unknown library field: finePerDay",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "5",
        "library",
        json!({ "loanPeriodDays": 0 }),
        "loanPeriodDays must be in 1..=120",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "6",
        "library",
        json!({ "loanPeriodDays": 121 }),
        "loanPeriodDays must be in 1..=120",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "7",
        "library",
        json!({ "maxActiveLoans": 21 }),
        "maxActiveLoans must be in 1..=20",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "8",
        "requests",
        json!({ "autoCloseDays": 366 }),
        "autoCloseDays must be in 0..=365",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "9",
        "enrollment",
        json!({ "defaultAcademicYear": "  " }),
        "defaultAcademicYear must not be empty",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "10",
        "enrollment",
        json!({ "defaultAcademicYear": "x".repeat(17) }),
        "defaultAcademicYear length must be <= 16",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "11",
        "enrollment",
        json!({ "maxSubjectsPerYear": "12" }),
        "maxSubjectsPerYear must be integer",
    );
    bad_patch(
        &mut stdin,
        &mut reader,
        "12",
        "enrollment",
        json!({ "requireProgramMatch": "yes" }),
        "requireProgramMatch must be boolean",
    );

    let not_object = request(
        &mut stdin,
        &mut reader,
        "13",
        "setup.update",
        json!({ "section": "library", "patch": [1, 2, 3] }),
    );
    assert_eq!(not_object["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(
        not_object["error"]["message"].as_str(),
        Some("patch must be an object")
    );

    // Zero is the documented off switch for staleness marking.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "setup.update",
        json!({ "section": "requests", "patch": { "autoCloseDays": 0 } }),
    );

    // None of the rejected patches may have landed.
    let after = request_ok(&mut stdin, &mut reader, "15", "setup.get", json!({}));
    assert_eq!(after["library"]["loanPeriodDays"].as_i64(), Some(21));
    assert_eq!(after["library"]["maxActiveLoans"].as_i64(), Some(5));
    assert_eq!(
        after["enrollment"]["defaultAcademicYear"].as_str(),
        Some("2025/26")
    );
    assert_eq!(after["requests"]["autoCloseDays"].as_i64(), Some(0));

    let _ = std::fs::remove_dir_all(workspace);
}
