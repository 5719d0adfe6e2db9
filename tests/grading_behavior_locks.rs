use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

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

fn preview(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    m1: f64,
    m2: f64,
    fe: f64,
    att: f64,
) -> serde_json::Value {
    let value = request(
        stdin,
        reader,
        id,
        "grades.preview",
        json!({
            "scores": { "midterm1": m1, "midterm2": m2, "finalExam": fe, "attendance": att }
        }),
    );
    assert_eq!(value["ok"].as_bool(), Some(true), "preview failed: {}", value);
    value["result"]["result"].clone()
}

// Previews need no workspace; the whole file runs against a bare sidecar.
#[test]
fn attendance_counts_only_after_exams_reach_the_threshold() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let at_gate = preview(&mut stdin, &mut reader, "1", 17.0, 17.0, 17.0, 10.0);
    assert_eq!(at_gate["examPoints"].as_f64(), Some(51.0));
    assert_eq!(at_gate["attendanceBonus"].as_f64(), Some(10.0));
    assert_eq!(at_gate["totalPoints"].as_f64(), Some(61.0));
    assert_eq!(at_gate["passed"].as_bool(), Some(true));
    assert_eq!(at_gate["grade"].as_i64(), Some(7));

    // 50.5 exam points: perfect attendance cannot rescue the attempt.
    let below = preview(&mut stdin, &mut reader, "2", 17.0, 16.5, 17.0, 10.0);
    assert_eq!(below["examPoints"].as_f64(), Some(50.5));
    assert_eq!(below["attendanceBonus"].as_f64(), Some(0.0));
    assert_eq!(below["totalPoints"].as_f64(), Some(50.5));
    assert_eq!(below["passed"].as_bool(), Some(false));
    assert_eq!(below["grade"].as_i64(), Some(5));
}

#[test]
fn grade_bands_have_inclusive_upper_bounds() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let cases: [(f64, f64, f64, f64, f64, i64); 7] = [
        (17.0, 17.0, 17.0, 0.0, 51.0, 6),
        (17.0, 17.0, 17.0, 9.0, 60.0, 6),
        (17.0, 17.0, 17.0, 10.0, 61.0, 7),
        (30.0, 30.0, 10.0, 0.0, 70.0, 7),
        (30.0, 30.0, 20.0, 0.0, 80.0, 8),
        (30.0, 30.0, 30.0, 0.0, 90.0, 9),
        (30.0, 30.0, 30.0, 10.0, 100.0, 10),
    ];
    for (i, (m1, m2, fe, att, expected_total, expected_grade)) in cases.into_iter().enumerate() {
        let id = format!("band-{}", i);
        let result = preview(&mut stdin, &mut reader, &id, m1, m2, fe, att);
        assert_eq!(result["totalPoints"].as_f64(), Some(expected_total));
        assert_eq!(
            result["grade"].as_i64(),
            Some(expected_grade),
            "total {} should map to grade {}",
            expected_total,
            expected_grade
        );
        assert_eq!(result["passed"].as_bool(), Some(true));
    }

    // A fractional total between bands rounds nowhere; it takes the next band up.
    let between = preview(&mut stdin, &mut reader, "between", 20.5, 20.0, 20.0, 0.0);
    assert_eq!(between["totalPoints"].as_f64(), Some(60.5));
    assert_eq!(between["grade"].as_i64(), Some(7));
}

#[test]
fn out_of_range_scores_are_rejected_not_clamped() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let over = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.preview",
        json!({
            "scores": { "midterm1": 30.5, "midterm2": 0, "finalExam": 0, "attendance": 0 }
        }),
    );
    assert_eq!(over["ok"].as_bool(), Some(false));
    assert_eq!(over["error"]["code"].as_str(), Some("invalid_score"));
    assert_eq!(over["error"]["details"]["field"].as_str(), Some("midterm1"));
    assert_eq!(over["error"]["details"]["max"].as_f64(), Some(30.0));

    let negative = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.preview",
        json!({
            "scores": { "midterm1": 0, "midterm2": -1, "finalExam": 0, "attendance": 0 }
        }),
    );
    assert_eq!(negative["ok"].as_bool(), Some(false));
    assert_eq!(negative["error"]["code"].as_str(), Some("invalid_score"));
    assert_eq!(
        negative["error"]["details"]["field"].as_str(),
        Some("midterm2")
    );

    let attendance = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.preview",
        json!({
            "scores": { "midterm1": 0, "midterm2": 0, "finalExam": 0, "attendance": 10.1 }
        }),
    );
    assert_eq!(attendance["ok"].as_bool(), Some(false));
    assert_eq!(attendance["error"]["code"].as_str(), Some("invalid_score"));
}

#[test]
fn missing_and_malformed_scores_are_distinct_errors() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let absent = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.preview",
        json!({
            "scores": { "midterm1": 20, "midterm2": 20, "attendance": 5 }
        }),
    );
    assert_eq!(absent["ok"].as_bool(), Some(false));
    assert_eq!(absent["error"]["code"].as_str(), Some("missing_score"));
    assert_eq!(
        absent["error"]["details"]["field"].as_str(),
        Some("finalExam")
    );

    // Explicit null is missing, not zero.
    let null_field = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.preview",
        json!({
            "scores": { "midterm1": 20, "midterm2": 20, "finalExam": null, "attendance": 5 }
        }),
    );
    assert_eq!(null_field["ok"].as_bool(), Some(false));
    assert_eq!(null_field["error"]["code"].as_str(), Some("missing_score"));

    let non_numeric = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.preview",
        json!({
            "scores": { "midterm1": "twenty", "midterm2": 20, "finalExam": 20, "attendance": 5 }
        }),
    );
    assert_eq!(non_numeric["ok"].as_bool(), Some(false));
    assert_eq!(non_numeric["error"]["code"].as_str(), Some("invalid_score"));

    let no_scores = request(&mut stdin, &mut reader, "4", "grades.preview", json!({}));
    assert_eq!(no_scores["ok"].as_bool(), Some(false));
    assert_eq!(no_scores["error"]["code"].as_str(), Some("bad_params"));
}
