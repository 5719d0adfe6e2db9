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

#[test]
fn subject_codes_semesters_and_syllabus_replacement() {
    let workspace = temp_dir("campus-subject-syllabus");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let faculty = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "faculties.create",
        json!({ "name": "Faculty of Philosophy" }),
    );
    let faculty_id = faculty["facultyId"].as_str().expect("facultyId").to_string();
    let program = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "programs.create",
        json!({
            "facultyId": faculty_id,
            "name": "Psychology",
            "degree": "master",
            "durationSemesters": 4
        }),
    );
    let program_id = program["programId"].as_str().expect("programId").to_string();

    let beyond = request(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "PSY501",
            "name": "Late Subject",
            "ects": 5,
            "semester": 5
        }),
    );
    assert_eq!(beyond["ok"].as_bool(), Some(false));
    assert_eq!(beyond["error"]["code"].as_str(), Some("bad_params"));

    let bad_ects = request(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "PSY100",
            "name": "Zero Credit",
            "ects": 0,
            "semester": 1
        }),
    );
    assert_eq!(bad_ects["ok"].as_bool(), Some(false));
    assert_eq!(bad_ects["error"]["code"].as_str(), Some("bad_params"));

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "PSY101",
            "name": "Cognition",
            "ects": 6,
            "semester": 1
        }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "PSY101",
            "name": "Cognition Again",
            "ects": 6,
            "semester": 2
        }),
    );
    assert_eq!(duplicate["ok"].as_bool(), Some(false));
    assert_eq!(duplicate["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(duplicate["error"]["details"]["code"].as_str(), Some("PSY101"));

    let written = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "syllabus.update",
        json!({
            "subjectId": subject_id,
            "sections": [
                { "title": "Perception", "body": "Weeks 1-3" },
                { "title": "Memory" },
                { "title": "Language", "body": "Weeks 8-12" }
            ]
        }),
    );
    assert_eq!(written["sectionCount"].as_i64(), Some(3));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "syllabus.get",
        json!({ "subjectId": subject_id }),
    );
    let sections = fetched["sections"].as_array().expect("sections");
    assert_eq!(sections.len(), 3);
    assert_eq!(sections[0]["position"].as_i64(), Some(0));
    assert_eq!(sections[0]["title"].as_str(), Some("Perception"));
    assert_eq!(sections[1]["title"].as_str(), Some("Memory"));
    // An omitted body is stored as empty text.
    assert_eq!(sections[1]["body"].as_str(), Some(""));
    assert_eq!(sections[2]["position"].as_i64(), Some(2));

    // A rejected payload leaves the stored syllabus untouched.
    let invalid = request(
        &mut stdin,
        &mut reader,
        "10",
        "syllabus.update",
        json!({
            "subjectId": subject_id,
            "sections": [{ "title": "" }]
        }),
    );
    assert_eq!(invalid["ok"].as_bool(), Some(false));
    assert_eq!(invalid["error"]["code"].as_str(), Some("bad_params"));
    let unchanged = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "syllabus.get",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(unchanged["sections"].as_array().map(|a| a.len()), Some(3));

    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "syllabus.update",
        json!({
            "subjectId": subject_id,
            "sections": [{ "title": "Condensed plan", "body": "Everything at once" }]
        }),
    );
    assert_eq!(replaced["sectionCount"].as_i64(), Some(1));
    let condensed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "syllabus.get",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(condensed["sections"].as_array().map(|a| a.len()), Some(1));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "14",
        "syllabus.get",
        json!({ "subjectId": "missing-subject" }),
    );
    assert_eq!(unknown["ok"].as_bool(), Some(false));
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_found"));

    let methods = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "PSY201",
            "name": "Research Methods",
            "ects": 5,
            "semester": 2
        }),
    );
    let methods_id = methods["subjectId"].as_str().expect("subjectId").to_string();

    let code_taken = request(
        &mut stdin,
        &mut reader,
        "16",
        "subjects.update",
        json!({ "subjectId": methods_id, "patch": { "code": "PSY101" } }),
    );
    assert_eq!(code_taken["ok"].as_bool(), Some(false));
    assert_eq!(code_taken["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(code_taken["error"]["details"]["code"].as_str(), Some("PSY101"));

    let too_late = request(
        &mut stdin,
        &mut reader,
        "17",
        "subjects.update",
        json!({ "subjectId": methods_id, "patch": { "semester": 5 } }),
    );
    assert_eq!(too_late["ok"].as_bool(), Some(false));
    assert_eq!(too_late["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(
        too_late["error"]["message"].as_str(),
        Some("semester must be in 1..=4 for this program")
    );

    let empty_patch = request(
        &mut stdin,
        &mut reader,
        "18",
        "subjects.update",
        json!({ "subjectId": methods_id, "patch": {} }),
    );
    assert_eq!(empty_patch["ok"].as_bool(), Some(false));
    assert_eq!(empty_patch["error"]["code"].as_str(), Some("bad_params"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "subjects.update",
        json!({
            "subjectId": methods_id,
            "patch": { "name": "Qualitative Methods", "ects": 4, "semester": 3 }
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "subjects.list",
        json!({ "programId": program_id }),
    );
    let rows = listed["subjects"].as_array().expect("subjects");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["code"].as_str(), Some("PSY201"));
    assert_eq!(rows[1]["name"].as_str(), Some("Qualitative Methods"));
    assert_eq!(rows[1]["ects"].as_i64(), Some(4));
    assert_eq!(rows[1]["semester"].as_i64(), Some(3));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_subject_cascades_through_enrollment_records() {
    let workspace = temp_dir("campus-subject-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let faculty = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "faculties.create",
        json!({ "name": "Faculty of Chemistry" }),
    );
    let faculty_id = faculty["facultyId"].as_str().expect("facultyId").to_string();
    let program = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "programs.create",
        json!({
            "facultyId": faculty_id,
            "name": "Biochemistry",
            "degree": "bachelor",
            "durationSemesters": 8
        }),
    );
    let program_id = program["programId"].as_str().expect("programId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "BCH102",
            "name": "Organic Chemistry",
            "ects": 8,
            "semester": 2
        }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "programId": program_id,
            "indexNo": "BCH 7/2023",
            "firstName": "Milan",
            "lastName": "Savic",
            "enrollmentYear": 2023
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "syllabus.update",
        json!({
            "subjectId": subject_id,
            "sections": [{ "title": "Alkanes", "body": "Weeks 1-4" }]
        }),
    );
    let enrollment = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "enrollments.create",
        json!({ "studentId": student_id, "subjectId": subject_id }),
    );
    let registration = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "examRegistrations.create",
        json!({
            "enrollmentId": enrollment["enrollmentId"].as_str().expect("enrollmentId"),
            "examPeriod": "june"
        }),
    );
    let registration_id = registration["registrationId"]
        .as_str()
        .expect("registrationId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.submit",
        json!({
            "registrationId": registration_id,
            "scores": { "midterm1": 20, "midterm2": 20, "finalExam": 20, "attendance": 5 }
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );

    let enrollments = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "enrollments.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(enrollments["enrollments"].as_array().map(|a| a.len()), Some(0));

    let grade = request(
        &mut stdin,
        &mut reader,
        "12",
        "grades.get",
        json!({ "registrationId": registration_id }),
    );
    assert_eq!(grade["ok"].as_bool(), Some(false));
    assert_eq!(grade["error"]["code"].as_str(), Some("not_found"));

    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "subjects.list",
        json!({ "programId": program_id }),
    );
    assert_eq!(subjects["subjects"].as_array().map(|a| a.len()), Some(0));

    // The program is empty again, so its delete goes through.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "programs.delete",
        json!({ "programId": program_id }),
    );

    let _ = std::fs::remove_dir_all(workspace);
}
