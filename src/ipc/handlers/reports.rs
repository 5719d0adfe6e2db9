use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_student_transcript(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let header = match conn
        .query_row(
            "SELECT s.index_no, s.first_name, s.last_name, s.enrollment_year,
                    p.name, p.degree, f.name
             FROM students s
             JOIN study_programs p ON p.id = s.study_program_id
             JOIN faculties f ON f.id = p.faculty_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                let index_no: String = r.get(0)?;
                let first_name: String = r.get(1)?;
                let last_name: String = r.get(2)?;
                let enrollment_year: i64 = r.get(3)?;
                let program: String = r.get(4)?;
                let degree: String = r.get(5)?;
                let faculty: String = r.get(6)?;
                Ok(json!({
                    "indexNo": index_no,
                    "firstName": first_name,
                    "lastName": last_name,
                    "enrollmentYear": enrollment_year,
                    "program": program,
                    "degree": degree,
                    "faculty": faculty
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           sub.code,
           sub.name,
           sub.ects,
           sub.semester,
           e.academic_year,
           (SELECT g.grade FROM grades g
              JOIN exam_registrations r ON r.id = g.registration_id
              WHERE r.enrollment_id = e.id AND g.passed = 1
              ORDER BY g.grade DESC LIMIT 1) AS passed_grade,
           (SELECT COUNT(*) FROM exam_registrations r WHERE r.enrollment_id = e.id) AS attempts
         FROM enrollments e
         JOIN subjects sub ON sub.id = e.subject_id
         WHERE e.student_id = ?
         ORDER BY e.academic_year, sub.semester, sub.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id], |row| {
            let code: String = row.get(0)?;
            let name: String = row.get(1)?;
            let ects: i64 = row.get(2)?;
            let semester: i64 = row.get(3)?;
            let academic_year: String = row.get(4)?;
            let passed_grade: Option<i64> = row.get(5)?;
            let attempts: i64 = row.get(6)?;
            Ok((code, name, ects, semester, academic_year, passed_grade, attempts))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut entries = Vec::with_capacity(rows.len());
    let mut passed_grades: Vec<u8> = Vec::new();
    let mut earned_ects: i64 = 0;
    for (code, name, ects, semester, academic_year, passed_grade, attempts) in rows {
        if let Some(g) = passed_grade {
            passed_grades.push(g as u8);
            earned_ects += ects;
        }
        entries.push(json!({
            "code": code,
            "subject": name,
            "ects": ects,
            "semester": semester,
            "academicYear": academic_year,
            "grade": passed_grade,
            "passed": passed_grade.is_some(),
            "attempts": attempts
        }));
    }

    let gpa = grading::grade_point_average(passed_grades.iter().copied());

    ok(
        &req.id,
        json!({
            "student": header,
            "entries": entries,
            "summary": {
                "enrolledSubjects": entries.len(),
                "passedSubjects": passed_grades.len(),
                "earnedEcts": earned_ects,
                "gpa": gpa
            }
        }),
    )
}

fn handle_exam_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let exam_period = match required_str(req, "examPeriod") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let subject = match conn
        .query_row(
            "SELECT sub.code, sub.name, sub.ects, sub.semester, p.name
             FROM subjects sub
             JOIN study_programs p ON p.id = sub.study_program_id
             WHERE sub.id = ?",
            [&subject_id],
            |r| {
                let code: String = r.get(0)?;
                let name: String = r.get(1)?;
                let ects: i64 = r.get(2)?;
                let semester: i64 = r.get(3)?;
                let program: String = r.get(4)?;
                Ok(json!({
                    "code": code,
                    "name": name,
                    "ects": ects,
                    "semester": semester,
                    "program": program
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let academic_year = req
        .params
        .get("academicYear")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT
           r.id,
           st.index_no,
           st.first_name,
           st.last_name,
           g.total_points,
           g.grade,
           g.passed
         FROM exam_registrations r
         JOIN enrollments e ON e.id = r.enrollment_id
         JOIN students st ON st.id = e.student_id
         LEFT JOIN grades g ON g.registration_id = r.id
         WHERE e.subject_id = ? AND r.exam_period = ?",
    );
    let mut bind_values: Vec<Value> = vec![
        Value::Text(subject_id.clone()),
        Value::Text(exam_period.clone()),
    ];
    if let Some(year) = &academic_year {
        sql.push_str(" AND e.academic_year = ?");
        bind_values.push(Value::Text(year.clone()));
    }
    sql.push_str(" ORDER BY st.index_no");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let registration_id: String = row.get(0)?;
            let index_no: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let last_name: String = row.get(3)?;
            let total_points: Option<f64> = row.get(4)?;
            let grade: Option<i64> = row.get(5)?;
            let passed: Option<bool> = row.get(6)?;
            Ok(json!({
                "registrationId": registration_id,
                "indexNo": index_no,
                "firstName": first_name,
                "lastName": last_name,
                "totalPoints": total_points,
                "grade": grade,
                "passed": passed
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let graded = rows
        .iter()
        .filter(|r| !r.get("grade").map(|g| g.is_null()).unwrap_or(true))
        .count();
    let passed = rows
        .iter()
        .filter(|r| r.get("passed").and_then(|p| p.as_bool()).unwrap_or(false))
        .count();

    ok(
        &req.id,
        json!({
            "subject": subject,
            "examPeriod": exam_period,
            "rows": rows,
            "summary": {
                "registered": rows.len(),
                "graded": graded,
                "passed": passed
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentTranscript" => Some(handle_student_transcript(state, req)),
        "reports.examSheet" => Some(handle_exam_sheet(state, req)),
        _ => None,
    }
}
