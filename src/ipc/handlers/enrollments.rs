use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{effective_section, SetupSection};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           e.id,
           e.subject_id,
           sub.code,
           sub.name,
           sub.ects,
           sub.semester,
           e.academic_year,
           (SELECT COUNT(*) FROM exam_registrations r WHERE r.enrollment_id = e.id) AS registration_count,
           (SELECT g.grade FROM grades g
              JOIN exam_registrations r2 ON r2.id = g.registration_id
              WHERE r2.enrollment_id = e.id AND g.passed = 1
              ORDER BY g.grade DESC LIMIT 1) AS passed_grade
         FROM enrollments e
         JOIN subjects sub ON sub.id = e.subject_id
         WHERE e.student_id = ?
         ORDER BY e.academic_year, sub.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id], |row| {
            let id: String = row.get(0)?;
            let subject_id: String = row.get(1)?;
            let subject_code: String = row.get(2)?;
            let subject_name: String = row.get(3)?;
            let ects: i64 = row.get(4)?;
            let semester: i64 = row.get(5)?;
            let academic_year: String = row.get(6)?;
            let registration_count: i64 = row.get(7)?;
            let passed_grade: Option<i64> = row.get(8)?;
            Ok(json!({
                "id": id,
                "subjectId": subject_id,
                "subjectCode": subject_code,
                "subjectName": subject_name,
                "ects": ects,
                "semester": semester,
                "academicYear": academic_year,
                "registrationCount": registration_count,
                "passedGrade": passed_grade
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let policy = match effective_section(conn, SetupSection::Enrollment) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:?}"), None),
    };
    let academic_year = match req.params.get("academicYear") {
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "academicYear must be a non-empty string",
                    None,
                )
            }
        },
        None => policy
            .get("defaultAcademicYear")
            .and_then(|v| v.as_str())
            .unwrap_or("2025/26")
            .to_string(),
    };
    let max_subjects = policy
        .get("maxSubjectsPerYear")
        .and_then(|v| v.as_i64())
        .unwrap_or(12);
    let require_match = policy
        .get("requireProgramMatch")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let student_row: Option<(String, bool)> = match conn
        .query_row(
            "SELECT study_program_id, active FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((student_program, active)) = student_row else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if !active {
        return err(&req.id, "bad_params", "student is not active", None);
    }
    let subject_program: Option<String> = match conn
        .query_row(
            "SELECT study_program_id FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(subject_program) = subject_program else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    if require_match && student_program != subject_program {
        return err(
            &req.id,
            "program_mismatch",
            "subject belongs to a different study program",
            Some(json!({
                "studentProgramId": student_program,
                "subjectProgramId": subject_program
            })),
        );
    }

    let duplicate: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ? AND subject_id = ? AND academic_year = ?",
            (&student_id, &subject_id, &academic_year),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "bad_params",
            "student is already enrolled in this subject for that year",
            Some(json!({ "academicYear": academic_year })),
        );
    }

    let year_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ? AND academic_year = ?",
        (&student_id, &academic_year),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if year_count >= max_subjects {
        return err(
            &req.id,
            "enrollment_limit_reached",
            format!("at most {} subjects per academic year", max_subjects),
            Some(json!({
                "academicYear": academic_year,
                "maxSubjectsPerYear": max_subjects
            })),
        );
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, student_id, subject_id, academic_year, created_at)
         VALUES(?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&enrollment_id, &student_id, &subject_id, &academic_year),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "academicYear": academic_year
        }),
    )
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "enrollment not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let steps: [(&str, &str); 3] = [
        (
            "DELETE FROM grades WHERE registration_id IN (
               SELECT id FROM exam_registrations WHERE enrollment_id = ?)",
            "grades",
        ),
        (
            "DELETE FROM exam_registrations WHERE enrollment_id = ?",
            "exam_registrations",
        ),
        ("DELETE FROM enrollments WHERE id = ?", "enrollments"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&enrollment_id]) {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_registrations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           r.id,
           r.exam_period,
           r.registered_at,
           g.grade,
           g.passed
         FROM exam_registrations r
         LEFT JOIN grades g ON g.registration_id = r.id
         WHERE r.enrollment_id = ?
         ORDER BY r.registered_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&enrollment_id], |row| {
            let id: String = row.get(0)?;
            let exam_period: String = row.get(1)?;
            let registered_at: String = row.get(2)?;
            let grade: Option<i64> = row.get(3)?;
            let passed: Option<bool> = row.get(4)?;
            Ok(json!({
                "id": id,
                "examPeriod": exam_period,
                "registeredAt": registered_at,
                "grade": grade,
                "passed": passed
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(registrations) => ok(&req.id, json!({ "registrations": registrations })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_registrations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };
    let exam_period = match req.params.get("examPeriod").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing examPeriod", None),
    };
    if exam_period.is_empty() {
        return err(&req.id, "bad_params", "examPeriod must not be empty", None);
    }

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "enrollment not found", None);
    }

    let passed_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM grades g
         JOIN exam_registrations r ON r.id = g.registration_id
         WHERE r.enrollment_id = ? AND g.passed = 1",
        [&enrollment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if passed_count > 0 {
        return err(
            &req.id,
            "already_passed",
            "subject is already passed; no further exam registrations",
            None,
        );
    }

    let duplicate: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM exam_registrations WHERE enrollment_id = ? AND exam_period = ?",
            (&enrollment_id, &exam_period),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "bad_params",
            "already registered for this exam period",
            Some(json!({ "examPeriod": exam_period })),
        );
    }

    let registration_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exam_registrations(id, enrollment_id, exam_period, registered_at)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&registration_id, &enrollment_id, &exam_period),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exam_registrations" })),
        );
    }

    ok(
        &req.id,
        json!({
            "registrationId": registration_id,
            "examPeriod": exam_period
        }),
    )
}

fn handle_registrations_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let registration_id = match req.params.get("registrationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing registrationId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM exam_registrations WHERE id = ?",
            [&registration_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "registration not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for (sql, table) in [
        ("DELETE FROM grades WHERE registration_id = ?", "grades"),
        (
            "DELETE FROM exam_registrations WHERE id = ?",
            "exam_registrations",
        ),
    ] {
        if let Err(e) = tx.execute(sql, [&registration_id]) {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        "examRegistrations.list" => Some(handle_registrations_list(state, req)),
        "examRegistrations.create" => Some(handle_registrations_create(state, req)),
        "examRegistrations.remove" => Some(handle_registrations_remove(state, req)),
        _ => None,
    }
}
