use crate::grading::{compute_grade, ComponentScores, GradeResult};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn result_json(result: &GradeResult) -> serde_json::Value {
    json!({
        "examPoints": result.exam_points,
        "attendanceBonus": result.attendance_bonus,
        "totalPoints": result.total_points,
        "grade": result.grade,
        "passed": result.passed
    })
}

fn parse_scores(req: &Request) -> Result<ComponentScores, serde_json::Value> {
    let Some(raw) = req.params.get("scores") else {
        return Err(err(&req.id, "bad_params", "missing scores", None));
    };
    if !raw.is_object() {
        return Err(err(&req.id, "bad_params", "scores must be an object", None));
    }
    ComponentScores::from_value(raw)
        .map_err(|e| err(&req.id, e.code(), e.to_string(), Some(e.details())))
}

// Pure preview so the UI can show the outcome before anything is written.
fn handle_grades_preview(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let scores = match parse_scores(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let result = compute_grade(&scores);
    ok(&req.id, json!({ "result": result_json(&result) }))
}

fn handle_grades_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let registration_id = match req.params.get("registrationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing registrationId", None),
    };
    let scores = match parse_scores(req) {
        Ok(s) => s,
        Err(resp) => return resp,
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

    let result = compute_grade(&scores);

    // Resubmission replaces the previous sheet for the same registration.
    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, registration_id, midterm1, midterm2, final_exam, attendance,
                            exam_points, attendance_bonus, total_points, grade, passed, graded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(registration_id) DO UPDATE SET
           midterm1 = excluded.midterm1,
           midterm2 = excluded.midterm2,
           final_exam = excluded.final_exam,
           attendance = excluded.attendance,
           exam_points = excluded.exam_points,
           attendance_bonus = excluded.attendance_bonus,
           total_points = excluded.total_points,
           grade = excluded.grade,
           passed = excluded.passed,
           graded_at = excluded.graded_at",
        (
            &grade_id,
            &registration_id,
            scores.midterm1(),
            scores.midterm2(),
            scores.final_exam(),
            scores.attendance(),
            result.exam_points,
            result.attendance_bonus,
            result.total_points,
            result.grade as i64,
            result.passed,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    let stored_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM grades WHERE registration_id = ?",
            [&registration_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "gradeId": stored_id,
            "registrationId": registration_id,
            "result": result_json(&result)
        }),
    )
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let registration_id = match req.params.get("registrationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing registrationId", None),
    };

    let row = match conn
        .query_row(
            "SELECT midterm1, midterm2, final_exam, attendance,
                    exam_points, attendance_bonus, total_points, grade, passed, graded_at
             FROM grades WHERE registration_id = ?",
            [&registration_id],
            |r| {
                let midterm1: f64 = r.get(0)?;
                let midterm2: f64 = r.get(1)?;
                let final_exam: f64 = r.get(2)?;
                let attendance: f64 = r.get(3)?;
                let exam_points: f64 = r.get(4)?;
                let attendance_bonus: f64 = r.get(5)?;
                let total_points: f64 = r.get(6)?;
                let grade: i64 = r.get(7)?;
                let passed: bool = r.get(8)?;
                let graded_at: String = r.get(9)?;
                Ok(json!({
                    "scores": {
                        "midterm1": midterm1,
                        "midterm2": midterm2,
                        "finalExam": final_exam,
                        "attendance": attendance
                    },
                    "result": {
                        "examPoints": exam_points,
                        "attendanceBonus": attendance_bonus,
                        "totalPoints": total_points,
                        "grade": grade,
                        "passed": passed
                    },
                    "gradedAt": graded_at
                }))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match row {
        Some(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("registrationId".into(), json!(registration_id));
            }
            ok(&req.id, value)
        }
        None => err(
            &req.id,
            "not_found",
            "no grade recorded for this registration",
            None,
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.preview" => Some(handle_grades_preview(state, req)),
        "grades.submit" => Some(handle_grades_submit(state, req)),
        "grades.get" => Some(handle_grades_get(state, req)),
        _ => None,
    }
}
