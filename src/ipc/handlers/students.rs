use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let program_id = req
        .params
        .get("programId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT
           s.id,
           s.study_program_id,
           s.index_no,
           s.first_name,
           s.last_name,
           s.email,
           s.enrollment_year,
           s.active,
           (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = s.id) AS enrollment_count
         FROM students s",
    );
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(pid) = &program_id {
        sql.push_str(" WHERE s.study_program_id = ?");
        bind_values.push(Value::Text(pid.clone()));
    }
    sql.push_str(" ORDER BY s.index_no");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let id: String = row.get(0)?;
            let program_id: String = row.get(1)?;
            let index_no: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let last_name: String = row.get(4)?;
            let email: Option<String> = row.get(5)?;
            let enrollment_year: i64 = row.get(6)?;
            let active: bool = row.get(7)?;
            let enrollment_count: i64 = row.get(8)?;
            Ok(json!({
                "id": id,
                "programId": program_id,
                "indexNo": index_no,
                "firstName": first_name,
                "lastName": last_name,
                "email": email,
                "enrollmentYear": enrollment_year,
                "active": active,
                "enrollmentCount": enrollment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let program_id = match req.params.get("programId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing programId", None),
    };
    let index_no = match req.params.get("indexNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing indexNo", None),
    };
    if index_no.is_empty() {
        return err(&req.id, "bad_params", "indexNo must not be empty", None);
    }
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    if first_name.is_empty() || last_name.is_empty() {
        return err(&req.id, "bad_params", "student name must not be empty", None);
    }
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let enrollment_year = match req.params.get("enrollmentYear").and_then(|v| v.as_i64()) {
        Some(v) if (1900..=3000).contains(&v) => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "enrollmentYear must be a calendar year",
                Some(json!({ "enrollmentYear": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing enrollmentYear", None),
    };

    let program: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM study_programs WHERE id = ?",
            [&program_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if program.is_none() {
        return err(&req.id, "not_found", "program not found", None);
    }

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE index_no = ?",
            [&index_no],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "bad_params",
            "index number already exists",
            Some(json!({ "indexNo": index_no })),
        );
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, index_no, last_name, first_name, email, study_program_id,
                              enrollment_year, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &student_id,
            &index_no,
            &last_name,
            &first_name,
            email.as_deref(),
            &program_id,
            enrollment_year,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "indexNo": index_no }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("indexNo") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.indexNo must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "indexNo must not be empty", None);
        }
        let taken: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM students WHERE index_no = ? AND id <> ?",
                (&s, &student_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if taken.is_some() {
            return err(
                &req.id,
                "bad_params",
                "index number already exists",
                Some(json!({ "indexNo": s })),
            );
        }
        set_parts.push("index_no = ?".into());
        bind_values.push(Value::Text(s));
    }
    for (key, column) in [("firstName", "first_name"), ("lastName", "last_name")] {
        if let Some(v) = patch.get(key) {
            let Some(s) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string", key),
                    None,
                );
            };
            let s = s.trim().to_string();
            if s.is_empty() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} must not be empty", key),
                    None,
                );
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Text(s));
        }
    }
    if let Some(v) = patch.get("email") {
        if v.is_null() {
            set_parts.push("email = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            set_parts.push("email = ?".into());
            bind_values.push(Value::Text(s.trim().to_string()));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.email must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("enrollmentYear") {
        let Some(n) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.enrollmentYear must be an integer",
                None,
            );
        };
        if !(1900..=3000).contains(&n) {
            return err(
                &req.id,
                "bad_params",
                "enrollmentYear must be a calendar year",
                Some(json!({ "enrollmentYear": n })),
            );
        }
        set_parts.push("enrollment_year = ?".into());
        bind_values.push(Value::Integer(n));
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return err(&req.id, "bad_params", "patch.active must be boolean", None);
        };
        set_parts.push("active = ?".into());
        bind_values.push(Value::Integer(b as i64));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    // Un-returned library items stay on the student's record; refuse the delete.
    let open_loans: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM library_loans WHERE student_id = ? AND returned_on IS NULL",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if open_loans > 0 {
        return err(
            &req.id,
            "has_active_loans",
            "return the student's library items first",
            Some(json!({ "openLoans": open_loans })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let steps: [(&str, &str); 6] = [
        (
            "DELETE FROM grades WHERE registration_id IN (
               SELECT r.id FROM exam_registrations r
               JOIN enrollments e ON e.id = r.enrollment_id
               WHERE e.student_id = ?)",
            "grades",
        ),
        (
            "DELETE FROM exam_registrations WHERE enrollment_id IN (
               SELECT id FROM enrollments WHERE student_id = ?)",
            "exam_registrations",
        ),
        ("DELETE FROM enrollments WHERE student_id = ?", "enrollments"),
        ("DELETE FROM requests WHERE student_id = ?", "requests"),
        (
            "DELETE FROM library_loans WHERE student_id = ?",
            "library_loans",
        ),
        ("DELETE FROM students WHERE id = ?", "students"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
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
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
