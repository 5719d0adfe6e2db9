use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ECTS_MIN: i64 = 1;
const ECTS_MAX: i64 = 20;

fn program_duration(
    conn: &Connection,
    program_id: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT duration_semesters FROM study_programs WHERE id = ?",
        [program_id],
        |r| r.get(0),
    )
    .optional()
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
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
           s.code,
           s.name,
           s.semester,
           s.ects,
           (SELECT COUNT(*) FROM enrollments e WHERE e.subject_id = s.id) AS enrolled_count
         FROM subjects s",
    );
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(pid) = &program_id {
        sql.push_str(" WHERE s.study_program_id = ?");
        bind_values.push(Value::Text(pid.clone()));
    }
    sql.push_str(" ORDER BY s.semester, s.code");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let id: String = row.get(0)?;
            let program_id: String = row.get(1)?;
            let code: String = row.get(2)?;
            let name: String = row.get(3)?;
            let semester: i64 = row.get(4)?;
            let ects: i64 = row.get(5)?;
            let enrolled_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "programId": program_id,
                "code": code,
                "name": name,
                "semester": semester,
                "ects": ects,
                "enrolledCount": enrolled_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let program_id = match req.params.get("programId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing programId", None),
    };
    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing code", None),
    };
    if code.is_empty() {
        return err(&req.id, "bad_params", "code must not be empty", None);
    }
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let ects = match req.params.get("ects").and_then(|v| v.as_i64()) {
        Some(v) if (ECTS_MIN..=ECTS_MAX).contains(&v) => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                format!("ects must be in {}..={}", ECTS_MIN, ECTS_MAX),
                Some(json!({ "ects": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing ects", None),
    };
    let semester = match req.params.get("semester").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing semester", None),
    };

    let duration = match program_duration(conn, &program_id) {
        Ok(Some(d)) => d,
        Ok(None) => return err(&req.id, "not_found", "program not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if semester < 1 || semester > duration {
        return err(
            &req.id,
            "bad_params",
            format!("semester must be in 1..={} for this program", duration),
            Some(json!({ "semester": semester })),
        );
    }

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM subjects WHERE study_program_id = ? AND code = ?",
            (&program_id, &code),
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
            "subject code already exists in this program",
            Some(json!({ "code": code })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, study_program_id, code, name, semester, ects)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&subject_id, &program_id, &code, &name, semester, ects),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "code": code }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let program_id: Option<String> = match conn
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
    let Some(program_id) = program_id else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("code") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.code must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "code must not be empty", None);
        }
        let taken: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM subjects WHERE study_program_id = ? AND code = ? AND id <> ?",
                (&program_id, &s, &subject_id),
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
                "subject code already exists in this program",
                Some(json!({ "code": s })),
            );
        }
        set_parts.push("code = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.name must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        set_parts.push("name = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("ects") {
        let Some(n) = v.as_i64() else {
            return err(&req.id, "bad_params", "patch.ects must be an integer", None);
        };
        if !(ECTS_MIN..=ECTS_MAX).contains(&n) {
            return err(
                &req.id,
                "bad_params",
                format!("ects must be in {}..={}", ECTS_MIN, ECTS_MAX),
                Some(json!({ "ects": n })),
            );
        }
        set_parts.push("ects = ?".into());
        bind_values.push(Value::Integer(n));
    }
    if let Some(v) = patch.get("semester") {
        let Some(n) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.semester must be an integer",
                None,
            );
        };
        let duration = match program_duration(conn, &program_id) {
            Ok(Some(d)) => d,
            Ok(None) => return err(&req.id, "not_found", "program not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if n < 1 || n > duration {
            return err(
                &req.id,
                "bad_params",
                format!("semester must be in 1..={} for this program", duration),
                Some(json!({ "semester": n })),
            );
        }
        set_parts.push("semester = ?".into());
        bind_values.push(Value::Integer(n));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(subject_id));

    if let Err(e) = conn.execute(&sql, params_from_iter(bind_values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dependency order: grades -> registrations -> enrollments -> syllabus -> subject.
    let steps: [(&str, &str); 5] = [
        (
            "DELETE FROM grades WHERE registration_id IN (
               SELECT r.id FROM exam_registrations r
               JOIN enrollments e ON e.id = r.enrollment_id
               WHERE e.subject_id = ?)",
            "grades",
        ),
        (
            "DELETE FROM exam_registrations WHERE enrollment_id IN (
               SELECT id FROM enrollments WHERE subject_id = ?)",
            "exam_registrations",
        ),
        ("DELETE FROM enrollments WHERE subject_id = ?", "enrollments"),
        (
            "DELETE FROM syllabus_sections WHERE subject_id = ?",
            "syllabus_sections",
        ),
        ("DELETE FROM subjects WHERE id = ?", "subjects"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&subject_id]) {
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

fn handle_syllabus_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, idx, title, body FROM syllabus_sections
         WHERE subject_id = ? ORDER BY idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let idx: i64 = row.get(1)?;
            let title: String = row.get(2)?;
            let body: String = row.get(3)?;
            Ok(json!({
                "id": id,
                "position": idx,
                "title": title,
                "body": body
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_syllabus_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(sections) = req.params.get("sections").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing/invalid sections", None);
    };

    // Validate the whole payload before touching any row.
    let mut parsed: Vec<(String, String)> = Vec::with_capacity(sections.len());
    for (idx, section) in sections.iter().enumerate() {
        let Some(obj) = section.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("sections[{}] must be an object", idx),
                None,
            );
        };
        let title = match obj.get("title").and_then(|v| v.as_str()) {
            Some(t) => t.trim().to_string(),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("sections[{}].title is required", idx),
                    None,
                )
            }
        };
        if title.is_empty() {
            return err(
                &req.id,
                "bad_params",
                format!("sections[{}].title must not be empty", idx),
                None,
            );
        }
        let body = match obj.get("body") {
            None => String::new(),
            Some(v) if v.is_null() => String::new(),
            Some(v) => match v.as_str() {
                Some(s) => s.to_string(),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("sections[{}].body must be a string", idx),
                        None,
                    )
                }
            },
        };
        parsed.push((title, body));
    }

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM syllabus_sections WHERE subject_id = ?",
        [&subject_id],
    ) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "syllabus_sections" })),
        );
    }
    for (idx, (title, body)) in parsed.iter().enumerate() {
        let section_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO syllabus_sections(id, subject_id, idx, title, body)
             VALUES(?, ?, ?, ?, ?)",
            (&section_id, &subject_id, idx as i64, title, body),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "syllabus_sections" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "sectionCount": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "syllabus.get" => Some(handle_syllabus_get(state, req)),
        "syllabus.update" => Some(handle_syllabus_update(state, req)),
        _ => None,
    }
}
