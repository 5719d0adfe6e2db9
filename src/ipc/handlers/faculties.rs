use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEGREES: [&str; 3] = ["bachelor", "master", "phd"];
const DURATION_MIN: i64 = 1;
const DURATION_MAX: i64 = 12;

fn parse_degree(raw: &str) -> Option<&'static str> {
    let lowered = raw.trim().to_ascii_lowercase();
    DEGREES.iter().copied().find(|d| *d == lowered)
}

fn faculty_exists(conn: &Connection, faculty_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row("SELECT 1 FROM faculties WHERE id = ?", [faculty_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn handle_faculties_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "faculties": [] }));
    };

    // Counts via correlated subqueries so the admin dashboard needs one call.
    let mut stmt = match conn.prepare(
        "SELECT
           f.id,
           f.name,
           f.city,
           (SELECT COUNT(*) FROM study_programs p WHERE p.faculty_id = f.id) AS program_count,
           (SELECT COUNT(*) FROM students s
              JOIN study_programs p ON p.id = s.study_program_id
              WHERE p.faculty_id = f.id) AS student_count
         FROM faculties f
         ORDER BY f.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let city: Option<String> = row.get(2)?;
            let program_count: i64 = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "city": city,
                "programCount": program_count,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(faculties) => ok(&req.id, json!({ "faculties": faculties })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_faculties_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let city = req
        .params
        .get("city")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM faculties WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "bad_params",
            "faculty name already exists",
            Some(json!({ "name": name })),
        );
    }

    let faculty_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO faculties(id, name, city) VALUES(?, ?, ?)",
        (&faculty_id, &name, city.as_deref()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "faculties" })),
        );
    }

    ok(&req.id, json!({ "facultyId": faculty_id, "name": name }))
}

fn handle_faculties_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let faculty_id = match req.params.get("facultyId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing facultyId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.name must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        let taken: Option<String> = match conn
            .query_row(
                "SELECT id FROM faculties WHERE name = ? AND id <> ?",
                (&s, &faculty_id),
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
                "faculty name already exists",
                Some(json!({ "name": s })),
            );
        }
        set_parts.push("name = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("city") {
        if v.is_null() {
            set_parts.push("city = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            set_parts.push("city = ?".into());
            bind_values.push(Value::Text(s.trim().to_string()));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.city must be a string or null",
                None,
            );
        }
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let sql = format!("UPDATE faculties SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(faculty_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "faculties" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "faculty not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_faculties_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let faculty_id = match req.params.get("facultyId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing facultyId", None),
    };

    match faculty_exists(conn, &faculty_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "faculty not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let program_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM study_programs WHERE faculty_id = ?",
        [&faculty_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if program_count > 0 {
        return err(
            &req.id,
            "faculty_not_empty",
            "delete or move the study programs first",
            Some(json!({ "programCount": program_count })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM faculties WHERE id = ?", [&faculty_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "faculties" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_programs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "programs": [] }));
    };

    let faculty_id = req
        .params
        .get("facultyId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT
           p.id,
           p.faculty_id,
           p.name,
           p.degree,
           p.duration_semesters,
           (SELECT COUNT(*) FROM subjects sub WHERE sub.study_program_id = p.id) AS subject_count,
           (SELECT COUNT(*) FROM students s WHERE s.study_program_id = p.id) AS student_count
         FROM study_programs p",
    );
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(fid) = &faculty_id {
        sql.push_str(" WHERE p.faculty_id = ?");
        bind_values.push(Value::Text(fid.clone()));
    }
    sql.push_str(" ORDER BY p.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let id: String = row.get(0)?;
            let faculty_id: String = row.get(1)?;
            let name: String = row.get(2)?;
            let degree: String = row.get(3)?;
            let duration: i64 = row.get(4)?;
            let subject_count: i64 = row.get(5)?;
            let student_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "facultyId": faculty_id,
                "name": name,
                "degree": degree,
                "durationSemesters": duration,
                "subjectCount": subject_count,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(programs) => ok(&req.id, json!({ "programs": programs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_programs_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let faculty_id = match req.params.get("facultyId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing facultyId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let degree = match req.params.get("degree").and_then(|v| v.as_str()) {
        Some(raw) => match parse_degree(raw) {
            Some(d) => d,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "degree must be one of: bachelor, master, phd",
                    Some(json!({ "degree": raw })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing degree", None),
    };
    let duration = match req.params.get("durationSemesters").and_then(|v| v.as_i64()) {
        Some(v) if (DURATION_MIN..=DURATION_MAX).contains(&v) => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                format!(
                    "durationSemesters must be in {}..={}",
                    DURATION_MIN, DURATION_MAX
                ),
                Some(json!({ "durationSemesters": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing durationSemesters", None),
    };

    match faculty_exists(conn, &faculty_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "faculty not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM study_programs WHERE faculty_id = ? AND name = ?",
            (&faculty_id, &name),
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
            "program name already exists in this faculty",
            Some(json!({ "name": name })),
        );
    }

    let program_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO study_programs(id, faculty_id, name, degree, duration_semesters)
         VALUES(?, ?, ?, ?, ?)",
        (&program_id, &faculty_id, &name, degree, duration),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "study_programs" })),
        );
    }

    ok(&req.id, json!({ "programId": program_id, "name": name }))
}

fn handle_programs_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let program_id = match req.params.get("programId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing programId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

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
    if let Some(v) = patch.get("degree") {
        let Some(raw) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.degree must be a string", None);
        };
        let Some(d) = parse_degree(raw) else {
            return err(
                &req.id,
                "bad_params",
                "degree must be one of: bachelor, master, phd",
                Some(json!({ "degree": raw })),
            );
        };
        set_parts.push("degree = ?".into());
        bind_values.push(Value::Text(d.to_string()));
    }
    if let Some(v) = patch.get("durationSemesters") {
        let Some(n) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.durationSemesters must be an integer",
                None,
            );
        };
        if !(DURATION_MIN..=DURATION_MAX).contains(&n) {
            return err(
                &req.id,
                "bad_params",
                format!(
                    "durationSemesters must be in {}..={}",
                    DURATION_MIN, DURATION_MAX
                ),
                Some(json!({ "durationSemesters": n })),
            );
        }
        // Shrinking the program must not orphan subjects in later semesters.
        let max_semester: Option<i64> = match conn
            .query_row(
                "SELECT MAX(semester) FROM subjects WHERE study_program_id = ?",
                [&program_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v.flatten(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Some(max_semester) = max_semester {
            if max_semester > n {
                return err(
                    &req.id,
                    "bad_params",
                    "existing subjects sit beyond the new duration",
                    Some(json!({ "maxSubjectSemester": max_semester })),
                );
            }
        }
        set_parts.push("duration_semesters = ?".into());
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

    let sql = format!(
        "UPDATE study_programs SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(program_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "study_programs" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "program not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_programs_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let program_id = match req.params.get("programId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing programId", None),
    };

    let exists: Option<i64> = match conn
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
    if exists.is_none() {
        return err(&req.id, "not_found", "program not found", None);
    }

    let (subject_count, student_count): (i64, i64) = match conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM subjects WHERE study_program_id = ?1),
           (SELECT COUNT(*) FROM students WHERE study_program_id = ?1)",
        [&program_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_count > 0 || student_count > 0 {
        return err(
            &req.id,
            "program_not_empty",
            "delete the program's subjects and students first",
            Some(json!({
                "subjectCount": subject_count,
                "studentCount": student_count
            })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM study_programs WHERE id = ?", [&program_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "study_programs" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "faculties.list" => Some(handle_faculties_list(state, req)),
        "faculties.create" => Some(handle_faculties_create(state, req)),
        "faculties.update" => Some(handle_faculties_update(state, req)),
        "faculties.delete" => Some(handle_faculties_delete(state, req)),
        "programs.list" => Some(handle_programs_list(state, req)),
        "programs.create" => Some(handle_programs_create(state, req)),
        "programs.update" => Some(handle_programs_update(state, req)),
        "programs.delete" => Some(handle_programs_delete(state, req)),
        _ => None,
    }
}
