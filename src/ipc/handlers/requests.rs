use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{effective_section, SetupSection};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const KINDS: [&str; 2] = ["request", "complaint"];
const STATUSES: [&str; 4] = ["open", "in_review", "resolved", "rejected"];

fn transition_allowed(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        ("open", "in_review")
            | ("open", "resolved")
            | ("open", "rejected")
            | ("in_review", "resolved")
            | ("in_review", "rejected")
    )
}

fn handle_requests_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "requests": [] }));
    };

    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        None => None,
        Some(s) if STATUSES.contains(&s) => Some(s.to_string()),
        Some(s) => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: open, in_review, resolved, rejected",
                Some(json!({ "status": s })),
            )
        }
    };

    let policy = match effective_section(conn, SetupSection::Requests) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let auto_close_days = policy
        .get("autoCloseDays")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    // 0 disables staleness marking altogether.
    let stale_cutoff = (auto_close_days > 0).then(|| Utc::now() - Duration::days(auto_close_days));

    let mut sql = String::from(
        "SELECT
           r.id,
           r.student_id,
           st.index_no,
           st.first_name,
           st.last_name,
           r.kind,
           r.title,
           r.body,
           r.status,
           r.response,
           r.created_at,
           r.updated_at
         FROM requests r
         JOIN students st ON st.id = r.student_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(sid) = &student_id {
        clauses.push("r.student_id = ?");
        bind_values.push(Value::Text(sid.clone()));
    }
    if let Some(st) = &status {
        clauses.push("r.status = ?");
        bind_values.push(Value::Text(st.clone()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY r.created_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let index_no: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let last_name: String = row.get(4)?;
            let kind: String = row.get(5)?;
            let title: String = row.get(6)?;
            let body: String = row.get(7)?;
            let status: String = row.get(8)?;
            let response: Option<String> = row.get(9)?;
            let created_at: Option<String> = row.get(10)?;
            let updated_at: Option<String> = row.get(11)?;
            Ok((
                id, student_id, index_no, first_name, last_name, kind, title, body, status,
                response, created_at, updated_at,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let requests: Vec<serde_json::Value> = rows
        .into_iter()
        .map(
            |(
                id,
                student_id,
                index_no,
                first_name,
                last_name,
                kind,
                title,
                body,
                status,
                response,
                created_at,
                updated_at,
            )| {
                let is_stale = match (&stale_cutoff, status.as_str(), &created_at) {
                    (Some(cutoff), "open" | "in_review", Some(created)) => {
                        DateTime::parse_from_rfc3339(created)
                            .map(|t| t.with_timezone(&Utc) < *cutoff)
                            .unwrap_or(false)
                    }
                    _ => false,
                };
                json!({
                    "id": id,
                    "studentId": student_id,
                    "indexNo": index_no,
                    "firstName": first_name,
                    "lastName": last_name,
                    "kind": kind,
                    "title": title,
                    "body": body,
                    "status": status,
                    "response": response,
                    "createdAt": created_at,
                    "updatedAt": updated_at,
                    "isStale": is_stale
                })
            },
        )
        .collect();

    ok(&req.id, json!({ "requests": requests }))
}

fn handle_requests_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let kind = match req.params.get("kind").and_then(|v| v.as_str()) {
        Some(k) if KINDS.contains(&k) => k.to_string(),
        Some(k) => {
            return err(
                &req.id,
                "bad_params",
                "kind must be one of: request, complaint",
                Some(json!({ "kind": k })),
            )
        }
        None => return err(&req.id, "bad_params", "missing kind", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let body = match req.params.get("body").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing body", None),
    };
    if body.is_empty() {
        return err(&req.id, "bad_params", "body must not be empty", None);
    }

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

    let request_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO requests(id, student_id, kind, title, body, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'open',
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&request_id, &student_id, &kind, &title, &body),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "requests" })),
        );
    }

    ok(&req.id, json!({ "requestId": request_id, "status": "open" }))
}

fn handle_requests_update_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let request_id = match req.params.get("requestId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing requestId", None),
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(s) if STATUSES.contains(&s) => s.to_string(),
        Some(s) => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: open, in_review, resolved, rejected",
                Some(json!({ "status": s })),
            )
        }
        None => return err(&req.id, "bad_params", "missing status", None),
    };
    let response = req
        .params
        .get("response")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });

    let current: Option<String> = match conn
        .query_row(
            "SELECT status FROM requests WHERE id = ?",
            [&request_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current) = current else {
        return err(&req.id, "not_found", "request not found", None);
    };

    if !transition_allowed(&current, &status) {
        return err(
            &req.id,
            "bad_params",
            format!("cannot move a {} request to {}", current, status),
            Some(json!({ "from": current, "to": status })),
        );
    }

    if status == "rejected" && response.is_none() {
        let policy = match effective_section(conn, SetupSection::Requests) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let require_response = policy
            .get("requireResponseOnReject")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if require_response {
            return err(
                &req.id,
                "bad_params",
                "a response is required when rejecting",
                None,
            );
        }
    }

    let changed = match conn.execute(
        "UPDATE requests
         SET status = ?,
             response = COALESCE(?, response),
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (&status, response.as_deref(), &request_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "requests" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "request not found", None);
    }

    ok(&req.id, json!({ "ok": true, "status": status }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "requests.list" => Some(handle_requests_list(state, req)),
        "requests.create" => Some(handle_requests_create(state, req)),
        "requests.updateStatus" => Some(handle_requests_update_status(state, req)),
        _ => None,
    }
}
