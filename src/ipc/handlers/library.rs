use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{effective_section, SetupSection};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn handle_items_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "items": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           i.id,
           i.title,
           i.author,
           i.inventory_code,
           i.copies,
           (SELECT COUNT(*) FROM library_loans l
              WHERE l.item_id = i.id AND l.returned_on IS NULL) AS open_loans
         FROM library_items i
         ORDER BY i.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let author: Option<String> = row.get(2)?;
            let inventory_code: Option<String> = row.get(3)?;
            let copies: i64 = row.get(4)?;
            let open_loans: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "title": title,
                "author": author,
                "inventoryCode": inventory_code,
                "copies": copies,
                "openLoans": open_loans,
                "availableCopies": copies - open_loans
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(items) => ok(&req.id, json!({ "items": items })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_items_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let author = req
        .params
        .get("author")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let inventory_code = req
        .params
        .get("inventoryCode")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let copies = match req.params.get("copies").and_then(|v| v.as_i64()) {
        Some(v) if v >= 1 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "copies must be >= 1",
                Some(json!({ "copies": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing copies", None),
    };

    if let Some(code) = &inventory_code {
        let taken: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM library_items WHERE inventory_code = ?",
                [code],
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
                "inventory code already exists",
                Some(json!({ "inventoryCode": code })),
            );
        }
    }

    let item_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO library_items(id, title, author, inventory_code, copies)
         VALUES(?, ?, ?, ?, ?)",
        (
            &item_id,
            &title,
            author.as_deref(),
            inventory_code.as_deref(),
            copies,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "library_items" })),
        );
    }

    ok(&req.id, json!({ "itemId": item_id, "title": title }))
}

fn handle_items_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("title") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.title must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        set_parts.push("title = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("author") {
        if v.is_null() {
            set_parts.push("author = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            set_parts.push("author = ?".into());
            bind_values.push(Value::Text(s.trim().to_string()));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.author must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("inventoryCode") {
        if v.is_null() {
            set_parts.push("inventory_code = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            let s = s.trim().to_string();
            let taken: Option<i64> = match conn
                .query_row(
                    "SELECT 1 FROM library_items WHERE inventory_code = ? AND id <> ?",
                    (&s, &item_id),
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
                    "inventory code already exists",
                    Some(json!({ "inventoryCode": s })),
                );
            }
            set_parts.push("inventory_code = ?".into());
            bind_values.push(Value::Text(s));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.inventoryCode must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("copies") {
        let Some(n) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.copies must be an integer",
                None,
            );
        };
        if n < 1 {
            return err(
                &req.id,
                "bad_params",
                "copies must be >= 1",
                Some(json!({ "copies": n })),
            );
        }
        let open_loans: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM library_loans WHERE item_id = ? AND returned_on IS NULL",
            [&item_id],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if n < open_loans {
            return err(
                &req.id,
                "bad_params",
                "copies cannot drop below the open loan count",
                Some(json!({ "copies": n, "openLoans": open_loans })),
            );
        }
        set_parts.push("copies = ?".into());
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
        "UPDATE library_items SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(item_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "library_items" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "item not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_items_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM library_items WHERE id = ?",
            [&item_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "item not found", None);
    }

    let open_loans: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM library_loans WHERE item_id = ? AND returned_on IS NULL",
        [&item_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if open_loans > 0 {
        return err(
            &req.id,
            "has_active_loans",
            "collect the outstanding copies first",
            Some(json!({ "openLoans": open_loans })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (sql, table) in [
        ("DELETE FROM library_loans WHERE item_id = ?", "library_loans"),
        ("DELETE FROM library_items WHERE id = ?", "library_items"),
    ] {
        if let Err(e) = tx.execute(sql, [&item_id]) {
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

fn handle_loans_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "loans": [] }));
    };

    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let item_id = req
        .params
        .get("itemId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let open_only = req
        .params
        .get("openOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut sql = String::from(
        "SELECT
           l.id,
           l.item_id,
           i.title,
           l.student_id,
           st.index_no,
           st.first_name,
           st.last_name,
           l.issued_on,
           l.due_on,
           l.returned_on
         FROM library_loans l
         JOIN library_items i ON i.id = l.item_id
         JOIN students st ON st.id = l.student_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(sid) = &student_id {
        clauses.push("l.student_id = ?");
        bind_values.push(Value::Text(sid.clone()));
    }
    if let Some(iid) = &item_id {
        clauses.push("l.item_id = ?");
        bind_values.push(Value::Text(iid.clone()));
    }
    if open_only {
        clauses.push("l.returned_on IS NULL");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY l.issued_on DESC, i.title");

    let today = today();
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), move |row| {
            let id: String = row.get(0)?;
            let item_id: String = row.get(1)?;
            let title: String = row.get(2)?;
            let student_id: String = row.get(3)?;
            let index_no: String = row.get(4)?;
            let first_name: String = row.get(5)?;
            let last_name: String = row.get(6)?;
            let issued_on: String = row.get(7)?;
            let due_on: String = row.get(8)?;
            let returned_on: Option<String> = row.get(9)?;
            // ISO dates compare correctly as strings.
            let overdue = returned_on.is_none() && due_on.as_str() < today.as_str();
            Ok(json!({
                "id": id,
                "itemId": item_id,
                "title": title,
                "studentId": student_id,
                "indexNo": index_no,
                "firstName": first_name,
                "lastName": last_name,
                "issuedOn": issued_on,
                "dueOn": due_on,
                "returnedOn": returned_on,
                "overdue": overdue
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(loans) => ok(&req.id, json!({ "loans": loans })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_loans_issue(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let student_active: Option<bool> = match conn
        .query_row(
            "SELECT active FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match student_active {
        None => return err(&req.id, "not_found", "student not found", None),
        Some(false) => return err(&req.id, "bad_params", "student is not active", None),
        Some(true) => {}
    }

    let item: Option<(i64, i64)> = match conn
        .query_row(
            "SELECT
               i.copies,
               (SELECT COUNT(*) FROM library_loans l
                  WHERE l.item_id = i.id AND l.returned_on IS NULL)
             FROM library_items i WHERE i.id = ?",
            [&item_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((copies, open_loans)) = item else {
        return err(&req.id, "not_found", "item not found", None);
    };
    if open_loans >= copies {
        return err(
            &req.id,
            "no_copies_available",
            "every copy is currently on loan",
            Some(json!({ "copies": copies, "openLoans": open_loans })),
        );
    }

    let policy = match effective_section(conn, SetupSection::Library) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let max_active = policy
        .get("maxActiveLoans")
        .and_then(|v| v.as_i64())
        .unwrap_or(5);
    let loan_period_days = policy
        .get("loanPeriodDays")
        .and_then(|v| v.as_i64())
        .unwrap_or(21);

    let student_open: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM library_loans WHERE student_id = ? AND returned_on IS NULL",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_open >= max_active {
        return err(
            &req.id,
            "loan_limit_reached",
            format!("at most {} open loans per student", max_active),
            Some(json!({ "maxActiveLoans": max_active })),
        );
    }

    let issued = Utc::now().date_naive();
    let due = issued + Duration::days(loan_period_days);
    let issued_on = issued.format("%Y-%m-%d").to_string();
    let due_on = due.format("%Y-%m-%d").to_string();

    let loan_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO library_loans(id, item_id, student_id, issued_on, due_on)
         VALUES(?, ?, ?, ?, ?)",
        (&loan_id, &item_id, &student_id, &issued_on, &due_on),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "library_loans" })),
        );
    }

    ok(
        &req.id,
        json!({
            "loanId": loan_id,
            "issuedOn": issued_on,
            "dueOn": due_on
        }),
    )
}

fn handle_loans_return(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let loan_id = match req.params.get("loanId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing loanId", None),
    };

    let loan: Option<(Option<String>, String)> = match conn
        .query_row(
            "SELECT returned_on, due_on FROM library_loans WHERE id = ?",
            [&loan_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((returned_on, due_on)) = loan else {
        return err(&req.id, "not_found", "loan not found", None);
    };
    if returned_on.is_some() {
        return err(&req.id, "already_returned", "loan is already returned", None);
    }

    let today = today();
    if let Err(e) = conn.execute(
        "UPDATE library_loans SET returned_on = ? WHERE id = ?",
        (&today, &loan_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "library_loans" })),
        );
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "returnedOn": today,
            "overdue": due_on.as_str() < today.as_str()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "library.items.list" => Some(handle_items_list(state, req)),
        "library.items.create" => Some(handle_items_create(state, req)),
        "library.items.update" => Some(handle_items_update(state, req)),
        "library.items.delete" => Some(handle_items_delete(state, req)),
        "library.loans.list" => Some(handle_loans_list(state, req)),
        "library.loans.issue" => Some(handle_loans_issue(state, req)),
        "library.loans.return" => Some(handle_loans_return(state, req)),
        _ => None,
    }
}
