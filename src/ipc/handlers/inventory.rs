use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn outstanding_quantity(
    conn: &rusqlite::Connection,
    item_id: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(SUM(quantity), 0) FROM inventory_assignments
         WHERE item_id = ? AND returned_on IS NULL",
        [item_id],
        |r| r.get(0),
    )
}

fn handle_items_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "items": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           i.id,
           i.name,
           i.location,
           i.quantity,
           (SELECT COALESCE(SUM(a.quantity), 0) FROM inventory_assignments a
              WHERE a.item_id = i.id AND a.returned_on IS NULL) AS outstanding
         FROM inventory_items i
         ORDER BY i.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let location: Option<String> = row.get(2)?;
            let quantity: i64 = row.get(3)?;
            let outstanding: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "location": location,
                "quantity": quantity,
                "outstanding": outstanding,
                "available": quantity - outstanding
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

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let location = req
        .params
        .get("location")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let quantity = match req.params.get("quantity").and_then(|v| v.as_i64()) {
        Some(v) if v >= 1 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "quantity must be >= 1",
                Some(json!({ "quantity": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing quantity", None),
    };

    let item_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO inventory_items(id, name, location, quantity) VALUES(?, ?, ?, ?)",
        (&item_id, &name, location.as_deref(), quantity),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "inventory_items" })),
        );
    }

    ok(&req.id, json!({ "itemId": item_id, "name": name }))
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
    if let Some(v) = patch.get("location") {
        if v.is_null() {
            set_parts.push("location = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            set_parts.push("location = ?".into());
            bind_values.push(Value::Text(s.trim().to_string()));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.location must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("quantity") {
        let Some(n) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.quantity must be an integer",
                None,
            );
        };
        if n < 1 {
            return err(
                &req.id,
                "bad_params",
                "quantity must be >= 1",
                Some(json!({ "quantity": n })),
            );
        }
        let outstanding = match outstanding_quantity(conn, &item_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if n < outstanding {
            return err(
                &req.id,
                "bad_params",
                "quantity cannot drop below the outstanding assignments",
                Some(json!({ "quantity": n, "outstanding": outstanding })),
            );
        }
        set_parts.push("quantity = ?".into());
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
        "UPDATE inventory_items SET {} WHERE id = ?",
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
                Some(json!({ "table": "inventory_items" })),
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
            "SELECT 1 FROM inventory_items WHERE id = ?",
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

    let outstanding = match outstanding_quantity(conn, &item_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if outstanding > 0 {
        return err(
            &req.id,
            "has_active_loans",
            "collect the outstanding assignments first",
            Some(json!({ "outstanding": outstanding })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (sql, table) in [
        (
            "DELETE FROM inventory_assignments WHERE item_id = ?",
            "inventory_assignments",
        ),
        ("DELETE FROM inventory_items WHERE id = ?", "inventory_items"),
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

fn handle_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let assigned_to = match req.params.get("assignedTo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing assignedTo", None),
    };
    if assigned_to.is_empty() {
        return err(&req.id, "bad_params", "assignedTo must not be empty", None);
    }
    let quantity = match req.params.get("quantity").and_then(|v| v.as_i64()) {
        Some(v) if v >= 1 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "quantity must be >= 1",
                Some(json!({ "quantity": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing quantity", None),
    };

    let on_hand: Option<i64> = match conn
        .query_row(
            "SELECT quantity FROM inventory_items WHERE id = ?",
            [&item_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(on_hand) = on_hand else {
        return err(&req.id, "not_found", "item not found", None);
    };
    let outstanding = match outstanding_quantity(conn, &item_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if quantity > on_hand - outstanding {
        return err(
            &req.id,
            "insufficient_quantity",
            "not enough units on hand",
            Some(json!({
                "requested": quantity,
                "available": on_hand - outstanding
            })),
        );
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO inventory_assignments(id, item_id, assigned_to, quantity, assigned_on)
         VALUES(?, ?, ?, ?, ?)",
        (&assignment_id, &item_id, &assigned_to, quantity, today()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "inventory_assignments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "assignedTo": assigned_to,
            "quantity": quantity
        }),
    )
}

fn handle_return(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };

    let returned_on: Option<Option<String>> = match conn
        .query_row(
            "SELECT returned_on FROM inventory_assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match returned_on {
        None => return err(&req.id, "not_found", "assignment not found", None),
        Some(Some(_)) => {
            return err(
                &req.id,
                "already_returned",
                "assignment is already returned",
                None,
            )
        }
        Some(None) => {}
    }

    let today = today();
    if let Err(e) = conn.execute(
        "UPDATE inventory_assignments SET returned_on = ? WHERE id = ?",
        (&today, &assignment_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "inventory_assignments" })),
        );
    }

    ok(&req.id, json!({ "ok": true, "returnedOn": today }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assignments": [] }));
    };

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
           a.id,
           a.item_id,
           i.name,
           a.assigned_to,
           a.quantity,
           a.assigned_on,
           a.returned_on
         FROM inventory_assignments a
         JOIN inventory_items i ON i.id = a.item_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(iid) = &item_id {
        clauses.push("a.item_id = ?");
        bind_values.push(Value::Text(iid.clone()));
    }
    if open_only {
        clauses.push("a.returned_on IS NULL");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY a.assigned_on DESC, i.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let id: String = row.get(0)?;
            let item_id: String = row.get(1)?;
            let item_name: String = row.get(2)?;
            let assigned_to: String = row.get(3)?;
            let quantity: i64 = row.get(4)?;
            let assigned_on: String = row.get(5)?;
            let returned_on: Option<String> = row.get(6)?;
            Ok(json!({
                "id": id,
                "itemId": item_id,
                "itemName": item_name,
                "assignedTo": assigned_to,
                "quantity": quantity,
                "assignedOn": assigned_on,
                "returnedOn": returned_on
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "inventory.items.list" => Some(handle_items_list(state, req)),
        "inventory.items.create" => Some(handle_items_create(state, req)),
        "inventory.items.update" => Some(handle_items_update(state, req)),
        "inventory.items.delete" => Some(handle_items_delete(state, req)),
        "inventory.assign" => Some(handle_assign(state, req)),
        "inventory.return" => Some(handle_return(state, req)),
        "inventory.assignments.list" => Some(handle_assignments_list(state, req)),
        _ => None,
    }
}
