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
fn quantities_bound_assignments_and_returns_free_units() {
    let workspace = temp_dir("campus-inventory-units");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let zero = request(
        &mut stdin,
        &mut reader,
        "2",
        "inventory.items.create",
        json!({ "name": "Projector", "quantity": 0 }),
    );
    assert_eq!(zero["ok"].as_bool(), Some(false));
    assert_eq!(zero["error"]["code"].as_str(), Some("bad_params"));

    let projector = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "inventory.items.create",
        json!({ "name": "Projector", "location": "Hall 2", "quantity": 3 }),
    );
    assert_eq!(projector["name"].as_str(), Some("Projector"));
    let item_id = projector["itemId"].as_str().expect("itemId").to_string();

    let lab = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "inventory.assign",
        json!({ "itemId": item_id, "assignedTo": "Lab 7", "quantity": 2 }),
    );
    assert_eq!(lab["assignedTo"].as_str(), Some("Lab 7"));
    assert_eq!(lab["quantity"].as_i64(), Some(2));
    let lab_assignment = lab["assignmentId"].as_str().expect("assignmentId").to_string();

    let too_many = request(
        &mut stdin,
        &mut reader,
        "5",
        "inventory.assign",
        json!({ "itemId": item_id, "assignedTo": "Hall 1", "quantity": 2 }),
    );
    assert_eq!(too_many["ok"].as_bool(), Some(false));
    assert_eq!(
        too_many["error"]["code"].as_str(),
        Some("insufficient_quantity")
    );
    assert_eq!(too_many["error"]["details"]["requested"].as_i64(), Some(2));
    assert_eq!(too_many["error"]["details"]["available"].as_i64(), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "inventory.assign",
        json!({ "itemId": item_id, "assignedTo": "Dean's office", "quantity": 1 }),
    );

    let items = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "inventory.items.list",
        json!({}),
    );
    let listed = &items["items"].as_array().expect("items")[0];
    assert_eq!(listed["quantity"].as_i64(), Some(3));
    assert_eq!(listed["outstanding"].as_i64(), Some(3));
    assert_eq!(listed["available"].as_i64(), Some(0));
    assert_eq!(listed["location"].as_str(), Some("Hall 2"));

    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "inventory.return",
        json!({ "assignmentId": lab_assignment }),
    );
    assert!(returned["returnedOn"].as_str().is_some());

    let twice = request(
        &mut stdin,
        &mut reader,
        "9",
        "inventory.return",
        json!({ "assignmentId": lab_assignment }),
    );
    assert_eq!(twice["ok"].as_bool(), Some(false));
    assert_eq!(twice["error"]["code"].as_str(), Some("already_returned"));

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "inventory.items.list",
        json!({}),
    );
    let row = &after["items"].as_array().expect("items")[0];
    assert_eq!(row["outstanding"].as_i64(), Some(1));
    assert_eq!(row["available"].as_i64(), Some(2));

    let open = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "inventory.assignments.list",
        json!({ "itemId": item_id, "openOnly": true }),
    );
    let open_rows = open["assignments"].as_array().expect("assignments");
    assert_eq!(open_rows.len(), 1);
    assert_eq!(open_rows[0]["assignedTo"].as_str(), Some("Dean's office"));
    assert_eq!(open_rows[0]["itemName"].as_str(), Some("Projector"));
    assert!(open_rows[0]["returnedOn"].is_null());

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "inventory.assignments.list",
        json!({ "itemId": item_id }),
    );
    assert_eq!(all["assignments"].as_array().expect("assignments").len(), 2);

    let ghost = request(
        &mut stdin,
        &mut reader,
        "13",
        "inventory.assign",
        json!({ "itemId": "no-such-item", "assignedTo": "Anyone", "quantity": 1 }),
    );
    assert_eq!(ghost["ok"].as_bool(), Some(false));
    assert_eq!(ghost["error"]["code"].as_str(), Some("not_found"));

    let no_quantity = request(
        &mut stdin,
        &mut reader,
        "14",
        "inventory.assign",
        json!({ "itemId": item_id, "assignedTo": "Hall 3" }),
    );
    assert_eq!(no_quantity["ok"].as_bool(), Some(false));
    assert_eq!(no_quantity["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(
        no_quantity["error"]["message"].as_str(),
        Some("missing quantity")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn item_updates_and_deletes_respect_outstanding_assignments() {
    let workspace = temp_dir("campus-inventory-guards");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bench = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "inventory.items.create",
        json!({ "name": "Lab Bench", "quantity": 2 }),
    );
    let item_id = bench["itemId"].as_str().expect("itemId").to_string();

    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "inventory.assign",
        json!({ "itemId": item_id, "assignedTo": "Physics lab", "quantity": 2 }),
    );
    let assignment_id = assignment["assignmentId"]
        .as_str()
        .expect("assignmentId")
        .to_string();

    let shrink = request(
        &mut stdin,
        &mut reader,
        "4",
        "inventory.items.update",
        json!({ "itemId": item_id, "patch": { "quantity": 1 } }),
    );
    assert_eq!(shrink["ok"].as_bool(), Some(false));
    assert_eq!(shrink["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(
        shrink["error"]["message"].as_str(),
        Some("quantity cannot drop below the outstanding assignments")
    );
    assert_eq!(shrink["error"]["details"]["outstanding"].as_i64(), Some(2));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "inventory.items.update",
        json!({ "itemId": item_id, "patch": { "location": "Annex", "quantity": 4 } }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "inventory.items.list",
        json!({}),
    );
    let row = &listed["items"].as_array().expect("items")[0];
    assert_eq!(row["location"].as_str(), Some("Annex"));
    assert_eq!(row["quantity"].as_i64(), Some(4));
    assert_eq!(row["available"].as_i64(), Some(2));

    let empty_patch = request(
        &mut stdin,
        &mut reader,
        "7",
        "inventory.items.update",
        json!({ "itemId": item_id, "patch": {} }),
    );
    assert_eq!(empty_patch["ok"].as_bool(), Some(false));
    assert_eq!(empty_patch["error"]["code"].as_str(), Some("bad_params"));

    let refused = request(
        &mut stdin,
        &mut reader,
        "8",
        "inventory.items.delete",
        json!({ "itemId": item_id }),
    );
    assert_eq!(refused["ok"].as_bool(), Some(false));
    assert_eq!(refused["error"]["code"].as_str(), Some("has_active_loans"));
    assert_eq!(refused["error"]["details"]["outstanding"].as_i64(), Some(2));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "inventory.return",
        json!({ "assignmentId": assignment_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "inventory.items.delete",
        json!({ "itemId": item_id }),
    );

    // The delete sweeps assignment history along with the item.
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "inventory.assignments.list",
        json!({}),
    );
    assert_eq!(history["assignments"].as_array().expect("assignments").len(), 0);
    let items = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "inventory.items.list",
        json!({}),
    );
    assert_eq!(items["items"].as_array().expect("items").len(), 0);

    let gone = request(
        &mut stdin,
        &mut reader,
        "13",
        "inventory.return",
        json!({ "assignmentId": assignment_id }),
    );
    assert_eq!(gone["ok"].as_bool(), Some(false));
    assert_eq!(gone["error"]["code"].as_str(), Some("not_found"));

    let _ = std::fs::remove_dir_all(workspace);
}
