use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, now_rfc3339, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn list_groups(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let mut stmt = conn.prepare(
        "SELECT id, name, ord FROM groups WHERE term_id = ? ORDER BY ord ASC, id ASC",
    )?;
    let groups = stmt
        .query_map([&term_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "order": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "groups": groups }))
}

fn upsert_group(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let id = get_required_str(params, "id")?.trim().to_string();
    if id.is_empty() {
        return Err(HandlerErr::bad_params("id must not be empty"));
    }
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    // Display order defaults to the id's first code point, which keeps
    // single-letter group ids alphabetical without an explicit order.
    let ord = params
        .get("order")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| id.chars().next().map(|c| c as i64).unwrap_or(0));
    conn.execute(
        "INSERT INTO groups(term_id, id, name, ord, updated_at) VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(term_id, id) DO UPDATE SET
           name = excluded.name,
           ord = excluded.ord,
           updated_at = excluded.updated_at",
        (&term_id, &id, &name, ord, now_rfc3339()),
    )?;
    Ok(json!({ "id": id, "name": name, "order": ord }))
}

fn delete_group(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let id = get_required_str(params, "id")?;
    conn.execute(
        "DELETE FROM groups WHERE term_id = ? AND id = ?",
        [&term_id, &id],
    )?;
    Ok(json!({ "ok": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list_groups(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_admin_write<F>(state: &mut AppState, req: &Request, op: F) -> serde_json::Value
where
    F: Fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_admin(
        &state.sessions,
        &state.root_admin_emails,
        conn,
        &req.params,
    ) {
        return e.response(&req.id);
    }
    match op(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(handle_list(state, req)),
        "groups.upsert" => Some(handle_admin_write(state, req, upsert_group)),
        "groups.delete" => Some(handle_admin_write(state, req, delete_group)),
        _ => None,
    }
}
