use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, now_rfc3339, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn list_notices(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let limit = params.get("limit").and_then(|v| v.as_i64()).unwrap_or(20);
    if limit < 1 {
        return Err(HandlerErr::bad_params("limit must be positive"));
    }
    let mut stmt = conn.prepare(
        "SELECT id, title, body, text, created_at FROM notices
         WHERE term_id = ?
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let notices = stmt
        .query_map((&term_id, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, Option<String>>(1)?,
                "body": r.get::<_, Option<String>>(2)?,
                "text": r.get::<_, Option<String>>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notices": notices }))
}

/// Notices are append-only: either a titled post (title + body) or a one-line
/// free-text entry.
fn add_notice(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let title = params
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let body = params
        .get("body")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let text = params
        .get("text")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    match (title, body, text) {
        (Some(title), Some(body), _) => {
            conn.execute(
                "INSERT INTO notices(id, term_id, title, body, text, created_at)
                 VALUES(?, ?, ?, ?, NULL, ?)",
                (&id, &term_id, title, body, &now),
            )?;
        }
        (_, _, Some(text)) => {
            conn.execute(
                "INSERT INTO notices(id, term_id, title, body, text, created_at)
                 VALUES(?, ?, NULL, NULL, ?, ?)",
                (&id, &term_id, text, &now),
            )?;
        }
        _ => {
            return Err(HandlerErr::bad_params(
                "provide title and body, or free text",
            ));
        }
    }
    Ok(json!({ "noticeId": id }))
}

fn delete_notice(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let notice_id = get_required_str(params, "noticeId")?;
    conn.execute(
        "DELETE FROM notices WHERE term_id = ? AND id = ?",
        [&term_id, &notice_id],
    )?;
    Ok(json!({ "ok": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list_notices(conn, &req.params) {
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
        "notices.list" => Some(handle_list(state, req)),
        "notices.add" => Some(handle_admin_write(state, req, add_notice)),
        "notices.delete" => Some(handle_admin_write(state, req, delete_notice)),
        _ => None,
    }
}
