use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_required_str, global_config_json, now_rfc3339, require_admin, require_session, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match global_config_json(conn) {
        Ok(doc) => ok(&req.id, doc),
        Err(e) => e.response(&req.id),
    }
}

fn bootstrap(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let term_id = term_id.trim().to_string();
    if term_id.is_empty() {
        return Err(HandlerErr::bad_params("termId must not be empty"));
    }
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO global_config(id, system_enabled, current_term_id, global_epoch, created_at, updated_at)
         VALUES(1, 1, ?1, 1, ?2, ?2)
         ON CONFLICT(id) DO UPDATE SET
           system_enabled = 1,
           current_term_id = excluded.current_term_id,
           global_epoch = 1,
           updated_at = excluded.updated_at",
        (&term_id, &now),
    )?;
    conn.execute(
        "INSERT INTO terms(term_id, created_at) VALUES(?, ?)
         ON CONFLICT(term_id) DO NOTHING",
        (&term_id, &now),
    )?;
    Ok(json!({ "currentTermId": term_id }))
}

fn handle_bootstrap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // Bootstrap runs before any config exists, so only the root allowlist
    // can authorize it.
    let entry = match require_session(&state.sessions, &req.params) {
        Ok((_, entry)) => entry,
        Err(e) => return e.response(&req.id),
    };
    if !state.root_admin_emails.iter().any(|e| e == &entry.email) {
        return err(
            &req.id,
            "permission_denied",
            "root administrator session required",
            None,
        );
    }
    match bootstrap(conn, &req.params) {
        Ok(result) => {
            match global_config_json(conn) {
                Ok(doc) => state.watches.notify_global(doc),
                Err(e) => return e.response(&req.id),
            }
            ok(&req.id, result)
        }
        Err(e) => e.response(&req.id),
    }
}

fn require_bootstrapped(conn: &Connection) -> Result<(), HandlerErr> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM global_config WHERE id = 1", [], |r| {
        r.get(0)
    })?;
    if n == 0 {
        return Err(HandlerErr::new(
            "not_bootstrapped",
            "global config is missing, run config.bootstrap",
        ));
    }
    Ok(())
}

fn set_system_enabled(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enabled = params
        .get("enabled")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing enabled"))?;
    require_bootstrapped(conn)?;
    conn.execute(
        "UPDATE global_config SET system_enabled = ?, updated_at = ? WHERE id = 1",
        (enabled as i64, now_rfc3339()),
    )?;
    Ok(json!({ "systemEnabled": enabled }))
}

fn bump_global_epoch(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    require_bootstrapped(conn)?;
    conn.execute(
        "UPDATE global_config SET global_epoch = global_epoch + 1, updated_at = ? WHERE id = 1",
        [now_rfc3339()],
    )?;
    let epoch: i64 = conn.query_row(
        "SELECT global_epoch FROM global_config WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    Ok(json!({ "globalEpoch": epoch }))
}

/// Term reset: registers the new term, switches to it and bumps the epoch so
/// every session from the old term is forced out.
fn set_current_term(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let term_id = term_id.trim().to_string();
    if term_id.is_empty() {
        return Err(HandlerErr::bad_params("termId must not be empty"));
    }
    require_bootstrapped(conn)?;
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO terms(term_id, created_at) VALUES(?, ?)
         ON CONFLICT(term_id) DO NOTHING",
        (&term_id, &now),
    )?;
    conn.execute(
        "UPDATE global_config SET current_term_id = ?, updated_at = ? WHERE id = 1",
        (&term_id, &now),
    )?;
    let bumped = bump_global_epoch(conn)?;
    Ok(json!({
        "currentTermId": term_id,
        "globalEpoch": bumped.get("globalEpoch").cloned().unwrap_or(json!(null)),
    }))
}

fn add_admin_email(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let email = email.trim().to_string();
    if email.is_empty() {
        return Err(HandlerErr::bad_params("email must not be empty"));
    }
    require_bootstrapped(conn)?;
    conn.execute(
        "INSERT INTO admin_emails(email) VALUES(?) ON CONFLICT(email) DO NOTHING",
        [&email],
    )?;
    Ok(json!({ "email": email }))
}

fn remove_admin_email(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    require_bootstrapped(conn)?;
    conn.execute("DELETE FROM admin_emails WHERE email = ?", [&email])?;
    Ok(json!({ "email": email }))
}

fn handle_admin_mutation<F>(state: &mut AppState, req: &Request, op: F) -> serde_json::Value
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
        Ok(result) => {
            match global_config_json(conn) {
                Ok(doc) => state.watches.notify_global(doc),
                Err(e) => return e.response(&req.id),
            }
            ok(&req.id, result)
        }
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.bootstrap" => Some(handle_bootstrap(state, req)),
        "config.setSystemEnabled" => {
            Some(handle_admin_mutation(state, req, set_system_enabled))
        }
        "config.setCurrentTerm" => Some(handle_admin_mutation(state, req, set_current_term)),
        "config.bumpGlobalEpoch" => {
            Some(handle_admin_mutation(state, req, |conn, _| bump_global_epoch(conn)))
        }
        "config.addAdminEmail" => Some(handle_admin_mutation(state, req, add_admin_email)),
        "config.removeAdminEmail" => Some(handle_admin_mutation(state, req, remove_admin_email)),
        _ => None,
    }
}
