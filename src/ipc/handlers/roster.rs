use std::collections::HashMap;

use crate::auth::{self, AuthOpError};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    current_term, get_required_str, now_rfc3339, require_admin, HandlerErr,
};
use crate::ipc::types::{AppState, Request, SessionEntry};
use crate::roster_csv::{self, ImportError};
use rusqlite::Connection;
use serde_json::json;

fn is_no4(s: &str) -> bool {
    s.len() == 4 && s.chars().all(|c| c.is_ascii_digit())
}

fn list_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let mut stmt = conn.prepare(
        "SELECT no4, email, group_id, active, uid, must_logout_epoch
         FROM students WHERE term_id = ? ORDER BY no4 ASC",
    )?;
    let students = stmt
        .query_map([&term_id], |r| {
            Ok(json!({
                "no4": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "groupId": r.get::<_, String>(2)?,
                "active": r.get::<_, i64>(3)? != 0,
                "uid": r.get::<_, Option<String>>(4)?,
                "mustLogoutEpoch": r.get::<_, i64>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn upsert_student_row(
    conn: &Connection,
    term_id: &str,
    no4: &str,
    email: &str,
    group_id: &str,
    active: bool,
) -> Result<(), HandlerErr> {
    // Admin upserts reset the uid binding, so a re-imported student can log
    // in from a fresh account.
    conn.execute(
        "INSERT INTO students(term_id, no4, email, group_id, active, uid, updated_at)
         VALUES(?, ?, ?, ?, ?, NULL, ?)
         ON CONFLICT(term_id, no4) DO UPDATE SET
           email = excluded.email,
           group_id = excluded.group_id,
           active = excluded.active,
           uid = NULL,
           updated_at = excluded.updated_at",
        (term_id, no4, email, group_id, active as i64, now_rfc3339()),
    )?;
    Ok(())
}

fn upsert_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let no4 = get_required_str(params, "no4")?.trim().to_string();
    let email = get_required_str(params, "email")?.trim().to_string();
    let group_id = get_required_str(params, "groupId")?.trim().to_string();
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
    if !is_no4(&no4) {
        return Err(HandlerErr::bad_params("no4 must be exactly 4 digits"));
    }
    if email.is_empty() {
        return Err(HandlerErr::bad_params("email must not be empty"));
    }
    if group_id.is_empty() {
        return Err(HandlerErr::bad_params("groupId must not be empty"));
    }
    upsert_student_row(conn, &term_id, &no4, &email, &group_id, active)?;
    Ok(json!({ "no4": no4 }))
}

fn delete_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let no4 = get_required_str(params, "no4")?;
    conn.execute(
        "DELETE FROM students WHERE term_id = ? AND no4 = ?",
        [&term_id, &no4],
    )?;
    Ok(json!({ "ok": true }))
}

fn clear_uid(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let no4 = get_required_str(params, "no4")?;
    let changed = conn.execute(
        "UPDATE students SET uid = NULL, updated_at = ? WHERE term_id = ? AND no4 = ?",
        (now_rfc3339(), &term_id, &no4),
    )?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Whole-roster deletion re-checks the admin's own credentials first.
fn delete_all_students(
    conn: &Connection,
    entry: &SessionEntry,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    if !email.trim().eq_ignore_ascii_case(&entry.email) {
        return Err(HandlerErr::new(
            "permission_denied",
            "email does not match the signed-in administrator",
        ));
    }
    match auth::reauthenticate(conn, &email, &password) {
        Ok(_) => {}
        Err(AuthOpError::Auth(a)) => return Err(HandlerErr::new(a.code(), a.message())),
        Err(AuthOpError::Db(e)) => return Err(HandlerErr::db(e)),
    }
    let term_id = current_term(conn)?;
    let deleted = conn.execute("DELETE FROM students WHERE term_id = ?", [&term_id])?;
    Ok(json!({ "deleted": deleted }))
}

fn group_lookup(conn: &Connection, term_id: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT id, name FROM groups WHERE term_id = ?")?;
    let rows = stmt
        .query_map([term_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut map = HashMap::new();
    for (id, name) in rows {
        let id = id.trim().to_string();
        let name = name.trim().to_string();
        if !id.is_empty() {
            map.insert(id.to_lowercase(), id.clone());
        }
        if !name.is_empty() {
            map.insert(name.to_lowercase(), id);
        }
    }
    Ok(map)
}

/// Applies a CSV import: header inference and row cleanup happen up front,
/// then rows are upserted one by one. There is no rollback; rows written
/// before a failure stay written, matching the one-document-at-a-time store.
fn import_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let csv = get_required_str(params, "csv")?;
    let lookup = group_lookup(conn, &term_id)?;
    let plan = match roster_csv::plan_import(&csv, &lookup) {
        Ok(plan) => plan,
        Err(ImportError::Empty) => {
            return Err(HandlerErr::bad_params("csv is empty"));
        }
        Err(ImportError::MissingColumns {
            number,
            email,
            group,
        }) => {
            return Err(HandlerErr {
                code: "csv_missing_columns",
                message: "header must include student number, email and group columns"
                    .to_string(),
                details: Some(json!({
                    "numberMissing": number,
                    "emailMissing": email,
                    "groupMissing": group,
                })),
            });
        }
    };
    let mut imported = 0usize;
    for row in &plan.rows {
        upsert_student_row(conn, &term_id, &row.no4, &row.email, &row.group_id, true)?;
        imported += 1;
    }
    Ok(json!({ "imported": imported, "skipped": plan.skipped }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list_students(conn, &req.params) {
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

fn handle_delete_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let entry = match require_admin(
        &state.sessions,
        &state.root_admin_emails,
        conn,
        &req.params,
    ) {
        Ok(entry) => entry.clone(),
        Err(e) => return e.response(&req.id),
    };
    match delete_all_students(conn, &entry, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.upsert" => Some(handle_admin_write(state, req, upsert_student)),
        "students.delete" => Some(handle_admin_write(state, req, delete_student)),
        "students.clearUid" => Some(handle_admin_write(state, req, clear_uid)),
        "students.deleteAll" => Some(handle_delete_all(state, req)),
        "students.importCsv" => Some(handle_admin_write(state, req, import_csv)),
        _ => None,
    }
}
