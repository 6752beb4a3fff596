use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    current_term, get_required_str, is_admin_email, load_config, now_rfc3339, require_session,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request, SessionEntry};
use crate::rates::{aggregate_rates, DayRecord, StudentRef};

const KNOWN_STATUSES: [&str; 4] = ["present", "absent", "late", "early"];

fn validate_date_id(date_id: &str) -> Result<(), HandlerErr> {
    NaiveDate::parse_from_str(date_id, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| HandlerErr::bad_params("dateId must be YYYY-MM-DD"))
}

fn record_json(conn: &Connection, term_id: &str, date_id: &str, no4: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    let rec = conn
        .query_row(
            "SELECT status, note, updated_at FROM attendance_records
             WHERE term_id = ? AND date_id = ? AND no4 = ?",
            [term_id, date_id, no4],
            |r| {
                Ok(json!({
                    "no4": no4,
                    "status": r.get::<_, String>(0)?,
                    "note": r.get::<_, String>(1)?,
                    "updatedAt": r.get::<_, String>(2)?,
                }))
            },
        )
        .optional()?;
    Ok(rec)
}

/// The submitter must be the student bound to the target no4 (through the
/// user doc created at routing time) or an administrator.
fn may_submit_for(
    conn: &Connection,
    root_admin_emails: &[String],
    entry: &SessionEntry,
    term_id: &str,
    no4: &str,
) -> Result<bool, HandlerErr> {
    let config = load_config(conn)?;
    if is_admin_email(config.as_ref(), root_admin_emails, &entry.email) {
        return Ok(true);
    }
    let own: Option<(String, String)> = conn
        .query_row(
            "SELECT term_id, no4 FROM user_docs WHERE uid = ?",
            [&entry.uid],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(matches!(own, Some((t, n)) if t == term_id && n == no4))
}

fn submit(
    conn: &Connection,
    root_admin_emails: &[String],
    entry: &SessionEntry,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date_id = get_required_str(params, "dateId")?;
    let no4 = get_required_str(params, "no4")?;
    let status = get_required_str(params, "status")?;
    let note = params
        .get("note")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    validate_date_id(&date_id)?;
    if !KNOWN_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(
            "status must be one of present/absent/late/early",
        ));
    }
    if status != "present" && note.is_empty() {
        return Err(HandlerErr::bad_params(
            "a note is required for absent/late/early",
        ));
    }
    let term_id = current_term(conn)?;
    if !may_submit_for(conn, root_admin_emails, entry, &term_id, &no4)? {
        return Err(HandlerErr::new(
            "permission_denied",
            "session is not bound to this student number",
        ));
    }

    let now = now_rfc3339();
    // Submitting a record registers the date as a counted day.
    conn.execute(
        "INSERT INTO days(term_id, date_id, updated_at) VALUES(?1, ?2, ?3)
         ON CONFLICT(term_id, date_id) DO UPDATE SET updated_at = excluded.updated_at",
        (&term_id, &date_id, &now),
    )?;
    // Last write wins, no history.
    conn.execute(
        "INSERT INTO attendance_records(term_id, date_id, no4, status, note, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(term_id, date_id, no4) DO UPDATE SET
           status = excluded.status,
           note = excluded.note,
           updated_at = excluded.updated_at",
        (&term_id, &date_id, &no4, &status, &note, &now),
    )?;
    Ok(json!({ "termId": term_id, "dateId": date_id, "no4": no4 }))
}

fn get_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let date_id = get_required_str(params, "dateId")?;
    let no4 = get_required_str(params, "no4")?;
    let rec = record_json(conn, &term_id, &date_id, &no4)?;
    Ok(json!({ "record": rec }))
}

/// Per-group board for one date: every active member with their filed status
/// or "none" when nothing was filed.
fn board(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date_id = get_required_str(params, "dateId")?;
    let group_id = get_required_str(params, "groupId")?;
    let term_id = match params.get("termId").and_then(|v| v.as_str()) {
        Some(t) => t.to_string(),
        None => current_term(conn)?,
    };
    validate_date_id(&date_id)?;

    let mut stmt = conn.prepare(
        "SELECT no4 FROM students
         WHERE term_id = ? AND group_id = ? AND active = 1
         ORDER BY no4 ASC",
    )?;
    let members = stmt
        .query_map([&term_id, &group_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::new();
    for no4 in members {
        let rec = record_json(conn, &term_id, &date_id, &no4)?;
        let (status, note) = match &rec {
            Some(r) => (
                r.get("status").and_then(|v| v.as_str()).unwrap_or("none").to_string(),
                r.get("note").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            ),
            None => ("none".to_string(), String::new()),
        };
        rows.push(json!({ "no4": no4, "status": status, "note": note }));
    }
    Ok(json!({ "dateId": date_id, "groupId": group_id, "rows": rows }))
}

fn list_days(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let mut stmt =
        conn.prepare("SELECT date_id FROM days WHERE term_id = ? ORDER BY date_id ASC")?;
    let days = stmt
        .query_map([&term_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "days": days }))
}

/// Attendance-rate report. The store serves records per day, so this loads
/// one record set per counted day and assembles the totals here.
fn rates(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;

    let mut stmt = conn.prepare(
        "SELECT no4, group_id, email FROM students WHERE term_id = ? ORDER BY no4 ASC",
    )?;
    let students = stmt
        .query_map([&term_id], |r| {
            Ok(StudentRef {
                no4: r.get(0)?,
                group_id: r.get(1)?,
                email: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt =
        conn.prepare("SELECT date_id FROM days WHERE term_id = ? ORDER BY date_id ASC")?;
    let day_ids = stmt
        .query_map([&term_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records_by_day: HashMap<String, Vec<DayRecord>> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT no4, status FROM attendance_records
         WHERE term_id = ? AND date_id = ? ORDER BY no4 ASC",
    )?;
    for day_id in &day_ids {
        let recs = stmt
            .query_map([&term_id, day_id], |r| {
                Ok(DayRecord {
                    no4: r.get(0)?,
                    status: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        records_by_day.insert(day_id.clone(), recs);
    }

    let rows = aggregate_rates(&students, &day_ids, &records_by_day);
    let rows_json = rows
        .iter()
        .map(|r| serde_json::to_value(r).unwrap_or(json!({})))
        .collect::<Vec<_>>();
    Ok(json!({ "totalDays": day_ids.len(), "rows": rows_json }))
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let entry = match require_session(&state.sessions, &req.params) {
        Ok((_, entry)) => entry.clone(),
        Err(e) => return e.response(&req.id),
    };
    match submit(conn, &state.root_admin_emails, &entry, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_read<F>(state: &mut AppState, req: &Request, op: F) -> serde_json::Value
where
    F: Fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match op(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.submit" => Some(handle_submit(state, req)),
        "attendance.get" => Some(handle_read(state, req, get_record)),
        "attendance.board" => Some(handle_read(state, req, board)),
        "attendance.rates" => Some(handle_read(state, req, rates)),
        "days.list" => Some(handle_read(state, req, list_days)),
        _ => None,
    }
}
