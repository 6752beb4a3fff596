use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::SessionEntry;
use crate::session::{ConfigSnapshot, SessionState, StudentSnapshot};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr::new("bad_params", message)
    }

    pub fn db(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::db(e)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn load_config(conn: &Connection) -> Result<Option<ConfigSnapshot>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT system_enabled, current_term_id, global_epoch FROM global_config WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, i64>(0)? != 0,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((system_enabled, current_term_id, global_epoch)) = row else {
        return Ok(None);
    };
    let mut stmt = conn.prepare("SELECT email FROM admin_emails ORDER BY email")?;
    let admin_emails = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(ConfigSnapshot {
        system_enabled,
        current_term_id,
        admin_emails,
        global_epoch,
    }))
}

/// Wire shape of the global config document; `{_missing: true}` when the
/// workspace has not been bootstrapped, matching the store's snapshot shape.
pub fn global_config_json(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    match load_config(conn)? {
        None => Ok(json!({ "_missing": true })),
        Some(cfg) => Ok(json!({
            "systemEnabled": cfg.system_enabled,
            "currentTermId": cfg.current_term_id,
            "adminEmails": cfg.admin_emails,
            "globalEpoch": cfg.global_epoch,
        })),
    }
}

pub fn user_doc_json(conn: &Connection, uid: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT email, term_id, no4, group_id, must_logout_epoch
             FROM user_docs WHERE uid = ?",
            [uid],
            |r| {
                Ok(json!({
                    "uid": uid,
                    "email": r.get::<_, String>(0)?,
                    "termId": r.get::<_, String>(1)?,
                    "no4": r.get::<_, String>(2)?,
                    "groupId": r.get::<_, String>(3)?,
                    "mustLogoutEpoch": r.get::<_, i64>(4)?,
                }))
            },
        )
        .optional()?;
    Ok(row.unwrap_or_else(|| json!({ "_missing": true, "uid": uid })))
}

pub fn load_student(
    conn: &Connection,
    term_id: &str,
    no4: &str,
) -> Result<Option<StudentSnapshot>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT no4, email, group_id, active, uid FROM students WHERE term_id = ? AND no4 = ?",
            [term_id, no4],
            |r| {
                Ok(StudentSnapshot {
                    no4: r.get(0)?,
                    email: r.get(1)?,
                    group_id: r.get(2)?,
                    active: r.get::<_, i64>(3)? != 0,
                    uid: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn require_session<'a>(
    sessions: &'a HashMap<String, SessionEntry>,
    params: &serde_json::Value,
) -> Result<(String, &'a SessionEntry), HandlerErr> {
    let sid = get_required_str(params, "sessionId")?;
    let Some(entry) = sessions.get(&sid) else {
        return Err(HandlerErr::new("permission_denied", "no such session"));
    };
    if entry.state != SessionState::Active {
        return Err(HandlerErr::new("permission_denied", "session invalidated"));
    }
    Ok((sid, entry))
}

pub fn is_admin_email(
    config: Option<&ConfigSnapshot>,
    root_admin_emails: &[String],
    email: &str,
) -> bool {
    if root_admin_emails.iter().any(|e| e == email) {
        return true;
    }
    config
        .map(|c| c.admin_emails.iter().any(|e| e == email))
        .unwrap_or(false)
}

/// Admin gate for mutating methods: an active session whose email is in the
/// root allowlist or in the stored adminEmails set.
pub fn require_admin<'a>(
    sessions: &'a HashMap<String, SessionEntry>,
    root_admin_emails: &[String],
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<&'a SessionEntry, HandlerErr> {
    let (_, entry) = require_session(sessions, params)?;
    let config = load_config(conn)?;
    if !is_admin_email(config.as_ref(), root_admin_emails, &entry.email) {
        return Err(HandlerErr::new(
            "permission_denied",
            "administrator session required",
        ));
    }
    Ok(entry)
}

pub fn current_term(conn: &Connection) -> Result<String, HandlerErr> {
    match load_config(conn)? {
        Some(cfg) => Ok(cfg.current_term_id),
        None => Err(HandlerErr::new(
            "not_bootstrapped",
            "global config is missing, run config.bootstrap",
        )),
    }
}

pub fn device_pref_get(
    conn: &Connection,
    device_id: &str,
    key: &str,
) -> Result<String, HandlerErr> {
    let v: Option<String> = conn
        .query_row(
            "SELECT value FROM device_prefs WHERE device_id = ? AND key = ?",
            [device_id, key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or_default())
}

pub fn device_pref_set(
    conn: &Connection,
    device_id: &str,
    key: &str,
    value: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO device_prefs(device_id, key, value) VALUES(?, ?, ?)
         ON CONFLICT(device_id, key) DO UPDATE SET value = excluded.value",
        [device_id, key, value],
    )?;
    Ok(())
}

pub fn device_epoch(conn: &Connection, device_id: &str) -> Result<i64, HandlerErr> {
    Ok(device_pref_get(conn, device_id, "epoch")?
        .parse::<i64>()
        .unwrap_or(0))
}
