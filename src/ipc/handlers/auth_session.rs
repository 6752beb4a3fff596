use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, AuthOpError};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    device_epoch, device_pref_get, device_pref_set, get_opt_str, get_required_str, load_config,
    load_student, now_rfc3339, require_admin, require_session, user_doc_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request, SessionEntry};
use crate::session::{decide_route, evaluate_epochs, RouteDecision, RouteInput, SessionState};

fn auth_fail(e: AuthOpError) -> HandlerErr {
    match e {
        AuthOpError::Auth(a) => HandlerErr::new(a.code(), a.message()),
        AuthOpError::Db(e) => HandlerErr::db(e),
    }
}

/// Device bookkeeping at sign-in: the remembered epoch is raised to the
/// current global epoch so only a later bump reads as new, and the current
/// term is acknowledged so the freshly entered number survives the next
/// route's term check.
fn sync_device_state(conn: &Connection, device_id: &str) -> Result<(), HandlerErr> {
    let saved = device_epoch(conn, device_id)?;
    if let Some(cfg) = load_config(conn)? {
        if cfg.global_epoch > saved {
            device_pref_set(conn, device_id, "epoch", &cfg.global_epoch.to_string())?;
        }
        device_pref_set(conn, device_id, "lastTerm", &cfg.current_term_id)?;
    }
    Ok(())
}

fn handle_sign_in_or_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;
    let device_id = match get_required_str(params, "deviceId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let email = match get_required_str(params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let no4 = match get_required_str(params, "no4") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e.response(&req.id),
    };
    if no4.len() != 4 {
        return err(&req.id, "bad_params", "no4 must be 4 characters", None);
    }

    // Remembered before the attempt, like the login form did, so a failed
    // first try still prefills the next one.
    if let Err(e) = device_pref_set(conn, &device_id, "lastNo4", &no4)
        .and_then(|_| device_pref_set(conn, &device_id, "lastEmail", &email))
    {
        return e.response(&req.id);
    }

    let (account, registered) = match auth::sign_in_or_register(conn, &email, &password) {
        Ok(v) => v,
        Err(e) => return auth_fail(e).response(&req.id),
    };
    if let Err(e) = sync_device_state(conn, &device_id) {
        return e.response(&req.id);
    }

    let session_id = Uuid::new_v4().to_string();
    state.sessions.insert(
        session_id.clone(),
        SessionEntry {
            uid: account.uid.clone(),
            email: account.email.clone(),
            state: SessionState::Active,
        },
    );
    ok(
        &req.id,
        json!({
            "sessionId": session_id,
            "uid": account.uid,
            "email": account.email,
            "registered": registered,
        }),
    )
}

fn handle_admin_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;
    let device_id = match get_required_str(params, "deviceId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let admin_id = match get_required_str(params, "adminId") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if admin_id.is_empty() {
        return err(&req.id, "bad_params", "adminId must not be empty", None);
    }
    let email = format!("admin-{}@attend.local", admin_id);
    if let Err(e) = device_pref_set(conn, &device_id, "lastAdminId", &admin_id)
        .and_then(|_| device_pref_set(conn, &device_id, "lastEmail", &email))
    {
        return e.response(&req.id);
    }

    // Root-allowlisted admin accounts are provisioned on first login; other
    // admin ids must already exist.
    let account = match auth::sign_in(conn, &email, &password) {
        Ok(v) => v,
        Err(AuthOpError::Auth(crate::auth::AuthError::UserNotFound))
            if state.root_admin_emails.iter().any(|e| e == &email) =>
        {
            match auth::register(conn, &email, &password) {
                Ok(v) => v,
                Err(e) => return auth_fail(e).response(&req.id),
            }
        }
        Err(e) => return auth_fail(e).response(&req.id),
    };
    if let Err(e) = sync_device_state(conn, &device_id) {
        return e.response(&req.id);
    }

    let session_id = Uuid::new_v4().to_string();
    state.sessions.insert(
        session_id.clone(),
        SessionEntry {
            uid: account.uid.clone(),
            email: account.email.clone(),
            state: SessionState::Active,
        },
    );
    ok(
        &req.id,
        json!({ "sessionId": session_id, "uid": account.uid, "email": account.email }),
    )
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Ok(sid) = get_required_str(&req.params, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let removed = state.sessions.remove(&sid).is_some();
    ok(&req.id, json!({ "signedOut": removed }))
}

fn handle_request_password_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match auth::request_password_reset(conn, &email) {
        Ok(token) => ok(&req.id, json!({ "token": token })),
        Err(e) => auth_fail(e).response(&req.id),
    }
}

fn handle_complete_password_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let token = match get_required_str(&req.params, "token") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match auth::complete_password_reset(conn, &token, &password) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => auth_fail(e).response(&req.id),
    }
}

fn handle_reauthenticate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let entry = match require_session(&state.sessions, &req.params) {
        Ok((_, entry)) => entry.clone(),
        Err(e) => return e.response(&req.id),
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if !email.trim().eq_ignore_ascii_case(&entry.email) {
        return err(
            &req.id,
            "permission_denied",
            "email does not match the signed-in account",
            None,
        );
    }
    match auth::reauthenticate(conn, &email, &password) {
        Ok(account) => ok(&req.id, json!({ "uid": account.uid })),
        Err(e) => auth_fail(e).response(&req.id),
    }
}

fn ensure_user_doc(
    conn: &Connection,
    uid: &str,
    email: &str,
    term_id: &str,
    no4: &str,
    group_id: &str,
) -> Result<(), HandlerErr> {
    // mustLogoutEpoch is preserved on re-route so a pending targeted kick
    // cannot be erased by the victim routing again.
    conn.execute(
        "INSERT INTO user_docs(uid, email, term_id, no4, group_id, must_logout_epoch, updated_at)
         VALUES(?, ?, ?, ?, ?, 0, ?)
         ON CONFLICT(uid) DO UPDATE SET
           email = excluded.email,
           term_id = excluded.term_id,
           no4 = excluded.no4,
           group_id = excluded.group_id,
           updated_at = excluded.updated_at",
        (uid, email, term_id, no4, group_id, now_rfc3339()),
    )?;
    Ok(())
}

fn handle_route(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let device_id = match get_required_str(&req.params, "deviceId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let sid = get_opt_str(&req.params, "sessionId");
    let entry = sid
        .as_ref()
        .and_then(|sid| state.sessions.get(sid))
        .filter(|e| e.state == SessionState::Active)
        .cloned();
    let Some(entry) = entry else {
        return ok(&req.id, json!({ "destination": "login" }));
    };
    let sid = sid.unwrap_or_default();

    let config = match load_config(conn) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let is_root = state.root_admin_emails.iter().any(|e| e == &entry.email);

    if let Some(cfg) = &config {
        // A term switch invalidates the locally remembered student number.
        let saved_term = match device_pref_get(conn, &device_id, "lastTerm") {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        if cfg.current_term_id != saved_term {
            // A fresh device has no remembered term yet; only a real switch
            // wipes the remembered student number.
            if !saved_term.is_empty() {
                if let Err(e) = device_pref_set(conn, &device_id, "lastNo4", "") {
                    return e.response(&req.id);
                }
            }
            if let Err(e) = device_pref_set(conn, &device_id, "lastTerm", &cfg.current_term_id) {
                return e.response(&req.id);
            }
        }
    }

    let device_no4 = match device_pref_get(conn, &device_id, "lastNo4") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e.response(&req.id),
    };
    let student = if let (Some(cfg), true) = (&config, device_no4.len() == 4) {
        match load_student(conn, &cfg.current_term_id, &device_no4) {
            Ok(s) => s,
            Err(e) => return e.response(&req.id),
        }
    } else {
        None
    };

    let decision = decide_route(&RouteInput {
        config: config.as_ref(),
        is_root_admin: is_root,
        session_email: &entry.email,
        session_uid: &entry.uid,
        device_no4: &device_no4,
        student: student.as_ref(),
    });

    match decision {
        RouteDecision::Bootstrap => ok(&req.id, json!({ "destination": "bootstrap" })),
        RouteDecision::Admin => {
            let term = config.map(|c| c.current_term_id).unwrap_or_default();
            ok(&req.id, json!({ "destination": "admin", "termId": term }))
        }
        RouteDecision::User => {
            let (Some(cfg), Some(student)) = (config, student) else {
                return err(&req.id, "internal", "route state out of sync", None);
            };
            if let Err(e) = ensure_user_doc(
                conn,
                &entry.uid,
                &entry.email,
                &cfg.current_term_id,
                &student.no4,
                &student.group_id,
            ) {
                return e.response(&req.id);
            }
            if student.uid.is_none() {
                // First login wins: bind the account to the roster entry.
                if let Err(e) = conn.execute(
                    "UPDATE students SET uid = ?, updated_at = ? WHERE term_id = ? AND no4 = ?",
                    (&entry.uid, now_rfc3339(), &cfg.current_term_id, &student.no4),
                ) {
                    return HandlerErr::db(e).response(&req.id);
                }
            }
            match user_doc_json(conn, &entry.uid) {
                Ok(doc) => state.watches.notify_user(&entry.uid, doc),
                Err(e) => return e.response(&req.id),
            }
            ok(
                &req.id,
                json!({
                    "destination": "user",
                    "termId": cfg.current_term_id,
                    "profile": {
                        "no4": student.no4,
                        "email": student.email,
                        "groupId": student.group_id,
                        "active": student.active,
                        "uid": entry.uid,
                    },
                }),
            )
        }
        RouteDecision::SignOut(reason) => {
            state.sessions.remove(&sid);
            ok(
                &req.id,
                json!({ "destination": "signedOut", "reason": reason.code() }),
            )
        }
    }
}

fn handle_refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sid = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let device_id = match get_required_str(&req.params, "deviceId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(entry) = state.sessions.get(&sid) else {
        return err(&req.id, "not_found", "no such session", None);
    };
    if entry.state == SessionState::Invalidated {
        // One-way latch: repeated deliveries after invalidation are quiet.
        return ok(
            &req.id,
            json!({ "state": "invalidated", "transitioned": false }),
        );
    }
    let uid = entry.uid.clone();

    let global = match load_config(conn) {
        Ok(c) => c.map(|c| c.global_epoch).unwrap_or(0),
        Err(e) => return e.response(&req.id),
    };
    let saved = match device_epoch(conn, &device_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let must: i64 = match conn
        .query_row(
            "SELECT must_logout_epoch FROM user_docs WHERE uid = ?",
            [&uid],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v.unwrap_or(0),
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };

    let outcome = evaluate_epochs(saved, global, must);
    if !outcome.invalidate {
        return ok(&req.id, json!({ "state": "active", "transitioned": false }));
    }
    if let Err(e) = device_pref_set(conn, &device_id, "epoch", &outcome.remembered.to_string()) {
        return e.response(&req.id);
    }
    if let Some(entry) = state.sessions.get_mut(&sid) {
        entry.state = SessionState::Invalidated;
    }
    ok(
        &req.id,
        json!({
            "state": "invalidated",
            "transitioned": true,
            "reason": "forced_logout",
        }),
    )
}

fn handle_force_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let uid = match get_required_str(&req.params, "uid") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row: Option<(String, String, i64)> = match conn
        .query_row(
            "SELECT term_id, no4, must_logout_epoch FROM user_docs WHERE uid = ?",
            [&uid],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    let Some((term_id, no4, current)) = row else {
        return err(&req.id, "not_found", "no user doc for this uid", None);
    };
    let global = match load_config(conn) {
        Ok(c) => c.map(|c| c.global_epoch).unwrap_or(0),
        Err(e) => return e.response(&req.id),
    };
    // Past every base the target could have remembered.
    let next = global.max(current) + 1;

    let now = now_rfc3339();
    if let Err(e) = conn.execute(
        "UPDATE user_docs SET must_logout_epoch = ?, updated_at = ? WHERE uid = ?",
        (next, &now, &uid),
    ) {
        return HandlerErr::db(e).response(&req.id);
    }
    if let Err(e) = conn.execute(
        "UPDATE students SET must_logout_epoch = ?, updated_at = ? WHERE term_id = ? AND no4 = ?",
        (next, &now, &term_id, &no4),
    ) {
        return HandlerErr::db(e).response(&req.id);
    }
    match user_doc_json(conn, &uid) {
        Ok(doc) => state.watches.notify_user(&uid, doc),
        Err(e) => return e.response(&req.id),
    }
    ok(&req.id, json!({ "uid": uid, "mustLogoutEpoch": next }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.signInOrRegister" => Some(handle_sign_in_or_register(state, req)),
        "auth.adminSignIn" => Some(handle_admin_sign_in(state, req)),
        "auth.signOut" => Some(handle_sign_out(state, req)),
        "auth.requestPasswordReset" => Some(handle_request_password_reset(state, req)),
        "auth.completePasswordReset" => Some(handle_complete_password_reset(state, req)),
        "auth.reauthenticate" => Some(handle_reauthenticate(state, req)),
        "session.route" => Some(handle_route(state, req)),
        "session.refresh" => Some(handle_refresh(state, req)),
        "users.forceLogout" => Some(handle_force_logout(state, req)),
        _ => None,
    }
}
