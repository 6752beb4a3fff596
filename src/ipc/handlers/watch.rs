use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, global_config_json, is_admin_email, load_config,
    require_session, user_doc_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Watch, WatchTarget};

/// Opens a polled watch on the global config or on one user doc. The current
/// snapshot is queued right away, mirroring the store's initial snapshot
/// delivery, so the first poll never races a missed write.
fn handle_subscribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let entry = match require_session(&state.sessions, &req.params) {
        Ok((_, entry)) => entry.clone(),
        Err(e) => return e.response(&req.id),
    };
    let target = match get_required_str(&req.params, "target") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let (target, initial) = match target.as_str() {
        "global" => {
            let doc = match global_config_json(conn) {
                Ok(doc) => doc,
                Err(e) => return e.response(&req.id),
            };
            (WatchTarget::Global, json!({ "type": "global", "doc": doc }))
        }
        "user" => {
            // Watching another identity's doc is an admin-only view.
            let uid = get_opt_str(&req.params, "uid").unwrap_or_else(|| entry.uid.clone());
            if uid != entry.uid {
                let config = match load_config(conn) {
                    Ok(c) => c,
                    Err(e) => return e.response(&req.id),
                };
                if !is_admin_email(config.as_ref(), &state.root_admin_emails, &entry.email) {
                    return HandlerErr::new(
                        "permission_denied",
                        "only administrators may watch other users",
                    )
                    .response(&req.id);
                }
            }
            let doc = match user_doc_json(conn, &uid) {
                Ok(doc) => doc,
                Err(e) => return e.response(&req.id),
            };
            let event = json!({ "type": "user", "uid": uid, "doc": doc });
            (WatchTarget::User(uid), event)
        }
        _ => return err(&req.id, "bad_params", "target must be global or user", None),
    };

    let watch_id = Uuid::new_v4().to_string();
    state.watches.watches.insert(
        watch_id.clone(),
        Watch {
            target,
            queue: vec![initial],
        },
    );
    ok(&req.id, json!({ "watchId": watch_id }))
}

fn handle_poll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let watch_id = match get_required_str(&req.params, "watchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(watch) = state.watches.watches.get_mut(&watch_id) else {
        return err(&req.id, "not_found", "no such watch", None);
    };
    let events = std::mem::take(&mut watch.queue);
    ok(&req.id, json!({ "events": events }))
}

fn handle_unsubscribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    let watch_id = match get_required_str(&req.params, "watchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let removed = state.watches.watches.remove(&watch_id).is_some();
    ok(&req.id, json!({ "removed": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "watch.subscribe" => Some(handle_subscribe(state, req)),
        "watch.poll" => Some(handle_poll(state, req)),
        "watch.unsubscribe" => Some(handle_unsubscribe(state, req)),
        _ => None,
    }
}
