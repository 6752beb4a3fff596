use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::session::SessionState;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub uid: String,
    pub email: String,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Global,
    User(String),
}

#[derive(Debug)]
pub struct Watch {
    pub target: WatchTarget,
    pub queue: Vec<serde_json::Value>,
}

/// Polled stand-in for the store's push subscriptions: writes to the global
/// config or a user doc enqueue a snapshot event on every matching watch.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    pub watches: HashMap<String, Watch>,
}

impl WatchRegistry {
    pub fn notify_global(&mut self, doc: serde_json::Value) {
        for w in self.watches.values_mut() {
            if w.target == WatchTarget::Global {
                w.queue.push(serde_json::json!({ "type": "global", "doc": doc.clone() }));
            }
        }
    }

    pub fn notify_user(&mut self, uid: &str, doc: serde_json::Value) {
        for w in self.watches.values_mut() {
            if w.target == WatchTarget::User(uid.to_string()) {
                w.queue
                    .push(serde_json::json!({ "type": "user", "uid": uid, "doc": doc.clone() }));
            }
        }
    }
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Allowlist supplied at workspace.select; lives outside the stored
    /// config so a broken config document cannot lock root admins out.
    pub root_admin_emails: Vec<String>,
    pub sessions: HashMap<String, SessionEntry>,
    pub watches: WatchRegistry,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            root_admin_emails: Vec::new(),
            sessions: HashMap::new(),
            watches: WatchRegistry::default(),
        }
    }
}
