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
    let exe = env!("CARGO_BIN_EXE_attendd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn raw_request(
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
    let value = raw_request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(resp: &serde_json::Value) -> String {
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

struct Harness {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    admin_sid: String,
}

fn setup(workspace: &PathBuf) -> (Child, Harness) {
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "setup-ws",
        "workspace.select",
        json!({
            "path": workspace.to_string_lossy(),
            "rootAdminEmails": ["admin-root@attend.local"]
        }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "setup-admin",
        "auth.adminSignIn",
        json!({ "deviceId": "dev-admin", "adminId": "root", "password": "secret1" }),
    );
    let admin_sid = admin
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "setup-boot",
        "config.bootstrap",
        json!({ "sessionId": admin_sid, "termId": "2025" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "setup-student",
        "students.upsert",
        json!({
            "sessionId": admin_sid,
            "termId": "2025",
            "no4": "0001",
            "email": "s1@x.com",
            "groupId": "A"
        }),
    );
    (
        child,
        Harness {
            stdin,
            reader,
            admin_sid,
        },
    )
}

impl Harness {
    fn sign_in_user(&mut self, id: &str, device: &str, email: &str, no4: &str) -> (String, String) {
        let res = request_ok(
            &mut self.stdin,
            &mut self.reader,
            id,
            "auth.signInOrRegister",
            json!({ "deviceId": device, "email": email, "password": "secret1", "no4": no4 }),
        );
        (
            res.get("sessionId").and_then(|v| v.as_str()).expect("sessionId").to_string(),
            res.get("uid").and_then(|v| v.as_str()).expect("uid").to_string(),
        )
    }

    fn route(&mut self, id: &str, sid: &str, device: &str) -> serde_json::Value {
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            id,
            "session.route",
            json!({ "sessionId": sid, "deviceId": device }),
        )
    }

    fn refresh(&mut self, id: &str, sid: &str, device: &str) -> serde_json::Value {
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            id,
            "session.refresh",
            json!({ "sessionId": sid, "deviceId": device }),
        )
    }
}

#[test]
fn matching_student_routes_to_user_and_binds_uid() {
    let workspace = temp_dir("attendd-route-user");
    let (_child, mut h) = setup(&workspace);

    let (sid, uid) = h.sign_in_user("u1", "dev-u1", "s1@x.com", "0001");
    let routed = h.route("r1", &sid, "dev-u1");
    assert_eq!(routed.get("destination").and_then(|v| v.as_str()), Some("user"));
    let profile = routed.get("profile").expect("profile");
    assert_eq!(profile.get("no4").and_then(|v| v.as_str()), Some("0001"));
    assert_eq!(profile.get("uid").and_then(|v| v.as_str()), Some(uid.as_str()));

    // Routing again on the same device stays on the user destination.
    let routed = h.route("r2", &sid, "dev-u1");
    assert_eq!(routed.get("destination").and_then(|v| v.as_str()), Some("user"));
}

#[test]
fn email_mismatch_terminates_the_session() {
    let workspace = temp_dir("attendd-route-mismatch");
    let (_child, mut h) = setup(&workspace);

    let (sid, _) = h.sign_in_user("u1", "dev-u1", "other@x.com", "0001");
    let routed = h.route("r1", &sid, "dev-u1");
    assert_eq!(
        routed.get("destination").and_then(|v| v.as_str()),
        Some("signedOut")
    );
    assert_eq!(
        routed.get("reason").and_then(|v| v.as_str()),
        Some("email_mismatch")
    );

    // The session is gone, so the next route lands on the login screen.
    let routed = h.route("r2", &sid, "dev-u1");
    assert_eq!(routed.get("destination").and_then(|v| v.as_str()), Some("login"));
}

#[test]
fn unknown_number_and_disabled_system_sign_out_with_reasons() {
    let workspace = temp_dir("attendd-route-reasons");
    let (_child, mut h) = setup(&workspace);

    let (sid, _) = h.sign_in_user("u1", "dev-u1", "s9@x.com", "9999");
    let routed = h.route("r1", &sid, "dev-u1");
    assert_eq!(
        routed.get("reason").and_then(|v| v.as_str()),
        Some("roster_missing")
    );

    let admin_sid = h.admin_sid.clone();
    let _ = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "disable",
        "config.setSystemEnabled",
        json!({ "sessionId": admin_sid, "enabled": false }),
    );
    let (sid, _) = h.sign_in_user("u2", "dev-u2", "s1@x.com", "0001");
    let routed = h.route("r2", &sid, "dev-u2");
    assert_eq!(
        routed.get("reason").and_then(|v| v.as_str()),
        Some("system_disabled")
    );
}

#[test]
fn admin_email_routes_to_admin_even_when_disabled() {
    let workspace = temp_dir("attendd-route-admin");
    let (_child, mut h) = setup(&workspace);

    let admin_sid = h.admin_sid.clone();
    let _ = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "disable",
        "config.setSystemEnabled",
        json!({ "sessionId": admin_sid, "enabled": false }),
    );
    let routed = h.route("r1", &admin_sid, "dev-admin");
    assert_eq!(routed.get("destination").and_then(|v| v.as_str()), Some("admin"));
    assert_eq!(routed.get("termId").and_then(|v| v.as_str()), Some("2025"));
}

#[test]
fn global_epoch_bump_invalidates_once_per_device() {
    let workspace = temp_dir("attendd-epoch-global");
    let (_child, mut h) = setup(&workspace);

    let (sid, _) = h.sign_in_user("u1", "dev-u1", "s1@x.com", "0001");
    let _ = h.route("r1", &sid, "dev-u1");
    let res = h.refresh("f1", &sid, "dev-u1");
    assert_eq!(res.get("state").and_then(|v| v.as_str()), Some("active"));

    let admin_sid = h.admin_sid.clone();
    let _ = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "bump",
        "config.bumpGlobalEpoch",
        json!({ "sessionId": admin_sid }),
    );

    let res = h.refresh("f2", &sid, "dev-u1");
    assert_eq!(res.get("state").and_then(|v| v.as_str()), Some("invalidated"));
    assert_eq!(res.get("transitioned").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        res.get("reason").and_then(|v| v.as_str()),
        Some("forced_logout")
    );

    // The latch is one-way and the device remembered the new epoch.
    let res = h.refresh("f3", &sid, "dev-u1");
    assert_eq!(res.get("transitioned").and_then(|v| v.as_bool()), Some(false));

    // Signing back in on the same device does not re-trigger on the old bump.
    let (sid2, _) = h.sign_in_user("u2", "dev-u1", "s1@x.com", "0001");
    let res = h.refresh("f4", &sid2, "dev-u1");
    assert_eq!(res.get("state").and_then(|v| v.as_str()), Some("active"));
}

#[test]
fn targeted_force_logout_kicks_only_the_named_user() {
    let workspace = temp_dir("attendd-epoch-targeted");
    let (_child, mut h) = setup(&workspace);
    let admin_sid = h.admin_sid.clone();
    let _ = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "s2",
        "students.upsert",
        json!({
            "sessionId": admin_sid,
            "termId": "2025",
            "no4": "0002",
            "email": "s2@x.com",
            "groupId": "A"
        }),
    );

    let (sid1, uid1) = h.sign_in_user("u1", "dev-u1", "s1@x.com", "0001");
    let _ = h.route("r1", &sid1, "dev-u1");
    let (sid2, _) = h.sign_in_user("u2", "dev-u2", "s2@x.com", "0002");
    let _ = h.route("r2", &sid2, "dev-u2");

    let kicked = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "kick",
        "users.forceLogout",
        json!({ "sessionId": admin_sid, "uid": uid1 }),
    );
    assert!(kicked.get("mustLogoutEpoch").and_then(|v| v.as_i64()).unwrap_or(0) > 0);

    let res = h.refresh("f1", &sid1, "dev-u1");
    assert_eq!(res.get("state").and_then(|v| v.as_str()), Some("invalidated"));
    let res = h.refresh("f2", &sid2, "dev-u2");
    assert_eq!(res.get("state").and_then(|v| v.as_str()), Some("active"));

    // Kicking an identity without a user doc is a not_found.
    let resp = raw_request(
        &mut h.stdin,
        &mut h.reader,
        "kick2",
        "users.forceLogout",
        json!({ "sessionId": admin_sid, "uid": "no-such-uid" }),
    );
    assert_eq!(error_code(&resp), "not_found");
}

#[test]
fn term_switch_clears_the_remembered_number() {
    let workspace = temp_dir("attendd-term-switch");
    let (_child, mut h) = setup(&workspace);

    let (sid, _) = h.sign_in_user("u1", "dev-u1", "s1@x.com", "0001");
    let routed = h.route("r1", &sid, "dev-u1");
    assert_eq!(routed.get("destination").and_then(|v| v.as_str()), Some("user"));

    let admin_sid = h.admin_sid.clone();
    let _ = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "term",
        "config.setCurrentTerm",
        json!({ "sessionId": admin_sid, "termId": "2026" }),
    );

    // Routing again sees the switch: the remembered number belongs to the
    // old term and is dropped before the roster checks run.
    let routed = h.route("r2", &sid, "dev-u1");
    assert_eq!(
        routed.get("destination").and_then(|v| v.as_str()),
        Some("signedOut")
    );
    assert_eq!(
        routed.get("reason").and_then(|v| v.as_str()),
        Some("no_local_number")
    );

    // A fresh sign-in re-enters the number, which now resolves against the
    // new, still-empty roster.
    let (sid2, _) = h.sign_in_user("u2", "dev-u1", "s1@x.com", "0001");
    let routed = h.route("r3", &sid2, "dev-u1");
    assert_eq!(
        routed.get("reason").and_then(|v| v.as_str()),
        Some("roster_missing")
    );
}

#[test]
fn bootstrap_is_reserved_for_the_root_allowlist() {
    let workspace = temp_dir("attendd-bootstrap-gate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({
            "path": workspace.to_string_lossy(),
            "rootAdminEmails": ["admin-root@attend.local"]
        }),
    );

    // Before bootstrap, an ordinary account routes out with a reason.
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "auth.signInOrRegister",
        json!({
            "deviceId": "dev-u1",
            "email": "s1@x.com",
            "password": "secret1",
            "no4": "0001"
        }),
    );
    let user_sid = user
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let routed = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "session.route",
        json!({ "sessionId": user_sid, "deviceId": "dev-u1" }),
    );
    assert_eq!(
        routed.get("reason").and_then(|v| v.as_str()),
        Some("not_bootstrapped")
    );

    // And cannot bootstrap either. Re-sign-in because the route removed it.
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "u2",
        "auth.signInOrRegister",
        json!({
            "deviceId": "dev-u1",
            "email": "s1@x.com",
            "password": "secret1",
            "no4": "0001"
        }),
    );
    let user_sid = user
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let resp = raw_request(
        &mut stdin,
        &mut reader,
        "boot-denied",
        "config.bootstrap",
        json!({ "sessionId": user_sid, "termId": "2025" }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    // The root admin lands on the bootstrap destination instead.
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "auth.adminSignIn",
        json!({ "deviceId": "dev-a", "adminId": "root", "password": "secret1" }),
    );
    let admin_sid = admin
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let routed = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "session.route",
        json!({ "sessionId": admin_sid, "deviceId": "dev-a" }),
    );
    assert_eq!(
        routed.get("destination").and_then(|v| v.as_str()),
        Some("bootstrap")
    );
}

#[test]
fn wrong_password_surfaces_email_in_use_and_reset_recovers() {
    let workspace = temp_dir("attendd-auth-reset");
    let (_child, mut h) = setup(&workspace);

    let _ = h.sign_in_user("u1", "dev-u1", "s1@x.com", "0001");
    let resp = raw_request(
        &mut h.stdin,
        &mut h.reader,
        "bad-pw",
        "auth.signInOrRegister",
        json!({
            "deviceId": "dev-u1",
            "email": "s1@x.com",
            "password": "wrong-pw",
            "no4": "0001"
        }),
    );
    assert_eq!(error_code(&resp), "email_in_use");

    let res = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "reset-req",
        "auth.requestPasswordReset",
        json!({ "email": "s1@x.com" }),
    );
    let token = res
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    let _ = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "reset-done",
        "auth.completePasswordReset",
        json!({ "token": token, "password": "fresh-pw" }),
    );
    let res = request_ok(
        &mut h.stdin,
        &mut h.reader,
        "u2",
        "auth.signInOrRegister",
        json!({
            "deviceId": "dev-u1",
            "email": "s1@x.com",
            "password": "fresh-pw",
            "no4": "0001"
        }),
    );
    assert_eq!(res.get("registered").and_then(|v| v.as_bool()), Some(false));
}
