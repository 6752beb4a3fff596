//! Local email/password identity provider backing the login screens.
//!
//! Failure kinds are a closed enum with stable codes instead of the loose
//! provider error strings the front end used to branch on.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sign-in attempts allowed before an account is rate-limited.
pub const MAX_FAILED_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    InvalidEmail,
    WeakPassword,
    UserDisabled,
    TooManyRequests,
    EmailInUse,
    UserNotFound,
    WrongPassword,
    InvalidToken,
}

impl AuthError {
    pub fn code(self) -> &'static str {
        match self {
            AuthError::InvalidEmail => "invalid_email",
            AuthError::WeakPassword => "weak_password",
            AuthError::UserDisabled => "user_disabled",
            AuthError::TooManyRequests => "too_many_requests",
            AuthError::EmailInUse => "email_in_use",
            AuthError::UserNotFound => "user_not_found",
            AuthError::WrongPassword => "wrong_password",
            AuthError::InvalidToken => "invalid_token",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            AuthError::InvalidEmail => "email address is malformed",
            AuthError::WeakPassword => "password must be at least 6 characters",
            AuthError::UserDisabled => "this account is disabled",
            AuthError::TooManyRequests => "too many attempts, try again later",
            AuthError::EmailInUse => "email already registered, sign in or reset the password",
            AuthError::UserNotFound => "no account for this email",
            AuthError::WrongPassword => "wrong password",
            AuthError::InvalidToken => "reset token is invalid or already used",
        }
    }
}

#[derive(Debug)]
pub enum AuthOpError {
    Auth(AuthError),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for AuthOpError {
    fn from(e: rusqlite::Error) -> Self {
        AuthOpError::Db(e)
    }
}

impl From<AuthError> for AuthOpError {
    fn from(e: AuthError) -> Self {
        AuthOpError::Auth(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: String,
    pub email: String,
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<String, AuthError> {
    let e = normalize_email(email);
    let Some((local, domain)) = e.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(AuthError::InvalidEmail);
    }
    Ok(e)
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.len() < 6 {
        return Err(AuthError::WeakPassword);
    }
    Ok(())
}

struct AccountRow {
    uid: String,
    email: String,
    salt: String,
    hash: String,
    disabled: bool,
    failed_attempts: i64,
}

fn find_account(conn: &Connection, email: &str) -> rusqlite::Result<Option<AccountRow>> {
    conn.query_row(
        "SELECT uid, email, pass_salt, pass_hash, disabled, failed_attempts
         FROM auth_accounts WHERE email = ?",
        [email],
        |r| {
            Ok(AccountRow {
                uid: r.get(0)?,
                email: r.get(1)?,
                salt: r.get(2)?,
                hash: r.get(3)?,
                disabled: r.get::<_, i64>(4)? != 0,
                failed_attempts: r.get(5)?,
            })
        },
    )
    .optional()
}

pub fn register(conn: &Connection, email: &str, password: &str) -> Result<Account, AuthOpError> {
    let email = validate_email(email)?;
    validate_password(password)?;
    if find_account(conn, &email)?.is_some() {
        return Err(AuthError::EmailInUse.into());
    }
    let uid = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().to_string();
    let hash = digest(&salt, password);
    conn.execute(
        "INSERT INTO auth_accounts(uid, email, pass_salt, pass_hash, disabled, failed_attempts, created_at)
         VALUES(?, ?, ?, ?, 0, 0, ?)",
        (&uid, &email, &salt, &hash, Utc::now().to_rfc3339()),
    )?;
    Ok(Account { uid, email })
}

pub fn sign_in(conn: &Connection, email: &str, password: &str) -> Result<Account, AuthOpError> {
    let email = validate_email(email)?;
    let Some(row) = find_account(conn, &email)? else {
        return Err(AuthError::UserNotFound.into());
    };
    if row.disabled {
        return Err(AuthError::UserDisabled.into());
    }
    if row.failed_attempts >= MAX_FAILED_ATTEMPTS {
        return Err(AuthError::TooManyRequests.into());
    }
    if digest(&row.salt, password) != row.hash {
        conn.execute(
            "UPDATE auth_accounts SET failed_attempts = failed_attempts + 1 WHERE uid = ?",
            [&row.uid],
        )?;
        return Err(AuthError::WrongPassword.into());
    }
    conn.execute(
        "UPDATE auth_accounts SET failed_attempts = 0 WHERE uid = ?",
        [&row.uid],
    )?;
    Ok(Account {
        uid: row.uid,
        email: row.email,
    })
}

/// Login-or-register flow of the user tab: an unknown account is created on
/// the spot; a wrong password falls through to registration, which then
/// reports the address as already in use.
pub fn sign_in_or_register(
    conn: &Connection,
    email: &str,
    password: &str,
) -> Result<(Account, bool), AuthOpError> {
    match sign_in(conn, email, password) {
        Ok(account) => Ok((account, false)),
        Err(AuthOpError::Auth(AuthError::UserNotFound))
        | Err(AuthOpError::Auth(AuthError::WrongPassword)) => {
            let account = register(conn, email, password)?;
            Ok((account, true))
        }
        Err(e) => Err(e),
    }
}

/// Credential re-check for destructive admin actions. Same checks as sign-in.
pub fn reauthenticate(
    conn: &Connection,
    email: &str,
    password: &str,
) -> Result<Account, AuthOpError> {
    sign_in(conn, email, password)
}

/// Issues a reset token. The token stands in for the provider's reset email.
pub fn request_password_reset(conn: &Connection, email: &str) -> Result<String, AuthOpError> {
    let email = validate_email(email)?;
    let Some(row) = find_account(conn, &email)? else {
        return Err(AuthError::UserNotFound.into());
    };
    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO password_resets(token, uid, created_at) VALUES(?, ?, ?)",
        (&token, &row.uid, Utc::now().to_rfc3339()),
    )?;
    Ok(token)
}

pub fn complete_password_reset(
    conn: &Connection,
    token: &str,
    password: &str,
) -> Result<(), AuthOpError> {
    validate_password(password)?;
    let uid: Option<String> = conn
        .query_row(
            "SELECT uid FROM password_resets WHERE token = ?",
            [token],
            |r| r.get(0),
        )
        .optional()?;
    let Some(uid) = uid else {
        return Err(AuthError::InvalidToken.into());
    };
    let salt = Uuid::new_v4().to_string();
    let hash = digest(&salt, password);
    conn.execute(
        "UPDATE auth_accounts SET pass_salt = ?, pass_hash = ?, failed_attempts = 0 WHERE uid = ?",
        (&salt, &hash, &uid),
    )?;
    conn.execute("DELETE FROM password_resets WHERE token = ?", [token])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db;

    fn conn() -> Connection {
        let dir = std::env::temp_dir().join(format!("attendd-auth-{}", Uuid::new_v4()));
        open_db(&dir).expect("open db")
    }

    fn auth_err(e: AuthOpError) -> AuthError {
        match e {
            AuthOpError::Auth(a) => a,
            AuthOpError::Db(e) => panic!("unexpected db error: {e}"),
        }
    }

    #[test]
    fn register_then_sign_in_round_trip() {
        let conn = conn();
        let created = register(&conn, "A@X.com", "secret1").expect("register");
        assert_eq!(created.email, "a@x.com");
        let signed = sign_in(&conn, "a@x.com", "secret1").expect("sign in");
        assert_eq!(signed.uid, created.uid);
    }

    #[test]
    fn sign_in_or_register_creates_unknown_accounts() {
        let conn = conn();
        let (_, registered) = sign_in_or_register(&conn, "new@x.com", "secret1").expect("flow");
        assert!(registered);
        let (_, registered) = sign_in_or_register(&conn, "new@x.com", "secret1").expect("flow");
        assert!(!registered);
    }

    #[test]
    fn wrong_password_surfaces_email_in_use_via_register_fallback() {
        let conn = conn();
        register(&conn, "a@x.com", "secret1").expect("register");
        let err = sign_in_or_register(&conn, "a@x.com", "other-pw").unwrap_err();
        assert_eq!(auth_err(err), AuthError::EmailInUse);
    }

    #[test]
    fn repeated_failures_rate_limit_the_account() {
        let conn = conn();
        register(&conn, "a@x.com", "secret1").expect("register");
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = sign_in(&conn, "a@x.com", "nope-1").unwrap_err();
            assert_eq!(auth_err(err), AuthError::WrongPassword);
        }
        let err = sign_in(&conn, "a@x.com", "secret1").unwrap_err();
        assert_eq!(auth_err(err), AuthError::TooManyRequests);
    }

    #[test]
    fn reset_token_restores_access_and_is_single_use() {
        let conn = conn();
        register(&conn, "a@x.com", "secret1").expect("register");
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = sign_in(&conn, "a@x.com", "nope-1");
        }
        let token = request_password_reset(&conn, "a@x.com").expect("token");
        complete_password_reset(&conn, &token, "fresh-pw").expect("reset");
        sign_in(&conn, "a@x.com", "fresh-pw").expect("sign in after reset");
        let err = complete_password_reset(&conn, &token, "again-pw").unwrap_err();
        assert_eq!(auth_err(err), AuthError::InvalidToken);
    }

    #[test]
    fn malformed_email_and_short_password_rejected() {
        let conn = conn();
        let err = register(&conn, "not-an-email", "secret1").unwrap_err();
        assert_eq!(auth_err(err), AuthError::InvalidEmail);
        let err = register(&conn, "a@x.com", "short").unwrap_err();
        assert_eq!(auth_err(err), AuthError::WeakPassword);
    }
}
