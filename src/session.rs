//! Session routing and the epoch-based forced-logout decision.
//!
//! Both are pure: the IPC handlers fetch the snapshots and apply the
//! side effects (sign-out, device bookkeeping, uid binding).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochOutcome {
    pub invalidate: bool,
    /// Epoch value the device should remember after this evaluation, so a
    /// signed-out-and-back-in session does not re-trigger on the same value.
    pub remembered: i64,
}

/// Forced-logout check. `remembered` is the device-persisted epoch, `global`
/// the current globalEpoch, `must_logout` the user doc's mustLogoutEpoch.
/// A global bump past the remembered value invalidates everyone; a targeted
/// mustLogoutEpoch past base = max(remembered, global) invalidates one user.
pub fn evaluate_epochs(remembered: i64, global: i64, must_logout: i64) -> EpochOutcome {
    if global > remembered {
        return EpochOutcome {
            invalidate: true,
            remembered: global,
        };
    }
    let base = remembered.max(global);
    if must_logout > base {
        return EpochOutcome {
            invalidate: true,
            remembered: must_logout,
        };
    }
    EpochOutcome {
        invalidate: false,
        remembered: base,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    NotBootstrapped,
    SystemDisabled,
    NoLocalNumber,
    RosterMissing,
    EmailMismatch,
    UidMismatch,
}

impl SignOutReason {
    pub fn code(self) -> &'static str {
        match self {
            SignOutReason::NotBootstrapped => "not_bootstrapped",
            SignOutReason::SystemDisabled => "system_disabled",
            SignOutReason::NoLocalNumber => "no_local_number",
            SignOutReason::RosterMissing => "roster_missing",
            SignOutReason::EmailMismatch => "email_mismatch",
            SignOutReason::UidMismatch => "uid_mismatch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub system_enabled: bool,
    pub current_term_id: String,
    pub admin_emails: Vec<String>,
    pub global_epoch: i64,
}

#[derive(Debug, Clone)]
pub struct StudentSnapshot {
    pub no4: String,
    pub email: String,
    pub group_id: String,
    pub active: bool,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Bootstrap,
    Admin,
    User,
    SignOut(SignOutReason),
}

pub struct RouteInput<'a> {
    pub config: Option<&'a ConfigSnapshot>,
    pub is_root_admin: bool,
    pub session_email: &'a str,
    pub session_uid: &'a str,
    pub device_no4: &'a str,
    /// Roster entry for `device_no4` in the current term, if any.
    pub student: Option<&'a StudentSnapshot>,
}

/// Destination for an authenticated identity. Every SignOut branch requires
/// the caller to terminate the session before re-presenting the entry screen.
pub fn decide_route(input: &RouteInput) -> RouteDecision {
    let Some(config) = input.config else {
        if input.is_root_admin {
            return RouteDecision::Bootstrap;
        }
        return RouteDecision::SignOut(SignOutReason::NotBootstrapped);
    };

    // adminEmails matches exactly, as the stored list is admin-entered.
    let listed = config
        .admin_emails
        .iter()
        .any(|e| e == input.session_email);
    if input.is_root_admin || listed {
        return RouteDecision::Admin;
    }

    if !config.system_enabled {
        return RouteDecision::SignOut(SignOutReason::SystemDisabled);
    }

    if input.device_no4.len() != 4 {
        return RouteDecision::SignOut(SignOutReason::NoLocalNumber);
    }

    let Some(student) = input.student else {
        return RouteDecision::SignOut(SignOutReason::RosterMissing);
    };
    if !student.active {
        return RouteDecision::SignOut(SignOutReason::RosterMissing);
    }

    if !student.email.eq_ignore_ascii_case(input.session_email) {
        return RouteDecision::SignOut(SignOutReason::EmailMismatch);
    }

    if let Some(bound) = &student.uid {
        if bound != input.session_uid {
            return RouteDecision::SignOut(SignOutReason::UidMismatch);
        }
    }

    RouteDecision::User
}
