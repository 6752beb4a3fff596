pub mod attendance;
pub mod auth_session;
pub mod config;
pub mod core;
pub mod groups;
pub mod notices;
pub mod roster;
pub mod watch;
