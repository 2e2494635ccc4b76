#![forbid(unsafe_code)]

// Deskshare library - session and signaling core of a multi-user remote desktop server

pub mod auth;
pub mod capture;
pub mod config;
pub mod desktop;
pub mod media;
pub mod metrics;
pub mod session;
pub mod signaling;
pub mod turn;
