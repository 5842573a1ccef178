//! Inter-process communication between the CLI and the daemon.

pub mod client;
pub mod messages;
