//! Capture SMS and notification events and relay them to whichever context
//! is alive to receive them.

pub mod common;
pub mod daemon;
pub mod ipc;
pub mod relay;
pub mod sources;
