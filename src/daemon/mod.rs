//! Headless context: lifecycle, host promotion and the daemon socket server.

pub mod control;
pub mod controller;
pub mod endpoint;
pub mod host;
pub mod server;
