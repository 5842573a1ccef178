//! Common types and utilities shared between the headless and interactive contexts.

pub mod diagnostics;
pub mod error;
pub mod offload;
pub mod paths;
pub mod store;
pub mod types;
