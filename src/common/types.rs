//! Core types used throughout the relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a captured event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// Posted notification from another app
    Notification,
    /// Incoming SMS read from the inbox
    Sms,
}

impl CaptureSource {
    pub const ALL: [CaptureSource; 2] = [CaptureSource::Notification, CaptureSource::Sms];

    /// Permission the host must grant before this source can be observed
    pub fn required_permission(self) -> Permission {
        match self {
            CaptureSource::Notification => Permission::NotificationAccess,
            CaptureSource::Sms => Permission::ReadSms,
        }
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureSource::Notification => write!(f, "notification"),
            CaptureSource::Sms => write!(f, "sms"),
        }
    }
}

/// A single message captured from a source.
///
/// Created once by a capture source and consumed once by whichever endpoint
/// receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    pub source: CaptureSource,
    pub from: String,
    pub body: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_package: Option<String>,
}

impl CapturedEvent {
    pub fn sms(from: impl Into<String>, body: impl Into<String>, timestamp: i64) -> Self {
        Self {
            source: CaptureSource::Sms,
            from: from.into(),
            body: body.into(),
            timestamp,
            origin_package: None,
        }
    }

    pub fn notification(
        package: impl Into<String>,
        from: impl Into<String>,
        body: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            source: CaptureSource::Notification,
            from: from.into(),
            body: body.into(),
            timestamp,
            origin_package: Some(package.into()),
        }
    }
}

/// Kind of execution context an endpoint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Short-lived, user-facing context
    Interactive,
    /// Long-lived background context
    Headless,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Interactive => write!(f, "interactive"),
            Role::Headless => write!(f, "headless"),
        }
    }
}

/// Host permissions gating capture subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    NotificationAccess,
    ReadSms,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::NotificationAccess => write!(f, "notification access"),
            Permission::ReadSms => write!(f, "READ_SMS"),
        }
    }
}

/// Control signal asking every attached context to flush its retry queue
pub const FORCE_RETRY: &str = "forceRetry";
