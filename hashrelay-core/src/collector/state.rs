//! Live delivery status shared between the engine and observers.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome (or phase) of the most recent delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Idle,
    Sending,
    Success,
    Failure,
    NoConnection,
    Busy,
    NoEntries,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Idle => "idle",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failure => "failure",
            DeliveryStatus::NoConnection => "no_connection",
            DeliveryStatus::Busy => "busy",
            DeliveryStatus::NoEntries => "no_entries",
        }
    }

    /// True when nothing is left to deliver (sent, or nothing to send)
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::NoEntries)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the delivery engine's status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryState {
    pub status: DeliveryStatus,
    /// Report attempt in progress, 0 when not sending
    pub current_attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last thing the collector (or the transport) said, kept verbatim
    pub last_response: Option<serde_json::Value>,
}

impl DeliveryState {
    /// Whether the collector's last word was a busy signal
    pub fn collector_busy(&self) -> bool {
        self.last_response
            .as_ref()
            .and_then(|r| r.get("status"))
            .and_then(serde_json::Value::as_str)
            .is_some_and(|s| s.eq_ignore_ascii_case("busy"))
    }
}

/// Mutex-guarded [`DeliveryState`], separate from the enabled flag.
#[derive(Debug, Default)]
pub(crate) struct StateCell(Mutex<DeliveryState>);

impl StateCell {
    pub(crate) fn snapshot(&self) -> DeliveryState {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut DeliveryState)) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }
}
