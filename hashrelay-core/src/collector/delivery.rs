//! Probe → encrypt → report → acknowledge.
//!
//! [`DeliveryEngine::send_now`] ships the whole pending queue as one
//! encrypted batch. Sent records leave the queue only after the collector
//! acknowledges the report, so every record is delivered at least once.
//! Records appended while a send is in flight stay queued for the next one.
//! Every failure ends up in [`DeliveryState`]; nothing escapes to callers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::SenderConfig;
use crate::error::{Error, Result};
use crate::record::PendingRecord;
use crate::store::RecordStore;

use super::client::Transport;
use super::endpoint::{EndpointResolver, Endpoints};
use super::envelope::{Envelope, PayloadEncryptor};
use super::state::{DeliveryState, DeliveryStatus, StateCell};

/// Timing and acknowledgment policy for one engine
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Backoff after a busy probe or exhausted attempts
    pub poll_interval: Duration,
    /// Pause between report attempts within one send
    pub retry_delay: Duration,
    pub max_attempts: u32,
    /// Accept a 200 whose body is not JSON
    pub optimistic_success: bool,
}

impl DeliverySettings {
    pub fn from_config(config: &SenderConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            retry_delay: config.retry_delay(),
            max_attempts: config.max_attempts,
            optimistic_success: config.optimistic_success,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from_config(&SenderConfig::default())
    }
}

/// Result of the availability probe
enum Probe {
    Ready,
    Busy,
    Unavailable,
}

/// How the collector answered one report attempt
enum Ack {
    Accepted,
    Rejected(String),
    HttpStatus(u16),
}

pub struct DeliveryEngine {
    store: Arc<RecordStore>,
    resolver: Arc<EndpointResolver>,
    transport: Arc<dyn Transport>,
    encryptor: PayloadEncryptor,
    settings: DeliverySettings,
    state: StateCell,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<RecordStore>,
        resolver: Arc<EndpointResolver>,
        transport: Arc<dyn Transport>,
        encryptor: PayloadEncryptor,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            resolver,
            transport,
            encryptor,
            settings,
            state: StateCell::default(),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Copy of the current delivery state
    pub fn state(&self) -> DeliveryState {
        self.state.snapshot()
    }

    /// Record that the collector could not be located this cycle.
    pub fn mark_no_connection(&self, reason: &str) {
        self.state.update(|s| {
            s.status = DeliveryStatus::NoConnection;
            s.last_response = Some(Value::String(reason.to_string()));
        });
    }

    /// Record a failed cycle that never reached the network.
    pub fn mark_failure(&self, reason: &str) {
        self.state.update(|s| {
            s.status = DeliveryStatus::Failure;
            s.last_response = Some(Value::String(reason.to_string()));
        });
    }

    /// Deliver every pending record as one batch.
    ///
    /// Returns the final status; [`DeliveryStatus::is_success`] tells whether
    /// the queue is now drained.
    pub fn send_now(&self) -> DeliveryStatus {
        self.state.update(|s| {
            s.status = DeliveryStatus::Idle;
            s.current_attempt = 0;
            s.next_retry_at = None;
            s.last_response = None;
        });

        let records = match self.store.read_all() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Failed reading pending records");
                return self.fail(DeliveryStatus::Failure, e.to_string());
            }
        };

        if records.is_empty() {
            tracing::info!("No pending records to send");
            self.state.update(|s| s.status = DeliveryStatus::NoEntries);
            return DeliveryStatus::NoEntries;
        }

        let Some(endpoints) = self.resolver.current() else {
            tracing::info!("Collector address unknown; skipping send");
            return self.fail(
                DeliveryStatus::NoConnection,
                "collector address unknown".to_string(),
            );
        };

        tracing::info!(
            count = records.len(),
            check_url = %endpoints.check_url,
            "Checking collector availability"
        );

        match self.probe(&endpoints) {
            Probe::Ready => {}
            Probe::Busy => {
                tracing::info!("Collector is busy; will retry later");
                self.state.update(|s| {
                    s.status = DeliveryStatus::Failure;
                    s.next_retry_at = Some(after(self.settings.poll_interval));
                });
                return DeliveryStatus::Failure;
            }
            Probe::Unavailable => {
                self.state.update(|s| s.status = DeliveryStatus::NoConnection);
                return DeliveryStatus::NoConnection;
            }
        }

        let envelope = match serde_json::to_vec(&records)
            .map_err(Error::from)
            .and_then(|payload| self.encryptor.encrypt(&payload))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to prepare encrypted payload");
                return self.fail(DeliveryStatus::Failure, e.to_string());
            }
        };

        self.deliver(&endpoints, &envelope, &records)
    }

    fn probe(&self, endpoints: &Endpoints) -> Probe {
        let reply = match self.transport.get(&endpoints.check_url) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::info!(error = %e, "Collector check failed");
                self.set_response(Value::String(e.to_string()));
                return Probe::Unavailable;
            }
        };

        if !reply.is_success() {
            tracing::info!(status = reply.status, "Collector check returned an error status");
            self.set_response(Value::String(format!("HTTP {}", reply.status)));
            return Probe::Unavailable;
        }

        let json: Value = match serde_json::from_str(&reply.body) {
            Ok(json @ Value::Object(_)) => json,
            _ => {
                tracing::warn!(body = %reply.body, "Collector check returned non-JSON response");
                self.set_response(Value::String(format!("Invalid JSON: {:?}", reply.body)));
                return Probe::Unavailable;
            }
        };

        let status = status_field(&json);
        tracing::debug!(response = %json, "Collector check response");
        self.set_response(json);

        match status.as_str() {
            "ok" => Probe::Ready,
            "busy" => Probe::Busy,
            other => {
                tracing::warn!(status = other, "Collector check returned unexpected status");
                Probe::Unavailable
            }
        }
    }

    fn deliver(
        &self,
        endpoints: &Endpoints,
        envelope: &Envelope,
        records: &[PendingRecord],
    ) -> DeliveryStatus {
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            self.state.update(|s| {
                s.status = DeliveryStatus::Sending;
                s.current_attempt = attempt;
                s.next_retry_at = None;
            });

            tracing::info!(attempt, max_attempts, "Posting report");

            match self.post_report(&endpoints.report_url, envelope) {
                Ok(Ack::Accepted) => return self.acknowledge(records),
                Ok(Ack::Rejected(status)) => {
                    tracing::warn!(
                        attempt,
                        status = %status,
                        "Collector did not accept report; keeping records"
                    );
                }
                Ok(Ack::HttpStatus(code)) => {
                    tracing::warn!(attempt, status = code, "Report POST failed");
                }
                Err(e) => {
                    tracing::info!(attempt, error = %e, "Report POST failed");
                    self.set_response(Value::String(e.to_string()));
                }
            }

            if attempt < max_attempts {
                let delay = self.settings.retry_delay;
                self.state.update(|s| s.next_retry_at = Some(after(delay)));
                thread::sleep(delay);
            }
        }

        tracing::warn!(max_attempts, "All report attempts failed; will retry later");
        self.state.update(|s| {
            s.status = DeliveryStatus::Failure;
            s.current_attempt = 0;
            s.next_retry_at = Some(after(self.settings.poll_interval));
        });
        DeliveryStatus::Failure
    }

    fn post_report(&self, url: &str, envelope: &Envelope) -> Result<Ack> {
        let reply = self.transport.post_envelope(url, envelope)?;

        let parsed: Option<Value> = if reply.body.trim().is_empty() {
            Some(Value::Object(Default::default()))
        } else {
            serde_json::from_str(&reply.body).ok()
        };
        self.set_response(
            parsed
                .clone()
                .unwrap_or_else(|| Value::String(reply.body.clone())),
        );

        if reply.status != 200 {
            return Ok(Ack::HttpStatus(reply.status));
        }

        match parsed {
            Some(json) => match status_field(&json).as_str() {
                "" | "ok" | "success" => Ok(Ack::Accepted),
                other => Ok(Ack::Rejected(other.to_string())),
            },
            None if self.settings.optimistic_success => {
                tracing::debug!("Report response is not JSON; treating as accepted");
                Ok(Ack::Accepted)
            }
            None => Ok(Ack::Rejected("unparsable response".to_string())),
        }
    }

    fn acknowledge(&self, records: &[PendingRecord]) -> DeliveryStatus {
        let removed = match self.store.remove_delivered(records) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(error = %e, "Report accepted but removing sent records failed");
                return self.fail(DeliveryStatus::Failure, e.to_string());
            }
        };

        tracing::info!(sent = records.len(), removed, "Report delivered");
        self.state.update(|s| {
            s.status = DeliveryStatus::Success;
            s.current_attempt = 0;
            s.next_retry_at = None;
        });
        DeliveryStatus::Success
    }

    fn fail(&self, status: DeliveryStatus, reason: String) -> DeliveryStatus {
        self.state.update(|s| {
            s.status = status;
            s.current_attempt = 0;
            s.last_response = Some(Value::String(reason));
        });
        status
    }

    fn set_response(&self, response: Value) {
        self.state.update(|s| s.last_response = Some(response));
    }
}

/// Lower-cased `status` string of a JSON object; empty when absent.
fn status_field(json: &Value) -> String {
    json.get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
