//! The relay controller.
//!
//! A [`Relay`] owns the queue, the collector resolver, the delivery engine
//! and the background scheduler for one queue file. The application builds
//! one at startup and shares it by `Arc`; there is no global instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collector::{
    CollectorClient, DeliveryEngine, DeliverySettings, DeliveryState, DeliveryStatus,
    EndpointResolver, Endpoints, PayloadEncryptor, Transport,
};
use crate::config::Config;
use crate::error::Result;
use crate::format::format_relative_time;
use crate::record::{Detection, PendingRecord};
use crate::scheduler::Scheduler;
use crate::store::RecordStore;

pub struct Relay {
    store: Arc<RecordStore>,
    engine: Arc<DeliveryEngine>,
    enabled: Arc<AtomicBool>,
    scheduler: Scheduler,
}

impl Relay {
    /// Relay talking to the network over HTTP
    pub fn new(config: &Config) -> Result<Self> {
        let transport = Arc::new(CollectorClient::new(&config.sender)?);
        Self::with_transport(config, transport)
    }

    /// Relay over a caller-provided transport
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_parts(
            config,
            transport,
            PayloadEncryptor::embedded(),
            DeliverySettings::from_config(&config.sender),
        )
    }

    /// Relay with explicit encryption key and delivery timing
    pub fn with_parts(
        config: &Config,
        transport: Arc<dyn Transport>,
        encryptor: PayloadEncryptor,
        settings: DeliverySettings,
    ) -> Result<Self> {
        config.sender.validate()?;

        let store = Arc::new(RecordStore::open(config.queue_path())?);
        let resolver = Arc::new(EndpointResolver::new(
            &config.sender,
            Arc::clone(&transport),
        ));
        let engine = Arc::new(DeliveryEngine::new(
            Arc::clone(&store),
            resolver,
            transport,
            encryptor,
            settings,
        ));
        let enabled = Arc::new(AtomicBool::new(config.sender.enabled));
        let scheduler = Scheduler::new(Arc::clone(&engine), Arc::clone(&enabled));

        tracing::info!(
            queue = %store.path().display(),
            enabled = config.sender.enabled,
            poll_interval_secs = config.sender.poll_interval_secs,
            "Relay initialized"
        );

        Ok(Self {
            store,
            engine,
            enabled,
            scheduler,
        })
    }

    // --- Intake ---

    /// Queue one record. Failures are logged and reported as `false`.
    pub fn add_record(&self, record: PendingRecord) -> bool {
        let hash = record.hash.clone();
        match self.store.append(record) {
            Ok(()) => {
                tracing::debug!(hash = %hash, "Queued record");
                true
            }
            Err(e) => {
                tracing::warn!(hash = %hash, error = %e, "Failed to queue record");
                false
            }
        }
    }

    /// Queue one record per digest of a detection; returns how many were queued.
    pub fn record_detection(&self, detection: &Detection) -> usize {
        detection
            .records()
            .into_iter()
            .filter(|record| self.add_record(record.clone()))
            .count()
    }

    pub fn pending(&self) -> Result<Vec<PendingRecord>> {
        self.store.read_all()
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    // --- Delivery ---

    /// Refresh the collector address; false keeps the previous one.
    pub fn resolve(&self) -> bool {
        self.engine.resolver().resolve()
    }

    pub fn endpoints(&self) -> Option<Endpoints> {
        self.engine.resolver().current()
    }

    /// Deliver the queue now, from the calling thread.
    ///
    /// Disable the background sender first if it may be mid-cycle.
    pub fn send_now(&self) -> DeliveryStatus {
        self.engine.send_now()
    }

    pub fn state(&self) -> DeliveryState {
        self.engine.state()
    }

    // --- Background control ---

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "Background sender enabled set");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    pub fn stop(&self, timeout: Duration) -> bool {
        self.scheduler.stop(timeout)
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// One-line human summary of what the sender is doing.
    pub fn status_report(&self) -> String {
        if !self.is_enabled() {
            return "Paused".to_string();
        }

        match self.pending_count() {
            Ok(0) => return "Nothing to send".to_string(),
            Ok(_) => {}
            Err(e) => return format!("Queue unreadable: {}", e),
        }

        let state = self.state();
        let retry = state
            .next_retry_at
            .map(|ts| format!("; retrying {}", format_relative_time(ts)))
            .unwrap_or_default();

        match state.status {
            DeliveryStatus::Sending => format!("Sending (attempt {})", state.current_attempt),
            DeliveryStatus::Success => "Sent successfully".to_string(),
            DeliveryStatus::NoConnection => format!("Cannot reach collector{}", retry),
            DeliveryStatus::Busy => format!("Collector busy{}", retry),
            DeliveryStatus::Failure if state.collector_busy() => {
                format!("Collector busy{}", retry)
            }
            DeliveryStatus::Failure => format!("Send failed{}", retry),
            DeliveryStatus::Idle | DeliveryStatus::NoEntries if self.is_running() => {
                "Running in background (waiting for data or network)".to_string()
            }
            DeliveryStatus::Idle | DeliveryStatus::NoEntries => {
                "Background sending not started".to_string()
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if self.scheduler.is_running() {
            self.scheduler.stop(Duration::from_secs(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Envelope, HttpReply};
    use crate::error::Error;
    use tempfile::TempDir;

    /// Every request fails as if offline
    struct Offline;

    impl Transport for Offline {
        fn get(&self, _url: &str) -> Result<HttpReply> {
            Err(Error::Network("offline".to_string()))
        }

        fn post_envelope(&self, _url: &str, _envelope: &Envelope) -> Result<HttpReply> {
            Err(Error::Network("offline".to_string()))
        }
    }

    fn relay_in(dir: &TempDir) -> Relay {
        let mut config = Config::default();
        config.queue.path = Some(dir.path().join("pending.json"));
        config.sender.server_url = Some("http://collector.invalid".to_string());
        Relay::with_transport(&config, Arc::new(Offline)).unwrap()
    }

    #[test]
    fn test_add_record_reports_failure_as_false() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir);

        assert!(relay.add_record(PendingRecord::new("abc123")));
        assert!(!relay.add_record(PendingRecord::new("")));
        assert_eq!(relay.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_record_detection_counts_queued_digests() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir);

        let detection = Detection {
            digests: vec![
                ("md5".to_string(), "aa".to_string()),
                ("sha256".to_string(), "bb".to_string()),
            ],
            label: "Trojan.X".to_string(),
            rules: vec!["RULE_1".to_string()],
        };

        assert_eq!(relay.record_detection(&detection), 2);
        assert_eq!(relay.pending().unwrap()[1].hash_type, "sha256");
    }

    #[test]
    fn test_status_report_paused_and_empty() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir);

        assert_eq!(relay.status_report(), "Nothing to send");
        relay.set_enabled(false);
        assert_eq!(relay.status_report(), "Paused");
    }

    #[test]
    fn test_status_report_after_offline_send() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir);
        relay.add_record(PendingRecord::new("abc123"));

        assert_eq!(relay.send_now(), DeliveryStatus::NoConnection);
        assert_eq!(relay.status_report(), "Cannot reach collector");
        assert_eq!(relay.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.queue.path = Some(dir.path().join("pending.json"));
        config.sender.max_attempts = 0;

        assert!(Relay::with_transport(&config, Arc::new(Offline)).is_err());
    }
}
