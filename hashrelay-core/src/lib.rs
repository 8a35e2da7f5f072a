//! # hashrelay-core
//!
//! Core library for hashrelay - a store-and-forward relay for malware
//! detection digests.
//!
//! This library provides:
//! - A crash-safe on-disk queue of pending detection records
//! - Collector address resolution from a bootstrap document
//! - Hybrid RSA/AES encryption of outgoing reports
//! - A delivery engine with retries and a background scheduler
//! - Configuration management and logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use hashrelay_core::{Config, PendingRecord, Relay};
//!
//! let config = Config::load().expect("failed to load config");
//! let relay = Relay::new(&config).expect("failed to build relay");
//!
//! relay.add_record(PendingRecord::new("abc123").with_label("Trojan.X"));
//! relay.start().expect("failed to start sender");
//! ```

// Re-export commonly used items at the crate root
pub use collector::{DeliveryState, DeliveryStatus, Endpoints};
pub use config::Config;
pub use error::{Error, Result};
pub use record::{Detection, PendingRecord};
pub use relay::Relay;
pub use store::RecordStore;

// Public modules
pub mod collector;
pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod record;
pub mod relay;
pub mod scheduler;
pub mod store;
