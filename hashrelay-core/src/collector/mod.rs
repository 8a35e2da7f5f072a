//! Collector delivery
//!
//! This module ships pending records to the remote collector.
//!
//! ## Protocol
//!
//! - The collector base URL comes from a bootstrap document (or `server_url`)
//! - `GET {base}/check` must answer `{"status": "ok"}` before anything is sent
//! - `POST {base}/report` carries the whole queue as one hybrid-encrypted
//!   [`Envelope`]
//! - The local queue is cleared only after a positive acknowledgment
//!
//! ## Usage
//!
//! ```toml
//! [sender]
//! enabled = true
//! bootstrap_url = "https://example.com/server_address.txt"
//! poll_interval_secs = 30
//! ```

mod client;
mod delivery;
mod endpoint;
mod envelope;
mod state;

pub use client::{CollectorClient, HttpReply, Transport};
pub use delivery::{DeliveryEngine, DeliverySettings};
pub use endpoint::{parse_bootstrap, EndpointResolver, Endpoints};
pub use envelope::{Envelope, PayloadEncryptor, COLLECTOR_PUBLIC_KEY_PEM};
pub use state::{DeliveryState, DeliveryStatus};
