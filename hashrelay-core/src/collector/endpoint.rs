//! Collector address resolution.
//!
//! The collector's base URL is published as the first line of a plain-text
//! bootstrap document. Resolution failures keep the last known address.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{is_http_url, SenderConfig};
use crate::error::{Error, Result};

use super::client::Transport;

/// Probe and report URLs derived from one base address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base: String,
    pub check_url: String,
    pub report_url: String,
}

impl Endpoints {
    fn new(base: &str, check_path: &str, report_path: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            check_url: format!("{}{}", base, check_path),
            report_url: format!("{}{}", base, report_path),
            base,
        }
    }
}

pub struct EndpointResolver {
    transport: Arc<dyn Transport>,
    bootstrap_url: Option<String>,
    check_path: String,
    report_path: String,
    current: RwLock<Option<Endpoints>>,
}

impl EndpointResolver {
    /// Resolver seeded with `server_url` as the last known address, if set.
    pub fn new(config: &SenderConfig, transport: Arc<dyn Transport>) -> Self {
        let current = config
            .server_url
            .as_deref()
            .map(|base| Endpoints::new(base, &config.check_path, &config.report_path));

        Self {
            transport,
            bootstrap_url: config.bootstrap_url.clone(),
            check_path: config.check_path.clone(),
            report_path: config.report_path.clone(),
            current: RwLock::new(current),
        }
    }

    /// Refresh the collector address from the bootstrap URL.
    ///
    /// Returns false, leaving the previous address in place, on any network
    /// failure or malformed document. Without a bootstrap URL this reports
    /// whether an address is known at all.
    pub fn resolve(&self) -> bool {
        let Some(bootstrap_url) = self.bootstrap_url.as_deref() else {
            return self.current().is_some();
        };

        match self.fetch_base(bootstrap_url) {
            Ok(base) => {
                let endpoints = Endpoints::new(&base, &self.check_path, &self.report_path);
                tracing::info!(base = %endpoints.base, "Updated collector address");
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoints);
                true
            }
            Err(e) => {
                tracing::info!(error = %e, "Could not resolve collector address");
                false
            }
        }
    }

    /// Last successfully resolved (or configured) endpoints
    pub fn current(&self) -> Option<Endpoints> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fetch_base(&self, bootstrap_url: &str) -> Result<String> {
        let reply = self.transport.get(bootstrap_url)?;
        if !reply.is_success() {
            return Err(Error::Protocol(format!(
                "bootstrap document returned HTTP {}",
                reply.status
            )));
        }
        parse_bootstrap(&reply.body)
    }
}

/// Extract the base URL from a bootstrap document.
pub fn parse_bootstrap(body: &str) -> Result<String> {
    let line = body.lines().next().unwrap_or("").trim();
    if !is_http_url(line) {
        return Err(Error::Protocol(format!(
            "bootstrap line is not an http(s) URL: {:?}",
            line
        )));
    }
    Ok(line.trim_end_matches('/').to_string())
}
