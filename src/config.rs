use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::banner::DEFAULT_WEB_PORTS;
use crate::models::{PortRange, PortRangeError};
use crate::vuln::{DEFAULT_VULN_ENDPOINT, DEFAULT_VULN_TIMEOUT};

/// Configuration errors, all fatal before any scanning begins
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("No target host given")]
    EmptyHost,

    #[error(transparent)]
    InvalidRange(#[from] PortRangeError),

    #[error("Concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("Timeout '{0}' must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("task_timeout {task:?} is shorter than the {required:?} a single port may need")]
    TaskTimeoutTooShort { task: Duration, required: Duration },
}

/// Everything the scan pipeline needs to know about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Target hostname or IP address
    pub host: String,
    /// Inclusive port range to scan
    pub range: PortRange,
    /// Maximum number of ports processed at once
    pub concurrency: usize,
    /// Timeout for the connect probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Timeout for each step of banner grabbing
    #[serde(with = "humantime_serde")]
    pub banner_timeout: Duration,
    /// Upper bound for the whole pipeline of one port
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,
    /// Grab banners from open ports
    pub grab_banners: bool,
    /// Look up vulnerabilities for identified products
    pub lookup_vulns: bool,
    /// Ports that get an HTTP request during banner grabbing
    pub web_ports: Vec<u16>,
    /// Keyword-search endpoint of the vulnerability source
    pub vuln_endpoint: String,
    #[serde(with = "humantime_serde")]
    pub vuln_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            range: PortRange { start: 1, end: 1024 },
            concurrency: 100,
            probe_timeout: Duration::from_millis(500),
            banner_timeout: Duration::from_secs(1),
            task_timeout: Duration::from_secs(15),
            grab_banners: true,
            lookup_vulns: true,
            web_ports: DEFAULT_WEB_PORTS.to_vec(),
            vuln_endpoint: DEFAULT_VULN_ENDPOINT.to_string(),
            vuln_timeout: DEFAULT_VULN_TIMEOUT,
        }
    }
}

impl ScanConfig {
    pub fn new(host: &str, range: PortRange) -> Self {
        Self {
            host: host.to_string(),
            range,
            ..Self::default()
        }
    }

    /// Load a configuration file in JSON format
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Worst-case duration of one port's pipeline.
    ///
    /// Banner grabbing applies its timeout to connect, request and read in
    /// turn, so it can take three times `banner_timeout`.
    pub fn minimum_task_timeout(&self) -> Duration {
        let mut required = self.probe_timeout;
        if self.grab_banners {
            required += self.banner_timeout * 3;
        }
        if self.lookup_vulns {
            required += self.vuln_timeout;
        }
        required
    }

    /// Raise `task_timeout` so slow but open ports are never dropped
    pub fn fit_task_timeout(&mut self) {
        self.task_timeout = self.task_timeout.max(self.minimum_task_timeout());
    }

    /// Check the configuration before any network activity
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        // Ranges can come from a config file, bypassing PortRange::parse
        PortRange::new(self.range.start, self.range.end)?;
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        for (name, value) in [
            ("probe_timeout", self.probe_timeout),
            ("banner_timeout", self.banner_timeout),
            ("task_timeout", self.task_timeout),
            ("vuln_timeout", self.vuln_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        let required = self.minimum_task_timeout();
        if self.task_timeout < required {
            return Err(ConfigError::TaskTimeoutTooShort {
                task: self.task_timeout,
                required,
            });
        }
        Ok(())
    }
}
