//! Concurrent TCP service scanner.
//!
//! Probes every port of a range, grabs banners from the open ones, identifies
//! the service and software behind them and correlates the software with
//! known vulnerabilities. Results come back as a [`ScanReport`] ordered by port.

pub mod banner;
pub mod config;
pub mod models;
pub mod output;
pub mod probe;
pub mod scanner;
pub mod service;
pub mod vuln;

pub use config::{ConfigError, ScanConfig};
pub use models::{PortRange, PortRecord, PortState, ScanReport, Severity, VulnerabilityEntry};
pub use scanner::Scanner;
pub use vuln::{LookupError, VulnerabilityCorrelator, VulnerabilitySource};
