use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Port status as seen by a single connect probe
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
        }
    }
}

/// Severity category of a vulnerability, reconciled across CVSS versions
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    /// Ordering weight used when ranking vulnerabilities (higher is worse)
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Unknown => 0,
        }
    }

    /// Derive a category from a numeric base score.
    ///
    /// The bands match the CVSS v3 qualitative scale so that scores coming
    /// from v2 metrics (which carry no label) stay comparable.
    pub fn from_score(score: f64) -> Self {
        if score >= 9.0 {
            Severity::Critical
        } else if score >= 7.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" => Ok(Severity::Critical),
            "HIGH" => Ok(Severity::High),
            "MEDIUM" => Ok(Severity::Medium),
            "LOW" => Ok(Severity::Low),
            // CVSS v3 rates a 0.0 score as NONE, which ranks with unknown entries
            "UNKNOWN" | "NONE" => Ok(Severity::Unknown),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// A single vulnerability correlated with a detected product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityEntry {
    pub id: String,
    pub summary: String,
    pub severity: Severity,
    /// Base score, `None` when the source carried no usable metric
    pub score: Option<f64>,
}

impl VulnerabilityEntry {
    /// Score formatted for display, `N/A` when unknown
    pub fn score_label(&self) -> String {
        match self.score {
            Some(score) => format!("{:.1}", score),
            None => "N/A".to_string(),
        }
    }
}

/// Sort vulnerabilities by severity, worst first.
///
/// `sort_by_key` is stable, so entries of equal severity keep the order the
/// vulnerability source returned them in.
pub fn rank_vulnerabilities(entries: &mut [VulnerabilityEntry]) {
    entries.sort_by_key(|entry| Reverse(entry.severity.rank()));
}

/// Result for one open port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub state: PortState,
    /// Normalized banner, absent when none could be collected
    pub banner: Option<String>,
    pub service: String,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub vulnerabilities: Vec<VulnerabilityEntry>,
}

impl PortRecord {
    /// Number of vulnerabilities rated CRITICAL
    pub fn critical_count(&self) -> usize {
        self.vulnerabilities
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count()
    }
}

/// Overall scan report, ordered by port number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub host: String,
    pub range: PortRange,
    pub timestamp: DateTime<Utc>,
    pub records: Vec<PortRecord>,
}

impl ScanReport {
    /// Build a report, imposing port order on records collected in any order
    pub fn new(host: &str, range: PortRange, timestamp: DateTime<Utc>, mut records: Vec<PortRecord>) -> Self {
        records.sort_by_key(|r| r.port);
        records.dedup_by_key(|r| r.port);
        Self {
            host: host.to_string(),
            range,
            timestamp,
            records,
        }
    }

    pub fn open_ports(&self) -> Vec<u16> {
        self.records.iter().map(|r| r.port).collect()
    }

    /// Total vulnerabilities across all ports
    pub fn total_vulnerabilities(&self) -> usize {
        self.records.iter().map(|r| r.vulnerabilities.len()).sum()
    }
}

/// Error types for port range parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("Invalid format: {0} (expected start-end, e.g. 1-1024)")]
    InvalidFormat(String),

    #[error("Invalid port number: {0}")]
    InvalidPort(String),

    #[error("Port range start is greater than end: {0} > {1}")]
    RangeStartGreaterThanEnd(u16, u16),
}

/// Inclusive range of TCP ports
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start == 0 {
            return Err(PortRangeError::InvalidPort(start.to_string()));
        }
        if start > end {
            return Err(PortRangeError::RangeStartGreaterThanEnd(start, end));
        }
        Ok(Self { start, end })
    }

    /// Parse a string like "1-1024" or a single port like "22"
    pub fn parse(range_str: &str) -> Result<Self, PortRangeError> {
        let range_str = range_str.trim();
        let parts: Vec<&str> = range_str.split('-').collect();

        let (start_str, end_str) = match parts.as_slice() {
            [single] => (*single, *single),
            [start, end] => (*start, *end),
            _ => return Err(PortRangeError::InvalidFormat(range_str.to_string())),
        };

        let start = parse_port(start_str)?;
        let end = parse_port(end_str)?;

        Self::new(start, end)
    }

    /// Number of ports covered by the range
    pub fn port_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }
}

fn parse_port(s: &str) -> Result<u16, PortRangeError> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(PortRangeError::InvalidPort(s.trim().to_string())),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortRange::parse(s)
    }
}

impl IntoIterator for PortRange {
    type Item = u16;
    type IntoIter = std::ops::RangeInclusive<u16>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..=self.end
    }
}

/// Common service port mappings
#[derive(Debug)]
pub struct CommonPorts;

impl CommonPorts {
    /// Get the display label for a well-known port
    pub fn get_service(port: u16) -> Option<&'static str> {
        match port {
            21 => Some("FTP"),
            22 => Some("SSH"),
            23 => Some("Telnet"),
            25 => Some("SMTP"),
            53 => Some("DNS"),
            80 => Some("HTTP"),
            443 => Some("HTTPS"),
            3306 => Some("MySQL"),
            3389 => Some("Remote Desktop"),
            _ => None,
        }
    }
}
