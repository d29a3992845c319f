use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, trace, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::models::{Severity, VulnerabilityEntry};

/// NVD 2.0 API keyword search endpoint
pub const DEFAULT_VULN_ENDPOINT: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Default timeout for a single vulnerability source request
pub const DEFAULT_VULN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of entries kept per lookup
pub const MAX_ENTRIES: usize = 5;

/// Maximum length of a vulnerability summary
pub const MAX_SUMMARY_LEN: usize = 160;

const NO_DESCRIPTION: &str = "No description available";

/// Why a vulnerability source produced no data
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("vulnerability source timed out")]
    Timeout,

    #[error("vulnerability source is rate limiting requests (status {0})")]
    RateLimited(u16),

    #[error("vulnerability source returned status {0}")]
    Status(u16),

    #[error("request to vulnerability source failed: {0}")]
    Transport(String),

    #[error("malformed vulnerability source response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LookupError::Timeout
        } else {
            LookupError::Transport(e.to_string())
        }
    }
}

/// A keyword-searchable vulnerability database
#[async_trait]
pub trait VulnerabilitySource: Send + Sync {
    /// Search entries matching a product keyword, in source order
    async fn search(&self, keyword: &str) -> Result<Vec<VulnerabilityEntry>, LookupError>;
}

/// Severity information of one entry, reconciled across CVSS schema versions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CvssMetric {
    V31 { severity: Severity, score: f64 },
    V30 { severity: Severity, score: f64 },
    /// v2 carries no category; it is derived from the score
    V2Derived { score: f64 },
    Unknown,
}

impl CvssMetric {
    pub fn severity(&self) -> Severity {
        match self {
            CvssMetric::V31 { severity, .. } | CvssMetric::V30 { severity, .. } => *severity,
            CvssMetric::V2Derived { score } => Severity::from_score(*score),
            CvssMetric::Unknown => Severity::Unknown,
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            CvssMetric::V31 { score, .. }
            | CvssMetric::V30 { score, .. }
            | CvssMetric::V2Derived { score } => Some(*score),
            CvssMetric::Unknown => None,
        }
    }
}

// --- NVD 2.0 response shape ---

#[derive(Debug, Deserialize)]
struct NvdResponse {
    vulnerabilities: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NvdItem {
    cve: NvdCve,
}

#[derive(Debug, Deserialize)]
struct NvdCve {
    id: String,
    #[serde(default)]
    descriptions: Vec<NvdDescription>,
    #[serde(default)]
    metrics: NvdMetrics,
}

#[derive(Debug, Deserialize)]
struct NvdDescription {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct NvdMetrics {
    #[serde(rename = "cvssMetricV31", default)]
    v31: Vec<NvdMetric>,
    #[serde(rename = "cvssMetricV30", default)]
    v30: Vec<NvdMetric>,
    #[serde(rename = "cvssMetricV2", default)]
    v2: Vec<NvdMetric>,
}

#[derive(Debug, Deserialize)]
struct NvdMetric {
    #[serde(rename = "baseSeverity")]
    base_severity: Option<String>,
    #[serde(rename = "cvssData")]
    cvss_data: Option<NvdCvssData>,
}

#[derive(Debug, Deserialize)]
struct NvdCvssData {
    #[serde(rename = "baseScore")]
    base_score: Option<f64>,
    #[serde(rename = "baseSeverity")]
    base_severity: Option<String>,
}

impl NvdMetric {
    fn score(&self) -> Option<f64> {
        self.cvss_data.as_ref().and_then(|d| d.base_score)
    }

    /// Label as published, looked up at metric level first, then in cvssData
    fn label(&self) -> Option<Severity> {
        self.base_severity
            .as_deref()
            .or_else(|| self.cvss_data.as_ref().and_then(|d| d.base_severity.as_deref()))
            .and_then(|label| label.parse().ok())
    }
}

/// Severity and score from the first v3 block, if it carries a score
fn v3_metric(blocks: &[NvdMetric]) -> Option<(Severity, f64)> {
    let block = blocks.first()?;
    let score = block.score()?;
    let severity = block.label().unwrap_or_else(|| Severity::from_score(score));
    Some((severity, score))
}

/// Pick the severity schema of an entry: v3.1, then v3.0, then v2, else unknown
fn reconcile(metrics: &NvdMetrics) -> CvssMetric {
    if let Some((severity, score)) = v3_metric(&metrics.v31) {
        return CvssMetric::V31 { severity, score };
    }
    if let Some((severity, score)) = v3_metric(&metrics.v30) {
        return CvssMetric::V30 { severity, score };
    }
    if let Some(score) = metrics.v2.first().and_then(NvdMetric::score) {
        return CvssMetric::V2Derived { score };
    }
    CvssMetric::Unknown
}

fn truncate_summary(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_SUMMARY_LEN {
        return text.to_string();
    }
    let mut summary: String = text.chars().take(MAX_SUMMARY_LEN - 3).collect();
    summary.push_str("...");
    summary
}

/// Parse an NVD 2.0 response body into at most [`MAX_ENTRIES`] entries.
///
/// Only the entries that are kept get validated; an entry without an id makes
/// the whole body malformed.
pub fn parse_nvd_response(body: &[u8]) -> Result<Vec<VulnerabilityEntry>, LookupError> {
    let response: NvdResponse = serde_json::from_slice(body)
        .map_err(|e| LookupError::Malformed(e.to_string()))?;

    response
        .vulnerabilities
        .into_iter()
        .take(MAX_ENTRIES)
        .map(|raw| {
            let item: NvdItem = serde_json::from_value(raw)
                .map_err(|e| LookupError::Malformed(e.to_string()))?;
            let metric = reconcile(&item.cve.metrics);
            let summary = item
                .cve
                .descriptions
                .first()
                .map(|d| d.value.as_str())
                .unwrap_or(NO_DESCRIPTION);

            trace!("Parsed {} as {:?}", item.cve.id, metric);
            Ok(VulnerabilityEntry {
                id: item.cve.id,
                summary: truncate_summary(summary),
                severity: metric.severity(),
                score: metric.score(),
            })
        })
        .collect()
}

/// NVD 2.0 API keyword search over HTTP
pub struct NvdSource {
    client: reqwest::Client,
    endpoint: String,
}

impl NvdSource {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vulnscout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl VulnerabilitySource for NvdSource {
    async fn search(&self, keyword: &str) -> Result<Vec<VulnerabilityEntry>, LookupError> {
        debug!("Querying {} for keyword {}", self.endpoint, keyword);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("keywordSearch", keyword)])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 403 || status.as_u16() == 429 {
            return Err(LookupError::RateLimited(status.as_u16()));
        }
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_nvd_response(&body)
    }
}

/// Correlates detected products with known vulnerabilities.
///
/// Failures of the source never reach the caller: they are logged and turn
/// into an empty list, the same as a product with no known vulnerabilities.
#[derive(Clone)]
pub struct VulnerabilityCorrelator {
    source: Arc<dyn VulnerabilitySource>,
}

impl VulnerabilityCorrelator {
    pub fn new(source: Arc<dyn VulnerabilitySource>) -> Self {
        Self { source }
    }

    /// Correlator backed by an NVD-compatible HTTP endpoint
    pub fn nvd(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(NvdSource::new(endpoint, timeout)?)))
    }

    /// Look up vulnerabilities for a product keyword, in source order
    pub async fn lookup(&self, keyword: &str) -> Vec<VulnerabilityEntry> {
        match self.source.search(keyword).await {
            Ok(mut entries) => {
                entries.truncate(MAX_ENTRIES);
                debug!("Vulnerability source returned {} entries for {}", entries.len(), keyword);
                entries
            },
            Err(e @ LookupError::RateLimited(_)) => {
                warn!("No vulnerability data for {}: {}", keyword, e);
                Vec::new()
            },
            Err(e) => {
                debug!("No vulnerability data for {}: {}", keyword, e);
                Vec::new()
            }
        }
    }
}
