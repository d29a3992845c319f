use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::prelude::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;

use crate::banner::{normalize, BannerCollector};
use crate::config::ScanConfig;
use crate::models::{rank_vulnerabilities, PortRecord, PortState, ScanReport};
use crate::probe::probe;
use crate::service::{extract_vendor_product, identify};
use crate::vuln::VulnerabilityCorrelator;

/// Callback invoked once for every open port, in completion order
pub type RecordCallback = Arc<dyn Fn(&PortRecord) + Send + Sync>;

/// Main scanner implementation
///
/// Runs probe, banner grab, service identification and vulnerability lookup
/// for every port of the configured range on a bounded pool of tasks, then
/// orders the collected records by port.
pub struct Scanner {
    config: ScanConfig,
    collector: Arc<BannerCollector>,
    correlator: Option<VulnerabilityCorrelator>,
    on_record: Option<RecordCallback>,
}

/// Read-only state shared by the tasks of one scan
struct PortPipeline {
    /// Address probes connect to
    target: String,
    probe_timeout: Duration,
    banner_timeout: Duration,
    grab_banners: bool,
    collector: Arc<BannerCollector>,
    correlator: Option<VulnerabilityCorrelator>,
}

impl Scanner {
    /// Create a scanner, failing on invalid configuration.
    ///
    /// When vulnerability lookups are enabled the configured endpoint is used
    /// as an NVD-compatible source.
    pub fn new(config: ScanConfig) -> Result<Self> {
        config.validate().context("Invalid scan configuration")?;

        let correlator = if config.lookup_vulns {
            Some(VulnerabilityCorrelator::nvd(&config.vuln_endpoint, config.vuln_timeout)?)
        } else {
            None
        };
        let collector = Arc::new(BannerCollector::new(config.web_ports.iter().copied()));

        Ok(Self {
            config,
            collector,
            correlator,
            on_record: None,
        })
    }

    /// Replace the vulnerability correlator, `None` disables lookups
    pub fn with_correlator(mut self, correlator: Option<VulnerabilityCorrelator>) -> Self {
        self.correlator = correlator;
        self
    }

    /// Register a callback for open ports as they are found
    pub fn on_record(mut self, callback: RecordCallback) -> Self {
        self.on_record = Some(callback);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run the configured scan against the target.
    ///
    /// A new task is only spawned once a pool slot is free, so at most
    /// `concurrency` ports are in flight. Each task is bounded by
    /// `task_timeout`, which validation keeps above the slowest possible
    /// pipeline; a task that still overruns produces no record.
    pub async fn run_scan(&self) -> Result<ScanReport> {
        self.config.validate().context("Invalid scan configuration")?;

        let timestamp = Utc::now();
        let started = Instant::now();
        let range = self.config.range;
        info!("Starting scan of {} ports {} with {} workers", self.config.host, range, self.config.concurrency);

        let pipeline = Arc::new(PortPipeline {
            target: resolve_target(&self.config.host).await,
            probe_timeout: self.config.probe_timeout,
            banner_timeout: self.config.banner_timeout,
            grab_banners: self.config.grab_banners,
            collector: self.collector.clone(),
            correlator: self.correlator.clone(),
        });

        let results = Arc::new(Mutex::new(Vec::<PortRecord>::new()));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let task_timeout = self.config.task_timeout;
        let mut tasks = Vec::with_capacity(range.port_count());

        for port in range {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Worker pool closed unexpectedly")?;
            let pipeline = pipeline.clone();
            let results = results.clone();
            let on_record = self.on_record.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                match timeout(task_timeout, pipeline.scan_port(port)).await {
                    Ok(Some(record)) => {
                        if let Some(callback) = &on_record {
                            callback(&record);
                        }
                        results.lock().await.push(record);
                    },
                    Ok(None) => {},
                    Err(_) => warn!("Port {} did not finish within {:?}, dropping it", port, task_timeout),
                }
            }));
        }

        for outcome in join_all(tasks).await {
            if let Err(e) = outcome {
                warn!("Scan task failed: {}", e);
            }
        }

        let records = std::mem::take(&mut *results.lock().await);
        let report = ScanReport::new(&self.config.host, range, timestamp, records);

        info!(
            "Scan finished in {:.2} seconds. Found {} open ports.",
            started.elapsed().as_secs_f64(),
            report.records.len()
        );
        Ok(report)
    }
}

impl PortPipeline {
    /// Full pipeline for one port; `None` when the port is closed
    async fn scan_port(&self, port: u16) -> Option<PortRecord> {
        if probe(&self.target, port, self.probe_timeout).await == PortState::Closed {
            return None;
        }
        debug!("Port {} is open", port);

        let raw_banner = if self.grab_banners {
            self.collector.collect(&self.target, port, self.banner_timeout).await
        } else {
            None
        };

        // Identification works on the raw banner; normalization may cut keywords
        let service = identify(port, raw_banner.as_deref());
        let software = extract_vendor_product(raw_banner.as_deref());

        let mut vulnerabilities = match (&self.correlator, software) {
            (Some(correlator), Some(info)) => correlator.lookup(info.product).await,
            _ => Vec::new(),
        };
        rank_vulnerabilities(&mut vulnerabilities);

        debug!(
            "Analysis complete for port {}: service={}, software={:?}, vulnerabilities={}",
            port, service, software, vulnerabilities.len()
        );

        Some(PortRecord {
            port,
            state: PortState::Open,
            banner: raw_banner.as_deref().map(normalize),
            service,
            vendor: software.map(|s| s.vendor.to_string()),
            product: software.map(|s| s.product.to_string()),
            vulnerabilities,
        })
    }
}

/// Resolve the target once so probes don't each trigger a DNS lookup.
///
/// IPv4 addresses are preferred. When resolution fails the host is kept as
/// given; every probe will then fail and report the port closed.
async fn resolve_target(host: &str) -> String {
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            match addrs.iter().find(|ip| ip.is_ipv4()).or_else(|| addrs.first()) {
                Some(ip) => {
                    info!("Resolved {} to {}", host, ip);
                    ip.to_string()
                },
                None => {
                    warn!("Hostname {} resolved to no addresses", host);
                    host.to_string()
                }
            }
        },
        Err(e) => {
            warn!("DNS resolution failed for {}: {}", host, e);
            host.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortRange, Severity, VulnerabilityEntry};
    use crate::vuln::{LookupError, VulnerabilitySource};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Spawn a loopback service that greets every connection with `banner`
    async fn greeting_service(banner: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_greeting(listener, banner));
        port
    }

    async fn serve_greeting(listener: TcpListener, banner: &'static [u8]) {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(banner).await;
            });
        }
    }

    /// Bind `count` listeners on consecutive loopback ports
    async fn consecutive_listeners(count: u16) -> Vec<TcpListener> {
        for _ in 0..50 {
            let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = first.local_addr().unwrap().port();
            if base > u16::MAX - count {
                continue;
            }
            let mut listeners = vec![first];
            for offset in 1..count {
                match TcpListener::bind(("127.0.0.1", base + offset)).await {
                    Ok(listener) => listeners.push(listener),
                    Err(_) => break,
                }
            }
            if listeners.len() == count as usize {
                return listeners;
            }
        }
        panic!("could not bind {} consecutive ports", count);
    }

    fn config_for(start: u16, end: u16) -> ScanConfig {
        let mut config = ScanConfig::new("127.0.0.1", PortRange::new(start, end).unwrap());
        config.lookup_vulns = false;
        config.probe_timeout = Duration::from_millis(500);
        config.banner_timeout = Duration::from_millis(500);
        config
    }

    fn entry(id: &str, severity: Severity) -> VulnerabilityEntry {
        VulnerabilityEntry {
            id: id.to_string(),
            summary: format!("{} summary", id),
            severity,
            score: None,
        }
    }

    /// Source returning fixed entries and remembering the keywords it was asked for
    struct FixedSource {
        entries: Vec<VulnerabilityEntry>,
        keywords: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl VulnerabilitySource for FixedSource {
        async fn search(&self, keyword: &str) -> Result<Vec<VulnerabilityEntry>, LookupError> {
            self.keywords.lock().unwrap().push(keyword.to_string());
            Ok(self.entries.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl VulnerabilitySource for FailingSource {
        async fn search(&self, _keyword: &str) -> Result<Vec<VulnerabilityEntry>, LookupError> {
            Err(LookupError::RateLimited(403))
        }
    }

    #[tokio::test]
    async fn single_ssh_port_end_to_end() {
        let port = greeting_service(b"SSH-2.0-OpenSSH_8.9\r\n").await;

        let scanner = Scanner::new(config_for(port, port)).unwrap();
        let report = scanner.run_scan().await.unwrap();

        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert_eq!(record.port, port);
        assert_eq!(record.state, PortState::Open);
        assert_eq!(record.service, "SSH");
        assert_eq!(record.banner.as_deref(), Some("SSH-2.0-OpenSSH_8.9"));
        assert_eq!(record.vendor.as_deref(), Some("openssh"));
        assert_eq!(record.product.as_deref(), Some("openssh"));
        assert!(record.vulnerabilities.is_empty());
    }

    #[tokio::test]
    async fn closed_ports_produce_no_records() {
        let mut listeners = consecutive_listeners(3).await;
        let base = listeners[0].local_addr().unwrap().port();
        // Close the middle port, keep the outer two accepting
        let last = listeners.pop().unwrap();
        drop(listeners.pop());
        let first = listeners.pop().unwrap();
        tokio::spawn(serve_greeting(first, b"220 FTP ready\r\n"));
        tokio::spawn(serve_greeting(last, b"220 FTP ready\r\n"));

        let report = Scanner::new(config_for(base, base + 2)).unwrap().run_scan().await.unwrap();

        assert_eq!(report.open_ports(), vec![base, base + 2]);
        assert!(report.records.iter().all(|r| r.service == "FTP"));
    }

    #[tokio::test]
    async fn report_order_is_independent_of_pool_size() {
        let listeners = consecutive_listeners(6).await;
        let base = listeners[0].local_addr().unwrap().port();
        for listener in listeners {
            tokio::spawn(serve_greeting(listener, b"SSH-2.0-OpenSSH_9.6\r\n"));
        }
        let expected: Vec<u16> = (base..base + 6).collect();

        for workers in [1, 2, 6, 64] {
            let mut config = config_for(base, base + 5);
            config.concurrency = workers;
            let report = Scanner::new(config).unwrap().run_scan().await.unwrap();

            assert_eq!(report.open_ports(), expected, "pool size {}", workers);
            assert!(report.open_ports().windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn vulnerabilities_are_ranked_by_severity() {
        let port = greeting_service(b"SSH-2.0-OpenSSH_8.9\r\n").await;
        let source = Arc::new(FixedSource {
            entries: vec![
                entry("CVE-LOW", Severity::Low),
                entry("CVE-CRIT-1", Severity::Critical),
                entry("CVE-UNKNOWN", Severity::Unknown),
                entry("CVE-CRIT-2", Severity::Critical),
            ],
            keywords: StdMutex::new(Vec::new()),
        });

        let scanner = Scanner::new(config_for(port, port))
            .unwrap()
            .with_correlator(Some(VulnerabilityCorrelator::new(source.clone())));
        let report = scanner.run_scan().await.unwrap();

        let ids: Vec<&str> = report.records[0].vulnerabilities.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-CRIT-1", "CVE-CRIT-2", "CVE-LOW", "CVE-UNKNOWN"]);
        assert_eq!(report.records[0].critical_count(), 2);
        assert_eq!(*source.keywords.lock().unwrap(), vec!["openssh".to_string()]);
    }

    #[tokio::test]
    async fn no_lookup_without_product() {
        let port = greeting_service(b"220 ProFTPD Server ready\r\n").await;
        let source = Arc::new(FixedSource {
            entries: vec![entry("CVE-X", Severity::High)],
            keywords: StdMutex::new(Vec::new()),
        });

        let scanner = Scanner::new(config_for(port, port))
            .unwrap()
            .with_correlator(Some(VulnerabilityCorrelator::new(source.clone())));
        let report = scanner.run_scan().await.unwrap();

        assert_eq!(report.records[0].service, "FTP");
        assert!(report.records[0].vulnerabilities.is_empty());
        assert!(source.keywords.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_failure_degrades_to_empty_list() {
        let port = greeting_service(b"HTTP/1.1 200 OK\r\nServer: nginx/1.24.0\r\n\r\n").await;

        let scanner = Scanner::new(config_for(port, port))
            .unwrap()
            .with_correlator(Some(VulnerabilityCorrelator::new(Arc::new(FailingSource))));
        let report = scanner.run_scan().await.unwrap();

        let record = &report.records[0];
        assert_eq!(record.service, "HTTP");
        assert_eq!(record.product.as_deref(), Some("nginx"));
        assert!(record.vulnerabilities.is_empty());
    }

    #[tokio::test]
    async fn disabled_banner_grab_falls_back_to_port_table() {
        let port = greeting_service(b"SSH-2.0-OpenSSH_8.9\r\n").await;
        let mut config = config_for(port, port);
        config.grab_banners = false;

        let report = Scanner::new(config).unwrap().run_scan().await.unwrap();

        let record = &report.records[0];
        assert_eq!(record.banner, None);
        assert_eq!(record.service, "Unknown");
        assert_eq!(record.vendor, None);
    }

    #[tokio::test]
    async fn silent_service_keeps_its_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = config_for(port, port);
        config.banner_timeout = Duration::from_millis(400);
        config.fit_task_timeout();

        let report = Scanner::new(config).unwrap().run_scan().await.unwrap();

        assert_eq!(report.open_ports(), vec![port]);
        assert_eq!(report.records[0].banner, None);
        assert_eq!(report.records[0].service, "Unknown");
    }

    #[test]
    fn task_timeout_shorter_than_banner_budget_is_rejected() {
        let mut config = config_for(1, 10);
        config.banner_timeout = Duration::from_secs(6);
        config.task_timeout = Duration::from_secs(3);
        assert!(Scanner::new(config).is_err());
    }

    #[tokio::test]
    async fn callback_sees_every_open_port() {
        let port = greeting_service(b"SSH-2.0-OpenSSH_8.9\r\n").await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        let scanner = Scanner::new(config_for(port, port))
            .unwrap()
            .on_record(Arc::new(move |record: &PortRecord| sink.lock().unwrap().push(record.port)));
        scanner.run_scan().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![port]);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = config_for(1, 10);
        config.concurrency = 0;
        assert!(Scanner::new(config).is_err());

        let mut config = config_for(1, 10);
        config.host = String::new();
        assert!(Scanner::new(config).is_err());
    }

    #[tokio::test]
    async fn unresolvable_host_reports_nothing_open() {
        let mut config = config_for(80, 81);
        config.host = "no-such-host.invalid".to_string();

        let report = Scanner::new(config).unwrap().run_scan().await.unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.host, "no-such-host.invalid");
    }
}
