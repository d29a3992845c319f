use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Maximum number of bytes read from a service when grabbing its banner
pub const BANNER_READ_BUDGET: usize = 1024;

/// Maximum length of a normalized banner
pub const MAX_BANNER_LEN: usize = 24;

/// Placeholder used when a banner normalizes to nothing
pub const EMPTY_BANNER: &str = "N/A";

/// Ports that only answer after a request, probed with a minimal HTTP GET
pub const DEFAULT_WEB_PORTS: [u16; 2] = [80, 443];

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
    // Servers echo the current time in a Date header; everything from there on
    // changes between runs.
    static ref DATE_MARKER: Regex = Regex::new(r"(?i)date").unwrap();
}

/// Grabs service banners from open ports
#[derive(Debug, Clone)]
pub struct BannerCollector {
    /// Ports that get an HTTP request before reading
    web_ports: HashSet<u16>,
    /// Read size limit in bytes
    read_budget: usize,
}

impl Default for BannerCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WEB_PORTS)
    }
}

impl BannerCollector {
    pub fn new(web_ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            web_ports: web_ports.into_iter().collect(),
            read_budget: BANNER_READ_BUDGET,
        }
    }

    pub fn is_web_port(&self, port: u16) -> bool {
        self.web_ports.contains(&port)
    }

    /// Grab a service banner from the specified host and port
    ///
    /// Opens a fresh connection, sends a minimal HTTP request on web ports
    /// and reads whatever the service sends back, up to the read budget.
    /// Returns `None` on any connect, write or read failure and when the
    /// service sends nothing. Undecodable bytes are replaced rather than
    /// rejected. The connection is closed when this returns.
    pub async fn collect(&self, host: &str, port: u16, timeout_duration: Duration) -> Option<String> {
        trace!("Initiating banner grab on {}:{}", host, port);

        let mut stream = match timeout(timeout_duration, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Failed to connect to {}:{} for banner grabbing: {}", host, port, e);
                return None;
            },
            Err(_) => {
                debug!("Connection to {}:{} timed out during banner grabbing", host, port);
                return None;
            }
        };

        if self.is_web_port(port) {
            let request = http_probe(host);
            match timeout(timeout_duration, stream.write_all(request.as_bytes())).await {
                Ok(Ok(())) => trace!("Sent HTTP probe to {}:{}", host, port),
                _ => {
                    debug!("Failed to send HTTP probe to {}:{}", host, port);
                    return None;
                }
            }
        }

        let mut buffer = vec![0; self.read_budget];
        let banner = match timeout(timeout_duration, stream.read(&mut buffer)).await {
            Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buffer[..n]).trim().to_string(),
            _ => String::new(),
        };

        if banner.is_empty() {
            debug!("No banner retrieved from {}:{}", host, port);
            None
        } else {
            trace!("Banner retrieved from {}:{} ({} bytes)", host, port, banner.len());
            Some(banner)
        }
    }
}

/// Minimal well-formed HTTP request used to make web servers talk first
fn http_probe(host: &str) -> String {
    let host_header = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
        _ => host.to_string(),
    };
    format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host_header)
}

/// Normalize a raw banner for reporting.
///
/// Line breaks and tabs become spaces, everything outside printable ASCII is
/// dropped and whitespace runs collapse to one space. The result is cut
/// before the first case-insensitive "date" and clipped to
/// [`MAX_BANNER_LEN`] characters. An empty result becomes [`EMPTY_BANNER`].
///
/// Total and idempotent: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let printable: String = raw
        .chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .filter(|c| (' '..='~').contains(c))
        .collect();

    let collapsed = WHITESPACE_RUN.replace_all(printable.trim(), " ");

    let undated: &str = match DATE_MARKER.find(&collapsed) {
        Some(m) => collapsed[..m.start()].trim_end(),
        None => collapsed.as_ref(),
    };

    let clipped: String = undated.chars().take(MAX_BANNER_LEN).collect();
    let clipped = clipped.trim_end();

    if clipped.is_empty() {
        EMPTY_BANNER.to_string()
    } else {
        clipped.to_string()
    }
}
