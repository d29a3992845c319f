use log::debug;

use crate::models::CommonPorts;

/// Label reported when neither the banner nor the port gives a hint
pub const UNKNOWN_SERVICE: &str = "Unknown";

/// A banner signature: matches when the lower-cased banner contains any keyword
#[derive(Debug)]
pub struct BannerRule<T> {
    pub keywords: &'static [&'static str],
    pub outcome: T,
}

impl<T> BannerRule<T> {
    fn matches(&self, banner_lower: &str) -> bool {
        self.keywords.iter().any(|keyword| banner_lower.contains(keyword))
    }
}

/// Vendor and product names as used by keyword-search vulnerability sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareInfo {
    pub vendor: &'static str,
    pub product: &'static str,
}

/// Service signatures in priority order, first match wins.
///
/// A banner containing both "http" and "apache" is reported as HTTP.
pub static SERVICE_RULES: &[BannerRule<&str>] = &[
    BannerRule { keywords: &["ssh"], outcome: "SSH" },
    BannerRule { keywords: &["http"], outcome: "HTTP" },
    BannerRule { keywords: &["apache"], outcome: "Apache Web Server" },
    BannerRule { keywords: &["nginx"], outcome: "Nginx Web Server" },
    BannerRule { keywords: &["ftp"], outcome: "FTP" },
];

/// Software signatures in priority order, first match wins
pub static SOFTWARE_RULES: &[BannerRule<SoftwareInfo>] = &[
    BannerRule {
        keywords: &["openssh", "ssh-"],
        outcome: SoftwareInfo { vendor: "openssh", product: "openssh" },
    },
    BannerRule {
        keywords: &["apache"],
        outcome: SoftwareInfo { vendor: "apache", product: "http_server" },
    },
    BannerRule {
        keywords: &["nginx"],
        outcome: SoftwareInfo { vendor: "nginx", product: "nginx" },
    },
];

/// Evaluate ordered rules against a banner, returning the first match
pub fn first_match<T: Copy>(rules: &[BannerRule<T>], banner: &str) -> Option<T> {
    let banner_lower = banner.to_lowercase();
    rules
        .iter()
        .find(|rule| rule.matches(&banner_lower))
        .map(|rule| rule.outcome)
}

/// Identify the service behind a port.
///
/// Expects the raw banner, not the normalized one: normalization may cut the
/// very keyword that identifies the service. Falls back to the well-known port
/// table, then to [`UNKNOWN_SERVICE`].
pub fn identify(port: u16, banner: Option<&str>) -> String {
    if let Some(label) = banner.and_then(|b| first_match(SERVICE_RULES, b)) {
        debug!("Matched banner signature {} on port {}", label, port);
        return label.to_string();
    }

    CommonPorts::get_service(port)
        .unwrap_or(UNKNOWN_SERVICE)
        .to_string()
}

/// Extract vendor and product from a raw banner
pub fn extract_vendor_product(banner: Option<&str>) -> Option<SoftwareInfo> {
    banner.and_then(|b| first_match(SOFTWARE_RULES, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_keywords_take_priority_over_port() {
        assert_eq!(identify(8080, Some("SSH-2.0-OpenSSH_8.9")), "SSH");
        assert_eq!(identify(22, Some("nginx server")), "Nginx Web Server");
        assert_eq!(identify(2121, Some("220 vsFTPd 3.0.3 ready")), "FTP");
    }

    #[test]
    fn first_matching_keyword_wins() {
        assert_eq!(identify(80, Some("HTTP/1.1 200 OK\r\nServer: Apache/2.4.1")), "HTTP");
        assert_eq!(identify(80, Some("ssh over http tunnel")), "SSH");
        assert_eq!(identify(80, Some("Apache/2.4.1 (Unix)")), "Apache Web Server");
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(identify(1, Some("NGINX")), "Nginx Web Server");
        assert_eq!(identify(1, Some("Welcome to Pure-FTPd")), "FTP");
    }

    #[test]
    fn falls_back_to_port_table_then_unknown() {
        assert_eq!(identify(3306, None), "MySQL");
        assert_eq!(identify(3389, Some("\x03\x00\x00\x0b")), "Remote Desktop");
        assert_eq!(identify(443, None), "HTTPS");
        assert_eq!(identify(31337, None), UNKNOWN_SERVICE);
        assert_eq!(identify(31337, Some("hello")), UNKNOWN_SERVICE);
    }

    #[test]
    fn extracts_vendor_and_product() {
        assert_eq!(
            extract_vendor_product(Some("SSH-2.0-OpenSSH_8.9")),
            Some(SoftwareInfo { vendor: "openssh", product: "openssh" })
        );
        assert_eq!(
            extract_vendor_product(Some("SSH-2.0-dropbear_2020.81")),
            Some(SoftwareInfo { vendor: "openssh", product: "openssh" })
        );
        assert_eq!(
            extract_vendor_product(Some("HTTP/1.1 200 OK\r\nServer: Apache/2.4.1")),
            Some(SoftwareInfo { vendor: "apache", product: "http_server" })
        );
        assert_eq!(
            extract_vendor_product(Some("Server: nginx/1.18.0")),
            Some(SoftwareInfo { vendor: "nginx", product: "nginx" })
        );
    }

    #[test]
    fn no_vendor_without_banner_or_match() {
        assert_eq!(extract_vendor_product(None), None);
        assert_eq!(extract_vendor_product(Some("220 ProFTPD Server")), None);
    }
}
