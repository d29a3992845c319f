use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;

use crate::banner::EMPTY_BANNER;
use crate::models::{PortRecord, ScanReport, Severity, VulnerabilityEntry};

/// Maximum characters of a vulnerability summary shown on the console
const LIVE_SUMMARY_LEN: usize = 80;

/// Width of the service column in the summary table
const SERVICE_COLUMN: usize = 12;

/// Severity groups in display order
const SEVERITY_ORDER: [Severity; 5] = [
    Severity::Critical,
    Severity::High,
    Severity::Medium,
    Severity::Low,
    Severity::Unknown,
];

/// Serialized shape of a JSON report
#[derive(Serialize)]
struct JsonReport<'a> {
    host: &'a str,
    range: String,
    datetime: String,
    open_ports: &'a [PortRecord],
}

impl<'a> From<&'a ScanReport> for JsonReport<'a> {
    fn from(report: &'a ScanReport) -> Self {
        Self {
            host: &report.host,
            range: report.range.to_string(),
            datetime: report.timestamp.to_rfc3339(),
            open_ports: &report.records,
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn banner_or_placeholder(record: &PortRecord) -> &str {
    record.banner.as_deref().unwrap_or(EMPTY_BANNER)
}

/// CVE column of the summary table: `"<n> (<c> CRIT)"` or `"0"`
pub fn format_cve_column(record: &PortRecord) -> String {
    if record.vulnerabilities.is_empty() {
        "0".to_string()
    } else {
        format!("{} ({} CRIT)", record.vulnerabilities.len(), record.critical_count())
    }
}

/// One row of the summary table, without colors
pub fn format_table_row(record: &PortRecord) -> String {
    format!(
        "{:<7} {:<12} {:<24} {}",
        record.port,
        clip(&record.service, SERVICE_COLUMN),
        banner_or_placeholder(record),
        format_cve_column(record)
    )
}

fn styled_severity(severity: Severity) -> String {
    let label = severity.to_string();
    match severity {
        Severity::Critical => style(label).red().bold().to_string(),
        Severity::High => style(label).red().to_string(),
        Severity::Medium => style(label).yellow().to_string(),
        Severity::Low => style(label).green().to_string(),
        Severity::Unknown => style(label).dim().to_string(),
    }
}

fn format_live_entry(entry: &VulnerabilityEntry) -> String {
    format!(
        "      {} ({}): {}",
        style(&entry.id).bold(),
        entry.score_label(),
        clip(&entry.summary, LIVE_SUMMARY_LEN)
    )
}

/// Print an open port as soon as it is found
pub fn print_live_record(record: &PortRecord) {
    let mut lines = vec![format!(
        "[{}] Port {}: {} | {}",
        style("+").green(),
        style(record.port).yellow().bold(),
        style(&record.service).green(),
        banner_or_placeholder(record)
    )];

    for severity in SEVERITY_ORDER {
        let group: Vec<&VulnerabilityEntry> = record
            .vulnerabilities
            .iter()
            .filter(|v| v.severity == severity)
            .collect();
        if group.is_empty() {
            continue;
        }
        lines.push(format!("    {} ({})", styled_severity(severity), group.len()));
        lines.extend(group.into_iter().map(format_live_entry));
    }

    // One write so lines from concurrent tasks don't interleave
    println!("{}", lines.join("\n"));
}

/// Print the final summary table followed by the open port list
pub fn print_results(report: &ScanReport) {
    println!();
    println!("{}", style("Scan Results").cyan().bold());
    println!(
        "Target: {}  Range: {}  Date: {}",
        style(&report.host).green(),
        report.range,
        report.timestamp.format("%Y-%m-%d %H:%M:%S")
    );

    if report.records.is_empty() {
        println!("\nNo open ports found on target.");
        return;
    }

    println!("\n{}", style(format!("{:<7} {:<12} {:<24} {}", "PORT", "SERVICE", "BANNER", "CVES")).underlined());
    for record in &report.records {
        let row = format_table_row(record);
        if record.critical_count() > 0 {
            println!("{}", style(row).red());
        } else {
            println!("{}", row);
        }
    }

    let ports: Vec<String> = report.open_ports().iter().map(u16::to_string).collect();
    println!(
        "\n{} open ports: {}",
        style(report.records.len()).yellow().bold(),
        ports.join(", ")
    );
    let total = report.total_vulnerabilities();
    if total > 0 {
        println!("{} potential vulnerabilities detected", style(total).red().bold());
    }
}

/// Render a report as the plain text export format
pub fn format_text_results(report: &ScanReport) -> String {
    let mut output = String::new();

    output.push_str("=== PORT SCAN REPORT ===\n");
    output.push_str(&format!("Host: {}\n", report.host));
    output.push_str(&format!("Date: {}\n", report.timestamp.format("%Y-%m-%d %H:%M:%S")));

    for record in &report.records {
        output.push_str(&format!("\n[{}] {}\n", record.port, record.service));
        output.push_str(&format!("  Banner: {}\n", banner_or_placeholder(record)));
        if record.vulnerabilities.is_empty() {
            output.push_str("  CVEs: 0\n");
        } else {
            output.push_str(&format!(
                "  CVEs: {} ({} Critical)\n",
                record.vulnerabilities.len(),
                record.critical_count()
            ));
        }
    }

    output
}

fn write_output(content: &str, output_path: &Path) -> Result<()> {
    let mut file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {:?}", output_path))?;

    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", output_path))?;

    Ok(())
}

/// Save a report to a JSON file
///
/// # Arguments
/// * `report` - The scan report to save
/// * `output_path` - Path to the output file
pub fn save_json_results(report: &ScanReport, output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&JsonReport::from(report))
        .context("Failed to serialize scan report")?;
    write_output(&json, output_path)
}

/// Save a report to a text file
pub fn save_text_results(report: &ScanReport, output_path: &Path) -> Result<()> {
    write_output(&format_text_results(report), output_path)
}
