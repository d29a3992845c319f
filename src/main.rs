use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use log::{debug, error, info, LevelFilter};

use vulnscout::output;
use vulnscout::{PortRange, ScanConfig, Scanner};

/// Concurrent port scanner with banner grabbing and CVE correlation
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Target IP address or hostname
    #[clap(value_parser)]
    host: String,

    /// Port range to scan, e.g. 1-1024 or 22
    range: Option<String>,

    /// Skip vulnerability lookups
    #[clap(long)]
    no_cve: bool,

    /// Skip banner grabbing
    #[clap(long)]
    no_banner: bool,

    /// Maximum number of ports scanned at once
    #[clap(short, long)]
    threads: Option<usize>,

    /// Connect timeout in seconds
    #[clap(long)]
    timeout: Option<f64>,

    /// Banner grabbing timeout in seconds
    #[clap(long)]
    banner_timeout: Option<f64>,

    /// Keyword-search endpoint of an NVD-compatible vulnerability API
    #[clap(long)]
    vuln_endpoint: Option<String>,

    /// Load settings from a JSON config file; flags override its values
    #[clap(long)]
    config: Option<PathBuf>,

    /// Write the report as JSON to this path
    #[clap(long)]
    json: Option<PathBuf>,

    /// Write the report as plain text to this path
    #[clap(long)]
    txt: Option<PathBuf>,

    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,

    /// Disable colored output
    #[clap(long)]
    no_color: bool,
}

/// Initialize logging on stderr, `RUST_LOG` takes precedence over `--verbose`
fn setup_logging(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_secs()
        .format_module_path(true)
        .format_target(false)
        .target(env_logger::Target::Stderr)
        .init();
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid value for {}", flag))
}

/// Merge the config file (if any) with command line flags
fn build_config(args: &Args) -> Result<ScanConfig> {
    let mut config = match &args.config {
        Some(path) => ScanConfig::from_file(path)?,
        None => ScanConfig::default(),
    };

    config.host = args.host.clone();
    if let Some(range) = &args.range {
        config.range = PortRange::parse(range)?;
    }
    if let Some(threads) = args.threads {
        config.concurrency = threads;
    }
    if let Some(timeout) = args.timeout {
        config.probe_timeout = seconds(timeout, "--timeout")?;
    }
    if let Some(timeout) = args.banner_timeout {
        config.banner_timeout = seconds(timeout, "--banner-timeout")?;
    }
    if let Some(endpoint) = &args.vuln_endpoint {
        config.vuln_endpoint = endpoint.clone();
    }
    if args.no_cve {
        config.lookup_vulns = false;
    }
    if args.no_banner {
        config.grab_banners = false;
    }
    // Longer stage timeouts from flags must not make open ports time out
    if args.timeout.is_some() || args.banner_timeout.is_some() {
        config.fit_task_timeout();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose);
    if args.no_color {
        console::set_colors_enabled(false);
    }

    // Configuration problems are fatal before any network activity
    let config = match build_config(&args).and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };
    debug!("Effective configuration: {:?}", config);

    println!(
        "[{}] Scanning {} ports {} with {} workers",
        style("+").green(),
        config.host,
        config.range,
        config.concurrency
    );
    if !config.lookup_vulns {
        info!("Vulnerability lookups disabled");
    }

    let scanner = Scanner::new(config)?.on_record(Arc::new(output::print_live_record));
    let report = scanner.run_scan().await?;

    output::print_results(&report);

    if let Some(path) = &args.json {
        output::save_json_results(&report, path)?;
        println!("[{}] Results saved to {} in JSON format", style("+").green(), path.display());
    }
    if let Some(path) = &args.txt {
        output::save_text_results(&report, path)?;
        println!("[{}] Results saved to {}", style("+").green(), path.display());
    }

    Ok(())
}
