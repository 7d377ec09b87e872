use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::FilterMode;
use crate::control::TestController;
use crate::model::{IpFamily, ResultRecord, RunConfig, RunOutcome, SortKey, TestEvent};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "cloudflare-edge-cli",
    version,
    about = "Discover reachable Cloudflare edge IPs and rank them by download throughput"
)]
pub struct Cli {
    /// Directory holding ips-v4.txt / ips-v6.txt / colo.txt / url.txt
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Address family to draw candidates from
    #[arg(long, value_enum, default_value_t = IpFamily::V4)]
    pub ip_family: IpFamily,

    /// Stop once this many servers meet the bandwidth floor
    #[arg(long, default_value_t = 3)]
    pub expected: usize,

    /// Bandwidth floor in Mbps for a server to qualify
    #[arg(long, default_value_t = 100.0)]
    pub bandwidth: f64,

    /// Probe over HTTPS instead of plain HTTP
    #[arg(long)]
    pub tls: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// Download duration per candidate in seconds
    #[arg(long, default_value_t = 10)]
    pub download_time: u64,

    /// Concurrent workers for the colo-detection phase
    #[arg(long, default_value_t = 10)]
    pub workers: usize,

    /// Candidates drawn per batch
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Keep at most this many results in memory
    #[arg(long, default_value_t = 1000)]
    pub max_results: usize,

    /// Only accept these colo codes (comma separated, e.g. LAX,SJC)
    #[arg(long)]
    pub colos: Option<String>,

    /// Sort key for the final table and exports
    #[arg(long, value_enum, default_value_t = SortKey::Speed)]
    pub sort_by: SortKey,

    /// Sort ascending instead of descending
    #[arg(long)]
    pub ascending: bool,

    /// Print the final results as JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Export results as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Export results as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export results as text
    #[arg(long)]
    pub export_txt: Option<PathBuf>,
}

/// Build a validated `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<RunConfig> {
    let cfg = RunConfig {
        data_dir: args.data_dir.clone(),
        ip_family: args.ip_family,
        expected_servers: args.expected,
        bandwidth_floor: args.bandwidth,
        use_tls: args.tls,
        timeout: Duration::from_secs(args.timeout),
        download_duration: Duration::from_secs(args.download_time),
        workers: args.workers,
        batch_size: args.batch_size,
        max_results: args.max_results,
        ..RunConfig::default()
    };
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    let controller = std::sync::Arc::new(TestController::new(cfg));

    if let Some(codes) = args.colos.as_deref() {
        let codes: Vec<String> = codes
            .split(',')
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        controller.set_filter(FilterMode::Selected, codes).await;
    }

    let mut events = controller.start().await?;

    // Ctrl-C requests a stop; workers drain and the run reports "stopped".
    let stopper = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nstopping...");
            stopper.stop().await;
        }
    });

    while let Some(event) = events.recv().await {
        if !args.json {
            print_event(&event);
        }
    }

    let outcome = controller.wait().await;

    let records = controller
        .results_sorted(args.sort_by, args.ascending)
        .await;
    let stats = controller.stats().await;

    if let Some(path) = args.export_csv.as_deref() {
        crate::storage::export_csv(path, &records)?;
        eprintln!("exported: {}", path.display());
    }
    if let Some(path) = args.export_json.as_deref() {
        crate::storage::export_json(path, &records, &stats)?;
        eprintln!("exported: {}", path.display());
    }
    if let Some(path) = args.export_txt.as_deref() {
        crate::storage::export_txt(path, &records, &stats)?;
        eprintln!("exported: {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_table(&records);
        eprintln!(
            "{} tested, {} qualified",
            stats.completed, stats.qualified
        );
    }

    // A load failure is the only fatal condition; everything else exits 0.
    if let Some(RunOutcome::LoadFailed(reason)) = outcome {
        anyhow::bail!("fatal: {reason}");
    }
    Ok(())
}

fn print_event(event: &TestEvent) {
    match event {
        TestEvent::RunStarted { subnets } => {
            eprintln!("run started: {subnets} subnets loaded");
        }
        TestEvent::BatchStarted { number, size } => {
            eprintln!("== batch {number}: {size} candidates ==");
        }
        TestEvent::PhaseOneCompleted {
            number,
            valid,
            filtered,
        } => {
            eprintln!("batch {number}: {valid} valid IPs ({filtered} filtered)");
        }
        TestEvent::Measuring { ip } => {
            eprintln!("measuring {ip}...");
        }
        TestEvent::ResultRecorded { record } => {
            eprintln!(
                "{}: {} {} Mbps (latency {} ms, {})",
                record.ip, record.status, record.speed, record.latency, record.colo
            );
        }
        TestEvent::Info { message } => eprintln!("{message}"),
        TestEvent::RunFinished { outcome } => eprintln!("finished: {outcome}"),
    }
}

fn print_table(records: &[ResultRecord]) {
    println!(
        "{:<40} {:<12} {:<12} {:<12} {:<12} {}",
        "IP", "Status", "Latency(ms)", "Speed(Mbps)", "Peak(Mbps)", "DataCenter"
    );
    println!("{}", "-".repeat(110));
    for r in records {
        println!(
            "{:<40} {:<12} {:<12} {:<12} {:<12.2} {}",
            r.ip,
            r.status.to_string(),
            r.latency,
            r.speed,
            r.peak_speed,
            r.colo
        );
    }
}
