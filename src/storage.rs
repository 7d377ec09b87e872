//! Result exports: CSV, JSON, and a human-readable text table.

use anyhow::{Context, Result};
use std::path::Path;

use crate::model::{ResultRecord, RunStats};

fn timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".into())
}

pub fn export_csv(path: &Path, records: &[ResultRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    let mut out = String::new();
    out.push_str("IP,Status,Latency(ms),Speed(Mbps),PeakSpeed(Mbps),DataCenter\n");
    for r in records {
        out.push_str(&format!(
            "{},{},{},{},{:.2},{}\n",
            csv_escape(&r.ip),
            r.status,
            csv_escape(&r.latency),
            csv_escape(&r.speed),
            r.peak_speed,
            csv_escape(&r.colo),
        ));
    }
    std::fs::write(path, out).context("write export csv")?;
    Ok(())
}

pub fn export_json(path: &Path, records: &[ResultRecord], stats: &RunStats) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    let qualified = records
        .iter()
        .filter(|r| r.status == crate::model::ResultStatus::Complete)
        .count();
    let envelope = serde_json::json!({
        "timestamp": timestamp(),
        "total_count": records.len(),
        "qualified_count": qualified,
        "results": records,
        "statistics": stats,
    });
    let data = serde_json::to_vec_pretty(&envelope)?;
    std::fs::write(path, data).context("write export json")?;
    Ok(())
}

pub fn export_txt(path: &Path, records: &[ResultRecord], stats: &RunStats) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    let mut out = String::new();
    out.push_str("Cloudflare edge IP test results\n");
    out.push_str(&format!("Generated: {}\n", timestamp()));
    out.push_str(&format!("Total results: {}\n", records.len()));
    out.push_str(&format!("Qualified: {}\n\n", stats.qualified));
    out.push_str(&format!(
        "{:<40} {:<12} {:<12} {:<12} {:<12} {}\n",
        "IP", "Status", "Latency(ms)", "Speed(Mbps)", "Peak(Mbps)", "DataCenter"
    ));
    out.push_str(&"-".repeat(110));
    out.push('\n');
    for r in records {
        out.push_str(&format!(
            "{:<40} {:<12} {:<12} {:<12} {:<12.2} {}\n",
            r.ip,
            r.status.to_string(),
            r.latency,
            r.speed,
            r.peak_speed,
            r.colo,
        ));
    }
    std::fs::write(path, out).context("write export txt")?;
    Ok(())
}

/// Quote fields containing commas, quotes, or newlines.
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResultStatus;
    use tempfile::TempDir;

    fn sample_records() -> Vec<ResultRecord> {
        vec![
            ResultRecord {
                ip: "1.1.1.1".into(),
                status: ResultStatus::Complete,
                latency: "25.10".into(),
                speed: "210.54".into(),
                peak_speed: 250.1,
                colo: "Los Angeles (LAX)".into(),
            },
            ResultRecord {
                ip: "1.1.1.2".into(),
                status: ResultStatus::Invalid,
                latency: "99.00".into(),
                speed: "timeout".into(),
                peak_speed: 0.0,
                colo: "Frankfurt, Germany (FRA)".into(),
            },
        ]
    }

    #[test]
    fn csv_has_header_and_quotes_commas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        export_csv(&path, &sample_records()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "IP,Status,Latency(ms),Speed(Mbps),PeakSpeed(Mbps),DataCenter"
        );
        assert!(text.contains("\"Frankfurt, Germany (FRA)\""));
        assert!(text.contains("1.1.1.1,complete,25.10,210.54,250.10,Los Angeles (LAX)"));
    }

    #[test]
    fn json_envelope_counts_qualified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        export_json(&path, &sample_records(), &RunStats::default()).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["total_count"], 2);
        assert_eq!(value["qualified_count"], 1);
        assert_eq!(value["results"][1]["speed"], "timeout");
    }

    #[test]
    fn txt_renders_all_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        export_txt(&path, &sample_records(), &RunStats::default()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("1.1.1.1"));
        assert!(text.contains("timeout"));
        assert!(text.contains("DataCenter"));
    }
}
