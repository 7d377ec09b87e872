//! Readers for the static input files (subnet lists, colo table, url list).
//! All of them share the same line discipline: UTF-8 text, blank lines and
//! `#` comments skipped, surrounding whitespace trimmed.

use anyhow::{Context, Result};
use std::path::Path;

use crate::model::IpFamily;

/// Read a line-oriented file, dropping blanks and `#` comments.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

/// Load the CIDR list for the chosen family.
pub fn read_subnets(data_dir: &Path, family: IpFamily) -> Result<Vec<String>> {
    let path = data_dir.join(family.subnet_file());
    let subnets = read_lines(&path)?;
    if subnets.is_empty() {
        anyhow::bail!("no subnets found in {}", path.display());
    }
    Ok(subnets)
}

/// Load url.txt. The pipeline only uses the first entry.
pub fn read_urls(data_dir: &Path) -> Result<Vec<String>> {
    let path = data_dir.join("url.txt");
    let urls = read_lines(&path)?;
    if urls.is_empty() {
        anyhow::bail!("no URLs found in {}", path.display());
    }
    Ok(urls)
}

/// Split a test URL into the Host-header domain and the object path,
/// stripping a leading scheme if present.
pub fn split_url(url: &str) -> (String, String) {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match stripped.split_once('/') {
        Some((domain, path)) => (domain.to_owned(), path.to_owned()),
        None => (stripped.to_owned(), String::new()),
    }
}

/// Which of the static inputs for this run are absent. Reported via
/// `status()` so a missing file is visible before and after a failed load.
pub fn missing_files(data_dir: &Path, family: IpFamily) -> Vec<String> {
    [family.subnet_file(), "colo.txt", "url.txt"]
        .iter()
        .filter(|name| !data_dir.join(name).exists())
        .map(|name| name.to_string())
        .collect()
}
