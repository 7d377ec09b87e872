//! Colo catalog: the static table mapping colo codes to locations, with
//! region inference and an optional allow-list filter applied after the
//! colo-detection phase.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How long a loaded table stays fresh before `load` re-reads the file.
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    NorthAmerica,
    Europe,
    AsiaPacific,
    SouthAmerica,
    Africa,
    MiddleEast,
    Other,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Region::NorthAmerica => "North America",
            Region::Europe => "Europe",
            Region::AsiaPacific => "Asia Pacific",
            Region::SouthAmerica => "South America",
            Region::Africa => "Africa",
            Region::MiddleEast => "Middle East",
            Region::Other => "Other",
        };
        write!(f, "{s}")
    }
}

const NORTH_AMERICA: &[&str] = &["united states", "usa", "canada", "mexico"];
const EUROPE: &[&str] = &[
    "united kingdom",
    "germany",
    "france",
    "netherlands",
    "spain",
    "italy",
    "poland",
    "sweden",
    "finland",
    "norway",
    "denmark",
    "belgium",
    "switzerland",
    "austria",
    "czech",
    "portugal",
    "ireland",
    "romania",
    "bulgaria",
    "greece",
    "turkey",
    "russia",
];
const ASIA_PACIFIC: &[&str] = &[
    "china",
    "japan",
    "korea",
    "singapore",
    "hong kong",
    "taiwan",
    "thailand",
    "malaysia",
    "indonesia",
    "philippines",
    "vietnam",
    "india",
    "australia",
    "new zealand",
];
const SOUTH_AMERICA: &[&str] = &[
    "brazil",
    "argentina",
    "chile",
    "colombia",
    "peru",
    "ecuador",
];
const AFRICA: &[&str] = &["south africa", "egypt", "kenya", "nigeria", "morocco"];
const MIDDLE_EAST: &[&str] = &[
    "israel",
    "uae",
    "saudi arabia",
    "qatar",
    "bahrain",
    "kuwait",
];

/// Infer a region from the location string when the colo file omits one.
pub fn infer_region(location: &str) -> Region {
    let loc = location.to_lowercase();
    let tables = [
        (NORTH_AMERICA, Region::NorthAmerica),
        (EUROPE, Region::Europe),
        (ASIA_PACIFIC, Region::AsiaPacific),
        (SOUTH_AMERICA, Region::SouthAmerica),
        (AFRICA, Region::Africa),
        (MIDDLE_EAST, Region::MiddleEast),
    ];
    for (keywords, region) in tables {
        if keywords.iter().any(|k| loc.contains(k)) {
            return region;
        }
    }
    Region::Other
}

/// Strip a parenthesised disambiguator, e.g. "LAX (Los Angeles)" -> "LAX".
fn extract_code(raw: &str) -> String {
    let code = match raw.find('(') {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    code.trim().to_owned()
}

fn parse_region(raw: &str) -> Region {
    match raw.trim() {
        "North America" => Region::NorthAmerica,
        "Europe" => Region::Europe,
        "Asia Pacific" => Region::AsiaPacific,
        "South America" => Region::SouthAmerica,
        "Africa" => Region::Africa,
        "Middle East" => Region::MiddleEast,
        _ => Region::Other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColoInfo {
    pub code: String,
    pub location: String,
    pub region: Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    All,
    Selected,
}

impl std::str::FromStr for FilterMode {
    type Err = std::convert::Infallible;

    // Unknown modes are treated as "all".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "selected" => FilterMode::Selected,
            _ => FilterMode::All,
        })
    }
}

struct CatalogState {
    colos: HashMap<String, ColoInfo>,
    list: Vec<ColoInfo>,
    filter: FilterMode,
    selected: HashSet<String>,
    loaded_at: Option<Instant>,
    cache_valid: bool,
}

/// Read-mostly colo table behind a single RwLock: lookups and filtering take
/// the shared side, `load`/`set_filter`/`invalidate` the exclusive one.
pub struct ColoCatalog {
    path: PathBuf,
    state: RwLock<CatalogState>,
}

impl ColoCatalog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("colo.txt"),
            state: RwLock::new(CatalogState {
                colos: HashMap::new(),
                list: Vec::new(),
                filter: FilterMode::All,
                selected: HashSet::new(),
                loaded_at: None,
                cache_valid: false,
            }),
        }
    }

    /// Parse colo.txt into the cached table. A fresh cache short-circuits.
    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.cache_valid {
            if let Some(at) = state.loaded_at {
                if at.elapsed() < CACHE_TTL {
                    return Ok(());
                }
            }
        }

        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;

        state.colos.clear();
        state.list.clear();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, ',');
            let location = match parts.next() {
                Some(l) => l.trim().to_owned(),
                None => continue,
            };
            let code = match parts.next() {
                Some(c) => extract_code(c),
                None => continue,
            };
            if code.is_empty() {
                continue;
            }
            let region = match parts.next() {
                Some(r) if !r.trim().is_empty() => parse_region(r),
                _ => infer_region(&location),
            };
            let info = ColoInfo {
                code: code.clone(),
                location,
                region,
            };
            state.colos.insert(code, info.clone());
            state.list.push(info);
        }

        state.loaded_at = Some(Instant::now());
        state.cache_valid = true;
        tracing::debug!(colos = state.list.len(), "colo catalog loaded");
        Ok(())
    }

    pub async fn is_loaded(&self) -> bool {
        !self.state.read().await.colos.is_empty()
    }

    pub async fn lookup(&self, code: &str) -> Option<ColoInfo> {
        self.state.read().await.colos.get(code).cloned()
    }

    /// `"<Location> (<code>)"`, or the raw code when the table doesn't know it.
    pub async fn friendly_name(&self, code: &str) -> String {
        match self.state.read().await.colos.get(code) {
            Some(info) => format!("{} ({})", info.location, code),
            None => code.to_owned(),
        }
    }

    pub async fn set_filter(&self, mode: FilterMode, codes: Vec<String>) {
        let mut state = self.state.write().await;
        state.selected = codes.into_iter().collect();
        state.filter = if state.selected.is_empty() {
            FilterMode::All
        } else {
            mode
        };
    }

    pub async fn filter_mode(&self) -> FilterMode {
        self.state.read().await.filter
    }

    /// Whether a detected colo passes the current filter.
    pub async fn allow(&self, code: &str) -> bool {
        let state = self.state.read().await;
        match state.filter {
            FilterMode::All => true,
            FilterMode::Selected => state.selected.contains(code),
        }
    }

    pub async fn codes(&self) -> Vec<String> {
        self.state.read().await.colos.keys().cloned().collect()
    }

    pub async fn list(&self) -> Vec<ColoInfo> {
        self.state.read().await.list.clone()
    }

    /// Catalog entries grouped by region, for selection UIs.
    pub async fn by_region(&self) -> BTreeMap<Region, Vec<ColoInfo>> {
        let state = self.state.read().await;
        let mut regions: BTreeMap<Region, Vec<ColoInfo>> = BTreeMap::new();
        for info in &state.list {
            regions.entry(info.region).or_default().push(info.clone());
        }
        regions
    }

    /// Force a re-read on the next `load`.
    pub async fn invalidate(&self) {
        self.state.write().await.cache_valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn catalog_with(content: &str) -> (TempDir, ColoCatalog) {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join("colo.txt")).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        let cat = ColoCatalog::new(dir.path());
        (dir, cat)
    }

    #[tokio::test]
    async fn parses_entries_and_strips_parens() {
        let (_dir, cat) = catalog_with(
            "# Cloudflare colos\nLos Angeles; United States, LAX (Los Angeles)\nFrankfurt; Germany, FRA\n",
        );
        cat.load().await.unwrap();
        let lax = cat.lookup("LAX").await.unwrap();
        assert_eq!(lax.code, "LAX");
        assert_eq!(lax.region, Region::NorthAmerica);
        let fra = cat.lookup("FRA").await.unwrap();
        assert_eq!(fra.region, Region::Europe);
    }

    #[tokio::test]
    async fn explicit_region_wins_over_inference() {
        let (_dir, cat) = catalog_with("Somewhere, XYZ, Middle East\n");
        cat.load().await.unwrap();
        assert_eq!(cat.lookup("XYZ").await.unwrap().region, Region::MiddleEast);
    }

    #[tokio::test]
    async fn friendly_name_falls_back_to_code() {
        let (_dir, cat) = catalog_with("Los Angeles, LAX\n");
        cat.load().await.unwrap();
        assert_eq!(cat.friendly_name("LAX").await, "Los Angeles (LAX)");
        assert_eq!(cat.friendly_name("ZZZ").await, "ZZZ");
    }

    #[tokio::test]
    async fn filter_modes() {
        let (_dir, cat) = catalog_with("Los Angeles, LAX\nFrankfurt; Germany, FRA\n");
        cat.load().await.unwrap();

        assert!(cat.allow("LAX").await);
        assert!(cat.allow("FRA").await);

        cat.set_filter(FilterMode::Selected, vec!["LAX".into()]).await;
        assert!(cat.allow("LAX").await);
        assert!(!cat.allow("FRA").await);

        // Selecting nothing drops back to "all".
        cat.set_filter(FilterMode::Selected, vec![]).await;
        assert!(cat.allow("FRA").await);
    }

    #[tokio::test]
    async fn groups_by_region() {
        let (_dir, cat) = catalog_with(
            "Los Angeles; United States, LAX\nToronto; Canada, YYZ\nTokyo; Japan, NRT\n",
        );
        cat.load().await.unwrap();
        let grouped = cat.by_region().await;
        assert_eq!(grouped[&Region::NorthAmerica].len(), 2);
        assert_eq!(grouped[&Region::AsiaPacific].len(), 1);
    }

    #[test]
    fn region_inference_defaults_to_other() {
        assert_eq!(infer_region("Atlantis"), Region::Other);
        assert_eq!(infer_region("São Paulo; Brazil"), Region::SouthAmerica);
    }

    #[test]
    fn unknown_filter_mode_parses_as_all() {
        let mode: FilterMode = "bogus".parse().unwrap();
        assert_eq!(mode, FilterMode::All);
    }
}
