use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const SITE_BASE: &str = "https://www.vrbo.com";

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Fully resolved scalar settings for one run. Read once from the
/// environment at startup; immutable afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub headless: bool,
    pub user_agent: String,
    pub profile_dir: PathBuf,
    pub fresh_profile: bool,
    pub cookie_string: String,
    pub data_dir: PathBuf,
    /// 0 means no page limit.
    pub max_pages: u32,
    /// 0 means extract every discovered target.
    pub max_detail_targets: usize,
    pub force_tomorrow: bool,
    pub navigation_delay: Duration,
    pub scroll_pause: Duration,
    /// Consecutive no-growth scrolls before the scroll loop stops.
    pub idle_scroll_limit: u32,
    pub max_scrolls: u32,
    pub heading_timeout: Duration,
    pub viewport: (u32, u32),
}

impl Settings {
    pub fn from_env() -> Self {
        let home = env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
        Self {
            headless: env_flag("SCOUT_HEADLESS", true),
            user_agent: env::var("SCOUT_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string()
            }),
            profile_dir: env::var("SCOUT_PROFILE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home.join(".rental_scout_profile")),
            fresh_profile: env_flag("SCOUT_FRESH_PROFILE", false),
            cookie_string: env::var("SCOUT_COOKIE_STRING").unwrap_or_default(),
            data_dir: env::var("SCOUT_DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("data")),
            max_pages: env_parse("SCOUT_MAX_PAGES", 1),
            max_detail_targets: env_parse("SCOUT_MAX_DETAIL_TARGETS", 0),
            force_tomorrow: env_flag("SCOUT_FORCE_TOMORROW", true),
            navigation_delay: Duration::from_millis(env_parse("SCOUT_NAVIGATION_DELAY_MS", 2500)),
            scroll_pause: Duration::from_millis(env_parse("SCOUT_SCROLL_PAUSE_MS", 400)),
            idle_scroll_limit: env_parse("SCOUT_IDLE_SCROLL_LIMIT", 3),
            max_scrolls: env_parse("SCOUT_MAX_SCROLLS", 60),
            heading_timeout: Duration::from_secs(env_parse("SCOUT_HEADING_TIMEOUT_SECS", 30)),
            viewport: (
                env_parse("SCOUT_VIEWPORT_W", 1920),
                env_parse("SCOUT_VIEWPORT_H", 1080),
            ),
        }
    }
}

/// One configured search context: location, dates, guests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionTarget {
    pub name: String,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    /// Full search URL override; when set, dates/guests are patched into it.
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub check_in: Option<String>,
    #[serde(default)]
    pub check_out: Option<String>,
    #[serde(default = "default_adults")]
    pub adults: u32,
    #[serde(default)]
    pub children: u32,
    #[serde(default = "default_nights")]
    pub nights: u32,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub sort: Option<String>,
}

fn default_adults() -> u32 {
    2
}

fn default_nights() -> u32 {
    1
}

fn default_currency() -> String {
    "USD".to_string()
}

impl RegionTarget {
    /// Overwrite the configured dates with tomorrow + `nights`.
    fn force_tomorrow(&mut self) {
        let check_in = Local::now().date_naive() + ChronoDuration::days(1);
        let check_out = check_in + ChronoDuration::days(self.nights.max(1) as i64);
        self.check_in = Some(check_in.format("%Y-%m-%d").to_string());
        self.check_out = Some(check_out.format("%Y-%m-%d").to_string());
    }

    /// Apply the date policy: force-tomorrow wins, and targets without
    /// configured dates get tomorrow regardless.
    pub fn ensure_dates(&mut self, force_tomorrow: bool) {
        if force_tomorrow || self.check_in.is_none() || self.check_out.is_none() {
            self.force_tomorrow();
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegionsFile {
    regions: Vec<RegionTarget>,
}

/// Load region targets from a JSON file. A missing file gets a sample
/// written in its place so the operator has something to edit.
pub fn load_regions(path: &Path, force_tomorrow: bool) -> Result<Vec<RegionTarget>> {
    if !path.exists() {
        let sample = serde_json::json!({
            "regions": [{
                "name": "Bogota",
                "region_name": "Bogota, Distrito Capital, Colombia",
                "region_id": "-592318",
                "nights": 2,
                "adults": 2
            }]
        });
        std::fs::write(path, serde_json::to_string_pretty(&sample)?)
            .with_context(|| format!("Failed to write sample regions file {}", path.display()))?;
        bail!(
            "No regions file found; wrote a sample to {}. Edit it and rerun.",
            path.display()
        );
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read regions file {}", path.display()))?;
    let parsed: RegionsFile = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid regions file {}", path.display()))?;
    if parsed.regions.is_empty() {
        bail!("Regions file {} contains no regions", path.display());
    }
    let mut regions = parsed.regions;
    for region in &mut regions {
        region.ensure_dates(force_tomorrow);
    }
    info!("Loaded {} region target(s) from {}", regions.len(), path.display());
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dates_forces_tomorrow() {
        let mut region = RegionTarget {
            name: "Bogota".to_string(),
            region_name: None,
            region_id: Some("-592318".to_string()),
            search_url: None,
            check_in: Some("2020-01-01".to_string()),
            check_out: Some("2020-01-03".to_string()),
            adults: 2,
            children: 0,
            nights: 2,
            currency: "USD".to_string(),
            sort: None,
        };
        region.ensure_dates(true);

        let tomorrow = Local::now().date_naive() + ChronoDuration::days(1);
        assert_eq!(region.check_in.as_deref(), Some(tomorrow.format("%Y-%m-%d").to_string().as_str()));
        let check_out = tomorrow + ChronoDuration::days(2);
        assert_eq!(region.check_out.as_deref(), Some(check_out.format("%Y-%m-%d").to_string().as_str()));
    }

    #[test]
    fn ensure_dates_keeps_configured_dates_when_not_forced() {
        let mut region = RegionTarget {
            name: "Medellin".to_string(),
            region_name: None,
            region_id: None,
            search_url: None,
            check_in: Some("2030-06-01".to_string()),
            check_out: Some("2030-06-03".to_string()),
            adults: 2,
            children: 1,
            nights: 2,
            currency: "USD".to_string(),
            sort: None,
        };
        region.ensure_dates(false);
        assert_eq!(region.check_in.as_deref(), Some("2030-06-01"));
        assert_eq!(region.check_out.as_deref(), Some("2030-06-03"));
    }

    #[test]
    fn missing_dates_fall_back_to_tomorrow() {
        let mut region = RegionTarget {
            name: "Cali".to_string(),
            region_name: None,
            region_id: None,
            search_url: None,
            check_in: None,
            check_out: None,
            adults: 1,
            children: 0,
            nights: 1,
            currency: "USD".to_string(),
            sort: None,
        };
        region.ensure_dates(false);
        assert!(region.check_in.is_some());
        assert!(region.check_out.is_some());
    }

    #[test]
    fn regions_file_parses_with_defaults() {
        let raw = r#"{"regions": [{"name": "Bogota", "region_id": "-592318"}]}"#;
        let parsed: RegionsFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed.regions[0].adults, 2);
        assert_eq!(parsed.regions[0].nights, 1);
        assert_eq!(parsed.regions[0].currency, "USD");
        assert!(parsed.regions[0].check_in.is_none());
    }
}
