use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One discovered listing awaiting detail extraction.
///
/// `url` is the cleaned canonical form (scheme + host + path, no query) used
/// for dedup; `full_url` keeps the query string the search page attached,
/// which carries dates and guest counts into the detail view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRef {
    pub id: String,
    pub url: String,
    pub full_url: String,
    pub region: String,
}

/// A titled block of semi-structured page text (room spaces, policies).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContentBlock {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pricing {
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub display_text: Option<String>,
    pub plan_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationInfo {
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsInfo {
    /// Headline under the rooms section, e.g. "2 bedrooms, sleeps 6".
    pub summary: Option<String>,
    pub sleeps: Option<u32>,
    pub spaces: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Amenities {
    pub popular: Vec<String>,
    pub all: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub languages: Option<Vec<String>>,
    pub contact_url: Option<String>,
}

/// Search parameters the record was discovered under, recovered from the
/// page's embedded state rather than echoed from our own configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchContext {
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    pub adults: Option<u32>,
    pub children: Option<u32>,
    pub region_name: Option<String>,
    pub region_id: Option<String>,
}

/// Fully normalized output for one listing. Every optional field is an
/// explicit `Option`; a field missing from the page stays `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: String,
    pub url: String,
    pub name: Option<String>,
    pub property_type: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub header_chips: Vec<String>,
    pub unit_size_text: Option<String>,
    pub unit_size_m2: Option<f64>,
    pub pricing: Pricing,
    pub location: LocationInfo,
    pub rooms: RoomsInfo,
    pub amenities: Amenities,
    pub host: HostInfo,
    pub policies: Vec<ContentBlock>,
    pub images: Vec<String>,
    pub search: SearchContext,
    pub scraped_at: DateTime<Utc>,
}

/// Why a target produced no record. Recorded, never fatal to the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Navigation,
    MissingContent,
    RegionEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub target: String,
    pub kind: FailureKind,
}

/// Aggregated output of one full run, in region/discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records: Vec<ListingRecord>,
    pub failures: Vec<RunFailure>,
}

impl RunResult {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            records: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl Default for RunResult {
    fn default() -> Self {
        Self::new()
    }
}
