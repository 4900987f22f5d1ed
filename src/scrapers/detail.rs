use std::fmt;
use std::thread;

use anyhow::Result;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::models::{
    Amenities, ContentBlock, FailureKind, HostInfo, ListingRecord, ListingRef, LocationInfo,
    Pricing, RoomsInfo, SearchContext,
};
use crate::scrapers::browser::PageSession;
use crate::scrapers::guard::{AntiBotGuard, BotCheck, OperatorSignal};

pub const MAX_IMAGES: usize = 12;

/// Liveness signals: any of these means the detail page became interactive.
const HEADING_SELECTORS: &[&str] = &[
    "#product-headline",
    r#"[data-stid="summary-headline"] h1"#,
    r#"h1[data-stid="content-hotel-title"]"#,
    "h1.uitk-heading",
];

const TITLE_BLOCK_SELECTORS: &[&str] = &[
    r#"[data-stid="summary-headline"]"#,
    r#"[data-stid="content-hotel-title"]"#,
    "#product-headline",
    "header h1",
];

/// Button keywords for the "show all" overlays: the full amenity list and
/// the rooms-and-beds breakdown only mount once these are opened.
const OVERLAY_BUTTON_KEYWORDS: &[&[&str]] = &[&["amenities"], &["rooms", "beds", "spaces"]];

const OVERLAY_CLOSE_SELECTORS: &[&str] = &[
    r#"div[role="dialog"] button[aria-label*="Close"]"#,
    r#"section[role="dialog"] button[aria-label*="Close"]"#,
    r#"div[role="dialog"] button"#,
];

/// Per-target failure. Recorded against the run; never aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFailure {
    Timeout,
    MissingContent,
}

impl ExtractFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractFailure::Timeout => FailureKind::Timeout,
            ExtractFailure::MissingContent => FailureKind::MissingContent,
        }
    }
}

impl fmt::Display for ExtractFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractFailure::Timeout => write!(f, "detail page never became ready"),
            ExtractFailure::MissingContent => write!(f, "detail page had no recognizable content"),
        }
    }
}

impl std::error::Error for ExtractFailure {}

pub enum DetailOutcome {
    Extracted(Box<ListingRecord>),
    Failed(ExtractFailure),
}

/// Visits one listing at a time and normalizes the page into a
/// `ListingRecord`. Borrows the session and guard per call.
pub struct DetailExtractor<'a, P: PageSession, S: OperatorSignal> {
    page: &'a P,
    guard: &'a AntiBotGuard<S>,
    settings: &'a Settings,
}

impl<'a, P: PageSession, S: OperatorSignal> DetailExtractor<'a, P, S> {
    pub fn new(page: &'a P, guard: &'a AntiBotGuard<S>, settings: &'a Settings) -> Self {
        Self {
            page,
            guard,
            settings,
        }
    }

    /// Navigate, wait for the heading, trigger lazy sections, then parse.
    /// A `Failed` outcome is local to this target; `Err` means the browser
    /// session itself is gone.
    pub fn extract(&self, target: &ListingRef) -> Result<DetailOutcome> {
        info!(url = %target.url, "Visiting detail page");
        self.page.navigate(&target.full_url)?;

        if !self
            .page
            .wait_for_any(HEADING_SELECTORS, self.settings.heading_timeout)?
        {
            warn!(url = %target.url, "Heading never rendered; skipping target");
            let html = self.page.page_source()?;
            if AntiBotGuard::<S>::check(&html) == BotCheck::Blocked {
                self.guard.ensure_clear(self.page)?;
            }
            return Ok(DetailOutcome::Failed(ExtractFailure::Timeout));
        }
        self.guard.ensure_clear(self.page)?;

        thread::sleep(self.settings.scroll_pause);
        self.scroll_sweep()?;

        let html = self.page.page_source()?;
        let overlays = self.overlay_snapshots()?;
        let state = self.embedded_state(&html)?;
        let latitude = self
            .page
            .read_meta_itemprop("latitude")?
            .and_then(|raw| raw.parse().ok());
        let longitude = self
            .page
            .read_meta_itemprop("longitude")?
            .and_then(|raw| raw.parse().ok());

        let mut record = build_record(target, &html, &state, latitude, longitude);
        for snapshot in &overlays {
            merge_overlay_content(&mut record, snapshot);
        }
        if record.name.is_none() && state.is_null() {
            warn!(url = %target.url, "Detail page had no recognizable content");
            return Ok(DetailOutcome::Failed(ExtractFailure::MissingContent));
        }
        Ok(DetailOutcome::Extracted(Box::new(record)))
    }

    /// Open each "show all" overlay in turn and capture the page with its
    /// content mounted. Overlays whose button never appears are skipped.
    fn overlay_snapshots(&self) -> Result<Vec<String>> {
        let mut snapshots = Vec::new();
        for keywords in OVERLAY_BUTTON_KEYWORDS {
            if !self.page.click_button_with_text(keywords)? {
                continue;
            }
            thread::sleep(self.settings.scroll_pause);
            snapshots.push(self.page.page_source()?);
            self.page.click_first(OVERLAY_CLOSE_SELECTORS)?;
            thread::sleep(self.settings.scroll_pause);
        }
        Ok(snapshots)
    }

    /// Scroll through the page in quarters so lazy sections (images,
    /// amenities, reviews) get a chance to mount.
    fn scroll_sweep(&self) -> Result<()> {
        let height = self.page.scroll_height()?.max(2000);
        for fraction in [0.25_f64, 0.5, 0.75, 1.0] {
            self.page.scroll_to((height as f64 * fraction) as i64)?;
            thread::sleep(self.settings.scroll_pause);
        }
        Ok(())
    }

    /// Prefer the live JS object; fall back to digging the serialized blob
    /// out of the raw HTML.
    fn embedded_state(&self, html: &str) -> Result<Value> {
        if let Some(value) = self.page.evaluate("window.__PLUGIN_STATE__ || null")? {
            if value.is_object() {
                return Ok(value);
            }
        }
        let recovered = recover_embedded_state(html);
        if recovered.is_null() {
            debug!("No embedded state blob found in page source");
        }
        Ok(recovered)
    }
}

/// Recover the `__PLUGIN_STATE__` blob from the page source. The site
/// serializes it as `JSON.parse("...")` with an escaped JSON payload.
pub fn recover_embedded_state(html: &str) -> Value {
    const MARKER: &str = "window.__PLUGIN_STATE__ = JSON.parse(\"";
    let Some(start) = html.find(MARKER) else {
        return Value::Null;
    };
    let rest = &html[start + MARKER.len()..];
    let Some(end) = rest.find("\");") else {
        return Value::Null;
    };
    let raw = &rest[..end];
    // The slice is the body of a JS string literal; re-wrapping it in
    // quotes lets serde handle the unescaping.
    let decoded: String = match serde_json::from_str(&format!("\"{raw}\"")) {
        Ok(decoded) => decoded,
        Err(_) => return Value::Null,
    };
    serde_json::from_str(&decoded).unwrap_or(Value::Null)
}

/// First numeric run in localized text, thousands dots stripped, decimal
/// comma normalized.
fn leading_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let raw: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let normalized = raw.replace('.', "").replace(',', ".");
    normalized.trim_end_matches('.').parse().ok()
}

/// "$1.250.000 COP" -> 1250000.0
pub fn parse_price_amount(text: &str) -> Option<f64> {
    leading_number(text)
}

/// Numeric value of the unit-size fragment. "Unit size: 120 sq m" -> 120.0
pub fn parse_unit_size_m2(text: &str) -> Option<f64> {
    leading_number(text)
}

/// "2 bedrooms, sleeps 6" -> 6
pub fn parse_sleeps(summary: &str) -> Option<u32> {
    let lowered = summary.to_lowercase();
    let idx = lowered.find("sleeps")?;
    let digits: String = lowered[idx + "sleeps".len()..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// The "Unit size: …" fragment the site buries in page text/attributes.
pub fn extract_unit_size(html: &str) -> Option<String> {
    let idx = html
        .find("Unit size:")
        .or_else(|| html.find("unit size:"))?;
    let tail = &html[idx..];
    let end = tail
        .char_indices()
        .find(|(_, c)| *c == '"' || *c == '<')
        .map(|(pos, _)| pos)
        .unwrap_or(tail.len());
    let snippet = tail[..end].trim();
    if snippet.is_empty() {
        None
    } else {
        Some(snippet.to_string())
    }
}

fn value_at<'v>(root: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn str_at(root: &Value, path: &[&str]) -> Option<String> {
    match value_at(root, path)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn u32_at(root: &Value, path: &[&str]) -> Option<u32> {
    match value_at(root, path)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn select_first<'d>(doc: &'d Html, selector: &str) -> Option<ElementRef<'d>> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector).next()
}

fn select_first_in<'d>(root: ElementRef<'d>, selector: &str) -> Option<ElementRef<'d>> {
    let selector = Selector::parse(selector).ok()?;
    root.select(&selector).next()
}

fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<String>().trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn first_text_in(root: ElementRef<'_>, selector: &str) -> Option<String> {
    select_first_in(root, selector).and_then(text_of)
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !item.is_empty() && !list.contains(&item) {
        list.push(item);
    }
}

/// A heading + body fragment, with the heading stripped once from the body
/// text (the text collector sees the heading twice otherwise).
fn parse_content_block(element: ElementRef<'_>) -> Option<ContentBlock> {
    let title = ["h3", "h4", "h5"]
        .iter()
        .find_map(|sel| first_text_in(element, sel));
    let raw_body = text_of(element);
    let description = match (&title, raw_body) {
        (Some(title), Some(body)) => {
            let stripped = body.replacen(title.as_str(), "", 1).trim().to_string();
            (!stripped.is_empty()).then_some(stripped)
        }
        (None, body) => body,
        (Some(_), None) => None,
    };
    if title.is_none() && description.is_none() {
        return None;
    }
    Some(ContentBlock { title, description })
}

fn extract_rooms(doc: &Html) -> RoomsInfo {
    let summary = select_first(doc, "#Rooms h3").and_then(text_of);
    let sleeps = summary.as_deref().and_then(parse_sleeps);

    let mut spaces: Vec<ContentBlock> = Vec::new();
    if let Some(selector) = Selector::parse(r#"#Rooms [data-stid="content-item"]"#).ok() {
        for element in doc.select(&selector) {
            if let Some(block) = parse_content_block(element) {
                if !spaces.contains(&block) {
                    spaces.push(block);
                }
            }
        }
    }
    RoomsInfo {
        summary,
        sleeps,
        spaces,
    }
}

/// All amenity item texts anywhere in the document. The expanded overlay
/// renders the same item markup, so the one scan covers both.
fn amenity_items(doc: &Html) -> Vec<String> {
    let mut items = Vec::new();
    if let Some(selector) = Selector::parse(r#"li[data-stid^="sp-content-item"] .uitk-text"#).ok() {
        for element in doc.select(&selector) {
            if let Some(text) = text_of(element) {
                push_unique(&mut items, text);
            }
        }
    }
    items
}

/// All room/space blocks anywhere in the document, first-seen order.
fn space_blocks(doc: &Html) -> Vec<ContentBlock> {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    if let Some(selector) = Selector::parse(r#"[data-stid="content-item"]"#).ok() {
        for element in doc.select(&selector) {
            if let Some(block) = parse_content_block(element) {
                if !blocks.contains(&block) {
                    blocks.push(block);
                }
            }
        }
    }
    blocks
}

fn extract_amenities(doc: &Html) -> Amenities {
    let mut popular = Vec::new();
    if let Some(selector) =
        Selector::parse(r#"#PopularAmenities li[data-stid^="sp-content-item"] .uitk-text"#).ok()
    {
        for element in doc.select(&selector) {
            if let Some(text) = text_of(element) {
                push_unique(&mut popular, text);
            }
        }
    }
    let mut all = popular.clone();
    for item in amenity_items(doc) {
        push_unique(&mut all, item);
    }
    Amenities { popular, all }
}

/// Fold an overlay snapshot into the record: amenity items extend the full
/// list, space blocks extend the rooms section, both keeping first-seen
/// order without repeats.
fn merge_overlay_content(record: &mut ListingRecord, html: &str) {
    let doc = Html::parse_document(html);
    for item in amenity_items(&doc) {
        push_unique(&mut record.amenities.all, item);
    }
    for block in space_blocks(&doc) {
        if !record.rooms.spaces.contains(&block) {
            record.rooms.spaces.push(block);
        }
    }
}

fn extract_host(doc: &Html) -> HostInfo {
    let Some(root) = select_first(doc, "#Host") else {
        return HostInfo::default();
    };
    let name = first_text_in(root, "h3");
    let avatar_url = select_first_in(root, "img")
        .and_then(|img| img.value().attr("src"))
        .map(str::to_string);
    let contact_url = select_first_in(root, r#"a[data-stid*="contact-host"]"#)
        .and_then(|link| link.value().attr("href"))
        .map(str::to_string);

    let mut languages = None;
    if let Some(selector) = Selector::parse("h5").ok() {
        for heading in root.select(&selector) {
            let Some(text) = text_of(heading) else { continue };
            if !text.to_lowercase().contains("language") {
                continue;
            }
            for sibling in heading.next_siblings() {
                let Some(element) = ElementRef::wrap(sibling) else {
                    continue;
                };
                if let Some(raw) = text_of(element) {
                    let parsed: Vec<String> = raw
                        .split(|c| c == ',' || c == '/')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !parsed.is_empty() {
                        languages = Some(parsed);
                    }
                    break;
                }
            }
            break;
        }
    }
    HostInfo {
        name,
        avatar_url,
        languages,
        contact_url,
    }
}

fn extract_policies(doc: &Html) -> Vec<ContentBlock> {
    let Some(root) = select_first(doc, "#Policies") else {
        return Vec::new();
    };
    let mut policies: Vec<ContentBlock> = Vec::new();

    if let Some(selector) = Selector::parse(".uitk-layout-grid-item").ok() {
        for element in root.select(&selector) {
            if let Some(block) = parse_content_block(element) {
                if !policies.contains(&block) {
                    policies.push(block);
                }
            }
        }
    }
    if let Some(selector) = Selector::parse("details").ok() {
        for element in root.select(&selector) {
            let title = first_text_in(element, "summary");
            let description = match (&title, text_of(element)) {
                (Some(title), Some(body)) => {
                    let stripped = body.replacen(title.as_str(), "", 1).trim().to_string();
                    (!stripped.is_empty()).then_some(stripped)
                }
                (None, body) => body,
                (Some(_), None) => None,
            };
            if title.is_none() && description.is_none() {
                continue;
            }
            let block = ContentBlock { title, description };
            if !policies.contains(&block) {
                policies.push(block);
            }
        }
    }
    policies
}

fn extract_images(doc: &Html) -> Vec<String> {
    let mut images = Vec::new();
    if let Some(selector) = Selector::parse("#Overview img").ok() {
        for element in doc.select(&selector) {
            if let Some(src) = element.value().attr("src") {
                push_unique(&mut images, src.to_string());
                if images.len() >= MAX_IMAGES {
                    break;
                }
            }
        }
    }
    images
}

/// Normalize one detail page: embedded state first, DOM fallbacks for
/// anything the blob doesn't carry. Absent fields stay `None`.
pub fn build_record(
    target: &ListingRef,
    html: &str,
    state: &Value,
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> ListingRecord {
    let doc = Html::parse_document(html);
    let null = Value::Null;
    let hotel = value_at(state, &["controllers", "stores", "currentHotel"]).unwrap_or(&null);
    let tealium = value_at(hotel, &["detailsPayload", "tealiumUtagData"]).unwrap_or(&null);
    let offer = value_at(hotel, &["offerSearchData"]).unwrap_or(&null);
    let dest = value_at(hotel, &["searchCriteria", "destination"]).unwrap_or(&null);

    let id = str_at(hotel, &["hotelId"])
        .or_else(|| str_at(tealium, &["hotelId"]))
        .unwrap_or_else(|| target.id.clone());

    let title_block = TITLE_BLOCK_SELECTORS
        .iter()
        .find_map(|sel| select_first(&doc, sel));
    let name = title_block.and_then(|block| first_text_in(block, "h1"));

    let mut header_chips: Vec<String> = Vec::new();
    if let Some(block) = title_block {
        if let Some(selector) = Selector::parse(".uitk-text").ok() {
            for element in block.select(&selector) {
                if let Some(text) = text_of(element) {
                    push_unique(&mut header_chips, text);
                }
            }
        }
    }
    let plan_name = header_chips.first().cloned();
    let property_type = header_chips
        .get(1)
        .cloned()
        .or_else(|| header_chips.first().cloned());

    let address = title_block
        .and_then(|block| first_text_in(block, r#"[data-stid="content-hotel-address"]"#))
        .or_else(|| select_first(&doc, r#"[data-stid="content-hotel-address"]"#).and_then(text_of))
        .or_else(|| {
            select_first(&doc, r#"[data-stid="summary-location"] .uitk-text"#).and_then(text_of)
        });

    let description = {
        let mut parts = Vec::new();
        if let Some(selector) = Selector::parse(r#"[data-stid="content-markup"]"#).ok() {
            for element in doc.select(&selector) {
                if let Some(text) = text_of(element) {
                    parts.push(text);
                }
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    };

    let price_text =
        select_first(&doc, r#"[data-stid="property-offer-price-summary"]"#).and_then(text_of);
    let pricing = Pricing {
        amount: price_text.as_deref().and_then(parse_price_amount),
        currency: str_at(tealium, &["currencyCode"]).or_else(|| str_at(offer, &["currency"])),
        display_text: price_text,
        plan_name,
    };

    let region_name = str_at(dest, &["regionName"]);
    let location = LocationInfo {
        city: region_name.clone().or_else(|| address.clone()),
        country: str_at(dest, &["countryName"])
            .or_else(|| str_at(dest, &["country"]))
            .or_else(|| str_at(tealium, &["propertyCountry"])),
        address,
        latitude,
        longitude,
    };

    let search = SearchContext {
        check_in: str_at(offer, &["startDate"]),
        check_out: str_at(offer, &["endDate"]),
        adults: u32_at(offer, &["adults"]),
        children: u32_at(offer, &["children"]),
        region_name,
        region_id: str_at(dest, &["regionId"]),
    };

    let unit_size_text = extract_unit_size(html);
    let unit_size_m2 = unit_size_text.as_deref().and_then(parse_unit_size_m2);

    ListingRecord {
        id,
        url: target.url.clone(),
        name,
        property_type,
        description,
        status: str_at(tealium, &["listing_status"]),
        header_chips,
        unit_size_text,
        unit_size_m2,
        pricing,
        location,
        rooms: extract_rooms(&doc),
        amenities: extract_amenities(&doc),
        host: extract_host(&doc),
        policies: extract_policies(&doc),
        images: extract_images(&doc),
        search,
        scraped_at: Utc::now(),
    }
}
