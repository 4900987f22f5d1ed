use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{RegionTarget, Settings, SITE_BASE};
use crate::models::ListingRef;
use crate::scrapers::browser::PageSession;
use crate::scrapers::guard::{AntiBotGuard, BotCheck, OperatorSignal};

/// Card containers, most specific first. The site swaps these between
/// experiments, so we probe the whole cascade.
const CARD_SELECTORS: &[&str] = &[
    r#"[data-stid="lodging-card-responsive"]"#,
    r#"[data-stid="lodging-card"]"#,
    r#"[data-stid="property-listing"]"#,
    "article[data-stid]",
];

const LINK_SELECTORS: &[&str] = &[
    r#"a[data-stid="open-hotel-information"]"#,
    r#"a[href*="/pdp/"]"#,
    r#"a[href*="/vacation-rental/"]"#,
];

const NEXT_SELECTORS: &[&str] = &[
    r#"[data-stid="pagination-next"]"#,
    r#"button[data-stid="next-button"]"#,
    r#"button[aria-label*="Next"]"#,
    r#"a[aria-label*="Next"]"#,
    r#"a[rel="next"]"#,
];

/// Strip query and fragment so the same listing reached through different
/// search contexts dedups to one URL. Relative hrefs resolve against the
/// site base.
pub fn clean_url(href: &str) -> Option<String> {
    let base = Url::parse(SITE_BASE).ok()?;
    let mut url = base.join(href).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Listing id is the last path segment of the cleaned URL.
pub fn listing_id_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}

/// Build the search entry URL for a region. A configured `search_url` is
/// used as-is with dates, guests and region id patched into its query;
/// otherwise the URL is assembled from scratch.
pub fn build_search_url(region: &RegionTarget) -> String {
    if let Some(override_url) = &region.search_url {
        if let Ok(parsed) = Url::parse(override_url) {
            return patch_search_url(parsed, region);
        }
    }

    let mut url = Url::parse(SITE_BASE).expect("site base URL is valid");
    url.set_path("/search");
    {
        let mut query = url.query_pairs_mut();
        let destination = region
            .region_name
            .as_deref()
            .unwrap_or(region.name.as_str());
        query.append_pair("destination", destination);
        if let Some(region_id) = &region.region_id {
            query.append_pair("regionId", region_id);
        }
        if let Some(check_in) = &region.check_in {
            query.append_pair("d1", check_in);
            query.append_pair("startDate", check_in);
        }
        if let Some(check_out) = &region.check_out {
            query.append_pair("d2", check_out);
            query.append_pair("endDate", check_out);
        }
        query.append_pair("adults", &region.adults.max(1).to_string());
        if region.children > 0 {
            query.append_pair("children", &region.children.to_string());
        }
        if let Some(sort) = &region.sort {
            query.append_pair("sort", sort);
        }
    }
    url.to_string()
}

fn patch_search_url(parsed: Url, region: &RegionTarget) -> String {
    let date_keys = ["checkIn", "startDate", "d1", "checkOut", "endDate", "d2"];
    let managed = ["adults", "children", "regionId", "sort"];
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !date_keys.contains(&key.as_ref()) && !managed.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if let Some(check_in) = &region.check_in {
        for key in ["checkIn", "startDate", "d1"] {
            pairs.push((key.to_string(), check_in.clone()));
        }
    }
    if let Some(check_out) = &region.check_out {
        for key in ["checkOut", "endDate", "d2"] {
            pairs.push((key.to_string(), check_out.clone()));
        }
    }
    pairs.push(("adults".to_string(), region.adults.max(1).to_string()));
    if region.children > 0 {
        pairs.push(("children".to_string(), region.children.to_string()));
    }
    if let Some(region_id) = &region.region_id {
        pairs.push(("regionId".to_string(), region_id.clone()));
    }
    if let Some(sort) = &region.sort {
        pairs.push(("sort".to_string(), sort.clone()));
    }

    let mut url = parsed;
    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}

/// Parse the currently loaded result cards out of the page HTML. May
/// contain repeats; the discovery loop dedups by listing id.
pub fn extract_cards(html: &str, region: &str) -> Vec<ListingRef> {
    let document = Html::parse_document(html);

    let mut cards = Vec::new();
    for selector_src in CARD_SELECTORS {
        let selector = Selector::parse(selector_src).expect("card selector is valid");
        cards = document.select(&selector).collect();
        if !cards.is_empty() {
            break;
        }
    }

    let link_selectors: Vec<Selector> = LINK_SELECTORS
        .iter()
        .map(|src| Selector::parse(src).expect("link selector is valid"))
        .collect();

    let mut refs = Vec::new();
    for card in cards {
        let link = link_selectors
            .iter()
            .find_map(|selector| card.select(selector).next());
        let Some(link) = link else { continue };
        let Some(full_href) = link.value().attr("href") else { continue };
        let Some(url) = clean_url(full_href) else { continue };
        let full_url = clean_full_url(full_href).unwrap_or_else(|| url.clone());
        refs.push(ListingRef {
            id: listing_id_from_url(&url),
            url,
            full_url,
            region: region.to_string(),
        });
    }
    refs
}

fn clean_full_url(href: &str) -> Option<String> {
    let base = Url::parse(SITE_BASE).ok()?;
    Some(base.join(href).ok()?.to_string())
}

/// Drives one region's search: load, scroll until idle, harvest cards,
/// paginate. Borrows the session and guard for the duration of the call.
pub struct DiscoveryEngine<'a, P: PageSession, S: OperatorSignal> {
    page: &'a P,
    guard: &'a AntiBotGuard<S>,
    settings: &'a Settings,
}

impl<'a, P: PageSession, S: OperatorSignal> DiscoveryEngine<'a, P, S> {
    pub fn new(page: &'a P, guard: &'a AntiBotGuard<S>, settings: &'a Settings) -> Self {
        Self {
            page,
            guard,
            settings,
        }
    }

    /// Collect listing references for one region, deduplicated by listing
    /// id, in first-seen order. An empty result is a reported partial
    /// failure, not an error.
    pub fn discover(&self, region: &RegionTarget) -> Result<Vec<ListingRef>> {
        let url = build_search_url(region);
        info!(region = %region.name, url = %url, "Processing region");
        self.page.navigate(&url)?;
        thread::sleep(self.settings.navigation_delay);
        self.guard.ensure_clear(self.page)?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut refs: Vec<ListingRef> = Vec::new();
        let mut page_num: u32 = 1;

        loop {
            self.scroll_results()?;
            let html = self.page.page_source()?;
            let cards = extract_cards(&html, &region.name);

            if cards.is_empty() {
                if AntiBotGuard::<S>::check(&html) == BotCheck::Blocked {
                    self.guard.ensure_clear(self.page)?;
                    continue;
                }
                warn!(page = page_num, "No listing cards visible");
                break;
            }

            let mut new_count = 0;
            for card in cards {
                if seen.insert(card.id.clone()) {
                    refs.push(card);
                    new_count += 1;
                }
            }
            info!(
                page = page_num,
                new = new_count,
                total = refs.len(),
                "Search page harvested"
            );

            if new_count == 0 {
                debug!(page = page_num, "No new results; stopping pagination");
                break;
            }
            if self.settings.max_pages > 0 && page_num >= self.settings.max_pages {
                break;
            }
            if !self.page.click_first(NEXT_SELECTORS)? {
                info!(page = page_num, "Next-page control unavailable");
                break;
            }
            page_num += 1;
            thread::sleep(self.settings.navigation_delay + jitter());
        }

        if refs.is_empty() {
            warn!(region = %region.name, "Region yielded no listings");
        }
        Ok(refs)
    }

    /// Scroll the result list until `idle_scroll_limit` consecutive steps
    /// see no further content growth, bounded by `max_scrolls`.
    fn scroll_results(&self) -> Result<()> {
        let mut height = self.page.scroll_height()?;
        let mut position: i64 = 0;
        let mut idle: u32 = 0;

        for _ in 0..self.settings.max_scrolls {
            if idle >= self.settings.idle_scroll_limit {
                break;
            }
            position += 800;
            self.page.scroll_to(position)?;
            thread::sleep(self.settings.scroll_pause);
            let new_height = self.page.scroll_height()?;
            if new_height <= height && position >= height {
                idle += 1;
            } else {
                idle = 0;
            }
            height = height.max(new_height);
        }
        self.page.scroll_to(height)?;
        thread::sleep(self.settings.scroll_pause);
        Ok(())
    }
}

pub(crate) fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=500))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scrapers::browser::mock::MockSession;
    use crate::scrapers::guard::StdinSignal;
    use std::path::PathBuf;

    pub(crate) fn test_settings() -> Settings {
        Settings {
            headless: true,
            user_agent: "test".to_string(),
            profile_dir: PathBuf::from("/tmp/test_profile"),
            fresh_profile: false,
            cookie_string: String::new(),
            data_dir: PathBuf::from("/tmp/test_data"),
            max_pages: 1,
            max_detail_targets: 0,
            force_tomorrow: false,
            navigation_delay: Duration::from_millis(0),
            scroll_pause: Duration::from_millis(0),
            idle_scroll_limit: 3,
            max_scrolls: 10,
            heading_timeout: Duration::from_millis(0),
            viewport: (1920, 1080),
        }
    }

    pub(crate) fn test_region() -> RegionTarget {
        RegionTarget {
            name: "Bogota".to_string(),
            region_name: Some("Bogota, Distrito Capital, Colombia".to_string()),
            region_id: Some("-592318".to_string()),
            search_url: None,
            check_in: Some("2026-09-01".to_string()),
            check_out: Some("2026-09-03".to_string()),
            adults: 2,
            children: 0,
            nights: 2,
            currency: "USD".to_string(),
            sort: None,
        }
    }

    fn card_html(ids: &[&str]) -> String {
        let cards: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<div data-stid="lodging-card-responsive">
                        <a data-stid="open-hotel-information" href="/vacation-rental/p{id}?chkin=2026-09-01">Casa {id}</a>
                    </div>"#
                )
            })
            .collect();
        format!("<html><body><div data-stid=\"results\">{cards}</div></body></html>")
    }

    #[test]
    fn search_url_carries_region_and_guests() {
        let url = build_search_url(&test_region());
        assert!(url.starts_with("https://www.vrbo.com/search?"));
        assert!(url.contains("regionId=-592318"));
        assert!(url.contains("adults=2"));
        assert!(url.contains("d1=2026-09-01"));
        assert!(url.contains("endDate=2026-09-03"));
        assert!(!url.contains("children"));
    }

    #[test]
    fn search_url_override_gets_dates_patched() {
        let mut region = test_region();
        region.search_url =
            Some("https://www.vrbo.com/search?destination=Bogota&d1=2020-01-01&adults=9".to_string());
        let url = build_search_url(&region);
        assert!(url.contains("destination=Bogota"));
        assert!(url.contains("d1=2026-09-01"));
        assert!(!url.contains("2020-01-01"));
        assert!(url.contains("adults=2"));
        assert!(!url.contains("adults=9"));
    }

    #[test]
    fn clean_url_strips_query_and_resolves_relative() {
        let cleaned = clean_url("/vacation-rental/p1234?chkin=2026-09-01#reviews").unwrap();
        assert_eq!(cleaned, "https://www.vrbo.com/vacation-rental/p1234");
        assert_eq!(listing_id_from_url(&cleaned), "p1234");
    }

    #[test]
    fn extract_cards_reads_links_and_ids() {
        let html = card_html(&["1001", "1002"]);
        let cards = extract_cards(&html, "Bogota");
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].id, "p1001");
        assert_eq!(cards[0].url, "https://www.vrbo.com/vacation-rental/p1001");
        assert!(cards[0].full_url.contains("chkin=2026-09-01"));
        assert_eq!(cards[0].region, "Bogota");
    }

    #[test]
    fn single_page_discovery_never_paginates() {
        let page = MockSession::with_source(&card_html(&["1001", "1002"]));
        let guard = AntiBotGuard::new(StdinSignal);
        let settings = test_settings();
        let engine = DiscoveryEngine::new(&page, &guard, &settings);

        let refs = engine.discover(&test_region()).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(page.clicked.borrow().is_empty());
    }

    #[test]
    fn discovery_dedups_repeated_cards_across_pages() {
        let page = MockSession::default();
        {
            let mut sources = page.sources.borrow_mut();
            // One read for the guard, one per harvest pass.
            sources.push_back(card_html(&["1001", "1002"]));
            sources.push_back(card_html(&["1001", "1002"]));
            sources.push_back(card_html(&["1002", "1003"]));
        }
        page.click_result.set(true);
        let guard = AntiBotGuard::new(StdinSignal);
        let mut settings = test_settings();
        settings.max_pages = 2;
        let engine = DiscoveryEngine::new(&page, &guard, &settings);

        let refs = engine.discover(&test_region()).unwrap();
        let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p1001", "p1002", "p1003"]);
        assert_eq!(page.clicked.borrow().len(), 1);
    }

    #[test]
    fn block_between_pages_suspends_once_and_keeps_ids_unique() {
        struct CountingSignal {
            fired: std::cell::Cell<u32>,
        }

        impl OperatorSignal for CountingSignal {
            fn wait_for_resume(&self) -> Result<()> {
                self.fired.set(self.fired.get() + 1);
                Ok(())
            }
        }

        let page = MockSession::default();
        {
            let mut sources = page.sources.borrow_mut();
            // Entry guard read, page-1 harvest, then the interstitial shows
            // up on page 2: once for the harvest, once for the guard's own
            // re-read, before the real page comes back.
            sources.push_back(card_html(&["1001", "1002"]));
            sources.push_back(card_html(&["1001", "1002"]));
            sources.push_back("<h1>Show us your human side</h1>".to_string());
            sources.push_back("<h1>Show us your human side</h1>".to_string());
            sources.push_back(card_html(&["1002", "1003"]));
        }
        page.click_result.set(true);
        let mut guard = AntiBotGuard::new(CountingSignal {
            fired: std::cell::Cell::new(0),
        });
        guard.settle_delay = Duration::from_millis(0);
        let mut settings = test_settings();
        settings.max_pages = 2;
        let engine = DiscoveryEngine::new(&page, &guard, &settings);

        let refs = engine.discover(&test_region()).unwrap();
        let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p1001", "p1002", "p1003"]);
        assert_eq!(guard.signal.fired.get(), 1);
    }

    #[test]
    fn stale_page_stops_pagination_without_duplicates() {
        let page = MockSession::default();
        {
            let mut sources = page.sources.borrow_mut();
            sources.push_back(card_html(&["1001"]));
            // Harvest passes keep seeing the same cards.
            sources.push_back(card_html(&["1001"]));
        }
        page.click_result.set(true);
        let guard = AntiBotGuard::new(StdinSignal);
        let mut settings = test_settings();
        settings.max_pages = 5;
        let engine = DiscoveryEngine::new(&page, &guard, &settings);

        let refs = engine.discover(&test_region()).unwrap();
        assert_eq!(refs.len(), 1);
        // One advance after page 1; the second pass adds nothing and stops.
        assert_eq!(page.clicked.borrow().len(), 1);
    }

    #[test]
    fn cardless_region_yields_empty_set() {
        let page = MockSession::with_source("<html><body><p>No results</p></body></html>");
        let guard = AntiBotGuard::new(StdinSignal);
        let settings = test_settings();
        let engine = DiscoveryEngine::new(&page, &guard, &settings);

        let refs = engine.discover(&test_region()).unwrap();
        assert!(refs.is_empty());
    }
}
