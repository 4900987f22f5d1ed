use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Settings, SITE_BASE};

/// Capability surface the pipeline uses to talk to a live page. Discovery
/// and detail extraction depend only on this trait, never on the browser
/// API directly.
pub trait PageSession {
    fn navigate(&self, url: &str) -> Result<()>;

    /// Full HTML of the current document.
    fn page_source(&self) -> Result<String>;

    /// Run a JS expression in the page and return its JSON value, if any.
    fn evaluate(&self, expression: &str) -> Result<Option<Value>>;

    fn scroll_to(&self, y: i64) -> Result<()>;

    fn scroll_height(&self) -> Result<i64>;

    /// Click the first visible, enabled element matching any selector, in
    /// order. Returns false when nothing clickable matched.
    fn click_first(&self, selectors: &[&str]) -> Result<bool>;

    /// Click the first visible button whose text contains any of the
    /// keywords, case-insensitively. Returns false when no button matched.
    fn click_button_with_text(&self, keywords: &[&str]) -> Result<bool>;

    fn element_exists(&self, selector: &str) -> Result<bool>;

    /// Content attribute of `meta[itemprop=<name>]`, if present.
    fn read_meta_itemprop(&self, name: &str) -> Result<Option<String>>;

    /// Poll until any selector matches or the timeout elapses.
    fn wait_for_any(&self, selectors: &[&str], timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            for selector in selectors {
                if self.element_exists(selector)? {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(500));
        }
    }
}

/// The single real `PageSession`: one tab in one headless Chrome, owned for
/// the whole run. Dropping it closes the browser.
pub struct ChromeSession {
    #[allow(dead_code)]
    browser: Browser,
    tab: std::sync::Arc<headless_chrome::Tab>,
}

impl ChromeSession {
    /// Launch Chrome with the configured profile, viewport and user agent,
    /// then inject any configured cookies. A saved profile that Chrome
    /// refuses (version mismatch, corrupt state) gets wiped and replaced
    /// with a throwaway one before giving up.
    pub fn launch(settings: &Settings) -> Result<Self> {
        let session = match Self::launch_with_profile(settings, settings.fresh_profile) {
            Ok(session) => session,
            Err(err) if !settings.fresh_profile => {
                warn!(error = %err, "Chrome rejected the saved profile; retrying with a throwaway one");
                if let Err(err) = std::fs::remove_dir_all(&settings.profile_dir) {
                    warn!(error = %err, "Could not wipe the saved profile");
                }
                Self::launch_with_profile(settings, true)?
            }
            Err(err) => return Err(err),
        };
        if !settings.cookie_string.is_empty() {
            session.apply_cookie_string(&settings.cookie_string)?;
        }
        Ok(session)
    }

    fn launch_with_profile(settings: &Settings, fresh_profile: bool) -> Result<Self> {
        let profile_dir = resolve_profile_dir(settings, fresh_profile)?;
        cleanup_profile_singletons(&profile_dir);

        let ua_arg = format!("--user-agent={}", settings.user_agent);
        let args = vec![
            std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
            std::ffi::OsStr::new("--disable-gpu"),
            std::ffi::OsStr::new(ua_arg.as_str()),
        ];

        info!(
            headless = settings.headless,
            profile = %profile_dir.display(),
            "Launching Chrome"
        );
        let options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .sandbox(false)
            .window_size(Some(settings.viewport))
            .user_data_dir(Some(profile_dir))
            .args(args)
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;
        let tab = browser.new_tab().context("Failed to open tab")?;
        Ok(Self { browser, tab })
    }

    /// Inject a `k=v; k2=v2` header-style cookie string against the site
    /// origin. The page must be on the site's domain for the cookies to
    /// stick, so this navigates to the base URL first.
    fn apply_cookie_string(&self, cookie_string: &str) -> Result<()> {
        let pairs: Vec<&str> = cookie_string
            .split(';')
            .map(str::trim)
            .filter(|pair| pair.contains('='))
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }
        info!(total = pairs.len(), "Injecting configured cookies");
        self.navigate(SITE_BASE)?;
        for pair in pairs {
            let js_value = serde_json::to_string(&format!("{}; path=/", pair))?;
            if let Err(err) = self.evaluate(&format!("document.cookie = {js_value}")) {
                warn!(error = %err, "Cookie injection failed for one entry");
            }
        }
        // Reload so the site sees the injected session.
        self.navigate(SITE_BASE)?;
        Ok(())
    }
}

impl PageSession for ChromeSession {
    fn navigate(&self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.tab.navigate_to(url).context("Navigation failed")?;
        self.tab
            .wait_until_navigated()
            .context("Page never finished loading")?;
        Ok(())
    }

    fn page_source(&self) -> Result<String> {
        let result = self
            .tab
            .evaluate("document.documentElement.outerHTML", false)
            .context("Failed to read page source")?;
        Ok(result
            .value
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn evaluate(&self, expression: &str) -> Result<Option<Value>> {
        let result = self
            .tab
            .evaluate(expression, false)
            .context("Script evaluation failed")?;
        Ok(result.value)
    }

    fn scroll_to(&self, y: i64) -> Result<()> {
        self.evaluate(&format!("window.scrollTo(0, {y});"))?;
        Ok(())
    }

    fn scroll_height(&self) -> Result<i64> {
        let value = self.evaluate("document.body.scrollHeight")?;
        Ok(value.as_ref().and_then(Value::as_i64).unwrap_or(0))
    }

    fn click_first(&self, selectors: &[&str]) -> Result<bool> {
        let selector_list = serde_json::to_string(selectors)?;
        let script = format!(
            r#"(function() {{
                const selectors = {selector_list};
                for (const sel of selectors) {{
                    for (const el of document.querySelectorAll(sel)) {{
                        if (el.offsetParent === null) continue;
                        if (el.disabled) continue;
                        const aria = (el.getAttribute('aria-disabled') || '').toLowerCase();
                        if (aria === 'true') continue;
                        const cls = el.getAttribute('class') || '';
                        if (cls.includes('is-disabled') || cls.includes('uitk-button-disabled')) continue;
                        el.scrollIntoView({{behavior: 'instant', block: 'center'}});
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#
        );
        let value = self.evaluate(&script)?;
        Ok(value.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    fn click_button_with_text(&self, keywords: &[&str]) -> Result<bool> {
        let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        let keyword_list = serde_json::to_string(&lowered)?;
        let script = format!(
            r#"(function() {{
                const keywords = {keyword_list};
                for (const btn of document.querySelectorAll('button')) {{
                    const text = (btn.textContent || '').toLowerCase();
                    if (!keywords.some(k => text.includes(k))) continue;
                    if (btn.offsetParent === null) continue;
                    btn.scrollIntoView({{behavior: 'instant', block: 'center'}});
                    btn.click();
                    return true;
                }}
                return false;
            }})()"#
        );
        let value = self.evaluate(&script)?;
        Ok(value.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    fn element_exists(&self, selector: &str) -> Result<bool> {
        let js_selector = serde_json::to_string(selector)?;
        let value = self.evaluate(&format!("!!document.querySelector({js_selector})"))?;
        Ok(value.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    fn read_meta_itemprop(&self, name: &str) -> Result<Option<String>> {
        let script = format!(
            r#"(function() {{
                const el = document.querySelector('meta[itemprop="{name}"]');
                return el ? el.content : null;
            }})()"#
        );
        let value = self.evaluate(&script)?;
        Ok(value.as_ref().and_then(Value::as_str).map(str::to_string))
    }
}

/// Pick the profile directory: the persistent one from settings, or a
/// throwaway directory under the system temp dir when fresh-profile is set.
fn resolve_profile_dir(settings: &Settings, fresh_profile: bool) -> Result<PathBuf> {
    if fresh_profile {
        let dir = std::env::temp_dir().join(format!("rental_scout_profile_{}", std::process::id()));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create temp profile dir {}", dir.display()))?;
        info!(path = %dir.display(), "Using throwaway Chrome profile");
        return Ok(dir);
    }
    std::fs::create_dir_all(&settings.profile_dir).with_context(|| {
        format!("Failed to create profile dir {}", settings.profile_dir.display())
    })?;
    Ok(settings.profile_dir.clone())
}

/// A crashed Chrome can leave Singleton* lock files that keep the next
/// launch from reusing the profile.
fn cleanup_profile_singletons(profile_dir: &std::path::Path) {
    for name in ["SingletonLock", "SingletonCookie", "SingletonSocket"] {
        let target = profile_dir.join(name);
        if target.exists() {
            match std::fs::remove_file(&target) {
                Ok(()) => debug!(file = %target.display(), "Removed stale profile lock"),
                Err(err) => warn!(file = %target.display(), error = %err, "Could not remove profile lock"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};

    /// Scripted `PageSession` for pipeline tests. `page_source` and
    /// `scroll_height` pop queued values, holding the last one once the
    /// queue is down to a single entry. Navigation to any URL containing a
    /// `failing_urls` fragment errors after recording the visit.
    #[derive(Default)]
    pub struct MockSession {
        pub sources: RefCell<VecDeque<String>>,
        pub heights: RefCell<VecDeque<i64>>,
        pub visited: RefCell<Vec<String>>,
        pub clicked: RefCell<Vec<String>>,
        pub click_result: Cell<bool>,
        pub element_present: Cell<bool>,
        pub meta: RefCell<HashMap<String, String>>,
        pub failing_urls: RefCell<Vec<String>>,
    }

    impl MockSession {
        pub fn with_source(html: &str) -> Self {
            let session = Self::default();
            session.sources.borrow_mut().push_back(html.to_string());
            session
        }

        fn pop_or_last<T: Clone>(queue: &RefCell<VecDeque<T>>, fallback: T) -> T {
            let mut queue = queue.borrow_mut();
            match queue.len() {
                0 => fallback,
                1 => queue.front().cloned().unwrap_or(fallback),
                _ => queue.pop_front().unwrap_or(fallback),
            }
        }
    }

    impl PageSession for MockSession {
        fn navigate(&self, url: &str) -> Result<()> {
            self.visited.borrow_mut().push(url.to_string());
            if self
                .failing_urls
                .borrow()
                .iter()
                .any(|fragment| url.contains(fragment.as_str()))
            {
                anyhow::bail!("navigation failed: {url}");
            }
            Ok(())
        }

        fn page_source(&self) -> Result<String> {
            Ok(Self::pop_or_last(&self.sources, String::new()))
        }

        fn evaluate(&self, _expression: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        fn scroll_to(&self, _y: i64) -> Result<()> {
            Ok(())
        }

        fn scroll_height(&self) -> Result<i64> {
            Ok(Self::pop_or_last(&self.heights, 1000))
        }

        fn click_first(&self, selectors: &[&str]) -> Result<bool> {
            self.clicked.borrow_mut().push(selectors.join(","));
            Ok(self.click_result.get())
        }

        fn click_button_with_text(&self, keywords: &[&str]) -> Result<bool> {
            self.clicked.borrow_mut().push(keywords.join("+"));
            Ok(self.click_result.get())
        }

        fn element_exists(&self, _selector: &str) -> Result<bool> {
            Ok(self.element_present.get())
        }

        fn read_meta_itemprop(&self, name: &str) -> Result<Option<String>> {
            Ok(self.meta.borrow().get(name).cloned())
        }

        // No polling delay in tests.
        fn wait_for_any(&self, _selectors: &[&str], _timeout: Duration) -> Result<bool> {
            Ok(self.element_present.get())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::search::tests::test_settings;

    #[test]
    fn fresh_profile_resolves_to_a_throwaway_dir() {
        let settings = test_settings();
        let throwaway = resolve_profile_dir(&settings, true).unwrap();
        assert_ne!(throwaway, settings.profile_dir);
        assert!(throwaway.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn persistent_profile_resolves_to_configured_dir() {
        let settings = test_settings();
        let dir = resolve_profile_dir(&settings, false).unwrap();
        assert_eq!(dir, settings.profile_dir);
    }
}
