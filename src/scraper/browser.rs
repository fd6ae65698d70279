//! Headless rendering using chromiumoxide.
//!
//! Used when static HTML lacks pagination anchors. The browser instance is
//! launched lazily and shared; page acquisition is serialised through a
//! semaphore so at most three pages are open at once. Shutdown is
//! idempotent and wired to process termination in `main`.

use anyhow::Result;
use chromiumoxide::browser::{Browser as ChromeBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Maximum concurrently open pages.
const MAX_PAGES: usize = 3;

/// Chromium launch attempts before giving up.
const LAUNCH_ATTEMPTS: u32 = 3;

/// Delay before the first launch retry; doubles per attempt.
const LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-navigation timeout.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on scroll-to-load rounds.
pub const MAX_SCROLL_ITERATIONS: u32 = 20;

/// Rotating User-Agent pool.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Rotating viewport pool.
const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1366, 768)];

/// CSS candidates probed for pagination anchors, in order.
pub const PAGINATION_CANDIDATES: &[&str] = &[
    ".pagination a",
    "ul.pager a",
    "nav[aria-label=\"pagination\"] a",
    ".page-numbers a",
    "a[href*=\"page=\"]",
];

/// Detected pagination structure of a results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub total_pages: u32,
    /// The CSS candidate that matched, if any.
    pub next_selector: Option<String>,
}

impl Pagination {
    fn single_page() -> Self {
        Self {
            total_pages: 1,
            next_selector: None,
        }
    }
}

/// Detect total pages from pagination anchors.
///
/// Walks the fixed candidate list; the first selector with matches wins.
/// The page count is the maximum `page=N` of the matched hrefs, or the
/// target of a "Last" link.
pub fn detect_pagination(html: &str) -> Pagination {
    let document = scraper::Html::parse_document(html);
    let page_re = Regex::new(r"[?&]page=(\d+)").unwrap();

    for candidate in PAGINATION_CANDIDATES {
        let Ok(selector) = scraper::Selector::parse(candidate) else {
            continue;
        };

        let mut max_page = 0u32;
        let mut matched = false;
        for anchor in document.select(&selector) {
            matched = true;
            let text = anchor.text().collect::<String>().trim().to_lowercase();
            if let Some(href) = anchor.value().attr("href") {
                if let Some(caps) = page_re.captures(href) {
                    let n: u32 = caps[1].parse().unwrap_or(0);
                    if text == "last" {
                        max_page = max_page.max(n);
                        break;
                    }
                    max_page = max_page.max(n);
                }
            }
        }

        if matched && max_page > 0 {
            return Pagination {
                total_pages: max_page,
                next_selector: Some(candidate.to_string()),
            };
        }
    }

    Pagination::single_page()
}

struct RendererInner {
    browser: ChromeBrowser,
    handler: tokio::task::JoinHandle<()>,
}

/// Shared headless renderer handle.
pub struct Renderer {
    inner: Mutex<Option<RendererInner>>,
    pages: Arc<Semaphore>,
    ua_cursor: AtomicUsize,
    viewport_cursor: AtomicUsize,
    closed: AtomicBool,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            pages: Arc::new(Semaphore::new(MAX_PAGES)),
            ua_cursor: AtomicUsize::new(0),
            viewport_cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn next_user_agent(&self) -> &'static str {
        let idx = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[idx % USER_AGENTS.len()]
    }

    fn next_viewport(&self) -> (u32, u32) {
        let idx = self.viewport_cursor.fetch_add(1, Ordering::Relaxed);
        VIEWPORTS[idx % VIEWPORTS.len()]
    }

    async fn launch(&self) -> Result<RendererInner> {
        let (width, height) = self.next_viewport();
        let user_agent = self.next_user_agent();

        let config = BrowserConfig::builder()
            .no_sandbox()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--mute-audio")
            .arg(format!("--user-agent={}", user_agent))
            .window_size(width, height)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = ChromeBrowser::launch(config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to launch browser: {}", e))?;

        // The handler stream must keep running for the browser to work
        let handle = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => continue,
                    None => break,
                }
            }
        });

        sleep(Duration::from_secs(1)).await;

        Ok(RendererInner {
            browser,
            handler: handle,
        })
    }

    /// Launch chromium, retrying transient failures with doubling delays.
    /// The final attempt's error is the one reported.
    async fn launch_with_retry(&self) -> Result<RendererInner> {
        let mut delay = LAUNCH_RETRY_DELAY;
        for attempt in 1..LAUNCH_ATTEMPTS {
            match self.launch().await {
                Ok(inner) => {
                    if attempt > 1 {
                        debug!("browser launch succeeded on attempt {}", attempt);
                    }
                    return Ok(inner);
                }
                Err(e) => {
                    warn!(
                        "browser launch failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt, LAUNCH_ATTEMPTS, e, delay
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        self.launch().await
    }

    /// Acquire a page on the given URL. Waits for one of the three page
    /// slots; the slot is released when the returned page is dropped.
    pub async fn acquire_page(&self, url: &str) -> Result<RenderedPage> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("renderer is shut down");
        }

        let permit = self
            .pages
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("renderer is shut down"))?;

        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            let inner = self.launch_with_retry().await?;
            *guard = Some(inner);
        }
        let inner = guard.as_ref().expect("renderer launched above");

        let page = inner
            .browser
            .new_page(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open page: {}", e))?;
        drop(guard);

        let rendered = RenderedPage {
            page,
            _permit: permit,
        };
        rendered.wait_for_dom_ready().await;
        Ok(rendered)
    }

    /// Tear down the browser. Safe to call repeatedly; later calls no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.inner.lock().await;
        if let Some(mut inner) = guard.take() {
            let _ = inner.browser.close().await;
            inner.handler.abort();
            debug!("headless renderer shut down");
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// One acquired page, holding its concurrency slot.
pub struct RenderedPage {
    page: Page,
    _permit: OwnedSemaphorePermit,
}

impl RenderedPage {
    /// Poll document.readyState until the DOM is usable.
    async fn wait_for_dom_ready(&self) {
        let script = r#"
            (function() {
                return document.readyState === 'complete' || document.readyState === 'interactive';
            })()
        "#;

        let poll_interval = Duration::from_millis(100);
        for i in 0..50 {
            match self.page.evaluate(script).await {
                Ok(result) => {
                    if result.value().and_then(|v| v.as_bool()).unwrap_or(false) {
                        debug!("DOM ready after {} polls", i + 1);
                        sleep(Duration::from_millis(500)).await;
                        return;
                    }
                }
                Err(e) => {
                    debug!("readyState check failed (attempt {}): {}", i + 1, e);
                }
            }
            sleep(poll_interval).await;
        }
        warn!("DOM readyState polling exhausted, continuing with partial content");
    }

    /// Wait until a selector appears, bounded by the navigation timeout.
    pub async fn wait_for_selector(&self, selector: &str) -> Result<()> {
        let script = format!(
            "document.querySelector({}) !== null",
            serde_json::to_string(selector)?
        );

        let wait = async {
            loop {
                if let Ok(result) = self.page.evaluate(script.as_str()).await {
                    if result.value().and_then(|v| v.as_bool()).unwrap_or(false) {
                        return;
                    }
                }
                sleep(Duration::from_millis(200)).await;
            }
        };

        timeout(NAVIGATION_TIMEOUT, wait)
            .await
            .map_err(|_| anyhow::anyhow!("selector {} did not appear", selector))?;
        Ok(())
    }

    /// Detect pagination on the rendered document.
    pub async fn pagination(&self) -> Result<Pagination> {
        let html = self.content().await?;
        Ok(detect_pagination(&html))
    }

    /// Scroll to the bottom repeatedly until the page height settles or the
    /// iteration bound is hit. Returns the number of rounds run.
    pub async fn scroll_to_load(&self) -> Result<u32> {
        let mut last_height: i64 = 0;
        for iteration in 0..MAX_SCROLL_ITERATIONS {
            let height = self
                .page
                .evaluate("document.body.scrollHeight")
                .await
                .ok()
                .and_then(|r| r.value().and_then(|v| v.as_i64()))
                .unwrap_or(0);

            if iteration > 0 && height == last_height {
                return Ok(iteration);
            }
            last_height = height;

            self.page
                .evaluate("window.scrollTo(0, document.body.scrollHeight)")
                .await
                .map_err(|e| anyhow::anyhow!("scroll failed: {}", e))?;
            sleep(Duration::from_millis(400)).await;
        }
        Ok(MAX_SCROLL_ITERATIONS)
    }

    /// Block heavyweight resources to cut navigation latency.
    pub async fn block_resources(&self) -> Result<()> {
        let patterns = vec![
            "*.png".to_string(),
            "*.jpg".to_string(),
            "*.jpeg".to_string(),
            "*.gif".to_string(),
            "*.svg".to_string(),
            "*.css".to_string(),
            "*.woff".to_string(),
            "*.woff2".to_string(),
            "*.mp4".to_string(),
        ];
        self.page
            .execute(SetBlockedUrLsParams::new(patterns))
            .await
            .map_err(|e| anyhow::anyhow!("resource blocking failed: {}", e))?;
        Ok(())
    }

    /// Current serialised document.
    pub async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get page content: {}", e))
    }

    /// Close the page, freeing its slot.
    pub async fn release(self) {
        let _ = self.page.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_pagination_page_links() {
        let html = r#"
            <div class="pagination">
                <a href="?page=1">1</a>
                <a href="?page=2">2</a>
                <a href="?page=7">7</a>
            </div>
        "#;
        let p = detect_pagination(html);
        assert_eq!(p.total_pages, 7);
        assert_eq!(p.next_selector.as_deref(), Some(".pagination a"));
    }

    #[test]
    fn test_detect_pagination_last_link() {
        let html = r#"
            <ul class="pager">
                <a href="/results?page=2">Next</a>
                <a href="/results?page=42">Last</a>
            </ul>
        "#;
        let p = detect_pagination(html);
        assert_eq!(p.total_pages, 42);
    }

    #[test]
    fn test_detect_pagination_absent() {
        let p = detect_pagination("<table><tr><td>1</td></tr></table>");
        assert_eq!(p, Pagination::single_page());
    }

    #[test]
    fn test_pools_rotate() {
        let renderer = Renderer::new();
        let a = renderer.next_user_agent();
        let b = renderer.next_user_agent();
        assert_ne!(a, b);

        let v1 = renderer.next_viewport();
        let v2 = renderer.next_viewport();
        assert_ne!(v1, v2);
    }
}
