//! Chromium implementation of [`LookupBackend`].
//!
//! One session is one chromium process behind one proxy identity. Transferred
//! bytes are measured from CDP `Network.loadingFinished` events, which report
//! the encoded (on-the-wire) size of every response.

use crate::actions::{extract_domain, BrowserActions};
use crate::backend::{FetchedPage, LookupBackend};
use crate::engine::{BrowserEngine, EngineOptions};
use crate::error::{BrowserError, FetchError};
use crate::extract::{parse_results_table, TablePage};
use crate::fingerprint::FingerprintConfig;
use crate::proxy::ProxySessions;
use chromiumoxide::auth::Credentials;
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventLoadingFinished};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures_util::stream::StreamExt;
use lineas_core::{BrowserConfig, FailureKind, HarvestConfig, LookupConfig, RucKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const DOCUMENT_TYPE_SELECTOR: &str = "#IdTipoDoc";
const DOCUMENT_NUMBER_SELECTOR: &str = "#NumeroDocumento";
const SEARCH_BUTTON_SELECTOR: &str = "#btnBuscar";
const NEXT_PAGE_SELECTOR: &str = "#GridConsulta_next";
/// Value of the document type option for RUC.
const DOCUMENT_TYPE_RUC: &str = "2";

const ROW_COUNT_SCRIPT: &str = "(() => { const t = document.querySelector('#GridConsulta'); \
     return t ? t.querySelectorAll('tbody tr').length : -1; })()";

const PAGE_SIZE_SCRIPT: &str = "(() => { const s = document.querySelector('select[name=\"GridConsulta_length\"]'); \
     if (!s || s.value === '100') return false; \
     s.value = '100'; s.dispatchEvent(new Event('change', { bubbles: true })); return true; })()";

const BLOCK_MARKERS: [&str; 3] = ["Access Denied", "Too Many Requests", "Request blocked"];

/// Browser session state owned by a single worker.
pub struct ChromiumSession {
    engine: BrowserEngine,
    page: Page,
    proxy_session: Option<String>,
    transferred: Arc<AtomicU64>,
    meter: JoinHandle<()>,
}

impl ChromiumSession {
    /// Proxy session id, if the session is proxied.
    #[must_use]
    pub fn proxy_session(&self) -> Option<&str> {
        self.proxy_session.as_deref()
    }
}

/// Lookup backend driving the registry's web form through chromium.
pub struct ChromiumBackend {
    browser: BrowserConfig,
    lookup: LookupConfig,
    proxies: ProxySessions,
    probe_timeout: Duration,
}

impl ChromiumBackend {
    /// Build a backend from the harvest configuration.
    pub fn new(config: &HarvestConfig) -> Result<Self, BrowserError> {
        let host = extract_domain(&config.lookup.url)?;
        tracing::debug!("Lookup host: {}", host);

        let proxies = ProxySessions::new(config.proxy.clone());
        if !proxies.is_enabled() {
            tracing::warn!("Proxy credentials missing, browsing without proxy");
        }

        Ok(Self {
            browser: config.browser.clone(),
            lookup: config.lookup.clone(),
            proxies,
            probe_timeout: Duration::from_secs(config.pacing.probe_timeout_secs),
        })
    }

    async fn submit_lookup(&self, page: &Page, key: &RucKey) -> Result<TablePage, BrowserError> {
        let timeout = self.browser.navigation_timeout();

        page.open_url(&self.lookup.url, timeout).await?;
        page.wait_for_element(DOCUMENT_NUMBER_SELECTOR, timeout).await?;

        page.fill_field(DOCUMENT_TYPE_SELECTOR, DOCUMENT_TYPE_RUC).await?;
        page.fill_field(DOCUMENT_NUMBER_SELECTOR, key.as_str()).await?;
        page.click_element(SEARCH_BUTTON_SELECTOR).await?;

        self.wait_for_stable_table(page).await?;

        if page.run_script(PAGE_SIZE_SCRIPT).await?.as_bool() == Some(true) {
            tracing::trace!(ruc = %key, "Page size forced to 100");
            self.wait_for_stable_table(page).await?;
        }

        self.extract(page).await
    }

    async fn next_results_page(&self, page: &Page) -> Result<TablePage, BrowserError> {
        page.click_element(NEXT_PAGE_SELECTOR).await?;
        self.wait_for_stable_table(page).await?;
        self.extract(page).await
    }

    /// Poll the table's row count until it stops changing.
    async fn wait_for_stable_table(&self, page: &Page) -> Result<usize, BrowserError> {
        let deadline = Instant::now() + self.browser.result_timeout();
        let needed = self.browser.stable_polls.max(1);
        let mut last: Option<i64> = None;
        let mut equal = 0u32;

        loop {
            let count = page.run_script(ROW_COUNT_SCRIPT).await?.as_i64().unwrap_or(-1);

            if count >= 0 {
                if last == Some(count) {
                    equal += 1;
                } else {
                    equal = 1;
                    last = Some(count);
                }
                if equal >= needed {
                    return Ok(usize::try_from(count).unwrap_or_default());
                }
            }

            if Instant::now() >= deadline {
                return match last {
                    Some(count) => Ok(usize::try_from(count).unwrap_or_default()),
                    None => Err(BrowserError::Timeout(
                        "result table never appeared".to_string(),
                    )),
                };
            }
            tokio::time::sleep(self.browser.poll_interval()).await;
        }
    }

    /// Parse the current page, re-reading while rows are still rendering.
    async fn extract(&self, page: &Page) -> Result<TablePage, BrowserError> {
        let mut rechecks = self.browser.empty_result_rechecks;

        loop {
            let html = page.html().await?;
            if let Some(marker) = BLOCK_MARKERS.iter().find(|m| html.contains(**m)) {
                return Err(BrowserError::NavigationError(format!(
                    "rate limited: page shows '{marker}'"
                )));
            }

            let table = parse_results_table(&html);
            if !table.table_present {
                return Err(BrowserError::SelectorNotFound("#GridConsulta".to_string()));
            }
            if !table.looks_incomplete() || rechecks == 0 {
                return Ok(table);
            }

            rechecks -= 1;
            tracing::debug!(
                visible = table.visible_rows,
                remaining = rechecks,
                "Rows visible but none parsed, re-checking"
            );
            tokio::time::sleep(self.browser.poll_interval()).await;
        }
    }

    fn spawn_meter(
        mut events: EventStream<EventLoadingFinished>,
        transferred: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                transferred.fetch_add(encoded_bytes(event.encoded_data_length), Ordering::Relaxed);
            }
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encoded_bytes(length: f64) -> u64 {
    if length.is_finite() && length > 0.0 {
        length.round() as u64
    } else {
        0
    }
}

#[async_trait::async_trait]
impl LookupBackend for ChromiumBackend {
    type Session = ChromiumSession;

    async fn open_session(&self) -> Result<Self::Session, FetchError> {
        let proxy = self.proxies.is_enabled().then(|| self.proxies.next_session());

        let engine = BrowserEngine::launch(EngineOptions {
            headless: self.browser.headless,
            block_images: self.browser.block_images,
            proxy_server: proxy.as_ref().map(|_| self.proxies.server()),
            request_timeout: self.browser.navigation_timeout(),
            fingerprint: FingerprintConfig::randomized(),
        })
        .await
        .map_err(|e| FetchError::Session(e.to_string()))?;

        let page = match engine.new_page().await {
            Ok(page) => page,
            Err(e) => {
                engine.close().await;
                return Err(FetchError::Session(e.to_string()));
            }
        };

        if let Some(proxy) = &proxy {
            let credentials = Credentials {
                username: proxy.username.clone(),
                password: proxy.password.clone(),
            };
            if let Err(e) = page.authenticate(credentials).await {
                engine.close().await;
                return Err(FetchError::transient(
                    FailureKind::ProxyError,
                    format!("proxy authentication setup failed: {e}"),
                ));
            }
        }

        let transferred = Arc::new(AtomicU64::new(0));
        let events = match page.event_listener::<EventLoadingFinished>().await {
            Ok(events) => events,
            Err(e) => {
                engine.close().await;
                return Err(FetchError::Session(e.to_string()));
            }
        };
        if let Err(e) = page.execute(EnableParams::default()).await {
            tracing::debug!("Network domain enable failed: {}", e);
        }
        let meter = Self::spawn_meter(events, Arc::clone(&transferred));

        let proxy_session = proxy.map(|p| p.session_id);
        tracing::debug!(proxy_session = ?proxy_session, "Session opened");

        Ok(ChromiumSession {
            engine,
            page,
            proxy_session,
            transferred,
            meter,
        })
    }

    async fn fetch_page(
        &self,
        session: &mut Self::Session,
        key: &RucKey,
        page: u32,
    ) -> Result<FetchedPage, FetchError> {
        let table = if page <= 1 {
            self.submit_lookup(&session.page, key).await?
        } else {
            self.next_results_page(&session.page).await?
        };

        tracing::trace!(
            ruc = %key,
            page,
            lines = table.lines.len(),
            has_more = table.has_more,
            "Page extracted"
        );

        Ok(FetchedPage {
            lines: table.lines,
            has_more: table.has_more,
        })
    }

    fn take_transferred_bytes(&self, session: &mut Self::Session) -> u64 {
        session.transferred.swap(0, Ordering::Relaxed)
    }

    async fn close_session(&self, session: Self::Session) {
        let ChromiumSession {
            engine,
            page,
            proxy_session,
            meter,
            ..
        } = session;

        meter.abort();
        if let Err(e) = page.close().await {
            tracing::trace!("Page close failed: {}", e);
        }
        engine.close().await;
        tracing::debug!(proxy_session = ?proxy_session, "Session closed");
    }

    async fn probe_latency(&self) -> Result<Duration, FetchError> {
        let mut builder = reqwest::Client::builder().timeout(self.probe_timeout);

        if self.proxies.is_enabled() {
            let session = self.proxies.next_session();
            let proxy = reqwest::Proxy::all(self.proxies.server())
                .map_err(|e| FetchError::transient(FailureKind::ProxyError, e.to_string()))?
                .basic_auth(&session.username, &session.password);
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::transient(FailureKind::ProxyError, e.to_string()))?;

        let mut best: Option<Duration> = None;
        let mut last_error = None;

        for url in &self.lookup.probe_urls {
            let started = Instant::now();
            match client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    let elapsed = started.elapsed();
                    tracing::debug!("Probe {} took {:?}", url, elapsed);
                    best = Some(best.map_or(elapsed, |b| b.min(elapsed)));
                }
                Ok(response) => {
                    last_error = Some(format!("{url}: HTTP {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(format!("{url}: {e}"));
                }
            }
        }

        best.ok_or_else(|| {
            FetchError::transient(
                FailureKind::ProxyError,
                last_error.unwrap_or_else(|| "no probe URLs configured".to_string()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_bytes() {
        assert_eq!(encoded_bytes(1536.4), 1536);
        assert_eq!(encoded_bytes(0.0), 0);
        assert_eq!(encoded_bytes(-3.0), 0);
        assert_eq!(encoded_bytes(f64::NAN), 0);
    }

    #[test]
    fn test_backend_rejects_bad_lookup_url() {
        let mut config = HarvestConfig::default();
        config.lookup.url = "not a url".to_string();
        assert!(ChromiumBackend::new(&config).is_err());
    }

    #[test]
    fn test_backend_from_defaults() {
        let backend = ChromiumBackend::new(&HarvestConfig::default()).unwrap();
        assert!(!backend.proxies.is_enabled());
        assert_eq!(backend.probe_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_probe_without_urls_fails() {
        let mut config = HarvestConfig::default();
        config.lookup.probe_urls.clear();
        let backend = ChromiumBackend::new(&config).unwrap();

        let err = backend.probe_latency().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProxyError);
    }
}
