use crate::error::{BrowserError, Result};
use crate::fingerprint::FingerprintConfig;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::Page;
use futures_util::stream::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Launch options for one browser process.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub headless: bool,
    pub block_images: bool,
    /// `http://host:port`, passed as `--proxy-server`
    pub proxy_server: Option<String>,
    pub request_timeout: Duration,
    pub fingerprint: FingerprintConfig,
}

/// A running chromium process and its CDP event loop.
pub struct BrowserEngine {
    browser: Browser,
    handler: JoinHandle<()>,
    fingerprint: FingerprintConfig,
}

impl BrowserEngine {
    /// Launch a browser with the given options
    pub async fn launch(options: EngineOptions) -> Result<Self> {
        let config = Self::browser_config(&options)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!("CDP handler error: {}", e);
                }
            }
        });

        tracing::debug!(
            user_agent = %options.fingerprint.user_agent,
            proxied = options.proxy_server.is_some(),
            "Browser launched"
        );

        Ok(Self {
            browser,
            handler,
            fingerprint: options.fingerprint,
        })
    }

    fn browser_config(options: &EngineOptions) -> Result<BrowserConfig> {
        let fp = &options.fingerprint;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(options.request_timeout)
            .window_size(fp.viewport_width, fp.viewport_height)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!("--lang={}", primary_language(&fp.accept_language)));

        if !options.headless {
            builder = builder.with_head();
        }
        if options.block_images {
            builder = builder.arg("--blink-settings=imagesEnabled=false");
        }
        if let Some(server) = &options.proxy_server {
            builder = builder.arg(format!("--proxy-server={server}"));
        }

        builder.build().map_err(BrowserError::ChromiumError)
    }

    /// Open a blank page carrying this engine's fingerprint
    pub async fn new_page(&self) -> Result<Page> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;

        page.set_user_agent(user_agent_override(&self.fingerprint))
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))?;

        Ok(page)
    }

    /// Shut the browser process down
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::debug!("Browser close failed: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            tracing::debug!("Browser wait failed: {}", e);
        }
        self.handler.abort();
    }
}

fn primary_language(accept_language: &str) -> &str {
    accept_language
        .split([',', ';'])
        .next()
        .unwrap_or("es-PE")
}

fn user_agent_override(fingerprint: &FingerprintConfig) -> SetUserAgentOverrideParams {
    let mut agent = SetUserAgentOverrideParams::new(fingerprint.user_agent.clone());
    agent.accept_language = Some(fingerprint.accept_language.clone());
    agent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_override_carries_fingerprint() {
        let fingerprint = FingerprintConfig::randomized();
        let agent = user_agent_override(&fingerprint);
        assert_eq!(agent.user_agent, fingerprint.user_agent);
        assert_eq!(agent.accept_language.as_deref(), Some(fingerprint.accept_language.as_str()));
    }

    #[test]
    fn test_primary_language() {
        assert_eq!(primary_language("es-PE,es;q=0.9"), "es-PE");
        assert_eq!(primary_language("es-ES"), "es-ES");
    }
}
