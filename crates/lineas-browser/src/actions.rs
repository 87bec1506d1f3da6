use crate::error::{BrowserError, Result};
use chromiumoxide::Page;
use std::time::{Duration, Instant};

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Browser actions for automation
#[async_trait::async_trait]
pub trait BrowserActions {
    /// Navigate to a URL and wait for the load to finish
    async fn open_url(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Set a form field's value and fire `input`/`change`
    async fn fill_field(&self, selector: &str, value: &str) -> Result<()>;

    /// Click an element by selector
    async fn click_element(&self, selector: &str) -> Result<()>;

    /// Wait for a selector to appear
    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Evaluate a script and return its JSON result
    async fn run_script(&self, script: &str) -> Result<serde_json::Value>;

    /// Full rendered HTML of the page
    async fn html(&self) -> Result<String>;
}

#[async_trait::async_trait]
impl BrowserActions for Page {
    async fn open_url(&self, url: &str, timeout: Duration) -> Result<()> {
        let load = async {
            self.goto(url)
                .await
                .map_err(|e| BrowserError::NavigationError(e.to_string()))?
                .wait_for_navigation()
                .await
                .map_err(|e| BrowserError::NavigationError(e.to_string()))?;
            Ok(())
        };

        tokio::time::timeout(timeout, load)
            .await
            .map_err(|_| BrowserError::Timeout(format!("loading {url}")))?
    }

    async fn fill_field(&self, selector: &str, value: &str) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             el.value = {val}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true; }})()",
            sel = js_string(selector),
            val = js_string(value),
        );
        expect_found(self.run_script(&script).await?, selector)
    }

    async fn click_element(&self, selector: &str) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             el.click(); return true; }})()",
            sel = js_string(selector),
        );
        expect_found(self.run_script(&script).await?, selector)
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(BrowserError::SelectorNotFound(selector.to_string()));
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    async fn run_script(&self, script: &str) -> Result<serde_json::Value> {
        self.evaluate(script)
            .await
            .map_err(|e| BrowserError::ScriptError(e.to_string()))?
            .into_value::<serde_json::Value>()
            .map_err(|e| BrowserError::ScriptError(e.to_string()))
    }

    async fn html(&self) -> Result<String> {
        self.content()
            .await
            .map_err(|e| BrowserError::ChromiumError(e.to_string()))
    }
}

/// Quote a value as a JavaScript string literal.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn expect_found(value: serde_json::Value, selector: &str) -> Result<()> {
    if value.as_bool() == Some(true) {
        Ok(())
    } else {
        Err(BrowserError::SelectorNotFound(selector.to_string()))
    }
}

/// Host part of a URL, used to validate configured endpoints
pub fn extract_domain(url: &str) -> Result<String> {
    let url = url::Url::parse(url)
        .map_err(|e| BrowserError::NavigationError(format!("Invalid URL: {e}")))?;

    url.host_str()
        .ok_or_else(|| BrowserError::NavigationError("No host in URL".to_string()))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://checatuslineas.osiptel.gob.pe/").unwrap(),
            "checatuslineas.osiptel.gob.pe"
        );
        assert_eq!(
            extract_domain("http://proxy.example.net:3120/path").unwrap(),
            "proxy.example.net"
        );
    }

    #[test]
    fn test_extract_domain_invalid() {
        assert!(extract_domain("not-a-url").is_err());
    }

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string("#GridConsulta"), "\"#GridConsulta\"");
        assert_eq!(js_string("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn test_expect_found() {
        assert!(expect_found(serde_json::Value::Bool(true), "#btnBuscar").is_ok());
        let err = expect_found(serde_json::Value::Bool(false), "#btnBuscar").unwrap_err();
        assert!(matches!(err, BrowserError::SelectorNotFound(s) if s == "#btnBuscar"));
    }
}
