use lineas_browser::{
    BrowserActions, BrowserEngine, ChromiumBackend, EngineOptions, FingerprintConfig, LookupBackend,
};
use lineas_core::{HarvestConfig, RucKey};
use std::time::Duration;

fn local_options() -> EngineOptions {
    EngineOptions {
        headless: true,
        block_images: true,
        proxy_server: None,
        request_timeout: Duration::from_secs(30),
        fingerprint: FingerprintConfig::randomized(),
    }
}

#[tokio::test]
#[ignore = "Requires Chrome browser - run with --ignored"]
async fn test_browser_engine_launch() {
    let engine = BrowserEngine::launch(local_options()).await;
    assert!(engine.is_ok(), "Failed to launch browser engine");
    engine.unwrap().close().await;
}

#[tokio::test]
#[ignore = "Requires Chrome browser - run with --ignored"]
async fn test_page_actions() {
    let engine = BrowserEngine::launch(local_options()).await.unwrap();
    let page = engine.new_page().await.unwrap();

    page.open_url("https://example.com", Duration::from_secs(30))
        .await
        .expect("navigation failed");
    page.wait_for_element("h1", Duration::from_secs(5))
        .await
        .expect("heading missing");

    let title = page.run_script("document.title").await.unwrap();
    assert!(title.as_str().unwrap_or_default().contains("Example"));

    engine.close().await;
}

#[tokio::test]
#[ignore = "Requires Chrome browser and network access - run with --ignored"]
async fn test_session_counts_transferred_bytes() {
    let backend = ChromiumBackend::new(&HarvestConfig::default()).unwrap();
    let mut session = backend.open_session().await.unwrap();

    let key = RucKey::new("20100047218").unwrap();
    let page = backend.fetch_page(&mut session, &key, 1).await;
    assert!(page.is_ok(), "lookup failed: {:?}", page.err());
    assert!(backend.take_transferred_bytes(&mut session) > 0);
    assert_eq!(backend.take_transferred_bytes(&mut session), 0);

    backend.close_session(session).await;
}
