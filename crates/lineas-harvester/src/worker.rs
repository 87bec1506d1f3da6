//! Long-lived scrape worker.
//!
//! A worker owns at most one backend session, takes keys one at a time from
//! its assignment channel and reports every outcome back to the orchestrator.
//! It never touches the backlog itself.

use crate::governor::BandwidthGovernor;
use crate::profiler::ResourceProfile;
use lineas_browser::{FetchError, LookupBackend};
use lineas_core::{ExtractedLine, RucKey, WorkRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How one assignment ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// All pages fetched; zero lines is a valid result
    Succeeded(Vec<ExtractedLine>),
    /// The attempt failed
    Failed(FetchError),
    /// The governor refused a fetch; the key was not attempted to completion
    BandwidthRefused,
    /// Cancelled before finishing
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub key: RucKey,
    pub outcome: Outcome,
    pub bytes_used: u64,
}

pub struct Worker<B: LookupBackend> {
    id: usize,
    backend: Arc<B>,
    governor: Arc<BandwidthGovernor>,
    profile: Arc<ResourceProfile>,
    start_delay: Duration,
    cancel: CancellationToken,
    session: Option<B::Session>,
    pages_on_session: u32,
}

impl<B: LookupBackend> Worker<B> {
    #[must_use]
    pub fn new(
        id: usize,
        backend: Arc<B>,
        governor: Arc<BandwidthGovernor>,
        profile: Arc<ResourceProfile>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            backend,
            governor,
            profile,
            start_delay: Duration::ZERO,
            cancel,
            session: None,
            pages_on_session: 0,
        }
    }

    /// Wait this long before taking the first key.
    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Process assignments until the channel closes or the worker is cancelled.
    pub async fn run(
        mut self,
        mut assignments: mpsc::Receiver<WorkRecord>,
        reports: mpsc::Sender<WorkerReport>,
    ) {
        if !self.start_delay.is_zero() {
            tracing::debug!(worker = self.id, delay = ?self.start_delay, "Staggered start");
            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep(self.start_delay) => {}
            }
        }

        loop {
            let record = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                record = assignments.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let report = self.process(record.key).await;
            if reports.send(report).await.is_err() {
                break;
            }
        }

        self.close_session().await;
        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&mut self, key: RucKey) -> WorkerReport {
        let mut bytes_used = 0;
        let outcome = self.attempt(&key, &mut bytes_used).await;

        match &outcome {
            Outcome::Succeeded(lines) => {
                tracing::info!(worker = self.id, ruc = %key, lines = lines.len(), "Key succeeded");
            }
            Outcome::Failed(e) => {
                tracing::warn!(worker = self.id, ruc = %key, kind = %e.kind(), "Attempt failed: {}", e);
            }
            Outcome::BandwidthRefused => {
                tracing::warn!(worker = self.id, ruc = %key, "Bandwidth refused, stopping");
            }
            Outcome::Abandoned => {
                tracing::debug!(worker = self.id, ruc = %key, "Key abandoned");
            }
        }

        WorkerReport {
            worker_id: self.id,
            key,
            outcome,
            bytes_used,
        }
    }

    /// One attempt at a key: pacing, session, then every result page.
    async fn attempt(&mut self, key: &RucKey, bytes_used: &mut u64) -> Outcome {
        let delay = self.profile.pick_delay();
        tokio::select! {
            () = self.cancel.cancelled() => return Outcome::Abandoned,
            () = tokio::time::sleep(delay) => {}
        }

        if self.pages_on_session >= self.profile.pages_per_session {
            tracing::debug!(worker = self.id, pages = self.pages_on_session, "Rotating session");
            self.close_session().await;
        }

        let mut rotated_mid_key = false;
        let mut lines = Vec::new();
        let mut page = 1;

        loop {
            if self.session.is_none() {
                let opened = tokio::select! {
                    () = self.cancel.cancelled() => return Outcome::Abandoned,
                    opened = self.backend.open_session() => opened,
                };
                match opened {
                    Ok(session) => {
                        self.session = Some(session);
                        self.pages_on_session = 0;
                    }
                    Err(e) if e.is_session() && !rotated_mid_key => {
                        rotated_mid_key = true;
                        continue;
                    }
                    Err(e) => {
                        self.note_failure(&e);
                        return Outcome::Failed(e);
                    }
                }
            }

            let Some(reservation) = self.governor.try_reserve(self.governor.estimate()) else {
                return Outcome::BandwidthRefused;
            };

            let Some(session) = self.session.as_mut() else {
                continue;
            };
            let fetched = tokio::select! {
                () = self.cancel.cancelled() => None,
                fetched = self.backend.fetch_page(session, key, page) => Some(fetched),
            };

            let bytes = self.backend.take_transferred_bytes(session);
            self.governor.commit(reservation, bytes);
            *bytes_used += bytes;
            self.pages_on_session += 1;

            match fetched {
                None => return Outcome::Abandoned,
                Some(Ok(fetched)) => {
                    self.governor.record_success();
                    lines.extend(fetched.lines);
                    if !fetched.has_more {
                        return Outcome::Succeeded(lines);
                    }
                    page += 1;
                }
                Some(Err(e)) if e.is_session() && !rotated_mid_key => {
                    tracing::debug!(worker = self.id, ruc = %key, "Session lost, retrying on a fresh one: {}", e);
                    rotated_mid_key = true;
                    self.close_session().await;
                    lines.clear();
                    page = 1;
                }
                Some(Err(e)) => {
                    self.note_failure(&e);
                    self.close_session().await;
                    return Outcome::Failed(e);
                }
            }
        }
    }

    fn note_failure(&self, error: &FetchError) {
        if error.kind().is_transport() {
            self.governor.record_proxy_error();
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.backend.close_session(session).await;
        }
        self.pages_on_session = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineas_browser::FetchedPage;
    use lineas_core::{BandwidthConfig, FailureKind};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend replaying a fixed list of page results.
    struct Scripted {
        pages: Mutex<VecDeque<Result<FetchedPage, FetchError>>>,
        opened: AtomicUsize,
        closed: AtomicUsize,
        bytes_per_fetch: u64,
    }

    impl Scripted {
        fn new(pages: Vec<Result<FetchedPage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                bytes_per_fetch: 100,
            })
        }
    }

    #[async_trait::async_trait]
    impl LookupBackend for Scripted {
        type Session = u64;

        async fn open_session(&self) -> Result<u64, FetchError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        async fn fetch_page(
            &self,
            session: &mut u64,
            _key: &RucKey,
            _page: u32,
        ) -> Result<FetchedPage, FetchError> {
            *session += self.bytes_per_fetch;
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FetchedPage::default()))
        }

        fn take_transferred_bytes(&self, session: &mut u64) -> u64 {
            std::mem::take(session)
        }

        async fn close_session(&self, _session: u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn probe_latency(&self) -> Result<Duration, FetchError> {
            Ok(Duration::from_millis(10))
        }
    }

    fn line(n: &str) -> ExtractedLine {
        ExtractedLine {
            modality: "Prepago".to_string(),
            phone_number: n.to_string(),
            operator_name: "Bitel".to_string(),
        }
    }

    fn worker(backend: Arc<Scripted>, cap: u64, pages_per_session: u32) -> Worker<Scripted> {
        let governor = Arc::new(BandwidthGovernor::new(&BandwidthConfig {
            cap_bytes_override: Some(cap),
            estimated_kb_per_fetch: 0,
            ..BandwidthConfig::default()
        }));
        let profile = ResourceProfile::fixed(1, Duration::ZERO, Duration::ZERO, pages_per_session);
        Worker::new(0, backend, governor, Arc::new(profile), CancellationToken::new())
    }

    fn key() -> RucKey {
        RucKey::new("20100047218").unwrap()
    }

    #[tokio::test]
    async fn test_collects_all_pages() {
        let backend = Scripted::new(vec![
            Ok(FetchedPage {
                lines: vec![line("1")],
                has_more: true,
            }),
            Ok(FetchedPage::last(vec![line("2")])),
        ]);
        let mut w = worker(Arc::clone(&backend), u64::MAX, 100);

        let report = w.process(key()).await;
        match report.outcome {
            Outcome::Succeeded(lines) => assert_eq!(lines, vec![line("1"), line("2")]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.bytes_used, 200);
        assert_eq!(w.governor.consumed(), 200);
    }

    #[tokio::test]
    async fn test_session_error_retried_once_on_fresh_session() {
        let backend = Scripted::new(vec![
            Err(FetchError::Session("target closed".to_string())),
            Ok(FetchedPage::last(vec![line("1")])),
        ]);
        let mut w = worker(Arc::clone(&backend), u64::MAX, 100);

        let report = w.process(key()).await;
        assert!(matches!(report.outcome, Outcome::Succeeded(ref l) if l.len() == 1));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_session_error_is_a_failure() {
        let backend = Scripted::new(vec![
            Err(FetchError::Session("target closed".to_string())),
            Err(FetchError::Session("target closed again".to_string())),
        ]);
        let mut w = worker(backend, u64::MAX, 100);

        let report = w.process(key()).await;
        match report.outcome {
            Outcome::Failed(e) => assert_eq!(e.kind(), FailureKind::SessionError),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_counts_toward_proxy_streak() {
        let backend = Scripted::new(vec![Err(FetchError::transient(
            FailureKind::ProxyError,
            "ERR_TUNNEL_CONNECTION_FAILED",
        ))]);
        let mut w = worker(Arc::clone(&backend), u64::MAX, 100);

        let report = w.process(key()).await;
        assert!(matches!(report.outcome, Outcome::Failed(_)));
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1, "failed session is rotated");
    }

    #[tokio::test]
    async fn test_bandwidth_refusal() {
        let backend = Scripted::new(vec![]);
        let governor = Arc::new(BandwidthGovernor::new(&BandwidthConfig {
            cap_bytes_override: Some(10),
            estimated_kb_per_fetch: 1,
            ..BandwidthConfig::default()
        }));
        let profile = ResourceProfile::fixed(1, Duration::ZERO, Duration::ZERO, 100);
        let mut w = Worker::new(0, backend, governor, Arc::new(profile), CancellationToken::new());

        let report = w.process(key()).await;
        assert!(matches!(report.outcome, Outcome::BandwidthRefused));
        assert_eq!(report.bytes_used, 0);
    }

    #[tokio::test]
    async fn test_rotates_after_page_budget() {
        let backend = Scripted::new(vec![]);
        let mut w = worker(Arc::clone(&backend), u64::MAX, 2);

        for _ in 0..5 {
            let report = w.process(key()).await;
            assert!(matches!(report.outcome, Outcome::Succeeded(_)));
        }
        // 5 single-page keys with a budget of 2 pages per session
        assert_eq!(backend.opened.load(Ordering::SeqCst), 3);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_worker_abandons_and_closes() {
        let backend = Scripted::new(vec![]);
        let w = worker(Arc::clone(&backend), u64::MAX, 100).with_start_delay(Duration::ZERO);
        let cancel = w.cancel.clone();

        let (assign_tx, assign_rx) = mpsc::channel(1);
        let (report_tx, mut report_rx) = mpsc::channel(1);
        let handle = tokio::spawn(w.run(assign_rx, report_tx));

        assign_tx
            .send(WorkRecord::pending(key()))
            .await
            .unwrap();
        let report = report_rx.recv().await.unwrap();
        assert!(matches!(report.outcome, Outcome::Succeeded(_)));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
    }
}
