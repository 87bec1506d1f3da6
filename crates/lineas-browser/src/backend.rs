//! The capability the harvester consumes.
//!
//! Everything the orchestrator knows about browsers, proxies and the lookup
//! site goes through [`LookupBackend`]. Tests drive the harvester with a
//! scripted implementation; production uses [`crate::ChromiumBackend`].

use crate::error::FetchError;
use lineas_core::{ExtractedLine, RucKey};
use std::time::Duration;

/// One page of results for a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    pub lines: Vec<ExtractedLine>,
    /// The lookup reports another page after this one
    pub has_more: bool,
}

impl FetchedPage {
    #[must_use]
    pub fn last(lines: Vec<ExtractedLine>) -> Self {
        Self {
            lines,
            has_more: false,
        }
    }
}

/// A source of lookup results.
///
/// Sessions are owned by exactly one worker at a time and must be handed back
/// through [`LookupBackend::close_session`] when the worker is done with them.
#[async_trait::async_trait]
pub trait LookupBackend: Send + Sync + 'static {
    /// Per-session state (browser process, page, proxy identity).
    type Session: Send;

    /// Start a fresh session with a new proxy identity.
    async fn open_session(&self) -> Result<Self::Session, FetchError>;

    /// Fetch page `page` (1-based) of the results for `key`.
    ///
    /// Page 1 submits the lookup form; later pages continue from the page the
    /// session is currently showing.
    async fn fetch_page(
        &self,
        session: &mut Self::Session,
        key: &RucKey,
        page: u32,
    ) -> Result<FetchedPage, FetchError>;

    /// Bytes transferred by the session since the previous call.
    fn take_transferred_bytes(&self, session: &mut Self::Session) -> u64;

    /// Release a session. Never fails; errors are logged.
    async fn close_session(&self, session: Self::Session);

    /// Round-trip latency through the proxy to a lightweight endpoint.
    async fn probe_latency(&self) -> Result<Duration, FetchError>;
}
