//! Bandwidth budget enforcement.
//!
//! Every fetch is pre-authorized with [`BandwidthGovernor::try_reserve`]. The
//! returned [`Reservation`] holds its estimate against the cap until it is
//! committed with the actual byte count or dropped.

use lineas_core::BandwidthConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Committed fetches needed before the rolling mean replaces the configured estimate.
const MIN_SAMPLES: usize = 10;
/// Size of the rolling window.
const WINDOW: usize = 100;

#[derive(Debug, Default)]
struct Ledger {
    consumed: u64,
    reserved: u64,
    samples: VecDeque<u64>,
    fetches: u64,
    warned: bool,
    consecutive_proxy_errors: u32,
    proxy_exhausted: bool,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandwidthSnapshot {
    pub consumed: u64,
    pub reserved: u64,
    pub cap: u64,
    pub remaining: u64,
    pub used_percent: f64,
    pub fetches: u64,
    /// Keys the remaining budget covers at the current estimate, one fetch per key
    pub estimated_keys_remaining: u64,
}

#[derive(Debug)]
pub struct BandwidthGovernor {
    ledger: Mutex<Ledger>,
    cap: u64,
    initial_estimate: u64,
    warn_percent: f64,
    max_proxy_errors: u32,
}

/// Bytes held against the cap for one in-flight fetch.
///
/// Released on drop unless committed.
#[derive(Debug)]
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct Reservation<'a> {
    governor: &'a BandwidthGovernor,
    bytes: u64,
    settled: bool,
}

impl Reservation<'_> {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut ledger = self.governor.ledger();
            ledger.reserved = ledger.reserved.saturating_sub(self.bytes);
        }
    }
}

impl BandwidthGovernor {
    #[must_use]
    pub fn new(config: &BandwidthConfig) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            cap: config.cap_bytes(),
            initial_estimate: config.estimated_bytes_per_fetch(),
            warn_percent: config.warn_percent,
            max_proxy_errors: config.max_consecutive_proxy_errors,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Authorize a fetch expected to cost `estimated_bytes`.
    ///
    /// Returns `None` when the fetch could push usage past the cap, or when
    /// the proxy has been declared exhausted.
    pub fn try_reserve(&self, estimated_bytes: u64) -> Option<Reservation<'_>> {
        let mut ledger = self.ledger();

        if ledger.proxy_exhausted {
            return None;
        }

        let projected = ledger
            .consumed
            .saturating_add(ledger.reserved)
            .saturating_add(estimated_bytes);
        if projected > self.cap {
            tracing::debug!(
                consumed = ledger.consumed,
                reserved = ledger.reserved,
                estimate = estimated_bytes,
                cap = self.cap,
                "Fetch refused by bandwidth cap"
            );
            return None;
        }

        ledger.reserved += estimated_bytes;
        Some(Reservation {
            governor: self,
            bytes: estimated_bytes,
            settled: false,
        })
    }

    /// Record the actual cost of a reserved fetch.
    pub fn commit(&self, mut reservation: Reservation<'_>, actual_bytes: u64) {
        reservation.settled = true;

        let mut ledger = self.ledger();
        ledger.reserved = ledger.reserved.saturating_sub(reservation.bytes);
        ledger.consumed = ledger.consumed.saturating_add(actual_bytes);
        ledger.fetches += 1;

        if ledger.samples.len() == WINDOW {
            ledger.samples.pop_front();
        }
        ledger.samples.push_back(actual_bytes);

        let used = percent(ledger.consumed, self.cap);
        if !ledger.warned && used >= self.warn_percent {
            ledger.warned = true;
            tracing::warn!(
                "Bandwidth usage at {:.1}% ({} of {} bytes)",
                used,
                ledger.consumed,
                self.cap
            );
        }
    }

    /// Per-fetch estimate: configured until enough samples exist, then the rolling mean.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        self.estimate_from(&self.ledger())
    }

    fn estimate_from(&self, ledger: &Ledger) -> u64 {
        if ledger.samples.len() < MIN_SAMPLES {
            return self.initial_estimate;
        }
        let total: u64 = ledger.samples.iter().sum();
        total / ledger.samples.len() as u64
    }

    /// Count a transport failure. Returns true once the streak marks the proxy exhausted.
    pub fn record_proxy_error(&self) -> bool {
        let mut ledger = self.ledger();
        ledger.consecutive_proxy_errors += 1;

        if self.max_proxy_errors > 0
            && !ledger.proxy_exhausted
            && ledger.consecutive_proxy_errors >= self.max_proxy_errors
        {
            ledger.proxy_exhausted = true;
            tracing::error!(
                "{} consecutive proxy errors, treating proxy bandwidth as exhausted",
                ledger.consecutive_proxy_errors
            );
        }
        ledger.proxy_exhausted
    }

    /// Reset the transport failure streak.
    pub fn record_success(&self) {
        self.ledger().consecutive_proxy_errors = 0;
    }

    #[must_use]
    pub fn is_proxy_exhausted(&self) -> bool {
        self.ledger().proxy_exhausted
    }

    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.ledger().consumed
    }

    #[must_use]
    pub fn cap(&self) -> u64 {
        self.cap
    }

    #[must_use]
    pub fn snapshot(&self) -> BandwidthSnapshot {
        let ledger = self.ledger();
        let remaining = self.cap.saturating_sub(ledger.consumed);
        BandwidthSnapshot {
            consumed: ledger.consumed,
            reserved: ledger.reserved,
            cap: self.cap,
            remaining,
            used_percent: percent(ledger.consumed, self.cap),
            fetches: ledger.fetches,
            estimated_keys_remaining: remaining / self.estimate_from(&ledger).max(1),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        100.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
