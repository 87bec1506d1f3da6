//! Host and network profiling.
//!
//! Sizes the worker pool from CPU and free memory, and the pacing delay from
//! the measured proxy latency. Profiling never blocks a run: a failed probe
//! falls back to the configured delay range.

use lineas_browser::LookupBackend;
use lineas_core::{HarvestConfig, HarvestSettings, PacingConfig};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{System, SystemExt};

/// Hard ceiling on concurrent browser sessions.
pub const MAX_WORKERS: usize = 50;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Facts about the host the pool runs on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostFacts {
    pub cpu_cores: usize,
    pub available_ram_bytes: u64,
}

impl HostFacts {
    /// Inspect the current host.
    #[must_use]
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let cpu_cores = system.physical_core_count().unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });

        Self {
            cpu_cores,
            available_ram_bytes: system.available_memory(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn available_ram_gb(&self) -> f64 {
        self.available_ram_bytes as f64 / BYTES_PER_GB
    }
}

/// Pool size and pacing for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceProfile {
    pub worker_count: usize,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub pages_per_session: u32,
    pub host: Option<HostFacts>,
    pub latency: Option<Duration>,
}

impl ResourceProfile {
    /// A profile with explicit values and no observed host facts.
    #[must_use]
    pub fn fixed(
        worker_count: usize,
        delay_min: Duration,
        delay_max: Duration,
        pages_per_session: u32,
    ) -> Self {
        Self {
            worker_count: worker_count.clamp(1, MAX_WORKERS),
            delay_min,
            delay_max: delay_max.max(delay_min),
            pages_per_session: pages_per_session.max(1),
            host: None,
            latency: None,
        }
    }

    /// Random pacing delay within the profile's range.
    #[must_use]
    pub fn pick_delay(&self) -> Duration {
        if self.delay_max <= self.delay_min {
            return self.delay_min;
        }
        rand::thread_rng().gen_range(self.delay_min..=self.delay_max)
    }
}

/// Derive a profile from host facts and an optional latency measurement.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
#[must_use]
pub fn derive_profile(
    host: HostFacts,
    latency: Option<Duration>,
    harvest: &HarvestSettings,
    pacing: &PacingConfig,
) -> ResourceProfile {
    let manual_cap = harvest.max_workers.unwrap_or(MAX_WORKERS);
    let by_cpu = (host.cpu_cores as f64 * pacing.cpu_scaling_factor).floor() as usize;
    let by_ram = (host.available_ram_gb() / pacing.ram_per_worker_gb).floor() as usize;

    let worker_count = manual_cap.min(by_cpu).min(by_ram).clamp(1, MAX_WORKERS);

    let (delay_min, delay_max) = match latency {
        Some(latency) => delay_tier(latency),
        None => (
            Duration::from_millis(pacing.default_delay_min_ms),
            Duration::from_millis(pacing.default_delay_max_ms),
        ),
    };

    let ram_gb = host.available_ram_gb();
    let pages_per_session = if ram_gb > 8.0 {
        200
    } else if ram_gb > 4.0 {
        150
    } else if ram_gb > 2.0 {
        100
    } else {
        50
    };

    ResourceProfile {
        worker_count,
        delay_min,
        delay_max,
        pages_per_session,
        host: Some(host),
        latency,
    }
}

fn delay_tier(latency: Duration) -> (Duration, Duration) {
    let (min_ms, max_ms) = match latency.as_millis() {
        0..=99 => (500, 1_000),
        100..=199 => (800, 1_500),
        200..=399 => (1_000, 2_000),
        _ => (1_500, 3_000),
    };
    (Duration::from_millis(min_ms), Duration::from_millis(max_ms))
}

/// Inspect the host, probe the proxy and derive the run's profile.
pub async fn profile<B: LookupBackend>(config: &HarvestConfig, backend: &B) -> ResourceProfile {
    let host = HostFacts::detect();
    let probe_timeout = Duration::from_secs(config.pacing.probe_timeout_secs);

    let latency = match tokio::time::timeout(probe_timeout, backend.probe_latency()).await {
        Ok(Ok(latency)) => Some(latency),
        Ok(Err(e)) => {
            tracing::warn!("Latency probe failed, using default pacing: {}", e);
            None
        }
        Err(_) => {
            tracing::warn!(
                "Latency probe timed out after {:?}, using default pacing",
                probe_timeout
            );
            None
        }
    };

    let profile = derive_profile(host, latency, &config.harvest, &config.pacing);

    tracing::info!(
        cores = host.cpu_cores,
        ram_gb = %format!("{:.1}", host.available_ram_gb()),
        latency = ?latency,
        workers = profile.worker_count,
        delay_min = ?profile.delay_min,
        delay_max = ?profile.delay_max,
        pages_per_session = profile.pages_per_session,
        "Resource profile computed"
    );

    profile
}
