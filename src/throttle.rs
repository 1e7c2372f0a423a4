//! Concurrency throttle for worker sessions.
//!
//! The dispatcher asks the throttle before starting each session. The
//! effective limit is the smallest of the configured maximum, a limit
//! derived from available machine resources, and the hard cap.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::System;

use crate::clog_debug;
use crate::config::{Config, HARD_SESSION_CAP};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

struct ProbeCache {
    system: System,
    resource_max: usize,
    probed_at: Option<Instant>,
}

pub struct ConcurrencyThrottle {
    configured_max: usize,
    memory_budget_bytes: u64,
    refresh_interval: Duration,
    cache: Mutex<ProbeCache>,
}

impl ConcurrencyThrottle {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(
            config.effective_max_parallel(),
            config.session_memory_budget_mb,
        )
    }

    pub fn with_limits(configured_max: usize, memory_budget_mb: u64) -> Self {
        Self {
            configured_max: configured_max.clamp(1, HARD_SESSION_CAP),
            memory_budget_bytes: memory_budget_mb.max(1) * 1024 * 1024,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cache: Mutex::new(ProbeCache {
                system: System::new(),
                resource_max: HARD_SESSION_CAP,
                probed_at: None,
            }),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn configured_max(&self) -> usize {
        self.configured_max
    }

    /// The limit the dispatcher must respect right now.
    ///
    /// Resource probing is cached behind the refresh interval so
    /// dispatch-loop calls stay cheap.
    pub fn effective_max(&self) -> usize {
        let resource_max = self.resource_max();
        let effective = self
            .configured_max
            .min(resource_max)
            .min(HARD_SESSION_CAP)
            .max(1);
        clog_debug!(
            "Throttle: configured={} resource={} effective={}",
            self.configured_max,
            resource_max,
            effective
        );
        effective
    }

    /// Whether another session may start given the current running count.
    pub fn is_slot_available(&self, running: usize) -> bool {
        running < self.effective_max()
    }

    fn resource_max(&self) -> usize {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale = cache
            .probed_at
            .map(|t| t.elapsed() >= self.refresh_interval)
            .unwrap_or(true);
        if stale {
            cache.system.refresh_memory();
            let available = cache.system.available_memory();
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cache.resource_max = derive_resource_max(available, self.memory_budget_bytes, cores);
            cache.probed_at = Some(Instant::now());
        }
        cache.resource_max
    }
}

/// Sessions the machine can plausibly host: enough memory budget per
/// session, and no more sessions than logical cores.
fn derive_resource_max(available_bytes: u64, budget_bytes: u64, cores: usize) -> usize {
    let by_memory = (available_bytes / budget_bytes) as usize;
    by_memory.min(cores).max(1)
}

impl std::fmt::Debug for ConcurrencyThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyThrottle")
            .field("configured_max", &self.configured_max)
            .field("memory_budget_bytes", &self.memory_budget_bytes)
            .finish()
    }
}
