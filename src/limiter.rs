//! Per-provider request gating.
//!
//! One [`ProviderGate`] exists per [`ProviderRole`] and is shared by every
//! task calling that provider. A caller holds a [`GatePermit`] for the whole
//! duration of one request. The gate enforces two limits:
//!
//! * at most `max_in_flight` permits outstanding (tokio `Semaphore`);
//! * at least `min_interval_ms` between two permit grants (governor quota with
//!   a burst of one).
//!
//! Callers over either limit suspend in `acquire()`; nothing is rejected.

use crate::config::{PipelineConfig, ProviderLimits, ProviderRole};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Quota state for one provider role.
pub struct ProviderGate {
    role: ProviderRole,
    max_in_flight: usize,
    slots: Arc<Semaphore>,
    pacer: Option<DirectLimiter>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    granted: AtomicUsize,
}

impl ProviderGate {
    pub fn new(role: ProviderRole, limits: &ProviderLimits) -> Self {
        let max_in_flight = limits.max_in_flight.max(1);
        let pacer = Quota::with_period(Duration::from_millis(limits.min_interval_ms))
            .map(DirectLimiter::direct);
        Self {
            role,
            max_in_flight,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            pacer,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a request slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is never closed, so acquire_owned cannot fail; fall
        // back to an unbounded permit rather than panic if that ever changes.
        let slot = Arc::clone(&self.slots).acquire_owned().await.ok();
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }

        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        self.counters.granted.fetch_add(1, Ordering::SeqCst);
        trace!(role = %self.role, in_flight = now, "gate permit granted");

        GatePermit {
            _slot: slot,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous permits observed so far.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Total permits granted so far.
    pub fn granted(&self) -> usize {
        self.counters.granted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProviderGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderGate")
            .field("role", &self.role)
            .field("max_in_flight", &self.max_in_flight)
            .field("paced", &self.pacer.is_some())
            .field("in_flight", &self.in_flight())
            .field("peak", &self.peak())
            .finish()
    }
}

/// Held for the duration of one provider request.
pub struct GatePermit {
    _slot: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The four gates of a run, one per provider role.
#[derive(Debug, Clone)]
pub struct Gates {
    ocr: Arc<ProviderGate>,
    format: Arc<ProviderGate>,
    translate: Arc<ProviderGate>,
    analyze: Arc<ProviderGate>,
}

impl Gates {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let gate = |role| Arc::new(ProviderGate::new(role, &config.settings(role).limits));
        Self {
            ocr: gate(ProviderRole::Ocr),
            format: gate(ProviderRole::Format),
            translate: gate(ProviderRole::Translate),
            analyze: gate(ProviderRole::Analyze),
        }
    }

    pub fn get(&self, role: ProviderRole) -> &Arc<ProviderGate> {
        match role {
            ProviderRole::Ocr => &self.ocr,
            ProviderRole::Format => &self.format,
            ProviderRole::Translate => &self.translate,
            ProviderRole::Analyze => &self.analyze,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn limits(max_in_flight: usize, min_interval_ms: u64) -> ProviderLimits {
        ProviderLimits {
            max_in_flight,
            min_interval_ms,
            ..ProviderLimits::default()
        }
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_limit() {
        let gate = Arc::new(ProviderGate::new(ProviderRole::Ocr, &limits(3, 0)));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                assert!(gate.in_flight() <= 3);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(gate.peak() <= 3, "peak was {}", gate.peak());
        assert_eq!(gate.peak(), 3);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.granted(), 20);
    }

    #[tokio::test]
    async fn starts_are_spaced() {
        let gate = ProviderGate::new(ProviderRole::Translate, &limits(10, 50));
        let start = Instant::now();
        for _ in 0..4 {
            let _p = gate.acquire().await;
        }
        // First grant is immediate, the next three wait ~50ms each.
        assert!(
            start.elapsed() >= Duration::from_millis(140),
            "elapsed {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn zero_interval_disables_pacing() {
        let gate = ProviderGate::new(ProviderRole::Analyze, &limits(1, 0));
        assert!(gate.pacer.is_none());
    }

    #[test]
    fn gates_follow_role_limits() {
        let config = PipelineConfig::builder()
            .max_in_flight(ProviderRole::Format, 7)
            .build()
            .unwrap();
        let gates = Gates::from_config(&config);
        assert_eq!(gates.get(ProviderRole::Format).max_in_flight(), 7);
        assert_eq!(gates.get(ProviderRole::Translate).max_in_flight(), 2);
        assert_eq!(gates.get(ProviderRole::Ocr).role(), ProviderRole::Ocr);
    }
}
