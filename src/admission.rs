use crate::config::AdmissionConfig;
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Running mean of observed concurrency over one measurement window.
#[derive(Debug)]
struct Estimate {
    avg: f64,
    count: u64,
    window_start: Instant,
}

/// Inbound admission control.
///
/// Every request samples `in_flight + 1` into a running mean. When the window
/// expires the mean, rounded up, becomes the capacity and the estimate starts
/// over. An operator-fixed capacity freezes the estimate entirely.
#[derive(Debug)]
pub struct AdmissionController {
    in_flight: AtomicI64,
    capacity: AtomicI64,
    fixed: bool,
    window: Duration,
    headroom: f64,
    estimate: Mutex<Estimate>,
}

/// Returned when the local instance is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub in_flight: i64,
    pub capacity: i64,
}

impl AdmissionController {
    pub fn new(cfg: &AdmissionConfig) -> Self {
        Self {
            in_flight: AtomicI64::new(0),
            capacity: AtomicI64::new(cfg.capacity.max(0)),
            fixed: cfg.capacity > 0,
            window: cfg.window(),
            headroom: cfg.credit_headroom,
            estimate: Mutex::new(Estimate {
                avg: 0.0,
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Admit one inbound request or reject it immediately.
    ///
    /// The slot is reserved before the capacity check, so concurrent callers
    /// can never overshoot the capacity.
    pub fn admit(self: &Arc<Self>) -> Result<AdmissionPermit, Rejected> {
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.fixed {
            self.observe(current);
        }

        let capacity = self.capacity();
        if capacity > 0 && current > capacity {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            metrics::counter!("sidecar_admission_rejected_total").increment(1);
            return Err(Rejected {
                in_flight: current - 1,
                capacity,
            });
        }

        metrics::gauge!("sidecar_inbound_in_flight").set(current as f64);
        Ok(AdmissionPermit {
            controller: self.clone(),
            in_flight: current,
        })
    }

    fn observe(&self, sample: i64) {
        let mut est = self.estimate.lock().unwrap_or_else(|e| e.into_inner());
        est.count += 1;
        est.avg += (sample as f64 - est.avg) / est.count as f64;

        if est.window_start.elapsed() >= self.window {
            let capacity = est.avg.ceil() as i64;
            self.capacity.store(capacity, Ordering::Relaxed);
            tracing::info!(
                "admission: capacity re-estimated, capacity={}, samples={}",
                capacity,
                est.count
            );
            metrics::gauge!("sidecar_admission_capacity").set(capacity as f64);
            est.avg = 0.0;
            est.count = 0;
            est.window_start = Instant::now();
        }
    }

    /// Decide whether the response to an admitted request grants a credit,
    /// given the in-flight count observed when it was admitted.
    pub fn credit_hint_with<R: Rng + ?Sized>(&self, in_flight: i64, rng: &mut R) -> bool {
        let capacity = self.capacity();
        if capacity <= 0 {
            return true;
        }
        let withhold = in_flight as f64 / (self.headroom * capacity as f64);
        rng.gen::<f64>() >= withhold
    }

    pub fn credit_hint(&self, in_flight: i64) -> bool {
        self.credit_hint_with(in_flight, &mut rand::thread_rng())
    }
}

/// An admitted request's slot. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    in_flight: i64,
}

impl AdmissionPermit {
    /// Concurrency including this request, as observed at admission.
    pub fn in_flight(&self) -> i64 {
        self.in_flight
    }

    pub fn credit_hint(&self) -> bool {
        self.controller.credit_hint(self.in_flight)
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let left = self.controller.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("sidecar_inbound_in_flight").set(left as f64);
    }
}
