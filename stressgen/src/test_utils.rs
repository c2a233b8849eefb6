//! Test Utilities Module
//!
//! In-memory metrics sink for engine tests. Only compiled when running tests.

#![cfg(test)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::RequestStatus;
use crate::observe::MetricsSink;

/// Sink that records every observation for later assertions
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    stuck: AtomicU64,
    gauges: Mutex<Gauges>,
    latencies: Mutex<Vec<(RequestStatus, f64)>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Gauges {
    expected_rps: f64,
    expected_workers: f64,
    current_workers: f64,
    max_current_workers: f64,
}

impl RecordingSink {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn stuck(&self) -> u64 {
        self.stuck.load(Ordering::SeqCst)
    }

    /// Number of latency observations recorded with `status`
    pub fn latencies(&self, status: RequestStatus) -> u64 {
        self.latencies
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == status)
            .count() as u64
    }

    pub fn expected_rps(&self) -> f64 {
        self.gauges.lock().unwrap().expected_rps
    }

    pub fn expected_workers(&self) -> f64 {
        self.gauges.lock().unwrap().expected_workers
    }

    pub fn current_workers(&self) -> f64 {
        self.gauges.lock().unwrap().current_workers
    }

    /// Highest `current_workers` value ever reported
    pub fn max_current_workers(&self) -> f64 {
        self.gauges.lock().unwrap().max_current_workers
    }
}

impl MetricsSink for RecordingSink {
    fn set_expected_rps(&self, value: f64) {
        self.gauges.lock().unwrap().expected_rps = value;
    }

    fn set_expected_workers(&self, value: f64) {
        self.gauges.lock().unwrap().expected_workers = value;
    }

    fn set_current_workers(&self, value: f64) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges.current_workers = value;
        gauges.max_current_workers = gauges.max_current_workers.max(value);
    }

    fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_latency(&self, status: RequestStatus, seconds: f64) {
        self.latencies.lock().unwrap().push((status, seconds));
    }

    fn inc_stuck(&self) {
        self.stuck.fetch_add(1, Ordering::SeqCst);
    }
}
