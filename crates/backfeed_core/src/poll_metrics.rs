/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PollMetrics {
    pub cycles_run: AtomicU64,
    pub items_fetched: AtomicU64,
    pub items_stored: AtomicU64,
    pub items_skipped: AtomicU64,
    pub adapter_errors: AtomicU64,
    pub throttle_events: AtomicU64,
    pub ingest_accepted: AtomicU64,
    pub ingest_rejected: AtomicU64,
    pub last_cycle_ms: AtomicU64,
}

impl PollMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_done(&self) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_ms.store(crate::now_ms().max(0) as u64, Ordering::Relaxed);
    }

    pub fn fetched_add(&self, n: u64) {
        self.items_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stored_add(&self, n: u64) {
        self.items_stored.fetch_add(n, Ordering::Relaxed);
    }

    pub fn skipped_add(&self, n: u64) {
        self.items_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn adapter_error(&self, throttled: bool) {
        self.adapter_errors.fetch_add(1, Ordering::Relaxed);
        if throttled {
            self.throttle_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn ingest_accepted(&self) {
        self.ingest_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ingest_rejected(&self) {
        self.ingest_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        serde_json::json!({
            "poll": {
                "cycles_run": load(&self.cycles_run),
                "items_fetched": load(&self.items_fetched),
                "items_stored": load(&self.items_stored),
                "items_skipped": load(&self.items_skipped),
                "adapter_errors": load(&self.adapter_errors),
                "throttle_events": load(&self.throttle_events),
                "last_cycle_ms": load(&self.last_cycle_ms),
            },
            "ingest": {
                "accepted": load(&self.ingest_accepted),
                "rejected": load(&self.ingest_rejected),
            }
        })
    }
}
