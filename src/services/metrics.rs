use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::domain::Venue;

/// Coverage of one venue as of its last committed pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct VenueCoverage {
    pub open: u64,
    pub fully_protected: u64,
    pub partially_protected: u64,
    /// Open positions without an active stop-loss
    pub unprotected: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

impl VenueCoverage {
    /// Share of open positions with an active stop-loss, in percent
    pub fn coverage_pct(&self) -> f64 {
        if self.open == 0 {
            100.0
        } else {
            ((self.open - self.unprotected) as f64 / self.open as f64) * 100.0
        }
    }
}

/// Metrics collector for observability
pub struct Metrics {
    /// Completed reconciliation passes
    pub passes: AtomicU64,
    /// Passes aborted before commit
    pub pass_failures: AtomicU64,
    pub ledger_failures: AtomicU64,
    pub reconcile_actions: AtomicU64,
    pub discrepancies: AtomicU64,
    pub orders_placed: AtomicU64,
    pub protection_failures: AtomicU64,
    pub stream_events: AtomicU64,
    pub stream_events_dropped: AtomicU64,
    coverage: DashMap<Venue, VenueCoverage>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            passes: AtomicU64::new(0),
            pass_failures: AtomicU64::new(0),
            ledger_failures: AtomicU64::new(0),
            reconcile_actions: AtomicU64::new(0),
            discrepancies: AtomicU64::new(0),
            orders_placed: AtomicU64::new(0),
            protection_failures: AtomicU64::new(0),
            stream_events: AtomicU64::new(0),
            stream_events_dropped: AtomicU64::new(0),
            coverage: DashMap::new(),
        }
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn set_coverage(&self, venue: Venue, coverage: VenueCoverage) {
        info!(
            venue = %venue,
            open = coverage.open,
            fully_protected = coverage.fully_protected,
            partially_protected = coverage.partially_protected,
            unprotected = coverage.unprotected,
            coverage_pct = coverage.coverage_pct(),
            "Protection coverage"
        );
        self.coverage.insert(venue, coverage);
    }

    pub fn coverage(&self, venue: Venue) -> Option<VenueCoverage> {
        self.coverage.get(&venue).map(|c| c.clone())
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("warden_passes_total", "Completed reconciliation passes", &self.passes),
            ("warden_pass_failures_total", "Passes aborted before commit", &self.pass_failures),
            ("warden_ledger_failures_total", "Ledger commit failures", &self.ledger_failures),
            ("warden_reconcile_actions_total", "Reconciliation actions committed", &self.reconcile_actions),
            ("warden_discrepancies_total", "Discrepancies detected", &self.discrepancies),
            ("warden_orders_placed_total", "Protective orders placed", &self.orders_placed),
            ("warden_protection_failures_total", "Failed protective-order calls", &self.protection_failures),
            ("warden_stream_events_total", "Position events received from venue streams", &self.stream_events),
            ("warden_stream_events_dropped_total", "Position events dropped on queue overflow", &self.stream_events_dropped),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}\n", name, Self::get(counter));
        }

        let mut venues: Vec<(Venue, VenueCoverage)> = self
            .coverage
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        venues.sort_by_key(|(v, _)| *v);

        let gauges: [(&str, &str, fn(&VenueCoverage) -> f64); 5] = [
            ("warden_positions_open", "Open positions", |c| c.open as f64),
            ("warden_positions_fully_protected", "Fully protected positions", |c| c.fully_protected as f64),
            ("warden_positions_partially_protected", "Partially protected positions", |c| c.partially_protected as f64),
            ("warden_positions_unprotected", "Open positions without an active stop-loss", |c| c.unprotected as f64),
            ("warden_protection_coverage_pct", "Open positions with an active stop-loss, percent", |c| c.coverage_pct()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            for (venue, coverage) in &venues {
                let _ = writeln!(out, "{}{{venue=\"{}\"}} {}", name, venue, value(coverage));
            }
            out.push('\n');
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_includes_counters_and_venue_gauges() {
        let metrics = Metrics::new();
        Metrics::add(&metrics.passes, 3);
        metrics.set_coverage(
            Venue::Bybit,
            VenueCoverage {
                open: 4,
                fully_protected: 2,
                partially_protected: 1,
                unprotected: 1,
                last_pass_at: None,
            },
        );

        let text = metrics.prometheus();
        assert!(text.contains("warden_passes_total 3"));
        assert!(text.contains("warden_positions_unprotected{venue=\"bybit\"} 1"));
        assert!(text.contains("warden_protection_coverage_pct{venue=\"bybit\"} 75"));
    }

    #[test]
    fn empty_venue_is_fully_covered() {
        assert_eq!(VenueCoverage::default().coverage_pct(), 100.0);
    }
}
