//! Consecutive-pass accounting for discrepancies
//!
//! A discrepancy is resolved by the pass that detects it unless that pass
//! fails to commit. One that keeps reappearing is escalated once it has been
//! seen in `escalate_after` consecutive passes.

use std::collections::HashMap;

use super::engine::{Discrepancy, DiscrepancyKind};
use crate::domain::PositionKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub key: PositionKey,
    pub kind: DiscrepancyKind,
    pub passes: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackerUpdate {
    pub escalations: Vec<Escalation>,
    /// Keys whose escalating discrepancies cleared this pass
    pub resolved: Vec<PositionKey>,
}

pub struct DiscrepancyTracker {
    escalate_after: u32,
    streaks: HashMap<(PositionKey, DiscrepancyKind), u32>,
}

impl DiscrepancyTracker {
    pub fn new(escalate_after: u32) -> Self {
        Self {
            escalate_after: escalate_after.max(1),
            streaks: HashMap::new(),
        }
    }

    /// Record one pass's discrepancies. Kinds absent from this pass reset.
    pub fn observe(&mut self, discrepancies: &[Discrepancy]) -> TrackerUpdate {
        let mut next: HashMap<(PositionKey, DiscrepancyKind), u32> = HashMap::new();
        for d in discrepancies.iter().filter(|d| d.kind.escalates()) {
            let id = (d.key.clone(), d.kind);
            let count = self.streaks.get(&id).copied().unwrap_or(0) + 1;
            next.insert(id, count);
        }

        let mut update = TrackerUpdate::default();
        for ((key, kind), passes) in &next {
            if *passes >= self.escalate_after {
                update.escalations.push(Escalation {
                    key: key.clone(),
                    kind: *kind,
                    passes: *passes,
                });
            }
        }
        for ((key, _), passes) in &self.streaks {
            let still_present = next.keys().any(|(k, _)| k == key);
            if *passes >= self.escalate_after
                && !still_present
                && !update.resolved.contains(key)
            {
                update.resolved.push(key.clone());
            }
        }

        update.escalations.sort_by(|a, b| a.key.cmp(&b.key));
        update.resolved.sort();
        self.streaks = next;
        update
    }

    pub fn streak(&self, key: &PositionKey, kind: DiscrepancyKind) -> u32 {
        self.streaks.get(&(key.clone(), kind)).copied().unwrap_or(0)
    }
}
