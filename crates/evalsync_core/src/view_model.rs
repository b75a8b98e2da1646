use std::collections::{BTreeMap, BTreeSet};

use crate::{ChannelKey, EvaluationId, EvaluationRecord, Notification, Phase};

/// Read-only projection handed to UI views.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreSnapshot {
    pub records: BTreeMap<EvaluationId, EvaluationRecord>,
    pub tracked: BTreeSet<EvaluationId>,
    pub channels: BTreeMap<ChannelKey, Phase>,
    pub notifications: Vec<Notification>,
    pub unread_notifications: usize,
}

impl StoreSnapshot {
    pub fn get(&self, id: &str) -> Option<&EvaluationRecord> {
        self.records.get(id)
    }

    pub fn list(&self) -> Vec<&EvaluationRecord> {
        self.records.values().collect()
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracked.contains(id)
    }

    /// Tracked ids that are not terminal yet.
    pub fn active(&self) -> impl Iterator<Item = &EvaluationRecord> {
        self.tracked
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|record| !record.is_terminal())
    }
}
