//! Polling fallback: one shared interval timer for every watched id.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use evalsync_logging::{sync_debug, sync_info, sync_warn};

use crate::timers::{TimerKind, TimerTable, TimerToken};
use crate::{Effect, EvaluationId, FetchFailure, RequestId, StatusSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Fetched {
        evaluation_id: EvaluationId,
        snapshot: StatusSnapshot,
    },
    Failed {
        evaluation_id: EvaluationId,
        error: FetchFailure,
    },
}

#[derive(Debug, Clone)]
pub struct PollScheduler {
    interval: Duration,
    watched: BTreeSet<EvaluationId>,
    in_flight: BTreeMap<RequestId, EvaluationId>,
    next_request: u64,
    timers: TimerTable,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            watched: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            next_request: 0,
            timers: TimerTable::default(),
        }
    }

    pub fn is_watched(&self, id: &str) -> bool {
        self.watched.contains(id)
    }

    pub fn watched(&self) -> impl Iterator<Item = &EvaluationId> {
        self.watched.iter()
    }

    pub fn is_running(&self) -> bool {
        self.timers.is_armed(&TimerKind::Poll)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Starts the shared timer if it is not already running.
    pub fn watch<I>(&mut self, ids: I, effects: &mut Vec<Effect>)
    where
        I: IntoIterator<Item = EvaluationId>,
    {
        for id in ids {
            if self.watched.insert(id.clone()) {
                sync_debug!("polling {}", id);
            }
        }
        if !self.watched.is_empty() && !self.is_running() {
            sync_info!("poll timer started ({:?})", self.interval);
            self.timers
                .arm(TimerKind::Poll, self.interval, true, effects);
        }
    }

    /// Cancels any in-flight fetch for `id`; stops the timer when nothing is
    /// left to poll.
    pub fn unwatch(&mut self, id: &str, effects: &mut Vec<Effect>) -> bool {
        if !self.watched.remove(id) {
            return false;
        }
        let cancelled: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|(_, watched)| watched.as_str() == id)
            .map(|(request, _)| *request)
            .collect();
        for request in cancelled {
            self.in_flight.remove(&request);
            effects.push(Effect::CancelFetch { request });
        }
        sync_debug!("stopped polling {}", id);
        if self.watched.is_empty() && self.timers.cancel(&TimerKind::Poll, effects) {
            sync_info!("poll timer stopped");
        }
        true
    }

    /// Returns false when the token is not the scheduler's current timer.
    pub fn on_timer(&mut self, token: &TimerToken, effects: &mut Vec<Effect>) -> bool {
        if token.kind != TimerKind::Poll || !self.timers.accept(token) {
            return false;
        }
        let busy: BTreeSet<&EvaluationId> = self.in_flight.values().collect();
        let due: Vec<EvaluationId> = self
            .watched
            .iter()
            .filter(|id| !busy.contains(id))
            .cloned()
            .collect();
        for evaluation_id in due {
            self.next_request += 1;
            let request = RequestId(self.next_request);
            self.in_flight.insert(request, evaluation_id.clone());
            effects.push(Effect::FetchStatus {
                request,
                evaluation_id,
            });
        }
        true
    }

    /// Terminal snapshots unwatch their id here, so a late or duplicate
    /// response cannot remove it twice.
    pub fn on_fetched(
        &mut self,
        request: RequestId,
        result: Result<StatusSnapshot, FetchFailure>,
        effects: &mut Vec<Effect>,
    ) -> Option<PollEvent> {
        let Some(evaluation_id) = self.in_flight.remove(&request) else {
            sync_debug!("response for cancelled {:?} dropped", request);
            return None;
        };
        if !self.watched.contains(&evaluation_id) {
            return None;
        }
        match result {
            Ok(snapshot) => {
                if snapshot.status.is_terminal() {
                    self.unwatch(&evaluation_id, effects);
                }
                Some(PollEvent::Fetched {
                    evaluation_id,
                    snapshot,
                })
            }
            Err(error) => {
                sync_warn!("poll of {} failed: {}", evaluation_id, error);
                Some(PollEvent::Failed {
                    evaluation_id,
                    error,
                })
            }
        }
    }
}
