use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ChannelKey, Effect, EvaluationId};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    Heartbeat(ChannelKey),
    Reconnect(ChannelKey),
    /// The scheduler's single shared poll interval.
    Poll,
    /// Eviction delay after an evaluation turned terminal.
    Grace(EvaluationId),
}

/// Identifies one arming of a timer. Re-arming a kind produces a new `seq`,
/// so fires from a cancelled arming never match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    seq: u64,
    repeat: bool,
}

/// Timers owned by one component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TimerTable {
    armed: BTreeMap<TimerKind, Armed>,
    next_seq: u64,
}

impl TimerTable {
    pub(crate) fn arm(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        repeat: bool,
        effects: &mut Vec<Effect>,
    ) -> TimerToken {
        self.cancel(&kind, effects);
        self.next_seq += 1;
        let token = TimerToken {
            kind: kind.clone(),
            seq: self.next_seq,
        };
        self.armed.insert(
            kind,
            Armed {
                seq: self.next_seq,
                repeat,
            },
        );
        effects.push(Effect::ScheduleTimer {
            token: token.clone(),
            delay,
            repeat,
        });
        token
    }

    pub(crate) fn cancel(&mut self, kind: &TimerKind, effects: &mut Vec<Effect>) -> bool {
        match self.armed.remove(kind) {
            Some(armed) => {
                effects.push(Effect::CancelTimer {
                    token: TimerToken {
                        kind: kind.clone(),
                        seq: armed.seq,
                    },
                });
                true
            }
            None => false,
        }
    }

    /// True when `token` is the current arming. One-shot timers disarm here.
    pub(crate) fn accept(&mut self, token: &TimerToken) -> bool {
        match self.armed.get(&token.kind) {
            Some(armed) if armed.seq == token.seq => {
                if !armed.repeat {
                    self.armed.remove(&token.kind);
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_armed(&self, kind: &TimerKind) -> bool {
        self.armed.contains_key(kind)
    }

    pub(crate) fn armed_kinds(&self) -> impl Iterator<Item = &TimerKind> {
        self.armed.keys()
    }
}
