//! Virtual-time driver for the core: executes effects against fake
//! transports, fake fetches and a fake clock.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Once;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use evalsync_core::{
    update, ChannelKey, ClientConfig, Effect, EvaluationId, FetchFailure, Msg, RequestId,
    StatusSnapshot, Store, StoreEvent, TimerToken, TransportId,
};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(evalsync_logging::initialize_for_tests);
}

pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// RFC 3339 timestamp `secs` after [`epoch`].
pub fn stamp(secs: i64) -> String {
    (epoch() + chrono::Duration::seconds(secs)).to_rfc3339()
}

#[derive(Debug, Clone)]
struct PendingTimer {
    due_ms: u64,
    delay_ms: u64,
    repeat: bool,
}

pub struct Sim {
    store: Option<Store>,
    pub now_ms: u64,
    timers: BTreeMap<TimerToken, PendingTimer>,
    queue: VecDeque<Msg>,
    /// Every transport ever requested, with its url.
    pub opened: Vec<(TransportId, String)>,
    /// Transports the fake runtime still holds.
    pub live: BTreeMap<TransportId, ChannelKey>,
    pub sent: Vec<(TransportId, String)>,
    pub fetches: BTreeMap<RequestId, EvaluationId>,
    pub fetch_count: usize,
    pub cancelled_fetches: usize,
    pub list_requests: usize,
    pub events: Vec<StoreEvent>,
}

impl Sim {
    pub fn new(config: ClientConfig) -> Self {
        init_logging();
        Self {
            store: Some(Store::new(config)),
            now_ms: 0,
            timers: BTreeMap::new(),
            queue: VecDeque::new(),
            opened: Vec::new(),
            live: BTreeMap::new(),
            sent: Vec::new(),
            fetches: BTreeMap::new(),
            fetch_count: 0,
            cancelled_fetches: 0,
            list_requests: 0,
            events: Vec::new(),
        }
    }

    pub fn store(&self) -> &Store {
        self.store.as_ref().expect("store present")
    }

    pub fn now(&self) -> DateTime<Utc> {
        epoch() + chrono::Duration::milliseconds(self.now_ms as i64)
    }

    /// Feeds `msg` and every message it causes until the queue is empty.
    pub fn send(&mut self, msg: Msg) {
        self.queue.push_back(msg);
        while let Some(msg) = self.queue.pop_front() {
            evalsync_logging::set_logical_time(self.now_ms);
            let store = self.store.take().expect("store present");
            let (store, effects) = update(store, msg, self.now());
            self.store = Some(store);
            for effect in effects {
                self.execute(effect);
            }
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport {
                channel,
                transport,
                url,
            } => {
                self.opened.push((transport, url));
                self.live.insert(transport, channel);
            }
            Effect::CloseTransport { transport } => {
                if self.live.remove(&transport).is_some() {
                    self.queue.push_back(Msg::TransportClosed {
                        transport,
                        reason: None,
                    });
                }
            }
            Effect::SendFrame { transport, text } => self.sent.push((transport, text)),
            Effect::ScheduleTimer {
                token,
                delay,
                repeat,
            } => {
                let delay_ms = delay.as_millis() as u64;
                self.timers.insert(
                    token,
                    PendingTimer {
                        due_ms: self.now_ms + delay_ms,
                        delay_ms,
                        repeat,
                    },
                );
            }
            Effect::CancelTimer { token } => {
                self.timers.remove(&token);
            }
            Effect::FetchStatus {
                request,
                evaluation_id,
            } => {
                self.fetch_count += 1;
                self.fetches.insert(request, evaluation_id);
            }
            Effect::CancelFetch { request } => {
                if self.fetches.remove(&request).is_some() {
                    self.cancelled_fetches += 1;
                }
            }
            Effect::FetchList => self.list_requests += 1,
            Effect::Publish(event) => self.events.push(event),
        }
    }

    /// Moves the clock forward, firing due timers in order.
    pub fn advance(&mut self, duration: Duration) {
        let target = self.now_ms + duration.as_millis() as u64;
        loop {
            let next = self
                .timers
                .iter()
                .filter(|(_, timer)| timer.due_ms <= target)
                .min_by_key(|(_, timer)| timer.due_ms)
                .map(|(token, timer)| (token.clone(), timer.clone()));
            let Some((token, timer)) = next else {
                break;
            };
            self.now_ms = timer.due_ms;
            if timer.repeat {
                self.timers.insert(
                    token.clone(),
                    PendingTimer {
                        due_ms: timer.due_ms + timer.delay_ms.max(1),
                        ..timer
                    },
                );
            } else {
                self.timers.remove(&token);
            }
            self.send(Msg::TimerFired(token));
        }
        self.now_ms = target;
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn transport(&self, channel: &ChannelKey) -> TransportId {
        self.store()
            .connection(channel)
            .and_then(|state| state.transport)
            .expect("channel has a live transport")
    }

    pub fn open(&mut self, channel: &ChannelKey) {
        let transport = self.transport(channel);
        self.send(Msg::TransportOpened { transport });
    }

    pub fn fail_connect(&mut self, channel: &ChannelKey) {
        let transport = self.transport(channel);
        self.live.remove(&transport);
        self.send(Msg::TransportFailed {
            transport,
            error: "connection refused".into(),
        });
    }

    pub fn drop_connection(&mut self, channel: &ChannelKey) {
        let transport = self.transport(channel);
        self.live.remove(&transport);
        self.send(Msg::TransportClosed {
            transport,
            reason: Some("abnormal closure".into()),
        });
    }

    pub fn frame(&mut self, channel: &ChannelKey, text: &str) {
        let transport = self.transport(channel);
        self.send(Msg::FrameReceived {
            transport,
            text: text.to_string(),
        });
    }

    /// Answers the oldest outstanding fetch for `id`.
    pub fn respond(&mut self, id: &str, result: Result<StatusSnapshot, FetchFailure>) {
        let request = self
            .fetches
            .iter()
            .find(|(_, pending)| pending.as_str() == id)
            .map(|(request, _)| *request)
            .expect("fetch outstanding");
        self.fetches.remove(&request);
        self.send(Msg::StatusFetched { request, result });
    }

    pub fn outstanding_fetches(&self, id: &str) -> usize {
        self.fetches.values().filter(|pending| *pending == id).count()
    }
}

pub fn evaluation(id: &str) -> ChannelKey {
    ChannelKey::Evaluation(id.to_string())
}

pub fn snapshot(id: &str, json: serde_json::Value) -> StatusSnapshot {
    let mut value = json;
    value["id"] = serde_json::Value::String(id.to_string());
    serde_json::from_value(value).expect("valid snapshot")
}
