//! Evaluation state store: the single owner of records and the tracked set.
//!
//! The store composes the connection manager, the poll scheduler and the
//! router. Those components never touch records; they report events and the
//! store merges them through [`Store::apply_update`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use evalsync_logging::{sync_debug, sync_error, sync_info, sync_trace, sync_warn};

use crate::connection::{ChannelEvent, ConnectionManager, ConnectionState};
use crate::message::InboundMessage;
use crate::record::{MergeOutcome, StatusUpdate};
use crate::scheduler::{PollEvent, PollScheduler};
use crate::timers::{TimerKind, TimerTable, TimerToken};
use crate::{
    ChannelKey, ClientConfig, Effect, EvaluationId, EvaluationRecord, Msg, Notification,
    NotificationInbox, Phase, StoreEvent, StoreSnapshot, UpdateSource,
};

#[derive(Debug, Clone, Default)]
struct Tracking {
    /// Number of views interested in this id.
    interest: u32,
    /// No usable push channel (exhausted, or never connected).
    push_lost: bool,
    /// The most recent poll for this id failed.
    poll_failing: bool,
}

#[derive(Debug, Clone)]
pub struct Store {
    config: ClientConfig,
    connections: ConnectionManager,
    scheduler: PollScheduler,
    records: BTreeMap<EvaluationId, EvaluationRecord>,
    tracked: BTreeMap<EvaluationId, Tracking>,
    topics: BTreeMap<ChannelKey, u32>,
    timers: TimerTable,
    notifications: NotificationInbox,
    dirty: bool,
}

impl Store {
    pub fn new(config: ClientConfig) -> Self {
        let scheduler = PollScheduler::new(config.poll_interval());
        let notifications = NotificationInbox::new(config.notification_capacity);
        Self {
            config,
            connections: ConnectionManager::new(),
            scheduler,
            records: BTreeMap::new(),
            tracked: BTreeMap::new(),
            topics: BTreeMap::new(),
            timers: TimerTable::default(),
            notifications,
            dirty: false,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handle(&mut self, msg: Msg, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        match msg {
            Msg::Track(id) => self.track(id, &mut effects),
            Msg::Untrack(id) => self.untrack(&id, &mut effects),
            Msg::SubscribeUser(user_id) => self.subscribe(ChannelKey::User(user_id), &mut effects),
            Msg::UnsubscribeUser(user_id) => {
                self.unsubscribe(&ChannelKey::User(user_id), &mut effects)
            }
            Msg::SubscribeBroadcast => self.subscribe(ChannelKey::Broadcast, &mut effects),
            Msg::UnsubscribeBroadcast => self.unsubscribe(&ChannelKey::Broadcast, &mut effects),
            Msg::RefreshList => effects.push(Effect::FetchList),
            Msg::MarkNotificationsRead => {
                if self.notifications.mark_all_read() > 0 {
                    self.dirty = true;
                }
            }
            Msg::Shutdown => self.shutdown(&mut effects),
            Msg::TransportOpened { transport } => {
                let events = self.connections.on_opened(transport, &mut effects);
                self.on_channel_events(events, now, &mut effects);
            }
            Msg::TransportFailed { transport, error } => {
                let events = self.connections.on_failed(transport, error, &mut effects);
                self.on_channel_events(events, now, &mut effects);
            }
            Msg::TransportError { transport, error } => {
                self.connections.on_error(transport, error);
            }
            Msg::TransportClosed { transport, reason } => {
                let events = self.connections.on_closed(transport, reason, &mut effects);
                self.on_channel_events(events, now, &mut effects);
            }
            Msg::FrameReceived { transport, text } => {
                let events = self.connections.on_frame(transport, &text);
                self.on_channel_events(events, now, &mut effects);
            }
            Msg::TimerFired(token) => self.on_timer(token, now, &mut effects),
            Msg::StatusFetched { request, result } => {
                if let Some(event) = self.scheduler.on_fetched(request, result, &mut effects) {
                    self.on_poll_event(event, now, &mut effects);
                }
            }
            Msg::ListFetched(Ok(snapshots)) => {
                sync_debug!("list returned {} evaluations", snapshots.len());
                for snapshot in snapshots {
                    if snapshot.id.is_empty() {
                        continue;
                    }
                    let id = snapshot.id.clone();
                    let update = StatusUpdate::from_snapshot(snapshot);
                    self.apply_update(&id, &update, UpdateSource::Poll, now, &mut effects);
                }
            }
            Msg::ListFetched(Err(error)) => {
                sync_warn!("list fetch failed: {}", error);
            }
        }
        effects
    }

    /// Registers interest in `id`. The first interest opens a push channel
    /// and adds the id to the poll set while it is not terminal.
    pub fn track(&mut self, id: EvaluationId, effects: &mut Vec<Effect>) {
        let tracking = self.tracked.entry(id.clone()).or_default();
        tracking.interest += 1;
        if tracking.interest > 1 {
            sync_debug!("{} now has {} views", id, tracking.interest);
            return;
        }
        sync_info!("tracking {}", id);
        self.dirty = true;

        if !self.records.contains_key(&id) {
            let record = EvaluationRecord::new(id.clone());
            self.records.insert(id.clone(), record.clone());
            self.publish(effects, StoreEvent::RecordChanged(record));
        }
        if self.records.get(&id).is_some_and(EvaluationRecord::is_terminal) {
            let grace = self.config.terminal_grace();
            self.timers
                .arm(TimerKind::Grace(id), grace, false, effects);
            return;
        }

        let key = ChannelKey::Evaluation(id.clone());
        if self.config.connection.auto_connect {
            let url = self.config.channel_url(&key);
            let options = self.config.connection.clone();
            if self.connections.connect(key.clone(), url, options, effects) {
                self.publish_phase(&key, effects);
            }
        } else if let Some(tracking) = self.tracked.get_mut(&id) {
            tracking.push_lost = true;
        }
        self.scheduler.watch([id], effects);
    }

    /// Drops one interest. The last one releases the channel and poll slot.
    pub fn untrack(&mut self, id: &str, effects: &mut Vec<Effect>) {
        let Some(tracking) = self.tracked.get_mut(id) else {
            sync_debug!("untrack {} ignored, not tracked", id);
            return;
        };
        tracking.interest = tracking.interest.saturating_sub(1);
        if tracking.interest > 0 {
            return;
        }
        self.release(id, effects);
    }

    /// The single merge point for push and poll data.
    pub fn apply_update(
        &mut self,
        id: &str,
        update: &StatusUpdate,
        source: UpdateSource,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> MergeOutcome {
        let created = !self.records.contains_key(id);
        let record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| EvaluationRecord::new(id));
        let outcome = record.apply(update, source, now);
        match outcome {
            MergeOutcome::IgnoredTerminal => {
                sync_debug!("{:?} update for terminal {} ignored", source, id);
            }
            MergeOutcome::Unchanged if !created => {}
            MergeOutcome::Unchanged | MergeOutcome::Updated | MergeOutcome::Terminated => {
                sync_trace!(
                    "{} {} {:.1}% via {:?}",
                    id,
                    record.status,
                    record.progress_percent,
                    source
                );
                let record = record.clone();
                self.dirty = true;
                self.publish(effects, StoreEvent::RecordChanged(record));
            }
        }

        if let Some(tracking) = self.tracked.get_mut(id) {
            match source {
                UpdateSource::Push => tracking.push_lost = false,
                UpdateSource::Poll => tracking.poll_failing = false,
            }
        }
        self.refresh_staleness(id, effects);

        if outcome == MergeOutcome::Terminated {
            self.on_terminal(id, effects);
        }
        outcome
    }

    pub fn get(&self, id: &str) -> Option<&EvaluationRecord> {
        self.records.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &EvaluationRecord> {
        self.records.values()
    }

    pub fn tracked(&self) -> impl Iterator<Item = &EvaluationId> {
        self.tracked.keys()
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracked.contains_key(id)
    }

    pub fn connection(&self, channel: &ChannelKey) -> Option<&ConnectionState> {
        self.connections.state(channel)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn notifications(&self) -> &NotificationInbox {
        &self.notifications
    }

    /// Every timer currently armed by any component.
    pub fn armed_timers(&self) -> Vec<TimerKind> {
        let mut kinds: Vec<TimerKind> = self.connections.armed_timers().cloned().collect();
        if self.scheduler.is_running() {
            kinds.push(TimerKind::Poll);
        }
        kinds.extend(self.timers.armed_kinds().cloned());
        kinds
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            records: self.records.clone(),
            tracked: self.tracked.keys().cloned().collect(),
            channels: self
                .connections
                .states()
                .map(|state| (state.channel.clone(), state.phase))
                .collect(),
            notifications: self.notifications.iter().cloned().collect(),
            unread_notifications: self.notifications.unread(),
        }
    }

    /// Returns whether anything visible changed since the last call.
    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn release(&mut self, id: &str, effects: &mut Vec<Effect>) {
        if self.tracked.remove(id).is_none() {
            return;
        }
        let key = ChannelKey::Evaluation(id.to_string());
        if self.connections.disconnect(&key, effects) {
            self.publish_phase(&key, effects);
        }
        self.scheduler.unwatch(id, effects);
        self.timers
            .cancel(&TimerKind::Grace(id.to_string()), effects);
        if let Some(record) = self.records.get_mut(id) {
            record.stale = false;
        }
        sync_info!("released {}", id);
        self.dirty = true;
        self.publish(effects, StoreEvent::TrackingReleased(id.to_string()));
    }

    fn subscribe(&mut self, key: ChannelKey, effects: &mut Vec<Effect>) {
        let count = self.topics.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return;
        }
        if !self.config.connection.auto_connect {
            sync_warn!("auto_connect disabled, {} not opened", key);
            return;
        }
        let url = self.config.channel_url(&key);
        let options = self.config.connection.clone();
        if self.connections.connect(key.clone(), url, options, effects) {
            self.publish_phase(&key, effects);
        }
    }

    fn unsubscribe(&mut self, key: &ChannelKey, effects: &mut Vec<Effect>) {
        let Some(count) = self.topics.get_mut(key) else {
            sync_debug!("unsubscribe {} ignored, not subscribed", key);
            return;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }
        self.topics.remove(key);
        if self.connections.disconnect(key, effects) {
            self.publish_phase(key, effects);
        }
    }

    fn shutdown(&mut self, effects: &mut Vec<Effect>) {
        sync_info!(
            "shutting down ({} tracked, {} topics)",
            self.tracked.len(),
            self.topics.len()
        );
        let ids: Vec<EvaluationId> = self.tracked.keys().cloned().collect();
        for id in ids {
            self.release(&id, effects);
        }
        let topics: Vec<ChannelKey> = std::mem::take(&mut self.topics).into_keys().collect();
        for key in topics {
            if self.connections.disconnect(&key, effects) {
                self.publish_phase(&key, effects);
            }
        }
    }

    fn on_timer(&mut self, token: TimerToken, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        match &token.kind {
            TimerKind::Poll => {
                if !self.scheduler.on_timer(&token, effects) {
                    sync_debug!("stale poll timer ignored");
                }
            }
            TimerKind::Heartbeat(_) | TimerKind::Reconnect(_) => {
                if let Some(events) = self.connections.on_timer(&token, effects) {
                    self.on_channel_events(events, now, effects);
                }
            }
            TimerKind::Grace(id) => {
                if self.timers.accept(&token) {
                    sync_info!("grace period over for {}", id);
                    self.release(id, effects);
                }
            }
        }
    }

    fn on_channel_events(
        &mut self,
        events: Vec<ChannelEvent>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        for event in events {
            match event {
                ChannelEvent::PhaseChanged(channel, phase) => {
                    if phase != Phase::Open && !self.config.poll_while_push_open {
                        if let Some(id) = channel.evaluation_id() {
                            self.ensure_polled(id, effects);
                        }
                    }
                    self.publish(effects, StoreEvent::ChannelPhaseChanged { channel, phase });
                }
                ChannelEvent::Message(channel, message) => {
                    self.on_message(&channel, message, now, effects);
                }
                ChannelEvent::Exhausted(channel, error) => match channel.evaluation_id() {
                    Some(id) => {
                        sync_warn!("push lost for {}, relying on polling: {}", id, error);
                        if let Some(tracking) = self.tracked.get_mut(id) {
                            tracking.push_lost = true;
                        }
                        self.ensure_polled(id, effects);
                        self.refresh_staleness(id, effects);
                    }
                    None => sync_error!("{} lost: {}", channel, error),
                },
            }
        }
    }

    fn on_message(
        &mut self,
        channel: &ChannelKey,
        message: InboundMessage,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        match message {
            InboundMessage::Connected => {
                if let Some(id) = channel.evaluation_id() {
                    if let Some(tracking) = self.tracked.get_mut(id) {
                        tracking.push_lost = false;
                    }
                    if !self.config.poll_while_push_open {
                        self.scheduler.unwatch(id, effects);
                    }
                    self.refresh_staleness(id, effects);
                }
            }
            InboundMessage::Heartbeat => sync_trace!("heartbeat on {}", channel),
            InboundMessage::Notification {
                user_id,
                kind,
                title,
                body,
                payload,
            } => {
                let notification = Notification {
                    user_id,
                    kind,
                    title,
                    body,
                    payload,
                    received_at: now,
                    read: false,
                };
                self.notifications.push(notification.clone());
                self.dirty = true;
                self.publish(effects, StoreEvent::Notification(notification));
            }
            InboundMessage::Broadcast { payload } => {
                self.publish(effects, StoreEvent::Broadcast(payload));
            }
            message @ (InboundMessage::Progress { .. }
            | InboundMessage::Complete { .. }
            | InboundMessage::Failed { .. }) => {
                if let Some((id, update)) = StatusUpdate::from_message(&message) {
                    self.apply_update(&id, &update, UpdateSource::Push, now, effects);
                }
            }
        }
    }

    fn on_poll_event(&mut self, event: PollEvent, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        match event {
            PollEvent::Fetched {
                evaluation_id,
                snapshot,
            } => {
                let update = StatusUpdate::from_snapshot(snapshot);
                self.apply_update(&evaluation_id, &update, UpdateSource::Poll, now, effects);
            }
            PollEvent::Failed { evaluation_id, .. } => {
                if let Some(tracking) = self.tracked.get_mut(&evaluation_id) {
                    tracking.poll_failing = true;
                }
                self.refresh_staleness(&evaluation_id, effects);
            }
        }
    }

    fn on_terminal(&mut self, id: &str, effects: &mut Vec<Effect>) {
        self.scheduler.unwatch(id, effects);
        if self.tracked.contains_key(id) {
            let grace = self.config.terminal_grace();
            sync_info!("{} is terminal, releasing in {:?}", id, grace);
            self.timers
                .arm(TimerKind::Grace(id.to_string()), grace, false, effects);
        }
    }

    fn ensure_polled(&mut self, id: &str, effects: &mut Vec<Effect>) {
        let active = self.tracked.contains_key(id)
            && self.records.get(id).is_some_and(|record| !record.is_terminal());
        if active && !self.scheduler.is_watched(id) {
            self.scheduler.watch([id.to_string()], effects);
        }
    }

    fn refresh_staleness(&mut self, id: &str, effects: &mut Vec<Effect>) {
        let Some(tracking) = self.tracked.get(id) else {
            return;
        };
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        let stale = tracking.push_lost && tracking.poll_failing && !record.is_terminal();
        if record.stale == stale {
            return;
        }
        record.stale = stale;
        if stale {
            sync_warn!("{} is stale: push and poll both failing", id);
        }
        self.dirty = true;
        self.publish(
            effects,
            StoreEvent::RecordStale {
                evaluation_id: id.to_string(),
                stale,
            },
        );
    }

    fn publish_phase(&mut self, channel: &ChannelKey, effects: &mut Vec<Effect>) {
        let phase = self.connections.phase(channel);
        self.publish(
            effects,
            StoreEvent::ChannelPhaseChanged {
                channel: channel.clone(),
                phase,
            },
        );
    }

    fn publish(&mut self, effects: &mut Vec<Effect>, event: StoreEvent) {
        effects.push(Effect::Publish(event));
    }
}
