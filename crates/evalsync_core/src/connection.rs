//! Connection manager: one transport per channel, heartbeat and reconnect.
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!            ^           |
//!            +-----------+  (reconnect path only)
//! ```
//!
//! `Closed` is reachable from every phase through `disconnect` or exhausted
//! reconnection. Reports about transports that are no longer live are ignored.

use std::collections::BTreeMap;

use evalsync_logging::{sync_debug, sync_error, sync_info, sync_warn};
use serde::{Deserialize, Serialize};

use crate::message::{self, InboundMessage};
use crate::timers::{TimerKind, TimerTable, TimerToken};
use crate::{ChannelKey, ConnectionOptions, Effect, ErrorInfo, ErrorKind, TransportId};

/// Text frame sent as liveness check.
pub const HEARTBEAT_FRAME: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub channel: ChannelKey,
    pub url: String,
    pub phase: Phase,
    pub reconnect_attempts: u32,
    pub last_error: Option<ErrorInfo>,
    /// The live transport, if any.
    pub transport: Option<TransportId>,
    /// Transport being closed after an explicit disconnect.
    closing: Option<TransportId>,
    options: ConnectionOptions,
}

impl ConnectionState {
    fn new(channel: ChannelKey, url: String, options: ConnectionOptions) -> Self {
        Self {
            channel,
            url,
            phase: Phase::Idle,
            reconnect_attempts: 0,
            last_error: None,
            transport: None,
            closing: None,
            options,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

/// Upward notifications for the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    PhaseChanged(ChannelKey, Phase),
    Message(ChannelKey, InboundMessage),
    /// Reconnection gave up (or was disabled); the channel is Closed.
    Exhausted(ChannelKey, ErrorInfo),
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    channels: BTreeMap<ChannelKey, ConnectionState>,
    transports: BTreeMap<TransportId, ChannelKey>,
    next_transport: u64,
    timers: TimerTable,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, channel: &ChannelKey) -> Option<&ConnectionState> {
        self.channels.get(channel)
    }

    pub fn phase(&self, channel: &ChannelKey) -> Phase {
        self.channels
            .get(channel)
            .map_or(Phase::Idle, |state| state.phase)
    }

    pub fn states(&self) -> impl Iterator<Item = &ConnectionState> {
        self.channels.values()
    }

    /// Transports that are live (connecting or open).
    pub fn live_transports(&self) -> usize {
        self.channels
            .values()
            .filter(|state| state.transport.is_some())
            .count()
    }

    pub fn armed_timers(&self) -> impl Iterator<Item = &TimerKind> {
        self.timers.armed_kinds()
    }

    /// Idempotent: no-op while Connecting or Open.
    pub fn connect(
        &mut self,
        channel: ChannelKey,
        url: String,
        options: ConnectionOptions,
        effects: &mut Vec<Effect>,
    ) -> bool {
        let state = self
            .channels
            .entry(channel.clone())
            .or_insert_with(|| ConnectionState::new(channel.clone(), url.clone(), options.clone()));
        if matches!(state.phase, Phase::Connecting | Phase::Open) {
            sync_debug!("connect {} ignored, already {:?}", channel, state.phase);
            return false;
        }

        state.url = url;
        state.options = options;
        state.reconnect_attempts = 0;
        state.last_error = None;
        state.phase = Phase::Connecting;
        sync_info!("connecting {}", channel);
        self.open_transport(&channel, effects);
        true
    }

    /// Safe from any phase and any number of times.
    pub fn disconnect(&mut self, channel: &ChannelKey, effects: &mut Vec<Effect>) -> bool {
        self.timers
            .cancel(&TimerKind::Heartbeat(channel.clone()), effects);
        self.timers
            .cancel(&TimerKind::Reconnect(channel.clone()), effects);

        let Some(state) = self.channels.get_mut(channel) else {
            return false;
        };
        match state.transport.take() {
            Some(transport) => {
                state.phase = Phase::Closing;
                state.closing = Some(transport);
                effects.push(Effect::CloseTransport { transport });
                sync_info!("closing {} ({:?})", channel, transport);
            }
            None if state.phase == Phase::Closing => {}
            None => {
                state.phase = Phase::Closed;
                sync_info!("closed {}", channel);
            }
        }
        true
    }

    /// Best effort. Returns false (and logs) unless the channel is Open.
    pub fn send(&self, channel: &ChannelKey, text: String, effects: &mut Vec<Effect>) -> bool {
        match self.channels.get(channel) {
            Some(ConnectionState {
                phase: Phase::Open,
                transport: Some(transport),
                ..
            }) => {
                effects.push(Effect::SendFrame {
                    transport: *transport,
                    text,
                });
                true
            }
            other => {
                sync_warn!(
                    "send on {} skipped, phase {:?}",
                    channel,
                    other.map_or(Phase::Idle, |state| state.phase)
                );
                false
            }
        }
    }

    pub fn on_opened(
        &mut self,
        transport: TransportId,
        effects: &mut Vec<Effect>,
    ) -> Vec<ChannelEvent> {
        let Some(channel) = self.live_channel(transport) else {
            return Vec::new();
        };
        let Some(state) = self.channels.get_mut(&channel) else {
            return Vec::new();
        };
        if state.phase != Phase::Connecting {
            return Vec::new();
        }

        state.phase = Phase::Open;
        state.reconnect_attempts = 0;
        let heartbeat = state.options.heartbeat_interval();
        sync_info!("open {} ({:?})", channel, transport);
        self.timers
            .arm(TimerKind::Heartbeat(channel.clone()), heartbeat, true, effects);

        vec![
            ChannelEvent::PhaseChanged(channel.clone(), Phase::Open),
            ChannelEvent::Message(channel, InboundMessage::Connected),
        ]
    }

    pub fn on_failed(
        &mut self,
        transport: TransportId,
        error: String,
        effects: &mut Vec<Effect>,
    ) -> Vec<ChannelEvent> {
        self.on_unexpected_close(
            transport,
            ErrorInfo::new(ErrorKind::ConnectFailed, error),
            effects,
        )
    }

    /// Records the error; the channel stays up until a close report arrives.
    pub fn on_error(&mut self, transport: TransportId, error: String) {
        let Some(channel) = self.live_channel(transport) else {
            return;
        };
        if let Some(state) = self.channels.get_mut(&channel) {
            sync_warn!("transport error on {}: {}", channel, error);
            state.last_error = Some(ErrorInfo::new(ErrorKind::Transport, error));
        }
    }

    pub fn on_closed(
        &mut self,
        transport: TransportId,
        reason: Option<String>,
        effects: &mut Vec<Effect>,
    ) -> Vec<ChannelEvent> {
        if let Some(events) = self.finish_close(transport) {
            return events;
        }

        let message = reason.unwrap_or_else(|| "connection closed".to_string());
        self.on_unexpected_close(
            transport,
            ErrorInfo::new(ErrorKind::ConnectionLost, message),
            effects,
        )
    }

    pub fn on_frame(&mut self, transport: TransportId, text: &str) -> Vec<ChannelEvent> {
        let Some(channel) = self.live_channel(transport) else {
            sync_debug!("frame from stale {:?} dropped", transport);
            return Vec::new();
        };
        match message::route(&channel, text) {
            Some(message) => vec![ChannelEvent::Message(channel, message)],
            None => Vec::new(),
        }
    }

    /// Returns `None` when the token does not belong to this manager.
    pub fn on_timer(
        &mut self,
        token: &TimerToken,
        effects: &mut Vec<Effect>,
    ) -> Option<Vec<ChannelEvent>> {
        let channel = match &token.kind {
            TimerKind::Heartbeat(channel) | TimerKind::Reconnect(channel) => channel.clone(),
            _ => return None,
        };
        if !self.timers.accept(token) {
            sync_debug!("stale timer {:?} ignored", token);
            return Some(Vec::new());
        }

        match token.kind {
            TimerKind::Heartbeat(_) => {
                self.send(&channel, HEARTBEAT_FRAME.to_string(), effects);
            }
            _ => {
                let pending = self.channels.get(&channel).is_some_and(|state| {
                    state.phase == Phase::Connecting && state.transport.is_none()
                });
                if pending {
                    self.open_transport(&channel, effects);
                }
            }
        }
        Some(Vec::new())
    }

    fn open_transport(&mut self, channel: &ChannelKey, effects: &mut Vec<Effect>) {
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        self.next_transport += 1;
        let transport = TransportId(self.next_transport);
        state.transport = Some(transport);
        self.transports.insert(transport, channel.clone());
        effects.push(Effect::OpenTransport {
            channel: channel.clone(),
            transport,
            url: state.url.clone(),
        });
    }

    fn on_unexpected_close(
        &mut self,
        transport: TransportId,
        error: ErrorInfo,
        effects: &mut Vec<Effect>,
    ) -> Vec<ChannelEvent> {
        // A failed attempt we already asked to close still ends the Closing phase.
        if let Some(events) = self.finish_close(transport) {
            return events;
        }
        let Some(channel) = self.live_channel(transport) else {
            sync_debug!("close of stale {:?} ignored", transport);
            self.transports.remove(&transport);
            return Vec::new();
        };
        self.transports.remove(&transport);
        self.timers
            .cancel(&TimerKind::Heartbeat(channel.clone()), effects);
        let Some(state) = self.channels.get_mut(&channel) else {
            return Vec::new();
        };
        state.transport = None;
        sync_warn!("{} lost: {}", channel, error);

        let options = state.options.clone();
        if options.reconnect && state.reconnect_attempts < options.reconnect_attempts {
            state.reconnect_attempts += 1;
            state.last_error = Some(error);
            state.phase = Phase::Connecting;
            let delay = options.reconnect_delay(state.reconnect_attempts);
            sync_info!(
                "reconnecting {} in {:?} (attempt {}/{})",
                channel,
                delay,
                state.reconnect_attempts,
                options.reconnect_attempts
            );
            self.timers
                .arm(TimerKind::Reconnect(channel.clone()), delay, false, effects);
            return vec![ChannelEvent::PhaseChanged(channel, Phase::Connecting)];
        }

        let terminal = if options.reconnect {
            ErrorInfo::new(
                ErrorKind::ReconnectExhausted,
                format!(
                    "gave up after {} reconnect attempts: {}",
                    state.reconnect_attempts, error.message
                ),
            )
        } else {
            error
        };
        sync_error!("{} closed for good: {}", channel, terminal);
        state.phase = Phase::Closed;
        state.last_error = Some(terminal.clone());
        vec![
            ChannelEvent::PhaseChanged(channel.clone(), Phase::Closed),
            ChannelEvent::Exhausted(channel, terminal),
        ]
    }

    /// Completes a requested close. `None` when `transport` was not closing.
    fn finish_close(&mut self, transport: TransportId) -> Option<Vec<ChannelEvent>> {
        let channel = self.closing_channel(transport)?;
        self.transports.remove(&transport);
        let state = self.channels.get_mut(&channel)?;
        state.closing = None;
        if state.phase != Phase::Closing {
            return Some(Vec::new());
        }
        state.phase = Phase::Closed;
        sync_info!("closed {}", channel);
        Some(vec![ChannelEvent::PhaseChanged(channel, Phase::Closed)])
    }

    fn live_channel(&self, transport: TransportId) -> Option<ChannelKey> {
        let channel = self.transports.get(&transport)?;
        let state = self.channels.get(channel)?;
        (state.transport == Some(transport)).then(|| channel.clone())
    }

    fn closing_channel(&self, transport: TransportId) -> Option<ChannelKey> {
        let channel = self.transports.get(&transport)?;
        let state = self.channels.get(channel)?;
        (state.closing == Some(transport)).then(|| channel.clone())
    }
}
