//! Client runtime: owns the [`Store`] on a dedicated thread and executes the
//! effects it requests.
//!
//! The thread runs a current-thread tokio runtime, so every store mutation
//! happens on one task and messages are applied strictly one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use evalsync_core::{
    update, ChannelKey, ClientConfig, Effect, EvaluationId, EvaluationRecord, Msg, RequestId,
    Store, StoreEvent, StoreSnapshot, TimerToken, TransportId,
};
use evalsync_logging::{set_logical_time, sync_debug, sync_error, sync_info, sync_warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchSettings, ReqwestStatusClient, StatusClient};
use crate::transport::{Connector, WsConnector};
use crate::EngineError;

const EVENT_CAPACITY: usize = 256;
const CLOSE_WAIT: Duration = Duration::from_secs(2);

enum Command {
    Dispatch(Msg),
    Shutdown,
}

enum Outgoing {
    Frame(String),
    Close,
}

struct TimerTask {
    handle: JoinHandle<()>,
    repeat: bool,
}

/// Handle to a running sync client. Cheap to query from any thread.
pub struct ClientHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<StoreEvent>,
    snapshot_rx: watch::Receiver<StoreSnapshot>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ClientHandle {
    /// Validates `config` and starts a client with the websocket connector
    /// and the reqwest status client.
    pub fn new(config: ClientConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let settings = FetchSettings::from_config(&config);
        let connector = Arc::new(WsConnector::new(config.request_timeout()));
        let client = Arc::new(ReqwestStatusClient::new(config.clone(), settings)?);
        Self::with_parts(config, connector, client)
    }

    pub fn with_parts(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        client: Arc<dyn StatusClient>,
    ) -> Result<Self, EngineError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Store::new(config);
        let (snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());

        let driver_events = events_tx.clone();
        let thread = thread::Builder::new()
            .name("evalsync-engine".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        sync_error!("could not build tokio runtime: {}", err);
                        return;
                    }
                };
                let driver = Driver::new(store, connector, client, driver_events, snapshot_tx);
                runtime.block_on(driver.run(cmd_rx));
            })?;

        Ok(Self {
            cmd_tx,
            events_tx,
            snapshot_rx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Registers interest in `id` until the returned guard is dropped.
    pub fn track(&self, id: impl Into<EvaluationId>) -> TrackingGuard {
        let id = id.into();
        self.dispatch(Msg::Track(id.clone()));
        TrackingGuard {
            id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Drops one interest taken without a guard.
    pub fn untrack(&self, id: impl Into<EvaluationId>) {
        self.dispatch(Msg::Untrack(id.into()));
    }

    pub fn subscribe_user(&self, user_id: impl Into<String>) {
        self.dispatch(Msg::SubscribeUser(user_id.into()));
    }

    pub fn unsubscribe_user(&self, user_id: impl Into<String>) {
        self.dispatch(Msg::UnsubscribeUser(user_id.into()));
    }

    pub fn subscribe_broadcast(&self) {
        self.dispatch(Msg::SubscribeBroadcast);
    }

    pub fn unsubscribe_broadcast(&self) {
        self.dispatch(Msg::UnsubscribeBroadcast);
    }

    pub fn refresh_list(&self) {
        self.dispatch(Msg::RefreshList);
    }

    pub fn mark_notifications_read(&self) {
        self.dispatch(Msg::MarkNotificationsRead);
    }

    /// A new receiver of every change published from now on.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<EvaluationRecord> {
        self.snapshot_rx.borrow().get(id).cloned()
    }

    pub fn list(&self) -> Vec<EvaluationRecord> {
        self.snapshot_rx.borrow().records.values().cloned().collect()
    }

    /// Releases every transport, timer and fetch, then stops the runtime
    /// thread. Safe to call more than once.
    pub fn shutdown(&self) {
        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(thread) = thread else {
            return;
        };
        let _ = self.cmd_tx.send(Command::Shutdown);
        if thread.join().is_err() {
            sync_error!("engine thread panicked");
        }
    }

    fn dispatch(&self, msg: Msg) {
        if self.cmd_tx.send(Command::Dispatch(msg)).is_err() {
            sync_warn!("client already shut down");
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Interest in one evaluation. Dropping it untracks the id.
#[must_use = "dropping the guard untracks the evaluation"]
pub struct TrackingGuard {
    id: EvaluationId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TrackingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        let _ = self
            .cmd_tx
            .send(Command::Dispatch(Msg::Untrack(self.id.clone())));
    }
}

struct Driver {
    store: Option<Store>,
    started: Instant,
    connector: Arc<dyn Connector>,
    client: Arc<dyn StatusClient>,
    reports_tx: mpsc::UnboundedSender<Msg>,
    reports_rx: mpsc::UnboundedReceiver<Msg>,
    transports: HashMap<TransportId, mpsc::UnboundedSender<Outgoing>>,
    transport_tasks: Vec<JoinHandle<()>>,
    timers: HashMap<TimerToken, TimerTask>,
    fetches: HashMap<RequestId, JoinHandle<()>>,
    events_tx: broadcast::Sender<StoreEvent>,
    snapshot_tx: watch::Sender<StoreSnapshot>,
    cancel: CancellationToken,
}

impl Driver {
    fn new(
        store: Store,
        connector: Arc<dyn Connector>,
        client: Arc<dyn StatusClient>,
        events_tx: broadcast::Sender<StoreEvent>,
        snapshot_tx: watch::Sender<StoreSnapshot>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            store: Some(store),
            started: Instant::now(),
            connector,
            client,
            reports_tx,
            reports_rx,
            transports: HashMap::new(),
            transport_tasks: Vec::new(),
            timers: HashMap::new(),
            fetches: HashMap::new(),
            events_tx,
            snapshot_tx,
            cancel: CancellationToken::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        sync_info!("engine started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Dispatch(msg)) => self.dispatch(msg),
                    Some(Command::Shutdown) | None => break,
                },
                Some(msg) = self.reports_rx.recv() => self.dispatch(msg),
            }
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        self.dispatch(Msg::Shutdown);
        self.cancel.cancel();
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        for (_, fetch) in self.fetches.drain() {
            fetch.abort();
        }
        let tasks = std::mem::take(&mut self.transport_tasks);
        if tokio::time::timeout(CLOSE_WAIT, futures_util::future::join_all(tasks))
            .await
            .is_err()
        {
            sync_warn!("transports did not close within {:?}", CLOSE_WAIT);
        }
        sync_info!("engine stopped");
    }

    fn dispatch(&mut self, msg: Msg) {
        set_logical_time(self.started.elapsed().as_millis() as u64);
        match &msg {
            Msg::StatusFetched { request, .. } => {
                self.fetches.remove(request);
            }
            Msg::TimerFired(token) => match self.timers.get(token) {
                None => {
                    sync_debug!("fire of cancelled timer {:?} dropped", token);
                    return;
                }
                Some(timer) if !timer.repeat => {
                    self.timers.remove(token);
                }
                Some(_) => {}
            },
            _ => {}
        }

        let Some(store) = self.store.take() else {
            return;
        };
        let (mut store, effects) = update(store, msg, Utc::now());
        let mut published = Vec::new();
        for effect in effects {
            match effect {
                Effect::Publish(event) => published.push(event),
                effect => self.execute(effect),
            }
        }
        // Subscribers reading the snapshot on an event must see that event applied.
        if store.consume_dirty() || !published.is_empty() {
            self.snapshot_tx.send_replace(store.snapshot());
        }
        self.store = Some(store);
        for event in published {
            // No receivers is fine; nobody is watching yet.
            let _ = self.events_tx.send(event);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport {
                channel,
                transport,
                url,
            } => self.open_transport(channel, transport, url),
            Effect::CloseTransport { transport } => {
                if let Some(outgoing) = self.transports.remove(&transport) {
                    let _ = outgoing.send(Outgoing::Close);
                }
            }
            Effect::SendFrame { transport, text } => match self.transports.get(&transport) {
                Some(outgoing) => {
                    let _ = outgoing.send(Outgoing::Frame(text));
                }
                None => sync_debug!("frame for closed {:?} dropped", transport),
            },
            Effect::ScheduleTimer {
                token,
                delay,
                repeat,
            } => self.schedule_timer(token, delay, repeat),
            Effect::CancelTimer { token } => {
                if let Some(timer) = self.timers.remove(&token) {
                    timer.handle.abort();
                }
            }
            Effect::FetchStatus {
                request,
                evaluation_id,
            } => {
                let client = self.client.clone();
                let reports = self.reports_tx.clone();
                let task = tokio::spawn(async move {
                    let result = client
                        .fetch_status(&evaluation_id)
                        .await
                        .map_err(Into::into);
                    let _ = reports.send(Msg::StatusFetched { request, result });
                });
                self.fetches.insert(request, task);
            }
            Effect::CancelFetch { request } => {
                if let Some(fetch) = self.fetches.remove(&request) {
                    fetch.abort();
                }
            }
            Effect::FetchList => {
                let client = self.client.clone();
                let reports = self.reports_tx.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = client.fetch_list() => {
                            let _ = reports.send(Msg::ListFetched(result.map_err(Into::into)));
                        }
                    }
                });
            }
            Effect::Publish(event) => {
                let _ = self.events_tx.send(event);
            }
        }
    }

    fn schedule_timer(&mut self, token: TimerToken, delay: Duration, repeat: bool) {
        let reports = self.reports_tx.clone();
        let fired = token.clone();
        let handle = tokio::spawn(async move {
            if repeat {
                let period = delay.max(Duration::from_millis(1));
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if reports.send(Msg::TimerFired(fired.clone())).is_err() {
                        break;
                    }
                }
            } else {
                tokio::time::sleep(delay).await;
                let _ = reports.send(Msg::TimerFired(fired));
            }
        });
        if let Some(previous) = self.timers.insert(token, TimerTask { handle, repeat }) {
            previous.handle.abort();
        }
    }

    fn open_transport(&mut self, channel: ChannelKey, transport: TransportId, url: String) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.transports.insert(transport, outgoing_tx);
        self.transport_tasks.retain(|task| !task.is_finished());

        let connector = self.connector.clone();
        let reports = self.reports_tx.clone();
        let cancel = self.cancel.clone();
        sync_debug!("opening {:?} for {} at {}", transport, channel, url);
        self.transport_tasks.push(tokio::spawn(run_transport(
            connector,
            transport,
            url,
            outgoing_rx,
            reports,
            cancel,
        )));
    }
}

async fn run_transport(
    connector: Arc<dyn Connector>,
    transport: TransportId,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    reports: mpsc::UnboundedSender<Msg>,
    cancel: CancellationToken,
) {
    let connect = connector.connect(&url);
    tokio::pin!(connect);
    let connected = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = &mut connect => break result,
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(_)) => sync_debug!("frame before open on {:?} dropped", transport),
                // Closed before the connection was established.
                Some(Outgoing::Close) | None => {
                    let _ = reports.send(Msg::TransportClosed { transport, reason: None });
                    return;
                }
            },
        }
    };

    let mut stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            let _ = reports.send(Msg::TransportFailed {
                transport,
                error: err.to_string(),
            });
            return;
        }
    };
    let _ = reports.send(Msg::TransportOpened { transport });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.close().await;
                return;
            }
            frame = stream.recv() => match frame {
                Ok(Some(text)) => {
                    let _ = reports.send(Msg::FrameReceived { transport, text });
                }
                Ok(None) => {
                    let _ = reports.send(Msg::TransportClosed {
                        transport,
                        reason: Some("closed by server".to_string()),
                    });
                    return;
                }
                Err(err) => {
                    let error = err.to_string();
                    let _ = reports.send(Msg::TransportError { transport, error: error.clone() });
                    let _ = reports.send(Msg::TransportClosed { transport, reason: Some(error) });
                    return;
                }
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(text)) => {
                    if let Err(err) = stream.send(text).await {
                        let _ = reports.send(Msg::TransportError { transport, error: err.to_string() });
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(err) = stream.close().await {
                        sync_debug!("close of {:?} failed: {}", transport, err);
                    }
                    let _ = reports.send(Msg::TransportClosed { transport, reason: None });
                    return;
                }
            },
        }
    }
}
