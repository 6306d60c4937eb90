use crate::channel::{PostgresChanges, Subscription};
use crate::error::RealtimeError;
use crate::message::{
    Change, ChangeEvent, RealtimeMessage, ACCESS_TOKEN, HEARTBEAT, PHOENIX_TOPIC, PHX_CLOSE,
    PHX_ERROR, PHX_JOIN, PHX_REPLY, POSTGRES_CHANGES,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The server dropped the socket and a new one is being opened
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct RealtimeClientOptions {
    pub heartbeat_interval: Duration,
    /// How long to wait for the server to acknowledge a channel join
    pub join_timeout: Duration,
    /// Buffered change notifications per subscription
    pub channel_capacity: usize,
    /// Reopen the socket and re-join channels when the server drops it
    pub auto_reconnect: bool,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_interval: Duration,
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_interval: Duration,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            channel_capacity: 64,
            auto_reconnect: true,
            max_reconnect_attempts: None,
            reconnect_interval: Duration::from_secs(1),
            reconnect_backoff_factor: 1.5,
            max_reconnect_interval: Duration::from_secs(30),
        }
    }
}

impl RealtimeClientOptions {
    fn next_reconnect_interval(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.reconnect_backoff_factor.max(1.0);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_reconnect_interval)
            .min(self.max_reconnect_interval)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ChannelSlot {
    table: String,
    event: ChangeEvent,
    /// `postgres_changes` entry sent with every join of this topic
    config: Value,
    sender: mpsc::Sender<Change>,
}

/// State shared between the client, its socket tasks and live subscriptions
pub(crate) struct Shared {
    url: String,
    key: String,
    options: RealtimeClientOptions,
    access_token: Mutex<Option<String>>,
    socket: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    state: Mutex<ConnectionState>,
    state_change: broadcast::Sender<ConnectionState>,
    next_ref: AtomicU32,
    /// Bumped on every connect and disconnect so tasks of an older socket
    /// leave newer ones alone
    generation: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    manually_closed: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn new(url: &str, key: &str, options: RealtimeClientOptions) -> Self {
        let (state_change, _) = broadcast::channel(16);
        Self {
            url: url.to_string(),
            key: key.to_string(),
            options,
            access_token: Mutex::new(None),
            socket: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            state_change,
            next_ref: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
            manually_closed: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("realtime state {:?} -> {:?}", *current, state);
            *current = state;
            let _ = self.state_change.send(state);
        }
    }

    fn websocket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            s => {
                return Err(RealtimeError::ConnectionError(format!(
                    "Unsupported URL scheme: {}",
                    s
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            RealtimeError::ConnectionError(format!("Cannot use scheme {} for {}", scheme, self.url))
        })?;
        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    /// Queue a frame for the writer task
    pub(crate) fn send(&self, message: &RealtimeMessage) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(message)?;
        let socket = lock(&self.socket);
        match socket.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| RealtimeError::ConnectionError("socket writer has stopped".to_string())),
            None => Err(RealtimeError::ConnectionError("not connected".to_string())),
        }
    }

    pub(crate) fn remove_channel(&self, topic: &str) -> bool {
        lock(&self.channels).remove(topic).is_some()
    }

    /// Drop every slot, which ends each subscriber's receiver
    fn close_channels(&self) {
        lock(&self.channels).clear();
        lock(&self.pending_replies).clear();
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = lock(&self.heartbeat).take() {
            task.abort();
        }
    }

    /// Send `phx_join` for `topic`; the receiver yields the server's reply
    fn send_join(
        &self,
        topic: &str,
        config: &Value,
    ) -> Result<(String, oneshot::Receiver<Value>), RealtimeError> {
        let join_ref = self.next_ref();
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending_replies).insert(join_ref.clone(), reply_tx);

        let payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [config],
            },
            "access_token": lock(&self.access_token).clone(),
        });
        let join = RealtimeMessage::new(topic, PHX_JOIN, payload, Some(join_ref.clone()));
        if let Err(e) = self.send(&join) {
            lock(&self.pending_replies).remove(&join_ref);
            return Err(e);
        }
        Ok((join_ref, reply_rx))
    }

    async fn await_join(
        &self,
        topic: &str,
        join_ref: &str,
        reply: oneshot::Receiver<Value>,
    ) -> Result<(), RealtimeError> {
        let outcome = match timeout(self.options.join_timeout, reply).await {
            Ok(Ok(reply)) if reply.get("status").and_then(Value::as_str) == Some("ok") => Ok(()),
            Ok(Ok(reply)) => Err(RealtimeError::SubscriptionError(format!(
                "join of {} rejected: {}",
                topic,
                reply.get("response").cloned().unwrap_or(Value::Null)
            ))),
            Ok(Err(_)) => Err(RealtimeError::ConnectionError(
                "connection closed before join reply".to_string(),
            )),
            Err(_) => Err(RealtimeError::SubscriptionError(format!(
                "timed out joining {}",
                topic
            ))),
        };
        if outcome.is_err() {
            lock(&self.pending_replies).remove(join_ref);
        }
        outcome
    }

    /// Join every registered topic again on a fresh socket. A topic the
    /// server refuses is dropped, closing its receiver.
    fn rejoin_all(self: &Arc<Self>) {
        let topics: Vec<(String, Value)> = lock(&self.channels)
            .iter()
            .map(|(topic, slot)| (topic.clone(), slot.config.clone()))
            .collect();

        for (topic, config) in topics {
            let (join_ref, reply) = match self.send_join(&topic, &config) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(%topic, "could not re-join channel: {}", e);
                    continue;
                }
            };
            let shared = self.clone();
            tokio::spawn(async move {
                match shared.await_join(&topic, &join_ref, reply).await {
                    Ok(()) => info!(%topic, "re-joined channel"),
                    // The socket went away again; the next reconnect retries.
                    Err(RealtimeError::ConnectionError(e)) => debug!(%topic, "re-join interrupted: {}", e),
                    Err(e) => {
                        warn!(%topic, "re-join failed, dropping channel: {}", e);
                        shared.remove_channel(&topic);
                    }
                }
            });
        }
    }

    /// Push a rotated access token to every joined channel
    fn push_access_token(&self, token: &str) {
        let topics: Vec<String> = lock(&self.channels).keys().cloned().collect();
        for topic in topics {
            let message = RealtimeMessage::new(
                &topic,
                ACCESS_TOKEN,
                json!({ "access_token": token }),
                Some(self.next_ref()),
            );
            if let Err(e) = self.send(&message) {
                debug!(%topic, "access token not sent: {}", e);
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let message = match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                error!("unparseable realtime frame: {}. Raw: {}", e, text);
                return;
            }
        };
        trace!(topic = %message.topic, event = %message.event, "realtime frame");

        match message.event.as_str() {
            PHX_REPLY => {
                let waiter = message
                    .ref_string()
                    .and_then(|r| lock(&self.pending_replies).remove(&r));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message.payload);
                }
            }
            POSTGRES_CHANGES => {
                let Some(change) = Change::from_payload(&message.payload) else {
                    warn!(topic = %message.topic, "postgres_changes frame without a change");
                    return;
                };
                let sender = {
                    let channels = lock(&self.channels);
                    channels
                        .get(&message.topic)
                        .filter(|slot| slot.table == change.table && slot.event.matches(change.kind))
                        .map(|slot| slot.sender.clone())
                };
                if let Some(sender) = sender {
                    if sender.send(change).await.is_err() {
                        debug!(topic = %message.topic, "receiver gone, dropping channel");
                        self.remove_channel(&message.topic);
                    }
                }
            }
            PHX_ERROR | PHX_CLOSE => {
                warn!(topic = %message.topic, event = %message.event, payload = %message.payload, "channel closed by server");
                self.remove_channel(&message.topic);
            }
            other => trace!("ignoring realtime event {}", other),
        }
    }

    /// Open a socket and start its writer, reader and heartbeat tasks. Topics
    /// still registered from an earlier socket are joined again. The caller
    /// holds `connect_lock`.
    async fn open(self: &Arc<Self>) -> Result<(), RealtimeError> {
        let ws_url = self.websocket_url()?;
        info!(host = ?ws_url.host_str(), "connecting realtime socket");

        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                error!("realtime connection failed: {}", e);
                return Err(RealtimeError::ConnectionError(format!(
                    "WebSocket connection failed: {}",
                    e
                )));
            }
        };

        let (mut write, mut read) = stream.split();
        let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.socket) = Some(socket_tx);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connected);

        tokio::spawn(async move {
            while let Some(message) = socket_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    error!("realtime send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("realtime writer finished");
        });

        let reader_shared = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_shared.dispatch(&text).await,
                    Ok(Message::Close(reason)) => {
                        debug!("realtime socket closed: {:?}", reason);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("realtime read error: {}", e);
                        break;
                    }
                }
            }
            debug!("realtime reader finished");
            reader_shared.on_socket_lost(generation);
        });

        let heartbeat_shared = self.clone();
        let heartbeat_interval = self.options.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_shared.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let heartbeat = RealtimeMessage::new(
                    PHOENIX_TOPIC,
                    HEARTBEAT,
                    json!({}),
                    Some(heartbeat_shared.next_ref()),
                );
                if heartbeat_shared.send(&heartbeat).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = lock(&self.heartbeat).replace(heartbeat) {
            previous.abort();
        }

        self.rejoin_all();
        Ok(())
    }

    /// Reader of socket `generation` stopped
    fn on_socket_lost(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        lock(&self.socket).take();
        // Waiters for replies on the dead socket see a connection error.
        lock(&self.pending_replies).clear();
        self.stop_heartbeat();

        if self.manually_closed.load(Ordering::SeqCst) || !self.options.auto_reconnect {
            self.close_channels();
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!("realtime socket dropped, reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        tokio::spawn(self.clone().reconnect());
    }

    async fn reconnect(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        let mut interval = self.options.reconnect_interval;

        loop {
            if let Some(max_attempts) = self.options.max_reconnect_attempts {
                if attempts >= max_attempts {
                    error!(attempts, "giving up on realtime reconnect");
                    self.close_channels();
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
            attempts += 1;
            sleep(interval).await;

            let _guard = self.connect_lock.lock().await;
            if self.manually_closed.load(Ordering::SeqCst) {
                debug!("disconnected while reconnecting");
                return;
            }
            if self.state() == ConnectionState::Connected {
                return;
            }
            match self.open().await {
                Ok(()) => {
                    info!(attempts, "realtime socket reconnected");
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempts, "realtime reconnect failed: {}", e);
                    self.set_state(ConnectionState::Reconnecting);
                    interval = self.options.next_reconnect_interval(interval);
                }
            }
        }
    }

    fn shutdown(&self) {
        self.manually_closed.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the writer, which closes the socket.
        lock(&self.socket).take();
        self.stop_heartbeat();
        self.close_channels();
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Websocket client multiplexing channel subscriptions over one connection
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    pub fn new(url: &str, key: &str) -> Self {
        Self::new_with_options(url, key, RealtimeClientOptions::default())
    }

    pub fn new_with_options(url: &str, key: &str, options: RealtimeClientOptions) -> Self {
        Self {
            shared: Arc::new(Shared::new(url, key, options)),
        }
    }

    /// Token sent with channel joins so row-level security applies. A new
    /// token is also pushed to every channel already joined.
    pub fn set_auth(&self, token: Option<String>) {
        info!("setting realtime auth token (is_some: {})", token.is_some());
        *lock(&self.shared.access_token) = token.clone();
        if let Some(token) = token {
            self.shared.push_access_token(&token);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_change.subscribe()
    }

    /// `ws(s)://host/realtime/v1/websocket?apikey=...&vsn=1.0.0`
    pub fn websocket_url(&self) -> Result<Url, RealtimeError> {
        self.shared.websocket_url()
    }

    /// Open the socket if it is not already open
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let _guard = self.shared.connect_lock.lock().await;
        self.shared.manually_closed.store(false, Ordering::SeqCst);
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        if let Err(e) = self.shared.open().await {
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    /// Join a `postgres_changes` channel and wait for the server to accept it
    pub async fn subscribe(
        &self,
        changes: PostgresChanges,
    ) -> Result<(Subscription, mpsc::Receiver<Change>), RealtimeError> {
        self.connect().await?;

        let topic = changes.topic();
        let config = changes.to_config();
        let (sender, receiver) = mpsc::channel(self.shared.options.channel_capacity.max(1));
        {
            let mut channels = lock(&self.shared.channels);
            if channels.contains_key(&topic) {
                return Err(RealtimeError::SubscriptionError(format!(
                    "already subscribed to {}",
                    topic
                )));
            }
            channels.insert(
                topic.clone(),
                ChannelSlot {
                    table: changes.table().to_string(),
                    event: changes.event_filter(),
                    config: config.clone(),
                    sender,
                },
            );
        }

        let joined = match self.shared.send_join(&topic, &config) {
            Ok((join_ref, reply)) => self.shared.await_join(&topic, &join_ref, reply).await,
            Err(e) => Err(e),
        };

        match joined {
            Ok(()) => {
                info!(%topic, table = %changes.table(), "subscribed to row changes");
                Ok((Subscription::new(self.shared.clone(), topic), receiver))
            }
            Err(e) => {
                self.shared.remove_channel(&topic);
                Err(e)
            }
        }
    }

    /// Topics with a live subscription
    pub fn active_topics(&self) -> Vec<String> {
        lock(&self.shared.channels).keys().cloned().collect()
    }

    /// Close the socket without reconnecting; every subscription's receiver ends
    pub fn disconnect(&self) {
        info!("disconnecting realtime socket");
        self.shared.shutdown();
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
