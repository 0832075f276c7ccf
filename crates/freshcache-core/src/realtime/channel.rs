use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{auth_handshake, EventKind, InboundEvent};
use super::router::EventRouter;
use super::transport::{PushConnection, PushTransport};
use crate::cache::CacheStore;
use crate::notifications::{
    Notification, NotificationAction, NotificationCategory, NotificationPriority, NotificationSink,
};
use crate::session::SessionData;

const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_REFETCH_INTERVAL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub url: Option<String>,
    /// Fixed wait between reconnect attempts.
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Period of the safety-net refetch of high-value keys.
    pub refetch_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            refetch_interval_ms: DEFAULT_REFETCH_INTERVAL_MS,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn refetch_interval(&self) -> Duration {
        Duration::from_millis(self.refetch_interval_ms)
    }
}

pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Returned by [`RealTimeChannel::on`]; pass to `off` to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

struct Listener {
    token: u64,
    kind: EventKind,
    handler: EventHandler,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ChannelInner {
    config: ChannelConfig,
    transport: Arc<dyn PushTransport>,
    cache: CacheStore,
    router: EventRouter,
    sink: Option<Arc<dyn NotificationSink>>,
    session: Mutex<Option<SessionData>>,
    state: watch::Sender<ChannelState>,
    reconnect_attempt: AtomicU32,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    run: Mutex<Option<RunHandle>>,
}

pub struct RealTimeChannelBuilder {
    config: ChannelConfig,
    transport: Arc<dyn PushTransport>,
    cache: CacheStore,
    router: EventRouter,
    sink: Option<Arc<dyn NotificationSink>>,
    session: Option<SessionData>,
}

impl RealTimeChannelBuilder {
    pub fn router(mut self, router: EventRouter) -> Self {
        self.router = router;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn session(mut self, session: SessionData) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> RealTimeChannel {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        RealTimeChannel {
            inner: Arc::new(ChannelInner {
                config: self.config,
                transport: self.transport,
                cache: self.cache,
                router: self.router,
                sink: self.sink,
                session: Mutex::new(self.session),
                state,
                reconnect_attempt: AtomicU32::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                run: Mutex::new(None),
            }),
        }
    }
}

/// Long-lived push connection that turns server events into cache
/// invalidations and notifications.
///
/// State machine: `Disconnected -> Connecting -> Open`; an unexpected close
/// goes through `Reconnecting` and back to `Connecting` after a fixed
/// `reconnect_interval`. The attempt counter resets only on a successful
/// open. Once `max_reconnect_attempts` reconnects have failed the channel
/// stays `Disconnected` until `connect()` is called again.
/// Clone is cheap - clones share the same connection.
#[derive(Clone)]
pub struct RealTimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealTimeChannel {
    pub fn builder(
        config: ChannelConfig,
        transport: Arc<dyn PushTransport>,
        cache: CacheStore,
    ) -> RealTimeChannelBuilder {
        RealTimeChannelBuilder {
            config,
            transport,
            cache,
            router: EventRouter::default(),
            sink: None,
            session: None,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempt.load(Ordering::SeqCst)
    }

    pub fn set_session(&self, session: Option<SessionData>) {
        *self.inner.session.lock() = session;
    }

    fn active_session(&self) -> Option<SessionData> {
        self.inner
            .session
            .lock()
            .clone()
            .filter(|session| !session.is_expired())
    }

    /// Register a handler for one kind of event. Handlers run after the
    /// event was routed into the cache.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerToken
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let token = self.inner.next_listener.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.listeners.lock().push(Listener {
            token,
            kind,
            handler: Arc::new(handler),
        });
        ListenerToken(token)
    }

    pub fn off(&self, token: ListenerToken) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.token != token.0);
        listeners.len() != before
    }

    /// Start the connection task. Does nothing (returns false) unless the
    /// channel is enabled, a non-expired session is set, and no connection
    /// task is already running. Must be called inside a tokio runtime.
    pub fn connect(&self) -> bool {
        if !self.inner.config.enabled {
            debug!("Real-time channel disabled");
            return false;
        }
        if self.active_session().is_none() {
            debug!("No valid session, not connecting");
            return false;
        }

        let mut run = self.inner.run.lock();
        if let Some(existing) = run.as_ref() {
            if !existing.task.is_finished() {
                return false;
            }
        }
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.run_loop(token).await });
        *run = Some(RunHandle { cancel, task });
        true
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let run = self.inner.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.task.await {
                warn!(error = %e, "Real-time task ended abnormally");
            }
        }
        self.set_state(ChannelState::Disconnected);
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Channel state changed");
        }
    }

    async fn run_loop(self, cancel: CancellationToken) {
        let inner = &self.inner;
        let max_attempts = inner.config.max_reconnect_attempts;
        let interval = inner.config.reconnect_interval();

        loop {
            let Some(session) = self.active_session() else {
                info!("Session ended, real-time channel stopping");
                break;
            };

            self.set_state(ChannelState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = inner.transport.connect() => result,
            };

            match connected {
                Ok(mut conn) => {
                    let handshake = auth_handshake(&session.token, session.user_id).to_string();
                    match conn.send_text(handshake).await {
                        Ok(()) => {
                            inner.reconnect_attempt.store(0, Ordering::SeqCst);
                            self.set_state(ChannelState::Open);
                            info!(user_id = session.user_id, "Real-time channel open");

                            if self.pump(conn.as_mut(), &cancel).await {
                                conn.close().await;
                                break;
                            }
                            warn!("Real-time channel closed unexpectedly");
                        }
                        Err(e) => warn!(error = %e, "Handshake failed"),
                    }
                }
                Err(e) => warn!(
                    error = %e,
                    attempt = inner.reconnect_attempt.load(Ordering::SeqCst),
                    "Real-time connect failed"
                ),
            }

            let attempt = inner.reconnect_attempt.load(Ordering::SeqCst);
            if attempt >= max_attempts {
                self.set_state(ChannelState::Disconnected);
                error!(attempts = attempt, "Real-time channel gave up reconnecting");
                if let Some(sink) = &inner.sink {
                    sink.add_notification(
                        Notification::error(
                            "Connection lost",
                            format!(
                                "Live updates stopped after {} reconnect attempts. \
                                 Reconnect to resume.",
                                attempt
                            ),
                        )
                        .with_priority(NotificationPriority::Urgent)
                        .with_category(NotificationCategory::System)
                        .persistent()
                        .with_action(NotificationAction::Reconnect),
                    );
                }
                return;
            }

            let attempt = inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_state(ChannelState::Reconnecting);
            warn!(
                attempt,
                max_attempts,
                delay_ms = interval.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.set_state(ChannelState::Disconnected);
    }

    /// Read frames until the connection ends. True when stopped by `cancel`.
    async fn pump(&self, conn: &mut dyn PushConnection, cancel: &CancellationToken) -> bool {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return true,
                frame = conn.next_text() => frame,
            };
            match frame {
                Some(Ok(text)) => self.dispatch(&text),
                Some(Err(e)) => {
                    warn!(error = %e, "Real-time channel error");
                    return false;
                }
                None => return false,
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let inner = &self.inner;
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed push frame");
                return;
            }
        };

        let user_id = inner.session.lock().as_ref().map(|s| s.user_id);
        let outcome = inner
            .router
            .route_event(&event, user_id, &inner.cache, inner.sink.as_deref());
        if outcome.dropped {
            return;
        }

        let kind = event.kind();
        let handlers: Vec<EventHandler> = inner
            .listeners
            .lock()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.handler.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::notifications::MemorySink;
    use crate::query_key;
    use futures::future::{BoxFuture, FutureExt};
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    enum Script {
        Fail,
        /// Deliver frames, then either stay open or close.
        Open { frames: Vec<String>, hold: bool },
    }

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        connects: AtomicU32,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }

        fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    struct ScriptedConnection {
        frames: VecDeque<String>,
        hold: bool,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl PushTransport for ScriptedTransport {
        fn connect(&self) -> BoxFuture<'_, Result<Box<dyn PushConnection>, ApiError>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front().unwrap_or(Script::Fail);
            let result: Result<Box<dyn PushConnection>, ApiError> = match script {
                Script::Fail => Err(ApiError::Channel("refused".into())),
                Script::Open { frames, hold } => Ok(Box::new(ScriptedConnection {
                    frames: frames.into(),
                    hold,
                    sent: self.sent.clone(),
                })),
            };
            futures::future::ready(result).boxed()
        }
    }

    impl PushConnection for ScriptedConnection {
        fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ApiError>> {
            self.sent.lock().push(text);
            futures::future::ready(Ok(())).boxed()
        }

        fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ApiError>>> {
            async move {
                if let Some(frame) = self.frames.pop_front() {
                    return Some(Ok(frame));
                }
                if self.hold {
                    futures::future::pending::<()>().await;
                }
                None
            }
            .boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            futures::future::ready(()).boxed()
        }
    }

    fn enabled(max_reconnect_attempts: u32) -> ChannelConfig {
        ChannelConfig {
            enabled: true,
            url: Some("ws://localhost/ws".into()),
            reconnect_interval_ms: 1000,
            max_reconnect_attempts,
            ..Default::default()
        }
    }

    fn channel(
        config: ChannelConfig,
        transport: Arc<ScriptedTransport>,
        cache: &CacheStore,
        sink: Arc<MemorySink>,
    ) -> RealTimeChannel {
        RealTimeChannel::builder(config, transport, cache.clone())
            .sink(sink)
            .session(SessionData::new("secret", 7))
            .build()
    }

    fn open(frames: &[Value], hold: bool) -> Script {
        Script::Open {
            frames: frames.iter().map(|f| f.to_string()).collect(),
            hold,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_enabled_and_session() {
        let transport = ScriptedTransport::new(vec![]);
        let cache = CacheStore::new();

        let disabled =
            RealTimeChannel::builder(ChannelConfig::default(), transport.clone(), cache.clone())
                .session(SessionData::new("t", 1))
                .build();
        assert!(!disabled.connect());

        let anonymous =
            RealTimeChannel::builder(enabled(3), transport.clone(), cache.clone()).build();
        assert!(!anonymous.connect());

        let lapsed = chrono::Utc::now() - chrono::Duration::minutes(1);
        let expired = RealTimeChannel::builder(enabled(3), transport.clone(), cache)
            .session(SessionData::new("t", 1).with_expiry(lapsed))
            .build();
        assert!(!expired.connect());

        settle().await;
        assert_eq!(transport.connects(), 0);
        assert_eq!(anonymous.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sends_handshake_and_routes_quiz_created() {
        let transport = ScriptedTransport::new(vec![open(
            &[json!({
                "type": "data_update",
                "payload": {"entity": "quiz", "action": "created", "id": 42}
            })],
            true,
        )]);
        let cache = CacheStore::new();
        cache.set(query_key!["quizzes"], json!([]));
        cache.set(query_key!["quiz", 42], json!({"title": "old"}));
        let sink = Arc::new(MemorySink::new());
        let channel = channel(enabled(3), transport.clone(), &cache, sink.clone());

        assert!(channel.connect());
        settle().await;

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.reconnect_attempt(), 0);
        let sent = transport.sent.lock().clone();
        let handshake: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(handshake, json!({"type": "auth", "payload": {"token": "secret", "userId": 7}}));
        assert!(cache.is_stale(&query_key!["quizzes"]));
        assert!(cache.is_stale(&query_key!["quiz", 42]));
        let notes = sink.drain();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].category, NotificationCategory::Quiz);

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_reconnect_attempts() {
        let transport = ScriptedTransport::new(vec![]);
        let sink = Arc::new(MemorySink::new());
        let channel = channel(enabled(3), transport.clone(), &CacheStore::new(), sink.clone());

        channel.connect();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(transport.connects(), 3);
        assert_eq!(channel.reconnect_attempt(), 3);
        assert_eq!(channel.state(), ChannelState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connects(), 4);
        assert_eq!(channel.reconnect_attempt(), 3);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let notes = sink.drain();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].persistent);
        assert_eq!(notes[0].priority, NotificationPriority::Urgent);
        assert_eq!(notes[0].actions, vec![NotificationAction::Reconnect]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_attempts() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail,
            open(&[], false),
            open(&[], true),
        ]);
        let channel = channel(
            enabled(3),
            transport.clone(),
            &CacheStore::new(),
            Arc::new(MemorySink::new()),
        );

        channel.connect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(channel.reconnect_attempt(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        // Opened at 1000ms, closed right away, waiting to reconnect.
        assert_eq!(channel.reconnect_attempt(), 1);
        assert_eq!(channel.state(), ChannelState::Reconnecting);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.connects(), 3);
        assert_eq!(channel.reconnect_attempt(), 0);
        assert_eq!(channel.state(), ChannelState::Open);
        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_after_exhaustion_gets_one_attempt() {
        let transport = ScriptedTransport::new(vec![]);
        let sink = Arc::new(MemorySink::new());
        let channel = channel(enabled(1), transport.clone(), &CacheStore::new(), sink.clone());

        channel.connect();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        assert!(channel.connect());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connects(), 3);
        assert_eq!(channel.reconnect_attempt(), 1);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_by_kind_and_removal() {
        let frames = [
            json!({"type": "notification", "payload": {"title": "Hello", "message": "World"}}),
            json!({"type": "user_activity", "payload": {"userId": 3}}),
            json!({
                "type": "data_update",
                "payload": {"entity": "quiz", "action": "deleted", "id": 1, "affectedUsers": [99]}
            }),
            json!({
                "type": "data_update",
                "payload": {"entity": "quiz", "action": "deleted", "id": 2}
            }),
        ];
        let transport = ScriptedTransport::new(vec![open(&frames, true)]);
        let sink = Arc::new(MemorySink::new());
        let channel = channel(enabled(3), transport, &CacheStore::new(), sink.clone());

        let updates = Arc::new(Mutex::new(Vec::new()));
        let recorder = updates.clone();
        channel.on(EventKind::DataUpdate, move |event| {
            if let InboundEvent::DataUpdate(update) = event {
                recorder.lock().push(update.id.clone());
            }
        });
        let activity = Arc::new(AtomicU32::new(0));
        let counter = activity.clone();
        let token = channel.on(EventKind::UserActivity, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(channel.off(token));
        assert!(!channel.off(token));

        channel.connect();
        settle().await;

        assert_eq!(*updates.lock(), vec![crate::cache::KeyPart::Int(2)]);
        assert_eq!(activity.load(Ordering::SeqCst), 0);
        assert_eq!(sink.drain()[0].title, "Hello");
        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_keeps_channel_open() {
        let transport = ScriptedTransport::new(vec![Script::Open {
            frames: vec!["not json".into()],
            hold: true,
        }]);
        let channel = channel(
            enabled(3),
            transport.clone(),
            &CacheStore::new(),
            Arc::new(MemorySink::new()),
        );

        channel.connect();
        settle().await;

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(transport.connects(), 1);
        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnecting() {
        let transport = ScriptedTransport::new(vec![]);
        let channel = channel(
            enabled(5),
            transport.clone(),
            &CacheStore::new(),
            Arc::new(MemorySink::new()),
        );

        channel.connect();
        settle().await;
        assert_eq!(channel.state(), ChannelState::Reconnecting);

        channel.disconnect().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
