//! Public realtime client handle and the background connection worker.
//!
//! `RealtimeClient` methods never block and never fail: they enqueue a
//! command for the worker task, which owns the socket, the heartbeat and
//! reconnect timers, and the [`Lifecycle`] state machine.

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Endpoint, RealtimeClientOptions, API_BASE_URL_ENV, LOCAL_API_BASE_URL};
use crate::error::RealtimeError;
use crate::retry::with_timeout;
use crate::stream::lifecycle::{Action, ConnectionState, Lifecycle, Timer};
use crate::stream::proto::{Envelope, Topic, PING_FRAME};
use crate::stream::registry::{route_frame, Listener, ListenerRegistry, SharedRegistry};

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);
const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Connect(SecretString),
    Disconnect,
}

/// Handle to the realtime event stream.
///
/// Construct one at start-up and clone it into whatever needs to connect or
/// listen. The worker stops once every clone has been dropped.
#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    registry: SharedRegistry,
    state: watch::Receiver<ConnectionState>,
    /// Whether the caller currently wants a session. Written together with
    /// the command send so the flag always matches the last queued command.
    session_active: Arc<Mutex<bool>>,
}

impl RealtimeClient {
    /// Creates a client for the backend at `api_base` with default options.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(api_base: &str) -> Result<Self, RealtimeError> {
        Self::with_options(api_base, RealtimeClientOptions::default())
    }

    /// Creates a client for the locally running backend.
    pub fn local() -> Result<Self, RealtimeError> {
        Self::new(LOCAL_API_BASE_URL)
    }

    /// Creates a client for the API base named by `BOTDASH_API_BASE_URL`,
    /// falling back to the local backend when unset.
    pub fn from_env() -> Result<Self, RealtimeError> {
        match std::env::var(API_BASE_URL_ENV) {
            Ok(api_base) if !api_base.trim().is_empty() => Self::new(&api_base),
            _ => Self::local(),
        }
    }

    pub fn with_options(
        api_base: &str,
        options: RealtimeClientOptions,
    ) -> Result<Self, RealtimeError> {
        let endpoint = Endpoint::parse(api_base)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let registry: SharedRegistry = Arc::new(RwLock::new(ListenerRegistry::default()));

        let worker = ConnectionWorker {
            lifecycle: Lifecycle::new(endpoint, options.reconnect_policy.clone()),
            options,
            registry: Arc::clone(&registry),
            state_tx,
            io: WorkerIo::default(),
        };
        runtime.spawn(worker.run(command_rx));

        Ok(Self {
            commands: command_tx,
            registry,
            state: state_rx,
            session_active: Arc::new(Mutex::new(false)),
        })
    }

    /// Opens the stream with `credential` unless it is already open with it.
    ///
    /// Returns immediately; the handshake and any later reconnects happen in
    /// the background and reuse this credential.
    pub fn connect(&self, credential: SecretString) {
        self.request_session(true, Command::Connect(credential));
    }

    /// Closes the stream, cancels pending reconnects and forgets the
    /// credential. Idempotent.
    pub fn disconnect(&self) {
        self.request_session(false, Command::Disconnect);
    }

    /// True only while the socket is fully open and no disconnect has been
    /// requested since.
    pub fn is_connected(&self) -> bool {
        *self
            .session_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            && self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every lifecycle transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Registers `listener` for messages whose `type` equals `topic`, or for
    /// every message when `topic` is `"all"`.
    pub fn on(&self, topic: &str, listener: Listener) {
        let inserted = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic, listener);
        debug!(event = "listener_registered", topic, duplicate = !inserted);
    }

    /// Removes a previously registered listener; no-op if absent.
    pub fn off(&self, topic: &str, listener: &Listener) {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic, listener);
        debug!(event = "listener_unregistered", topic, removed);
    }

    /// Registers a closure and returns its handle for a later [`Self::off`].
    pub fn listen<F>(&self, topic: &str, callback: F) -> Listener
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let listener = Listener::new(callback);
        self.on(topic, listener.clone());
        listener
    }

    /// Registers a handler for a typed topic such as
    /// [`KillSwitchTopic`](crate::stream::proto::KillSwitchTopic).
    ///
    /// Unregister with `off(T::NAME, &listener)`.
    pub fn on_event<T, F>(&self, handler: F) -> Listener
    where
        T: Topic + 'static,
        F: Fn(T::Payload) + Send + Sync + 'static,
    {
        let listener = Listener::typed::<T, F>(handler);
        self.on(T::NAME, listener.clone());
        listener
    }

    fn request_session(&self, active: bool, command: Command) {
        let mut session_active = self
            .session_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *session_active = active;
        if self.commands.send(command).is_err() {
            warn!(event = "realtime_worker_stopped");
        }
    }
}

#[derive(Default)]
struct WorkerIo {
    socket: Option<WsStream>,
    handshake: Option<JoinHandle<Result<WsStream, RealtimeError>>>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

enum Input {
    Command(Command),
    Handshake(Result<Result<WsStream, RealtimeError>, JoinError>),
    Frame(Option<Result<Message, WsError>>),
    Timer(Timer),
}

struct ConnectionWorker {
    lifecycle: Lifecycle,
    options: RealtimeClientOptions,
    registry: SharedRegistry,
    state_tx: watch::Sender<ConnectionState>,
    io: WorkerIo,
}

impl ConnectionWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // Commands go first so a disconnect beats any timer that is
            // already due.
            let input = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => break,
                },
                result = next_handshake(&mut self.io.handshake) => Input::Handshake(result),
                frame = next_frame(&mut self.io.socket) => Input::Frame(frame),
                _ = next_sleep(&mut self.io.reconnect) => Input::Timer(Timer::Reconnect),
                _ = next_tick(&mut self.io.heartbeat) => Input::Timer(Timer::Heartbeat),
            };

            let actions = self.handle_input(input).await;
            self.execute(actions).await;
            self.publish_state();
        }

        let actions = self.lifecycle.disconnect();
        self.execute(actions).await;
        self.publish_state();
        debug!(event = "realtime_worker_exited");
    }

    fn publish_state(&self) {
        let state = self.lifecycle.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn handle_input(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Command(Command::Connect(credential)) => self.lifecycle.connect(credential),
            Input::Command(Command::Disconnect) => self.lifecycle.disconnect(),
            Input::Handshake(result) => {
                self.io.handshake = None;
                match result {
                    Ok(Ok(socket)) => {
                        self.io.socket = Some(socket);
                        self.lifecycle.on_open()
                    }
                    Ok(Err(err)) => {
                        warn!(event = "realtime_connect_failed", error = %err);
                        self.lifecycle.on_close()
                    }
                    Err(err) => {
                        warn!(event = "realtime_connect_failed", error = %err);
                        self.lifecycle.on_close()
                    }
                }
            }
            Input::Frame(frame) => self.handle_frame(frame).await,
            Input::Timer(Timer::Reconnect) => {
                self.io.reconnect = None;
                self.lifecycle.on_timer_fire(Timer::Reconnect)
            }
            Input::Timer(Timer::Heartbeat) => self.lifecycle.on_timer_fire(Timer::Heartbeat),
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) -> Vec<Action> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                route_frame(&self.registry, &text);
                Vec::new()
            }
            Some(Ok(Message::Ping(payload))) => {
                let Some(socket) = self.io.socket.as_mut() else {
                    return Vec::new();
                };
                if let Err(err) = socket.send(Message::Pong(payload)).await {
                    warn!(event = "realtime_transport_error", error = %err);
                    return self.socket_lost();
                }
                Vec::new()
            }
            Some(Ok(Message::Close(frame))) => {
                match frame {
                    Some(frame) => info!(
                        event = "realtime_closed_by_server",
                        code = u16::from(frame.code),
                        reason = %frame.reason
                    ),
                    None => info!(event = "realtime_closed_by_server"),
                }
                self.socket_lost()
            }
            Some(Ok(_)) => Vec::new(),
            Some(Err(err)) => {
                warn!(event = "realtime_transport_error", error = %err);
                self.socket_lost()
            }
            None => {
                info!(event = "realtime_stream_ended");
                self.socket_lost()
            }
        }
    }

    fn socket_lost(&mut self) -> Vec<Action> {
        self.io.socket = None;
        self.lifecycle.on_close()
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Open(url) => {
                    self.teardown().await;
                    self.io.handshake = Some(tokio::spawn(open_socket(
                        url,
                        self.options.connect_timeout,
                    )));
                }
                Action::Close => self.teardown().await,
                Action::StartHeartbeat => {
                    self.io.heartbeat = Some(heartbeat_timer(self.options.heartbeat_interval));
                }
                Action::StopHeartbeat => self.io.heartbeat = None,
                Action::SendProbe => {
                    let Some(socket) = self.io.socket.as_mut() else {
                        continue;
                    };
                    match socket.send(Message::Text(PING_FRAME.to_string())).await {
                        Ok(()) => debug!(event = "liveness_probe_sent"),
                        Err(err) => {
                            warn!(event = "realtime_transport_error", error = %err);
                            queue.extend(self.socket_lost());
                        }
                    }
                }
                Action::ScheduleReconnect(delay) => {
                    self.io.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Action::CancelReconnect => self.io.reconnect = None,
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(handshake) = self.io.handshake.take() {
            handshake.abort();
        }
        if let Some(mut socket) = self.io.socket.take() {
            if with_timeout(CLOSE_GRACE, socket.close(None)).await.is_err() {
                debug!(event = "realtime_close_timed_out");
            }
        }
    }
}

/// Interval whose first tick lands one period from now.
fn heartbeat_timer(requested: Duration) -> Interval {
    let period = requested.clamp(MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL);
    let now = Instant::now();
    let start = now.checked_add(period).unwrap_or(now);
    let mut heartbeat = interval_at(start, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat
}

async fn open_socket(url: Url, timeout: Duration) -> Result<WsStream, RealtimeError> {
    let (socket, _) = with_timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| RealtimeError::ConnectTimeout(timeout))??;
    Ok(socket)
}

async fn next_handshake<T>(handshake: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handshake {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket {
        Some(socket) => socket.next().await,
        None => pending().await,
    }
}

async fn next_sleep(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, PoisonError, RwLock};
    use std::thread;
    use std::time::Duration;

    use secrecy::SecretString;
    use tokio::sync::{mpsc, watch};

    use super::{
        heartbeat_timer, Command, RealtimeClient, MAX_HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL,
    };
    use crate::error::RealtimeError;
    use crate::stream::lifecycle::ConnectionState;
    use crate::stream::registry::ListenerRegistry;

    fn detached_client() -> (RealtimeClient, mpsc::UnboundedReceiver<Command>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (_state_tx, state) = watch::channel(ConnectionState::Idle);
        let client = RealtimeClient {
            commands,
            registry: Arc::new(RwLock::new(ListenerRegistry::default())),
            state,
            session_active: Arc::new(Mutex::new(false)),
        };
        (client, command_rx)
    }

    #[tokio::test]
    async fn heartbeat_period_is_clamped_at_both_ends() {
        assert_eq!(heartbeat_timer(Duration::MAX).period(), MAX_HEARTBEAT_INTERVAL);
        assert_eq!(heartbeat_timer(Duration::ZERO).period(), MIN_HEARTBEAT_INTERVAL);
        assert_eq!(
            heartbeat_timer(Duration::from_secs(30)).period(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn session_flag_matches_last_queued_command_under_contention() {
        let (client, mut command_rx) = detached_client();

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let client = client.clone();
                thread::spawn(move || {
                    for round in 0..200 {
                        if (worker + round) % 2 == 0 {
                            client.connect(SecretString::new("tok1".to_string()));
                        } else {
                            client.disconnect();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }

        let mut last_was_connect = None;
        while let Ok(command) = command_rx.try_recv() {
            last_was_connect = Some(matches!(command, Command::Connect(_)));
        }
        let session_active = *client
            .session_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert_eq!(last_was_connect, Some(session_active));
    }

    #[test]
    fn construction_outside_runtime_is_rejected() {
        let result = RealtimeClient::local();
        assert!(matches!(result, Err(RealtimeError::NoRuntime)));
    }

    #[test]
    fn invalid_base_is_rejected_before_spawning() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            assert!(matches!(
                RealtimeClient::new("mailto:ops@example.com"),
                Err(RealtimeError::UnsupportedScheme(_))
            ));
        });
    }

    #[tokio::test]
    async fn fresh_client_is_idle_and_disconnect_is_harmless() {
        let client = RealtimeClient::local().expect("client");
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.is_connected());

        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_clears_connected_flag_immediately() {
        let client = RealtimeClient::local().expect("client");
        client.connect(SecretString::new("tok1".to_string()));
        client.disconnect();
        assert!(!client.is_connected());
    }
}
