//! Connection lifecycle state machine.
//!
//! `Lifecycle` owns no sockets or timers. Each transition returns the
//! [`Action`]s a driver must perform, which keeps the reconnect and heartbeat
//! rules testable without a network or a clock.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use url::Url;

use crate::config::Endpoint;
use crate::retry::{ReconnectPolicy, RetryState};

/// Where the connection currently stands.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connection and nothing scheduled.
    #[default]
    Idle,
    /// A handshake is in flight.
    Connecting,
    /// The socket is open and the heartbeat is running.
    Open,
    /// Waiting for the reconnect timer.
    Scheduling,
}

/// Timers owned by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timer {
    Reconnect,
    Heartbeat,
}

/// Side effect requested by a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Drop any current socket or handshake, then dial `Url`.
    Open(Url),
    /// Drop the current socket or handshake.
    Close,
    StartHeartbeat,
    StopHeartbeat,
    /// Send the liveness probe on the open socket.
    SendProbe,
    ScheduleReconnect(Duration),
    CancelReconnect,
}

#[derive(Debug)]
pub struct Lifecycle {
    endpoint: Endpoint,
    policy: ReconnectPolicy,
    state: ConnectionState,
    credential: Option<SecretString>,
    retry: RetryState,
    heartbeat_active: bool,
    reconnect_pending: bool,
}

impl Lifecycle {
    pub fn new(endpoint: Endpoint, policy: ReconnectPolicy) -> Self {
        Self {
            endpoint,
            policy,
            state: ConnectionState::Idle,
            credential: None,
            retry: RetryState::default(),
            heartbeat_active: false,
            reconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.retry.attempts()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn is_heartbeat_active(&self) -> bool {
        self.heartbeat_active
    }

    /// Caller asked for a connection with `credential`.
    ///
    /// A no-op while already open (or dialing) with the same credential. A
    /// different credential replaces the current connection. Starting from
    /// `Idle` begins a fresh retry streak.
    pub fn connect(&mut self, credential: SecretString) -> Vec<Action> {
        let same_credential = self
            .credential
            .as_ref()
            .is_some_and(|held| held.expose_secret() == credential.expose_secret());
        if same_credential
            && matches!(self.state, ConnectionState::Open | ConnectionState::Connecting)
        {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.cancel_reconnect(&mut actions);
        self.stop_heartbeat(&mut actions);
        if self.state == ConnectionState::Idle {
            self.retry.reset();
        }

        let url = self.endpoint.url_for(&credential);
        self.credential = Some(credential);
        self.state = ConnectionState::Connecting;
        info!(
            event = "realtime_connecting",
            host = %self.endpoint.authority(),
            attempt = self.retry.attempts()
        );
        actions.push(Action::Open(url));
        actions
    }

    /// Caller asked to stop. Idempotent.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, ConnectionState::Open | ConnectionState::Connecting) {
            actions.push(Action::Close);
        }
        self.stop_heartbeat(&mut actions);
        self.cancel_reconnect(&mut actions);

        if self.state != ConnectionState::Idle || self.credential.is_some() {
            info!(event = "realtime_disconnected");
        }
        self.credential = None;
        self.retry.reset();
        self.state = ConnectionState::Idle;
        actions
    }

    /// The handshake finished.
    pub fn on_open(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.retry.reset();
        self.cancel_reconnect(&mut actions);
        self.stop_heartbeat(&mut actions);
        self.state = ConnectionState::Open;
        self.heartbeat_active = true;
        info!(event = "realtime_connected", host = %self.endpoint.authority());
        actions.push(Action::StartHeartbeat);
        actions
    }

    /// The socket closed or the handshake failed without the caller asking.
    pub fn on_close(&mut self) -> Vec<Action> {
        if !matches!(self.state, ConnectionState::Open | ConnectionState::Connecting) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.stop_heartbeat(&mut actions);

        if self.credential.is_none() {
            self.state = ConnectionState::Idle;
            return actions;
        }

        match self.retry.next_delay(&self.policy) {
            Some(delay) => {
                info!(
                    event = "realtime_reconnect_scheduled",
                    attempt = self.retry.attempts(),
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                self.state = ConnectionState::Scheduling;
                self.reconnect_pending = true;
                actions.push(Action::ScheduleReconnect(delay));
            }
            None => {
                self.state = ConnectionState::Idle;
            }
        }
        actions
    }

    pub fn on_timer_fire(&mut self, timer: Timer) -> Vec<Action> {
        match timer {
            Timer::Reconnect => self.on_reconnect_timer(),
            Timer::Heartbeat => self.on_heartbeat_timer(),
        }
    }

    fn on_reconnect_timer(&mut self) -> Vec<Action> {
        if !self.reconnect_pending || self.state != ConnectionState::Scheduling {
            return Vec::new();
        }
        self.reconnect_pending = false;

        let Some(credential) = self.credential.as_ref() else {
            self.state = ConnectionState::Idle;
            return Vec::new();
        };
        let url = self.endpoint.url_for(credential);
        self.state = ConnectionState::Connecting;
        info!(
            event = "realtime_connecting",
            host = %self.endpoint.authority(),
            attempt = self.retry.attempts()
        );
        vec![Action::Open(url)]
    }

    fn on_heartbeat_timer(&mut self) -> Vec<Action> {
        if !self.heartbeat_active {
            return Vec::new();
        }
        if self.state == ConnectionState::Open {
            return vec![Action::SendProbe];
        }
        let mut actions = Vec::new();
        self.stop_heartbeat(&mut actions);
        actions
    }

    fn stop_heartbeat(&mut self, actions: &mut Vec<Action>) {
        if self.heartbeat_active {
            self.heartbeat_active = false;
            actions.push(Action::StopHeartbeat);
        }
    }

    fn cancel_reconnect(&mut self, actions: &mut Vec<Action>) {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
    }
}
