//! Persistent push-channel connection.
//!
//! [`SignalConnection`] owns at most one live [`Channel`] at a time. It runs
//! a ping/pong keepalive on top of the channel and hands connect results and
//! disconnects to a pluggable [`ReconnectStrategy`].
//!
//! Keepalive cycle:
//!
//! 1. After connecting, a PING is scheduled `ping_interval` out.
//! 2. When it fires, PING is written and a PONG timeout is armed.
//! 3. A PONG cancels the timeout and schedules the next PING.
//! 4. A PONG timeout forces a network-caused disconnect.
//!
//! A reverse PING from the peer is answered with a long-form PONG and leaves
//! the local schedule alone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::{EventBus, ObservableFuture, TetherError, TetherResult};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::channel::{Channel, ChannelFactory};
use crate::codec::{CommandCodec, InboundFrame, JsonLineCodec, OutboundFrame};
use crate::command::{Command, PingPongCommand};
use crate::config::ConnectionConfig;
use crate::reconnect::{NoReconnect, ReconnectStrategy};

/// Keepalive lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingEvent {
    /// A PING was scheduled.
    PingScheduled,
    /// A PING was written.
    PingSent,
    /// A scheduled PING was cancelled before firing.
    PingCancelled,
    /// A pending PONG wait was cancelled.
    PongCancelled,
    /// No PONG arrived in time.
    PongTimeout,
    /// A PONG arrived.
    PongReceived,
}

/// Published after a channel is torn down.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    /// The channel that went away.
    pub handle: ConnectionHandle,
    /// Whether the network (rather than the caller) caused it.
    pub network: bool,
}

/// Event buses exposed by a [`SignalConnection`].
#[derive(Debug, Default)]
pub struct ConnectionEvents {
    /// Connect attempt settled; `true` if a channel is now live.
    pub connect: EventBus<bool>,
    /// Channel torn down.
    pub disconnect: EventBus<DisconnectEvent>,
    /// Decoded command received.
    pub receive: EventBus<Command>,
    /// Non-fatal transport or codec problem.
    pub exception: EventBus<String>,
    /// Keepalive lifecycle.
    pub ping: EventBus<PingEvent>,
}

struct Timer {
    seq: u64,
    task: JoinHandle<()>,
}

struct ActiveChannel {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    next_message_id: u64,
}

struct LinkState {
    active: Option<ActiveChannel>,
    connecting: bool,
    connect_epoch: u64,
    keepalives: bool,
    ping: Option<Timer>,
    pong: Option<Timer>,
    timer_seq: u64,
}

struct ConnectionInner {
    config: ConnectionConfig,
    factory: Arc<dyn ChannelFactory>,
    codec: Arc<dyn CommandCodec>,
    runtime: Handle,
    events: ConnectionEvents,
    strategy: Mutex<Arc<dyn ReconnectStrategy>>,
    state: Mutex<LinkState>,
    generations: AtomicU64,
}

/// Builder for [`SignalConnection`].
pub struct ConnectionBuilder {
    factory: Arc<dyn ChannelFactory>,
    config: ConnectionConfig,
    codec: Option<Arc<dyn CommandCodec>>,
    strategy: Arc<dyn ReconnectStrategy>,
    runtime: Option<Handle>,
}

impl ConnectionBuilder {
    /// Set the connection configuration.
    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`JsonLineCodec`].
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn CommandCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set the reconnection policy (default: [`NoReconnect`]).
    #[must_use]
    pub fn reconnect_strategy(mut self, strategy: Arc<dyn ReconnectStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Spawn connection tasks on `runtime` instead of the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the connection.
    ///
    /// # Errors
    /// Returns [`TetherError::Rejected`] when no runtime was given and none is current.
    pub fn build(self) -> TetherResult<SignalConnection> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| TetherError::Rejected(format!("no tokio runtime: {e}")))?,
        };
        let codec = self.codec.unwrap_or_else(|| {
            Arc::new(JsonLineCodec::new().with_max_frame_size(self.config.max_frame_size))
        });
        let keepalives = self.config.keepalives;
        Ok(SignalConnection {
            inner: Arc::new(ConnectionInner {
                config: self.config,
                factory: self.factory,
                codec,
                runtime,
                events: ConnectionEvents::default(),
                strategy: Mutex::new(self.strategy),
                state: Mutex::new(LinkState {
                    active: None,
                    connecting: false,
                    connect_epoch: 0,
                    keepalives,
                    ping: None,
                    pong: None,
                    timer_seq: 0,
                }),
                generations: AtomicU64::new(0),
            }),
        })
    }
}

/// Persistent connection with keepalive and a reconnection policy.
///
/// Cheap to clone; clones share the same channel.
#[derive(Clone)]
pub struct SignalConnection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning reference to a [`SignalConnection`].
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    /// Upgrade if the connection is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<SignalConnection> {
        self.inner.upgrade().map(|inner| SignalConnection { inner })
    }
}

impl fmt::Debug for SignalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalConnection")
            .field("endpoint", &self.inner.factory.describe())
            .field("connected", &self.is_connected())
            .field("connecting", &self.is_connecting())
            .finish_non_exhaustive()
    }
}

impl SignalConnection {
    /// Start building a connection over `factory`.
    #[must_use]
    pub fn builder(factory: Arc<dyn ChannelFactory>) -> ConnectionBuilder {
        ConnectionBuilder {
            factory,
            config: ConnectionConfig::default(),
            codec: None,
            strategy: Arc::new(NoReconnect),
            runtime: None,
        }
    }

    /// Create a non-owning reference.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Runtime the connection spawns its tasks on.
    #[must_use]
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Connection configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Event buses.
    #[must_use]
    pub fn events(&self) -> &ConnectionEvents {
        &self.inner.events
    }

    /// Whether a channel is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    /// Whether a connect attempt is in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().connecting
    }

    /// Handle of the live channel, if any.
    #[must_use]
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        let generation = self.inner.state.lock().active.as_ref()?.generation;
        Some(self.handle_for(generation))
    }

    /// Whether keepalives run while connected.
    #[must_use]
    pub fn keepalives_enabled(&self) -> bool {
        self.inner.state.lock().keepalives
    }

    /// Current reconnection policy.
    #[must_use]
    pub fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        Arc::clone(&self.inner.strategy.lock())
    }

    /// Swap the reconnection policy. The previous one is stopped.
    pub fn set_reconnect_strategy(&self, strategy: Arc<dyn ReconnectStrategy>) {
        let previous = std::mem::replace(&mut *self.inner.strategy.lock(), Arc::clone(&strategy));
        previous.stop();
        if self.is_connected() {
            strategy.start();
        }
    }

    /// Open a new channel.
    ///
    /// The returned future resolves to whether a channel is live once the
    /// handshake completes or the connect timeout elapses.
    ///
    /// # Errors
    /// Returns [`TetherError::ContractViolation`] if a channel is already live
    /// or another connect is in flight.
    pub fn connect(&self) -> TetherResult<ObservableFuture<bool>> {
        let epoch = {
            let mut state = self.inner.state.lock();
            if state.active.is_some() {
                return Err(TetherError::ContractViolation(
                    "connect() called while a channel is connected".into(),
                ));
            }
            if state.connecting {
                return Err(TetherError::ContractViolation(
                    "connect() called while a connect is in flight".into(),
                ));
            }
            state.connecting = true;
            state.connect_epoch += 1;
            state.connect_epoch
        };
        self.reconnect_strategy().start();

        let result = ObservableFuture::new();
        let future = result.clone();
        let weak = self.downgrade();
        let factory = Arc::clone(&self.inner.factory);
        let timeout = self.inner.config.connect_timeout();
        info!(endpoint = %factory.describe(), "connecting");

        self.inner.runtime.spawn(async move {
            let opened = tokio::time::timeout(timeout, factory.open()).await;
            let Some(connection) = weak.upgrade() else {
                result.set_success(false);
                return;
            };
            let connected = match opened {
                Ok(Ok(channel)) => connection.install(channel, epoch),
                Ok(Err(err)) => {
                    warn!(error = %err, "connect failed");
                    connection.inner.events.exception.publish(&err.to_string());
                    connection.abandon_connect(epoch);
                    false
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis(), "connect timed out");
                    connection
                        .inner
                        .events
                        .exception
                        .publish(&TetherError::Timeout(timeout).to_string());
                    connection.abandon_connect(epoch);
                    false
                }
            };
            connection.inner.events.connect.publish(&connected);
            connection.reconnect_strategy().on_connect_result(&connection, connected);
            result.set_success(connected);
        });
        Ok(future)
    }

    /// Tear down the live channel.
    ///
    /// A caller-initiated disconnect (`network == false`) stops the
    /// reconnection policy first. Returns the handle of the channel torn down.
    pub fn disconnect(&self, network: bool) -> Option<ConnectionHandle> {
        self.disconnect_generation(None, network)
    }

    /// Write an already-built frame.
    ///
    /// # Errors
    /// Returns a codec error for unencodable frames, or
    /// [`TetherError::Disconnected`] without a live channel.
    pub fn send(&self, frame: &OutboundFrame) -> TetherResult<()> {
        let raw = self.inner.codec.encode(frame)?;
        let state = self.inner.state.lock();
        let active = state
            .active
            .as_ref()
            .ok_or_else(|| TetherError::Disconnected("no active channel".into()))?;
        active
            .outbound
            .send(raw)
            .map_err(|_| TetherError::Disconnected("channel writer stopped".into()))
    }

    /// Write an application message, assigning the next message id.
    ///
    /// # Errors
    /// Same as [`send`](Self::send).
    pub fn send_message(&self, body: Value) -> TetherResult<u64> {
        let mut state = self.inner.state.lock();
        let active = state
            .active
            .as_mut()
            .ok_or_else(|| TetherError::Disconnected("no active channel".into()))?;
        let id = active.next_message_id + 1;
        let raw = self.inner.codec.encode(&OutboundFrame::Message { id, body })?;
        active
            .outbound
            .send(raw)
            .map_err(|_| TetherError::Disconnected("channel writer stopped".into()))?;
        active.next_message_id = id;
        Ok(id)
    }

    /// Cancel any pending PONG wait and send a PING now.
    pub fn keepalive(&self) {
        let events = {
            let mut state = self.inner.state.lock();
            let mut events = Self::cancel_pong_locked(&mut state);
            events.extend(self.schedule_ping_locked(&mut state, true));
            events
        };
        self.emit(events);
    }

    /// Enable keepalives and schedule the next PING.
    pub fn start_keepalives(&self) {
        let events = {
            let mut state = self.inner.state.lock();
            state.keepalives = true;
            self.schedule_ping_locked(&mut state, false)
        };
        self.emit(events);
    }

    /// Disable keepalives and cancel the scheduled PING.
    pub fn stop_keepalives(&self) {
        let events = {
            let mut state = self.inner.state.lock();
            state.keepalives = false;
            Self::cancel_ping_locked(&mut state)
        };
        self.emit(events);
    }

    fn handle_for(&self, generation: u64) -> ConnectionHandle {
        ConnectionHandle {
            generation,
            connection: Arc::downgrade(&self.inner),
        }
    }

    fn emit(&self, events: Vec<PingEvent>) {
        for event in events {
            self.inner.events.ping.publish(&event);
        }
    }

    fn abandon_connect(&self, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.connect_epoch == epoch {
            state.connecting = false;
        }
    }

    fn install(&self, channel: Channel, epoch: u64) -> bool {
        let Channel { mut sink, mut source } = channel;
        let mut state = self.inner.state.lock();
        if !state.connecting || state.connect_epoch != epoch {
            drop(state);
            debug!("connect superseded by disconnect, closing new channel");
            self.inner.runtime.spawn(async move {
                let _ = sink.close().await;
            });
            return false;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, mut queue) = mpsc::unbounded_channel::<String>();

        let weak = self.downgrade();
        self.inner.runtime.spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(err) = sink.send(frame).await {
                    if let Some(connection) = weak.upgrade() {
                        connection.channel_lost(generation, &err.to_string());
                    }
                    return;
                }
            }
            if let Err(err) = sink.close().await {
                debug!(generation, error = %err, "closing channel failed");
            }
        });

        let weak = self.downgrade();
        let reader = self.inner.runtime.spawn(async move {
            loop {
                let next = source.recv().await;
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                match next {
                    Some(Ok(frame)) => connection.handle_frame(generation, &frame),
                    Some(Err(TetherError::Codec(reason))) => {
                        warn!(generation, reason = %reason, "dropping unreadable frame");
                        connection.inner.events.exception.publish(&reason);
                    }
                    Some(Err(err)) => {
                        connection.channel_lost(generation, &err.to_string());
                        return;
                    }
                    None => {
                        connection.channel_lost(generation, "channel closed by peer");
                        return;
                    }
                }
            }
        });

        state.active = Some(ActiveChannel {
            generation,
            outbound,
            reader,
            next_message_id: 0,
        });
        state.connecting = false;
        let events = if state.keepalives {
            self.schedule_ping_locked(&mut state, false)
        } else {
            Vec::new()
        };
        drop(state);

        info!(generation, endpoint = %self.inner.factory.describe(), "channel connected");
        self.emit(events);
        true
    }

    #[instrument(skip(self, raw), fields(len = raw.len()))]
    fn handle_frame(&self, generation: u64, raw: &str) {
        if !self.is_generation_current(generation) {
            debug!("frame from stale channel ignored");
            return;
        }
        match self.inner.codec.decode(raw) {
            Ok(InboundFrame::PingPong(command)) => self.receive_ping_pong(generation, &command),
            Ok(InboundFrame::Command(command)) => {
                debug!(action = command.action(), "command received");
                self.inner.events.receive.publish(&command);
            }
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                self.inner.events.exception.publish(&err.to_string());
            }
        }
    }

    fn receive_ping_pong(&self, generation: u64, command: &PingPongCommand) {
        if command.request {
            debug!(generation, "answering reverse ping");
            if let Err(err) = self.send(&OutboundFrame::PingPong(command.reply())) {
                warn!(generation, error = %err, "failed to answer reverse ping");
            }
            return;
        }

        let events = {
            let mut state = self.inner.state.lock();
            let mut events = vec![PingEvent::PongReceived];
            events.extend(Self::cancel_pong_locked(&mut state));
            if state.keepalives {
                events.extend(self.schedule_ping_locked(&mut state, false));
            }
            events
        };
        self.emit(events);
    }

    fn is_generation_current(&self, generation: u64) -> bool {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn cancel_ping_locked(state: &mut LinkState) -> Vec<PingEvent> {
        state.ping.take().map_or_else(Vec::new, |timer| {
            timer.task.abort();
            vec![PingEvent::PingCancelled]
        })
    }

    fn cancel_pong_locked(state: &mut LinkState) -> Vec<PingEvent> {
        state.pong.take().map_or_else(Vec::new, |timer| {
            timer.task.abort();
            vec![PingEvent::PongCancelled]
        })
    }

    fn schedule_ping_locked(&self, state: &mut LinkState, now: bool) -> Vec<PingEvent> {
        let mut events = Self::cancel_ping_locked(state);
        let Some(generation) = state.active.as_ref().map(|active| active.generation) else {
            return events;
        };
        state.timer_seq += 1;
        let seq = state.timer_seq;
        let delay = if now {
            Duration::ZERO
        } else {
            self.inner.config.ping_interval()
        };
        let weak = self.downgrade();
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connection) = weak.upgrade() {
                connection.fire_ping(generation, seq);
            }
        });
        state.ping = Some(Timer { seq, task });
        events.push(PingEvent::PingScheduled);
        events
    }

    fn fire_ping(&self, generation: u64, seq: u64) {
        let events = {
            let mut state = self.inner.state.lock();
            if state.ping.as_ref().map(|timer| timer.seq) != Some(seq) {
                return;
            }
            state.ping = None;
            let Some(active) = state.active.as_ref().filter(|a| a.generation == generation) else {
                return;
            };
            let frame = match self
                .inner
                .codec
                .encode(&OutboundFrame::PingPong(PingPongCommand::ping()))
            {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "failed to encode ping");
                    return;
                }
            };
            if active.outbound.send(frame).is_err() {
                return;
            }
            let mut events = vec![PingEvent::PingSent];
            events.extend(Self::cancel_pong_locked(&mut state));

            state.timer_seq += 1;
            let pong_seq = state.timer_seq;
            let timeout = self.inner.config.pong_timeout();
            let weak = self.downgrade();
            let task = self.inner.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(connection) = weak.upgrade() {
                    connection.pong_timed_out(generation, pong_seq);
                }
            });
            state.pong = Some(Timer {
                seq: pong_seq,
                task,
            });
            events
        };
        debug!(generation, "ping sent");
        self.emit(events);
    }

    fn pong_timed_out(&self, generation: u64, seq: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.pong.as_ref().map(|timer| timer.seq) != Some(seq) {
                return;
            }
            state.pong = None;
        }
        warn!(generation, "pong not received in time, dropping channel");
        self.emit(vec![PingEvent::PongTimeout]);
        self.disconnect_generation(Some(generation), true);
    }

    fn channel_lost(&self, generation: u64, reason: &str) {
        if !self.is_generation_current(generation) {
            return;
        }
        warn!(generation, reason, "channel lost");
        self.inner.events.exception.publish(&reason.to_string());
        self.disconnect_generation(Some(generation), true);
    }

    fn disconnect_generation(&self, expected: Option<u64>, network: bool) -> Option<ConnectionHandle> {
        let (active, events) = {
            let mut state = self.inner.state.lock();
            let current = state.active.as_ref().map(|active| active.generation);
            if let Some(expected) = expected {
                if current != Some(expected) {
                    debug!(expected, current = ?current, "ignoring disconnect of stale channel");
                    return None;
                }
            }
            let mut events = Self::cancel_ping_locked(&mut state);
            events.extend(Self::cancel_pong_locked(&mut state));
            state.connecting = false;
            state.connect_epoch += 1;
            (state.active.take(), events)
        };
        if !network {
            self.reconnect_strategy().stop();
        }
        self.emit(events);

        let Some(active) = active else {
            debug!(network, "disconnect requested without a live channel");
            return None;
        };
        active.reader.abort();
        drop(active.outbound);

        let handle = self.handle_for(active.generation);
        info!(generation = active.generation, network, "channel disconnected");
        self.inner.events.disconnect.publish(&DisconnectEvent {
            handle: handle.clone(),
            network,
        });
        self.reconnect_strategy().on_disconnected(self, network);
        Some(handle)
    }
}

/// Identifies one lifetime of a transport channel.
///
/// Handles from an earlier channel stay valid values but no longer act on the
/// connection, which lets callbacks detect that they are stale.
#[derive(Clone)]
pub struct ConnectionHandle {
    generation: u64,
    connection: Weak<ConnectionInner>,
}

impl ConnectionHandle {
    /// A handle bound to no connection; never current.
    #[must_use]
    pub const fn detached(generation: u64) -> Self {
        Self {
            generation,
            connection: Weak::new(),
        }
    }

    /// Channel generation (1 for the first channel).
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this handle's channel is the live one.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.connection.upgrade().is_some_and(|inner| {
            SignalConnection { inner }.is_generation_current(self.generation)
        })
    }

    /// Disconnect this channel if it is still the live one.
    ///
    /// Returns whether anything was torn down.
    pub fn disconnect(&self, network: bool) -> bool {
        let Some(inner) = self.connection.upgrade() else {
            return false;
        };
        SignalConnection { inner }
            .disconnect_generation(Some(self.generation), network)
            .is_some()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && Weak::ptr_eq(&self.connection, &other.connection)
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.generation)
    }
}
