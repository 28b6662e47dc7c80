//! Protocol/session layer over the persistent connection.
//!
//! A [`SignalProvider`] turns raw channel events into session events. The
//! socket opening moves it to CONNECTED and the server's connect
//! acknowledgement moves it to AUTHENTICATED and assigns the client id.
//! Subscription confirmations and version counters are surfaced as well.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tether_core::{EventBus, Flow, ObservableFuture, SubscriptionId, TetherError, TetherResult};
use tether_transport::{
    Command, ConnectCommand, ConnectRequest, ConnectionHandle, DisconnectEvent, OutboundFrame,
    PingEvent, Presence, SignalCommand, SignalConnection, SubscriptionCompleteCommand, VersionEntry,
};
use tracing::{debug, info, warn};

use crate::state::ConnectionState;

/// A client id assigned on a specific channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdEvent {
    /// Channel the acknowledgement arrived on.
    pub handle: ConnectionHandle,
    /// Assigned client id.
    pub client_id: String,
}

/// Session-level event buses.
#[derive(Debug, Default)]
pub struct ProviderEvents {
    /// Socket opened (`true`) or went away (`false`).
    pub connection_changed: EventBus<bool>,
    /// Every state transition.
    pub state_changed: EventBus<ConnectionState>,
    /// Server acknowledged a connect and assigned a client id.
    pub new_client_id: EventBus<ClientIdEvent>,
    /// Server confirmed a subscription.
    pub subscription_complete: EventBus<SubscriptionCompleteCommand>,
    /// A version counter advanced.
    pub version_changed: EventBus<VersionEntry>,
    /// Business signal delivered.
    pub signal: EventBus<SignalCommand>,
    /// Keepalive diagnostics.
    pub ping: EventBus<PingEvent>,
    /// Every decoded command, before dispatch.
    pub command_received: EventBus<Command>,
    /// Non-fatal transport problems.
    pub exception: EventBus<String>,
}

/// Session layer the orchestrator drives.
pub trait SignalProvider: Send + Sync {
    /// Current transport-level state.
    fn connection_state(&self) -> ConnectionState;

    /// Client id the server last assigned.
    fn client_id(&self) -> Option<String>;

    /// Presence sent with the last connect.
    fn presence(&self) -> Option<Presence>;

    /// Event buses.
    fn events(&self) -> &ProviderEvents;

    /// Open the channel and announce `client_id`, `versions`, and `presence`.
    ///
    /// The future resolves to the channel's handle once the server
    /// acknowledges the connect.
    ///
    /// # Errors
    /// Returns [`TetherError::ContractViolation`] when already connecting or
    /// connected, or the transport's error if the connect cannot start.
    fn connect(
        &self,
        client_id: Option<String>,
        versions: HashMap<String, i64>,
        presence: Option<Presence>,
    ) -> TetherResult<ObservableFuture<ConnectionHandle>>;

    /// Tear down the live channel. Resolves to the handle torn down.
    fn disconnect(&self, network: bool) -> ObservableFuture<ConnectionHandle>;

    /// Tear down `handle` if it is still the live channel.
    fn disconnect_handle(&self, handle: &ConnectionHandle, network: bool) -> bool;

    /// Drop the channel and reconnect with the same client id.
    fn reset_disconnect_and_connect(&self);

    /// Send a keepalive now.
    fn nudge(&self);
}

struct ProviderState {
    state: ConnectionState,
    client_id: Option<String>,
    presence: Option<Presence>,
    versions: HashMap<String, i64>,
    pending: Option<ObservableFuture<ConnectionHandle>>,
}

struct Bindings {
    connect: SubscriptionId,
    disconnect: SubscriptionId,
    receive: SubscriptionId,
    exception: SubscriptionId,
    ping: SubscriptionId,
}

struct ProviderInner {
    connection: SignalConnection,
    events: ProviderEvents,
    state: Mutex<ProviderState>,
    bindings: Bindings,
}

/// [`SignalProvider`] over a [`SignalConnection`].
#[derive(Clone)]
pub struct DefaultSignalProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for DefaultSignalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSignalProvider")
            .field("state", &self.connection_state())
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

impl DefaultSignalProvider {
    /// Wrap `connection`. The provider listens to its events until dropped.
    #[must_use]
    pub fn new(connection: SignalConnection) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ProviderInner>| {
            let events = connection.events();

            let provider = weak.clone();
            let connect = events.connect.subscribe(move |connected| {
                if let Some(provider) = provider.upgrade() {
                    provider.on_channel_connect(*connected);
                }
                Flow::Continue
            });

            let provider = weak.clone();
            let disconnect = events.disconnect.subscribe(move |event| {
                if let Some(provider) = provider.upgrade() {
                    provider.on_channel_disconnect(event);
                }
                Flow::Continue
            });

            let provider = weak.clone();
            let receive = events.receive.subscribe(move |command| {
                if let Some(provider) = provider.upgrade() {
                    provider.on_command(command);
                }
                Flow::Continue
            });

            let provider = weak.clone();
            let exception = events.exception.subscribe(move |reason| {
                if let Some(provider) = provider.upgrade() {
                    provider.events.exception.publish(reason);
                }
                Flow::Continue
            });

            let provider = weak.clone();
            let ping = events.ping.subscribe(move |event| {
                if let Some(provider) = provider.upgrade() {
                    provider.events.ping.publish(event);
                }
                Flow::Continue
            });

            ProviderInner {
                connection,
                events: ProviderEvents::default(),
                state: Mutex::new(ProviderState {
                    state: ConnectionState::Disconnected,
                    client_id: None,
                    presence: None,
                    versions: HashMap::new(),
                    pending: None,
                }),
                bindings: Bindings {
                    connect,
                    disconnect,
                    receive,
                    exception,
                    ping,
                },
            }
        });
        Self { inner }
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &SignalConnection {
        &self.inner.connection
    }
}

impl ProviderInner {
    fn transition(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.state != next;
            state.state = next;
            changed
        };
        if changed {
            debug!(state = %next, "provider state changed");
            self.events.state_changed.publish(&next);
        }
    }

    fn on_channel_connect(&self, connected: bool) {
        if !connected {
            let pending = {
                let mut state = self.state.lock();
                state.state = ConnectionState::Disconnected;
                state.pending.take()
            };
            self.events.state_changed.publish(&ConnectionState::Disconnected);
            if let Some(pending) = pending {
                pending.set_failure(TetherError::Disconnected("channel failed to open".into()));
            }
            return;
        }

        let request = {
            let mut state = self.state.lock();
            state.state = ConnectionState::Connected;
            ConnectRequest {
                client_id: state.client_id.clone(),
                versions: state.versions.clone(),
                presence: state.presence.clone(),
            }
        };
        self.events.state_changed.publish(&ConnectionState::Connected);
        self.events.connection_changed.publish(&true);
        debug!(client_id = ?request.client_id, "sending connect frame");
        if let Err(err) = self.connection.send(&OutboundFrame::Connect(request)) {
            warn!(error = %err, "failed to send connect frame");
        }
    }

    fn on_channel_disconnect(&self, event: &DisconnectEvent) {
        let pending = {
            let mut state = self.state.lock();
            state.state = ConnectionState::Disconnected;
            state.pending.take()
        };
        info!(handle = %event.handle, network = event.network, "signal provider disconnected");
        self.events.state_changed.publish(&ConnectionState::Disconnected);
        self.events.connection_changed.publish(&false);
        if let Some(pending) = pending {
            pending.set_failure(TetherError::Disconnected(
                "disconnected before the server acknowledged".into(),
            ));
        }
    }

    fn on_command(&self, command: &Command) {
        self.events.command_received.publish(command);
        match command {
            Command::Connect(ack) => self.on_connect_ack(ack),
            Command::SubscriptionComplete(complete) => {
                debug!(subscription_id = %complete.subscription_id, "subscription complete");
                self.events.subscription_complete.publish(complete);
            }
            Command::Signal(signal) => {
                if let Some(version) = &signal.version {
                    self.record_version(version);
                }
                self.events.signal.publish(signal);
            }
            Command::Disconnect(disconnect) => {
                info!(stop = disconnect.stop, "server requested disconnect");
                self.connection.disconnect(!disconnect.stop);
            }
            Command::Presence(_) | Command::Backfill(_) | Command::Noop => {}
        }
    }

    fn record_version(&self, version: &VersionEntry) {
        self.state
            .lock()
            .versions
            .insert(version.key.clone(), version.value);
        self.events.version_changed.publish(version);
    }

    fn on_connect_ack(&self, ack: &ConnectCommand) {
        let Some(handle) = self.connection.current_handle() else {
            warn!(client_id = %ack.client_id, "connect acknowledgement without a live channel");
            return;
        };
        let pending = {
            let mut state = self.state.lock();
            state.state = ConnectionState::Authenticated;
            state.client_id = Some(ack.client_id.clone());
            state.pending.take()
        };
        info!(client_id = %ack.client_id, %handle, "signal provider authenticated");
        self.events.state_changed.publish(&ConnectionState::Authenticated);

        if let Some(versions) = &ack.versions {
            for (key, value) in versions {
                self.record_version(&VersionEntry {
                    key: key.clone(),
                    value: *value,
                });
            }
        }
        if let Some(pending) = pending {
            pending.set_success(handle.clone());
        }
        self.events.new_client_id.publish(&ClientIdEvent {
            handle,
            client_id: ack.client_id.clone(),
        });
    }
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        let events = self.connection.events();
        events.connect.unsubscribe(self.bindings.connect);
        events.disconnect.unsubscribe(self.bindings.disconnect);
        events.receive.unsubscribe(self.bindings.receive);
        events.exception.unsubscribe(self.bindings.exception);
        events.ping.unsubscribe(self.bindings.ping);
    }
}

impl SignalProvider for DefaultSignalProvider {
    fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    fn client_id(&self) -> Option<String> {
        self.inner.state.lock().client_id.clone()
    }

    fn presence(&self) -> Option<Presence> {
        self.inner.state.lock().presence.clone()
    }

    fn events(&self) -> &ProviderEvents {
        &self.inner.events
    }

    fn connect(
        &self,
        client_id: Option<String>,
        versions: HashMap<String, i64>,
        presence: Option<Presence>,
    ) -> TetherResult<ObservableFuture<ConnectionHandle>> {
        let future = {
            let mut state = self.inner.state.lock();
            if state.state.is_active() || state.pending.is_some() {
                return Err(TetherError::ContractViolation(format!(
                    "provider connect() while {}",
                    state.state
                )));
            }
            state.client_id = client_id;
            state.versions = versions;
            state.presence = presence;
            state.state = ConnectionState::Connecting;
            let future = ObservableFuture::new();
            state.pending = Some(future.clone());
            future
        };
        self.inner
            .events
            .state_changed
            .publish(&ConnectionState::Connecting);

        if let Err(err) = self.inner.connection.connect() {
            {
                let mut state = self.inner.state.lock();
                state.state = ConnectionState::Disconnected;
                state.pending = None;
            }
            self.inner
                .events
                .state_changed
                .publish(&ConnectionState::Disconnected);
            return Err(err);
        }
        Ok(future)
    }

    fn disconnect(&self, network: bool) -> ObservableFuture<ConnectionHandle> {
        if self.connection_state().is_active() {
            self.inner.transition(ConnectionState::Disconnecting);
        }
        if let Some(handle) = self.inner.connection.disconnect(network) {
            return ObservableFuture::succeeded(handle);
        }

        let pending = {
            let mut state = self.inner.state.lock();
            state.state = ConnectionState::Disconnected;
            state.pending.take()
        };
        self.inner
            .events
            .state_changed
            .publish(&ConnectionState::Disconnected);
        let err = TetherError::Disconnected("no live channel to disconnect".into());
        if let Some(pending) = pending {
            pending.set_failure(err.clone());
        }
        ObservableFuture::failed(err)
    }

    fn disconnect_handle(&self, handle: &ConnectionHandle, network: bool) -> bool {
        let torn_down = handle.disconnect(network);
        if !torn_down {
            warn!(%handle, "not disconnecting stale connection handle");
        }
        torn_down
    }

    fn reset_disconnect_and_connect(&self) {
        info!(client_id = ?self.client_id(), "resetting signal connection");
        let connection = &self.inner.connection;
        connection.disconnect(true);
        if connection.is_connected() || connection.is_connecting() {
            return;
        }
        self.inner.transition(ConnectionState::Connecting);
        if let Err(err) = connection.connect() {
            warn!(error = %err, "reconnect after reset failed to start");
            self.inner.transition(ConnectionState::Disconnected);
        }
    }

    fn nudge(&self) {
        self.inner.connection.keepalive();
    }
}
