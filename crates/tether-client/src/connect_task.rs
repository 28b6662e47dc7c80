//! The connect and subscribe tasks behind [`SignalClient::connect`].
//!
//! [`SignalClient::connect`]: crate::SignalClient::connect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::{
    Flow, ObservableFuture, Outcome, SubscriptionId, TetherError, TetherResult, sync_state,
};
use tether_transport::{ConnectionHandle, Presence, SubscriptionCompleteCommand};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ClientInner, ClientRef, ConnectPlan};
use crate::provider::ClientIdEvent;
use crate::remote::{Params, SIGNALS_CONNECT, SIGNALS_DISCONNECT};
use crate::settings::{SettingsKey, SettingsStoreExt};

enum Binding {
    ConnectionChanged(SubscriptionId),
    NewClientId(SubscriptionId),
}

#[derive(Default)]
struct TaskState {
    started: bool,
    torn_down: bool,
    client_id_claimed: bool,
    handle: Option<ConnectionHandle>,
    buffered: Option<ClientIdEvent>,
    bindings: Vec<Binding>,
}

/// One orchestrated connect attempt.
pub(crate) struct ConnectTask {
    client: ClientRef,
    plan: ConnectPlan,
    versions: HashMap<String, i64>,
    presence: Option<Presence>,
    subscribe_timeout: Duration,
    result: ObservableFuture<ConnectionHandle>,
    state: Mutex<TaskState>,
}

impl ConnectTask {
    pub(crate) fn new(
        client: ClientRef,
        plan: ConnectPlan,
        versions: HashMap<String, i64>,
        presence: Option<Presence>,
        subscribe_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            plan,
            versions,
            presence,
            subscribe_timeout,
            result: ObservableFuture::new(),
            state: Mutex::new(TaskState::default()),
        })
    }

    /// Bind the provider listeners, then ask the provider to connect.
    ///
    /// Listeners go in before the provider call so a provider that answers
    /// synchronously is still observed.
    #[instrument(skip(self), fields(expecting = self.plan.expecting))]
    pub(crate) fn start(self: &Arc<Self>) -> TetherResult<ObservableFuture<ConnectionHandle>> {
        let client = self
            .client
            .upgrade()
            .ok_or_else(|| TetherError::Rejected("signal client dropped".into()))?;
        let _client_guard = client.client_lock.lock();

        let current = client.provider.connection_state();
        if current.is_connected() {
            return Err(TetherError::ContractViolation(format!(
                "connect task started while provider is {current}"
            )));
        }

        let weak = Arc::downgrade(self);
        self.result.add_observer(move |_| {
            if let Some(task) = weak.upgrade() {
                task.tear_down();
            }
        });
        self.bind_listeners(&client);
        self.state.lock().started = true;

        let connect = match client.provider.connect(
            self.plan.client_id.clone(),
            self.versions.clone(),
            self.presence.clone(),
        ) {
            Ok(connect) => connect,
            Err(err) => {
                warn!(error = %err, "provider connect failed to start");
                self.result.set_failure(err);
                return Ok(self.result.clone());
            }
        };

        let task = Arc::clone(self);
        connect.add_observer(move |done| task.process_connect_complete(done));

        let result = self.result.clone();
        if self.plan.expecting {
            // Success only arrives through the subscription round-trip.
            connect.add_observer(move |done| {
                if let Some(outcome) = done.outcome().filter(|o| !o.is_success()) {
                    result.complete(outcome);
                }
            });
        } else {
            let provider = Arc::clone(&client.provider);
            let expected = self.plan.client_id.clone();
            connect.add_observer(move |done| match done.outcome() {
                Some(Outcome::Success(_)) if provider.client_id() != expected => {
                    // The ack carried a new id; the client id handler finishes this.
                    info!(
                        stored = ?expected,
                        assigned = ?provider.client_id(),
                        "server assigned a different client id"
                    );
                }
                Some(_) => {
                    sync_state(done, &result);
                }
                None => {}
            });
        }
        Ok(self.result.clone())
    }

    fn bind_listeners(self: &Arc<Self>, client: &ClientInner) {
        let events = client.provider.events();
        let mut bindings = Vec::with_capacity(2);

        // Listeners own the task until it tears down and unbinds them.
        let task = Arc::clone(self);
        let id = events.connection_changed.subscribe(move |connected| {
            if *connected || !task.state.lock().started {
                return Flow::Continue;
            }
            debug!("provider disconnected while connecting");
            task.result
                .set_failure(TetherError::Disconnected("Disconnected".into()));
            Flow::Detach
        });
        bindings.push(Binding::ConnectionChanged(id));

        let task = Arc::clone(self);
        let id = events
            .new_client_id
            .subscribe(move |event| task.on_new_client_id(event));
        bindings.push(Binding::NewClientId(id));

        self.state.lock().bindings.extend(bindings);
    }

    fn unbind(&self, client: &ClientInner, keep: impl Fn(&Binding) -> bool) {
        let removed: Vec<Binding> = {
            let mut state = self.state.lock();
            let (kept, removed): (Vec<Binding>, Vec<Binding>) = std::mem::take(&mut state.bindings)
                .into_iter()
                .partition(|binding| keep(binding));
            state.bindings = kept;
            removed
        };
        let events = client.provider.events();
        for binding in removed {
            match binding {
                Binding::ConnectionChanged(id) => {
                    events.connection_changed.unsubscribe(id);
                }
                Binding::NewClientId(id) => {
                    events.new_client_id.unsubscribe(id);
                }
            }
        }
    }

    fn tear_down(&self) {
        {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
        }
        if let Some(client) = self.client.upgrade() {
            self.unbind(&client, |_| false);
        }
        debug!(outcome = ?self.result.outcome().map(|o| o.is_success()), "connect task torn down");
    }

    /// A client id arriving before the provider's connect future resolved
    /// is buffered (last one wins) and replayed once the handle is known.
    /// Whichever path claims the id first processes it; the other backs off.
    fn on_new_client_id(self: &Arc<Self>, event: &ClientIdEvent) -> Flow {
        let handle = {
            let mut state = self.state.lock();
            if !state.started || state.torn_down {
                return Flow::Continue;
            }
            if state.client_id_claimed {
                return Flow::Detach;
            }
            let Some(handle) = state.handle.clone() else {
                debug!(client_id = %event.client_id, "client id arrived before the handle, buffering");
                state.buffered = Some(event.clone());
                return Flow::Continue;
            };
            if event.handle == handle {
                state.client_id_claimed = true;
            }
            handle
        };
        if event.handle != handle {
            error!(
                expected = %handle,
                received = %event.handle,
                "client id arrived for a different connection"
            );
            return Flow::Continue;
        }
        self.process_new_client_id(&handle, &event.client_id);
        Flow::Detach
    }

    fn process_connect_complete(self: &Arc<Self>, done: &ObservableFuture<ConnectionHandle>) {
        let Some(handle) = done.result() else {
            return;
        };
        let (claimed, stale) = {
            let mut state = self.state.lock();
            state.handle = Some(handle.clone());
            match state.buffered.take() {
                Some(event) if event.handle != handle => (None, Some(event)),
                Some(event) if !state.client_id_claimed => {
                    state.client_id_claimed = true;
                    (Some(event), None)
                }
                _ => (None, None),
            }
        };
        debug!(%handle, "provider connect complete");
        if let Some(event) = stale {
            error!(
                expected = %handle,
                received = %event.handle,
                "buffered client id belongs to a different connection"
            );
        }
        let Some(event) = claimed else {
            return;
        };
        if let Some(client) = self.client.upgrade() {
            self.unbind(&client, |binding| !matches!(binding, Binding::NewClientId(_)));
        }
        self.process_new_client_id(&handle, &event.client_id);
    }

    fn process_new_client_id(self: &Arc<Self>, handle: &ConnectionHandle, new_client_id: &str) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let session_key = self.plan.session_key.as_str();

        let decision = {
            let _settings = client.settings_lock.lock();
            reconcile_client_id(&client, session_key, new_client_id)
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                error!(error = %err, "failed to persist new client id");
                self.result.set_failure(err);
                return;
            }
        };

        match decision {
            ClientIdDecision::AlreadySubscribed => {
                debug!(client_id = %new_client_id, "client id unchanged and subscribed");
                self.result.set_success(handle.clone());
                return;
            }
            ClientIdDecision::Replaced { old } => {
                info!(old = %old, new = %new_client_id, "client id changed");
                unsubscribe_best_effort(&client, session_key, &old);
            }
            ClientIdDecision::Resubscribe => {
                debug!(client_id = %new_client_id, "client id unchanged, confirming subscription");
            }
            ClientIdDecision::First => {
                info!(client_id = %new_client_id, "first client id for this session");
            }
        }

        let subscribe = SubscribeTask {
            handle: handle.clone(),
            client_id: new_client_id.to_string(),
            session_key: session_key.to_string(),
            category: self.presence.as_ref().and_then(|p| p.category.clone()),
        }
        .enqueue(&client, self.subscribe_timeout);

        let weak = Arc::downgrade(&client);
        let (client_id, key) = (new_client_id.to_string(), session_key.to_string());
        subscribe.add_observer(move |done| {
            if let Some(client) = weak.upgrade() {
                update_local_store(&client, done, &key, &client_id);
            }
        });

        let weak = Arc::downgrade(&client);
        let (client_id, torn) = (new_client_id.to_string(), handle.clone());
        subscribe.add_observer(move |done| {
            if let Some(client) = weak.upgrade() {
                tear_down_if_failed(&client, done, &torn, &client_id);
            }
        });

        let (result, cascade) = (self.result.clone(), handle.clone());
        subscribe.add_observer(move |done| {
            if let Some(outcome) = done.outcome() {
                result.complete(outcome.map(|_| cascade));
            }
        });
    }
}

enum ClientIdDecision {
    First,
    Replaced { old: String },
    Resubscribe,
    AlreadySubscribed,
}

fn reconcile_client_id(
    client: &ClientInner,
    session_key: &str,
    new_client_id: &str,
) -> TetherResult<ClientIdDecision> {
    let settings = &client.settings;
    match settings.value(SettingsKey::ClientId) {
        Some(old) if old == new_client_id => {
            let subscribed = settings.value(SettingsKey::LastSubscribedClientId);
            if subscribed.as_deref() == Some(new_client_id) {
                Ok(ClientIdDecision::AlreadySubscribed)
            } else {
                Ok(ClientIdDecision::Resubscribe)
            }
        }
        Some(old) => {
            settings.clear()?;
            settings.set(SettingsKey::SessionKey, session_key)?;
            settings.set(SettingsKey::ClientId, new_client_id)?;
            settings.set_flag(SettingsKey::ExpectsSubscriptionComplete, true)?;
            Ok(ClientIdDecision::Replaced { old })
        }
        None => {
            settings.set(SettingsKey::ClientId, new_client_id)?;
            settings.set_flag(SettingsKey::ExpectsSubscriptionComplete, true)?;
            Ok(ClientIdDecision::First)
        }
    }
}

fn unsubscribe_best_effort(client: &ClientInner, session_key: &str, old_client_id: &str) {
    let api = Arc::clone(&client.api);
    let params = Params::from([
        ("clientId".to_string(), old_client_id.to_string()),
        ("sessions".to_string(), session_key.to_string()),
    ]);
    let unsubscribe = client.executor.enqueue(
        move || async move {
            let response = api.execute(SIGNALS_DISCONNECT, params).await?;
            if response.success {
                Ok(ObservableFuture::succeeded(()))
            } else {
                Err(TetherError::Remote {
                    method: SIGNALS_DISCONNECT.into(),
                    body: response.raw,
                })
            }
        },
        None,
    );
    let old = old_client_id.to_string();
    unsubscribe.add_observer(move |done| {
        if let Some(err) = done.cause() {
            warn!(client_id = %old, error = %err, "unsubscribing old client id failed, ignoring");
        } else {
            debug!(client_id = %old, "old client id unsubscribed");
        }
    });
}

fn update_local_store(
    client: &ClientInner,
    done: &ObservableFuture<SubscriptionCompleteCommand>,
    session_key: &str,
    client_id: &str,
) {
    let Some(complete) = done.result() else {
        return;
    };
    if complete.subscription_id != session_key {
        warn!(
            subscription_id = %complete.subscription_id,
            session_key,
            "subscription id does not match the session key"
        );
    }
    let _settings = client.settings_lock.lock();
    let stored = client
        .settings
        .set_flag(SettingsKey::ExpectsSubscriptionComplete, false)
        .and_then(|()| client.settings.set(SettingsKey::LastSubscribedClientId, client_id));
    match stored {
        Ok(()) => info!(client_id, "subscription confirmed"),
        Err(err) => error!(client_id, error = %err, "failed to record confirmed subscription"),
    }
}

fn tear_down_if_failed(
    client: &ClientInner,
    done: &ObservableFuture<SubscriptionCompleteCommand>,
    handle: &ConnectionHandle,
    client_id: &str,
) {
    let Some(outcome) = done.outcome() else {
        return;
    };
    if outcome.is_success() {
        return;
    }
    if client.provider.client_id().as_deref() != Some(client_id) {
        debug!(client_id, "client id superseded, leaving connection alone");
        return;
    }
    match outcome {
        Outcome::Failure(err) if err.is_timeout() => {
            warn!(client_id, %handle, "subscription timed out, resetting connection");
            client.provider.reset_disconnect_and_connect();
        }
        Outcome::Cancelled => {
            warn!(client_id, "subscription cancelled");
        }
        Outcome::Failure(err) => {
            warn!(client_id, %handle, error = %err, "subscription failed, dropping connection");
            client.provider.disconnect_handle(handle, true);
        }
        Outcome::Success(_) => {}
    }
}

/// One `signals/connect` round-trip, confirmed by a subscription-complete
/// command on the channel.
struct SubscribeTask {
    handle: ConnectionHandle,
    client_id: String,
    session_key: String,
    category: Option<String>,
}

impl SubscribeTask {
    fn params(&self) -> Params {
        let mut params = Params::from([
            ("clientId".to_string(), self.client_id.clone()),
            ("sessions".to_string(), self.session_key.clone()),
            ("subscriptionId".to_string(), self.session_key.clone()),
        ]);
        if let Some(category) = &self.category {
            params.insert("category".to_string(), category.clone());
        }
        params
    }

    fn enqueue(
        self,
        client: &ClientInner,
        timeout: Duration,
    ) -> ObservableFuture<SubscriptionCompleteCommand> {
        let provider = Arc::clone(&client.provider);
        let api = Arc::clone(&client.api);
        debug!(client_id = %self.client_id, handle = %self.handle, "subscribing");
        client.executor.enqueue(
            move || async move {
                let confirmed = ObservableFuture::new();
                let events = provider.events();

                let target = confirmed.clone();
                let completed = events.subscription_complete.subscribe(move |command| {
                    target.set_success(command.clone());
                    Flow::Detach
                });
                let target = confirmed.clone();
                let dropped = events.connection_changed.subscribe(move |connected| {
                    if *connected {
                        return Flow::Continue;
                    }
                    target.set_failure(TetherError::Disconnected(
                        "Disconnected while waiting for subscription complete".into(),
                    ));
                    Flow::Detach
                });
                let cleanup = Arc::clone(&provider);
                confirmed.add_observer(move |_| {
                    cleanup.events().subscription_complete.unsubscribe(completed);
                    cleanup.events().connection_changed.unsubscribe(dropped);
                });

                match api.execute(SIGNALS_CONNECT, self.params()).await {
                    Ok(response) if response.success => {
                        debug!(client_id = %self.client_id, "subscribe accepted, awaiting confirmation");
                    }
                    Ok(response) => {
                        confirmed.set_failure(TetherError::Remote {
                            method: SIGNALS_CONNECT.into(),
                            body: response.raw,
                        });
                    }
                    Err(err) => {
                        confirmed.set_failure(err);
                    }
                }
                Ok(confirmed)
            },
            Some(timeout),
        )
    }
}
