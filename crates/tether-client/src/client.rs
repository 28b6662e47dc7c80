//! The connection orchestrator.
//!
//! [`SignalClient::connect`] is single-flight: while one orchestrated connect
//! is in flight every caller gets the same future. An orchestrated connect
//! opens the provider's channel and, when the server has to (re)subscribe
//! the session, runs the `signals/connect` round-trip and waits for the
//! subscription confirmation before resolving.
//!
//! Lock order is fixed: connect slot, then client lock, then settings lock.
//! The provider only ever takes its own lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::{
    Flow, ObservableFuture, SubscriptionId, TaskExecutor, TetherError, TetherResult,
};
use tether_transport::{ConnectionHandle, Presence};
use tracing::{debug, info, instrument, warn};

use crate::connect_task::ConnectTask;
use crate::provider::SignalProvider;
use crate::remote::SignalsApi;
use crate::settings::{SettingsKey, SettingsStore, SettingsStoreExt};
use crate::state::ConnectionState;
use crate::versions::{SettingsVersionStore, VersionStore};

/// Default wait for a connect or subscribe round-trip.
pub const DEFAULT_SIGNALS_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity the next connect runs with, decided under the settings lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectPlan {
    pub expecting: bool,
    pub client_id: Option<String>,
    pub session_key: String,
}

pub(crate) struct ClientInner {
    pub provider: Arc<dyn SignalProvider>,
    pub api: Arc<dyn SignalsApi>,
    pub settings: Arc<dyn SettingsStore>,
    pub versions: Arc<dyn VersionStore>,
    pub executor: TaskExecutor,
    pub signals_connect_timeout: Duration,
    connect_slot: Mutex<Option<ObservableFuture<ConnectionHandle>>>,
    pub client_lock: Mutex<()>,
    pub settings_lock: Mutex<()>,
    version_subscription: Mutex<Option<SubscriptionId>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(id) = self.version_subscription.get_mut().take() {
            self.provider.events().version_changed.unsubscribe(id);
        }
    }
}

/// Builder for [`SignalClient`].
pub struct SignalClientBuilder {
    provider: Arc<dyn SignalProvider>,
    api: Arc<dyn SignalsApi>,
    settings: Option<Arc<dyn SettingsStore>>,
    versions: Option<Arc<dyn VersionStore>>,
    executor: Option<TaskExecutor>,
    signals_connect_timeout: Duration,
}

impl SignalClientBuilder {
    /// Settings store (default: in-memory).
    #[must_use]
    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Version store (default: kept in the settings store).
    #[must_use]
    pub fn versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Executor connect and subscribe tasks run on.
    #[must_use]
    pub fn executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Deadline for the connect task and for each subscribe round-trip.
    #[must_use]
    pub const fn signals_connect_timeout(mut self, timeout: Duration) -> Self {
        self.signals_connect_timeout = timeout;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    /// Returns [`TetherError::Rejected`] when no executor was given and no
    /// tokio runtime is current.
    pub fn build(self) -> TetherResult<SignalClient> {
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(crate::settings::MemorySettingsStore::new()));
        let versions = self
            .versions
            .unwrap_or_else(|| Arc::new(SettingsVersionStore::new(Arc::clone(&settings))));
        let executor = match self.executor {
            Some(executor) => executor,
            None => TaskExecutor::new(tether_core::ExecutorConfig::default())?,
        };

        let inner = Arc::new(ClientInner {
            provider: self.provider,
            api: self.api,
            settings,
            versions,
            executor,
            signals_connect_timeout: self.signals_connect_timeout,
            connect_slot: Mutex::new(None),
            client_lock: Mutex::new(()),
            settings_lock: Mutex::new(()),
            version_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.provider.events().version_changed.subscribe(move |entry| {
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.versions.set(&entry.key, entry.value) {
                    warn!(key = %entry.key, error = %err, "failed to record version");
                }
            }
            Flow::Continue
        });
        *inner.version_subscription.lock() = Some(subscription);

        Ok(SignalClient { inner })
    }
}

/// Orchestrates the provider connect, server subscription, and session
/// identity into one single-flight `connect()`.
#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("connecting", &self.connect_in_flight())
            .field("timeout", &self.inner.signals_connect_timeout)
            .finish_non_exhaustive()
    }
}

impl SignalClient {
    /// Start building a client over `provider` and `api`.
    #[must_use]
    pub fn builder(provider: Arc<dyn SignalProvider>, api: Arc<dyn SignalsApi>) -> SignalClientBuilder {
        SignalClientBuilder {
            provider,
            api,
            settings: None,
            versions: None,
            executor: None,
            signals_connect_timeout: DEFAULT_SIGNALS_CONNECT_TIMEOUT,
        }
    }

    /// The provider this client drives.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn SignalProvider> {
        &self.inner.provider
    }

    /// The settings store holding the session identity.
    #[must_use]
    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.inner.settings
    }

    /// The executor connect and subscribe tasks run on.
    #[must_use]
    pub fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    /// Whether an orchestrated connect is in flight.
    #[must_use]
    pub fn connect_in_flight(&self) -> bool {
        self.inner.connect_slot.lock().is_some()
    }

    /// Connect and, if needed, subscribe the session.
    ///
    /// While a connect is in flight the same future is returned to every
    /// caller. The future resolves to the channel's handle once the session
    /// is usable.
    ///
    /// # Errors
    /// Returns [`TetherError::NotAuthenticated`] without an API session, or a
    /// settings store error while reconciling the stored identity.
    #[instrument(skip(self, presence))]
    pub fn connect(&self, presence: Option<Presence>) -> TetherResult<ObservableFuture<ConnectionHandle>> {
        let inner = &self.inner;
        let (result, plan) = {
            let mut slot = inner.connect_slot.lock();
            if let Some(existing) = slot.as_ref() {
                debug!(future_id = existing.id(), "connect already in flight");
                return Ok(existing.clone());
            }
            let session_key = self.validate_connect_state()?;
            let plan = inner.setup_settings_for_connection(session_key)?;
            let result = ObservableFuture::new();
            *slot = Some(result.clone());
            (result, plan)
        };

        let weak = Arc::downgrade(inner);
        result.add_observer(move |done| {
            if let Some(inner) = weak.upgrade() {
                inner.clear_connect_slot(done);
            }
        });

        info!(
            expecting = plan.expecting,
            client_id = ?plan.client_id,
            "orchestrated connect starting"
        );
        let task = ConnectTask::new(
            Arc::downgrade(inner),
            plan,
            inner.versions.all(),
            presence,
            inner.signals_connect_timeout,
        );
        let work = move || async move { task.start() };
        let request = inner
            .executor
            .enqueue(work, Some(inner.signals_connect_timeout));
        result.bind_nested(&request)?;
        Ok(result)
    }

    /// Forward a disconnect to the provider.
    ///
    /// Unlike [`connect`](Self::connect) this works from any state.
    pub fn disconnect(&self, network: bool) -> ObservableFuture<ConnectionHandle> {
        info!(network, "disconnect requested");
        self.inner.provider.disconnect(network)
    }

    /// Whether the session is usable: the transport is authenticated and the
    /// live, stored, and last-subscribed client ids are all the same.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let inner = &self.inner;
        let _settings = inner.settings_lock.lock();
        if inner.provider.connection_state() != ConnectionState::Authenticated {
            return false;
        }
        let Some(live) = inner.provider.client_id() else {
            return false;
        };
        let stored = inner.settings.value(SettingsKey::ClientId);
        let subscribed = inner.settings.value(SettingsKey::LastSubscribedClientId);
        stored.as_deref() == Some(live.as_str()) && subscribed.as_deref() == Some(live.as_str())
    }

    fn validate_connect_state(&self) -> TetherResult<String> {
        let api = &self.inner.api;
        if !api.is_authenticated() {
            return Err(TetherError::NotAuthenticated(
                "api session is not authenticated".into(),
            ));
        }
        api.session_key()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| TetherError::NotAuthenticated("api session has no session key".into()))
    }
}

impl ClientInner {
    /// Reconcile the stored identity with the live session.
    ///
    /// A new session key, a missing client id, or a live client id that
    /// differs from the stored one resets the stored identity and marks a
    /// subscription as expected.
    fn setup_settings_for_connection(&self, session_key: String) -> TetherResult<ConnectPlan> {
        let _settings = self.settings_lock.lock();
        let settings = &self.settings;

        let stored_session = settings.value(SettingsKey::SessionKey);
        let stored_client = settings.value(SettingsKey::ClientId);
        let live_client = self.provider.client_id();

        let mut expecting = settings.flag(SettingsKey::ExpectsSubscriptionComplete);
        let mut client_id = stored_client.clone();
        let mut reset = false;

        if stored_session.as_deref() != Some(session_key.as_str()) {
            debug!("session key changed, resetting stored identity");
            reset = true;
            expecting = true;
        }
        let live_differs = live_client
            .as_ref()
            .is_some_and(|live| stored_client.as_ref() != Some(live));
        if stored_client.is_none() || live_differs {
            debug!(stored = ?stored_client, live = ?live_client, "client id missing or changed");
            reset = true;
            expecting = true;
            client_id = live_client;
        }

        if reset {
            settings.clear()?;
            if let Some(client_id) = &client_id {
                settings.set(SettingsKey::ClientId, client_id)?;
            }
            settings.set(SettingsKey::SessionKey, &session_key)?;
        }
        settings.set_flag(SettingsKey::ExpectsSubscriptionComplete, expecting)?;

        Ok(ConnectPlan {
            expecting,
            client_id,
            session_key,
        })
    }

    fn clear_connect_slot(&self, done: &ObservableFuture<ConnectionHandle>) {
        let mut slot = self.connect_slot.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(done)) {
            *slot = None;
            debug!(future_id = done.id(), "connect slot cleared");
        }
    }
}

/// Weak reference to the orchestrator state, held by tasks.
pub(crate) type ClientRef = Weak<ClientInner>;
