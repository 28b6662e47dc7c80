//! Test doubles for orchestrator tests: a scripted provider and a recording
//! signals API.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_client::{
    ClientIdEvent, ConnectionState, MemorySettingsStore, Params, ProviderEvents, SIGNALS_CONNECT,
    ServerResponse, SettingsStore, SignalProvider, SignalsApi,
};
use tether_core::{ObservableFuture, TetherError, TetherResult};
use tether_transport::{ConnectionHandle, Presence, SubscriptionCompleteCommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// How the scripted provider answers `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Authenticate and announce the client id before `connect` returns.
    Immediate,
    /// Stay CONNECTING forever.
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub client_id: Option<String>,
    pub versions: HashMap<String, i64>,
    pub presence: Option<Presence>,
}

struct ScriptState {
    state: ConnectionState,
    client_id: Option<String>,
    next_client_id: String,
    mode: AckMode,
    generation: u64,
    connects: Vec<ConnectCall>,
    disconnects: Vec<bool>,
    handle_disconnects: Vec<(ConnectionHandle, bool)>,
    resets: usize,
}

/// Provider whose behaviour is scripted by the test.
pub struct ScriptedProvider {
    events: ProviderEvents,
    state: Mutex<ScriptState>,
}

impl ScriptedProvider {
    pub fn new(next_client_id: &str, mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            events: ProviderEvents::default(),
            state: Mutex::new(ScriptState {
                state: ConnectionState::Disconnected,
                client_id: None,
                next_client_id: next_client_id.to_string(),
                mode,
                generation: 0,
                connects: Vec::new(),
                disconnects: Vec::new(),
                handle_disconnects: Vec::new(),
                resets: 0,
            }),
        })
    }

    pub fn set_live(&self, state: ConnectionState, client_id: Option<&str>) {
        let mut script = self.state.lock();
        script.state = state;
        script.client_id = client_id.map(str::to_string);
    }

    pub fn connects(&self) -> Vec<ConnectCall> {
        self.state.lock().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<bool> {
        self.state.lock().disconnects.clone()
    }

    pub fn handle_disconnects(&self) -> Vec<(ConnectionHandle, bool)> {
        self.state.lock().handle_disconnects.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn confirm_subscription(&self, subscription_id: &str) {
        self.events
            .subscription_complete
            .publish(&SubscriptionCompleteCommand::new(subscription_id));
    }
}

impl SignalProvider for ScriptedProvider {
    fn connection_state(&self) -> ConnectionState {
        self.state.lock().state
    }

    fn client_id(&self) -> Option<String> {
        self.state.lock().client_id.clone()
    }

    fn presence(&self) -> Option<Presence> {
        None
    }

    fn events(&self) -> &ProviderEvents {
        &self.events
    }

    fn connect(
        &self,
        client_id: Option<String>,
        versions: HashMap<String, i64>,
        presence: Option<Presence>,
    ) -> TetherResult<ObservableFuture<ConnectionHandle>> {
        let (mode, handle, assigned) = {
            let mut script = self.state.lock();
            script.connects.push(ConnectCall {
                client_id,
                versions,
                presence,
            });
            script.generation += 1;
            let handle = ConnectionHandle::detached(script.generation);
            match script.mode {
                AckMode::Immediate => {
                    script.state = ConnectionState::Authenticated;
                    script.client_id = Some(script.next_client_id.clone());
                }
                AckMode::Never => script.state = ConnectionState::Connecting,
            }
            (script.mode, handle, script.next_client_id.clone())
        };

        match mode {
            AckMode::Immediate => {
                self.events.connection_changed.publish(&true);
                self.events.new_client_id.publish(&ClientIdEvent {
                    handle: handle.clone(),
                    client_id: assigned,
                });
                Ok(ObservableFuture::succeeded(handle))
            }
            AckMode::Never => Ok(ObservableFuture::new()),
        }
    }

    fn disconnect(&self, network: bool) -> ObservableFuture<ConnectionHandle> {
        let generation = {
            let mut script = self.state.lock();
            script.disconnects.push(network);
            script.state = ConnectionState::Disconnected;
            script.generation
        };
        self.events.connection_changed.publish(&false);
        ObservableFuture::succeeded(ConnectionHandle::detached(generation))
    }

    fn disconnect_handle(&self, handle: &ConnectionHandle, network: bool) -> bool {
        self.state
            .lock()
            .handle_disconnects
            .push((handle.clone(), network));
        true
    }

    fn reset_disconnect_and_connect(&self) {
        self.state.lock().resets += 1;
    }

    fn nudge(&self) {}
}

/// Signals API that records calls and replays queued responses.
///
/// Without a queued response a call succeeds; a successful `signals/connect`
/// is confirmed on the provider when `confirm_with` is set.
pub struct RecordingApi {
    session_key: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, Params)>>,
    responses: Mutex<HashMap<String, VecDeque<TetherResult<ServerResponse>>>>,
    confirm_with: Mutex<Option<(Arc<ScriptedProvider>, Option<String>)>>,
}

impl RecordingApi {
    pub fn new(session_key: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            session_key: Mutex::new(session_key.map(str::to_string)),
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            confirm_with: Mutex::new(None),
        })
    }

    /// Confirm successful subscribes on `provider` with the session key.
    pub fn confirm_on(&self, provider: &Arc<ScriptedProvider>) {
        *self.confirm_with.lock() = Some((Arc::clone(provider), None));
    }

    /// Confirm successful subscribes with a fixed subscription id.
    pub fn confirm_on_with_id(&self, provider: &Arc<ScriptedProvider>, subscription_id: &str) {
        *self.confirm_with.lock() = Some((Arc::clone(provider), Some(subscription_id.to_string())));
    }

    pub fn respond(&self, method: &str, response: TetherResult<ServerResponse>) {
        self.responses
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<(String, Params)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Params> {
        self.calls
            .lock()
            .iter()
            .filter(|(called, _)| called == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl SignalsApi for RecordingApi {
    fn session_key(&self) -> Option<String> {
        self.session_key.lock().clone()
    }

    fn is_authenticated(&self) -> bool {
        self.session_key.lock().is_some()
    }

    async fn execute(&self, method: &str, params: Params) -> TetherResult<ServerResponse> {
        self.calls.lock().push((method.to_string(), params.clone()));
        let queued = self
            .responses
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        let response = queued.unwrap_or_else(|| Ok(ServerResponse::ok()));

        if method == SIGNALS_CONNECT && matches!(&response, Ok(r) if r.success) {
            let confirm = self.confirm_with.lock().clone();
            if let Some((provider, fixed)) = confirm {
                let id = fixed
                    .or_else(|| params.get("subscriptionId").cloned())
                    .unwrap_or_default();
                provider.confirm_subscription(&id);
            }
        }
        response
    }
}

pub fn failing(method: &str) -> TetherResult<ServerResponse> {
    Err(TetherError::Remote {
        method: method.to_string(),
        body: "HTTP 500: boom".into(),
    })
}

pub fn settings_with(entries: &[(&str, &str)]) -> Arc<dyn SettingsStore> {
    let store = MemorySettingsStore::new();
    for (key, value) in entries {
        store.put(key, value).unwrap_or_else(|e| panic!("seed {key}: {e}"));
    }
    Arc::new(store)
}

pub async fn settle_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

// ─────────────────────────────────────────────────────────────────────────────
// Log capture
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct LogCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install_json(&self) -> tracing::subscriber::DefaultGuard {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(self.clone())
            .json()
            .with_ansi(false)
            .with_target(false)
            .with_current_span(false)
            .flatten_event(true);
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("tether_client=debug"))
            .with(layer);
        tracing::subscriber::set_default(subscriber)
    }

    pub fn jsonl(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).to_string()
    }
}

pub struct LogCaptureWriter {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            bytes: Arc::clone(&self.bytes),
        }
    }
}
