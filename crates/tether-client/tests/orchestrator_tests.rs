//! Orchestrated connect scenarios against a scripted provider.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{AckMode, LogCapture, RecordingApi, ScriptedProvider, failing, settings_with, settle_until};
use pretty_assertions::assert_eq;
use tether_client::{
    ClientIdEvent, ConnectionState, SIGNALS_CONNECT, SIGNALS_DISCONNECT, ServerResponse, SettingsKey,
    SettingsStore, SettingsStoreExt, SignalClient, SignalProvider,
};
use tether_core::{Outcome, TetherError};
use tether_transport::{ConnectionHandle, Presence, VersionEntry};

const SESSION: &str = "sess-1";

fn client_for(
    provider: &Arc<ScriptedProvider>,
    api: &Arc<RecordingApi>,
    settings: &Arc<dyn SettingsStore>,
) -> SignalClient {
    SignalClient::builder(provider.clone(), api.clone())
        .settings(Arc::clone(settings))
        .signals_connect_timeout(Duration::from_secs(1))
        .build()
        .expect("client builds inside a runtime")
}

fn subscribed_settings(client_id: &str) -> Arc<dyn SettingsStore> {
    settings_with(&[
        (SettingsKey::ClientId.as_str(), client_id),
        (SettingsKey::SessionKey.as_str(), SESSION),
        (SettingsKey::LastSubscribedClientId.as_str(), client_id),
        (SettingsKey::ExpectsSubscriptionComplete.as_str(), "false"),
    ])
}

// ─────────────────────────────────────────────────────────────────────────────
// Fresh install and identity reconciliation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_install_subscribes_and_records_identity() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on(&provider);
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let handle = match client.connect(None).expect("connect starts").wait().await {
        Outcome::Success(handle) => handle,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(handle.generation(), 1);

    assert_eq!(provider.connects()[0].client_id, None);
    let subscribes = api.calls_to(SIGNALS_CONNECT);
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0]["clientId"], "C1");
    assert_eq!(subscribes[0]["sessions"], SESSION);
    assert_eq!(subscribes[0]["subscriptionId"], SESSION);
    assert!(api.calls_to(SIGNALS_DISCONNECT).is_empty());

    assert_eq!(settings.value(SettingsKey::ClientId).as_deref(), Some("C1"));
    assert_eq!(settings.value(SettingsKey::SessionKey).as_deref(), Some(SESSION));
    assert_eq!(
        settings.value(SettingsKey::LastSubscribedClientId).as_deref(),
        Some("C1")
    );
    assert!(!settings.flag(SettingsKey::ExpectsSubscriptionComplete));
    assert!(client.is_connected());
    assert!(!client.connect_in_flight());
}

#[tokio::test]
async fn already_subscribed_identity_skips_round_trip() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    let settings = subscribed_settings("C1");
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;

    assert!(outcome.is_success());
    assert_eq!(provider.connects()[0].client_id.as_deref(), Some("C1"));
    assert!(api.calls().is_empty());
    assert!(client.is_connected());
}

#[tokio::test]
async fn changed_client_id_unsubscribes_old_and_subscribes_new() {
    let provider = ScriptedProvider::new("C2", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on(&provider);
    api.respond(SIGNALS_DISCONNECT, failing(SIGNALS_DISCONNECT));
    let settings = settings_with(&[
        (SettingsKey::ClientId.as_str(), "C1"),
        (SettingsKey::SessionKey.as_str(), SESSION),
        (SettingsKey::LastSubscribedClientId.as_str(), "C1"),
        (SettingsKey::ExpectsSubscriptionComplete.as_str(), "true"),
    ]);
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;
    assert!(outcome.is_success(), "unsubscribe failure is ignored");

    settle_until(|| api.calls_to(SIGNALS_DISCONNECT).len() == 1).await;
    let unsubscribe = &api.calls_to(SIGNALS_DISCONNECT)[0];
    assert_eq!(unsubscribe["clientId"], "C1");
    assert_eq!(unsubscribe["sessions"], SESSION);

    let subscribes = api.calls_to(SIGNALS_CONNECT);
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0]["clientId"], "C2");

    assert_eq!(settings.value(SettingsKey::ClientId).as_deref(), Some("C2"));
    assert_eq!(
        settings.value(SettingsKey::LastSubscribedClientId).as_deref(),
        Some("C2")
    );
    assert!(client.is_connected());
}

#[tokio::test]
async fn reassigned_client_id_after_confirmed_subscription_resubscribes() {
    let provider = ScriptedProvider::new("C2", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on(&provider);
    let settings = subscribed_settings("C1");
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;
    assert!(outcome.is_success(), "{outcome:?}");

    assert_eq!(provider.connects()[0].client_id.as_deref(), Some("C1"));
    settle_until(|| api.calls_to(SIGNALS_DISCONNECT).len() == 1).await;
    assert_eq!(api.calls_to(SIGNALS_DISCONNECT)[0]["clientId"], "C1");
    let subscribes = api.calls_to(SIGNALS_CONNECT);
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0]["clientId"], "C2");

    assert_eq!(settings.value(SettingsKey::ClientId).as_deref(), Some("C2"));
    assert_eq!(
        settings.value(SettingsKey::LastSubscribedClientId).as_deref(),
        Some("C2")
    );
    assert!(!settings.flag(SettingsKey::ExpectsSubscriptionComplete));
    assert!(client.is_connected());
}

#[tokio::test]
async fn repeated_client_id_event_subscribes_once() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let pending = client.connect(None).expect("connect starts");
    settle_until(|| api.calls_to(SIGNALS_CONNECT).len() == 1).await;

    let repeat = ClientIdEvent {
        handle: ConnectionHandle::detached(1),
        client_id: "C1".into(),
    };
    provider.events().new_client_id.publish(&repeat);
    provider.events().new_client_id.publish(&repeat);
    tokio::task::yield_now().await;
    provider.confirm_subscription(SESSION);

    let outcome = pending.wait().await;
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(api.calls_to(SIGNALS_CONNECT).len(), 1);
    assert!(api.calls_to(SIGNALS_DISCONNECT).is_empty());
}

#[tokio::test]
async fn new_session_key_resubscribes_same_client_id() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on(&provider);
    let settings = settings_with(&[
        (SettingsKey::ClientId.as_str(), "C1"),
        (SettingsKey::SessionKey.as_str(), "old-session"),
        (SettingsKey::LastSubscribedClientId.as_str(), "C1"),
    ]);
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;

    assert!(outcome.is_success());
    assert_eq!(provider.connects()[0].client_id.as_deref(), Some("C1"));
    assert_eq!(api.calls_to(SIGNALS_CONNECT).len(), 1);
    assert!(api.calls_to(SIGNALS_DISCONNECT).is_empty());
    assert_eq!(settings.value(SettingsKey::SessionKey).as_deref(), Some(SESSION));
    assert_eq!(
        settings.value(SettingsKey::LastSubscribedClientId).as_deref(),
        Some("C1")
    );
}

#[tokio::test]
async fn identity_reset_drops_recorded_versions() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on(&provider);
    let settings = settings_with(&[
        (SettingsKey::ClientId.as_str(), "C1"),
        (SettingsKey::SessionKey.as_str(), "old-session"),
        ("VERSION.messages", "4"),
    ]);
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;

    assert!(outcome.is_success());
    assert!(provider.connects()[0].versions.is_empty());
    assert_eq!(settings.get("VERSION.messages"), None);
}

#[tokio::test]
async fn presence_category_and_versions_are_forwarded() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on(&provider);
    let settings = settings_with(&[
        (SettingsKey::ClientId.as_str(), "C1"),
        (SettingsKey::SessionKey.as_str(), SESSION),
        (SettingsKey::ExpectsSubscriptionComplete.as_str(), "true"),
    ]);
    let client = client_for(&provider, &api, &settings);

    provider.events().version_changed.publish(&VersionEntry {
        key: "messages".into(),
        value: 7,
    });
    let presence = Presence {
        category: Some("Phone".into()),
        ..Presence::default()
    };
    let outcome = client
        .connect(Some(presence.clone()))
        .expect("connect starts")
        .wait()
        .await;

    assert!(outcome.is_success());
    let call = &provider.connects()[0];
    assert_eq!(call.versions.get("messages"), Some(&7));
    assert_eq!(call.presence.as_ref(), Some(&presence));
    assert_eq!(api.calls_to(SIGNALS_CONNECT)[0]["category"], "Phone");
}

// ─────────────────────────────────────────────────────────────────────────────
// Single flight and preconditions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_future() {
    let provider = ScriptedProvider::new("C1", AckMode::Never);
    let api = RecordingApi::new(Some(SESSION));
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let first = client.connect(None).expect("connect starts");
    let second = client.connect(None).expect("joins the connect in flight");
    assert!(first.ptr_eq(&second));
    assert!(client.connect_in_flight());

    let outcome = second.wait().await;
    assert!(matches!(outcome, Outcome::Failure(ref err) if err.is_timeout()), "{outcome:?}");
    assert_eq!(provider.connects().len(), 1);
    assert!(!client.connect_in_flight());

    let third = client.connect(None).expect("a new connect may start");
    assert!(!third.ptr_eq(&first));
}

#[tokio::test]
async fn connect_without_api_session_is_rejected() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(None);
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let err = client.connect(None).expect_err("no session key");

    assert!(matches!(err, TetherError::NotAuthenticated(_)));
    assert!(!client.connect_in_flight());
    assert!(provider.connects().is_empty());
}

#[tokio::test]
async fn connect_while_provider_connected_fails_the_future() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    provider.set_live(ConnectionState::Authenticated, Some("C1"));
    let api = RecordingApi::new(Some(SESSION));
    let settings = subscribed_settings("C1");
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;

    assert!(
        matches!(outcome, Outcome::Failure(ref err) if err.is_contract_violation()),
        "{outcome:?}"
    );
    assert!(provider.connects().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unconfirmed_subscription_times_out_and_resets() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;
    assert!(matches!(outcome, Outcome::Failure(ref err) if err.is_timeout()), "{outcome:?}");

    settle_until(|| provider.resets() == 1).await;
    assert!(provider.handle_disconnects().is_empty());
    assert!(settings.flag(SettingsKey::ExpectsSubscriptionComplete));
    assert_eq!(settings.value(SettingsKey::LastSubscribedClientId), None);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn rejected_subscription_drops_the_channel() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.respond(SIGNALS_CONNECT, Ok(ServerResponse::rejected("{\"success\":false}")));
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;

    assert!(
        matches!(outcome, Outcome::Failure(TetherError::Remote { ref method, .. }) if method == SIGNALS_CONNECT),
        "{outcome:?}"
    );
    let dropped = provider.handle_disconnects();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].0.generation(), 1);
    assert!(dropped[0].1, "dropped as a network loss so it reconnects");
    assert_eq!(provider.resets(), 0);
}

#[tokio::test]
async fn mismatched_subscription_id_is_logged_and_accepted() {
    let capture = LogCapture::default();
    let _guard = capture.install_json();

    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    api.confirm_on_with_id(&provider, "someone-else");
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let outcome = client.connect(None).expect("connect starts").wait().await;

    assert!(outcome.is_success());
    let line = capture
        .jsonl()
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json log line"))
        .find(|entry| entry["message"] == "subscription id does not match the session key")
        .expect("mismatch is logged");
    assert_eq!(line["level"], "WARN");
    assert_eq!(line["subscription_id"], "someone-else");
    assert_eq!(line["session_key"], SESSION);
}

// ─────────────────────────────────────────────────────────────────────────────
// Session status and disconnect
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn is_connected_requires_live_id_to_match_store() {
    let provider = ScriptedProvider::new("A", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    let settings = subscribed_settings("A");
    let client = client_for(&provider, &api, &settings);

    provider.set_live(ConnectionState::Authenticated, Some("A"));
    assert!(client.is_connected());

    provider.set_live(ConnectionState::Authenticated, Some("B"));
    assert!(!client.is_connected());

    provider.set_live(ConnectionState::Connected, Some("A"));
    assert!(!client.is_connected());

    provider.set_live(ConnectionState::Authenticated, None);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn disconnect_is_forwarded_to_provider() {
    let provider = ScriptedProvider::new("C1", AckMode::Immediate);
    let api = RecordingApi::new(Some(SESSION));
    let settings = settings_with(&[]);
    let client = client_for(&provider, &api, &settings);

    let done = client.disconnect(false);

    assert!(done.is_success());
    assert_eq!(provider.disconnects(), vec![false]);
}
