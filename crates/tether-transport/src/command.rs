//! Decoded command values exchanged over the push channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Client metadata announced when connecting and subscribing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    /// Presence category (for example `"Phone"` or `"Browser"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-form user agent description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Extra attributes forwarded verbatim.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
}

impl Presence {
    /// Create an empty presence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Commands the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Server acknowledged the connect frame and assigned a client id.
    Connect(ConnectCommand),
    /// Server confirmed a subscription for the session.
    SubscriptionComplete(SubscriptionCompleteCommand),
    /// Business event.
    Signal(SignalCommand),
    /// Presence roster update.
    Presence(PresenceCommand),
    /// Server asks the client to drop the connection.
    Disconnect(DisconnectCommand),
    /// Server announces a range of versions to backfill.
    Backfill(BackfillCommand),
    /// Keeps idle intermediaries from timing out.
    Noop,
}

impl Command {
    /// Wire name of the command's action.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::SubscriptionComplete(_) => "SUBSCRIPTION_COMPLETE",
            Self::Signal(_) => "SIGNAL",
            Self::Presence(_) => "PRESENCE",
            Self::Disconnect(_) => "DISCONNECT",
            Self::Backfill(_) => "BACKFILL",
            Self::Noop => "NOOP",
        }
    }
}

/// Connect acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectCommand {
    /// Client id assigned (or confirmed) by the server.
    pub client_id: String,
    /// Server-side version counters, when the server reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<HashMap<String, i64>>,
}

impl ConnectCommand {
    /// Create an acknowledgement for `client_id`.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            versions: None,
        }
    }
}

/// Subscription confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCompleteCommand {
    /// Subscription id; expected to equal the session key.
    pub subscription_id: String,
    /// Channels now delivering to this client.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl SubscriptionCompleteCommand {
    /// Create a confirmation for `subscription_id`.
    #[must_use]
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            channels: Vec::new(),
        }
    }
}

/// A version counter update carried by a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    /// Counter name.
    pub key: String,
    /// New counter value.
    pub value: i64,
}

/// Business payload of a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Signal id.
    #[serde(default)]
    pub id: String,
    /// Scope (for example `"device"`).
    #[serde(default)]
    pub scope: String,
    /// Signal type.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Event name within the type.
    #[serde(default)]
    pub event: String,
    /// Opaque content.
    #[serde(default)]
    pub content: serde_json::Value,
}

fn no_backfill_version() -> i64 {
    -1
}

/// Signal delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalCommand {
    /// The signal itself.
    pub signal: Signal,
    /// Version counter advanced by this signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionEntry>,
    /// Highest version still being backfilled, or -1.
    #[serde(default = "no_backfill_version")]
    pub max_backfill_version: i64,
    /// Explicit backfill flag.
    #[serde(default)]
    pub backfill: bool,
}

impl SignalCommand {
    /// Create a live (non-backfill) signal delivery.
    #[must_use]
    pub const fn new(signal: Signal) -> Self {
        Self {
            signal,
            version: None,
            max_backfill_version: -1,
            backfill: false,
        }
    }

    /// Whether this delivery replays history rather than a live event.
    #[must_use]
    pub const fn is_backfill(&self) -> bool {
        self.backfill || self.max_backfill_version > -1
    }
}

/// Presence roster update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceCommand {
    /// Presences currently online.
    #[serde(default)]
    pub presence: Vec<Presence>,
}

/// Server-requested disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectCommand {
    /// Do not reconnect afterwards.
    #[serde(default)]
    pub stop: bool,
}

/// Backfill announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillCommand {
    /// Counter being backfilled.
    pub key: String,
    /// First version (inclusive).
    pub from_version: i64,
    /// Last version (inclusive).
    pub to_version: i64,
}

/// Ping/pong control frame.
///
/// The short form carries no fields. The long form echoes `timestamp` and
/// `token` from the request it answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPongCommand {
    /// `true` for PING, `false` for PONG.
    pub request: bool,
    /// Sender timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Correlation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl PingPongCommand {
    /// Short-form ping.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            request: true,
            timestamp: None,
            token: None,
        }
    }

    /// Short-form pong.
    #[must_use]
    pub const fn pong() -> Self {
        Self {
            request: false,
            timestamp: None,
            token: None,
        }
    }

    /// Whether this frame carries long-form fields.
    #[must_use]
    pub const fn is_long_form(&self) -> bool {
        self.timestamp.is_some() || self.token.is_some()
    }

    /// Long-form pong answering this request.
    #[must_use]
    pub fn reply(&self) -> Self {
        Self {
            request: false,
            timestamp: self
                .timestamp
                .or_else(|| Some(chrono::Utc::now().timestamp_millis())),
            token: self.token.clone(),
        }
    }
}

/// Connect frame the client sends first on every channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Client id to resume, if one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Last seen version counters.
    #[serde(default)]
    pub versions: HashMap<String, i64>,
    /// Presence to announce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}
