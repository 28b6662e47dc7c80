//! Remote signals API.
//!
//! Subscribe and unsubscribe are plain request/response calls against the
//! service's HTTP API, authenticated by the API session key.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tether_core::{TetherError, TetherResult};
use tracing::{debug, instrument};
use url::Url;

/// Subscribe a client id to the session's push events.
pub const SIGNALS_CONNECT: &str = "signals/connect";

/// Drop a client id's subscription.
pub const SIGNALS_DISCONNECT: &str = "signals/disconnect";

/// Call parameters, sent as form fields.
pub type Params = BTreeMap<String, String>;

/// Generic response to a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// Whether the service reported success.
    pub success: bool,
    /// Raw response body.
    pub raw: String,
}

impl ServerResponse {
    /// Successful response with an empty body.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            raw: String::new(),
        }
    }

    /// Unsuccessful response carrying `raw`.
    #[must_use]
    pub fn rejected(raw: impl Into<String>) -> Self {
        Self {
            success: false,
            raw: raw.into(),
        }
    }
}

/// The authenticated API session and its remote calls.
#[async_trait]
pub trait SignalsApi: Send + Sync {
    /// Current API session key.
    fn session_key(&self) -> Option<String>;

    /// Whether the API session is established.
    fn is_authenticated(&self) -> bool;

    /// Call `method` with `params`.
    ///
    /// # Errors
    /// Returns [`TetherError::Remote`] or [`TetherError::Transport`] when the
    /// call does not produce a response.
    async fn execute(&self, method: &str, params: Params) -> TetherResult<ServerResponse>;
}

#[derive(Deserialize)]
struct SuccessBody {
    #[serde(default)]
    success: bool,
}

/// [`SignalsApi`] over HTTP.
///
/// Calls POST their parameters as a form to `<base_url>/<method>` and read
/// `{"success": bool}` from the JSON body.
#[derive(Debug)]
pub struct HttpSignalsApi {
    client: reqwest::Client,
    base_url: Url,
    session_key: RwLock<Option<String>>,
}

impl HttpSignalsApi {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a client for `base_url`.
    ///
    /// # Errors
    /// Returns [`TetherError::Config`] for invalid URLs or client settings.
    pub fn new(base_url: &str, timeout: Duration) -> TetherResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| TetherError::Config(format!("invalid api url {base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TetherError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            session_key: RwLock::new(None),
        })
    }

    /// Builder: start with an established session.
    #[must_use]
    pub fn with_session_key(self, session_key: impl Into<String>) -> Self {
        *self.session_key.write() = Some(session_key.into());
        self
    }

    /// Replace (or drop) the API session.
    pub fn set_session_key(&self, session_key: Option<String>) {
        *self.session_key.write() = session_key;
    }

    /// Base URL calls are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl SignalsApi for HttpSignalsApi {
    fn session_key(&self) -> Option<String> {
        self.session_key.read().clone()
    }

    fn is_authenticated(&self) -> bool {
        self.session_key.read().as_ref().is_some_and(|key| !key.is_empty())
    }

    #[instrument(skip(self, params), fields(base_url = %self.base_url))]
    async fn execute(&self, method: &str, params: Params) -> TetherResult<ServerResponse> {
        let url = self
            .base_url
            .join(method)
            .map_err(|e| TetherError::Config(format!("invalid method {method}: {e}")))?;

        let response = self
            .client
            .post(url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TetherError::Transport(format!("{method} request failed: {e}")))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| TetherError::Transport(format!("{method} response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(TetherError::Remote {
                method: method.to_string(),
                body: format!("HTTP {}: {raw}", status.as_u16()),
            });
        }

        let success = serde_json::from_str::<SuccessBody>(&raw).is_ok_and(|body| body.success);
        debug!(method, success, "remote call finished");
        Ok(ServerResponse { success, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let api = HttpSignalsApi::new("https://api.example.com/v1", HttpSignalsApi::DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(api.base_url().as_str(), "https://api.example.com/v1/");
        assert_eq!(
            api.base_url().join(SIGNALS_CONNECT).unwrap().as_str(),
            "https://api.example.com/v1/signals/connect"
        );
    }

    #[test]
    fn session_tracks_key() {
        let api = HttpSignalsApi::new("http://localhost:1", HttpSignalsApi::DEFAULT_TIMEOUT).unwrap();
        assert!(!api.is_authenticated());
        api.set_session_key(Some(String::new()));
        assert!(!api.is_authenticated());
        let api = api.with_session_key("s-1");
        assert!(api.is_authenticated());
        assert_eq!(api.session_key().as_deref(), Some("s-1"));
    }

    #[test]
    fn rejects_bad_url() {
        assert!(matches!(
            HttpSignalsApi::new("::nope", HttpSignalsApi::DEFAULT_TIMEOUT),
            Err(TetherError::Config(_))
        ));
    }
}
