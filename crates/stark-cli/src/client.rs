//! HTTP client against the gateway's admin surface.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Exit-code taxonomy: 0 success, 1 user error, 2 auth, 3 transient,
/// 4 conflict.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad input or a resource the user named does not exist.
    #[error("{0}")]
    User(String),

    /// Authentication or authorization failure.
    #[error("auth: {0}")]
    Auth(String),

    /// The orchestrator was unreachable or transiently failing.
    #[error("transient: {0}")]
    Transient(String),

    /// The request conflicted with current state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl CliError {
    /// The process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Auth(_) => 2,
            Self::Transient(_) => 3,
            Self::Conflict(_) => 4,
        }
    }
}

/// A result type using `CliError`.
pub type Result<T> = std::result::Result<T, CliError>;

/// The gateway client.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a client for the given gateway and bearer token.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// `GET` a JSON resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }

    /// `POST` a JSON body and decode the JSON reply.
    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }

    /// `DELETE` with an optional JSON body.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str, body: Option<&Value>) -> Result<T> {
        let mut builder = self.http.delete(self.url(path)).bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(transport)?;
        Self::decode(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| CliError::Transient(format!("bad response body: {e}")));
        }

        let message = match response.json::<Value>().await {
            Ok(body) => body["error"]["message"]
                .as_str()
                .unwrap_or("request failed")
                .to_string(),
            Err(_) => format!("request failed with status {status}"),
        };

        Err(match status.as_u16() {
            401 | 403 => CliError::Auth(message),
            409 => CliError::Conflict(message),
            429 | 500..=599 => CliError::Transient(message),
            _ => CliError::User(message),
        })
    }
}

fn transport(err: reqwest::Error) -> CliError {
    CliError::Transient(format!("gateway unreachable: {err}"))
}
