use serde_json::{Value, json};

/// Supplies the `params` of the upstream authentication request.
///
/// The [`FeedSupervisor`](crate::supervisor::FeedSupervisor) wraps them into a `public/auth`
/// request carrying the reserved [`AUTH_REQUEST_ID`](crate::protocol::AUTH_REQUEST_ID).
pub trait Authenticator: Send + Sync {
    fn auth_params(&self) -> Value;
}

/// API key `client_credentials` grant.
#[derive(Clone)]
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl Authenticator for ClientCredentials {
    fn auth_params(&self) -> Value {
        json!({
            "grant_type": "client_credentials",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        })
    }
}
