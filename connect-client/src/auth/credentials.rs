//! Credentials prompt and login outcome

use async_trait::async_trait;
use serde::Serialize;

/// Title reported when the password grant was rejected
pub const INCORRECT_CREDENTIALS_TITLE: &str = "Incorrect username or password";

/// Username and password for the password grant
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Persist the refresh token across restarts (default true)
    pub stay_logged_in: Option<bool>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            stay_logged_in: None,
        }
    }

    pub fn stay_logged_in(mut self, stay: bool) -> Self {
        self.stay_logged_in = Some(stay);
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("stay_logged_in", &self.stay_logged_in)
            .finish()
    }
}

/// What the provider is told when asked for credentials
#[derive(Debug, Clone, Default)]
pub struct CredentialsRequest {
    /// `error_description` of the previous rejected attempt
    pub message: Option<String>,
    /// The server rejected the credentials given on an earlier prompt
    pub password_rejected: bool,
}

/// Supplies credentials on demand. Returning `None` declines the prompt and
/// ends the login attempt.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self, request: CredentialsRequest) -> Option<Credentials>;
}

/// Provider with one fixed set of credentials.
///
/// Declines once the server has rejected them, so a wrong password ends the
/// login instead of retrying forever. A rejected refresh token does not count.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self, request: CredentialsRequest) -> Option<Credentials> {
        if request.password_rejected {
            None
        } else {
            Some(self.credentials.clone())
        }
    }
}

/// Outcome of `login()`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LoginResult {
    pub fn authenticated() -> Self {
        Self {
            authenticated: true,
            ..Default::default()
        }
    }

    /// No tokens and nobody to ask for credentials
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            error_title: Some(INCORRECT_CREDENTIALS_TITLE.to_string()),
            error_message: Some(message.into()),
        }
    }
}
