//! OAuth token endpoint client

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::token::{TokenErrorResponse, TokenResponse};
use crate::error::AuthError;

/// A grant sent to the token endpoint
pub enum Grant {
    RefreshToken(String),
    Password { username: String, password: String },
}

impl Grant {
    fn name(&self) -> &'static str {
        match self {
            Self::RefreshToken(_) => "refresh_token",
            Self::Password { .. } => "password",
        }
    }

    fn form(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::RefreshToken(token) => {
                vec![("grant_type", "refresh_token"), ("refresh_token", token.as_str())]
            }
            Self::Password { username, password } => vec![
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
        }
    }
}

/// Result of a grant the server answered
pub enum TokenExchange {
    Issued(TokenResponse),
    /// 400 or 401 with an OAuth error body
    Rejected {
        status: StatusCode,
        response: TokenErrorResponse,
    },
}

pub struct TokenEndpoint {
    http: reqwest::Client,
    url: Url,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl TokenEndpoint {
    pub fn new(
        http: reqwest::Client,
        url: Url,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            url,
            client_id,
            client_secret,
        }
    }

    /// Send a grant. Cancelling `cancel` resolves to `AuthError::Aborted`.
    pub async fn exchange(
        &self,
        grant: &Grant,
        cancel: &CancellationToken,
    ) -> Result<TokenExchange, AuthError> {
        debug!(grant = grant.name(), url = %self.url, "Requesting token");

        let mut request = self.http.post(self.url.clone()).form(&grant.form());
        if let Some(client_id) = &self.client_id {
            request = request.basic_auth(client_id, self.client_secret.as_deref());
        }

        let send = async {
            let response = request
                .send()
                .await
                .map_err(|e| AuthError::Transport(e.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| AuthError::Transport(e.to_string()))?;
            Ok::<_, AuthError>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Aborted),
            result = send => result?,
        };

        match status {
            status if status.is_success() => serde_json::from_str(&body)
                .map(TokenExchange::Issued)
                .map_err(|e| AuthError::MalformedToken(e.to_string())),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                serde_json::from_str(&body)
                    .map(|response| TokenExchange::Rejected { status, response })
                    .map_err(|_| AuthError::UnexpectedResponse {
                        status: status.as_u16(),
                        body,
                    })
            }
            _ => Err(AuthError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn exchange_with(response: ResponseTemplate) -> Result<TokenExchange, AuthError> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(response)
            .mount(&server)
            .await;
        let endpoint = TokenEndpoint::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/oauth/token", server.uri())).unwrap(),
            None,
            None,
        );
        endpoint
            .exchange(
                &Grant::RefreshToken("stale".into()),
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_any_2xx_issues_tokens() {
        let body = json!({ "access_token": "a", "refresh_token": "r" });
        for status in [200, 201] {
            match exchange_with(ResponseTemplate::new(status).set_body_json(&body)).await {
                Ok(TokenExchange::Issued(response)) => assert_eq!(response.access_token, "a"),
                _ => panic!("status {} was not treated as issued", status),
            }
        }
    }

    #[tokio::test]
    async fn test_oauth_error_body_is_rejection() {
        let result = exchange_with(
            ResponseTemplate::new(401).set_body_json(json!({ "error": "invalid_token" })),
        )
        .await;
        match result {
            Ok(TokenExchange::Rejected { status, response }) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(response.error, "invalid_token");
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_unexpected() {
        let result = exchange_with(ResponseTemplate::new(503).set_body_string("down")).await;
        assert!(matches!(
            result,
            Err(AuthError::UnexpectedResponse { status: 503, .. })
        ));
    }
}
