//! Recovery from an expired server session

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ConnectError, Result};
use crate::middleware::{EndpointResponse, Middleware, MiddlewareContext, Next};

/// Header carrying the fresh session token on the retried request
pub const CSRF_TOKEN_HEADER: &str = "x-csrf-token";

/// Called when a request comes back 401.
///
/// Returns a fresh session token to retry with, or `None` to give up.
#[async_trait]
pub trait SessionInvalidCallback: Send + Sync {
    async fn on_invalid_session(&self) -> Option<String>;
}

/// Retries a 401 exactly once after the callback renews the session
pub struct InvalidSessionMiddleware {
    callback: Arc<dyn SessionInvalidCallback>,
}

impl InvalidSessionMiddleware {
    pub fn new(callback: Arc<dyn SessionInvalidCallback>) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl Middleware for InvalidSessionMiddleware {
    async fn invoke(&self, context: MiddlewareContext, next: Next<'_>) -> Result<EndpointResponse> {
        let retry = context.clone();
        let response = next.run(context).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(service = %retry.service, method = %retry.method, "Session invalid");
        let Some(token) = self.callback.on_invalid_session().await else {
            return Ok(response);
        };

        let mut retry = retry;
        let value = HeaderValue::from_str(&token)
            .map_err(|e| ConnectError::InvalidArguments(format!("invalid session token: {}", e)))?;
        retry.request.headers.insert(CSRF_TOKEN_HEADER, value);
        info!(service = %retry.service, method = %retry.method, "Retrying call with renewed session");
        next.run(retry).await
    }
}
