//! Call middleware chain
//!
//! Every endpoint call runs through the registered middlewares in order.
//! Each one receives the call context and a [`Next`] continuation; it may
//! replace the context before passing it on, short-circuit with its own
//! response, or inspect the response on the way back. After the last
//! middleware comes the terminal [`Fetch`] step that performs the HTTP
//! request.
//!
//! ```text
//! call() ──► mw[0] ──► mw[1] ──► … ──► Fetch
//!              ◄──────── response ◄──────┘
//! ```

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::error::Result;

/// Per-call options
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Run `login()` before the call (default true)
    pub require_credentials: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            require_credentials: true,
        }
    }
}

impl CallOptions {
    pub fn anonymous() -> Self {
        Self {
            require_credentials: false,
        }
    }
}

/// Outgoing HTTP request, freely editable by middleware
#[derive(Debug, Clone)]
pub struct EndpointRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl EndpointRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn to_reqwest(&self, http: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = http
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

/// Fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct EndpointResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl EndpointResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 200 response with a JSON body, for middleware that answers directly
    pub fn json(value: &Value) -> Result<Self> {
        Ok(Self::new(StatusCode::OK, serde_json::to_vec(value)?))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Everything a middleware knows about the call
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub service: String,
    pub method: String,
    pub params: Option<Value>,
    pub options: CallOptions,
    pub request: EndpointRequest,
    /// The call is a replay from the offline queue
    pub is_deferred: bool,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(&self, context: MiddlewareContext, next: Next<'_>) -> Result<EndpointResponse>;
}

/// Terminal step of the chain
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, context: MiddlewareContext) -> Result<EndpointResponse>;
}

/// Continuation into the rest of the chain. `Copy`, so a middleware may run
/// the remainder more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Fetch,
}

impl<'a> Next<'a> {
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], terminal: &'a dyn Fetch) -> Self {
        Self {
            middlewares,
            terminal,
        }
    }

    pub async fn run(self, context: MiddlewareContext) -> Result<EndpointResponse> {
        match self.middlewares.split_first() {
            Some((first, rest)) => {
                first
                    .invoke(
                        context,
                        Next {
                            middlewares: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => self.terminal.fetch(context).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl Fetch for Echo {
        async fn fetch(&self, context: MiddlewareContext) -> Result<EndpointResponse> {
            let trail = context.request.header("x-trail").unwrap_or("").to_string();
            EndpointResponse::json(&json!({ "method": context.method, "trail": trail }))
        }
    }

    struct Tag {
        name: &'static str,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tag {
        async fn invoke(&self, mut context: MiddlewareContext, next: Next<'_>) -> Result<EndpointResponse> {
            self.order.lock().unwrap().push(format!("{} in", self.name));
            let trail = format!("{}{}", context.request.header("x-trail").unwrap_or(""), self.name);
            context.request.headers.insert("x-trail", trail.parse().unwrap());
            let response = next.run(context).await;
            self.order.lock().unwrap().push(format!("{} out", self.name));
            response
        }
    }

    struct Rename;

    #[async_trait]
    impl Middleware for Rename {
        async fn invoke(&self, mut context: MiddlewareContext, next: Next<'_>) -> Result<EndpointResponse> {
            context.method = "renamed".into();
            next.run(context).await
        }
    }

    fn context() -> MiddlewareContext {
        MiddlewareContext {
            service: "FooEndpoint".into(),
            method: "fooMethod".into(),
            params: None,
            options: CallOptions::default(),
            request: EndpointRequest {
                method: Method::POST,
                url: Url::parse("http://localhost/connect/FooEndpoint/fooMethod").unwrap(),
                headers: HeaderMap::new(),
                body: None,
            },
            is_deferred: false,
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_unwinds_in_reverse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tag { name: "a", order: Arc::clone(&order) }),
            Arc::new(Tag { name: "b", order: Arc::clone(&order) }),
        ];

        let response = Next::new(&middlewares, &Echo).run(context()).await.unwrap();
        let body: Value = serde_json::from_slice(&response.body).unwrap();

        assert_eq!(body["trail"], "ab");
        assert_eq!(*order.lock().unwrap(), vec!["a in", "b in", "b out", "a out"]);
    }

    #[tokio::test]
    async fn test_replaced_context_reaches_terminal() {
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(Rename)];
        let response = Next::new(&middlewares, &Echo).run(context()).await.unwrap();
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["method"], "renamed");
    }

    #[tokio::test]
    async fn test_empty_chain_goes_straight_to_terminal() {
        let response = Next::new(&[], &Echo).run(context()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[test]
    fn test_call_options_require_credentials_by_default() {
        assert!(CallOptions::default().require_credentials);
        assert!(!CallOptions::anonymous().require_credentials);
    }
}
