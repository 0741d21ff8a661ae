//! Endpoint client
//!
//! [`ConnectClient`] posts JSON to `{base_url}{prefix}/{service}/{method}`
//! through the middleware chain, authenticates against the OAuth token
//! endpoint, and stores calls made while offline for later replay.
//!
//! ## Authentication
//!
//! `login()` tries, in order:
//! 1. a valid access token
//! 2. a valid refresh token (`grant_type=refresh_token`)
//! 3. credentials from the provider (`grant_type=password`), re-prompting
//!    with the server's `error_description` after each rejection
//!
//! Concurrent callers share one in-flight attempt.

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{
    AuthTokens, CredentialsProvider, CredentialsRequest, Grant, LoginResult, TokenEndpoint,
    TokenExchange,
};
use crate::config::ClientConfig;
use crate::connection_state::{ConnectionState, ConnectionStateListener, ConnectionStateStore};
use crate::connectivity::Connectivity;
use crate::deferred::{DeferredCallHandler, DeferredCallProcessor, SubmitCall};
use crate::error::{AuthError, ConnectError, Result};
use crate::middleware::{
    CallOptions, EndpointRequest, EndpointResponse, Fetch, Middleware, MiddlewareContext, Next,
};
use crate::queue::{DeferredCall, RequestQueue};
use crate::response::{assert_response_is_ok, parse_json};
use crate::storage::{ClientStorage, KeyValueStore};

/// Marker header sent with every endpoint call
pub const CSRF_MARKER_HEADER: &str = "x-requested-with";

type LoginFuture = Shared<BoxFuture<'static, std::result::Result<LoginResult, AuthError>>>;

/// Outcome of [`ConnectClient::deferrable_call`]
#[derive(Debug, Clone, PartialEq)]
pub enum DeferrableResult {
    /// The server answered
    Completed(Value),
    /// The call was stored for replay
    Deferred(DeferredCall),
}

impl DeferrableResult {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Deferred(_) => None,
        }
    }

    pub fn deferred_call(&self) -> Option<&DeferredCall> {
        match self {
            Self::Completed(_) => None,
            Self::Deferred(call) => Some(call),
        }
    }
}

/// Builder for [`ConnectClient`]
pub struct ConnectClientBuilder {
    config: ClientConfig,
    storage: Option<ClientStorage>,
    http: Option<reqwest::Client>,
    connection_state: Option<Arc<ConnectionStateStore>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    deferred_call_handler: Option<Arc<dyn DeferredCallHandler>>,
}

impl ConnectClientBuilder {
    /// Use an already opened storage instead of `config.storage_dir`
    pub fn storage(mut self, storage: ClientStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Share a state store with other components (defaults to a new one in `Connected`)
    pub fn connection_state(mut self, state: Arc<ConnectionStateStore>) -> Self {
        self.connection_state = Some(state);
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Append a middleware; they run in the order added
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn deferred_call_handler(mut self, handler: Arc<dyn DeferredCallHandler>) -> Self {
        self.deferred_call_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<ConnectClient> {
        self.config.validate()?;

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder().build()?,
        };
        let storage = match self.storage {
            Some(storage) => storage,
            None => ClientStorage::open(&self.config.storage_dir)?,
        };
        let local = storage.local()?;
        let tokens = AuthTokens::restore(&local);
        if tokens.refresh_token.is_some() {
            debug!("Restored refresh token");
        }

        let deferred = DeferredCallProcessor::new(RequestQueue::open(&storage)?);
        deferred.set_handler(self.deferred_call_handler);

        let token_endpoint = TokenEndpoint::new(
            http.clone(),
            self.config.token_endpoint_url()?,
            self.config.client_id.clone(),
            self.config.client_secret.clone(),
        );
        let probe_url = self.config.probe_url()?;

        Ok(ConnectClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                http,
                token_endpoint,
                probe_url,
                connection_state: self
                    .connection_state
                    .unwrap_or_else(|| Arc::new(ConnectionStateStore::new(ConnectionState::Connected))),
                credentials: self.credentials,
                middlewares: RwLock::new(self.middlewares),
                tokens: tokio::sync::RwLock::new(tokens),
                login: tokio::sync::Mutex::new(None),
                abort: Mutex::new(CancellationToken::new()),
                local,
                deferred,
            }),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    http: reqwest::Client,
    token_endpoint: TokenEndpoint,
    probe_url: Url,
    connection_state: Arc<ConnectionStateStore>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    tokens: tokio::sync::RwLock<AuthTokens>,
    login: tokio::sync::Mutex<Option<LoginFuture>>,
    /// Replaced on every logout; requests watch the token current at their start
    abort: Mutex<CancellationToken>,
    local: KeyValueStore,
    deferred: DeferredCallProcessor,
}

impl ClientInner {
    fn abort_token(&self) -> CancellationToken {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn read_response(request: reqwest::RequestBuilder) -> Result<EndpointResponse> {
    let response = request.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();
    Ok(EndpointResponse {
        status,
        headers,
        body,
    })
}

#[async_trait::async_trait]
impl Fetch for ClientInner {
    async fn fetch(&self, context: MiddlewareContext) -> Result<EndpointResponse> {
        let cancel = self.abort_token();
        debug!(
            service = %context.service,
            method = %context.method,
            deferred = context.is_deferred,
            "Calling endpoint"
        );

        self.connection_state.loading_started();
        let request = context.request.to_reqwest(&self.http);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Aborted),
            result = read_response(request) => result,
        };

        match &result {
            Ok(_) | Err(ConnectError::Aborted) => self.connection_state.loading_finished(),
            Err(e) => {
                warn!(service = %context.service, method = %context.method, error = %e, "Endpoint unreachable");
                self.connection_state.loading_failed();
            }
        }
        result
    }
}

fn unauthenticated(rejection: Option<String>) -> LoginResult {
    match rejection {
        Some(message) => LoginResult::rejected(message),
        None => LoginResult::anonymous(),
    }
}

async fn authenticate(inner: &ClientInner) -> std::result::Result<LoginResult, AuthError> {
    let cancel = inner.abort_token();
    let mut tokens = inner.tokens.read().await.clone();
    let mut message: Option<String> = None;
    let mut password_rejection: Option<String> = None;
    let mut stay_logged_in = true;

    loop {
        if tokens.valid_access_token().is_some() {
            return Ok(LoginResult::authenticated());
        }

        let grant = if let Some(refresh) = tokens.valid_refresh_token() {
            Grant::RefreshToken(refresh.token().to_string())
        } else {
            let Some(provider) = &inner.credentials else {
                return Ok(unauthenticated(password_rejection));
            };
            let request = CredentialsRequest {
                message: message.clone(),
                password_rejected: password_rejection.is_some(),
            };
            match provider.credentials(request).await {
                Some(credentials) => {
                    stay_logged_in = credentials.stay_logged_in.unwrap_or(true);
                    Grant::Password {
                        username: credentials.username,
                        password: credentials.password,
                    }
                }
                None => return Ok(unauthenticated(password_rejection)),
            }
        };

        match inner.token_endpoint.exchange(&grant, &cancel).await? {
            TokenExchange::Issued(response) => {
                let issued = AuthTokens::from_response(&response)?;
                let mut current = inner.tokens.write().await;
                if cancel.is_cancelled() {
                    return Err(AuthError::Aborted);
                }
                if stay_logged_in {
                    issued.save(&inner.local)?;
                } else {
                    AuthTokens::default().save(&inner.local)?;
                }
                *current = issued;
                info!(
                    user = current
                        .access_token
                        .as_ref()
                        .and_then(|t| t.claims().user_name.as_deref())
                        .unwrap_or("-"),
                    "Authenticated"
                );
                return Ok(LoginResult::authenticated());
            }
            TokenExchange::Rejected { status, response } => {
                let description = response
                    .error_description
                    .clone()
                    .unwrap_or_else(|| response.error.clone());
                match grant {
                    Grant::RefreshToken(_) if response.error == "invalid_token" => {
                        info!("Refresh token rejected, discarding stored tokens");
                        tokens = AuthTokens::default();
                        let mut current = inner.tokens.write().await;
                        tokens.save(&inner.local)?;
                        *current = AuthTokens::default();
                    }
                    Grant::RefreshToken(_) => {
                        return Err(AuthError::UnexpectedResponse {
                            status: status.as_u16(),
                            body: format!("{}: {}", response.error, description),
                        });
                    }
                    Grant::Password { .. } => {
                        debug!(error = %response.error, "Password grant rejected");
                        password_rejection = Some(description.clone());
                    }
                }
                message = Some(description);
            }
        }
    }
}

fn validate_arguments(service: &str, method: &str) -> Result<()> {
    if service.is_empty() || method.is_empty() {
        return Err(ConnectError::InvalidArguments(
            "2 arguments required".to_string(),
        ));
    }
    Ok(())
}

/// Client for server endpoints. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ConnectClient {
    inner: Arc<ClientInner>,
}

impl ConnectClient {
    pub fn builder(config: ClientConfig) -> ConnectClientBuilder {
        ConnectClientBuilder {
            config,
            storage: None,
            http: None,
            connection_state: None,
            credentials: None,
            middlewares: Vec::new(),
            deferred_call_handler: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Path prefix for endpoint calls
    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    pub fn connection_state(&self) -> &Arc<ConnectionStateStore> {
        &self.inner.connection_state
    }

    pub fn queue(&self) -> &RequestQueue {
        self.inner.deferred.queue()
    }

    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner
            .middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_middlewares(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        *self
            .inner
            .middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner) = middlewares;
    }

    pub fn set_deferred_call_handler(&self, handler: Option<Arc<dyn DeferredCallHandler>>) {
        self.inner.deferred.set_handler(handler);
    }

    /// Online/offline signals wired to this client's state store
    pub fn connectivity(&self) -> Connectivity {
        Connectivity::new(
            Arc::clone(&self.inner.connection_state),
            self.inner.http.clone(),
            self.inner.probe_url.clone(),
        )
    }

    /// Current access token, if present and not expired
    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .tokens
            .read()
            .await
            .valid_access_token()
            .map(|t| t.token().to_string())
    }

    /// Call an endpoint method, logging in first
    pub async fn call(&self, service: &str, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with_options(service, method, params, CallOptions::default())
            .await
    }

    pub async fn call_with_options(
        &self,
        service: &str,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        self.request_call(service, method, params, options, false)
            .await
    }

    /// Call now when online, otherwise store the call for replay.
    ///
    /// A call that cannot reach the server is stored as well; any answer from
    /// the server, including an error, is returned as is.
    pub async fn deferrable_call(
        &self,
        service: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<DeferrableResult> {
        validate_arguments(service, method)?;

        if self.inner.connection_state.is_offline() {
            return self.defer(service, method, params).await;
        }

        match self.call(service, method, params.clone()).await {
            Ok(result) => Ok(DeferrableResult::Completed(result)),
            Err(e) if e.is_network_error() => {
                warn!(service, method, error = %e, "Server unreachable, deferring call");
                self.defer(service, method, params).await
            }
            Err(e) => Err(e),
        }
    }

    async fn defer(&self, service: &str, method: &str, params: Option<Value>) -> Result<DeferrableResult> {
        let call = self.queue().push(service, method, params).await?;
        info!(id = call.id, service, method, "Call deferred");
        Ok(DeferrableResult::Deferred(call))
    }

    /// Submit every stored call. See [`DeferredCallProcessor::process`].
    pub async fn process_deferred_calls(&self) -> Result<usize> {
        self.inner.deferred.process(self).await
    }

    /// Make sure the client holds a valid access token, if anyone can provide one
    pub async fn login(&self) -> Result<LoginResult> {
        if self.inner.tokens.read().await.valid_access_token().is_some() {
            return Ok(LoginResult::authenticated());
        }

        let login = {
            let mut in_flight = self.inner.login.lock().await;
            match in_flight.as_ref() {
                Some(login) => login.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let login = async move { authenticate(&inner).await }.boxed().shared();
                    *in_flight = Some(login.clone());
                    login
                }
            }
        };

        let result = login.clone().await;

        let mut in_flight = self.inner.login.lock().await;
        if in_flight.as_ref().is_some_and(|current| current.ptr_eq(&login)) {
            *in_flight = None;
        }
        Ok(result?)
    }

    /// Drop all tokens and abort every request in flight
    pub async fn logout(&self) -> Result<()> {
        self.inner.login.lock().await.take();

        let mut tokens = self.inner.tokens.write().await;
        *tokens = AuthTokens::default();
        tokens.save(&self.inner.local)?;
        {
            let mut abort = self
                .inner
                .abort
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            abort.cancel();
            *abort = CancellationToken::new();
        }
        drop(tokens);

        info!("Logged out");
        Ok(())
    }

    /// Submit stored calls whenever the state store comes back online.
    ///
    /// Must be called within a tokio runtime. Watching stops when the
    /// returned guard is dropped.
    pub fn watch_connectivity(&self) -> ConnectivityWatch {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let was_offline = AtomicBool::new(self.inner.connection_state.is_offline());
        let listener: ConnectionStateListener = Arc::new(move |_, next| {
            if next.is_offline() {
                was_offline.store(true, Ordering::SeqCst);
            } else if next == ConnectionState::Connected && was_offline.swap(false, Ordering::SeqCst) {
                let _ = tx.send(());
            }
        });

        let client = self.clone();
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                info!(pending = client.queue().len(), "Back online, submitting deferred calls");
                if let Err(e) = client.process_deferred_calls().await {
                    warn!(error = %e, "Deferred call submission failed");
                }
            }
        });

        self.inner
            .connection_state
            .add_state_change_listener(Arc::clone(&listener));
        ConnectivityWatch {
            state: Arc::clone(&self.inner.connection_state),
            listener,
            task,
        }
    }

    async fn request_call(
        &self,
        service: &str,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
        is_deferred: bool,
    ) -> Result<Value> {
        validate_arguments(service, method)?;

        if options.require_credentials {
            let login = self.login().await?;
            if !login.authenticated {
                debug!(service, method, "Calling without authentication");
            }
        }

        let request = self.build_request(service, method, params.as_ref()).await?;
        let context = MiddlewareContext {
            service: service.to_string(),
            method: method.to_string(),
            params,
            options,
            request,
            is_deferred,
        };

        let middlewares = self.middlewares();
        let response = Next::new(&middlewares, self.inner.as_ref())
            .run(context)
            .await?;
        assert_response_is_ok(&response)?;
        parse_json(&response)
    }

    async fn build_request(
        &self,
        service: &str,
        method: &str,
        params: Option<&Value>,
    ) -> Result<EndpointRequest> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let marker = HeaderValue::from_str(&self.inner.config.csrf_header_value)
            .map_err(|e| ConnectError::Config(format!("invalid csrf_header_value: {}", e)))?;
        headers.insert(CSRF_MARKER_HEADER, marker);

        if let Some(token) = self.inner.tokens.read().await.valid_access_token() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", token.token()))
                .map_err(|e| ConnectError::Auth(AuthError::MalformedToken(e.to_string())))?;
            headers.insert(AUTHORIZATION, bearer);
        }

        Ok(EndpointRequest {
            method: Method::POST,
            url: self.inner.config.endpoint_url(service, method)?,
            headers,
            body: params.map(serde_json::to_vec).transpose()?,
        })
    }
}

#[async_trait::async_trait]
impl SubmitCall for ConnectClient {
    async fn submit_call(&self, call: &DeferredCall) -> Result<Value> {
        self.request_call(
            &call.endpoint,
            &call.method,
            call.params.clone(),
            CallOptions::default(),
            true,
        )
        .await
    }
}

/// Guard returned by [`ConnectClient::watch_connectivity`]
pub struct ConnectivityWatch {
    state: Arc<ConnectionStateStore>,
    listener: ConnectionStateListener,
    task: JoinHandle<()>,
}

impl Drop for ConnectivityWatch {
    fn drop(&mut self) {
        self.state.remove_state_change_listener(&self.listener);
        self.task.abort();
    }
}
