//! Connect Client - authenticated endpoint calls with offline support
//!
//! Calls server endpoints over HTTP, keeps track of whether the server is
//! reachable, and stores calls made while offline so they can be replayed
//! once the connection returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ConnectClient                         │
//! │  login() ──► TokenEndpoint (refresh / password grants)       │
//! │  call()  ──► middleware chain ──► Fetch ──► server           │
//! │                                     │                        │
//! │                          ConnectionStateStore                │
//! │                                     │ offline                │
//! │  deferrable_call() ──► RequestQueue (sled) ◄── drain         │
//! └──────────────────────────────────────────────────────────────┘
//!             LiveReloadConnection (WebSocket, independent)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use connect_client::{ClientConfig, ConnectClient};
//! use serde_json::json;
//!
//! let client = ConnectClient::builder(ClientConfig::default()).build()?;
//! let _watch = client.watch_connectivity();
//!
//! let result = client
//!     .deferrable_call("OrderEndpoint", "submit", Some(json!({ "id": 42 })))
//!     .await?;
//! if result.is_deferred() {
//!     println!("stored for later");
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection_state;
pub mod connectivity;
pub mod deferred;
pub mod error;
pub mod live_reload;
pub mod middleware;
pub mod queue;
pub mod response;
pub mod storage;

pub use auth::{
    AccessToken, Credentials, CredentialsProvider, CredentialsRequest, InvalidSessionMiddleware,
    LoginResult, SessionInvalidCallback, StaticCredentials,
};
pub use client::{ConnectClient, ConnectClientBuilder, ConnectivityWatch, DeferrableResult};
pub use config::{ClientConfig, ClientConfigOverrides};
pub use connection_state::{ConnectionState, ConnectionStateListener, ConnectionStateStore};
pub use connectivity::Connectivity;
pub use deferred::{DeferredCallHandler, DeferredCallProcessor, DeferredCallSubmitter, SubmitCall};
pub use error::{AuthError, ConnectError, Result, ValidationErrorData};
pub use live_reload::{
    ConnectionStatus, LiveReloadConnection, LiveReloadHandler, LiveReloadMessage,
    LiveReloadOptions, ReloadNotice,
};
pub use middleware::{
    CallOptions, EndpointRequest, EndpointResponse, Middleware, MiddlewareContext, Next,
};
pub use queue::{DeferredCall, RequestQueue};
pub use storage::{ClientStorage, KeyValueStore};
