//! Authentication
//!
//! - `token` - JWT access/refresh tokens and the durable refresh token slot
//! - `credentials` - credentials prompt and `LoginResult`
//! - `endpoint` - OAuth token endpoint (refresh and password grants)
//! - `session` - middleware that renews an invalid server session

pub mod credentials;
pub mod endpoint;
pub mod session;
pub mod token;

pub use credentials::{
    Credentials, CredentialsProvider, CredentialsRequest, LoginResult, StaticCredentials,
    INCORRECT_CREDENTIALS_TITLE,
};
pub use endpoint::{Grant, TokenEndpoint, TokenExchange};
pub use session::{InvalidSessionMiddleware, SessionInvalidCallback, CSRF_TOKEN_HEADER};
pub use token::{AccessToken, AuthTokens, Claims, RefreshToken, REFRESH_TOKEN_KEY};
