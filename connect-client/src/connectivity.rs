//! Network connectivity signals
//!
//! `on_offline` forces the store into `ConnectionLost`. `on_online` asks the
//! server before believing it: a HEAD probe that succeeds moves the store to
//! `Connected`, a probe that cannot reach the server moves it to
//! `ConnectionLost`, and an error status leaves it untouched.

use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection_state::{ConnectionState, ConnectionStateStore};

#[derive(Clone)]
pub struct Connectivity {
    state: Arc<ConnectionStateStore>,
    http: reqwest::Client,
    probe_url: Url,
}

impl Connectivity {
    pub fn new(state: Arc<ConnectionStateStore>, http: reqwest::Client, probe_url: Url) -> Self {
        Self {
            state,
            http,
            probe_url,
        }
    }

    pub fn on_offline(&self) {
        info!("Network went offline");
        self.state.set_state(ConnectionState::ConnectionLost);
    }

    /// Probe the server and return the resulting state
    pub async fn on_online(&self) -> ConnectionState {
        match self.http.head(self.probe_url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                info!(url = %self.probe_url, "Server reachable");
                self.state.set_state(ConnectionState::Connected);
            }
            Ok(response) => {
                debug!(url = %self.probe_url, status = %response.status(), "Probe answered with error status");
            }
            Err(e) => {
                warn!(url = %self.probe_url, error = %e, "Server unreachable");
                self.state.set_state(ConnectionState::ConnectionLost);
            }
        }
        self.state.state()
    }
}
