//! Live reload connection
//!
//! Listens on a WebSocket for `hello`, `reload` and `update` commands from
//! the development server and forwards them to a [`LiveReloadHandler`].
//! The socket is opened once and never reopened; after it closes the
//! status stays `Unavailable` (or `Error`).

mod notice;
pub mod protocol;

pub use notice::{ReloadNotice, TRIGGERED_COUNT_KEY, TRIGGERED_KEY};
pub use protocol::{websocket_url, Command, LiveReloadMessage, OutboundMessage};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{ConnectError, Result};
use crate::storage::KeyValueStore;

/// Session key remembering whether live reload was switched off
pub const ACTIVE_KEY: &str = "vaadin.live-reload.active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Unavailable,
    Error,
}

/// Reactions to live reload events. Every method has a no-op default.
pub trait LiveReloadHandler: Send + Sync {
    fn on_handshake(&self) {}

    /// The page should reload
    fn on_reload(&self) {}

    /// Replace the stylesheet at `path`.
    ///
    /// Return `false` when it is not loaded; the connection then reloads.
    fn on_update(&self, _path: &str, _content: &str) -> bool {
        false
    }

    fn on_status_change(&self, _status: ConnectionStatus) {}

    fn on_connection_error(&self, _message: &str) {}

    fn on_message(&self, message: &LiveReloadMessage) {
        warn!(command = %message.command, "Unknown live reload message");
    }
}

#[derive(Clone)]
pub struct LiveReloadOptions {
    pub heartbeat_interval: Duration,
    /// Where reload bookkeeping and the active flag are kept
    pub session: Option<KeyValueStore>,
}

impl Default for LiveReloadOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(180),
            session: None,
        }
    }
}

struct Shared {
    status: Mutex<ConnectionStatus>,
    active: AtomicBool,
    handler: Arc<dyn LiveReloadHandler>,
    session: Option<KeyValueStore>,
}

impl Shared {
    fn new(handler: Arc<dyn LiveReloadHandler>, session: Option<KeyValueStore>) -> Self {
        let active = session
            .as_ref()
            .and_then(|s| s.get(ACTIVE_KEY).ok().flatten())
            .map_or(true, |v| v != "false");
        Self {
            status: Mutex::new(ConnectionStatus::Unavailable),
            active: AtomicBool::new(active),
            handler,
            session,
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *status != next;
            *status = next;
            changed
        };
        if changed {
            debug!(status = ?next, "Live reload status changed");
            self.handler.on_status_change(next);
        }
    }

    fn set_active(&self, yes: bool) {
        self.active.store(yes, Ordering::SeqCst);
        if let Some(session) = &self.session {
            if let Err(e) = session.set(ACTIVE_KEY, if yes { "true" } else { "false" }) {
                warn!(error = %e, "Failed to persist live reload active flag");
            }
        }
        match (yes, self.status()) {
            (false, ConnectionStatus::Active) => self.set_status(ConnectionStatus::Inactive),
            (true, ConnectionStatus::Inactive) => self.set_status(ConnectionStatus::Active),
            _ => {}
        }
    }

    fn handle_message(&self, text: &str) {
        let message = match LiveReloadMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.fail(&format!("Unknown message from the live reload server: {} ({})", text, e));
                return;
            }
        };

        let active = self.status() == ConnectionStatus::Active;
        match message.kind() {
            Command::Hello => {
                let next = if self.active.load(Ordering::SeqCst) {
                    ConnectionStatus::Active
                } else {
                    ConnectionStatus::Inactive
                };
                self.set_status(next);
                self.handler.on_handshake();
            }
            Command::Reload if active => self.reload(),
            Command::Update { path, content } if active => {
                info!(path, "Hot update");
                if !self.handler.on_update(path, content) {
                    self.reload();
                }
            }
            Command::IncompleteUpdate if active => self.reload(),
            Command::Other => self.handler.on_message(&message),
            _ => debug!(command = %message.command, "Ignoring command while not active"),
        }
    }

    fn reload(&self) {
        if let Some(session) = &self.session {
            if let Err(e) = ReloadNotice::record(session) {
                warn!(error = %e, "Failed to record reload");
            }
        }
        self.handler.on_reload();
    }

    fn fail(&self, message: &str) {
        error!("{}", message);
        self.set_status(ConnectionStatus::Error);
        self.handler.on_connection_error(message);
    }

    fn closed(&self) {
        if self.status() != ConnectionStatus::Error {
            self.set_status(ConnectionStatus::Unavailable);
        }
    }
}

/// Client side of the live reload WebSocket
pub struct LiveReloadConnection {
    url: Url,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveReloadConnection {
    /// Start connecting to `url`. Must be called within a tokio runtime.
    ///
    /// Messages sent before the socket opens are delivered once it does.
    pub fn open(url: Url, handler: Arc<dyn LiveReloadHandler>, options: LiveReloadOptions) -> Self {
        let shared = Arc::new(Shared::new(handler, options.session));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            url.clone(),
            Arc::clone(&shared),
            outbound_rx,
            options.heartbeat_interval,
            shutdown.clone(),
        ));
        Self {
            url,
            shared,
            outbound,
            shutdown,
            task,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn is_active(&self) -> bool {
        self.shared.status() == ConnectionStatus::Active
    }

    /// Switch reload handling on or off without closing the socket
    pub fn set_active(&self, yes: bool) {
        self.shared.set_active(yes);
    }

    /// Send a `{command, data}` frame
    pub fn send(&self, command: &str, data: Value) -> Result<()> {
        let text = OutboundMessage::new(command, data).to_text()?;
        self.outbound.send(text).map_err(|_| {
            error!(command, "Unable to send message. No websocket is available");
            ConnectError::Disconnected(format!("unable to send {}", command))
        })
    }

    pub fn set_feature(&self, feature_id: &str, enabled: bool) -> Result<()> {
        self.send("setFeature", json!({ "featureId": feature_id, "enabled": enabled }))
    }

    pub fn report_telemetry(&self, browser_data: Value) -> Result<()> {
        self.send("reportTelemetry", json!({ "browserData": browser_data }))
    }

    pub fn check_license(&self, name: &str, version: &str) -> Result<()> {
        self.send("checkLicense", json!({ "name": name, "version": version }))
    }

    pub fn show_component_create_location(&self, node_id: u64, ui_id: u64) -> Result<()> {
        self.send(
            "showComponentCreateLocation",
            json!({ "nodeId": node_id, "uiId": ui_id }),
        )
    }

    pub fn show_component_attach_location(&self, node_id: u64, ui_id: u64) -> Result<()> {
        self.send(
            "showComponentAttachLocation",
            json!({ "nodeId": node_id, "uiId": ui_id }),
        )
    }

    /// Close the socket
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the socket has closed
    pub async fn closed(mut self) {
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Live reload task ended abnormally");
        }
    }
}

impl Drop for LiveReloadConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    url: Url,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    let connected = tokio::select! {
        _ = shutdown.cancelled() => {
            shared.closed();
            return;
        }
        result = connect_async(url.as_str()) => result,
    };
    let socket = match connected {
        Ok((socket, _)) => socket,
        Err(e) => {
            shared.fail(&format!("Error in WebSocket connection to {}: {}", url, e));
            return;
        }
    };
    info!(url = %url, "Live reload connection opened");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !text.is_empty() {
                        shared.handle_message(&text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    shared.fail(&format!("Error in WebSocket connection to {}: {}", url, e));
                    break;
                }
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    shared.fail(&format!("Error sending to {}: {}", url, e));
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Text(String::new())).await {
                    shared.fail(&format!("Error sending heartbeat to {}: {}", url, e));
                    break;
                }
            }
        }
    }

    info!(url = %url, "Live reload connection closed");
    shared.closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ClientStorage;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        has_stylesheet: bool,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl LiveReloadHandler for Recorder {
        fn on_handshake(&self) {
            self.events.lock().unwrap().push("handshake".into());
        }
        fn on_reload(&self) {
            self.events.lock().unwrap().push("reload".into());
        }
        fn on_update(&self, path: &str, _content: &str) -> bool {
            self.events.lock().unwrap().push(format!("update {}", path));
            self.has_stylesheet
        }
        fn on_status_change(&self, status: ConnectionStatus) {
            self.events.lock().unwrap().push(format!("status {:?}", status));
        }
        fn on_connection_error(&self, _message: &str) {
            self.events.lock().unwrap().push("error".into());
        }
        fn on_message(&self, message: &LiveReloadMessage) {
            self.events.lock().unwrap().push(format!("message {}", message.command));
        }
    }

    fn shared(recorder: &Arc<Recorder>, session: Option<KeyValueStore>) -> Shared {
        Shared::new(Arc::clone(recorder) as Arc<dyn LiveReloadHandler>, session)
    }

    #[test]
    fn test_hello_activates() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, None);

        shared.handle_message(r#"{"command":"hello"}"#);

        assert_eq!(shared.status(), ConnectionStatus::Active);
        assert_eq!(recorder.events(), vec!["status Active", "handshake"]);
    }

    #[test]
    fn test_reload_ignored_until_active() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, None);

        shared.handle_message(r#"{"command":"reload"}"#);
        assert!(recorder.events().is_empty());

        shared.handle_message(r#"{"command":"hello"}"#);
        shared.handle_message(r#"{"command":"reload"}"#);
        assert_eq!(recorder.events().last().map(String::as_str), Some("reload"));
    }

    #[test]
    fn test_update_falls_back_to_reload() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, None);
        shared.handle_message(r#"{"command":"hello"}"#);

        shared.handle_message(r#"{"command":"update","path":"styles.css","content":"a{}"}"#);

        let events = recorder.events();
        assert_eq!(&events[events.len() - 2..], ["update styles.css", "reload"]);
    }

    #[test]
    fn test_update_applied_in_place() {
        let recorder = Arc::new(Recorder {
            has_stylesheet: true,
            ..Default::default()
        });
        let shared = shared(&recorder, None);
        shared.handle_message(r#"{"command":"hello"}"#);

        shared.handle_message(r#"{"command":"update","path":"styles.css","content":"a{}"}"#);

        assert_eq!(recorder.events().last().map(String::as_str), Some("update styles.css"));
    }

    #[test]
    fn test_inactive_connection_ignores_reload() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, None);
        shared.handle_message(r#"{"command":"hello"}"#);

        shared.set_active(false);
        assert_eq!(shared.status(), ConnectionStatus::Inactive);
        shared.handle_message(r#"{"command":"reload"}"#);
        assert!(!recorder.events().contains(&"reload".to_string()));

        shared.set_active(true);
        assert_eq!(shared.status(), ConnectionStatus::Active);
    }

    #[test]
    fn test_deactivation_survives_in_session() {
        let storage = ClientStorage::temporary().unwrap();
        let session = storage.session().unwrap();
        let recorder = Arc::new(Recorder::default());
        shared(&recorder, Some(session.clone())).set_active(false);

        let reopened = shared(&recorder, Some(session));
        reopened.handle_message(r#"{"command":"hello"}"#);

        assert_eq!(reopened.status(), ConnectionStatus::Inactive);
    }

    #[test]
    fn test_unknown_command_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, None);

        shared.handle_message(r#"{"command":"serverInfo","data":{}}"#);

        assert_eq!(recorder.events(), vec!["message serverInfo"]);
    }

    #[test]
    fn test_malformed_message_is_error() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, None);

        shared.handle_message("not json");

        assert_eq!(shared.status(), ConnectionStatus::Error);
        assert_eq!(recorder.events(), vec!["status Error", "error"]);

        shared.closed();
        assert_eq!(shared.status(), ConnectionStatus::Error);
    }

    #[test]
    fn test_reload_records_session_bookkeeping() {
        let storage = ClientStorage::temporary().unwrap();
        let session = storage.session().unwrap();
        let recorder = Arc::new(Recorder::default());
        let shared = shared(&recorder, Some(session.clone()));
        shared.handle_message(r#"{"command":"hello"}"#);

        shared.handle_message(r#"{"command":"reload"}"#);

        assert_eq!(ReloadNotice::count(&session).unwrap(), 1);
        assert!(ReloadNotice::take(&session).unwrap().is_some());
    }
}
