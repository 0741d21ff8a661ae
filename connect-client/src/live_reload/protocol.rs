//! Live reload wire format
//!
//! Every frame is a JSON text message with a `command` field. Inbound
//! commands are `hello`, `reload` and `update`; anything else is passed to
//! the handler untouched. Outbound frames are `{command, data}`. An empty
//! text frame is a heartbeat.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{ConnectError, Result};

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveReloadMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Inbound commands the connection acts on itself
#[derive(Debug, PartialEq)]
pub enum Command<'a> {
    Hello,
    Reload,
    Update { path: &'a str, content: &'a str },
    /// `update` without a usable path
    IncompleteUpdate,
    Other,
}

impl LiveReloadMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> Command<'_> {
        match self.command.as_str() {
            "hello" => Command::Hello,
            "reload" => Command::Reload,
            "update" => match (self.field("path"), self.field("content")) {
                (Some(path), content) => Command::Update {
                    path,
                    content: content.unwrap_or(""),
                },
                (None, _) => Command::IncompleteUpdate,
            },
            _ => Command::Other,
        }
    }

    /// Field from the top level, falling back to `data`
    fn field(&self, name: &str) -> Option<&str> {
        let top = match name {
            "path" => self.path.as_deref(),
            "content" => self.content.as_deref(),
            _ => None,
        };
        top.or_else(|| self.data.as_ref()?.get(name)?.as_str())
    }
}

/// An outbound `{command, data}` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub command: String,
    pub data: Value,
}

impl OutboundMessage {
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Map an `http(s)` URL to the matching `ws(s)` URL
pub fn websocket_url(http_url: &str) -> Result<Url> {
    let mut url = Url::parse(http_url)
        .map_err(|e| ConnectError::Config(format!("invalid live reload url {}: {}", http_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectError::Config(format!(
                "the protocol of the url should be http(s), got {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ConnectError::Config(format!("cannot use scheme {} for {}", scheme, http_url)))?;
    Ok(url)
}
