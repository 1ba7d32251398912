//! Wire protocol.
//!
//! All transports speak the same JSON messages. Downstream, messages are
//! tagged with an `action` field; upstream, the client sends one flat
//! event object per interaction, identical over WebSocket and POST.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::reconcile::UpdateBatch;
use crate::Result;

/// An interaction reported by the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEvent {
    /// DOM id of the target element.
    pub id: String,
    /// Event name, e.g. `click`.
    #[serde(rename = "event")]
    pub name: String,
    /// Extra payload: `value`, `key`, `callback_id`, app data.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ClientEvent {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn callback_id(&self) -> Option<&str> {
        self.data.get("callback_id").and_then(|v| v.as_str())
    }
}

/// A message pushed to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ServerMessage {
    Update {
        updates: IndexMap<String, String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        js: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        statics: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        traceback: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
        result: Value,
    },
}

impl ServerMessage {
    /// An update frame. When a callback id is pending but the handler
    /// produced nothing, the result is an explicit `null` so the client
    /// still resolves its promise.
    pub fn update(
        batch: UpdateBatch,
        statics: Vec<String>,
        callback_id: Option<String>,
        result: Option<Value>,
    ) -> Self {
        let result = match (&callback_id, result) {
            (Some(_), None) => Some(Value::Null),
            (_, result) => result,
        };
        ServerMessage::Update {
            updates: batch.updates,
            js: batch.js,
            statics,
            callback_id,
            result,
        }
    }

    /// An error frame; the result is `null` so a pending promise settles.
    pub fn error(traceback: impl Into<String>, callback_id: Option<String>) -> Self {
        ServerMessage::Error {
            traceback: traceback.into(),
            callback_id,
            result: Value::Null,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
