//! Channel message envelopes and dispatch
//!
//! Inbound: `{ "type": string, "payload": any }`.
//! Outbound: `{ "type", "payload" }` or `{ "error": string }`.
//! Bad input never closes the channel; it is answered with an error frame.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Message {
        #[serde(rename = "type")]
        kind: String,
        payload: Value,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn message(kind: &str, payload: Value) -> Self {
        ServerFrame::Message {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"error":"Failed to encode frame"}"#.to_string())
    }
}

/// Handle one text frame
pub fn dispatch_text(text: &str) -> ServerFrame {
    match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => dispatch(envelope),
        Err(_) => ServerFrame::error("Invalid message format"),
    }
}

fn dispatch(envelope: ClientEnvelope) -> ServerFrame {
    match envelope.kind.as_str() {
        "ping" => ServerFrame::message("pong", envelope.payload),
        "transaction_update" => {
            tracing::debug!(payload = %envelope.payload, "Transaction update received");
            ServerFrame::message("ack", json!({ "received": "transaction_update" }))
        }
        other => ServerFrame::error(format!("Unknown message type: {other}")),
    }
}
