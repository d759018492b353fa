use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusError;

/// Target value addressing every application.
pub const BROADCAST_TARGET: &str = "*";

/// Message exchanged between applications over the bus channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMessage {
    pub id: String,
    pub source: String,
    /// Application id, or `"*"` for broadcasts
    pub target: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel: Option<String>,
}

impl AppMessage {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            requires_response: false,
            response_channel: None,
        }
    }

    /// Mark the message as a request answered on `channel`.
    pub fn expecting_response(mut self, channel: impl Into<String>) -> Self {
        self.requires_response = true;
        self.response_channel = Some(channel.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST_TARGET
    }

    /// Channel a reply should be sent on, when one was requested.
    pub fn reply_channel(&self) -> Option<&str> {
        if self.requires_response {
            self.response_channel.as_deref()
        } else {
            None
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        T::deserialize(&self.payload).map_err(BusError::Decode)
    }
}
