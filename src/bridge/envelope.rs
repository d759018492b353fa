use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire frame relayed between bridges in different contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version of the sending bridge
    pub v: u32,
    /// Channel the payload was published on
    pub ch: String,
    /// Instance id of the sending bridge
    pub origin: String,
    #[serde(default)]
    pub payload: Value,
    /// Publish time, epoch milliseconds
    pub ts: i64,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    ch: &'a str,
    origin: &'a str,
    payload: &'a Value,
    ts: i64,
}

/// Serialize an envelope without taking ownership of the payload.
pub fn encode(
    version: u32,
    channel: &str,
    origin: &str,
    payload: &Value,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EnvelopeRef {
        v: version,
        ch: channel,
        origin,
        payload,
        ts: chrono::Utc::now().timestamp_millis(),
    })
}

pub fn decode(frame: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(frame)
}
