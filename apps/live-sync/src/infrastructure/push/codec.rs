//! Push Frame Codec
//!
//! Decodes inbound text frames from the dashboard WebSocket.
//!
//! # Frame Format
//!
//! ```json
//! {"type": "price_update", "data": {"currency_pair": "USD/LYD", "price": 4.85, "timestamp": "2024-03-01T12:30:00"}}
//! {"type": "analysis_update", "data": {"currency_pair": "USD/LYD", ...}, "timestamp": "..."}
//! {"type": "connected", "timestamp": "...", "message": "..."}
//! ```
//!
//! The bare text `pong` answers our keepalive probe and is not JSON.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::update::{
    DataKind, KeyError, SyncValue, ValueUpdate, parse_observed_at,
};

/// Codec errors. Any of these makes the frame malformed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame was not valid JSON of the expected shape.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was absent or null.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field had the wrong type or value.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field path.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The timestamp could not be parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The currency pair produced an invalid key.
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// A value update for the reconciler.
    Update(ValueUpdate),
    /// Server greeting after the handshake.
    Connected {
        /// Greeting text, if any.
        message: Option<String>,
    },
    /// Reply to our keepalive probe.
    Pong,
    /// A well-formed frame of a type we do not consume.
    Ignored {
        /// The frame's `type`.
        kind: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// JSON codec for the dashboard push channel.
#[derive(Debug, Default, Clone)]
pub struct PushCodec;

impl PushCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// Unknown `type` values decode to [`PushFrame::Ignored`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the frame is malformed.
    pub fn decode(&self, text: &str) -> Result<PushFrame, CodecError> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("pong") {
            return Ok(PushFrame::Pong);
        }

        let frame: RawFrame = serde_json::from_str(trimmed)?;
        match frame.kind.as_str() {
            "price_update" => decode_price(frame).map(PushFrame::Update),
            "analysis_update" => decode_analysis(frame).map(PushFrame::Update),
            "connected" => Ok(PushFrame::Connected {
                message: frame.message,
            }),
            "pong" => Ok(PushFrame::Pong),
            _ => Ok(PushFrame::Ignored { kind: frame.kind }),
        }
    }
}

fn decode_price(frame: RawFrame) -> Result<ValueUpdate, CodecError> {
    let data = frame.data.ok_or(CodecError::MissingField("data"))?;
    let pair = currency_pair(&data)?;
    let key = DataKind::Price.key_for(pair)?;

    let price = data
        .get("price")
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or(CodecError::MissingField("data.price"))?;
    let value = SyncValue::from_json(price);
    if value.as_number().is_none() {
        return Err(CodecError::InvalidField {
            field: "data.price",
            reason: "not a number".into(),
        });
    }

    let observed_at = observed_at(&data, frame.timestamp.as_deref())?;
    Ok(ValueUpdate::push(key, value, observed_at))
}

fn decode_analysis(frame: RawFrame) -> Result<ValueUpdate, CodecError> {
    let data = frame.data.ok_or(CodecError::MissingField("data"))?;
    let key = DataKind::Analysis.key_for(currency_pair(&data)?)?;
    let observed_at = observed_at(&data, frame.timestamp.as_deref())?;
    Ok(ValueUpdate::push(key, SyncValue::Record(data), observed_at))
}

fn currency_pair(data: &Value) -> Result<&str, CodecError> {
    match data.get("currency_pair") {
        None | Some(Value::Null) => Err(CodecError::MissingField("data.currency_pair")),
        Some(Value::String(pair)) => Ok(pair),
        Some(other) => Err(CodecError::InvalidField {
            field: "data.currency_pair",
            reason: format!("expected string, got {other}"),
        }),
    }
}

/// `data.timestamp`, falling back to the frame's `timestamp`.
fn observed_at(
    data: &Value,
    frame_timestamp: Option<&str>,
) -> Result<chrono::DateTime<chrono::Utc>, CodecError> {
    let raw = data
        .get("timestamp")
        .and_then(Value::as_str)
        .or(frame_timestamp)
        .ok_or(CodecError::MissingField("timestamp"))?;
    parse_observed_at(raw).ok_or_else(|| CodecError::InvalidTimestamp(raw.to_string()))
}
