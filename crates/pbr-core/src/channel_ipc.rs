//! Message framing shared by every channel endpoint.
//!
//! Channel payloads are `{"eventName", "data"}` objects. Between processes
//! they travel inside a [`HubEnvelope`], encoded as one JSON document per
//! line.

use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

use crate::schema::ChannelEvent;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// The `{eventName, data}` pair every channel message carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    #[serde(rename = "eventName")]
    pub event_name: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelMessage {
    pub fn new(event_name: impl Into<String>, data: Value) -> Self {
        Self {
            event_name: event_name.into(),
            data,
        }
    }

    /// Builds the message for a typed event.
    pub fn for_event<E: ChannelEvent>(params: &E::Params) -> Result<Self, FrameError> {
        let data =
            serde_json::to_value(params).map_err(|err| FrameError::Encode(err.to_string()))?;
        Ok(Self::new(E::NAME, data))
    }

    /// Decodes `data` as the parameters of `E`. Absent data decodes as an
    /// empty object so events whose parameters are `{}` may omit it.
    pub fn params<E: ChannelEvent>(&self) -> Result<E::Params, FrameError> {
        match serde_json::from_value::<E::Params>(self.data.clone()) {
            Ok(params) => Ok(params),
            Err(err) if self.data.is_null() => {
                serde_json::from_value(Value::Object(Default::default()))
                    .map_err(|_| FrameError::Decode(err.to_string()))
            }
            Err(err) => Err(FrameError::Decode(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_supported(self) -> bool {
        self.0 <= CURRENT_PROTOCOL_VERSION
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as integer or \"v<n>\" string")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version cannot be negative: {value}")))
                    .and_then(|value| self.visit_u64(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .trim()
                    .trim_start_matches('v')
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

/// Envelope exchanged between the hub and its peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: HubMsg,
}

impl HubEnvelope {
    pub fn new(sender_id: impl Into<String>, request_id: Option<String>, msg: HubMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HubMsg {
    Hello(HelloPayload),
    Focus(FocusPayload),
    Request(ChannelMessage),
    Response(ResponsePayload),
    Broadcast(ChannelMessage),
    Ack(AckPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// A page agent living in one browsing context.
    Page,
    /// A transient UI surface issuing requests.
    Surface,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Page => "page",
            PeerRole::Surface => "surface",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub peer_id: String,
    pub role: PeerRole,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// Sent by a page when it gains or loses focus, or navigates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusPayload {
    pub active: bool,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub delivered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let raw = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Incremental decoder for newline-delimited frames.
///
/// Peers may batch several frames into one transport message or split a
/// frame across messages; bytes are buffered until a newline arrives.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            let frame = trim_line_ending(&line);
            if frame.iter().all(|byte| byte.is_ascii_whitespace()) {
                continue;
            }
            self.decode_into(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decodes whatever is left without a trailing newline.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        let frame = trim_line_ending(&rest);
        if !frame.iter().all(|byte| byte.is_ascii_whitespace()) {
            self.decode_into(frame, &mut report);
        }
        report
    }

    fn decode_into(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ChangePlayback, ChangePlaybackParams, GetUri, GetUriParams};

    fn request_envelope() -> HubEnvelope {
        HubEnvelope {
            version: ProtocolVersion::CURRENT,
            sender_id: "surface-1".to_string(),
            timestamp: "2026-10-19T08:00:00Z".to_string(),
            request_id: Some("req-1".to_string()),
            msg: HubMsg::Request(ChannelMessage::new(
                "changePlayback",
                serde_json::json!({"playbackRate": 2}),
            )),
        }
    }

    #[test]
    fn channel_message_matches_wire_shape() {
        let message = ChannelMessage::for_event::<ChangePlayback>(&ChangePlaybackParams {
            playback_rate: 1.5,
        })
        .expect("encode");
        assert_eq!(
            serde_json::to_value(&message).expect("serialize"),
            serde_json::json!({"eventName": "changePlayback", "data": {"playbackRate": 1.5}})
        );
        let params = message.params::<ChangePlayback>().expect("decode");
        assert_eq!(params.playback_rate, 1.5);
    }

    #[test]
    fn missing_data_decodes_as_empty_params() {
        let message: ChannelMessage =
            serde_json::from_str(r#"{"eventName":"getURI"}"#).expect("parse");
        assert_eq!(message.data, Value::Null);
        assert_eq!(message.params::<GetUri>(), Ok(GetUriParams {}));
        assert!(matches!(
            message.params::<ChangePlayback>(),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn envelope_flattens_type_and_payload() {
        let value = serde_json::to_value(request_envelope()).expect("serialize");
        assert_eq!(value["type"], "request");
        assert_eq!(value["payload"]["eventName"], "changePlayback");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn version_accepts_number_string_and_missing() {
        for raw in [
            r#"{"version":1,"sender_id":"p","timestamp":"t","type":"ack","payload":{"delivered":2}}"#,
            r#"{"version":"v1","sender_id":"p","timestamp":"t","type":"ack","payload":{"delivered":2}}"#,
            r#"{"sender_id":"p","timestamp":"t","type":"ack","payload":{"delivered":2}}"#,
        ] {
            let envelope: HubEnvelope = serde_json::from_str(raw).expect("parse");
            assert_eq!(envelope.version, ProtocolVersion::CURRENT);
            assert_eq!(envelope.msg, HubMsg::Ack(AckPayload { delivered: 2 }));
        }
        assert!(!ProtocolVersion(2).is_supported());
    }

    #[test]
    fn decoder_handles_batched_and_split_frames() {
        let first = encode_frame(&request_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let second = encode_frame(
            &HubEnvelope {
                request_id: None,
                msg: HubMsg::Focus(FocusPayload {
                    active: true,
                    href: Some("https://example.com/a".to_string()),
                    hostname: Some("example.com".to_string()),
                }),
                ..request_envelope()
            },
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");

        let mut decoder = NdjsonFrameDecoder::<HubEnvelope>::default();
        let mut batch = first.clone();
        batch.extend_from_slice(&second[..10]);
        let report = decoder.push_chunk(&batch);
        assert_eq!(report.frames.len(), 1);
        assert!(report.errors.is_empty());

        let report = decoder.push_chunk(&second[10..]);
        assert_eq!(report.frames.len(), 1);
        assert!(matches!(report.frames[0].msg, HubMsg::Focus(_)));
        assert!(decoder.finish().frames.is_empty());
    }

    #[test]
    fn decoder_skips_malformed_and_oversized_lines() {
        let valid = encode_frame(&request_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let mut chunk = b"{\"broken\":\n".to_vec();
        chunk.extend_from_slice(format!("\"{}\"\n", "x".repeat(600)).as_bytes());
        chunk.extend_from_slice(&valid);

        let mut decoder = NdjsonFrameDecoder::<HubEnvelope>::new(512);
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
        assert!(matches!(report.errors[1], FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let message = HubEnvelope {
            msg: HubMsg::Request(ChannelMessage::new(
                "changePlayback",
                serde_json::json!({"blob": "x".repeat(256)}),
            )),
            ..request_envelope()
        };
        assert!(matches!(
            encode_frame(&message, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }
}
