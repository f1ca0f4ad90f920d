//! Wire format of the metrics stream.
//!
//! Inbound data frames are envelopes `{"topic": "...", "body": "..."}` where `body` is the JSON
//! payload, either serialized into a string (as the backend's message broker relays it) or
//! inlined as an object. Outbound control frames are `{"type": "subscribe", "topic": "..."}`
//! and `{"type": "unsubscribe", "topic": "..."}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};

use super::frame::WsFrame;
use super::topic::{Sample, Topic};
use super::types::{StreamError, StreamResult};

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    topic: &'a str,
    body: &'a str,
}

/// Decode one inbound data frame into a `Sample`.
///
/// `received_at_ms` is used as the timestamp unless the payload carries a numeric `timestamp`.
pub fn decode_envelope(raw: &[u8], received_at_ms: i64) -> StreamResult<Sample> {
    let envelope: InboundEnvelope = sonic_rs::from_slice(raw)
        .map_err(|err| StreamError::Decode(format!("invalid envelope: {err}")))?;

    let topic = match envelope.topic {
        Some(topic) if !topic.is_empty() => topic,
        _ => return Err(StreamError::Decode("envelope has no topic".into())),
    };
    let Some(body) = envelope.body else {
        return Err(StreamError::Decode(format!("envelope on {topic} has no body")));
    };

    let nested = match body.as_str() {
        Some(text) => Some(
            sonic_rs::from_str::<Value>(text)
                .map_err(|err| StreamError::Decode(format!("body on {topic}: {err}")))?,
        ),
        None => None,
    };
    let fields = nested.unwrap_or(body);

    let timestamp_ms = fields
        .get("timestamp")
        .and_then(|ts| ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64)))
        .unwrap_or(received_at_ms);

    Ok(Sample::new(Topic::from(topic), timestamp_ms, fields))
}

/// Build an inbound envelope frame with a string-encoded body, as the backend relays it.
pub fn encode_envelope(topic: &str, body_json: &str) -> StreamResult<WsFrame> {
    let raw = sonic_rs::to_vec(&OutboundEnvelope {
        topic,
        body: body_json,
    })
    .map_err(|err| StreamError::Decode(format!("encode envelope: {err}")))?;
    Ok(WsFrame::Text(Bytes::from(raw)))
}

/// Outbound subscription control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
}

impl ControlFrame {
    pub fn topic(&self) -> &Topic {
        match self {
            ControlFrame::Subscribe { topic } | ControlFrame::Unsubscribe { topic } => topic,
        }
    }

    pub fn encode(&self) -> StreamResult<WsFrame> {
        let raw = sonic_rs::to_vec(self)
            .map_err(|err| StreamError::Decode(format!("encode control frame: {err}")))?;
        Ok(WsFrame::Text(Bytes::from(raw)))
    }

    pub fn decode(raw: &[u8]) -> StreamResult<Self> {
        sonic_rs::from_slice(raw)
            .map_err(|err| StreamError::Decode(format!("invalid control frame: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_body_is_parsed_as_json() {
        let raw = br#"{"topic":"metrics/s-1","body":"{\"currentRps\":12.5,\"timestamp\":1700}"}"#;
        let sample = decode_envelope(raw, 42).unwrap();
        assert_eq!(sample.topic().as_str(), "metrics/s-1");
        assert_eq!(sample.field_f64("currentRps"), Some(12.5));
        assert_eq!(sample.timestamp_ms(), 1700);
    }

    #[test]
    fn inline_body_and_receive_time_fallback() {
        let raw = br#"{"topic":"workers/status","body":{"activeWorkers":4}}"#;
        let sample = decode_envelope(raw, 42).unwrap();
        assert_eq!(sample.timestamp_ms(), 42);
        assert_eq!(sample.field_f64("activeWorkers"), Some(4.0));
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        for raw in [
            &b"not json"[..],
            br#"{"body":"{}"}"#,
            br#"{"topic":"","body":"{}"}"#,
            br#"{"topic":"alerts"}"#,
            br#"{"topic":"alerts","body":"{not json"}"#,
            br#"[1,2,3]"#,
        ] {
            let err = decode_envelope(raw, 0).unwrap_err();
            assert!(matches!(err, StreamError::Decode(_)), "{err:?}");
        }
    }

    #[test]
    fn control_frames_use_type_tag() {
        let frame = ControlFrame::Subscribe {
            topic: Topic::alerts(),
        }
        .encode()
        .unwrap();
        let WsFrame::Text(bytes) = &frame else {
            panic!("expected text frame, got {frame:?}");
        };
        let value: Value = sonic_rs::from_slice(bytes).unwrap();
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("subscribe"));
        assert_eq!(value.get("topic").and_then(|v| v.as_str()), Some("alerts"));

        let decoded = ControlFrame::decode(br#"{"type":"unsubscribe","topic":"metrics/x"}"#).unwrap();
        assert_eq!(decoded.topic().as_str(), "metrics/x");
        assert!(matches!(decoded, ControlFrame::Unsubscribe { .. }));
    }

    #[test]
    fn encoded_envelope_decodes_back_to_sample() {
        let frame = encode_envelope("alerts", r#"{"id":"a-1","severity":"INFO"}"#).unwrap();
        let sample = decode_envelope(frame.payload().unwrap(), 7).unwrap();
        assert_eq!(sample.topic().as_str(), "alerts");
        assert_eq!(sample.field("id").and_then(|v| v.as_str()), Some("a-1"));
    }
}
