//! # Frame Translator
//!
//! Stateless conversion between the two frame vocabularies the bridge speaks:
//!
//! - **Caller wire frames** are tagged by `event` (`start`, `media`, `mark`,
//!   `clear`, `stop`, anything else).
//! - **Control messages** from the backend are tagged by `type` and only four
//!   of them are understood: `media`, `mark`, `clear`, `stop`.
//!
//! Both directions go through [`Envelope`], the canonical representation that
//! is forwarded to the backend, replicated to observers and re-encoded for the
//! caller. Audio payloads are opaque base64 strings and are never decoded.

use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use serde_json::{Map, Value};

/// Content type applied to media payloads that do not name one:
/// 8kHz mono mu-law, the telephony default.
pub const DEFAULT_MEDIA_CONTENT_TYPE: &str = "audio/x-mulaw;rate=8000";

/// Wire fields that clash with the envelope's own `source`/`type`/`streamSid`
/// are kept under this key instead of being overwritten.
pub const DISPLACED_FIELDS_KEY: &str = "original";

/// Which side of the bridge produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Caller,
    Backend,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Caller => "caller",
            Source::Backend => "backend",
        }
    }
}

/// Audio carried by a media frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaBody {
    /// Base64 audio, passed through untouched
    pub payload: String,
    pub content_type: String,
    /// Remaining fields of the wire `media` object (timestamp, chunk, track)
    pub extra: Map<String, Value>,
}

/// Variant-specific part of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Call started. A start without a token is forwarded but never registered.
    Start {
        stream_sid: Option<String>,
        start: Map<String, Value>,
    },
    /// Audio chunk. `media` is `None` when the wire frame had no payload; the
    /// raw `media` object then stays in [`Envelope::extra`].
    Media {
        stream_sid: String,
        media: Option<MediaBody>,
    },
    Mark {
        stream_sid: String,
        name: Option<String>,
    },
    Clear {
        stream_sid: String,
    },
    Stop {
        stream_sid: String,
    },
    /// Unrecognized event. Its fields all live in [`Envelope::extra`].
    Other { kind: String },
}

/// Canonical frame exchanged with the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: Source,
    pub frame: Frame,
    /// Top-level wire fields the variant does not model (`sequenceNumber`,
    /// the `stop` object, ...), forwarded as they arrived.
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn caller(frame: Frame) -> Self {
        Self {
            source: Source::Caller,
            frame,
            extra: Map::new(),
        }
    }

    pub fn backend(frame: Frame) -> Self {
        Self {
            source: Source::Backend,
            frame,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Wire name of the variant (`start`, `media`, ... or the unknown event).
    pub fn kind(&self) -> &str {
        match &self.frame {
            Frame::Start { .. } => "start",
            Frame::Media { .. } => "media",
            Frame::Mark { .. } => "mark",
            Frame::Clear { .. } => "clear",
            Frame::Stop { .. } => "stop",
            Frame::Other { kind, .. } => kind.as_str(),
        }
    }

    /// Session token carried by the frame, if any.
    pub fn stream_sid(&self) -> Option<&str> {
        match &self.frame {
            Frame::Start { stream_sid, .. } => stream_sid.as_deref(),
            Frame::Media { stream_sid, .. }
            | Frame::Mark { stream_sid, .. }
            | Frame::Clear { stream_sid }
            | Frame::Stop { stream_sid } => Some(stream_sid.as_str()),
            Frame::Other { .. } => str_field(&self.extra, "streamSid"),
        }
    }

    /// JSON form sent to the backend and to observers:
    /// `{"source": .., "type": .., "streamSid": .., ...frame fields}`.
    ///
    /// Every extra wire field is carried along. One whose key the envelope
    /// already uses with a different value is moved under
    /// [`DISPLACED_FIELDS_KEY`].
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();

        out.insert("source".to_string(), Value::from(self.source.as_str()));
        out.insert("type".to_string(), Value::from(self.kind()));
        if let Some(sid) = self.stream_sid() {
            out.insert("streamSid".to_string(), Value::from(sid));
        }

        match &self.frame {
            Frame::Start { start, .. } => {
                out.insert("start".to_string(), Value::Object(start.clone()));
            }
            Frame::Media {
                media: Some(media), ..
            } => {
                let mut body = media.extra.clone();
                body.insert("payload".to_string(), Value::from(media.payload.as_str()));
                body.insert(
                    "contentType".to_string(),
                    Value::from(media.content_type.as_str()),
                );
                out.insert("media".to_string(), Value::Object(body));
            }
            Frame::Mark {
                name: Some(name), ..
            } if !self.extra.contains_key("mark") => {
                out.insert("mark".to_string(), serde_json::json!({ "name": name }));
            }
            _ => {}
        }

        let mut displaced = Map::new();
        for (key, value) in &self.extra {
            match out.get(key) {
                None => {
                    out.insert(key.clone(), value.clone());
                }
                Some(existing) if existing == value => {}
                Some(_) => {
                    displaced.insert(key.clone(), value.clone());
                }
            }
        }
        if !displaced.is_empty() {
            out.entry(DISPLACED_FIELDS_KEY)
                .or_insert(Value::Object(displaced));
        }

        Value::Object(out)
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Decode one text frame from the caller transport.
pub fn caller_frame_to_envelope(raw: &str) -> BridgeResult<Envelope> {
    let mut fields = parse_object(raw)?;

    let event = match fields.remove("event") {
        Some(Value::String(event)) => event,
        Some(_) => return Err(BridgeError::Parse("'event' is not a string".to_string())),
        None => return Err(BridgeError::Parse("frame has no 'event' field".to_string())),
    };

    let frame = match event.as_str() {
        "start" => {
            let start = match fields.remove("start") {
                Some(Value::Object(start)) => start,
                _ => Map::new(),
            };
            let stream_sid = str_field(&start, "streamSid")
                .or_else(|| str_field(&fields, "streamSid"))
                .map(str::to_string);
            Frame::Start { stream_sid, start }
        }
        "media" => {
            let stream_sid = required_sid(&fields, "media")?;
            let media = fields
                .get("media")
                .and_then(Value::as_object)
                .and_then(media_body);
            if media.is_some() {
                fields.remove("media");
            }
            Frame::Media { stream_sid, media }
        }
        "mark" => Frame::Mark {
            stream_sid: required_sid(&fields, "mark")?,
            name: mark_name(&fields).map(str::to_string),
        },
        "clear" => Frame::Clear {
            stream_sid: required_sid(&fields, "clear")?,
        },
        "stop" => Frame::Stop {
            stream_sid: required_sid(&fields, "stop")?,
        },
        _ => Frame::Other { kind: event },
    };

    Ok(Envelope::caller(frame).with_extra(fields))
}

/// Decode a backend control message.
///
/// `Ok(None)` means the message type is not one the caller understands; such
/// messages are dropped without being treated as errors.
pub fn decode_control(raw: &str) -> BridgeResult<Option<Envelope>> {
    let fields = parse_object(raw)?;

    let kind = str_field(&fields, "type")
        .ok_or_else(|| BridgeError::Parse("control message has no 'type' field".to_string()))?;

    if !matches!(kind, "media" | "mark" | "clear" | "stop") {
        return Ok(None);
    }

    let stream_sid = required_sid(&fields, kind)?;

    let frame = match kind {
        "media" => {
            let media = fields
                .get("media")
                .and_then(Value::as_object)
                .and_then(media_body)
                .ok_or_else(|| {
                    BridgeError::Validation("media control without 'media.payload'".to_string())
                })?;
            Frame::Media {
                stream_sid,
                media: Some(media),
            }
        }
        "mark" => {
            let name = mark_name(&fields).ok_or_else(|| {
                BridgeError::Validation("mark control without 'mark.name'".to_string())
            })?;
            Frame::Mark {
                stream_sid,
                name: Some(name.to_string()),
            }
        }
        "clear" => Frame::Clear { stream_sid },
        _ => Frame::Stop { stream_sid },
    };

    Ok(Some(Envelope::backend(frame)))
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum CallerBoundFrame<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: CallerBoundMedia<'a>,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        mark: CallerBoundMark<'a>,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
}

#[derive(Serialize)]
struct CallerBoundMedia<'a> {
    #[serde(rename = "contentType")]
    content_type: &'a str,
    payload: &'a str,
}

#[derive(Serialize)]
struct CallerBoundMark<'a> {
    name: &'a str,
}

/// Encode an envelope as a frame the caller transport accepts.
pub fn encode_caller_frame(envelope: &Envelope) -> BridgeResult<String> {
    let frame = match &envelope.frame {
        Frame::Media {
            stream_sid,
            media: Some(media),
        } => CallerBoundFrame::Media {
            stream_sid,
            media: CallerBoundMedia {
                content_type: &media.content_type,
                payload: &media.payload,
            },
        },
        Frame::Media { media: None, .. } => {
            return Err(BridgeError::Validation(
                "media frame has no payload".to_string(),
            ))
        }
        Frame::Mark {
            stream_sid,
            name: Some(name),
        } => CallerBoundFrame::Mark {
            stream_sid,
            mark: CallerBoundMark { name },
        },
        Frame::Mark { name: None, .. } => {
            return Err(BridgeError::Validation("mark frame has no name".to_string()))
        }
        Frame::Clear { stream_sid } => CallerBoundFrame::Clear { stream_sid },
        Frame::Stop { stream_sid } => CallerBoundFrame::Stop { stream_sid },
        Frame::Start { .. } | Frame::Other { .. } => {
            return Err(BridgeError::Validation(format!(
                "'{}' frames cannot be sent to the caller",
                envelope.kind()
            )))
        }
    };

    Ok(serde_json::to_string(&frame)?)
}

fn parse_object(raw: &str) -> BridgeResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(BridgeError::Parse("frame is not a JSON object".to_string())),
    }
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn required_sid(fields: &Map<String, Value>, kind: &str) -> BridgeResult<String> {
    match str_field(fields, "streamSid") {
        Some(sid) if !sid.is_empty() => Ok(sid.to_string()),
        _ => Err(BridgeError::Validation(format!(
            "'{}' frame without 'streamSid'",
            kind
        ))),
    }
}

fn mark_name(fields: &Map<String, Value>) -> Option<&str> {
    fields
        .get("mark")
        .and_then(Value::as_object)
        .and_then(|mark| str_field(mark, "name"))
}

fn media_body(media: &Map<String, Value>) -> Option<MediaBody> {
    let payload = str_field(media, "payload")?.to_string();
    let content_type = str_field(media, "contentType")
        .unwrap_or(DEFAULT_MEDIA_CONTENT_TYPE)
        .to_string();

    let mut extra = media.clone();
    extra.remove("payload");
    extra.remove("contentType");

    Some(MediaBody {
        payload,
        content_type,
        extra,
    })
}
