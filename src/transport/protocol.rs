//! Agent wire protocol.
//!
//! Every frame on the duplex channel is a single JSON object.
//! Requests are `{route, requestId, ...body}`. Inbound frames are
//! `{eventName?, requestId?, ...payload}`; whether one is a response or an
//! event depends on whether its `requestId` is pending, so inbound frames are
//! parsed into [`InboundMessage`] first and classified by the transport.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// JSON object body of a request, response or event.
pub type Body = Map<String, Value>;

const ROUTE_KEY: &str = "route";
const REQUEST_ID_KEY: &str = "requestId";
const EVENT_NAME_KEY: &str = "eventName";

/// Inbound frames that cannot be used.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has neither a pending requestId nor an eventName")]
    Uncorrelated,

    #[error("{event} payload is missing {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    #[error("{event} payload is invalid: {source}")]
    InvalidPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A classified wire unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Event(EventEnvelope),
}

impl Envelope {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.request_id),
            Self::Response(r) => Some(&r.request_id),
            Self::Event(e) => e.request_id.as_deref(),
        }
    }
}

/// Outbound command.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub route: String,
    pub request_id: String,
    pub body: Body,
}

impl RequestEnvelope {
    /// Build a request. `defaults` are applied first, then `body`; `route` and
    /// `requestId` always win over either.
    pub fn new(route: &str, request_id: String, defaults: &Body, body: Body) -> Self {
        let mut merged = defaults.clone();
        merged.extend(body);
        merged.remove(ROUTE_KEY);
        merged.remove(REQUEST_ID_KEY);

        Self {
            route: route.to_string(),
            request_id,
            body: merged,
        }
    }

    /// Flat wire form: `{route, requestId, ...body}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut obj = Map::with_capacity(self.body.len() + 2);
        obj.insert(ROUTE_KEY.into(), Value::String(self.route.clone()));
        obj.insert(REQUEST_ID_KEY.into(), Value::String(self.request_id.clone()));
        for (k, v) in &self.body {
            obj.insert(k.clone(), v.clone());
        }
        serde_json::to_string(&Value::Object(obj))
    }
}

/// Reply correlated to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub body: Body,
}

impl ResponseEnvelope {
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }
}

/// Unsolicited push from the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub request_id: Option<String>,
    pub event: AgentEvent,
}

/// An inbound frame, parsed but not yet correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub request_id: Option<String>,
    pub event_name: Option<String>,
    pub payload: Body,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let Value::Object(mut payload) = serde_json::from_str::<Value>(text)? else {
            return Err(EnvelopeError::NotAnObject);
        };

        let request_id = take_string(&mut payload, REQUEST_ID_KEY);
        let event_name = take_string(&mut payload, EVENT_NAME_KEY);

        Ok(Self {
            request_id,
            event_name,
            payload,
        })
    }

    /// Treat this frame as the response to `request_id`.
    pub fn into_response(self, request_id: String) -> ResponseEnvelope {
        ResponseEnvelope {
            request_id,
            body: self.payload,
        }
    }

    /// Treat this frame as a push event.
    pub fn into_event(self) -> Result<EventEnvelope, EnvelopeError> {
        let name = self.event_name.ok_or(EnvelopeError::Uncorrelated)?;
        let event = AgentEvent::decode(&name, self.payload)?;
        Ok(EventEnvelope {
            request_id: self.request_id,
            event,
        })
    }
}

fn take_string(map: &mut Body, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            // Keep non-string values visible to the payload decoder.
            map.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

/// Agent playback status values we act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
    /// Loading, seeking, waiting and friends.
    Other(String),
}

impl PlaybackStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "playing" => Self::Playing,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Metadata the agent embeds in `mediaItemDidChange`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaParams {
    pub name: Option<String>,
    pub artist_name: Option<String>,
    pub artwork_url: Option<String>,
}

/// Typed push events.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    MediaItemDidChange {
        id: String,
        params: Option<MediaParams>,
    },
    PlaybackStateDidChange(PlaybackStatus),
    PlaybackTimeDidChange {
        current_time: f64,
        remaining_time: Option<f64>,
    },
    PlaybackDurationDidChange {
        duration: f64,
    },
    QueueItemsDidChange {
        items: Vec<String>,
    },
    Unknown {
        name: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItemPayload {
    id: Option<Value>,
    media_params: Option<MediaParamsPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaParamsPayload {
    id: Option<Value>,
    name: Option<String>,
    artist_name: Option<String>,
    #[serde(rename = "artworkURL")]
    artwork_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackStatePayload {
    playback_state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackTimePayload {
    current_time: f64,
    remaining_time: Option<f64>,
}

#[derive(Deserialize)]
struct DurationPayload {
    duration: f64,
}

#[derive(Deserialize)]
struct QueuePayload {
    #[serde(alias = "items")]
    queue: Vec<Value>,
}

impl AgentEvent {
    pub const MEDIA_ITEM_DID_CHANGE: &'static str = "mediaItemDidChange";
    pub const PLAYBACK_STATE_DID_CHANGE: &'static str = "playbackStateDidChange";
    pub const PLAYBACK_TIME_DID_CHANGE: &'static str = "playbackTimeDidChange";
    pub const PLAYBACK_DURATION_DID_CHANGE: &'static str = "playbackDurationDidChange";
    pub const QUEUE_ITEMS_DID_CHANGE: &'static str = "queueItemsDidChange";

    /// Decode an event payload by name. Unrecognised names become
    /// [`AgentEvent::Unknown`] rather than errors.
    pub fn decode(name: &str, payload: Body) -> Result<Self, EnvelopeError> {
        let value = Value::Object(payload);
        let event = match name {
            Self::MEDIA_ITEM_DID_CHANGE => {
                let p: MediaItemPayload = decode_payload(Self::MEDIA_ITEM_DID_CHANGE, value)?;
                let (nested_id, params) = match p.media_params {
                    Some(mp) => (
                        mp.id,
                        Some(MediaParams {
                            name: mp.name,
                            artist_name: mp.artist_name,
                            artwork_url: mp.artwork_url,
                        }),
                    ),
                    None => (None, None),
                };
                let id = nested_id
                    .as_ref()
                    .or(p.id.as_ref())
                    .and_then(item_id)
                    .ok_or(EnvelopeError::MissingField {
                        event: Self::MEDIA_ITEM_DID_CHANGE,
                        field: "id",
                    })?;
                Self::MediaItemDidChange { id, params }
            }
            Self::PLAYBACK_STATE_DID_CHANGE => {
                let p: PlaybackStatePayload =
                    decode_payload(Self::PLAYBACK_STATE_DID_CHANGE, value)?;
                Self::PlaybackStateDidChange(PlaybackStatus::parse(&p.playback_state))
            }
            Self::PLAYBACK_TIME_DID_CHANGE => {
                let p: PlaybackTimePayload =
                    decode_payload(Self::PLAYBACK_TIME_DID_CHANGE, value)?;
                Self::PlaybackTimeDidChange {
                    current_time: p.current_time,
                    remaining_time: p.remaining_time,
                }
            }
            Self::PLAYBACK_DURATION_DID_CHANGE => {
                let p: DurationPayload = decode_payload(Self::PLAYBACK_DURATION_DID_CHANGE, value)?;
                Self::PlaybackDurationDidChange {
                    duration: p.duration,
                }
            }
            Self::QUEUE_ITEMS_DID_CHANGE => {
                let p: QueuePayload = decode_payload(Self::QUEUE_ITEMS_DID_CHANGE, value)?;
                Self::QueueItemsDidChange {
                    items: p.queue.iter().filter_map(item_id).collect(),
                }
            }
            other => Self::Unknown {
                name: other.to_string(),
            },
        };
        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::MediaItemDidChange { .. } => Self::MEDIA_ITEM_DID_CHANGE,
            Self::PlaybackStateDidChange(_) => Self::PLAYBACK_STATE_DID_CHANGE,
            Self::PlaybackTimeDidChange { .. } => Self::PLAYBACK_TIME_DID_CHANGE,
            Self::PlaybackDurationDidChange { .. } => Self::PLAYBACK_DURATION_DID_CHANGE,
            Self::QueueItemsDidChange { .. } => Self::QUEUE_ITEMS_DID_CHANGE,
            Self::Unknown { name } => name,
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    event: &'static str,
    value: Value,
) -> Result<T, EnvelopeError> {
    serde_json::from_value(value).map_err(|source| EnvelopeError::InvalidPayload { event, source })
}

/// Item ids arrive as strings, numbers, or objects with an `id` field.
fn item_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj.get("id").and_then(item_id),
        _ => None,
    }
}
