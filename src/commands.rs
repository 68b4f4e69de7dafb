//! Typed playback commands.
//!
//! Each verb serializes its arguments into the agent's route body and sends
//! it over the [`Transport`]. Failures are logged and swallowed: the UI never
//! sees a command error, it only observes the state the agent reports back.
//! Behaviour setters and queue reorders update the local cache first.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::state::{clamp_volume, AudioQuality, PlaybackStore, RepeatMode};
use crate::transport::{Body, ResponseEnvelope, Transport};

pub mod routes {
    pub const PLAY: &str = "/play";
    pub const PAUSE: &str = "/pause";
    pub const STOP: &str = "/stop";
    pub const NEXT: &str = "/next";
    pub const PREVIOUS: &str = "/previous";
    pub const SEEK_TO_TIME: &str = "/seek-to-time";
    pub const SET_QUEUE: &str = "/set-queue";
    pub const SET_SHUFFLE_MODE: &str = "/set-shuffle-mode";
    pub const SET_REPEAT_MODE: &str = "/set-repeat-mode";
    pub const SET_AUTOPLAY: &str = "/set-autoplay";
    pub const SET_AUDIO_QUALITY: &str = "/set-audio-quality";
    pub const SET_VOLUME: &str = "/set-volume";
    pub const SKIP_TO_QUEUE_INDEX: &str = "/skip-to-queue-index";
    pub const REORDER_QUEUED_ITEM: &str = "/reorder-queued-item";
    pub const OPEN_AIRPLAY_PICKER: &str = "/open-airplay-picker";
    pub const OPEN_INSPECTOR: &str = "/open-inspector";
}

/// What to load into the agent's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTarget {
    Album(String),
    Playlist(String),
    Song(String),
}

impl QueueTarget {
    fn body(&self) -> Body {
        let (key, id) = match self {
            Self::Album(id) => ("albums-id", id),
            Self::Playlist(id) => ("playlists-id", id),
            Self::Song(id) => ("songs-id", id),
        };
        let mut body = Body::new();
        body.insert(key.to_string(), Value::String(id.clone()));
        body
    }
}

/// Cheap to clone; clones share the transport and store.
#[derive(Clone)]
pub struct CommandFacade {
    transport: Arc<dyn Transport>,
    store: Arc<PlaybackStore>,
}

impl CommandFacade {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<PlaybackStore>) -> Self {
        Self { transport, store }
    }

    /// Send one command. Errors end here.
    async fn dispatch(&self, route: &'static str, body: Body) -> Option<ResponseEnvelope> {
        match self.transport.request(route, body).await {
            Ok(response) => {
                debug!(route, "Agent command acknowledged");
                Some(response)
            }
            Err(e) => {
                warn!(route, error = %e, "Agent command failed");
                None
            }
        }
    }

    /// Start playback. `shuffle` overrides the agent's shuffle mode for this
    /// start only.
    pub async fn play(&self, shuffle: Option<bool>) {
        let mut body = Body::new();
        if let Some(shuffle) = shuffle {
            body.insert("shuffle".into(), Value::Bool(shuffle));
        }
        self.dispatch(routes::PLAY, body).await;
    }

    pub async fn pause(&self) {
        self.dispatch(routes::PAUSE, Body::new()).await;
    }

    pub async fn stop(&self) {
        self.dispatch(routes::STOP, Body::new()).await;
    }

    pub async fn next(&self) {
        self.dispatch(routes::NEXT, Body::new()).await;
    }

    pub async fn previous(&self) {
        self.dispatch(routes::PREVIOUS, Body::new()).await;
    }

    pub async fn open_inspector(&self) {
        self.dispatch(routes::OPEN_INSPECTOR, Body::new()).await;
    }

    /// Pause when playing, otherwise play.
    pub async fn toggle_playback(&self) {
        if self.store.now_playing().is_playing {
            self.pause().await;
        } else {
            self.play(None).await;
        }
    }

    /// Stop, then start the (new) queue from the top.
    pub async fn clear_and_play(&self) {
        self.stop().await;
        self.play(None).await;
    }

    pub async fn seek_to_time(&self, seconds: u64) {
        self.dispatch(routes::SEEK_TO_TIME, object(json!({ "seconds": seconds })))
            .await;
    }

    pub async fn set_queue(&self, target: &QueueTarget) {
        self.dispatch(routes::SET_QUEUE, target.body()).await;
    }

    pub async fn set_shuffle(&self, shuffle: bool) {
        self.store.update_behaviour(|b| b.shuffle = shuffle);
        self.dispatch(routes::SET_SHUFFLE_MODE, shuffle_body(shuffle))
            .await;
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) {
        self.store.update_behaviour(|b| b.repeat_mode = mode);
        self.dispatch(routes::SET_REPEAT_MODE, repeat_body(mode)).await;
    }

    pub async fn set_autoplay(&self, enabled: bool) {
        self.store.update_behaviour(|b| b.autoplay_enabled = enabled);
        self.dispatch(routes::SET_AUTOPLAY, autoplay_body(enabled))
            .await;
    }

    pub async fn set_audio_quality(&self, quality: AudioQuality) {
        self.store.update_behaviour(|b| b.audio_quality = quality);
        self.dispatch(routes::SET_AUDIO_QUALITY, quality_body(quality))
            .await;
    }

    /// Volume is clamped to `[0, 1]` before it is cached or sent.
    pub async fn set_volume(&self, volume: f64) {
        let volume = clamp_volume(volume);
        self.store.update_behaviour(|b| b.volume = volume);
        self.dispatch(routes::SET_VOLUME, volume_body(volume)).await;
    }

    pub async fn skip_to_queue_index(&self, index: usize) {
        self.dispatch(routes::SKIP_TO_QUEUE_INDEX, object(json!({ "index": index })))
            .await;
    }

    /// Reorder locally right away; the next `queueItemsDidChange` confirms or
    /// corrects it.
    pub async fn reorder_queued_item(&self, from: usize, to: usize) {
        let mut moved = false;
        self.store.update_queue(|q| moved = q.reorder(from, to));
        if !moved {
            debug!(from, to, "Reorder source outside the local queue, leaving it to the agent");
        }
        self.dispatch(
            routes::REORDER_QUEUED_ITEM,
            object(json!({ "from": from, "to": to })),
        )
        .await;
    }

    /// Show the system output picker, optionally anchored at `(x, y)`.
    ///
    /// Returns whether the agent supports AirPlay, or `None` if it did not
    /// answer.
    pub async fn open_airplay_picker(&self, anchor: Option<(i32, i32)>) -> Option<bool> {
        let mut body = Body::new();
        if let Some((x, y)) = anchor {
            body.insert("x".into(), json!(x));
            body.insert("y".into(), json!(y));
        }
        let response = self.dispatch(routes::OPEN_AIRPLAY_PICKER, body).await?;
        response.get_bool("supportsAirPlay")
    }

    /// Send the whole cached behaviour, e.g. to a freshly connected agent.
    pub async fn push_behaviour(&self) {
        let b = self.store.behaviour();
        tokio::join!(
            self.dispatch(routes::SET_SHUFFLE_MODE, shuffle_body(b.shuffle)),
            self.dispatch(routes::SET_REPEAT_MODE, repeat_body(b.repeat_mode)),
            self.dispatch(routes::SET_AUTOPLAY, autoplay_body(b.autoplay_enabled)),
            self.dispatch(routes::SET_AUDIO_QUALITY, quality_body(b.audio_quality)),
            self.dispatch(routes::SET_VOLUME, volume_body(b.volume)),
        );
    }
}

fn object(value: Value) -> Body {
    match value {
        Value::Object(map) => map,
        _ => Body::new(),
    }
}

fn shuffle_body(shuffle: bool) -> Body {
    object(json!({ "shuffle": shuffle }))
}

fn repeat_body(mode: RepeatMode) -> Body {
    object(json!({ "repeat-mode": mode.as_str() }))
}

fn autoplay_body(enabled: bool) -> Body {
    object(json!({ "autoplay": enabled }))
}

fn quality_body(quality: AudioQuality) -> Body {
    object(json!({ "quality": quality.bitrate() }))
}

fn volume_body(volume: f64) -> Body {
    object(json!({ "volume": volume }))
}
