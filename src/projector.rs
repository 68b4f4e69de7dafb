//! Event projection into observable playback state.
//!
//! The projector is the only writer of [`NowPlayingState`]. It consumes the
//! transport's event stream in order and folds each event into the store.
//! Catalog lookups for a new item run in their own task so time updates keep
//! flowing while metadata resolves.
//!
//! [`NowPlayingState`]: crate::state::NowPlayingState

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::state::PlaybackStore;
use crate::transport::{AgentEvent, MediaParams, PlaybackStatus};

/// Edge length substituted into artwork URL templates.
pub const ARTWORK_SIZE: u32 = 200;

pub struct StateProjector {
    store: Arc<PlaybackStore>,
    catalog: Option<Arc<dyn Catalog>>,
    time_throttle: Duration,
    last_time_update: Mutex<Option<Instant>>,
}

impl StateProjector {
    pub fn new(
        store: Arc<PlaybackStore>,
        catalog: Option<Arc<dyn Catalog>>,
        time_throttle: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            time_throttle,
            last_time_update: Mutex::new(None),
        }
    }

    /// Consume events until the transport's event stream closes.
    pub async fn run(self, mut events: broadcast::Receiver<AgentEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Projector fell behind the agent event stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Agent event stream ended");
    }

    /// Fold one event into the store.
    pub fn apply(&self, event: AgentEvent) {
        match event {
            AgentEvent::MediaItemDidChange { id, params } => self.item_changed(id, params),
            AgentEvent::PlaybackStateDidChange(status) => self.status_changed(&status),
            AgentEvent::PlaybackTimeDidChange {
                current_time,
                remaining_time,
            } => self.time_changed(current_time, remaining_time),
            AgentEvent::PlaybackDurationDidChange { duration } => {
                if duration > 0.0 {
                    self.store.update_now_playing(|s| s.duration = duration);
                }
            }
            AgentEvent::QueueItemsDidChange { items } => {
                debug!(len = items.len(), "Queue changed");
                self.store.update_queue(|q| q.replace(items));
            }
            AgentEvent::Unknown { name } => {
                debug!(event = %name, "Unhandled agent event");
            }
        }
    }

    fn item_changed(&self, id: String, params: Option<MediaParams>) {
        let mut is_new = false;
        self.store.update_now_playing(|s| {
            if s.current_item_id.as_deref() == Some(id.as_str()) {
                return;
            }
            is_new = true;
            let params = params.unwrap_or_default();
            s.current_item_id = Some(id.clone());
            s.is_ready = false;
            s.title = params.name;
            s.artist_name = params.artist_name;
            s.artwork_ref = params.artwork_url.as_deref().map(sized_artwork);
            s.content_rating = None;
        });

        if !is_new {
            debug!(id = %id, "Item unchanged, not resolving again");
            return;
        }
        info!(id = %id, "Now playing item changed");

        if let Some(catalog) = self.catalog.clone() {
            let store = Arc::clone(&self.store);
            tokio::spawn(resolve_item(catalog, store, id));
        }
    }

    fn status_changed(&self, status: &PlaybackStatus) {
        match status {
            PlaybackStatus::Playing => self.store.update_now_playing(|s| {
                s.is_playing = true;
                s.has_item_to_play = true;
                s.is_ready = true;
            }),
            PlaybackStatus::Paused => self.store.update_now_playing(|s| s.is_playing = false),
            PlaybackStatus::Stopped => {
                *self
                    .last_time_update
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                self.store.update_now_playing(|s| s.reset());
            }
            PlaybackStatus::Other(state) => debug!(state = %state, "Transient playback state"),
        }
    }

    /// Leading-edge throttle, and nothing at all while hidden.
    fn time_changed(&self, current_time: f64, remaining_time: Option<f64>) {
        if !self.store.is_visible() {
            return;
        }
        {
            let mut last = self
                .last_time_update
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.time_throttle) {
                return;
            }
            *last = Some(now);
        }

        self.store.update_now_playing(|s| {
            s.current_time = Some(current_time);
            if remaining_time.is_some() {
                s.remaining_time = remaining_time;
            }
        });
    }
}

async fn resolve_item(catalog: Arc<dyn Catalog>, store: Arc<PlaybackStore>, id: String) {
    let metadata = match catalog.fetch_item(&id).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(id = %id, error = %e, "Catalog lookup failed, keeping agent metadata");
            return;
        }
    };

    store.update_now_playing(|s| {
        if s.current_item_id.as_deref() != Some(id.as_str()) {
            debug!(id = %id, "Discarding metadata for an item no longer playing");
            return;
        }
        if metadata.title.is_some() {
            s.title = metadata.title;
        }
        if metadata.artist_name.is_some() {
            s.artist_name = metadata.artist_name;
        }
        if let Some(url) = metadata.artwork_url.as_deref() {
            s.artwork_ref = Some(sized_artwork(url));
        }
        s.content_rating = metadata.content_rating;
    });
}

/// Fill the `{w}`/`{h}` placeholders of an artwork URL template.
pub fn sized_artwork(template: &str) -> String {
    let size = ARTWORK_SIZE.to_string();
    template.replace("{w}", &size).replace("{h}", &size)
}
