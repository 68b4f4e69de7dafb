//! Observable playback state.
//!
//! [`PlaybackStore`] holds the three values the UI observes: the now-playing
//! snapshot, the queue mirror, and the cached playback behaviour. Each is a
//! `watch` channel so observers always see the latest value and never a
//! backlog. Now-playing is written only by the projector.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::PlaybackDefaults;

/// What is playing right now, as reported by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingState {
    pub current_item_id: Option<String>,
    pub title: Option<String>,
    pub artist_name: Option<String>,
    pub artwork_ref: Option<String>,
    pub content_rating: Option<String>,
    pub is_playing: bool,
    pub is_ready: bool,
    pub has_item_to_play: bool,
    pub current_time: Option<f64>,
    pub remaining_time: Option<f64>,
    pub duration: f64,
}

impl Default for NowPlayingState {
    fn default() -> Self {
        Self {
            current_item_id: None,
            title: None,
            artist_name: None,
            artwork_ref: None,
            content_rating: None,
            is_playing: false,
            is_ready: true,
            has_item_to_play: false,
            current_time: None,
            remaining_time: None,
            duration: 0.0,
        }
    }
}

impl NowPlayingState {
    /// Back to the initial empty value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Ordered track ids mirrored from the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    items: Vec<String>,
}

impl Queue {
    pub fn new(items: Vec<String>) -> Self {
        Self { items }
    }

    pub fn ids(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn replace(&mut self, items: Vec<String>) {
        self.items = items;
    }

    /// Move the item at `from` to `to`. Out-of-range `to` moves it to the end.
    ///
    /// Returns `false` (and leaves the queue alone) when `from` is out of range.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from >= self.items.len() {
            return false;
        }
        let item = self.items.remove(from);
        let to = to.min(self.items.len());
        self.items.insert(to, item);
        true
    }
}

/// Agent repeat mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    #[value(alias = "off")]
    None,
    One,
    All,
}

impl RepeatMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::One => "one",
            Self::All => "all",
        }
    }
}

/// Streaming quality requested from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    #[value(alias = "64")]
    Standard,
    #[value(alias = "256")]
    High,
}

impl AudioQuality {
    /// Bitrate in kbps, as the agent expects it.
    pub const fn bitrate(self) -> u32 {
        match self {
            Self::Standard => 64,
            Self::High => 256,
        }
    }
}

/// Locally owned playback settings, pushed to the agent on change.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBehaviour {
    pub shuffle: bool,
    pub repeat_mode: RepeatMode,
    pub autoplay_enabled: bool,
    pub volume: f64,
    pub audio_quality: AudioQuality,
}

impl PlaybackBehaviour {
    pub fn from_defaults(defaults: &PlaybackDefaults) -> Self {
        Self {
            shuffle: false,
            repeat_mode: RepeatMode::None,
            autoplay_enabled: defaults.autoplay,
            volume: clamp_volume(defaults.volume),
            audio_quality: defaults.audio_quality,
        }
    }
}

impl Default for PlaybackBehaviour {
    fn default() -> Self {
        Self::from_defaults(&PlaybackDefaults::default())
    }
}

/// Clamp a volume into `[0, 1]`; NaN becomes silence.
pub fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Shared holder of everything the UI observes.
#[derive(Debug)]
pub struct PlaybackStore {
    now_playing: watch::Sender<NowPlayingState>,
    queue: watch::Sender<Queue>,
    behaviour: watch::Sender<PlaybackBehaviour>,
    visible: AtomicBool,
}

impl PlaybackStore {
    pub fn new(behaviour: PlaybackBehaviour) -> Self {
        Self {
            now_playing: watch::channel(NowPlayingState::default()).0,
            queue: watch::channel(Queue::default()).0,
            behaviour: watch::channel(behaviour).0,
            visible: AtomicBool::new(true),
        }
    }

    pub fn now_playing(&self) -> NowPlayingState {
        self.now_playing.borrow().clone()
    }

    pub fn subscribe_now_playing(&self) -> watch::Receiver<NowPlayingState> {
        self.now_playing.subscribe()
    }

    pub fn queue(&self) -> Queue {
        self.queue.borrow().clone()
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<Queue> {
        self.queue.subscribe()
    }

    pub fn behaviour(&self) -> PlaybackBehaviour {
        self.behaviour.borrow().clone()
    }

    pub fn subscribe_behaviour(&self) -> watch::Receiver<PlaybackBehaviour> {
        self.behaviour.subscribe()
    }

    /// Whether the UI is currently showing playback progress.
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    /// Observers are only woken when the closure actually changed something.
    pub(crate) fn update_now_playing(&self, f: impl FnOnce(&mut NowPlayingState)) {
        self.now_playing.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    pub(crate) fn update_queue(&self, f: impl FnOnce(&mut Queue)) {
        self.queue.send_if_modified(|queue| {
            let before = queue.clone();
            f(queue);
            *queue != before
        });
    }

    pub(crate) fn update_behaviour(&self, f: impl FnOnce(&mut PlaybackBehaviour)) {
        self.behaviour.send_if_modified(|behaviour| {
            let before = behaviour.clone();
            f(behaviour);
            *behaviour != before
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(ids: &[&str]) -> Queue {
        Queue::new(ids.iter().map(|s| (*s).to_string()).collect())
    }

    #[test]
    fn reset_restores_initial_value() {
        let mut state = NowPlayingState {
            current_item_id: Some("1".into()),
            title: Some("Song".into()),
            is_playing: true,
            is_ready: false,
            has_item_to_play: true,
            current_time: Some(12.0),
            duration: 200.0,
            ..NowPlayingState::default()
        };
        state.reset();
        assert_eq!(state, NowPlayingState::default());
        assert!(state.is_ready);
    }

    #[test]
    fn reorder_moves_item() {
        let mut q = queue(&["a", "b", "c", "d"]);
        assert!(q.reorder(0, 2));
        assert_eq!(q.ids(), ["b", "c", "a", "d"]);

        assert!(q.reorder(3, 0));
        assert_eq!(q.ids(), ["d", "b", "c", "a"]);
    }

    #[test]
    fn reorder_clamps_destination() {
        let mut q = queue(&["a", "b", "c"]);
        assert!(q.reorder(0, 99));
        assert_eq!(q.ids(), ["b", "c", "a"]);
    }

    #[test]
    fn reorder_rejects_bad_source() {
        let mut q = queue(&["a", "b"]);
        assert!(!q.reorder(5, 0));
        assert_eq!(q.ids(), ["a", "b"]);
    }

    #[test]
    fn volume_is_clamped() {
        assert!((clamp_volume(1.7) - 1.0).abs() < f64::EPSILON);
        assert!(clamp_volume(-0.2).abs() < f64::EPSILON);
        assert!(clamp_volume(f64::NAN).abs() < f64::EPSILON);
        assert!((clamp_volume(0.25) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn repeat_mode_and_quality_wire_values() {
        assert_eq!(RepeatMode::None.as_str(), "none");
        assert_eq!(RepeatMode::One.as_str(), "one");
        assert_eq!(RepeatMode::All.as_str(), "all");
        assert_eq!(AudioQuality::Standard.bitrate(), 64);
        assert_eq!(AudioQuality::High.bitrate(), 256);
    }

    #[test]
    fn store_only_notifies_on_change() {
        let store = PlaybackStore::new(PlaybackBehaviour::default());
        let mut rx = store.subscribe_now_playing();

        store.update_now_playing(|_| {});
        assert!(!rx.has_changed().unwrap());

        store.update_now_playing(|s| s.is_playing = true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_playing);
    }

    #[test]
    fn visibility_defaults_to_visible() {
        let store = PlaybackStore::new(PlaybackBehaviour::default());
        assert!(store.is_visible());
        store.set_visible(false);
        assert!(!store.is_visible());
    }
}
