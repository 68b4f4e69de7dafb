//! Raw traffic log for debugging tools.
//!
//! Every frame the transport sends or receives is recorded verbatim with a
//! timestamp, direction and kind. The log keeps the most recent `capacity`
//! records and also fans each record out to live subscribers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::transport::Envelope;

/// Default number of records retained.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// What a frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficKind {
    Request,
    Response,
    Event,
    /// Unparseable, or neither a pending response nor an event.
    Malformed,
}

impl From<&Envelope> for TrafficKind {
    fn from(envelope: &Envelope) -> Self {
        match envelope {
            Envelope::Request(_) => Self::Request,
            Envelope::Response(_) => Self::Response,
            Envelope::Event(_) => Self::Event,
        }
    }
}

/// One frame as it crossed the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub direction: Direction,
    pub kind: TrafficKind,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub raw: String,
}

/// Cloneable handle to a shared traffic log.
#[derive(Debug, Clone)]
pub struct TrafficRecorder {
    records: Arc<Mutex<VecDeque<TrafficRecord>>>,
    capacity: usize,
    feed: broadcast::Sender<TrafficRecord>,
}

impl Default for TrafficRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TrafficRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity,
            feed: broadcast::channel(256).0,
        }
    }

    /// Record a classified frame.
    pub fn record_envelope(&self, direction: Direction, envelope: &Envelope, raw: &str) {
        self.record(
            direction,
            TrafficKind::from(envelope),
            envelope.request_id(),
            raw,
        );
    }

    pub fn record(
        &self,
        direction: Direction,
        kind: TrafficKind,
        request_id: Option<&str>,
        raw: &str,
    ) {
        let record = TrafficRecord {
            direction,
            kind,
            timestamp: Utc::now(),
            request_id: request_id.map(str::to_string),
            raw: raw.to_string(),
        };

        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        // No subscribers is fine.
        let _ = self.feed.send(record);
    }

    /// Copy of the retained records, oldest first.
    pub fn snapshot(&self) -> Vec<TrafficRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Live feed of records as they are written.
    pub fn subscribe(&self) -> broadcast::Receiver<TrafficRecord> {
        self.feed.subscribe()
    }
}
