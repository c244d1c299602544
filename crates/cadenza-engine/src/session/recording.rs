use std::collections::HashMap;

use parking_lot::Mutex;

use super::TrackId;
use crate::time::EngineProcessTimeInfo;

/// Receives the sample-accurate segments a track wants recorded this cycle.
///
/// Called from graph worker threads; implementations must not block for long.
pub trait RecordingManager: Send + Sync {
    fn handle_recording(&self, track: TrackId, segment: &EngineProcessTimeInfo);
}

/// Discards every segment.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl RecordingManager for NullRecorder {
    fn handle_recording(&self, _track: TrackId, _segment: &EngineProcessTimeInfo) {}
}

/// Keeps every segment in memory, grouped by track.
#[derive(Debug, Default)]
pub struct RecordingLog {
    segments: Mutex<HashMap<TrackId, Vec<EngineProcessTimeInfo>>>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self, track: TrackId) -> Vec<EngineProcessTimeInfo> {
        self.segments
            .lock()
            .get(&track)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.segments.lock().clear();
    }
}

impl RecordingManager for RecordingLog {
    fn handle_recording(&self, track: TrackId, segment: &EngineProcessTimeInfo) {
        self.segments
            .lock()
            .entry(track)
            .or_default()
            .push(*segment);
    }
}
