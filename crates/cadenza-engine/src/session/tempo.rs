use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF32;

use super::port::{Port, PortOwner, PortRole, PortSpec, PortTable};
use super::TrackId;
use crate::time::BeatUnit;

pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 420.0;
pub const MIN_BEATS_PER_BAR: u32 = 1;
pub const MAX_BEATS_PER_BAR: u32 = 16;

/// Tempo observed by every node during a cycle.
#[derive(Debug)]
pub struct TempoState {
    bpm: AtomicF32,
    beats_per_bar: AtomicU32,
    beat_unit: AtomicU32,
    sample_rate: AtomicU32,
}

impl TempoState {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            bpm: AtomicF32::new(120.0),
            beats_per_bar: AtomicU32::new(4),
            beat_unit: AtomicU32::new(BeatUnit::Four.value()),
            sample_rate: AtomicU32::new(sample_rate),
        }
    }

    pub fn bpm(&self) -> f32 {
        self.bpm.load(Ordering::Relaxed)
    }

    pub fn set_bpm(&self, bpm: f32) {
        self.bpm.store(bpm.clamp(MIN_BPM, MAX_BPM), Ordering::Relaxed);
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar.load(Ordering::Relaxed)
    }

    pub fn set_beats_per_bar(&self, beats: u32) {
        self.beats_per_bar.store(
            beats.clamp(MIN_BEATS_PER_BAR, MAX_BEATS_PER_BAR),
            Ordering::Relaxed,
        );
    }

    pub fn beat_unit(&self) -> BeatUnit {
        BeatUnit::from_value(self.beat_unit.load(Ordering::Relaxed))
    }

    pub fn set_beat_unit(&self, unit: BeatUnit) {
        self.beat_unit.store(unit.value(), Ordering::Relaxed);
    }

    /// Length of one beat in frames at the current tempo.
    pub fn frames_per_beat(&self) -> f64 {
        let rate = f64::from(self.sample_rate.load(Ordering::Relaxed));
        rate * 60.0 / f64::from(self.bpm())
    }
}

/// Control ports exposed by the tempo track.
#[derive(Debug, Clone)]
pub struct TempoPorts {
    pub bpm: Arc<Port>,
    pub beats_per_bar: Arc<Port>,
    pub beat_unit: Arc<Port>,
}

impl TempoPorts {
    pub(crate) fn create(table: &mut PortTable, track: TrackId) -> Self {
        let owner = PortOwner::Track(track);
        Self {
            bpm: table.create(
                PortSpec::control("BPM", owner, 120.0)
                    .range(MIN_BPM, MAX_BPM)
                    .role(PortRole::Bpm),
            ),
            beats_per_bar: table.create(
                PortSpec::control("Beats per bar", owner, 4.0)
                    .range(MIN_BEATS_PER_BAR as f32, MAX_BEATS_PER_BAR as f32)
                    .role(PortRole::BeatsPerBar),
            ),
            beat_unit: table.create(
                PortSpec::control("Beat unit", owner, 4.0)
                    .range(2.0, 16.0)
                    .role(PortRole::BeatUnit),
            ),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.bpm, &self.beats_per_bar, &self.beat_unit].into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempo_values_are_kept_in_range() {
        let tempo = TempoState::new(48_000);
        tempo.set_bpm(1_000.0);
        assert_eq!(tempo.bpm(), MAX_BPM);
        tempo.set_beats_per_bar(0);
        assert_eq!(tempo.beats_per_bar(), 1);
        tempo.set_bpm(120.0);
        assert!((tempo.frames_per_beat() - 24_000.0).abs() < f64::EPSILON);
    }
}
