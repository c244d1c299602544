use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::port::{Port, PortFlow, PortOwner, PortRole, PortSpec, PortTable, PortType};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped = 0,
    RollRequested = 1,
    Rolling = 2,
    PauseRequested = 3,
}

impl PlayState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PlayState::RollRequested,
            2 => PlayState::Rolling,
            3 => PlayState::PauseRequested,
            _ => PlayState::Stopped,
        }
    }
}

/// Actions that can be triggered from the transport's MIDI-mappable ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportAction {
    Roll,
    Stop,
    Backward,
    Forward,
    LoopToggle,
    RecToggle,
}

/// Loop and punch positions captured at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportMarkers {
    pub loop_enabled: bool,
    pub loop_start: u64,
    pub loop_end: u64,
    pub punch_enabled: bool,
    pub punch_in: u64,
    pub punch_out: u64,
}

#[derive(Debug, Clone)]
pub struct TransportPorts {
    pub roll: Arc<Port>,
    pub stop: Arc<Port>,
    pub backward: Arc<Port>,
    pub forward: Arc<Port>,
    pub loop_toggle: Arc<Port>,
    pub rec_toggle: Arc<Port>,
}

impl TransportPorts {
    pub(crate) fn create(table: &mut PortTable) -> Self {
        let mut action = |label: &str, action: TransportAction| {
            table.create(
                PortSpec::new(label, PortType::Event, PortFlow::Input, PortOwner::Transport)
                    .role(PortRole::Transport(action)),
            )
        };
        Self {
            roll: action("Roll", TransportAction::Roll),
            stop: action("Stop", TransportAction::Stop),
            backward: action("Backward", TransportAction::Backward),
            forward: action("Forward", TransportAction::Forward),
            loop_toggle: action("Loop toggle", TransportAction::LoopToggle),
            rec_toggle: action("Rec toggle", TransportAction::RecToggle),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Port>> {
        [
            &self.roll,
            &self.stop,
            &self.backward,
            &self.forward,
            &self.loop_toggle,
            &self.rec_toggle,
        ]
        .into_iter()
    }
}

/// Lock-free play state, playhead, and loop/punch markers.
#[derive(Debug)]
pub struct Transport {
    play_state: AtomicU8,
    playhead: AtomicU64,
    sample_rate: AtomicU32,
    loop_enabled: AtomicBool,
    loop_start: AtomicU64,
    loop_end: AtomicU64,
    punch_enabled: AtomicBool,
    punch_in: AtomicU64,
    punch_out: AtomicU64,
    recording: AtomicBool,
    ports: TransportPorts,
}

impl Transport {
    pub fn new(ports: TransportPorts, sample_rate: u32) -> Self {
        Self {
            play_state: AtomicU8::new(PlayState::Stopped as u8),
            playhead: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            loop_enabled: AtomicBool::new(false),
            loop_start: AtomicU64::new(0),
            loop_end: AtomicU64::new(0),
            punch_enabled: AtomicBool::new(false),
            punch_in: AtomicU64::new(0),
            punch_out: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            ports,
        }
    }

    pub fn ports(&self) -> &TransportPorts {
        &self.ports
    }

    pub fn play_state(&self) -> PlayState {
        PlayState::from_u8(self.play_state.load(Ordering::Acquire))
    }

    pub fn set_play_state(&self, state: PlayState) {
        self.play_state.store(state as u8, Ordering::Release);
    }

    pub fn is_rolling(&self) -> bool {
        self.play_state() == PlayState::Rolling
    }

    pub fn request_roll(&self) {
        if self.play_state() != PlayState::Rolling {
            self.set_play_state(PlayState::RollRequested);
        }
    }

    pub fn request_pause(&self) {
        if self.play_state() != PlayState::Stopped {
            self.set_play_state(PlayState::PauseRequested);
        }
    }

    pub fn playhead(&self) -> u64 {
        self.playhead.load(Ordering::Relaxed)
    }

    pub fn set_playhead(&self, frames: u64) {
        self.playhead.store(frames, Ordering::Relaxed);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_loop(&self, start: u64, end: u64) {
        self.loop_start.store(start, Ordering::Relaxed);
        self.loop_end.store(end.max(start), Ordering::Relaxed);
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        self.loop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_punch(&self, punch_in: u64, punch_out: u64) {
        self.punch_in.store(punch_in, Ordering::Relaxed);
        self.punch_out.store(punch_out.max(punch_in), Ordering::Relaxed);
    }

    pub fn set_punch_enabled(&self, enabled: bool) {
        self.punch_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    pub fn markers(&self) -> TransportMarkers {
        TransportMarkers {
            loop_enabled: self.loop_enabled.load(Ordering::Relaxed),
            loop_start: self.loop_start.load(Ordering::Relaxed),
            loop_end: self.loop_end.load(Ordering::Relaxed),
            punch_enabled: self.punch_enabled.load(Ordering::Relaxed),
            punch_in: self.punch_in.load(Ordering::Relaxed),
            punch_out: self.punch_out.load(Ordering::Relaxed),
        }
    }

    /// Offsets `pos` by `delta` frames, wrapping back to the loop start when
    /// the loop end is crossed.
    pub fn frames_add_frames(&self, pos: u64, delta: i64) -> u64 {
        let target = if delta >= 0 {
            pos.saturating_add(delta as u64)
        } else {
            pos.saturating_sub(delta.unsigned_abs())
        };
        let markers = self.markers();
        if markers.loop_enabled
            && markers.loop_end > markers.loop_start
            && pos < markers.loop_end
            && target >= markers.loop_end
        {
            let len = markers.loop_end - markers.loop_start;
            return markers.loop_start + (target - markers.loop_end) % len;
        }
        target
    }

    pub fn advance(&self, nframes: u32) {
        let next = self.frames_add_frames(self.playhead(), i64::from(nframes));
        self.set_playhead(next);
    }

    pub fn apply(&self, action: TransportAction) {
        let nudge = u64::from(self.sample_rate());
        match action {
            TransportAction::Roll => self.request_roll(),
            TransportAction::Stop => self.request_pause(),
            TransportAction::Backward => self.set_playhead(self.playhead().saturating_sub(nudge)),
            TransportAction::Forward => self.set_playhead(self.playhead().saturating_add(nudge)),
            TransportAction::LoopToggle => {
                self.loop_enabled.fetch_xor(true, Ordering::Relaxed);
            }
            TransportAction::RecToggle => {
                self.recording.fetch_xor(true, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        let mut table = PortTable::new(64);
        Transport::new(TransportPorts::create(&mut table), 48_000)
    }

    #[test]
    fn adding_frames_wraps_at_loop_end() {
        let transport = transport();
        transport.set_loop(100, 200);
        transport.set_loop_enabled(true);
        assert_eq!(transport.frames_add_frames(150, 30), 180);
        assert_eq!(transport.frames_add_frames(150, 60), 110);
        // already past the loop end, no wrap
        assert_eq!(transport.frames_add_frames(250, 10), 260);
    }

    #[test]
    fn roll_request_is_not_repeated_while_rolling() {
        let transport = transport();
        transport.apply(TransportAction::Roll);
        assert_eq!(transport.play_state(), PlayState::RollRequested);
        transport.set_play_state(PlayState::Rolling);
        transport.request_roll();
        assert!(transport.is_rolling());
        transport.apply(TransportAction::Stop);
        assert_eq!(transport.play_state(), PlayState::PauseRequested);
    }

    #[test]
    fn toggles_flip_state() {
        let transport = transport();
        transport.apply(TransportAction::LoopToggle);
        assert!(transport.markers().loop_enabled);
        transport.apply(TransportAction::RecToggle);
        assert!(transport.is_recording());
        assert_eq!(transport.ports().iter().count(), 6);
    }
}
