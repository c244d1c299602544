//! Per-track input stage: clip playback, input monitoring, MIDI controller
//! automation and recording dispatch.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam::queue::ArrayQueue;
use parking_lot::RwLock;

use crate::graph::{ProcessContext, Processable};
use crate::midi::{self, MidiEvent, MIDI_CHANNELS, MIDI_CONTROLLERS, PITCH_BEND_CENTER};
use crate::session::port::{Port, PortFlow, PortOwner, PortRole, PortSpec, PortTable, PortType, StereoPorts};
use crate::session::transport::TransportMarkers;
use crate::session::{TrackId, TrackType};
use crate::time::EngineProcessTimeInfo;

/// Controller ports per MIDI channel: 128 CCs, pitch bend, poly and channel pressure.
const CONTROLS_PER_CHANNEL: usize = MIDI_CONTROLLERS as usize + 3;
const PITCH_BEND_SLOT: usize = MIDI_CONTROLLERS as usize;
const POLY_PRESSURE_SLOT: usize = PITCH_BEND_SLOT + 1;
const CHANNEL_PRESSURE_SLOT: usize = PITCH_BEND_SLOT + 2;
const ALL_CHANNELS: u16 = u16::MAX;

/// Arrangement data played back by a track. Implemented outside the engine.
pub trait ClipSource: Send + Sync {
    /// Adds clip audio for `time` into the slices, which cover `time.buffer_range()`.
    fn fill_audio(&self, time: &EngineProcessTimeInfo, left: &mut [f32], right: &mut [f32]);

    /// Pushes region events for `time`, timestamped in buffer frames.
    fn fill_midi(&self, time: &EngineProcessTimeInfo, events: &mut Vec<MidiEvent>);
}

struct MidiControls {
    ports: Vec<Arc<Port>>,
    updated: ArrayQueue<usize>,
}

impl MidiControls {
    fn create(table: &mut PortTable, owner: PortOwner, name: &str) -> Self {
        let mut ports = Vec::with_capacity(MIDI_CHANNELS as usize * CONTROLS_PER_CHANNEL);
        for channel in 0..MIDI_CHANNELS {
            let label = |what: String| format!("{name} ch{} {what}", channel + 1);
            for controller in 0..MIDI_CONTROLLERS {
                ports.push(table.create(
                    PortSpec::control(label(format!("CC{controller}")), owner, 0.0)
                        .role(PortRole::MidiCc { channel, controller })
                        .automatable(),
                ));
            }
            ports.push(table.create(
                PortSpec::control(label("pitch bend".into()), owner, 0.0)
                    .range(-8192.0, 8191.0)
                    .role(PortRole::PitchBend { channel })
                    .automatable(),
            ));
            ports.push(table.create(
                PortSpec::control(label("poly key pressure".into()), owner, 0.0)
                    .role(PortRole::PolyKeyPressure { channel })
                    .automatable(),
            ));
            ports.push(table.create(
                PortSpec::control(label("channel pressure".into()), owner, 0.0)
                    .role(PortRole::ChannelPressure { channel })
                    .automatable(),
            ));
        }
        let updated = ArrayQueue::new(ports.len());
        Self { ports, updated }
    }

    fn set(&self, channel: u8, slot: usize, value: f32) {
        let index = usize::from(channel % MIDI_CHANNELS) * CONTROLS_PER_CHANNEL + slot;
        if let Some(port) = self.ports.get(index) {
            port.set_control(value);
            // a full queue already holds every index
            let _ = self.updated.push(index);
        }
    }

    fn drain_into(&self, events: &mut Vec<MidiEvent>, time: u32) {
        while let Some(index) = self.updated.pop() {
            let Some(port) = self.ports.get(index) else {
                continue;
            };
            let value = port.control();
            let event = match port.role() {
                PortRole::MidiCc { channel, controller } => {
                    MidiEvent::control_change(channel, controller, to_7bit(value), time)
                }
                PortRole::PitchBend { channel } => {
                    let bend = (value.round() as i32 + PITCH_BEND_CENTER).clamp(0, 0x3fff);
                    MidiEvent::pitch_bend(channel, bend as u16, time)
                }
                PortRole::ChannelPressure { channel } => {
                    MidiEvent::channel_pressure(channel, to_7bit(value), time)
                }
                _ => continue,
            };
            events.push(event);
        }
    }
}

fn to_7bit(value: f32) -> u8 {
    (value * 127.0).round().clamp(0.0, 127.0) as u8
}

/// Split points and lengths of the recording segments of one block.
pub(crate) type SplitPoints = ArrayVec<(u64, u32), 6>;

/// Splits the block at the loop end and the punch points so no recorded
/// segment straddles a wrap or a punch boundary.
///
/// Returns `(global frame, length)` per segment, including zero-length pauses.
pub(crate) fn split_points(time: &EngineProcessTimeInfo, markers: &TransportMarkers) -> SplitPoints {
    let start = time.g_start_frame_w_offset;
    let end = time.g_end_frame();
    let mut points = [start; 6];
    let mut lens = [0_u32; 6];
    lens[0] = time.nframes;
    let mut count = 1;

    let loop_end = markers.loop_end;
    let loop_hit = markers.loop_enabled && start < loop_end && loop_end <= end;
    if loop_hit {
        count = 3;
        lens[0] = frames_between(start, loop_end);
        points[1] = loop_end;
        lens[1] = 0;
        points[2] = markers.loop_start;
        lens[2] = time.nframes - lens[0];
    }

    if markers.punch_enabled {
        let limit = if loop_hit { loop_end } else { end };
        let (punch_in, punch_out) = (markers.punch_in, markers.punch_out);
        let in_hit = start <= punch_in && punch_in < limit;
        // a punch-out before the punch-in never closes a range
        let out_hit = start <= punch_out && punch_out < limit && punch_out >= punch_in;

        if in_hit {
            if loop_hit {
                count = 4;
                points[3] = points[2];
                lens[3] = lens[2];
                points[2] = points[1];
                lens[2] = lens[1];
            } else {
                count = 2;
            }
            points[1] = punch_in;
            lens[1] = frames_between(punch_in, limit);
            lens[0] = lens[0].saturating_sub(lens[1]);
        }

        if out_hit {
            if in_hit {
                let tail = frames_between(punch_out, limit);
                if loop_hit {
                    count = 6;
                    points[5] = points[3];
                    lens[5] = lens[3];
                    points[4] = points[2];
                    lens[4] = lens[2];
                } else {
                    count = 4;
                }
                points[2] = punch_out;
                lens[2] = tail;
                points[3] = punch_out + u64::from(tail);
                lens[3] = 0;
                lens[1] = lens[1].saturating_sub(tail);
            } else {
                let tail = frames_between(punch_out, limit);
                if loop_hit {
                    count = 5;
                    points[4] = points[2];
                    lens[4] = lens[2];
                    points[3] = points[1];
                    lens[3] = lens[1];
                } else {
                    count = 3;
                }
                points[1] = punch_out;
                lens[1] = tail;
                points[2] = punch_out + u64::from(tail);
                lens[2] = 0;
                lens[0] = lens[0].saturating_sub(tail);
            }
        }
    }

    points
        .into_iter()
        .zip(lens)
        .take(count)
        .collect()
}

/// Recording calls for one block: consecutive segments sharing a split
/// point are merged and empty pauses are dropped. Segments are addressed by
/// global frame only, so every `local_offset` is 0.
pub fn recording_segments(
    time: &EngineProcessTimeInfo,
    markers: &TransportMarkers,
) -> ArrayVec<EngineProcessTimeInfo, 6> {
    let mut merged: ArrayVec<(u64, u32), 6> = ArrayVec::new();
    for (point, len) in split_points(time, markers) {
        match merged.last_mut() {
            Some(last) if last.0 == point => last.1 += len,
            _ => merged.push((point, len)),
        }
    }

    merged
        .into_iter()
        .filter(|&(_, nframes)| nframes > 0)
        .map(|(point, nframes)| EngineProcessTimeInfo {
            g_start_frame: point,
            g_start_frame_w_offset: point,
            local_offset: 0,
            nframes,
        })
        .collect()
}

fn frames_between(from: u64, to: u64) -> u32 {
    u32::try_from(to.saturating_sub(from)).unwrap_or(u32::MAX)
}

/// Input stage of a track. Owns the ports the track exposes to the graph.
pub struct TrackProcessor {
    track: TrackId,
    name: String,
    ty: TrackType,
    stereo_in: Option<StereoPorts>,
    stereo_out: Option<StereoPorts>,
    mono: Option<Arc<Port>>,
    input_gain: Option<Arc<Port>>,
    output_gain: Option<Arc<Port>>,
    monitor_audio: Option<Arc<Port>>,
    midi_in: Option<Arc<Port>>,
    midi_out: Option<Arc<Port>>,
    piano_roll: Option<Arc<Port>>,
    midi_controls: Option<MidiControls>,
    enabled: AtomicBool,
    frozen: AtomicBool,
    armed: AtomicBool,
    automation_recording: AtomicBool,
    midi_channel: AtomicU8,
    passthrough: AtomicBool,
    input_channels: AtomicU16,
    clips: RwLock<Option<Arc<dyn ClipSource>>>,
}

impl TrackProcessor {
    pub(crate) fn new(track: TrackId, name: &str, ty: TrackType, table: &mut PortTable) -> Self {
        let owner = PortOwner::TrackProcessor(track);
        let audio_in = ty.in_signal() == Some(PortType::Audio);
        let event_in = ty.in_signal() == Some(PortType::Event);
        let is_audio_track = ty == TrackType::Audio;
        let midi_port = |table: &mut PortTable, label: String, flow| {
            table.create(PortSpec::new(label, PortType::Event, flow, owner))
        };

        let stereo_in = audio_in.then(|| StereoPorts::create(table, &format!("{name} stereo in"), PortFlow::Input, owner));
        let stereo_out = audio_in.then(|| StereoPorts::create(table, &format!("{name} stereo out"), PortFlow::Output, owner));
        let (mono, input_gain, output_gain, monitor_audio) = if is_audio_track {
            (
                Some(table.create(PortSpec::control(format!("{name} mono"), owner, 0.0).toggle())),
                Some(table.create(
                    PortSpec::control(format!("{name} input gain"), owner, 1.0).range(0.0, 4.0),
                )),
                Some(table.create(
                    PortSpec::control(format!("{name} output gain"), owner, 1.0)
                        .range(0.0, 4.0)
                        .automatable(),
                )),
                Some(table.create(
                    PortSpec::control(format!("{name} monitor audio"), owner, 0.0).toggle(),
                )),
            )
        } else {
            (None, None, None, None)
        };
        let midi_in = event_in.then(|| midi_port(table, format!("{name} MIDI in"), PortFlow::Input));
        let midi_out = event_in.then(|| midi_port(table, format!("{name} MIDI out"), PortFlow::Output));
        let piano_roll = ty
            .has_piano_roll()
            .then(|| midi_port(table, format!("{name} piano roll"), PortFlow::Input));
        let midi_controls = ty
            .has_midi_controls()
            .then(|| MidiControls::create(table, owner, name));

        Self {
            track,
            name: name.to_owned(),
            ty,
            stereo_in,
            stereo_out,
            mono,
            input_gain,
            output_gain,
            monitor_audio,
            midi_in,
            midi_out,
            piano_roll,
            midi_controls,
            enabled: AtomicBool::new(true),
            frozen: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            automation_recording: AtomicBool::new(false),
            midi_channel: AtomicU8::new(0),
            passthrough: AtomicBool::new(false),
            input_channels: AtomicU16::new(ALL_CHANNELS),
            clips: RwLock::new(None),
        }
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn ty(&self) -> TrackType {
        self.ty
    }

    pub fn stereo_in(&self) -> Option<&StereoPorts> {
        self.stereo_in.as_ref()
    }

    pub fn stereo_out(&self) -> Option<&StereoPorts> {
        self.stereo_out.as_ref()
    }

    pub fn mono(&self) -> Option<&Arc<Port>> {
        self.mono.as_ref()
    }

    pub fn input_gain(&self) -> Option<&Arc<Port>> {
        self.input_gain.as_ref()
    }

    pub fn output_gain(&self) -> Option<&Arc<Port>> {
        self.output_gain.as_ref()
    }

    pub fn monitor_audio(&self) -> Option<&Arc<Port>> {
        self.monitor_audio.as_ref()
    }

    pub fn midi_in(&self) -> Option<&Arc<Port>> {
        self.midi_in.as_ref()
    }

    pub fn midi_out(&self) -> Option<&Arc<Port>> {
        self.midi_out.as_ref()
    }

    pub fn piano_roll(&self) -> Option<&Arc<Port>> {
        self.piano_roll.as_ref()
    }

    /// CC, pitch-bend and pressure ports of every channel.
    pub fn midi_control_ports(&self) -> &[Arc<Port>] {
        self.midi_controls
            .as_ref()
            .map_or(&[], |controls| controls.ports.as_slice())
    }

    /// Ports the track processor writes.
    pub fn outputs(&self) -> Vec<&Arc<Port>> {
        let mut ports: Vec<&Arc<Port>> = self.stereo_out.iter().flat_map(StereoPorts::iter).collect();
        ports.extend(self.midi_out.iter());
        ports
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Relaxed);
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Relaxed);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    pub fn set_automation_recording(&self, recording: bool) {
        self.automation_recording.store(recording, Ordering::Relaxed);
    }

    pub fn set_midi_channel(&self, channel: u8) {
        self.midi_channel.store(channel % MIDI_CHANNELS, Ordering::Relaxed);
    }

    /// Keeps incoming channel numbers instead of rewriting them.
    pub fn set_passthrough(&self, passthrough: bool) {
        self.passthrough.store(passthrough, Ordering::Relaxed);
    }

    /// Restricts the channels accepted from the MIDI editor keyboard.
    pub fn set_input_channels(&self, channels: Option<[bool; MIDI_CHANNELS as usize]>) {
        let mask = channels.map_or(ALL_CHANNELS, |channels| {
            channels
                .iter()
                .enumerate()
                .filter(|(_, on)| **on)
                .fold(0, |mask, (i, _)| mask | (1 << i))
        });
        self.input_channels.store(mask, Ordering::Relaxed);
    }

    pub fn set_clip_source(&self, clips: Option<Arc<dyn ClipSource>>) {
        *self.clips.write() = clips;
    }

    pub fn set_cc(&self, channel: u8, controller: u8, value: f32) {
        if let Some(controls) = &self.midi_controls {
            controls.set(channel, usize::from(controller % MIDI_CONTROLLERS), value);
        }
    }

    pub fn set_pitch_bend(&self, channel: u8, value: f32) {
        if let Some(controls) = &self.midi_controls {
            controls.set(channel, PITCH_BEND_SLOT, value);
        }
    }

    pub fn set_poly_key_pressure(&self, channel: u8, value: f32) {
        if let Some(controls) = &self.midi_controls {
            controls.set(channel, POLY_PRESSURE_SLOT, value);
        }
    }

    pub fn set_channel_pressure(&self, channel: u8, value: f32) {
        if let Some(controls) = &self.midi_controls {
            controls.set(channel, CHANNEL_PRESSURE_SLOT, value);
        }
    }

    fn input_channel_filter(&self) -> [bool; MIDI_CHANNELS as usize] {
        let mask = self.input_channels.load(Ordering::Relaxed);
        std::array::from_fn(|i| mask & (1 << i) != 0)
    }

    fn clear_outputs(&self, time: &EngineProcessTimeInfo) {
        for port in self.outputs() {
            port.clear(time.buffer_range());
        }
    }

    fn fill_from_clips(&self, ctx: &ProcessContext<'_>, rolling: bool) {
        let clips = self.clips.read();
        let Some(clips) = clips.as_ref() else {
            return;
        };
        let range = ctx.time.buffer_range();
        if let Some(out) = &self.stereo_out {
            if rolling {
                let mut left = out.l.audio();
                let mut right = out.r.audio();
                if range.end <= left.len() && range.end <= right.len() {
                    clips.fill_audio(&ctx.time, &mut left[range.clone()], &mut right[range.clone()]);
                }
            }
        }
    }

    fn process_piano_roll(&self, ctx: &ProcessContext<'_>, rolling: bool) {
        let (Some(piano_roll), Some(midi_out)) = (&self.piano_roll, &self.midi_out) else {
            return;
        };
        let range = ctx.time.buffer_range();
        let local = ctx.time.local_offset;
        let mut roll = piano_roll.events();
        if ctx.services.engine.panic_requested() {
            midi::push_panic(&mut roll, local);
        } else if rolling {
            if let Some(clips) = self.clips.read().as_ref() {
                clips.fill_midi(&ctx.time, &mut roll);
            }
        }
        if self.ty != TrackType::Chord {
            if let Some(controls) = &self.midi_controls {
                controls.drain_into(&mut roll, local);
            }
        }
        midi::append_in_range(&mut midi_out.events(), &roll, range);
    }

    fn process_manual_press(&self, ctx: &ProcessContext<'_>) {
        let Some(midi_out) = &self.midi_out else {
            return;
        };
        if ctx.services.engine.clip_editor_track() != Some(self.track) {
            return;
        }
        let channels = self.input_channel_filter();
        let pressed = ctx.services.manual_press.events();
        midi::append_filtered(&mut midi_out.events(), &pressed, ctx.time.buffer_range(), &channels);
    }

    fn process_audio_input(&self, ctx: &ProcessContext<'_>) {
        let (Some(input), Some(output)) = (&self.stereo_in, &self.stereo_out) else {
            return;
        };
        if self.ty == TrackType::Audio
            && !self.monitor_audio.as_ref().is_some_and(|port| port.is_toggled())
        {
            return;
        }
        let gain = self.input_gain.as_ref().map_or(1.0, |port| port.control());
        let mono = self.mono.as_ref().is_some_and(|port| port.is_toggled());
        let range = ctx.time.buffer_range();

        let left_in = input.l.audio();
        let right_in = input.r.audio();
        let mut left_out = output.l.audio();
        let mut right_out = output.r.audio();
        let end = range
            .end
            .min(left_in.len())
            .min(right_in.len())
            .min(left_out.len())
            .min(right_out.len());
        for i in range.start.min(end)..end {
            let left = left_in[i] * gain;
            let right = if mono { left } else { right_in[i] * gain };
            left_out[i] += left;
            right_out[i] += right;
        }
    }

    fn process_event_input(&self, ctx: &ProcessContext<'_>) {
        let (Some(input), Some(output)) = (&self.midi_in, &self.midi_out) else {
            return;
        };
        let range = ctx.time.buffer_range();
        let passthrough = self.passthrough.load(Ordering::Relaxed);
        let channel = self.midi_channel.load(Ordering::Relaxed);
        let mut out = output.events();
        out.extend(
            input
                .events()
                .iter()
                .filter(|event| range.contains(&(event.time as usize)))
                .map(|event| if passthrough { *event } else { event.with_channel(channel) }),
        );
        if ctx.services.engine.panic_requested() {
            midi::push_panic(&mut out, ctx.time.local_offset);
        }
        out.sort_by_key(|event| event.time);
    }

    fn handle_recording(&self, ctx: &ProcessContext<'_>, rolling: bool) {
        let services = ctx.services;
        if services.engine.remaining_latency_preroll() > 0 || !rolling {
            return;
        }
        let recording = services.transport.is_recording() && self.is_armed();
        if !recording && !self.automation_recording.load(Ordering::Relaxed) {
            return;
        }
        let markers = services.transport.markers();
        for segment in recording_segments(&ctx.time, &markers) {
            services.recording.handle_recording(self.track, &segment);
        }
    }

    fn apply_output_gain(&self, ctx: &ProcessContext<'_>) {
        let (Some(gain), Some(output)) = (&self.output_gain, &self.stereo_out) else {
            return;
        };
        let gain = gain.control();
        let range = ctx.time.buffer_range();
        for port in output.iter() {
            let mut buf = port.audio();
            let end = range.end.min(buf.len());
            for sample in &mut buf[range.start.min(end)..end] {
                *sample *= gain;
            }
        }
    }
}

impl Processable for TrackProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        if ctx.noroll {
            self.clear_outputs(&ctx.time);
            return;
        }
        if self.frozen.load(Ordering::Relaxed) || !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        self.clear_outputs(&ctx.time);
        let rolling = ctx.services.transport.is_rolling();
        if self.ty == TrackType::Audio {
            self.fill_from_clips(ctx, rolling);
        }
        self.process_piano_roll(ctx, rolling);
        self.process_manual_press(ctx);
        self.process_audio_input(ctx);
        self.process_event_input(ctx);
        self.handle_recording(ctx, rolling);
        if self.ty == TrackType::Audio {
            self.apply_output_gain(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::services;
    use crate::session::transport::PlayState;
    use crate::session::{RecordingLog, RecordingManager};

    fn block(g_start: u64, nframes: u32) -> EngineProcessTimeInfo {
        EngineProcessTimeInfo::new(g_start, 0, nframes)
    }

    fn looping(start: u64, end: u64) -> TransportMarkers {
        TransportMarkers {
            loop_enabled: true,
            loop_start: start,
            loop_end: end,
            ..TransportMarkers::default()
        }
    }

    fn pairs(segments: &[EngineProcessTimeInfo]) -> Vec<(u64, u32)> {
        segments
            .iter()
            .map(|segment| (segment.g_start_frame, segment.nframes))
            .collect()
    }

    #[test]
    fn block_without_markers_is_one_segment() {
        let segments = recording_segments(&block(1_000, 256), &TransportMarkers::default());
        assert_eq!(pairs(&segments), vec![(1_000, 256)]);
    }

    #[test]
    fn loop_end_splits_block_in_two() {
        let markers = looping(0, 200);
        let raw = split_points(&block(0, 512), &markers);
        assert_eq!(raw.as_slice(), &[(0, 200), (200, 0), (0, 312)]);

        let segments = recording_segments(&block(0, 512), &markers);
        assert_eq!(pairs(&segments), vec![(0, 200), (0, 312)]);
        assert!(segments.iter().all(|segment| segment.local_offset == 0));
    }

    #[test]
    fn segments_of_an_offset_cycle_start_at_the_offset_frame() {
        let markers = looping(0, 200);
        let segments = recording_segments(&EngineProcessTimeInfo::new(0, 64, 448), &markers);
        assert_eq!(pairs(&segments), vec![(64, 136), (0, 312)]);
        assert!(segments.iter().all(|segment| segment.local_offset == 0));
    }

    #[test]
    fn loop_end_at_block_end_is_not_a_wrap_inside() {
        let markers = looping(64, 512);
        let raw = split_points(&block(0, 512), &markers);
        assert_eq!(raw.as_slice(), &[(0, 512), (512, 0), (64, 0)]);
        let segments = recording_segments(&block(0, 512), &markers);
        assert_eq!(pairs(&segments), vec![(0, 512)]);
    }

    #[test]
    fn punch_in_and_out_inside_block() {
        let markers = TransportMarkers {
            punch_enabled: true,
            punch_in: 100,
            punch_out: 300,
            ..TransportMarkers::default()
        };
        let raw = split_points(&block(0, 512), &markers);
        assert_eq!(raw.as_slice(), &[(0, 100), (100, 200), (300, 212), (512, 0)]);
    }

    #[test]
    fn loop_and_both_punches_use_six_ranges() {
        let markers = TransportMarkers {
            punch_enabled: true,
            punch_in: 50,
            punch_out: 150,
            ..looping(0, 200)
        };
        let raw = split_points(&block(0, 512), &markers);
        assert_eq!(
            raw.as_slice(),
            &[(0, 50), (50, 100), (150, 50), (200, 0), (200, 0), (0, 312)]
        );
        let total: u32 = recording_segments(&block(0, 512), &markers)
            .iter()
            .map(|segment| segment.nframes)
            .sum();
        assert_eq!(total, 512);
    }

    #[test]
    fn reversed_punch_markers_only_split_at_punch_in() {
        let markers = TransportMarkers {
            punch_enabled: true,
            punch_in: 300,
            punch_out: 100,
            ..TransportMarkers::default()
        };
        let raw = split_points(&block(0, 512), &markers);
        assert_eq!(raw.as_slice(), &[(0, 300), (300, 212)]);
        let total: u32 = recording_segments(&block(0, 512), &markers)
            .iter()
            .map(|segment| segment.nframes)
            .sum();
        assert_eq!(total, 512);
    }

    #[test]
    fn punch_in_at_block_start_keeps_whole_block() {
        let markers = TransportMarkers {
            punch_enabled: true,
            punch_in: 0,
            punch_out: 10_000,
            ..TransportMarkers::default()
        };
        let segments = recording_segments(&block(0, 128), &markers);
        assert_eq!(pairs(&segments), vec![(0, 128)]);
    }

    #[test]
    fn controller_changes_become_midi_events() {
        let mut table = PortTable::new(64);
        let processor = TrackProcessor::new(TrackId(7), "keys", TrackType::Midi, &mut table);
        processor.set_cc(0, 7, 1.0);
        processor.set_pitch_bend(1, -8192.0);
        processor.set_channel_pressure(2, 0.5);
        processor.set_poly_key_pressure(3, 1.0);

        let services = services();
        let ctx = ProcessContext {
            time: block(0, 64),
            noroll: false,
            services: &services,
        };
        processor.process(&ctx);

        let out = processor.midi_out().expect("midi out").events().clone();
        assert_eq!(out.len(), 3);
        assert!(out.contains(&MidiEvent::control_change(0, 7, 127, 0)));
        assert!(out.contains(&MidiEvent::pitch_bend(1, 0, 0)));
        assert!(out.contains(&MidiEvent::channel_pressure(2, 64, 0)));
    }

    #[test]
    fn midi_input_is_rechanneled_unless_passthrough() {
        let mut table = PortTable::new(16);
        let processor = TrackProcessor::new(TrackId(1), "synth", TrackType::Instrument, &mut table);
        processor.set_midi_channel(4);
        let input = processor.midi_in().expect("midi in");
        input.events().push(MidiEvent::note_on(0, 60, 100, 3));

        let services = services();
        let ctx = ProcessContext {
            time: block(0, 16),
            noroll: false,
            services: &services,
        };
        processor.process(&ctx);
        assert_eq!(processor.midi_out().expect("midi out").events()[0].channel(), 4);

        processor.set_passthrough(true);
        processor.process(&ctx);
        assert_eq!(processor.midi_out().expect("midi out").events()[0].channel(), 0);
    }

    #[test]
    fn audio_track_monitors_with_mono_and_gain() {
        let mut table = PortTable::new(4);
        let processor = TrackProcessor::new(TrackId(2), "vox", TrackType::Audio, &mut table);
        let input = processor.stereo_in().expect("stereo in");
        input.l.audio().fill(0.5);
        input.r.audio().fill(0.1);

        let services = services();
        let ctx = ProcessContext {
            time: block(0, 4),
            noroll: false,
            services: &services,
        };
        processor.process(&ctx);
        assert_eq!(*processor.stereo_out().expect("out").l.audio(), vec![0.0; 4]);

        processor.monitor_audio().expect("monitor").set_toggled(true);
        processor.mono().expect("mono").set_toggled(true);
        processor.input_gain().expect("gain").set_control(2.0);
        processor.output_gain().expect("gain").set_control(0.5);
        processor.process(&ctx);
        assert_eq!(*processor.stereo_out().expect("out").r.audio(), vec![0.5; 4]);
    }

    #[test]
    fn armed_track_records_loop_split_segments() {
        let log = Arc::new(RecordingLog::new());
        let mut services = services();
        services.recording = Arc::clone(&log) as Arc<dyn RecordingManager>;
        services.transport.set_loop(0, 200);
        services.transport.set_loop_enabled(true);
        services.transport.set_recording(true);
        services.transport.set_play_state(PlayState::Rolling);

        let mut table = PortTable::new(512);
        let processor = TrackProcessor::new(TrackId(3), "take", TrackType::Audio, &mut table);
        processor.set_armed(true);
        let ctx = ProcessContext {
            time: block(0, 512),
            noroll: false,
            services: &services,
        };
        processor.process(&ctx);

        let recorded = pairs(&log.segments(TrackId(3)));
        assert_eq!(recorded, vec![(0, 200), (0, 312)]);
    }

    #[test]
    fn frozen_track_leaves_outputs_untouched() {
        let mut table = PortTable::new(4);
        let processor = TrackProcessor::new(TrackId(4), "bus", TrackType::AudioBus, &mut table);
        processor.stereo_out().expect("out").l.audio().fill(0.25);
        processor.set_frozen(true);
        let services = services();
        let ctx = ProcessContext {
            time: block(0, 4),
            noroll: false,
            services: &services,
        };
        processor.process(&ctx);
        assert_eq!(*processor.stereo_out().expect("out").l.audio(), vec![0.25; 4]);
    }
}
