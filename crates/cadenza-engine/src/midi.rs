use std::ops::Range;

use serde::{Deserialize, Serialize};

pub const MIDI_CHANNELS: u8 = 16;
pub const MIDI_CONTROLLERS: u8 = 128;
const ALL_NOTES_OFF: u8 = 123;
pub const PITCH_BEND_CENTER: i32 = 0x2000;

/// Short channel-voice message stamped with a block-relative frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub time: u32,
    pub raw: [u8; 3],
}

impl MidiEvent {
    pub fn new(time: u32, raw: [u8; 3]) -> Self {
        Self { time, raw }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8, time: u32) -> Self {
        Self::new(time, [0x90 | (channel & 0x0f), note & 0x7f, velocity & 0x7f])
    }

    pub fn note_off(channel: u8, note: u8, time: u32) -> Self {
        Self::new(time, [0x80 | (channel & 0x0f), note & 0x7f, 0])
    }

    pub fn control_change(channel: u8, controller: u8, value: u8, time: u32) -> Self {
        Self::new(
            time,
            [0xb0 | (channel & 0x0f), controller & 0x7f, value & 0x7f],
        )
    }

    /// `value` is the 14-bit bend amount, `0x2000` being centered.
    pub fn pitch_bend(channel: u8, value: u16, time: u32) -> Self {
        let value = value.min(0x3fff);
        Self::new(
            time,
            [
                0xe0 | (channel & 0x0f),
                (value & 0x7f) as u8,
                ((value >> 7) & 0x7f) as u8,
            ],
        )
    }

    pub fn channel_pressure(channel: u8, value: u8, time: u32) -> Self {
        Self::new(time, [0xd0 | (channel & 0x0f), value & 0x7f, 0])
    }

    pub fn all_notes_off(channel: u8, time: u32) -> Self {
        Self::control_change(channel, ALL_NOTES_OFF, 0, time)
    }

    #[inline]
    pub fn status(&self) -> u8 {
        self.raw[0] & 0xf0
    }

    #[inline]
    pub fn channel(&self) -> u8 {
        self.raw[0] & 0x0f
    }

    #[inline]
    pub fn is_channel_voice(&self) -> bool {
        (0x80..0xf0).contains(&self.raw[0])
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        if self.is_channel_voice() {
            self.raw[0] = self.status() | (channel & 0x0f);
        }
        self
    }
}

/// Appends an all-notes-off message for every channel.
pub fn push_panic(events: &mut Vec<MidiEvent>, time: u32) {
    events.extend((0..MIDI_CHANNELS).map(|channel| MidiEvent::all_notes_off(channel, time)));
}

/// Copies the events of `src` whose timestamp falls inside `range`.
pub fn append_in_range(dst: &mut Vec<MidiEvent>, src: &[MidiEvent], range: Range<usize>) {
    dst.extend(
        src.iter()
            .filter(|event| range.contains(&(event.time as usize)))
            .copied(),
    );
}

/// Like [`append_in_range`] but only keeps channels enabled in `channels`.
pub fn append_filtered(
    dst: &mut Vec<MidiEvent>,
    src: &[MidiEvent],
    range: Range<usize>,
    channels: &[bool; MIDI_CHANNELS as usize],
) {
    dst.extend(
        src.iter()
            .filter(|event| range.contains(&(event.time as usize)))
            .filter(|event| !event.is_channel_voice() || channels[event.channel() as usize])
            .copied(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_bend_is_split_into_seven_bit_halves() {
        let event = MidiEvent::pitch_bend(2, 0x2000, 7);
        assert_eq!(event.raw, [0xe2, 0x00, 0x40]);
        assert_eq!(event.time, 7);
    }

    #[test]
    fn rechanneling_leaves_system_messages_alone() {
        let note = MidiEvent::note_on(0, 60, 100, 0).with_channel(9);
        assert_eq!(note.channel(), 9);
        let clock = MidiEvent::new(0, [0xf8, 0, 0]).with_channel(3);
        assert_eq!(clock.raw[0], 0xf8);
    }

    #[test]
    fn panic_covers_every_channel() {
        let mut events = Vec::new();
        push_panic(&mut events, 0);
        assert_eq!(events.len(), 16);
        assert!(events.iter().all(|event| event.raw[1] == 123));
    }

    #[test]
    fn filtered_append_drops_disabled_channels() {
        let src = [
            MidiEvent::note_on(0, 60, 90, 1),
            MidiEvent::note_on(1, 62, 90, 2),
            MidiEvent::note_on(0, 64, 90, 99),
        ];
        let mut channels = [false; 16];
        channels[0] = true;
        let mut dst = Vec::new();
        append_filtered(&mut dst, &src, 0..64, &channels);
        assert_eq!(dst, vec![src[0]]);
    }
}
