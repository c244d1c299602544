use std::sync::Arc;

use parking_lot::Mutex;

use super::port::{Port, PortFlow, PortOwner, PortSpec, PortTable, PortType, StereoPorts};
use super::MacroId;
use crate::graph::{ProcessContext, Processable};
use crate::midi::MidiEvent;

/// Entry point of every cycle. Owns nothing and does nothing; its children
/// are the ports and tracks that must run first.
#[derive(Debug, Default)]
pub struct InitialProcessor;

impl Processable for InitialProcessor {
    fn name(&self) -> &str {
        "Initial processor"
    }

    fn process(&self, _ctx: &ProcessContext<'_>) {}
}

struct Voice {
    samples: Arc<[f32]>,
    pos: usize,
    gain: f32,
}

/// One-shot sample player used for previews and the metronome.
pub struct SampleProcessor {
    out: StereoPorts,
    voices: Mutex<Vec<Voice>>,
}

impl SampleProcessor {
    pub(crate) fn new(table: &mut PortTable) -> Self {
        Self {
            out: StereoPorts::create(
                table,
                "Sample processor out",
                PortFlow::Output,
                PortOwner::SampleProcessor,
            ),
            voices: Mutex::new(Vec::new()),
        }
    }

    pub fn out(&self) -> &StereoPorts {
        &self.out
    }

    /// Queues a mono buffer for playback on both channels.
    pub fn play(&self, samples: Arc<[f32]>, gain: f32) {
        self.voices.lock().push(Voice {
            samples,
            pos: 0,
            gain,
        });
    }

    pub fn active_voices(&self) -> usize {
        self.voices.lock().len()
    }
}

impl Processable for SampleProcessor {
    fn name(&self) -> &str {
        "Sample processor"
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        let range = ctx.time.buffer_range();
        self.out.clear(range.clone());
        if ctx.noroll {
            return;
        }
        let mut voices = self.voices.lock();
        let mut left = self.out.l.audio();
        let mut right = self.out.r.audio();
        let end = range.end.min(left.len()).min(right.len());
        for voice in voices.iter_mut() {
            for i in range.start.min(end)..end {
                let Some(sample) = voice.samples.get(voice.pos) else {
                    break;
                };
                left[i] += sample * voice.gain;
                right[i] += sample * voice.gain;
                voice.pos += 1;
            }
        }
        voices.retain(|voice| voice.pos < voice.samples.len());
    }
}

/// Copies captured device input into the hardware input ports.
pub struct HwProcessor {
    audio: Vec<Arc<Port>>,
    midi: Vec<Arc<Port>>,
    captured_audio: Mutex<Vec<Vec<f32>>>,
    captured_midi: Mutex<Vec<Vec<MidiEvent>>>,
}

impl HwProcessor {
    pub(crate) fn new(table: &mut PortTable, audio_channels: usize, midi_inputs: usize) -> Self {
        let port = |table: &mut PortTable, label: String, ty| {
            table.create(PortSpec::new(label, ty, PortFlow::Output, PortOwner::HwProcessor))
        };
        let audio = (0..audio_channels)
            .map(|i| port(table, format!("HW audio in {}", i + 1), PortType::Audio))
            .collect();
        let midi = (0..midi_inputs)
            .map(|i| port(table, format!("HW MIDI in {}", i + 1), PortType::Event))
            .collect();
        Self {
            audio,
            midi,
            captured_audio: Mutex::new(vec![Vec::new(); audio_channels]),
            captured_midi: Mutex::new(vec![Vec::new(); midi_inputs]),
        }
    }

    pub fn audio_ports(&self) -> &[Arc<Port>] {
        &self.audio
    }

    pub fn midi_ports(&self) -> &[Arc<Port>] {
        &self.midi
    }

    /// Stores device samples to be published on the next cycle.
    pub fn capture_audio(&self, channel: usize, samples: &[f32]) {
        if let Some(slot) = self.captured_audio.lock().get_mut(channel) {
            slot.clear();
            slot.extend_from_slice(samples);
        }
    }

    pub fn capture_midi(&self, input: usize, events: &[MidiEvent]) {
        if let Some(slot) = self.captured_midi.lock().get_mut(input) {
            slot.extend_from_slice(events);
        }
    }
}

impl Processable for HwProcessor {
    fn name(&self) -> &str {
        "HW processor"
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        let range = ctx.time.buffer_range();
        for port in self.audio.iter().chain(&self.midi) {
            port.clear(range.clone());
        }
        if ctx.noroll {
            return;
        }

        let mut captured = self.captured_audio.lock();
        for (port, samples) in self.audio.iter().zip(captured.iter_mut()) {
            let mut buf = port.audio();
            let end = range.end.min(buf.len());
            let start = range.start.min(end);
            let n = (end - start).min(samples.len());
            buf[start..start + n].copy_from_slice(&samples[..n]);
            samples.clear();
        }

        let last = range.end.saturating_sub(1);
        let mut captured = self.captured_midi.lock();
        for (port, events) in self.midi.iter().zip(captured.iter_mut()) {
            port.events().extend(events.drain(..).map(|mut event| {
                event.time = (range.start + event.time as usize).min(last) as u32;
                event
            }));
        }
    }
}

/// Modulator-track macro knob: scales incoming CV, or emits its value as CV
/// when nothing is connected.
pub struct ModulatorMacroProcessor {
    id: MacroId,
    name: String,
    cv_in: Arc<Port>,
    macro_port: Arc<Port>,
    cv_out: Arc<Port>,
}

impl ModulatorMacroProcessor {
    pub(crate) fn new(id: MacroId, table: &mut PortTable) -> Self {
        let owner = PortOwner::ModulatorMacro(id);
        let name = format!("Macro {}", id.0 + 1);
        Self {
            id,
            cv_in: table.create(PortSpec::new(
                format!("{name} CV in"),
                PortType::Cv,
                PortFlow::Input,
                owner,
            )),
            macro_port: table.create(PortSpec::control(name.clone(), owner, 1.0).automatable()),
            cv_out: table.create(PortSpec::new(
                format!("{name} CV out"),
                PortType::Cv,
                PortFlow::Output,
                owner,
            )),
            name,
        }
    }

    pub fn id(&self) -> MacroId {
        self.id
    }

    pub fn cv_in(&self) -> &Arc<Port> {
        &self.cv_in
    }

    pub fn macro_port(&self) -> &Arc<Port> {
        &self.macro_port
    }

    pub fn cv_out(&self) -> &Arc<Port> {
        &self.cv_out
    }
}

/// Graph payload for a macro, aware of whether its CV input is connected.
pub struct MacroNode {
    processor: Arc<ModulatorMacroProcessor>,
    modulated: bool,
}

impl MacroNode {
    pub fn new(processor: Arc<ModulatorMacroProcessor>, modulated: bool) -> Self {
        Self {
            processor,
            modulated,
        }
    }
}

impl Processable for MacroNode {
    fn name(&self) -> &str {
        &self.processor.name
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        let range = ctx.time.buffer_range();
        let macro_value = self.processor.macro_port.control();
        let mut out = self.processor.cv_out.audio();
        let end = range.end.min(out.len());
        let start = range.start.min(end);
        if ctx.noroll {
            out[start..end].fill(0.0);
        } else if self.modulated {
            let input = self.processor.cv_in.audio();
            for i in start..end.min(input.len()) {
                out[i] = input[i] * macro_value;
            }
        } else {
            out[start..end].fill(macro_value);
        }
    }
}
