use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::channel::Channel;
use super::plugin::Plugin;
use super::port::PortType;
use super::processors::ModulatorMacroProcessor;
use super::tempo::TempoPorts;
use super::TrackId;
use crate::graph::{ProcessContext, Processable};
use crate::track_processor::TrackProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Audio,
    Midi,
    Instrument,
    AudioBus,
    MidiBus,
    AudioGroup,
    MidiGroup,
    Master,
    Chord,
    Tempo,
    Modulator,
}

impl TrackType {
    /// Signal the track processor receives, if it has one.
    pub fn in_signal(self) -> Option<PortType> {
        match self {
            TrackType::Audio | TrackType::AudioBus | TrackType::AudioGroup | TrackType::Master => {
                Some(PortType::Audio)
            }
            TrackType::Midi
            | TrackType::Instrument
            | TrackType::MidiBus
            | TrackType::MidiGroup
            | TrackType::Chord => Some(PortType::Event),
            TrackType::Tempo | TrackType::Modulator => None,
        }
    }

    /// Signal leaving the track's channel, if it has one.
    pub fn out_signal(self) -> Option<PortType> {
        match self {
            TrackType::Audio
            | TrackType::Instrument
            | TrackType::AudioBus
            | TrackType::AudioGroup
            | TrackType::Master => Some(PortType::Audio),
            TrackType::Midi | TrackType::MidiBus | TrackType::MidiGroup | TrackType::Chord => {
                Some(PortType::Event)
            }
            TrackType::Tempo | TrackType::Modulator => None,
        }
    }

    pub fn has_channel(self) -> bool {
        self.out_signal().is_some()
    }

    /// Tracks that play back MIDI regions through a piano roll.
    pub fn has_piano_roll(self) -> bool {
        matches!(self, TrackType::Midi | TrackType::Instrument | TrackType::Chord)
    }

    /// Piano-roll tracks that also expose per-channel controller ports.
    pub fn has_midi_controls(self) -> bool {
        matches!(self, TrackType::Midi | TrackType::Instrument)
    }
}

pub struct Track {
    pub(crate) id: TrackId,
    pub(crate) name: String,
    pub(crate) ty: TrackType,
    pub(crate) processor: Option<Arc<TrackProcessor>>,
    pub(crate) channel: Option<Channel>,
    pub(crate) tempo: Option<TempoPorts>,
    pub(crate) modulators: Vec<Arc<Plugin>>,
    pub(crate) macros: Vec<Arc<ModulatorMacroProcessor>>,
}

impl Track {
    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> TrackType {
        self.ty
    }

    pub fn processor(&self) -> Option<&Arc<TrackProcessor>> {
        self.processor.as_ref()
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn tempo_ports(&self) -> Option<&TempoPorts> {
        self.tempo.as_ref()
    }

    pub fn modulators(&self) -> &[Arc<Plugin>] {
        &self.modulators
    }

    pub fn macros(&self) -> &[Arc<ModulatorMacroProcessor>] {
        &self.macros
    }

    pub(crate) fn node(&self) -> TrackNode {
        TrackNode {
            name: self.name.clone(),
            processor: self.processor.clone(),
        }
    }
}

/// Graph payload of a track. Tracks without a processor only order their
/// neighbours.
pub struct TrackNode {
    name: String,
    processor: Option<Arc<TrackProcessor>>,
}

impl Processable for TrackNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        if let Some(processor) = &self.processor {
            processor.process(ctx);
        }
    }
}
