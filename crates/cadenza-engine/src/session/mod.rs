//! In-memory session model: the tracks, ports and connections the graph
//! compiler turns into processing nodes.

pub mod channel;
pub mod connections;
pub mod plugin;
pub mod port;
pub mod processors;
pub mod recording;
pub mod tempo;
pub mod track;
pub mod transport;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use channel::{Channel, ChannelSend, Fader, FaderKind, StageIo};
pub use connections::{PortConnection, PortConnectionsManager};
pub use plugin::{DelayProcessor, GainProcessor, Plugin, PluginIo, PluginLayout, PluginProcessor};
pub use port::{Port, PortFlow, PortId, PortOwner, PortRole, PortSpec, PortTable, PortType, StereoPorts};
pub use processors::{HwProcessor, ModulatorMacroProcessor, SampleProcessor};
pub use recording::{NullRecorder, RecordingLog, RecordingManager};
pub use tempo::{TempoPorts, TempoState};
pub use track::{Track, TrackType};
pub use transport::{PlayState, Transport, TransportAction, TransportMarkers, TransportPorts};

use crate::config::EngineConfig;
use crate::engine::EngineState;
use crate::error::{GraphError, SessionError};
use crate::graph::compiler;
use crate::track_processor::TrackProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacroId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SendId {
    pub track: TrackId,
    pub slot: u32,
}

/// Where a plugin is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginSlot {
    MidiFx,
    Instrument,
    Insert,
    /// Modulator tracks only.
    Modulator,
}

/// Shared state every payload can reach while processing.
#[derive(Clone)]
pub struct RuntimeServices {
    pub engine: Arc<EngineState>,
    pub transport: Arc<Transport>,
    pub tempo: Arc<TempoState>,
    pub recording: Arc<dyn RecordingManager>,
    /// Events played on the clip editor keyboard.
    pub manual_press: Arc<Port>,
}

pub struct Session {
    ports: PortTable,
    connections: PortConnectionsManager,
    tracks: Vec<Track>,
    transport: Arc<Transport>,
    tempo: Arc<TempoState>,
    engine: Arc<EngineState>,
    recording: Arc<dyn RecordingManager>,
    sample_processor: Arc<SampleProcessor>,
    monitor_fader: Arc<Fader>,
    hw_processor: Arc<HwProcessor>,
    manual_press: Arc<Port>,
    tempo_track: TrackId,
    master: TrackId,
    next_track: u32,
    next_plugin: u32,
    next_macro: u32,
}

impl Session {
    pub fn new(config: &EngineConfig) -> Self {
        let mut ports = PortTable::new(config.block_size as usize);
        let transport = Arc::new(Transport::new(
            TransportPorts::create(&mut ports),
            config.sample_rate,
        ));
        let sample_processor = Arc::new(SampleProcessor::new(&mut ports));
        let monitor_fader = Arc::new(Fader::new(
            FaderKind::Monitor,
            "Monitor",
            PortType::Audio,
            PortOwner::MonitorFader,
            &mut ports,
        ));
        let hw_processor = Arc::new(HwProcessor::new(&mut ports, 2, 1));
        let manual_press = ports.create(
            PortSpec::new(
                "MIDI editor manual press",
                PortType::Event,
                PortFlow::Input,
                PortOwner::Engine,
            )
            .manual_press(),
        );

        let mut session = Self {
            ports,
            connections: PortConnectionsManager::new(),
            tracks: Vec::new(),
            transport,
            tempo: Arc::new(TempoState::new(config.sample_rate)),
            engine: Arc::new(EngineState::new(config)),
            recording: Arc::new(NullRecorder),
            sample_processor,
            monitor_fader,
            hw_processor,
            manual_press,
            tempo_track: TrackId(0),
            master: TrackId(1),
            next_track: 0,
            next_plugin: 0,
            next_macro: 0,
        };
        session.tempo_track = session.add_track("Tempo", TrackType::Tempo);
        session.master = session.add_track("Master", TrackType::Master);
        session
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn port(&self, id: PortId) -> Option<&Arc<Port>> {
        self.ports.get(id)
    }

    pub fn connections(&self) -> &PortConnectionsManager {
        &self.connections
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == id)
    }

    pub fn master(&self) -> TrackId {
        self.master
    }

    pub fn tempo_track(&self) -> TrackId {
        self.tempo_track
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn tempo(&self) -> &Arc<TempoState> {
        &self.tempo
    }

    pub fn engine(&self) -> &Arc<EngineState> {
        &self.engine
    }

    pub fn sample_processor(&self) -> &Arc<SampleProcessor> {
        &self.sample_processor
    }

    pub fn monitor_fader(&self) -> &Arc<Fader> {
        &self.monitor_fader
    }

    pub fn hw_processor(&self) -> &Arc<HwProcessor> {
        &self.hw_processor
    }

    pub fn manual_press(&self) -> &Arc<Port> {
        &self.manual_press
    }

    pub fn set_recording_manager(&mut self, recording: Arc<dyn RecordingManager>) {
        self.recording = recording;
    }

    /// Resizes every port buffer. Only call while the graph is paused.
    pub fn set_block_size(&mut self, block_size: u32) {
        self.ports.set_block_size(block_size as usize);
        self.engine.set_block_size(block_size);
    }

    pub fn services(&self) -> RuntimeServices {
        RuntimeServices {
            engine: Arc::clone(&self.engine),
            transport: Arc::clone(&self.transport),
            tempo: Arc::clone(&self.tempo),
            recording: Arc::clone(&self.recording),
            manual_press: Arc::clone(&self.manual_press),
        }
    }

    pub fn add_track(&mut self, name: &str, ty: TrackType) -> TrackId {
        let id = TrackId(self.next_track);
        self.next_track += 1;

        let processor = ty
            .in_signal()
            .map(|_| Arc::new(TrackProcessor::new(id, name, ty, &mut self.ports)));
        let channel = ty.out_signal().map(|signal| {
            let mut channel = Channel::new(id, name, signal, &mut self.ports);
            if ty != TrackType::Master && signal == PortType::Audio {
                channel.output = Some(self.master);
            }
            channel
        });
        let tempo = (ty == TrackType::Tempo).then(|| TempoPorts::create(&mut self.ports, id));

        self.tracks.push(Track {
            id,
            name: name.to_owned(),
            ty,
            processor,
            channel,
            tempo,
            modulators: Vec::new(),
            macros: Vec::new(),
        });
        self.wire_channel(id);
        tracing::debug!(?id, ?ty, name, "track added");
        id
    }

    pub fn remove_track(&mut self, id: TrackId) -> Result<(), SessionError> {
        if id == self.master || id == self.tempo_track {
            return Err(SessionError::Protected(id));
        }
        let index = self
            .tracks
            .iter()
            .position(|track| track.id == id)
            .ok_or(SessionError::UnknownTrack(id))?;
        let track = self.tracks.remove(index);

        let plugins: Vec<PluginId> = track
            .channel
            .iter()
            .flat_map(Channel::plugins)
            .chain(&track.modulators)
            .map(|plugin| plugin.id())
            .collect();
        let macros: Vec<MacroId> = track.macros.iter().map(|m| m.id()).collect();
        self.drop_ports(|owner| match owner {
            PortOwner::Plugin(plugin) => plugins.contains(&plugin),
            PortOwner::ModulatorMacro(id) => macros.contains(&id),
            owner => owner.track() == Some(id),
        });

        let mut rewire = Vec::new();
        for other in &mut self.tracks {
            let Some(channel) = other.channel.as_mut() else {
                continue;
            };
            let mut touched = false;
            if channel.output == Some(id) {
                channel.output = (channel.signal == PortType::Audio).then_some(self.master);
                touched = true;
            }
            let before = channel.sends.len();
            channel.sends.retain(|send| send.target() != id);
            touched |= before != channel.sends.len();
            if touched {
                rewire.push(other.id);
            }
        }
        // ports of dropped sends
        let live: Vec<SendId> = self
            .tracks
            .iter()
            .filter_map(|track| track.channel.as_ref())
            .flat_map(|channel| channel.sends.iter().map(|send| send.id()))
            .collect();
        self.drop_ports(|owner| matches!(owner, PortOwner::ChannelSend(send) if !live.contains(&send)));
        for track in rewire {
            self.wire_channel(track);
        }
        tracing::debug!(?id, "track removed");
        Ok(())
    }

    pub fn add_plugin(
        &mut self,
        track: TrackId,
        slot: PluginSlot,
        name: &str,
        layout: &PluginLayout,
        processor: Box<dyn PluginProcessor>,
    ) -> Result<PluginId, SessionError> {
        let index = self.track_index(track)?;
        if slot == PluginSlot::Modulator && self.tracks[index].ty != TrackType::Modulator {
            return Err(SessionError::SignalMismatch { track, target: track });
        }
        if slot != PluginSlot::Modulator && self.tracks[index].channel.is_none() {
            return Err(SessionError::NoChannel(track));
        }

        let id = PluginId(self.next_plugin);
        self.next_plugin += 1;
        let plugin = Arc::new(Plugin::new(id, name, layout, processor, &mut self.ports));

        let entry = &mut self.tracks[index];
        let mut replaced = None;
        match (slot, entry.channel.as_mut()) {
            (PluginSlot::Modulator, _) => entry.modulators.push(plugin),
            (PluginSlot::MidiFx, Some(channel)) => channel.midi_fx.push(plugin),
            (PluginSlot::Insert, Some(channel)) => channel.inserts.push(plugin),
            (PluginSlot::Instrument, Some(channel)) => {
                replaced = channel.instrument.replace(plugin).map(|old| old.id());
            }
            (_, None) => return Err(SessionError::NoChannel(track)),
        }
        if let Some(old) = replaced {
            self.drop_ports(|owner| owner == PortOwner::Plugin(old));
        }
        self.wire_channel(track);
        Ok(id)
    }

    pub fn add_modulator(
        &mut self,
        track: TrackId,
        name: &str,
        layout: &PluginLayout,
        processor: Box<dyn PluginProcessor>,
    ) -> Result<PluginId, SessionError> {
        self.add_plugin(track, PluginSlot::Modulator, name, layout, processor)
    }

    pub fn add_macro(&mut self, track: TrackId) -> Result<MacroId, SessionError> {
        let index = self.track_index(track)?;
        if self.tracks[index].ty != TrackType::Modulator {
            return Err(SessionError::SignalMismatch { track, target: track });
        }
        let id = MacroId(self.next_macro);
        self.next_macro += 1;
        let processor = Arc::new(ModulatorMacroProcessor::new(id, &mut self.ports));
        self.tracks[index].macros.push(processor);
        Ok(id)
    }

    pub fn add_send(
        &mut self,
        track: TrackId,
        target: TrackId,
        amount: f32,
        pre_fader: bool,
    ) -> Result<SendId, SessionError> {
        let index = self.track_index(track)?;
        let signal = self.tracks[index]
            .channel
            .as_ref()
            .map(|channel| channel.signal)
            .ok_or(SessionError::NoChannel(track))?;
        self.check_target(track, target, signal)?;

        let channel = self.tracks[index]
            .channel
            .as_mut()
            .ok_or(SessionError::NoChannel(track))?;
        let slot = channel.next_send_slot;
        channel.next_send_slot += 1;
        let id = SendId { track, slot };
        let send = ChannelSend::new(id, signal, pre_fader, target, amount, &mut self.ports);
        channel.sends.push(Arc::new(send));
        self.wire_channel(track);

        if let Err(err) = self.ensure_acyclic() {
            if let Some(channel) = self.tracks[index].channel.as_mut() {
                channel.sends.pop();
            }
            self.drop_ports(|owner| owner == PortOwner::ChannelSend(id));
            self.wire_channel(track);
            return Err(err);
        }
        Ok(id)
    }

    /// Points the channel's fader output at `output`, or disconnects it.
    pub fn route_channel(&mut self, track: TrackId, output: Option<TrackId>) -> Result<(), SessionError> {
        let index = self.track_index(track)?;
        let (signal, previous) = self.tracks[index]
            .channel
            .as_ref()
            .map(|channel| (channel.signal, channel.output))
            .ok_or(SessionError::NoChannel(track))?;
        if let Some(target) = output {
            self.check_target(track, target, signal)?;
        }

        self.set_output(index, output);
        if let Err(err) = self.ensure_acyclic() {
            self.set_output(index, previous);
            return Err(err);
        }
        Ok(())
    }

    /// Connects two ports after checking the graph stays acyclic.
    pub fn connect_ports(&mut self, src: PortId, dest: PortId) -> Result<(), SessionError> {
        let src_port = self.ports.get(src).ok_or(SessionError::UnknownPort(src))?;
        let dest_port = self.ports.get(dest).ok_or(SessionError::UnknownPort(dest))?;
        let incompatible = |reason| SessionError::IncompatiblePorts { src, dest, reason };
        if src == dest {
            return Err(incompatible("a port cannot feed itself"));
        }
        if src_port.flow() != PortFlow::Output {
            return Err(incompatible("source is not an output"));
        }
        if dest_port.flow() != PortFlow::Input {
            return Err(incompatible("destination is not an input"));
        }
        let compatible = src_port.ty() == dest_port.ty()
            || (src_port.ty() == PortType::Cv && dest_port.ty() == PortType::Control);
        if !compatible {
            return Err(incompatible("signal types differ"));
        }
        if self.connections.is_connected(src, dest) {
            return Ok(());
        }

        compiler::validate_with_connection(self, src, dest)?;
        self.connections.connect(PortConnection::new(src, dest));
        tracing::debug!(?src, ?dest, "ports connected");
        Ok(())
    }

    pub fn disconnect_ports(&mut self, src: PortId, dest: PortId) -> Result<bool, SessionError> {
        if self.connections.find(src, dest).is_some_and(|conn| conn.locked) {
            return Err(SessionError::LockedConnection { src, dest });
        }
        Ok(self.connections.disconnect(src, dest))
    }

    fn track_index(&self, id: TrackId) -> Result<usize, SessionError> {
        self.tracks
            .iter()
            .position(|track| track.id == id)
            .ok_or(SessionError::UnknownTrack(id))
    }

    fn check_target(&self, track: TrackId, target: TrackId, signal: PortType) -> Result<(), SessionError> {
        let target_track = self.track(target).ok_or(SessionError::UnknownTrack(target))?;
        if target == track || target_track.ty.in_signal() != Some(signal) {
            return Err(SessionError::SignalMismatch { track, target });
        }
        Ok(())
    }

    fn set_output(&mut self, index: usize, output: Option<TrackId>) {
        let id = self.tracks[index].id;
        if let Some(channel) = self.tracks[index].channel.as_mut() {
            channel.output = output;
        }
        self.wire_channel(id);
    }

    fn ensure_acyclic(&self) -> Result<(), SessionError> {
        let generation = compiler::setup(self, false)?;
        if generation.is_valid() {
            Ok(())
        } else {
            Err(GraphError::Cycle.into())
        }
    }

    fn drop_ports(&mut self, owned: impl Fn(PortOwner) -> bool) {
        for id in self.ports.remove_where(owned) {
            self.connections.disconnect_port(id);
        }
    }

    /// Input ports of a track processor that carry `signal`.
    fn processor_inputs(&self, track: TrackId, signal: PortType) -> Vec<PortId> {
        let Some(processor) = self.track(track).and_then(Track::processor) else {
            return Vec::new();
        };
        match signal {
            PortType::Audio => processor
                .stereo_in()
                .map(|ports| ports.ids().to_vec())
                .unwrap_or_default(),
            PortType::Event => processor.midi_in().map(|port| vec![port.id()]).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Rebuilds the locked connections of a track's channel strip: processor,
    /// plugins, prefader, fader, output and sends.
    fn wire_channel(&mut self, id: TrackId) {
        let Some(track) = self.track(id) else {
            return;
        };
        let Some(channel) = track.channel.as_ref() else {
            return;
        };

        let mut owned: Vec<PortId> = Vec::new();
        let mut edges: Vec<(PortId, PortId)> = Vec::new();
        let link = |outs: &[&Arc<Port>], ins: &[&Arc<Port>], edges: &mut Vec<(PortId, PortId)>| {
            for (out, input) in outs.iter().zip(ins) {
                if out.ty() == input.ty() {
                    edges.push((out.id(), input.id()));
                }
            }
        };

        let mut cursor: Vec<&Arc<Port>> = track
            .processor
            .as_ref()
            .map(|processor| processor.outputs())
            .unwrap_or_default();
        if let Some(signal) = track.ty.in_signal() {
            cursor.retain(|port| port.ty() == signal);
        }
        owned.extend(cursor.iter().map(|port| port.id()));

        for plugin in channel.plugins() {
            if let Some(ty) = cursor.first().map(|port| port.ty()) {
                let (ins, _) = plugin.io_of(ty);
                link(&cursor, &ins, &mut edges);
            }
            let (_, audio) = plugin.io_of(PortType::Audio);
            let (_, events) = plugin.io_of(PortType::Event);
            let next = if audio.is_empty() { events } else { audio };
            if !next.is_empty() {
                cursor = next;
            }
            owned.extend(plugin.outputs().iter().map(|port| port.id()));
        }

        let prefader_in = channel.prefader.io().inputs();
        let prefader_out = channel.prefader.io().outputs();
        let fader_in = channel.fader.io().inputs();
        let fader_out = channel.fader.io().outputs();
        link(&cursor, &prefader_in, &mut edges);
        link(&prefader_out, &fader_in, &mut edges);
        owned.extend(prefader_out.iter().chain(&fader_out).map(|port| port.id()));

        let output_ins: Vec<PortId> = channel
            .output
            .map(|target| self.processor_inputs(target, channel.signal))
            .unwrap_or_default();
        edges.extend(fader_out.iter().map(|port| port.id()).zip(output_ins));

        for send in &channel.sends {
            let tap = if send.is_pre_fader() { &prefader_out } else { &fader_out };
            link(tap, &send.io().inputs(), &mut edges);
            let outs = send.io().outputs();
            owned.extend(outs.iter().map(|port| port.id()));
            let targets = self.processor_inputs(send.target(), channel.signal);
            edges.extend(outs.iter().map(|port| port.id()).zip(targets));
        }

        self.connections.disconnect_locked_from(&owned);
        for (src, dest) in edges {
            let mut conn = PortConnection::new(src, dest);
            conn.locked = true;
            self.connections.connect(conn);
        }
    }
}
