use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF32;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::transport::TransportAction;
use super::{MacroId, PluginId, SendId, TrackId};
use crate::graph::{ProcessContext, Processable};
use crate::midi::MidiEvent;
use crate::time::BeatUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Audio,
    Event,
    Control,
    Cv,
}

impl PortType {
    /// Whether the port carries a per-sample buffer.
    pub fn has_audio_buffer(self) -> bool {
        matches!(self, PortType::Audio | PortType::Cv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortFlow {
    Input,
    Output,
}

/// Structural owner of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortOwner {
    TrackProcessor(TrackId),
    Track(TrackId),
    Fader(TrackId),
    Prefader(TrackId),
    ChannelSend(SendId),
    Plugin(PluginId),
    ModulatorMacro(MacroId),
    MonitorFader,
    SampleProcessor,
    HwProcessor,
    Transport,
    Engine,
    /// Free-standing port, e.g. a backend endpoint.
    External,
}

impl PortOwner {
    /// Ports of structural owners always get a node, connected or not.
    pub fn is_structural(self) -> bool {
        !matches!(self, PortOwner::External)
    }

    pub fn track(self) -> Option<TrackId> {
        match self {
            PortOwner::TrackProcessor(track)
            | PortOwner::Track(track)
            | PortOwner::Fader(track)
            | PortOwner::Prefader(track) => Some(track),
            PortOwner::ChannelSend(send) => Some(send.track),
            _ => None,
        }
    }
}

/// Special meaning attached to a control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortRole {
    Plain,
    Bpm,
    BeatsPerBar,
    BeatUnit,
    MidiCc { channel: u8, controller: u8 },
    PitchBend { channel: u8 },
    PolyKeyPressure { channel: u8 },
    ChannelPressure { channel: u8 },
    Transport(TransportAction),
}

impl PortRole {
    pub fn is_tempo(self) -> bool {
        matches!(
            self,
            PortRole::Bpm | PortRole::BeatsPerBar | PortRole::BeatUnit
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFlags {
    pub automatable: bool,
    pub toggle: bool,
    /// Receives events from the clip editor keyboard.
    pub manual_press: bool,
}

/// Creation parameters for [`PortTable::create`].
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub label: String,
    pub ty: PortType,
    pub flow: PortFlow,
    pub owner: PortOwner,
    pub role: PortRole,
    pub flags: PortFlags,
    pub range: (f32, f32),
    pub default: f32,
}

impl PortSpec {
    pub fn new(label: impl Into<String>, ty: PortType, flow: PortFlow, owner: PortOwner) -> Self {
        Self {
            label: label.into(),
            ty,
            flow,
            owner,
            role: PortRole::Plain,
            flags: PortFlags::default(),
            range: (0.0, 1.0),
            default: 0.0,
        }
    }

    pub fn control(label: impl Into<String>, owner: PortOwner, default: f32) -> Self {
        let mut spec = Self::new(label, PortType::Control, PortFlow::Input, owner);
        spec.default = default;
        spec
    }

    pub fn range(mut self, min: f32, max: f32) -> Self {
        self.range = (min, max);
        self
    }

    pub fn role(mut self, role: PortRole) -> Self {
        self.role = role;
        self
    }

    pub fn automatable(mut self) -> Self {
        self.flags.automatable = true;
        self
    }

    pub fn toggle(mut self) -> Self {
        self.flags.toggle = true;
        self
    }

    pub fn manual_press(mut self) -> Self {
        self.flags.manual_press = true;
        self
    }
}

/// A typed signal endpoint. Buffers are written by the owning processor (outputs)
/// or by the port's own node (inputs, summed from connected sources).
#[derive(Debug)]
pub struct Port {
    id: PortId,
    label: String,
    ty: PortType,
    flow: PortFlow,
    owner: PortOwner,
    role: PortRole,
    flags: PortFlags,
    range: (f32, f32),
    control: AtomicF32,
    automated: AtomicBool,
    audio: Mutex<Vec<f32>>,
    events: Mutex<Vec<MidiEvent>>,
    pending: Mutex<Vec<MidiEvent>>,
}

impl Port {
    fn from_spec(id: PortId, spec: PortSpec, block_size: usize) -> Self {
        let audio = if spec.ty.has_audio_buffer() {
            vec![0.0; block_size]
        } else {
            Vec::new()
        };
        let (min, max) = spec.range;
        Self {
            id,
            label: spec.label,
            ty: spec.ty,
            flow: spec.flow,
            owner: spec.owner,
            role: spec.role,
            flags: spec.flags,
            range: spec.range,
            control: AtomicF32::new(spec.default.clamp(min, max)),
            automated: AtomicBool::new(false),
            audio: Mutex::new(audio),
            events: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ty(&self) -> PortType {
        self.ty
    }

    pub fn flow(&self) -> PortFlow {
        self.flow
    }

    pub fn owner(&self) -> PortOwner {
        self.owner
    }

    pub fn role(&self) -> PortRole {
        self.role
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn is_control(&self) -> bool {
        self.ty == PortType::Control
    }

    pub fn control(&self) -> f32 {
        self.control.load(Ordering::Relaxed)
    }

    /// Stores a new control value, clamped to the port range.
    pub fn set_control(&self, value: f32) {
        let (min, max) = self.range;
        self.control.store(value.clamp(min, max), Ordering::Relaxed);
    }

    pub fn is_toggled(&self) -> bool {
        self.control() > 0.5
    }

    pub fn set_toggled(&self, on: bool) {
        self.set_control(if on { 1.0 } else { 0.0 });
    }

    /// Whether automation regions drive this port.
    pub fn is_automated(&self) -> bool {
        self.automated.load(Ordering::Relaxed)
    }

    pub fn set_automated(&self, automated: bool) {
        self.automated.store(automated, Ordering::Relaxed);
    }

    pub fn audio(&self) -> MutexGuard<'_, Vec<f32>> {
        self.audio.lock()
    }

    pub fn events(&self) -> MutexGuard<'_, Vec<MidiEvent>> {
        self.events.lock()
    }

    /// Queues an event to be delivered on the port's next processing pass.
    pub(crate) fn queue_event(&self, event: MidiEvent) {
        self.pending.lock().push(event);
    }

    pub(crate) fn resize(&self, block_size: usize) {
        if self.ty.has_audio_buffer() {
            self.audio.lock().resize(block_size, 0.0);
        }
    }

    /// Silences the buffer over `range`.
    pub fn clear(&self, range: Range<usize>) {
        match self.ty {
            PortType::Audio | PortType::Cv => {
                let mut buf = self.audio.lock();
                let end = range.end.min(buf.len());
                let start = range.start.min(end);
                buf[start..end].fill(0.0);
            }
            PortType::Event => {
                self.events
                    .lock()
                    .retain(|event| !range.contains(&(event.time as usize)));
            }
            PortType::Control => {}
        }
    }

    fn dequeue_pending(&self, range: &Range<usize>) {
        let mut pending = self.pending.lock();
        if pending.is_empty() || range.is_empty() {
            return;
        }
        let last = range.end - 1;
        let mut events = self.events.lock();
        events.extend(pending.drain(..).map(|mut event| {
            event.time = (range.start + event.time as usize).min(last) as u32;
            event
        }));
    }

    /// Mixes the connected sources into this port over `range`.
    pub fn sum_sources(&self, sources: &[PortSource], range: Range<usize>) {
        match self.ty {
            PortType::Audio | PortType::Cv => {
                let mut dst = self.audio.lock();
                for source in sources {
                    let src = source.port.audio.lock();
                    let end = range.end.min(dst.len()).min(src.len());
                    for i in range.start.min(end)..end {
                        dst[i] += src[i] * source.multiplier;
                    }
                }
            }
            PortType::Event => {
                let mut dst = self.events.lock();
                for source in sources {
                    let src = source.port.events.lock();
                    crate::midi::append_in_range(&mut dst, &src, range.clone());
                }
                dst.sort_by_key(|event| event.time);
            }
            PortType::Control => {
                if !sources.is_empty() {
                    let sum: f32 = sources
                        .iter()
                        .map(|source| source.port.control() * source.multiplier)
                        .sum();
                    self.set_control(sum);
                }
            }
        }
    }
}

/// Resolved upstream connection, captured when the graph is compiled.
#[derive(Debug, Clone)]
pub struct PortSource {
    pub port: Arc<Port>,
    pub multiplier: f32,
}

/// Graph payload for a port node.
pub struct PortProcessor {
    port: Arc<Port>,
    sources: Vec<PortSource>,
}

impl PortProcessor {
    pub fn new(port: Arc<Port>, sources: Vec<PortSource>) -> Self {
        Self { port, sources }
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }
}

impl Processable for PortProcessor {
    fn name(&self) -> &str {
        self.port.label()
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        let range = ctx.time.buffer_range();
        if ctx.noroll {
            self.port.clear(range);
            return;
        }

        let tempo = &ctx.services.tempo;
        match self.port.role() {
            PortRole::Bpm => tempo.set_bpm(self.port.control()),
            PortRole::BeatsPerBar => tempo.set_beats_per_bar(self.port.control().round() as u32),
            PortRole::BeatUnit => {
                tempo.set_beat_unit(BeatUnit::from_value(self.port.control().round() as u32))
            }
            PortRole::Transport(action) => {
                let triggered = self
                    .port
                    .events()
                    .iter()
                    .any(|event| range.contains(&(event.time as usize)));
                if triggered {
                    ctx.services.transport.apply(action);
                }
            }
            _ => {}
        }

        if self.port.flow() == PortFlow::Input || !self.sources.is_empty() {
            self.port.clear(range.clone());
            if self.port.ty() == PortType::Event {
                self.port.dequeue_pending(&range);
            }
            self.port.sum_sources(&self.sources, range);
        }
    }
}

/// Owning table of every port in the session.
#[derive(Debug)]
pub struct PortTable {
    ports: BTreeMap<PortId, Arc<Port>>,
    next: u32,
    block_size: usize,
}

impl PortTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            ports: BTreeMap::new(),
            next: 0,
            block_size,
        }
    }

    pub fn create(&mut self, spec: PortSpec) -> Arc<Port> {
        let id = PortId(self.next);
        self.next += 1;
        let port = Arc::new(Port::from_spec(id, spec, self.block_size));
        self.ports.insert(id, Arc::clone(&port));
        port
    }

    pub fn get(&self, id: PortId) -> Option<&Arc<Port>> {
        self.ports.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.ports.values()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
        for port in self.ports.values() {
            port.resize(block_size);
        }
    }

    /// Removes every port matching `owned`, returning the removed ids.
    pub fn remove_where(&mut self, owned: impl Fn(PortOwner) -> bool) -> Vec<PortId> {
        let doomed: Vec<PortId> = self
            .ports
            .values()
            .filter(|port| owned(port.owner()))
            .map(|port| port.id())
            .collect();
        for id in &doomed {
            self.ports.remove(id);
        }
        doomed
    }
}

/// Left/right pair of audio ports.
#[derive(Debug, Clone)]
pub struct StereoPorts {
    pub l: Arc<Port>,
    pub r: Arc<Port>,
}

impl StereoPorts {
    pub fn create(table: &mut PortTable, label: &str, flow: PortFlow, owner: PortOwner) -> Self {
        Self {
            l: table.create(PortSpec::new(format!("{label} L"), PortType::Audio, flow, owner)),
            r: table.create(PortSpec::new(format!("{label} R"), PortType::Audio, flow, owner)),
        }
    }

    pub fn ids(&self) -> [PortId; 2] {
        [self.l.id(), self.r.id()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.l, &self.r].into_iter()
    }

    pub fn clear(&self, range: Range<usize>) {
        self.l.clear(range.clone());
        self.r.clear(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(table: &mut PortTable, flow: PortFlow) -> Arc<Port> {
        table.create(PortSpec::new("a", PortType::Audio, flow, PortOwner::External))
    }

    #[test]
    fn control_values_are_clamped() {
        let mut table = PortTable::new(8);
        let port = table.create(
            PortSpec::control("gain", PortOwner::Engine, 1.0).range(0.0, 2.0),
        );
        port.set_control(5.0);
        assert_eq!(port.control(), 2.0);
        port.set_toggled(false);
        assert!(!port.is_toggled());
    }

    #[test]
    fn sources_are_summed_with_multiplier() {
        let mut table = PortTable::new(4);
        let a = audio(&mut table, PortFlow::Output);
        let b = audio(&mut table, PortFlow::Output);
        let dst = audio(&mut table, PortFlow::Input);
        a.audio().fill(1.0);
        b.audio().fill(0.5);
        let sources = vec![
            PortSource { port: a, multiplier: 1.0 },
            PortSource { port: b, multiplier: 2.0 },
        ];
        dst.sum_sources(&sources, 1..3);
        assert_eq!(*dst.audio(), vec![0.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn clearing_events_keeps_those_outside_range() {
        let mut table = PortTable::new(16);
        let port = table.create(PortSpec::new(
            "midi",
            PortType::Event,
            PortFlow::Input,
            PortOwner::External,
        ));
        port.events().push(MidiEvent::note_on(0, 60, 100, 2));
        port.events().push(MidiEvent::note_on(0, 61, 100, 12));
        port.clear(0..8);
        assert_eq!(port.events().len(), 1);
        assert_eq!(port.events()[0].time, 12);
    }

    #[test]
    fn removing_by_owner_reports_ids() {
        let mut table = PortTable::new(4);
        let kept = audio(&mut table, PortFlow::Input);
        let gone = table.create(PortSpec::new(
            "t",
            PortType::Audio,
            PortFlow::Input,
            PortOwner::Track(TrackId(3)),
        ));
        let removed = table.remove_where(|owner| owner.track() == Some(TrackId(3)));
        assert_eq!(removed, vec![gone.id()]);
        assert!(table.get(kept.id()).is_some());
        assert_eq!(table.len(), 1);
    }
}
