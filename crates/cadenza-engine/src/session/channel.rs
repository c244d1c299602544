use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::plugin::Plugin;
use super::port::{Port, PortFlow, PortOwner, PortSpec, PortTable, PortType, StereoPorts};
use super::{SendId, TrackId};
use crate::graph::{ProcessContext, Processable};
use crate::midi;
use crate::time::EngineProcessTimeInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaderKind {
    Fader,
    /// Passthrough stage ahead of the fader, tapped by pre-fader sends.
    Prefader,
    Monitor,
}

/// Audio or MIDI endpoints of a processing stage.
#[derive(Debug, Clone)]
pub enum StageIo {
    Audio { input: StereoPorts, output: StereoPorts },
    Midi { input: Arc<Port>, output: Arc<Port> },
}

impl StageIo {
    fn create(table: &mut PortTable, label: &str, signal: PortType, owner: PortOwner) -> Self {
        match signal {
            PortType::Event => StageIo::Midi {
                input: table.create(PortSpec::new(
                    format!("{label} MIDI in"),
                    PortType::Event,
                    PortFlow::Input,
                    owner,
                )),
                output: table.create(PortSpec::new(
                    format!("{label} MIDI out"),
                    PortType::Event,
                    PortFlow::Output,
                    owner,
                )),
            },
            _ => StageIo::Audio {
                input: StereoPorts::create(table, &format!("{label} in"), PortFlow::Input, owner),
                output: StereoPorts::create(table, &format!("{label} out"), PortFlow::Output, owner),
            },
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<Port>> {
        match self {
            StageIo::Audio { input, .. } => input.iter().collect(),
            StageIo::Midi { input, .. } => vec![input],
        }
    }

    pub fn outputs(&self) -> Vec<&Arc<Port>> {
        match self {
            StageIo::Audio { output, .. } => output.iter().collect(),
            StageIo::Midi { output, .. } => vec![output],
        }
    }

    fn clear_outputs(&self, time: &EngineProcessTimeInfo) {
        for port in self.outputs() {
            port.clear(time.buffer_range());
        }
    }

    /// Writes `input * gain` into the outputs, with separate left/right gains.
    fn copy_scaled(&self, time: &EngineProcessTimeInfo, gains: [f32; 2], pass_events: bool) {
        let range = time.buffer_range();
        match self {
            StageIo::Audio { input, output } => {
                for (gain, (src, dst)) in gains.into_iter().zip(input.iter().zip(output.iter())) {
                    let src = src.audio();
                    let mut dst = dst.audio();
                    let end = range.end.min(src.len()).min(dst.len());
                    for i in range.start.min(end)..end {
                        dst[i] = src[i] * gain;
                    }
                }
            }
            StageIo::Midi { input, output } => {
                if pass_events {
                    let src = input.events();
                    midi::append_in_range(&mut output.events(), &src, range);
                }
            }
        }
    }
}

/// Gain stage with amp, balance and mute controls.
pub struct Fader {
    kind: FaderKind,
    name: String,
    io: StageIo,
    amp: Option<Arc<Port>>,
    balance: Option<Arc<Port>>,
    mute: Option<Arc<Port>>,
    latency: AtomicU32,
}

impl Fader {
    pub(crate) fn new(
        kind: FaderKind,
        name: &str,
        signal: PortType,
        owner: PortOwner,
        table: &mut PortTable,
    ) -> Self {
        let io = StageIo::create(table, name, signal, owner);
        let controls = kind != FaderKind::Prefader;
        let control = |table: &mut PortTable, label: &str, default: f32, max: f32| {
            table.create(
                PortSpec::control(format!("{name} {label}"), owner, default)
                    .range(0.0, max)
                    .automatable(),
            )
        };
        let (amp, balance, mute) = if controls {
            (
                Some(control(table, "amp", 1.0, 2.0)),
                Some(control(table, "balance", 0.5, 1.0)),
                Some(table.create(
                    PortSpec::control(format!("{name} mute"), owner, 0.0)
                        .toggle()
                        .automatable(),
                )),
            )
        } else {
            (None, None, None)
        };
        Self {
            kind,
            name: name.to_owned(),
            io,
            amp,
            balance,
            mute,
            latency: AtomicU32::new(0),
        }
    }

    pub fn kind(&self) -> FaderKind {
        self.kind
    }

    pub fn io(&self) -> &StageIo {
        &self.io
    }

    pub fn amp(&self) -> Option<&Arc<Port>> {
        self.amp.as_ref()
    }

    pub fn mute(&self) -> Option<&Arc<Port>> {
        self.mute.as_ref()
    }

    /// Control ports wired into the fader node.
    pub fn controls(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.amp, &self.balance, &self.mute]
            .into_iter()
            .flatten()
    }

    /// Reported processing delay, e.g. from look-ahead metering.
    pub fn set_latency(&self, frames: u32) {
        self.latency.store(frames, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.mute.as_ref().is_some_and(|port| port.is_toggled())
    }

    fn gains(&self) -> [f32; 2] {
        if self.is_muted() {
            return [0.0; 2];
        }
        let amp = self.amp.as_ref().map_or(1.0, |port| port.control());
        let balance = self.balance.as_ref().map_or(0.5, |port| port.control());
        [
            amp * (2.0 * (1.0 - balance)).min(1.0),
            amp * (2.0 * balance).min(1.0),
        ]
    }
}

impl Processable for Fader {
    fn name(&self) -> &str {
        &self.name
    }

    fn playback_latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        self.io.clear_outputs(&ctx.time);
        if ctx.noroll {
            return;
        }
        let muted = self.is_muted();
        self.io.copy_scaled(&ctx.time, self.gains(), !muted);
    }
}

/// Auxiliary output of a channel feeding another track's input.
pub struct ChannelSend {
    id: SendId,
    name: String,
    pre_fader: bool,
    target: TrackId,
    io: StageIo,
    amount: Arc<Port>,
    enabled: Arc<Port>,
}

impl ChannelSend {
    pub(crate) fn new(
        id: SendId,
        signal: PortType,
        pre_fader: bool,
        target: TrackId,
        amount: f32,
        table: &mut PortTable,
    ) -> Self {
        let owner = PortOwner::ChannelSend(id);
        let name = format!("Send {}", id.slot + 1);
        let io = StageIo::create(table, &name, signal, owner);
        let amount = table.create(
            PortSpec::control(format!("{name} amount"), owner, amount)
                .range(0.0, 2.0)
                .automatable(),
        );
        let enabled = table.create(
            PortSpec::control(format!("{name} enabled"), owner, 1.0).toggle(),
        );
        Self {
            id,
            name,
            pre_fader,
            target,
            io,
            amount,
            enabled,
        }
    }

    pub fn id(&self) -> SendId {
        self.id
    }

    pub fn is_pre_fader(&self) -> bool {
        self.pre_fader
    }

    pub fn target(&self) -> TrackId {
        self.target
    }

    pub fn io(&self) -> &StageIo {
        &self.io
    }

    pub fn amount(&self) -> &Arc<Port> {
        &self.amount
    }

    pub fn enabled(&self) -> &Arc<Port> {
        &self.enabled
    }

    pub fn controls(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.amount, &self.enabled].into_iter()
    }
}

impl Processable for ChannelSend {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        self.io.clear_outputs(&ctx.time);
        if ctx.noroll || !self.enabled.is_toggled() {
            return;
        }
        let amount = self.amount.control();
        self.io.copy_scaled(&ctx.time, [amount; 2], true);
    }
}

/// Mixer strip of a track: plugin slots, prefader, fader and sends.
pub struct Channel {
    pub(crate) track: TrackId,
    pub(crate) signal: PortType,
    pub(crate) prefader: Arc<Fader>,
    pub(crate) fader: Arc<Fader>,
    pub(crate) midi_fx: Vec<Arc<Plugin>>,
    pub(crate) instrument: Option<Arc<Plugin>>,
    pub(crate) inserts: Vec<Arc<Plugin>>,
    pub(crate) sends: Vec<Arc<ChannelSend>>,
    /// Slots are never reused, even after a send is removed.
    pub(crate) next_send_slot: u32,
    pub(crate) output: Option<TrackId>,
}

impl Channel {
    pub(crate) fn new(track: TrackId, name: &str, signal: PortType, table: &mut PortTable) -> Self {
        Self {
            track,
            signal,
            prefader: Arc::new(Fader::new(
                FaderKind::Prefader,
                &format!("{name} prefader"),
                signal,
                PortOwner::Prefader(track),
                table,
            )),
            fader: Arc::new(Fader::new(
                FaderKind::Fader,
                &format!("{name} fader"),
                signal,
                PortOwner::Fader(track),
                table,
            )),
            midi_fx: Vec::new(),
            instrument: None,
            inserts: Vec::new(),
            sends: Vec::new(),
            next_send_slot: 0,
            output: None,
        }
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn fader(&self) -> &Arc<Fader> {
        &self.fader
    }

    pub fn prefader(&self) -> &Arc<Fader> {
        &self.prefader
    }

    pub fn sends(&self) -> &[Arc<ChannelSend>] {
        &self.sends
    }

    pub fn output(&self) -> Option<TrackId> {
        self.output
    }

    /// Plugins in signal order: MIDI effects, instrument, inserts.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.midi_fx
            .iter()
            .chain(self.instrument.iter())
            .chain(self.inserts.iter())
    }
}
