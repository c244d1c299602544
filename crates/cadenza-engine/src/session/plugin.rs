use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::port::{Port, PortFlow, PortOwner, PortSpec, PortTable, PortType};
use super::PluginId;
use crate::graph::{ProcessContext, Processable};
use crate::time::EngineProcessTimeInfo;

/// Port buffers handed to a plugin for one cycle.
pub struct PluginIo<'a> {
    pub inputs: &'a [Arc<Port>],
    pub outputs: &'a [Arc<Port>],
}

impl PluginIo<'_> {
    pub fn audio_inputs(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.inputs.iter().filter(|port| port.ty() == PortType::Audio)
    }

    pub fn audio_outputs(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.outputs.iter().filter(|port| port.ty() == PortType::Audio)
    }

    pub fn control(&self, label: &str) -> Option<f32> {
        self.inputs
            .iter()
            .find(|port| port.is_control() && port.label() == label)
            .map(|port| port.control())
    }
}

/// DSP implementation behind a hosted plugin instance.
pub trait PluginProcessor: Send {
    /// Processing delay introduced by the plugin, in frames.
    fn latency(&self) -> u32 {
        0
    }

    fn process(&mut self, time: &EngineProcessTimeInfo, io: PluginIo<'_>);
}

#[derive(Debug, Clone, Default)]
pub struct PluginLayout {
    pub audio_in: usize,
    pub audio_out: usize,
    pub midi_in: bool,
    pub midi_out: bool,
    pub cv_in: usize,
    pub cv_out: usize,
    /// `(label, default, min, max)` of each automatable parameter.
    pub controls: Vec<(String, f32, f32, f32)>,
}

impl PluginLayout {
    pub fn stereo_effect() -> Self {
        Self {
            audio_in: 2,
            audio_out: 2,
            ..Self::default()
        }
    }

    pub fn instrument() -> Self {
        Self {
            midi_in: true,
            audio_out: 2,
            ..Self::default()
        }
    }

    pub fn with_control(mut self, label: &str, default: f32, min: f32, max: f32) -> Self {
        self.controls.push((label.to_owned(), default, min, max));
        self
    }
}

pub struct Plugin {
    id: PluginId,
    name: String,
    inputs: Vec<Arc<Port>>,
    outputs: Vec<Arc<Port>>,
    enabled: AtomicBool,
    processor: Mutex<Box<dyn PluginProcessor>>,
}

impl Plugin {
    pub(crate) fn new(
        id: PluginId,
        name: &str,
        layout: &PluginLayout,
        processor: Box<dyn PluginProcessor>,
        table: &mut PortTable,
    ) -> Self {
        let owner = PortOwner::Plugin(id);
        let port = |table: &mut PortTable, label: String, ty, flow| {
            table.create(PortSpec::new(label, ty, flow, owner))
        };

        let mut inputs = Vec::new();
        for i in 0..layout.audio_in {
            inputs.push(port(table, format!("{name} audio in {}", i + 1), PortType::Audio, PortFlow::Input));
        }
        if layout.midi_in {
            inputs.push(port(table, format!("{name} midi in"), PortType::Event, PortFlow::Input));
        }
        for i in 0..layout.cv_in {
            inputs.push(port(table, format!("{name} cv in {}", i + 1), PortType::Cv, PortFlow::Input));
        }
        for (label, default, min, max) in &layout.controls {
            inputs.push(table.create(
                PortSpec::control(label.clone(), owner, *default)
                    .range(*min, *max)
                    .automatable(),
            ));
        }

        let mut outputs = Vec::new();
        for i in 0..layout.audio_out {
            outputs.push(port(table, format!("{name} audio out {}", i + 1), PortType::Audio, PortFlow::Output));
        }
        if layout.midi_out {
            outputs.push(port(table, format!("{name} midi out"), PortType::Event, PortFlow::Output));
        }
        for i in 0..layout.cv_out {
            outputs.push(port(table, format!("{name} cv out {}", i + 1), PortType::Cv, PortFlow::Output));
        }

        Self {
            id,
            name: name.to_owned(),
            inputs,
            outputs,
            enabled: AtomicBool::new(true),
            processor: Mutex::new(processor),
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn inputs(&self) -> &[Arc<Port>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<Port>] {
        &self.outputs
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// First input and output ports of the given type, used for chaining.
    pub(crate) fn io_of(&self, ty: PortType) -> (Vec<&Arc<Port>>, Vec<&Arc<Port>>) {
        (
            self.inputs.iter().filter(|port| port.ty() == ty).collect(),
            self.outputs.iter().filter(|port| port.ty() == ty).collect(),
        )
    }

    fn clear_outputs(&self, time: &EngineProcessTimeInfo) {
        for port in &self.outputs {
            port.clear(time.buffer_range());
        }
    }

    fn bypass(&self, time: &EngineProcessTimeInfo) {
        let range = time.buffer_range();
        for ty in [PortType::Audio, PortType::Event] {
            let (ins, outs) = self.io_of(ty);
            for (input, output) in ins.into_iter().zip(outs) {
                match ty {
                    PortType::Audio => {
                        let src = input.audio();
                        let mut dst = output.audio();
                        let end = range.end.min(src.len()).min(dst.len());
                        let start = range.start.min(end);
                        dst[start..end].copy_from_slice(&src[start..end]);
                    }
                    _ => {
                        let src = input.events();
                        crate::midi::append_in_range(&mut output.events(), &src, range.clone());
                    }
                }
            }
        }
    }
}

impl Processable for Plugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn playback_latency(&self) -> u32 {
        self.processor.lock().latency()
    }

    fn process(&self, ctx: &ProcessContext<'_>) {
        self.clear_outputs(&ctx.time);
        if ctx.noroll {
            return;
        }
        if !self.is_enabled() {
            self.bypass(&ctx.time);
            return;
        }
        self.processor.lock().process(
            &ctx.time,
            PluginIo {
                inputs: &self.inputs,
                outputs: &self.outputs,
            },
        );
    }
}

/// Scales each audio input into the matching output by its `gain` control.
#[derive(Debug, Default)]
pub struct GainProcessor;

impl PluginProcessor for GainProcessor {
    fn process(&mut self, time: &EngineProcessTimeInfo, io: PluginIo<'_>) {
        let gain = io.control("gain").unwrap_or(1.0);
        let range = time.buffer_range();
        for (input, output) in io.audio_inputs().zip(io.audio_outputs()) {
            let src = input.audio();
            let mut dst = output.audio();
            let end = range.end.min(src.len()).min(dst.len());
            for i in range.start.min(end)..end {
                dst[i] = src[i] * gain;
            }
        }
    }
}

/// Fixed delay line that reports its length as latency.
#[derive(Debug)]
pub struct DelayProcessor {
    frames: u32,
    lines: Vec<VecDeque<f32>>,
}

impl DelayProcessor {
    pub fn new(frames: u32) -> Self {
        Self {
            frames,
            lines: Vec::new(),
        }
    }
}

impl PluginProcessor for DelayProcessor {
    fn latency(&self) -> u32 {
        self.frames
    }

    fn process(&mut self, time: &EngineProcessTimeInfo, io: PluginIo<'_>) {
        let range = time.buffer_range();
        for (channel, (input, output)) in io.audio_inputs().zip(io.audio_outputs()).enumerate() {
            if self.lines.len() <= channel {
                self.lines
                    .push(std::iter::repeat(0.0).take(self.frames as usize).collect());
            }
            let line = &mut self.lines[channel];
            let src = input.audio();
            let mut dst = output.audio();
            let end = range.end.min(src.len()).min(dst.len());
            for i in range.start.min(end)..end {
                line.push_back(src[i]);
                dst[i] = line.pop_front().unwrap_or(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::services;

    #[test]
    fn layout_creates_ports_in_order() {
        let mut table = PortTable::new(8);
        let layout = PluginLayout::stereo_effect().with_control("gain", 1.0, 0.0, 2.0);
        let plugin = Plugin::new(PluginId(0), "fx", &layout, Box::new(GainProcessor), &mut table);
        assert_eq!(plugin.inputs().len(), 3);
        assert_eq!(plugin.outputs().len(), 2);
        assert!(plugin.inputs()[2].flags().automatable);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn delay_reports_latency_and_shifts_signal() {
        let mut table = PortTable::new(4);
        let layout = PluginLayout {
            audio_in: 1,
            audio_out: 1,
            ..PluginLayout::default()
        };
        let plugin = Plugin::new(PluginId(1), "delay", &layout, Box::new(DelayProcessor::new(2)), &mut table);
        assert_eq!(plugin.playback_latency(), 2);

        plugin.inputs()[0].audio().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let services = services();
        let ctx = ProcessContext {
            time: EngineProcessTimeInfo::new(0, 0, 4),
            noroll: false,
            services: &services,
        };
        plugin.process(&ctx);
        assert_eq!(*plugin.outputs()[0].audio(), vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn disabled_plugin_passes_audio_through() {
        let mut table = PortTable::new(2);
        let layout = PluginLayout::stereo_effect().with_control("gain", 0.0, 0.0, 2.0);
        let plugin = Plugin::new(PluginId(2), "mute", &layout, Box::new(GainProcessor), &mut table);
        plugin.inputs()[0].audio().fill(0.5);
        plugin.set_enabled(false);
        let services = services();
        let ctx = ProcessContext {
            time: EngineProcessTimeInfo::new(0, 0, 2),
            noroll: false,
            services: &services,
        };
        plugin.process(&ctx);
        assert_eq!(*plugin.outputs()[0].audio(), vec![0.5, 0.5]);
    }
}
