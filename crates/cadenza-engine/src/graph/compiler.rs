//! Turns the session topology into a [`Generation`].

use std::sync::Arc;

use super::generation::{GraphBuilder, Generation};
use super::node::{NodeIndex, NodeKey};
use crate::error::GraphError;
use crate::session::channel::{Channel, Fader};
use crate::session::port::{Port, PortProcessor, PortSource};
use crate::session::processors::{InitialProcessor, MacroNode};
use crate::session::{PortId, Session, Track, TrackType};

/// Builds a generation from `session`.
///
/// With `drop_unnecessary_ports`, free-standing ports without connections
/// and automatable controls that nothing drives are left out.
pub fn setup(session: &Session, drop_unnecessary_ports: bool) -> Result<Generation, GraphError> {
    let compiler = Compiler::build(session, drop_unnecessary_ports)?;
    let generation = compiler.builder.finish();
    tracing::debug!(
        nodes = generation.len(),
        initial = generation.initial().len(),
        terminal = generation.terminal().len(),
        "graph compiled"
    );
    Ok(generation)
}

/// Checks whether connecting `src` to `dest` would keep the graph acyclic,
/// without touching the session.
pub fn validate_with_connection(session: &Session, src: PortId, dest: PortId) -> Result<(), GraphError> {
    let mut compiler = Compiler::build(session, false)?;
    let builder = &mut compiler.builder;
    let src_node = builder
        .find(NodeKey::Port(src))
        .ok_or(GraphError::UnknownPort(src))?;
    let dest_node = builder
        .find(NodeKey::Port(dest))
        .ok_or(GraphError::UnknownPort(dest))?;

    builder.connect(src_node, dest_node)?;
    if builder.node(src_node).children().is_empty() {
        return Err(GraphError::SourceIsTerminal(NodeKey::Port(src)));
    }
    if builder.node(dest_node).init_refcount() == 0 {
        return Err(GraphError::DestinationIsInitial(NodeKey::Port(dest)));
    }

    if compiler.builder.finish().is_valid() {
        Ok(())
    } else {
        Err(GraphError::Cycle)
    }
}

struct Compiler<'a> {
    session: &'a Session,
    drop_unnecessary_ports: bool,
    builder: GraphBuilder,
    initial: NodeIndex,
}

impl<'a> Compiler<'a> {
    fn build(session: &'a Session, drop_unnecessary_ports: bool) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new();
        let initial = builder.add_node(NodeKey::InitialProcessor, Arc::new(InitialProcessor));
        let mut compiler = Self {
            session,
            drop_unnecessary_ports,
            builder,
            initial,
        };
        compiler.add_nodes();
        compiler.wire()?;
        Ok(compiler)
    }

    fn add_nodes(&mut self) {
        let session = self.session;
        self.builder
            .add_node(NodeKey::SampleProcessor, session.sample_processor().clone());
        self.builder
            .add_node(NodeKey::MonitorFader, session.monitor_fader().clone());
        self.builder
            .add_node(NodeKey::HwProcessor, session.hw_processor().clone());

        for track in session.tracks() {
            self.builder
                .add_node(NodeKey::Track(track.id()), Arc::new(track.node()));
            if let Some(channel) = track.channel() {
                self.builder
                    .add_node(NodeKey::Prefader(track.id()), channel.prefader().clone());
                self.builder
                    .add_node(NodeKey::Fader(track.id()), channel.fader().clone());
                for plugin in channel.plugins() {
                    self.builder.add_node(NodeKey::Plugin(plugin.id()), plugin.clone());
                }
                for send in channel.sends() {
                    self.builder.add_node(NodeKey::ChannelSend(send.id()), send.clone());
                }
            }
            for plugin in track.modulators() {
                self.builder.add_node(NodeKey::Plugin(plugin.id()), plugin.clone());
            }
            for processor in track.macros() {
                let modulated = self.has_sources(processor.cv_in().id());
                self.builder.add_node(
                    NodeKey::ModulatorMacro(processor.id()),
                    Arc::new(MacroNode::new(processor.clone(), modulated)),
                );
            }
        }

        for port in session.ports().iter() {
            if self.keep_port(port) {
                let payload = PortProcessor::new(port.clone(), self.sources_of(port.id()));
                self.builder.add_node(NodeKey::Port(port.id()), Arc::new(payload));
            }
        }
    }

    fn has_sources(&self, port: PortId) -> bool {
        self.session
            .connections()
            .sources(port)
            .iter()
            .any(|conn| conn.enabled)
    }

    fn sources_of(&self, port: PortId) -> Vec<PortSource> {
        self.session
            .connections()
            .sources(port)
            .iter()
            .filter(|conn| conn.enabled)
            .filter_map(|conn| {
                self.session.port(conn.src).map(|src| PortSource {
                    port: src.clone(),
                    multiplier: conn.multiplier,
                })
            })
            .collect()
    }

    fn keep_port(&self, port: &Port) -> bool {
        if !self.drop_unnecessary_ports || port.flags().manual_press {
            return true;
        }
        let connections = self.session.connections();
        let has_sources = !connections.sources(port.id()).is_empty();
        let has_dests = !connections.dests(port.id()).is_empty();
        if port.is_control() && port.flags().automatable && !port.is_automated() && !has_sources {
            return false;
        }
        port.owner().is_structural() || has_sources || has_dests
    }

    fn port_node(&self, port: &Port) -> Option<NodeIndex> {
        self.builder.find(NodeKey::Port(port.id()))
    }

    fn edge(&mut self, parent: Option<NodeIndex>, child: Option<NodeIndex>) -> Result<(), GraphError> {
        if let (Some(parent), Some(child)) = (parent, child) {
            self.builder.connect(parent, child)?;
        }
        Ok(())
    }

    /// `ins -> node -> outs`, skipping ports that were dropped.
    fn through<'p>(
        &mut self,
        ins: impl IntoIterator<Item = &'p Arc<Port>>,
        node: NodeKey,
        outs: impl IntoIterator<Item = &'p Arc<Port>>,
    ) -> Result<(), GraphError> {
        let node = self.builder.find(node);
        for port in ins {
            let parent = self.port_node(port);
            self.edge(parent, node)?;
        }
        for port in outs {
            let child = self.port_node(port);
            self.edge(node, child)?;
        }
        Ok(())
    }

    fn wire(&mut self) -> Result<(), GraphError> {
        let session = self.session;
        let initial = Some(self.initial);

        self.through([], NodeKey::SampleProcessor, session.sample_processor().out().iter())?;
        self.wire_fader(session.monitor_fader(), NodeKey::MonitorFader)?;
        let hw = session.hw_processor();
        self.through([], NodeKey::HwProcessor, hw.audio_ports().iter().chain(hw.midi_ports()))?;

        let manual_press = self.port_node(session.manual_press());
        self.edge(manual_press, initial)?;
        for port in session.transport().ports().iter() {
            let node = self.port_node(port);
            self.edge(node, initial)?;
        }

        for track in session.tracks() {
            self.wire_track(track)?;
        }

        for port in session.ports().iter() {
            let Some(node) = self.port_node(port) else {
                continue;
            };
            let connections = session.connections();
            for conn in connections.dests(port.id()).iter().filter(|conn| conn.enabled) {
                let child = self.builder.find(NodeKey::Port(conn.dest));
                self.edge(Some(node), child)?;
            }
            for conn in connections.sources(port.id()).iter().filter(|conn| conn.enabled) {
                let parent = self.builder.find(NodeKey::Port(conn.src));
                self.edge(parent, Some(node))?;
            }
        }
        Ok(())
    }

    fn wire_track(&mut self, track: &Track) -> Result<(), GraphError> {
        let initial = Some(self.initial);
        let key = NodeKey::Track(track.id());
        let track_node = self.builder.find(key);
        self.edge(initial, track_node)?;

        if let Some(tempo) = track.tempo_ports() {
            for port in tempo.iter() {
                let node = self.port_node(port);
                self.edge(node, initial)?;
                if let Some(node) = node {
                    self.builder.mark_tempo(node);
                }
            }
        }

        if let Some(processor) = track.processor() {
            let controls = [
                processor.mono(),
                processor.input_gain(),
                processor.output_gain(),
                processor.monitor_audio(),
            ];
            let inputs = processor
                .stereo_in()
                .into_iter()
                .flat_map(|ports| ports.iter())
                .chain(processor.midi_in())
                .chain(processor.piano_roll())
                .chain(controls.into_iter().flatten());
            for port in inputs {
                let node = self.port_node(port);
                self.edge(initial, node)?;
                self.edge(node, track_node)?;
            }
            self.through(processor.midi_control_ports(), key, processor.outputs())?;
        }

        if track.ty() == TrackType::Modulator {
            for plugin in track.modulators() {
                self.through([], key, plugin.inputs())?;
                self.through(plugin.inputs(), NodeKey::Plugin(plugin.id()), plugin.outputs())?;
            }
            for processor in track.macros() {
                self.through(
                    [processor.cv_in(), processor.macro_port()],
                    NodeKey::ModulatorMacro(processor.id()),
                    [processor.cv_out()],
                )?;
            }
        }

        if let Some(channel) = track.channel() {
            self.wire_channel(track, channel)?;
        }
        Ok(())
    }

    fn wire_fader(&mut self, fader: &Fader, key: NodeKey) -> Result<(), GraphError> {
        self.through(fader.io().inputs(), key, fader.io().outputs())?;
        self.through(fader.controls(), key, [])
    }

    fn wire_channel(&mut self, track: &Track, channel: &Channel) -> Result<(), GraphError> {
        self.wire_fader(channel.prefader(), NodeKey::Prefader(track.id()))?;
        self.wire_fader(channel.fader(), NodeKey::Fader(track.id()))?;
        for plugin in channel.plugins() {
            self.through(plugin.inputs(), NodeKey::Plugin(plugin.id()), plugin.outputs())?;
        }
        for send in channel.sends() {
            let key = NodeKey::ChannelSend(send.id());
            self.through(send.io().inputs(), key, send.io().outputs())?;
            self.through(send.controls(), key, [])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::session::{GainProcessor, PluginLayout, PluginSlot};

    fn session() -> Session {
        Session::new(&EngineConfig {
            sample_rate: 48_000,
            block_size: 32,
        })
    }

    #[test]
    fn compiled_session_is_a_valid_dag() {
        let mut session = session();
        let track = session.add_track("Audio 1", TrackType::Audio);
        session.add_track("Keys", TrackType::Instrument);
        session
            .add_plugin(track, PluginSlot::Insert, "Gain", &PluginLayout::stereo_effect(), Box::new(GainProcessor))
            .expect("plugin");

        let generation = setup(&session, true).expect("compile");
        assert!(generation.is_valid());
        assert_eq!(generation.tempo_nodes().len(), 3);
        assert!(generation.find(NodeKey::Track(track)).is_some());
        assert!(generation.find(NodeKey::Fader(session.master())).is_some());
    }

    #[test]
    fn unautomated_controllers_are_dropped() {
        let mut session = session();
        let track = session.add_track("Keys", TrackType::Midi);
        let processor = session
            .track(track)
            .and_then(Track::processor)
            .expect("processor")
            .clone();
        let cc = processor.midi_control_ports()[7].clone();

        let dropped = setup(&session, true).expect("compile");
        assert!(dropped.find(NodeKey::Port(cc.id())).is_none());
        let full = setup(&session, false).expect("compile");
        assert!(full.find(NodeKey::Port(cc.id())).is_some());

        cc.set_automated(true);
        let automated = setup(&session, true).expect("compile");
        assert!(automated.find(NodeKey::Port(cc.id())).is_some());
    }

    #[test]
    fn validation_rejects_missing_ports_and_loops() {
        let mut session = session();
        let a = session.add_track("A", TrackType::AudioBus);
        let b = session.add_track("B", TrackType::AudioBus);
        session.route_channel(a, Some(b)).expect("route");

        let out_of = |track| {
            session
                .track(track)
                .and_then(Track::channel)
                .map(|channel| channel.fader().io().outputs()[0].id())
                .expect("fader")
        };
        let in_of = |track| {
            session
                .track(track)
                .and_then(Track::processor)
                .and_then(|processor| processor.stereo_in())
                .map(|ports| ports.l.id())
                .expect("input")
        };

        assert_eq!(
            validate_with_connection(&session, PortId(u32::MAX), in_of(a)),
            Err(GraphError::UnknownPort(PortId(u32::MAX)))
        );
        assert_eq!(
            validate_with_connection(&session, out_of(b), in_of(a)),
            Err(GraphError::Cycle)
        );
        assert_eq!(validate_with_connection(&session, out_of(a), in_of(b)), Ok(()));
    }
}
