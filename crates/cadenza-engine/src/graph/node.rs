use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::session::{MacroId, PluginId, PortId, RuntimeServices, SendId, TrackId};
use crate::time::EngineProcessTimeInfo;

/// What a payload needs to process one (sub-)cycle.
pub struct ProcessContext<'a> {
    pub time: EngineProcessTimeInfo,
    /// Set while the node is still inside the latency pre-roll: the payload
    /// should only silence its outputs.
    pub noroll: bool,
    pub services: &'a RuntimeServices,
}

/// A unit of work scheduled by the graph.
pub trait Processable: Send + Sync {
    fn name(&self) -> &str;

    /// Delay this payload adds to its signal, in frames.
    fn playback_latency(&self) -> u32 {
        0
    }

    fn process(&self, ctx: &ProcessContext<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Track,
    Plugin,
    Fader,
    Prefader,
    Port,
    ChannelSend,
    SampleProcessor,
    MonitorFader,
    HwProcessor,
    ModulatorMacroProcessor,
    InitialProcessor,
}

/// Session identity of a node's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Track(TrackId),
    Plugin(PluginId),
    Fader(TrackId),
    Prefader(TrackId),
    Port(PortId),
    ChannelSend(SendId),
    SampleProcessor,
    MonitorFader,
    HwProcessor,
    ModulatorMacro(MacroId),
    InitialProcessor,
}

impl NodeKey {
    pub fn kind(self) -> NodeKind {
        match self {
            NodeKey::Track(_) => NodeKind::Track,
            NodeKey::Plugin(_) => NodeKind::Plugin,
            NodeKey::Fader(_) => NodeKind::Fader,
            NodeKey::Prefader(_) => NodeKind::Prefader,
            NodeKey::Port(_) => NodeKind::Port,
            NodeKey::ChannelSend(_) => NodeKind::ChannelSend,
            NodeKey::SampleProcessor => NodeKind::SampleProcessor,
            NodeKey::MonitorFader => NodeKind::MonitorFader,
            NodeKey::HwProcessor => NodeKind::HwProcessor,
            NodeKey::ModulatorMacro(_) => NodeKind::ModulatorMacroProcessor,
            NodeKey::InitialProcessor => NodeKind::InitialProcessor,
        }
    }
}

/// Handle into a generation's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

pub struct GraphNode {
    pub(crate) index: NodeIndex,
    pub(crate) key: NodeKey,
    pub(crate) payload: Arc<dyn Processable>,
    pub(crate) children: Vec<NodeIndex>,
    /// Number of parents.
    pub(crate) init_refcount: usize,
    /// Parents still to run this cycle; reset to `init_refcount` when triggered.
    pub(crate) refcount: AtomicUsize,
    pub(crate) playback_latency: AtomicU32,
    pub(crate) route_playback_latency: AtomicU32,
    pub(crate) initial: bool,
    pub(crate) terminal: bool,
}

impl GraphNode {
    pub(crate) fn new(index: NodeIndex, key: NodeKey, payload: Arc<dyn Processable>) -> Self {
        Self {
            index,
            key,
            payload,
            children: Vec::new(),
            init_refcount: 0,
            refcount: AtomicUsize::new(0),
            playback_latency: AtomicU32::new(0),
            route_playback_latency: AtomicU32::new(0),
            initial: false,
            terminal: false,
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn kind(&self) -> NodeKind {
        self.key.kind()
    }

    pub fn name(&self) -> &str {
        self.payload.name()
    }

    pub fn payload(&self) -> &Arc<dyn Processable> {
        &self.payload
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    pub fn init_refcount(&self) -> usize {
        self.init_refcount
    }

    pub fn playback_latency(&self) -> u32 {
        self.playback_latency.load(Ordering::Relaxed)
    }

    pub fn route_playback_latency(&self) -> u32 {
        self.route_playback_latency.load(Ordering::Relaxed)
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Counts one finished parent. Returns true when this was the last one,
    /// in which case the countdown is re-armed for the next cycle.
    pub(crate) fn parent_finished(&self) -> bool {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.refcount.store(self.init_refcount, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("index", &self.index)
            .field("key", &self.key)
            .field("name", &self.name())
            .field("children", &self.children)
            .field("init_refcount", &self.init_refcount)
            .field("initial", &self.initial)
            .field("terminal", &self.terminal)
            .finish()
    }
}
