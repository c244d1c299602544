//! Cadenza Engine
//! ==============
//! Real-time processing graph for a mixing session. The session model is
//! compiled into a DAG of processing nodes which a fixed pool of threads
//! executes once per audio callback, with latency compensation across
//! parallel routes.

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod midi;
pub mod router;
pub mod session;
pub mod sync;
pub mod time;
pub mod track_processor;

pub use config::{EngineConfig, GraphConfig};
pub use engine::{AudioEngine, BlockReport, EngineState};
pub use error::{GraphError, RouterError, SessionError};
pub use graph::{Generation, GraphBuilder, GraphNode, NodeIndex, NodeKey, NodeKind, ProcessContext, Processable};
pub use midi::MidiEvent;
pub use router::{ControlPortChange, CycleOutcome, Router, RouterStats, SkipReason};
pub use session::{Session, TrackId, TrackType};
pub use time::{BeatUnit, EngineProcessTimeInfo};
pub use track_processor::{ClipSource, TrackProcessor};
