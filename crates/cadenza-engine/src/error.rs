use thiserror::Error;

use crate::graph::NodeKey;
use crate::session::{PortId, TrackId};

/// Errors raised while compiling, validating or running the processing graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0:?} cannot feed itself")]
    SelfLoop(NodeKey),
    #[error("graph contains a cycle")]
    Cycle,
    #[error("source {0:?} is already a terminal node")]
    SourceIsTerminal(NodeKey),
    #[error("destination {0:?} is already an initial node")]
    DestinationIsInitial(NodeKey),
    #[error("port {0:?} has no node in the graph")]
    UnknownPort(PortId),
    #[error("failed to spawn graph thread: {0}")]
    ThreadSpawn(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl GraphError {
    pub fn invariant(message: impl Into<String>) -> Self {
        GraphError::InvariantViolation(message.into())
    }
}

/// Errors reported by the session model when it is asked to change topology.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("track {0:?} not found")]
    UnknownTrack(TrackId),
    #[error("port {0:?} not found")]
    UnknownPort(PortId),
    #[error("track {0:?} has no channel")]
    NoChannel(TrackId),
    #[error("track {0:?} cannot be removed")]
    Protected(TrackId),
    #[error("track {track:?} cannot feed {target:?}: signal types differ")]
    SignalMismatch { track: TrackId, target: TrackId },
    #[error("connection {src:?} -> {dest:?} is internal wiring")]
    LockedConnection { src: PortId, dest: PortId },
    #[error("cannot connect {src:?} to {dest:?}: {reason}")]
    IncompatiblePorts {
        src: PortId,
        dest: PortId,
        reason: &'static str,
    },
    #[error("connection rejected: {0}")]
    Connection(#[from] GraphError),
}

/// Errors surfaced by the cycle driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("control port change ring is full")]
    ControlRingFull,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
