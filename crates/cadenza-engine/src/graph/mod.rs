//! The processing graph: node arena, compiler, latency pass and the
//! threads that execute it.

pub mod compiler;
mod generation;
mod latency;
mod node;
pub mod pool;
pub mod scheduler;

pub use generation::{Generation, GraphBuilder};
pub use node::{GraphNode, NodeIndex, NodeKey, NodeKind, ProcessContext, Processable};
pub use pool::GraphThreads;
pub use scheduler::Scheduler;
