use std::sync::atomic::Ordering;

use super::generation::Generation;
use crate::error::GraphError;

impl Generation {
    /// Refreshes every node's playback latency from its payload and
    /// recomputes route latencies: the worst delay still ahead of each node.
    ///
    /// Depends only on topology and payload latencies, so repeated calls
    /// give the same result.
    pub fn update_latencies(&self) -> Result<(), GraphError> {
        let order = self.topological_order().ok_or(GraphError::Cycle)?;
        for node in self.nodes() {
            node.playback_latency
                .store(node.payload.playback_latency(), Ordering::Relaxed);
            node.route_playback_latency.store(0, Ordering::Relaxed);
        }

        for &index in order.iter().rev() {
            let node = self.node(index);
            let downstream = node
                .children
                .iter()
                .map(|&child| self.node(child).route_playback_latency())
                .max()
                .unwrap_or(0);
            let route = node.playback_latency().saturating_add(downstream);
            node.route_playback_latency.store(route, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Largest route latency among the trigger nodes: the pre-roll needed for
    /// every path to line up.
    pub fn max_route_playback_latency(&self) -> u32 {
        self.initial()
            .iter()
            .map(|&index| self.node(index).route_playback_latency())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::graph::{GraphBuilder, NodeKey, ProcessContext, Processable};
    use crate::session::PortId;

    struct Latent(u32);

    impl Processable for Latent {
        fn name(&self) -> &str {
            "latent"
        }

        fn playback_latency(&self) -> u32 {
            self.0
        }

        fn process(&self, _ctx: &ProcessContext<'_>) {}
    }

    #[test]
    fn route_latency_takes_the_worst_branch() {
        // a -> b(64) -> d, a -> c(16) -> d(8)
        let mut builder = GraphBuilder::new();
        let mut node = |i, latency| builder.add_node(NodeKey::Port(PortId(i)), Arc::new(Latent(latency)));
        let (a, b, c, d) = (node(0, 0), node(1, 64), node(2, 16), node(3, 8));
        for (parent, child) in [(a, b), (a, c), (b, d), (c, d)] {
            builder.connect(parent, child).expect("edge");
        }
        let generation = builder.finish();
        generation.update_latencies().expect("acyclic");

        assert_eq!(generation.node(d).route_playback_latency(), 8);
        assert_eq!(generation.node(b).route_playback_latency(), 72);
        assert_eq!(generation.node(c).route_playback_latency(), 24);
        assert_eq!(generation.max_route_playback_latency(), 72);

        generation.update_latencies().expect("acyclic");
        assert_eq!(generation.node(a).route_playback_latency(), 72);
    }
}
