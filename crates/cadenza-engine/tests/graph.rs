use std::sync::Arc;

use cadenza_engine::graph::{GraphBuilder, NodeIndex, NodeKey, ProcessContext, Processable};
use cadenza_engine::session::PortId;
use proptest::prelude::*;

struct Noop;

impl Processable for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    fn process(&self, _ctx: &ProcessContext<'_>) {}
}

/// Node count plus forward edges only, so the result is always acyclic.
fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..24).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a < b)
                .collect::<Vec<_>>()
        });
        (Just(n), edges)
    })
}

fn build(n: usize, edges: &[(usize, usize)]) -> (GraphBuilder, Vec<NodeIndex>) {
    let mut builder = GraphBuilder::new();
    let nodes: Vec<_> = (0..n)
        .map(|i| builder.add_node(NodeKey::Port(PortId(i as u32)), Arc::new(Noop)))
        .collect();
    for &(a, b) in edges {
        builder.connect(nodes[a], nodes[b]).expect("forward edge");
    }
    (builder, nodes)
}

proptest! {
    #[test]
    fn forward_only_graphs_are_valid((n, edges) in dag()) {
        let (builder, nodes) = build(n, &edges);
        let generation = builder.finish();
        prop_assert!(generation.is_valid());

        let order = generation.topological_order().expect("acyclic");
        prop_assert_eq!(order.len(), n);
        let position = |index: NodeIndex| order.iter().position(|&i| i == index);
        for &(a, b) in &edges {
            prop_assert!(position(nodes[a]) < position(nodes[b]));
        }
    }

    #[test]
    fn any_back_edge_makes_the_graph_invalid((n, edges) in dag()) {
        prop_assume!(!edges.is_empty());
        let (mut builder, nodes) = build(n, &edges);
        let (a, b) = edges[edges.len() / 2];
        builder.connect(nodes[b], nodes[a]).expect("distinct nodes");
        prop_assert!(!builder.finish().is_valid());
    }

    #[test]
    fn connect_counts_each_new_parent_once((n, edges) in dag()) {
        let (mut builder, nodes) = build(n, &[]);
        for &(a, b) in &edges {
            let before = builder.node(nodes[b]).init_refcount();
            let added = builder.connect(nodes[a], nodes[b]).expect("forward edge");
            let after = builder.node(nodes[b]).init_refcount();
            prop_assert_eq!(after, before + usize::from(added));
        }
        let generation = builder.finish();
        for &index in generation.initial() {
            prop_assert_eq!(generation.node(index).init_refcount(), 0);
        }
        for &index in generation.terminal() {
            prop_assert!(generation.node(index).children().is_empty());
        }
    }
}

#[test]
fn latency_update_is_idempotent() {
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

    let mut builder = GraphBuilder::new();
    let nodes: Vec<_> = [0, 32, 0, 128, 16]
        .into_iter()
        .enumerate()
        .map(|(i, latency)| builder.add_node(NodeKey::Port(PortId(i as u32)), Arc::new(Latent(latency))))
        .collect();
    for (a, b) in [(0, 1), (0, 2), (1, 4), (2, 3), (3, 4)] {
        builder.connect(nodes[a], nodes[b]).expect("edge");
    }
    let generation = builder.finish();

    generation.update_latencies().expect("acyclic");
    let first: Vec<u32> = generation.nodes().iter().map(|node| node.route_playback_latency()).collect();
    generation.update_latencies().expect("acyclic");
    let second: Vec<u32> = generation.nodes().iter().map(|node| node.route_playback_latency()).collect();

    assert_eq!(first, second);
    assert_eq!(generation.max_route_playback_latency(), 144);
}
