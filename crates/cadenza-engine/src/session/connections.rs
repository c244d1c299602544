use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::PortId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortConnection {
    pub src: PortId,
    pub dest: PortId,
    pub multiplier: f32,
    pub enabled: bool,
    /// Internal wiring that users cannot remove.
    pub locked: bool,
}

impl PortConnection {
    pub fn new(src: PortId, dest: PortId) -> Self {
        Self {
            src,
            dest,
            multiplier: 1.0,
            enabled: true,
            locked: false,
        }
    }
}

/// Authoritative record of port-to-port connections, indexed both ways.
#[derive(Debug, Default, Clone)]
pub struct PortConnectionsManager {
    by_src: BTreeMap<PortId, Vec<PortConnection>>,
    by_dest: BTreeMap<PortId, Vec<PortConnection>>,
}

impl PortConnectionsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the connection between `conn.src` and `conn.dest`.
    pub fn connect(&mut self, conn: PortConnection) {
        self.disconnect(conn.src, conn.dest);
        self.by_src.entry(conn.src).or_default().push(conn);
        self.by_dest.entry(conn.dest).or_default().push(conn);
    }

    pub fn disconnect(&mut self, src: PortId, dest: PortId) -> bool {
        let removed = remove_matching(&mut self.by_src, src, |c| c.dest == dest);
        remove_matching(&mut self.by_dest, dest, |c| c.src == src);
        removed
    }

    /// Drops every connection touching `port`.
    pub fn disconnect_port(&mut self, port: PortId) {
        for conn in self.dests(port).to_vec() {
            self.disconnect(conn.src, conn.dest);
        }
        for conn in self.sources(port).to_vec() {
            self.disconnect(conn.src, conn.dest);
        }
    }

    /// Drops the locked connections whose source is in `ports`.
    pub fn disconnect_locked_from(&mut self, ports: &[PortId]) {
        for &port in ports {
            let locked: Vec<PortConnection> = self
                .dests(port)
                .iter()
                .filter(|conn| conn.locked)
                .copied()
                .collect();
            for conn in locked {
                self.disconnect(conn.src, conn.dest);
            }
        }
    }

    pub fn sources(&self, port: PortId) -> &[PortConnection] {
        self.by_dest.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dests(&self, port: PortId) -> &[PortConnection] {
        self.by_src.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, src: PortId, dest: PortId) -> Option<&PortConnection> {
        self.dests(src).iter().find(|conn| conn.dest == dest)
    }

    pub fn is_connected(&self, src: PortId, dest: PortId) -> bool {
        self.find(src, dest).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_src.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_src.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortConnection> {
        self.by_src.values().flatten()
    }
}

fn remove_matching(
    index: &mut BTreeMap<PortId, Vec<PortConnection>>,
    key: PortId,
    matches: impl Fn(&PortConnection) -> bool,
) -> bool {
    let Some(list) = index.get_mut(&key) else {
        return false;
    };
    let before = list.len();
    list.retain(|conn| !matches(conn));
    let removed = list.len() != before;
    if list.is_empty() {
        index.remove(&key);
    }
    removed
}
