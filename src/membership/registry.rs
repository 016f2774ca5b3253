//! Node Registry
//!
//! Authoritative table of every known member, keyed by name. Iteration follows
//! insertion order and is stable for the lifetime of the registry. The local
//! node is inserted on construction and never removed.

use indexmap::IndexMap;
use std::time::{Duration, Instant};

use super::types::{Node, NodeName, NodeState, State};

#[derive(Debug)]
pub struct Registry {
    local: NodeName,
    nodes: IndexMap<NodeName, NodeState>,
}

impl Registry {
    pub fn new(local: Node, incarnation: u64) -> Self {
        let name = local.name.clone();
        let mut nodes = IndexMap::new();
        nodes.insert(name.clone(), NodeState::new(local, State::Alive, incarnation));

        Self { local: name, nodes }
    }

    pub fn local_name(&self) -> &NodeName {
        &self.local
    }

    pub fn local_state(&self) -> &NodeState {
        &self.nodes[&self.local]
    }

    pub fn local_state_mut(&mut self) -> &mut NodeState {
        self.nodes
            .get_mut(&self.local)
            .expect("local node is always registered")
    }

    pub fn is_local(&self, name: &NodeName) -> bool {
        &self.local == name
    }

    pub fn get(&self, name: &NodeName) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &NodeName) -> Option<&mut NodeState> {
        self.nodes.get_mut(name)
    }

    /// Inserts or replaces an entry, keeping its original position on replace.
    pub fn insert(&mut self, state: NodeState) {
        self.nodes.insert(state.name().clone(), state);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    /// Live members (neither Dead nor Left) in registry order.
    pub fn members(&self) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|state| !state.state.is_terminal())
            .map(|state| state.node.clone())
            .collect()
    }

    pub fn num_members(&self) -> usize {
        self.nodes
            .values()
            .filter(|state| !state.state.is_terminal())
            .count()
    }

    /// Remote entries matching `filter`, in registry order.
    pub fn peers<F>(&self, filter: F) -> Vec<&NodeState>
    where
        F: Fn(&NodeState) -> bool,
    {
        self.nodes
            .values()
            .filter(|state| state.name() != &self.local && filter(state))
            .collect()
    }

    /// Removes Dead/Left entries whose last state change is older than
    /// `retention`. Returns the removed names.
    pub fn reap(&mut self, retention: Duration, now: Instant) -> Vec<NodeName> {
        let expired: Vec<NodeName> = self
            .nodes
            .values()
            .filter(|state| {
                state.name() != &self.local
                    && state.state.is_terminal()
                    && now.saturating_duration_since(state.state_change) >= retention
            })
            .map(|state| state.name().clone())
            .collect();

        for name in &expired {
            self.nodes.shift_remove(name);
        }

        expired
    }
}
