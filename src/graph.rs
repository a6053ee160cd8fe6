//! In-memory Audio Graph
//!
//! [`AudioGraph`] is a recording implementation of [`AudioBackend`]. It keeps
//! the node graph in a generational arena, validates every connection,
//! refuses signal loops, and logs parameter automation so the synthesis
//! core can be exercised without an audio device. It can also pretend to be
//! suspended or out of memory, which is how the failure paths are tested.

use crate::backend::{AudioBackend, Input, NodeId, NodeKind, Param, Port};
use crate::error::BackendError;
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Default number of automation events kept before the oldest are dropped
pub const AUTOMATION_LOG_LIMIT: usize = 4096;

/// A connection between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cable {
    pub from: NodeId,
    pub to: Port,
}

/// One recorded parameter change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Automation {
    pub node: NodeId,
    pub param: Param,
    pub value: f64,
    pub at: f64,
    /// Zero for an immediate set
    pub duration: f64,
}

/// Envelope state as last triggered
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnvelopeStage {
    Idle,
    Attack { at: f64 },
    Release { at: f64 },
}

/// Internal node representation
struct Node {
    kind: NodeKind,
    params: HashMap<Param, f64>,
    started: Option<f64>,
    stopped: Option<f64>,
    stage: EnvelopeStage,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        let params = kind
            .params()
            .iter()
            .filter_map(|&p| kind.initial_value(p).map(|v| (p, v)))
            .collect();
        Self {
            kind,
            params,
            started: None,
            stopped: None,
            stage: EnvelopeStage::Idle,
        }
    }
}

/// Recording audio backend
pub struct AudioGraph {
    nodes: SlotMap<NodeId, Node>,
    cables: Vec<Cable>,
    automation: VecDeque<Automation>,
    automation_limit: usize,
    master: NodeId,

    // Configuration
    sample_rate: f64,
    tempo: f64,
    ready: bool,
    transport_ready: bool,
    capacity: Option<usize>,

    // Bookkeeping
    created: usize,
    disposed: usize,
    faults: usize,
}

impl AudioGraph {
    /// Create a running graph with an empty master bus
    pub fn new(sample_rate: f64) -> Self {
        let mut nodes = SlotMap::with_key();
        let master = nodes.insert(Node::new(NodeKind::gain(1.0)));
        Self {
            nodes,
            cables: Vec::new(),
            automation: VecDeque::new(),
            automation_limit: AUTOMATION_LOG_LIMIT,
            master,
            sample_rate,
            tempo: 120.0,
            ready: true,
            transport_ready: true,
            capacity: None,
            created: 0,
            disposed: 0,
            faults: 0,
        }
    }

    /// Create a graph whose context has not been started yet
    pub fn suspended(sample_rate: f64) -> Self {
        let mut graph = Self::new(sample_rate);
        graph.ready = false;
        graph
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Resume or suspend the context
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Make the transport refuse to run while the context stays up
    pub fn set_transport_ready(&mut self, ready: bool) {
        self.transport_ready = ready;
    }

    /// Limit the number of live nodes (master bus excluded)
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Number of live nodes, master bus included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live nodes of the given type (see [`NodeKind::type_id`])
    pub fn count_of(&self, type_id: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.kind.type_id() == type_id)
            .count()
    }

    pub fn cable_count(&self) -> usize {
        self.cables.len()
    }

    pub fn cables(&self) -> &[Cable] {
        &self.cables
    }

    /// Total nodes ever allocated (master bus excluded)
    pub fn created_count(&self) -> usize {
        self.created
    }

    /// Total nodes ever disposed
    pub fn disposed_count(&self) -> usize {
        self.disposed
    }

    /// Operations that referenced a node which no longer exists
    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Most recent parameter changes, oldest first
    pub fn automation(&self) -> &VecDeque<Automation> {
        &self.automation
    }

    /// Keep at most `limit` automation events
    pub fn set_automation_limit(&mut self, limit: usize) {
        self.automation_limit = limit;
        self.trim_automation();
    }

    /// Forget every recorded automation event
    pub fn clear_automation(&mut self) {
        self.automation.clear();
    }

    fn trim_automation(&mut self) {
        let excess = self.automation.len().saturating_sub(self.automation_limit);
        self.automation.drain(..excess);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn kind(&self, node: NodeId) -> Option<&NodeKind> {
        self.nodes.get(node).map(|n| &n.kind)
    }

    /// Current (target) value of a parameter
    pub fn param(&self, node: NodeId, param: Param) -> Option<f64> {
        self.nodes.get(node).and_then(|n| n.params.get(&param).copied())
    }

    pub fn is_started(&self, node: NodeId) -> bool {
        self.nodes
            .get(node)
            .map(|n| n.started.is_some())
            .unwrap_or(false)
    }

    pub fn stop_time(&self, node: NodeId) -> Option<f64> {
        self.nodes.get(node).and_then(|n| n.stopped)
    }

    pub fn envelope_stage(&self, node: NodeId) -> Option<EnvelopeStage> {
        self.nodes.get(node).map(|n| n.stage)
    }

    /// Nodes feeding into the given node, on any input
    pub fn sources_of(&self, node: NodeId) -> Vec<NodeId> {
        self.cables
            .iter()
            .filter(|c| c.to.node == node)
            .map(|c| c.from)
            .collect()
    }

    /// Nodes driving a parameter of the given node
    pub fn modulators_of(&self, node: NodeId, param: Param) -> Vec<NodeId> {
        self.cables
            .iter()
            .filter(|c| c.to == Port::param(node, param))
            .map(|c| c.from)
            .collect()
    }

    /// Order in which a renderer would process the nodes
    ///
    /// Connections are refused when they would close a loop, so the sort
    /// always covers every node.
    pub fn processing_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeId, usize> = self.nodes.keys().map(|k| (k, 0)).collect();
        let mut successors: HashMap<NodeId, Vec<NodeId>> =
            self.nodes.keys().map(|k| (k, vec![])).collect();

        for cable in &self.cables {
            *in_degree.entry(cable.to.node).or_insert(0) += 1;
            successors.entry(cable.from).or_default().push(cable.to.node);
        }

        // Kahn's algorithm
        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            result.push(node);
            if let Some(next) = successors.get(&node) {
                for &succ in next {
                    if let Some(deg) = in_degree.get_mut(&succ) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(succ);
                        }
                    }
                }
            }
        }

        debug_assert_eq!(result.len(), self.nodes.len());
        result
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut Node, BackendError> {
        match self.nodes.get_mut(node) {
            Some(n) => Ok(n),
            None => {
                self.faults += 1;
                Err(BackendError::InvalidNode)
            }
        }
    }

    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if seen.insert(node) {
                stack.extend(
                    self.cables
                        .iter()
                        .filter(|c| c.from == node)
                        .map(|c| c.to.node),
                );
            }
        }
        false
    }

    fn record(&mut self, node: NodeId, param: Param, value: f64, at: f64, duration: f64) {
        self.automation.push_back(Automation {
            node,
            param,
            value,
            at,
            duration,
        });
        self.trim_automation();
    }

    fn check_param(&mut self, node: NodeId, param: Param) -> Result<&mut Node, BackendError> {
        let n = self.node_mut(node)?;
        if n.kind.params().contains(&param) {
            Ok(n)
        } else {
            Err(BackendError::InvalidPort)
        }
    }
}

impl Default for AudioGraph {
    fn default() -> Self {
        Self::new(44100.0)
    }
}

impl AudioBackend for AudioGraph {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn transport_ready(&self) -> bool {
        self.ready && self.transport_ready
    }

    fn set_tempo(&mut self, bpm: f64) {
        self.tempo = bpm;
    }

    fn master(&self) -> NodeId {
        self.master
    }

    fn create(&mut self, kind: NodeKind) -> Result<NodeId, BackendError> {
        if !self.ready {
            return Err(BackendError::NotReady);
        }
        if let Some(capacity) = self.capacity {
            if self.nodes.len() - 1 >= capacity {
                return Err(BackendError::Exhausted);
            }
        }
        self.created += 1;
        Ok(self.nodes.insert(Node::new(kind)))
    }

    fn connect(&mut self, from: NodeId, to: Port) -> Result<(), BackendError> {
        self.node_mut(from)?;
        let dest = self.node_mut(to.node)?;
        match to.input {
            Input::Signal if !dest.kind.has_signal_input() => {
                return Err(BackendError::InvalidPort);
            }
            Input::Param(p) if !dest.kind.params().contains(&p) => {
                return Err(BackendError::InvalidPort);
            }
            _ => {}
        }
        if from == to.node || self.reaches(to.node, from) {
            return Err(BackendError::CycleDetected);
        }
        self.cables.push(Cable { from, to });
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), BackendError> {
        self.node_mut(node)?;
        self.cables.retain(|c| c.from != node);
        Ok(())
    }

    fn set_param(
        &mut self,
        node: NodeId,
        param: Param,
        value: f64,
        at: f64,
    ) -> Result<(), BackendError> {
        self.check_param(node, param)?.params.insert(param, value);
        self.record(node, param, value, at, 0.0);
        Ok(())
    }

    fn ramp_param(
        &mut self,
        node: NodeId,
        param: Param,
        value: f64,
        at: f64,
        duration: f64,
    ) -> Result<(), BackendError> {
        self.check_param(node, param)?.params.insert(param, value);
        self.record(node, param, value, at, duration.max(0.0));
        Ok(())
    }

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), BackendError> {
        let n = self.node_mut(node)?;
        if !matches!(n.kind, NodeKind::Oscillator { .. }) {
            return Err(BackendError::InvalidPort);
        }
        n.started = Some(at);
        Ok(())
    }

    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), BackendError> {
        let n = self.node_mut(node)?;
        if !matches!(n.kind, NodeKind::Oscillator { .. }) {
            return Err(BackendError::InvalidPort);
        }
        n.stopped = Some(at);
        Ok(())
    }

    fn trigger_attack(&mut self, envelope: NodeId, at: f64) -> Result<(), BackendError> {
        let n = self.node_mut(envelope)?;
        if !matches!(n.kind, NodeKind::Envelope(_)) {
            return Err(BackendError::InvalidPort);
        }
        n.stage = EnvelopeStage::Attack { at };
        Ok(())
    }

    fn trigger_release(&mut self, envelope: NodeId, at: f64) -> Result<(), BackendError> {
        let n = self.node_mut(envelope)?;
        if !matches!(n.kind, NodeKind::Envelope(_)) {
            return Err(BackendError::InvalidPort);
        }
        n.stage = EnvelopeStage::Release { at };
        Ok(())
    }

    fn dispose(&mut self, node: NodeId) -> Result<(), BackendError> {
        if node == self.master {
            return Err(BackendError::InvalidPort);
        }
        if self.nodes.remove(node).is_none() {
            self.faults += 1;
            return Err(BackendError::InvalidNode);
        }
        self.cables.retain(|c| c.from != node && c.to.node != node);
        self.disposed += 1;
        Ok(())
    }
}
