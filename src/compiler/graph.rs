use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{GraphKind, IndexType, NodeVariant, PinDirection, PinKind, SourceGraph};

/// Arena index of a node in the consolidated graph.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct GraphNodeId(pub IndexType);

impl From<GraphNodeId> for usize {
    fn from(value: GraphNodeId) -> Self {
        value.0 as usize
    }
}

/// Arena index of a pin in the consolidated graph.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct PinId(pub IndexType);

impl From<PinId> for usize {
    fn from(value: PinId) -> Self {
        value.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct CompilationNode {
    /// Authored identity. Clones of the same sub-graph share it.
    pub source_guid: Uuid,
    pub graph_name: String,
    pub graph_kind: GraphKind,
    pub variant: NodeVariant,
    pub pins: Vec<PinId>,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct CompilationPin {
    pub owner: GraphNodeId,
    pub name: String,
    pub direction: PinDirection,
    pub kind: PinKind,
    pub array_index: Option<IndexType>,
    /// Upstream output pin for connected input pins.
    pub link: Option<PinId>,
    pub default_literal: String,
    pub sub_member: Option<String>,
    pub value_kind: Option<crate::FieldKind>,
}

/// All reachable graphs merged into one arena. Nodes and pins live in flat
/// vectors and reference each other by index, so cloning a sub-graph is an
/// append plus index relocation.
#[derive(Debug, Default, Clone)]
pub struct ConsolidatedGraph {
    pub nodes: Vec<CompilationNode>,
    pub pins: Vec<CompilationPin>,
}

impl ConsolidatedGraph {
    pub fn node(&self, id: GraphNodeId) -> &CompilationNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: GraphNodeId) -> &mut CompilationNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn pin(&self, id: PinId) -> &CompilationPin {
        &self.pins[id.0 as usize]
    }

    /// Clone a source graph into the arena, resolving intra-graph pin
    /// links. Returns the ids of the merged nodes in authored order.
    pub fn merge_graph(&mut self, graph: &SourceGraph) -> Vec<GraphNodeId> {
        let mut ids = Vec::with_capacity(graph.nodes.len());

        for source in &graph.nodes {
            let id = GraphNodeId(self.nodes.len() as IndexType);
            let mut pins = Vec::with_capacity(source.pins.len());
            for pin in &source.pins {
                let pin_id = PinId(self.pins.len() as IndexType);
                self.pins.push(CompilationPin {
                    owner: id,
                    name: pin.name.clone(),
                    direction: pin.direction,
                    kind: pin.kind,
                    array_index: pin.array_index,
                    link: None,
                    default_literal: pin.default_literal.clone(),
                    sub_member: pin.sub_member.clone(),
                    value_kind: pin.value_kind.clone(),
                });
                pins.push(pin_id);
            }
            self.nodes.push(CompilationNode {
                source_guid: source.guid,
                graph_name: graph.name.clone(),
                graph_kind: graph.kind,
                variant: source.variant.clone(),
                pins,
                removed: false,
            });
            ids.push(id);
        }

        // Second pass: connect links now that every node of the batch has
        // an arena id.
        for (source, id) in graph.nodes.iter().zip(ids.iter()) {
            for (pin_index, pin) in source.pins.iter().enumerate() {
                let Some(link) = &pin.link else { continue };
                let Some(target) = graph.nodes.iter().position(|node| node.guid == link.node)
                else {
                    continue;
                };
                let target_id = ids[target];
                let linked = self.find_output_pin(target_id, &link.pin);
                let pin_id = self.node(*id).pins[pin_index];
                self.pins[pin_id.0 as usize].link = linked;
            }
        }

        ids
    }

    pub fn input_pins(&self, id: GraphNodeId) -> impl Iterator<Item = PinId> + '_ {
        self.node(id)
            .pins
            .iter()
            .copied()
            .filter(move |pin| self.pin(*pin).direction == PinDirection::Input)
    }

    pub fn output_pins(&self, id: GraphNodeId) -> impl Iterator<Item = PinId> + '_ {
        self.node(id)
            .pins
            .iter()
            .copied()
            .filter(move |pin| self.pin(*pin).direction == PinDirection::Output)
    }

    pub fn find_output_pin(&self, id: GraphNodeId, name: &str) -> Option<PinId> {
        self.output_pins(id).find(|pin| self.pin(*pin).name == name)
    }

    pub fn first_input_pin(&self, id: GraphNodeId, kind: PinKind) -> Option<PinId> {
        self.input_pins(id).find(|pin| self.pin(*pin).kind == kind)
    }

    /// Resolve the producer behind an input pin, transparently skipping
    /// reroute nodes. Returns the producing node and its output pin.
    pub fn follow_link(&self, pin: PinId) -> Option<(GraphNodeId, PinId)> {
        let mut current = self.pin(pin).link?;
        // Bounded by the pin count so a malformed reroute loop terminates.
        for _ in 0..=self.pins.len() {
            let owner = self.pin(current).owner;
            if self.node(owner).removed {
                return None;
            }
            if !matches!(self.node(owner).variant, NodeVariant::Reroute) {
                return Some((owner, current));
            }
            let input = self.first_input_pin(owner, self.pin(current).kind)?;
            current = self.pin(input).link?;
        }
        None
    }

    /// Producer nodes feeding any of this node's inputs, pose or value.
    pub fn producers(&self, id: GraphNodeId) -> Vec<GraphNodeId> {
        let mut producers = Vec::new();
        for pin in self.input_pins(id) {
            if let Some((producer, _)) = self.follow_link(pin) {
                producers.push(producer);
            }
        }
        producers
    }

    /// Producer nodes feeding this node's pose inputs.
    pub fn pose_producers(&self, id: GraphNodeId) -> Vec<GraphNodeId> {
        let mut producers = Vec::new();
        for pin in self.input_pins(id) {
            if self.pin(pin).kind != PinKind::Pose {
                continue;
            }
            if let Some((producer, _)) = self.follow_link(pin) {
                producers.push(producer);
            }
        }
        producers
    }

    /// Disconnect a node and mark it removed. Links from surviving nodes
    /// into the removed node are cleared.
    pub fn remove_node(&mut self, id: GraphNodeId) {
        let pins: Vec<PinId> = self.node(id).pins.clone();
        for pin in &mut self.pins {
            if let Some(link) = pin.link {
                if pins.contains(&link) {
                    pin.link = None;
                }
            }
        }
        self.node_mut(id).removed = true;
    }
}
