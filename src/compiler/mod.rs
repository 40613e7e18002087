use std::collections::{HashMap, HashSet};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::{MachineIndex, NodeIndex, StateIndex, TransitionIndex};
use crate::{
    BlendDocument, ClassFieldKind, CompiledGetter, CompilerLog, FieldKind, GeneratedClass,
    GetterKind, GraphRef, IndexType, LayoutRegistry, NodeVariant, PinKind, SubInstanceInfo,
};

pub mod cached_pose;
pub mod graph;
pub mod handlers;
pub mod machines;
pub mod patch;

#[cfg(test)]
mod tests;

pub use graph::{CompilationNode, CompilationPin, ConsolidatedGraph, GraphNodeId, PinId};
pub use handlers::{ConstantRecord, FastPathSource, HandlerRecord, WorkingCopy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Gates the fast path classification of copy records. When disabled
    /// every handler falls back to a named update function.
    pub optimize_member_variable_access: bool,
    /// Allow the compiled instance to update on worker threads unless a
    /// node or handler demotes it.
    pub allow_worker_thread_update: bool,
    /// Dump the cached pose ordering through `log::debug!`.
    pub debug_cached_pose_ordering: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimize_member_variable_access: true,
            allow_worker_thread_update: true,
            debug_cached_pose_ordering: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("document '{0}' has no skeleton asset")]
    MissingSkeleton(String),
}

/// Output of one compile invocation. Hard errors leave the class
/// unfinished; `is_success` tells the two apart.
#[derive(Debug, Clone)]
pub struct CompiledBlueprint {
    pub class: GeneratedClass,
    pub log: CompilerLog,
}

impl CompiledBlueprint {
    pub fn is_success(&self) -> bool {
        !self.log.has_errors()
    }
}

/// Pending pose link: the consumer's field must receive the producer's
/// allocation index during default object patching.
#[derive(Debug, Clone)]
pub struct PoseLinkRecord {
    pub consumer: GraphNodeId,
    pub producer: GraphNodeId,
    pub field: String,
    pub array_index: Option<IndexType>,
}

/// Where a getter was discovered, for queries about the "current" state or
/// transition.
#[derive(Debug, Default, Copy, Clone)]
pub struct GetterContext {
    pub machine: Option<MachineIndex>,
    pub state: Option<StateIndex>,
    pub transition: Option<TransitionIndex>,
}

/// Session side table for one baked machine, kept for getter wiring and
/// cached pose traversal.
#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub node: GraphNodeId,
    pub machine_index: MachineIndex,
    pub state_by_guid: Vec<(Uuid, StateIndex)>,
    /// Arena ids of the compiled state result nodes.
    pub state_results: Vec<GraphNodeId>,
    /// States whose inner graph is a single asset player passthrough.
    pub simple_players: Vec<(StateIndex, NodeIndex)>,
}

/// Result of merging an owned sub-graph into the consolidated arena.
pub struct ExpandedGraph {
    pub nodes: Vec<GraphNodeId>,
    pub result: GraphNodeId,
    pub result_index: NodeIndex,
}

/// All mutable compiler state for one invocation, passed by reference
/// through every stage. No process wide statics.
pub struct CompilationSession<'a> {
    pub document: &'a BlendDocument,
    pub registry: &'a LayoutRegistry,
    pub options: CompileOptions,
    pub graph: ConsolidatedGraph,
    pub class: GeneratedClass,
    pub log: CompilerLog,

    pub allocated: HashMap<GraphNodeId, NodeIndex>,
    /// Dense: position is the allocation index.
    pub allocation_order: Vec<GraphNodeId>,
    /// First allocation per authored node, stable across clones.
    pub allocated_by_source: HashMap<Uuid, NodeIndex>,

    pub pose_links: Vec<PoseLinkRecord>,
    pub handlers: Vec<HandlerRecord>,
    pub constants: Vec<ConstantRecord>,
    pub handler_names: HashSet<String>,

    pub saved_poses: HashMap<String, GraphNodeId>,
    pub root_nodes: Vec<GraphNodeId>,
    pub getters: Vec<(GraphNodeId, GetterContext)>,
    pub machines: Vec<MachineRecord>,
}

/// Compile an authored document into a generated class. Only a missing
/// skeleton aborts; everything else is reported through the log and gates
/// the stages that need a consistent graph.
pub fn compile(
    document: &BlendDocument,
    registry: &LayoutRegistry,
    options: CompileOptions,
) -> Result<CompiledBlueprint, CompileError> {
    if document.skeleton.is_none() {
        return Err(CompileError::MissingSkeleton(document.name.clone()));
    }

    let mut session = CompilationSession {
        document,
        registry,
        options,
        graph: ConsolidatedGraph::default(),
        class: GeneratedClass::new(&document.name),
        log: CompilerLog::default(),
        allocated: HashMap::new(),
        allocation_order: Vec::new(),
        allocated_by_source: HashMap::new(),
        pose_links: Vec::new(),
        handlers: Vec::new(),
        constants: Vec::new(),
        handler_names: HashSet::new(),
        saved_poses: HashMap::new(),
        root_nodes: Vec::new(),
        getters: Vec::new(),
        machines: Vec::new(),
    };

    session.create_class_variables();
    session.process_root_graphs();
    session.scan_sub_instances();
    session.wire_getters();

    if !session.log.has_errors() {
        cached_pose::order_cached_poses(&mut session);
    }
    if !session.log.has_errors() {
        patch::finalize(&mut session);
    }
    if !session.log.has_errors() {
        if let Err(error) = session.class.validate() {
            session
                .log
                .error(format!("compiled class failed validation: {error}"), []);
        }
    }

    Ok(CompiledBlueprint {
        class: session.class,
        log: session.log,
    })
}

impl<'a> CompilationSession<'a> {
    fn create_class_variables(&mut self) {
        for variable in &self.document.variables {
            let created = self.class.create_named_field(
                &variable.name,
                ClassFieldKind::Value(variable.kind.clone()),
                self.registry,
            );
            match created {
                Ok(Some(field)) => {
                    if variable.default_literal.is_empty() {
                        continue;
                    }
                    let offset = self.class.field(field).map(|f| f.offset).unwrap_or(0);
                    if let Err(error) = self.class.parse_literal_into_field(
                        &variable.kind,
                        &variable.default_literal,
                        offset,
                        self.registry,
                    ) {
                        self.log.error(
                            format!(
                                "Failed to set default for variable '{}': {error}",
                                variable.name
                            ),
                            [],
                        );
                    }
                }
                Ok(None) => self.log.error(
                    format!("Duplicate variable name '{}'", variable.name),
                    [],
                ),
                Err(error) => self.log.error(
                    format!("Variable '{}' has an invalid type: {error}", variable.name),
                    [],
                ),
            }
        }
    }

    fn process_root_graphs(&mut self) {
        let mut merged = Vec::new();
        for (_, source) in self.document.root_graphs() {
            let ids = self.graph.merge_graph(source);
            self.register_merged(&ids, GetterContext::default());
            merged.extend(ids);
        }

        let roots: Vec<GraphNodeId> = merged
            .iter()
            .copied()
            .filter(|id| self.graph.node(*id).variant.is_true_root())
            .collect();
        self.root_nodes = roots.clone();

        let mut root_set = roots;
        root_set.extend(merged.iter().copied().filter(|id| {
            matches!(
                self.graph.node(*id).variant,
                NodeVariant::SaveCachedPose { .. }
            )
        }));

        if root_set.is_empty() {
            self.log.error("Blend graph has no root node", []);
        }

        if !self.log.has_errors() {
            self.prune_isolated(&merged, &root_set);
        }

        for id in merged {
            if !self.graph.node(id).removed && self.graph.node(id).variant.is_animation_node() {
                self.process_node(id);
            }
        }
    }

    /// Register cache producers and defer getters as soon as nodes enter
    /// the arena.
    pub(crate) fn register_merged(&mut self, ids: &[GraphNodeId], context: GetterContext) {
        for id in ids {
            let node = self.graph.node(*id);
            match &node.variant {
                NodeVariant::SaveCachedPose { cache_name } => {
                    let guid = node.source_guid;
                    let cache_name = cache_name.clone();
                    if let Some(existing) = self.saved_poses.get(&cache_name) {
                        // A re-merged clone of the same authored node is
                        // not a conflict.
                        if self.graph.node(*existing).source_guid != guid {
                            self.log.error(
                                format!(
                                    "Multiple SaveCachedPose nodes are named '{cache_name}'"
                                ),
                                [guid],
                            );
                        }
                    } else {
                        self.saved_poses.insert(cache_name, *id);
                    }
                }
                NodeVariant::Getter(_) => self.getters.push((*id, context)),
                _ => {}
            }
        }
    }

    /// Reachability walk from the root set over pose and value links, so a
    /// kept node's whole upstream expression stays live. Unvisited nodes
    /// that are neither pure nor protected are disconnected.
    pub(crate) fn prune_isolated(&mut self, candidates: &[GraphNodeId], roots: &[GraphNodeId]) {
        let mut visited: HashSet<GraphNodeId> = HashSet::new();
        let mut stack: Vec<GraphNodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if visited.insert(id) {
                stack.extend(self.graph.producers(id));
            }
        }

        for id in candidates {
            if visited.contains(id) {
                continue;
            }
            let variant = &self.graph.node(*id).variant;
            if variant.is_pure() || variant.survives_pruning() {
                continue;
            }
            self.graph.remove_node(*id);
        }
    }

    /// Allocate a class field and a dense index for an animation node.
    pub(crate) fn allocate_node(&mut self, id: GraphNodeId) -> Option<NodeIndex> {
        if let Some(index) = self.allocated.get(&id) {
            return Some(*index);
        }
        let node = self.graph.node(id);
        let guid = node.source_guid;
        let Some(struct_name) = node.variant.runtime_struct() else {
            self.log.error(
                format!(
                    "Node '{}' has no runtime struct and cannot be allocated",
                    node.variant.class_name()
                ),
                [guid],
            );
            return None;
        };
        if let Err(error) = self.registry.node(struct_name) {
            self.log
                .error(format!("Node cannot be compiled: {error}"), [guid]);
            return None;
        }

        let index = NodeIndex(self.allocation_order.len() as IndexType);
        let field_name = format!("{}_{}", struct_name, index.0);
        match self.class.create_named_field(
            &field_name,
            ClassFieldKind::Node(struct_name.to_string()),
            self.registry,
        ) {
            Ok(Some(field)) => {
                self.class.animation_nodes.push(field);
            }
            Ok(None) => {
                self.log.error(
                    format!("Field name '{field_name}' is already taken"),
                    [guid],
                );
                return None;
            }
            Err(error) => {
                self.log
                    .error(format!("Failed to allocate node field: {error}"), [guid]);
                return None;
            }
        }

        self.allocated.insert(id, index);
        self.allocation_order.push(id);
        self.allocated_by_source.entry(guid).or_insert(index);
        self.class.node_guids.entry(guid).or_insert(index);
        Some(index)
    }

    /// Allocate and process one animation node: resolve its pose links,
    /// partition its value pins and dispatch variant specific work.
    pub(crate) fn process_node(&mut self, id: GraphNodeId) {
        if self.allocated.contains_key(&id) || self.graph.node(id).removed {
            return;
        }
        if self.allocate_node(id).is_none() {
            return;
        }

        let variant = self.graph.node(id).variant.clone();
        match &variant {
            NodeVariant::StateMachine { machine } => machines::bake_machine(self, id, *machine),
            NodeVariant::UseCachedPose { cache_name } => self.link_cached_pose(id, cache_name),
            NodeVariant::SubInput { input_name } => self.expose_sub_input(id, input_name),
            _ => {}
        }

        self.resolve_pose_links(id);
        handlers::build_handler(self, id);
    }

    fn link_cached_pose(&mut self, id: GraphNodeId, cache_name: &str) {
        match self.saved_poses.get(cache_name) {
            Some(save) => self.pose_links.push(PoseLinkRecord {
                consumer: id,
                producer: *save,
                field: "source".to_string(),
                array_index: None,
            }),
            None => self.log.error(
                format!("No SaveCachedPose node found for cache '{cache_name}'"),
                [self.graph.node(id).source_guid],
            ),
        }
    }

    /// Sub-graph inputs surface their value outputs as class fields so
    /// external callers (and fast paths) can address them by name.
    fn expose_sub_input(&mut self, id: GraphNodeId, input_name: &str) {
        let pins: Vec<PinId> = self.graph.output_pins(id).collect();
        for pin_id in pins {
            let pin = self.graph.pin(pin_id);
            if pin.kind != PinKind::Value {
                continue;
            }
            let kind = pin.value_kind.clone().unwrap_or(FieldKind::F32);
            let field_name = format!("{}_{}", input_name, pin.name);
            if let Err(error) =
                self.class
                    .create_named_field(&field_name, ClassFieldKind::Value(kind), self.registry)
            {
                self.log.error(
                    format!("Failed to expose input '{field_name}': {error}"),
                    [self.graph.node(id).source_guid],
                );
            }
        }
    }

    /// Record a pending link for every connected pose input. The field
    /// locus is validated now; the index is written during patching.
    fn resolve_pose_links(&mut self, id: GraphNodeId) {
        let node = self.graph.node(id);
        let guid = node.source_guid;
        let Some(struct_name) = node.variant.runtime_struct() else {
            return;
        };
        let Ok(layout) = self.registry.node(struct_name).cloned() else {
            return;
        };

        let pins: Vec<PinId> = self.graph.input_pins(id).collect();
        for pin_id in pins {
            let pin = self.graph.pin(pin_id);
            if pin.kind != PinKind::Pose {
                continue;
            }
            let field = pin.name.clone();
            let array_index = pin.array_index;
            if let Err(error) = layout.pose_link_location(self.registry, &field, array_index) {
                self.log.error(
                    format!("Pose pin '{field}' has no storage location: {error}"),
                    [guid],
                );
                continue;
            }
            if let Some((producer, _)) = self.graph.follow_link(pin_id) {
                self.pose_links.push(PoseLinkRecord {
                    consumer: id,
                    producer,
                    field,
                    array_index,
                });
            }
        }
    }

    /// Merge an owned sub-graph, prune it against its own result node and
    /// process what remains. Returns the compiled result's allocation.
    pub(crate) fn expand_inner_graph(
        &mut self,
        graph_ref: GraphRef,
        is_result: fn(&NodeVariant) -> bool,
        context: GetterContext,
    ) -> Option<ExpandedGraph> {
        let Some(source) = self.document.graph(graph_ref) else {
            self.log
                .error(format!("Missing bound graph {:?}", graph_ref), []);
            return None;
        };
        let name = source.name.clone();
        let ids = self.graph.merge_graph(source);
        self.register_merged(&ids, context);

        let Some(result) = ids
            .iter()
            .copied()
            .find(|id| is_result(&self.graph.node(*id).variant))
        else {
            self.log
                .error(format!("Graph '{name}' has no result node"), []);
            return None;
        };

        let mut root_set = vec![result];
        root_set.extend(ids.iter().copied().filter(|id| {
            matches!(
                self.graph.node(*id).variant,
                NodeVariant::SaveCachedPose { .. }
            )
        }));
        if !self.log.has_errors() {
            self.prune_isolated(&ids, &root_set);
        }

        for id in &ids {
            if !self.graph.node(*id).removed && self.graph.node(*id).variant.is_animation_node() {
                self.process_node(*id);
            }
        }

        let result_index = self.allocated.get(&result).copied()?;
        Some(ExpandedGraph {
            nodes: ids,
            result,
            result_index,
        })
    }

    /// Deferred getter resolution, once every allocation and baked index
    /// is known.
    fn wire_getters(&mut self) {
        let found = std::mem::take(&mut self.getters);
        for (id, context) in found {
            let node = self.graph.node(id);
            if node.removed {
                continue;
            }
            let NodeVariant::Getter(data) = node.variant.clone() else {
                continue;
            };
            let guid = node.source_guid;

            let getter = match data.kind {
                GetterKind::AssetPlayerTime
                | GetterKind::AssetPlayerLength
                | GetterKind::AssetPlayerTimeFromEnd => {
                    let Some(source) = data.source_node else {
                        self.log
                            .error("Getter has no source asset player", [guid]);
                        continue;
                    };
                    let Some(index) = self.allocated_by_source.get(&source).copied() else {
                        self.log.error(
                            "Getter references a node that failed to allocate",
                            [guid, source],
                        );
                        continue;
                    };
                    let arena = self.allocation_order[index.0 as usize];
                    if !self.graph.node(arena).variant.supports_time_query() {
                        self.log
                            .error("Getter source does not support time queries", [guid, source]);
                        continue;
                    }
                    CompiledGetter {
                        kind: data.kind,
                        source_node: Some(index),
                        machine: context.machine,
                        state: None,
                        transition: None,
                    }
                }
                GetterKind::StateWeight => {
                    let Some(state_guid) = data.source_state else {
                        self.log.error("Getter has no source state", [guid]);
                        continue;
                    };
                    let Some((machine, state)) = self.find_state(state_guid) else {
                        self.log
                            .error("Getter references an unknown state", [guid, state_guid]);
                        continue;
                    };
                    CompiledGetter {
                        kind: data.kind,
                        source_node: None,
                        machine: Some(machine),
                        state: Some(state),
                        transition: None,
                    }
                }
                GetterKind::CurrentStateElapsedTime => {
                    let (Some(machine), Some(state)) = (context.machine, context.state) else {
                        self.log.error(
                            "Getter requires a state machine transition context",
                            [guid],
                        );
                        continue;
                    };
                    CompiledGetter {
                        kind: data.kind,
                        source_node: None,
                        machine: Some(machine),
                        state: Some(state),
                        transition: context.transition,
                    }
                }
                GetterKind::TransitionCrossfadeDuration => {
                    let (Some(machine), Some(transition)) = (context.machine, context.transition)
                    else {
                        self.log
                            .error("Getter requires a transition context", [guid]);
                        continue;
                    };
                    CompiledGetter {
                        kind: data.kind,
                        source_node: None,
                        machine: Some(machine),
                        state: context.state,
                        transition: Some(transition),
                    }
                }
            };

            self.class.getters.push(getter);
        }
    }

    fn find_state(&self, guid: Uuid) -> Option<(MachineIndex, StateIndex)> {
        for record in &self.machines {
            if let Some((_, state)) = record
                .state_by_guid
                .iter()
                .find(|(candidate, _)| *candidate == guid)
            {
                return Some((record.machine_index, *state));
            }
        }
        None
    }

    /// Warn about slot and machine names reused across the sub-instance
    /// delegation chain. The ancestor chain guards against class cycles;
    /// plain revisits of a class in sibling branches are legal.
    fn scan_sub_instances(&mut self) {
        let mut slots: HashMap<String, String> = HashMap::new();
        let mut machine_names: HashMap<String, String> = HashMap::new();
        for source in &self.document.graphs {
            if source.kind == crate::GraphKind::StateMachine {
                machine_names.insert(source.name.clone(), self.document.name.clone());
            }
        }

        for id in 0..self.graph.nodes.len() {
            let node = &self.graph.nodes[id];
            if node.removed {
                continue;
            }
            if let NodeVariant::SubInstance { info } = &node.variant {
                let info = info.clone();
                let guid = node.source_guid;
                let mut chain = Vec::new();
                scan_sub_instance_info(
                    &info,
                    &mut chain,
                    &mut slots,
                    &mut machine_names,
                    &mut self.log,
                    guid,
                );
            }
        }
    }
}

fn scan_sub_instance_info(
    info: &SubInstanceInfo,
    chain: &mut Vec<String>,
    slots: &mut HashMap<String, String>,
    machine_names: &mut HashMap<String, String>,
    log: &mut CompilerLog,
    guid: Uuid,
) {
    if chain.iter().any(|class| class == &info.target_class) {
        log.warning(
            format!(
                "Recursive sub instance chain through class '{}'",
                info.target_class
            ),
            [guid],
        );
        return;
    }

    for slot in &info.slot_names {
        match slots.get(slot) {
            Some(owner) => log.warning(
                format!("Duplicated slot name '{slot}' also used by '{owner}'"),
                [guid],
            ),
            None => {
                slots.insert(slot.clone(), info.target_class.clone());
            }
        }
    }
    for machine in &info.machine_names {
        match machine_names.get(machine) {
            Some(owner) => log.warning(
                format!("Duplicated state machine name '{machine}' also used by '{owner}'"),
                [guid],
            ),
            None => {
                machine_names.insert(machine.clone(), info.target_class.clone());
            }
        }
    }

    chain.push(info.target_class.clone());
    for nested in &info.nested {
        scan_sub_instance_info(nested, chain, slots, machine_names, log, guid);
    }
    chain.pop();
}
