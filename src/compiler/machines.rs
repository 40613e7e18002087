use std::collections::HashMap;

use uuid::Uuid;

use crate::compiler::graph::GraphNodeId;
use crate::compiler::{CompilationSession, GetterContext, MachineRecord};
use crate::state_machine::{
    BakedState, BakedStateExit, BakedStateMachine, BakedTransition, MachineIndex, NodeIndex,
    NotifyIndex, StateIndex, TransitionIndex,
};
use crate::{
    GeneratedClass, GraphRef, IndexType, NodeVariant, NotifyRef, StateNodeData, TransitionNodeData,
};

/// Bake one authored state machine graph into its flattened runtime form.
/// Two passes: states and transitions are created first, then rule graphs
/// are compiled once every sibling state exists, because rules may contain
/// getters referencing any of them.
pub fn bake_machine(session: &mut CompilationSession<'_>, owner: GraphNodeId, machine: GraphRef) {
    let owner_guid = session.graph.node(owner).source_guid;
    let Some(source) = session.document.graph(machine) else {
        session
            .log
            .error("State machine node has no bound graph", [owner_guid]);
        return;
    };
    let source = source.clone();

    let machine_index = MachineIndex(session.class.state_machines.len() as IndexType);
    // Reserve the slot now so machines nested in state graphs bake to
    // later indices.
    session.class.state_machines.push(BakedStateMachine {
        name: source.name.clone(),
        ..Default::default()
    });

    let mut baked = BakedStateMachine {
        name: source.name.clone(),
        ..Default::default()
    };
    let mut record = MachineRecord {
        node: owner,
        machine_index,
        state_by_guid: Vec::new(),
        state_results: Vec::new(),
        simple_players: Vec::new(),
    };
    let mut transition_data: Vec<(Uuid, TransitionIndex, TransitionNodeData)> = Vec::new();

    // First pass.
    for node in &source.nodes {
        match &node.variant {
            NodeVariant::Entry { target } => {
                bake_entry(session, &source.name, &mut baked, &mut record, node.guid, *target,
                    &source);
            }
            NodeVariant::State(data) => {
                let state = find_or_add_state(&mut baked, &mut record, node.guid);
                bake_state(session, machine_index, &mut baked, &mut record, state, data);
            }
            NodeVariant::Conduit { name, rule } => {
                let state = find_or_add_state(&mut baked, &mut record, node.guid);
                let slot = &mut baked.states[state.0 as usize];
                slot.name = name.clone();
                slot.is_conduit = true;
                let context = GetterContext {
                    machine: Some(machine_index),
                    state: Some(state),
                    transition: None,
                };
                if let Some(expanded) = session.expand_inner_graph(
                    *rule,
                    |variant| matches!(variant, NodeVariant::TransitionResult),
                    context,
                ) {
                    baked.states[state.0 as usize].root_node = Some(expanded.result_index);
                }
            }
            NodeVariant::Transition(data) => {
                let transition =
                    bake_transition(session, &source, &mut baked, &mut record, node.guid, data);
                let index = TransitionIndex(baked.transitions.len() as IndexType);
                baked.transitions.push(transition);
                transition_data.push((node.guid, index, data.clone()));
            }
            _ => {}
        }
    }

    // Second pass: rule and custom blend graphs, and per state asset
    // player collection for getters.
    let mut shared_rules: HashMap<GraphRef, Option<NodeIndex>> = HashMap::new();
    for position in 0..record.state_by_guid.len() {
        let (state_guid, state) = record.state_by_guid[position];

        if let Some(NodeVariant::State(data)) = source
            .nodes
            .iter()
            .find(|node| node.guid == state_guid)
            .map(|node| &node.variant)
        {
            collect_state_players(session, &mut baked.states[state.0 as usize], data);
        }

        let mut outgoing: Vec<(Uuid, TransitionIndex, TransitionNodeData)> = transition_data
            .iter()
            .filter(|(_, _, data)| data.previous_state == Some(state_guid))
            .filter(|(_, index, _)| baked.transitions[index.0 as usize].previous_state.is_some())
            .map(|(guid, index, data)| (*guid, *index, data.clone()))
            .collect();
        outgoing.sort_by_key(|(_, _, data)| data.priority_order);

        for (transition_guid, transition, data) in outgoing {
            if data.automatic_rule
                && !record
                    .simple_players
                    .iter()
                    .any(|(simple, _)| *simple == state)
            {
                session.log.warning(
                    format!(
                        "Automatic rule leaving '{}' requires the state to play a single asset",
                        baked.states[state.0 as usize].name
                    ),
                    [transition_guid],
                );
            }

            let context = GetterContext {
                machine: Some(machine_index),
                state: Some(state),
                transition: Some(transition),
            };

            let can_take_node = *shared_rules.entry(data.rule).or_insert_with(|| {
                session
                    .expand_inner_graph(
                        data.rule,
                        |variant| matches!(variant, NodeVariant::TransitionResult),
                        context,
                    )
                    .map(|expanded| expanded.result_index)
            });

            let mut custom_result_node = None;
            let mut pose_evaluator_nodes = Vec::new();
            if let Some(blend) = data.custom_blend {
                if let Some(expanded) = session.expand_inner_graph(
                    blend,
                    |variant| matches!(variant, NodeVariant::CustomBlendResult),
                    context,
                ) {
                    custom_result_node = Some(expanded.result_index);
                    for id in &expanded.nodes {
                        let node = session.graph.node(*id);
                        if matches!(node.variant, NodeVariant::PoseEvaluator) && !node.removed {
                            if let Some(index) = session.allocated.get(id) {
                                pose_evaluator_nodes.push(*index);
                            }
                        }
                    }
                }
            }

            baked.states[state.0 as usize]
                .transitions
                .push(BakedStateExit {
                    transition,
                    can_take_node,
                    custom_result_node,
                    pose_evaluator_nodes,
                    automatic_remaining_time_rule: data.automatic_rule,
                });
        }
    }

    // Validation.
    if baked.initial_state.is_none() {
        if baked.states.is_empty() {
            session
                .log
                .error(format!("State machine '{}' has no states", source.name), [owner_guid]);
        } else {
            session.log.warning(
                format!(
                    "State machine '{}' has no entry connection, defaulting to state 0",
                    source.name
                ),
                [owner_guid],
            );
            baked.initial_state = Some(StateIndex(0));
        }
    }
    if let Some(initial) = baked.initial_state {
        if baked
            .state(initial)
            .map(|state| state.is_conduit)
            .unwrap_or(false)
        {
            session.log.error(
                format!(
                    "State machine '{}' has a conduit as its entry state",
                    source.name
                ),
                [owner_guid],
            );
        }
    }

    session.class.state_machines[machine_index.0 as usize] = baked;
    session.machines.push(record);
}

fn bake_entry(
    session: &mut CompilationSession<'_>,
    machine_name: &str,
    baked: &mut BakedStateMachine,
    record: &mut MachineRecord,
    entry_guid: Uuid,
    target: Option<Uuid>,
    source: &crate::SourceGraph,
) {
    if baked.initial_state.is_some() {
        session.log.error(
            format!("State machine '{machine_name}' has multiple entry nodes"),
            [entry_guid],
        );
        return;
    }
    match target {
        Some(target) => {
            if find_state_node(source, target).is_some() {
                let state = find_or_add_state(baked, record, target);
                baked.initial_state = Some(state);
            } else {
                session.log.error(
                    format!("Entry of '{machine_name}' is connected to a missing state"),
                    [entry_guid],
                );
            }
        }
        None => session.log.warning(
            format!("Entry node of '{machine_name}' is not connected"),
            [entry_guid],
        ),
    }
}

fn bake_state(
    session: &mut CompilationSession<'_>,
    machine_index: MachineIndex,
    baked: &mut BakedStateMachine,
    record: &mut MachineRecord,
    state: StateIndex,
    data: &StateNodeData,
) {
    {
        let slot = &mut baked.states[state.0 as usize];
        slot.name = data.name.clone();
        slot.always_reset_on_entry = data.always_reset_on_entry;
        slot.entered_notify = bake_notify(&mut session.class, &data.entered_notify);
        slot.left_notify = bake_notify(&mut session.class, &data.left_notify);
        slot.fully_blended_notify = bake_notify(&mut session.class, &data.fully_blended_notify);
    }

    let context = GetterContext {
        machine: Some(machine_index),
        state: Some(state),
        transition: None,
    };
    if let Some(expanded) = session.expand_inner_graph(
        data.graph,
        |variant| matches!(variant, NodeVariant::StateResult),
        context,
    ) {
        baked.states[state.0 as usize].root_node = Some(expanded.result_index);
        record.state_results.push(expanded.result);

        let producers = session.graph.pose_producers(expanded.result);
        if let [player] = producers.as_slice() {
            if session.graph.node(*player).variant.is_asset_player() {
                if let Some(index) = session.allocated.get(player) {
                    record.simple_players.push((state, *index));
                }
            }
        }
    }
}

fn bake_transition(
    session: &mut CompilationSession<'_>,
    source: &crate::SourceGraph,
    baked: &mut BakedStateMachine,
    record: &mut MachineRecord,
    guid: Uuid,
    data: &TransitionNodeData,
) -> BakedTransition {
    let mut transition = BakedTransition {
        crossfade_duration: data.crossfade_duration,
        blend_mode: data.blend_mode,
        custom_blend_curve: data.custom_blend_curve.clone(),
        blend_profile: data.blend_profile.clone(),
        start_notify: bake_notify(&mut session.class, &data.start_notify),
        end_notify: bake_notify(&mut session.class, &data.end_notify),
        interrupt_notify: bake_notify(&mut session.class, &data.interrupt_notify),
        ..Default::default()
    };

    let previous = data.previous_state.filter(|g| find_state_node(source, *g).is_some());
    let next = data.next_state.filter(|g| find_state_node(source, *g).is_some());
    match (previous, next) {
        (Some(previous), Some(next)) => {
            transition.previous_state = Some(find_or_add_state(baked, record, previous));
            transition.next_state = Some(find_or_add_state(baked, record, next));
        }
        _ => {
            session.log.warning(
                "Transition is missing a connected state on one side",
                [guid],
            );
        }
    }

    if data.bidirectional {
        session.log.warning(
            "Bidirectional transitions are not supported, compiling as one directional",
            [guid],
        );
    }

    transition
}

fn find_state_node(source: &crate::SourceGraph, guid: Uuid) -> Option<&crate::SourceNode> {
    source.nodes.iter().find(|node| {
        node.guid == guid
            && matches!(
                node.variant,
                NodeVariant::State(_) | NodeVariant::Conduit { .. }
            )
    })
}

fn find_or_add_state(
    baked: &mut BakedStateMachine,
    record: &mut MachineRecord,
    guid: Uuid,
) -> StateIndex {
    if let Some((_, state)) = record
        .state_by_guid
        .iter()
        .find(|(candidate, _)| *candidate == guid)
    {
        return *state;
    }
    let state = StateIndex(baked.states.len() as IndexType);
    baked.states.push(BakedState::default());
    record.state_by_guid.push((guid, state));
    state
}

fn bake_notify(class: &mut GeneratedClass, notify: &Option<NotifyRef>) -> Option<NotifyIndex> {
    let notify = notify.as_ref()?;
    Some(find_or_add_notify(class, notify))
}

/// Intern a notify triple into the class table, deduplicated by full
/// equality.
pub fn find_or_add_notify(class: &mut GeneratedClass, notify: &NotifyRef) -> NotifyIndex {
    if let Some(position) = class.notifies.iter().position(|existing| {
        existing.name == notify.name
            && existing.event_asset == notify.event_asset
            && existing.state_asset == notify.state_asset
    }) {
        return NotifyIndex(position as IndexType);
    }
    class.notifies.push(crate::state_machine::BakedNotify {
        name: notify.name.clone(),
        event_asset: notify.event_asset.clone(),
        state_asset: notify.state_asset.clone(),
    });
    NotifyIndex((class.notifies.len() - 1) as IndexType)
}

/// Asset players inside the state's own graph, for getter queries. Nested
/// state machine contents are theirs, not ours.
fn collect_state_players(
    session: &CompilationSession<'_>,
    state: &mut BakedState,
    data: &StateNodeData,
) {
    let Some(graph) = session.document.graph(data.graph) else {
        return;
    };
    for node in &graph.nodes {
        if node.variant.is_asset_player() {
            if let Some(index) = session.allocated_by_source.get(&node.guid) {
                state.player_nodes.push(*index);
            }
        }
    }
}
