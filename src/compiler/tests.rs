use uuid::Uuid;

use super::*;
use crate::state_machine::{StateIndex, TransitionIndex};
use crate::{
    BlendMode, CallFunctionData, ClassVariable, FieldKind, GetterNodeData, GraphKind, NotifyRef,
    PostCopyOperation, Severity, SourceGraph, SourceNode, SourcePin, StateNodeData,
    SubInstanceInfo, TransitionNodeData,
};

fn compile_document(document: &BlendDocument) -> CompiledBlueprint {
    let registry = LayoutRegistry::with_default_nodes();
    compile(document, &registry, CompileOptions::default()).expect("Valid")
}

fn document_with(graphs: Vec<SourceGraph>, variables: Vec<ClassVariable>) -> BlendDocument {
    BlendDocument {
        name: "TestBlueprint".into(),
        skeleton: Some("TestSkeleton".into()),
        variables,
        graphs,
    }
}

fn variable(name: &str, kind: FieldKind) -> ClassVariable {
    ClassVariable {
        name: name.into(),
        kind,
        default_literal: String::new(),
    }
}

fn read_index(class: &GeneratedClass, node: NodeIndex, offset: usize) -> IndexType {
    let field = class.node_field(node).expect("Valid");
    let bytes = class.read_raw_bytes(field.offset + offset, 2).expect("Valid");
    IndexType::from_le_bytes(bytes.try_into().expect("Valid"))
}

fn read_f32(class: &GeneratedClass, node: NodeIndex, offset: usize) -> f32 {
    let field = class.node_field(node).expect("Valid");
    let bytes = class.read_raw_bytes(field.offset + offset, 4).expect("Valid");
    f32::from_le_bytes(bytes.try_into().expect("Valid"))
}

fn read_byte(class: &GeneratedClass, node: NodeIndex, offset: usize) -> u8 {
    let field = class.node_field(node).expect("Valid");
    class.read_raw_bytes(field.offset + offset, 1).expect("Valid")[0]
}

/// Root driving a sequence player whose `looping` pin is the negation of a
/// bool variable and whose `play_rate` pin holds an unconnected literal.
fn player_document() -> (BlendDocument, Uuid, Uuid) {
    let variable_get = SourceNode::new(NodeVariant::VariableGet {
        property: "inverted".into(),
        self_context: true,
    })
    .with_pin(SourcePin::output("value", PinKind::Value));
    let negate = SourceNode::new(NodeVariant::LogicalNot)
        .with_pin(SourcePin::input("in", PinKind::Value).linked_to(variable_get.guid, "value"))
        .with_pin(SourcePin::output("out", PinKind::Value));
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: true,
    })
    .with_pin(SourcePin::input("looping", PinKind::Value).linked_to(negate.guid, "out"))
    .with_pin(SourcePin::input("play_rate", PinKind::Value).with_default("2.0"))
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));

    let player_guid = player.guid;
    let root_guid = root.guid;
    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(variable_get)
        .with(negate)
        .with(player)
        .with(root);
    let document = document_with(vec![graph], vec![variable("inverted", FieldKind::Bool)]);
    (document, player_guid, root_guid)
}

#[test]
fn negated_variable_compiles_to_a_fast_path_handler() {
    let (document, player_guid, _) = player_document();
    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let class = &compiled.class;
    // Expression nodes never allocate; only the root and the player do.
    assert_eq!(class.animation_nodes.len(), 2);

    let player = class.node_guids[&player_guid];
    let [handler] = class.handlers.as_slice() else {
        panic!("expected one handler, got {:?}", class.handlers);
    };
    assert_eq!(handler.node, player);
    assert!(handler.is_fast_path());

    let [copy] = handler.copy_records.as_slice() else {
        panic!("expected one copy record, got {:?}", handler.copy_records);
    };
    assert_eq!(copy.source_property, "inverted");
    assert_eq!(copy.source_sub_member, None);
    assert_eq!(copy.dest_property, "looping");
    assert_eq!(copy.post_operation, PostCopyOperation::LogicalNegateBool);
    assert_eq!(copy.size, 1);
    assert!(!copy.instance_target);
}

#[test]
fn default_object_holds_patched_links_names_and_literals() {
    let (document, player_guid, root_guid) = player_document();
    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let class = &compiled.class;
    let root = class.node_guids[&root_guid];
    let player = class.node_guids[&player_guid];

    // RootNode: result link, then the interned graph name.
    assert_eq!(read_index(class, root, 0), player.0);
    let name = read_index(class, root, 2);
    assert_eq!(class.name(name), Some("Main"));

    // SequencePlayerNode: sequence name, play_rate literal, template bool.
    let sequence = read_index(class, player, 0);
    assert_eq!(class.name(sequence), Some("Idle"));
    assert_eq!(read_f32(class, player, 2), 2.0);
    assert_eq!(read_f32(class, player, 6), 0.0);
    assert_eq!(read_byte(class, player, 10), 1);
}

#[test]
fn recompiling_the_same_document_is_deterministic() {
    let (document, _, _) = player_document();
    let first = compile_document(&document);
    let second = compile_document(&document);
    assert!(first.is_success());

    let a = serde_json::to_string(&first.class).expect("Valid");
    let b = serde_json::to_string(&second.class).expect("Valid");
    assert_eq!(a, b);
}

#[test]
fn disabling_optimization_binds_every_handler() {
    let (document, _, _) = player_document();
    let registry = LayoutRegistry::with_default_nodes();
    let options = CompileOptions {
        optimize_member_variable_access: false,
        ..Default::default()
    };
    let compiled = compile(&document, &registry, options).expect("Valid");
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let [handler] = compiled.class.handlers.as_slice() else {
        panic!("expected one handler");
    };
    assert!(!handler.is_fast_path());
    let name = handler.bound_function.as_deref().expect("Valid");
    assert!(name.starts_with("EvaluateGraphExposedInputs_Main_SequencePlayer_"));
    assert!(handler.copy_records.is_empty());
}

#[test]
fn fast_path_requires_matching_byte_sizes() {
    // A bool variable wired into the f32 play_rate pin matches the variable
    // get pattern but fails size validation during patching.
    let variable_get = SourceNode::new(NodeVariant::VariableGet {
        property: "flag".into(),
        self_context: true,
    })
    .with_pin(SourcePin::output("value", PinKind::Value));
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: false,
    })
    .with_pin(SourcePin::input("play_rate", PinKind::Value).linked_to(variable_get.guid, "value"))
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(variable_get)
        .with(player)
        .with(root);
    let document = document_with(vec![graph], vec![variable("flag", FieldKind::Bool)]);

    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());
    let [handler] = compiled.class.handlers.as_slice() else {
        panic!("expected one handler");
    };
    assert!(!handler.is_fast_path());
}

#[test]
fn split_vector_members_qualify_as_fast_path() {
    let variable_get = SourceNode::new(NodeVariant::VariableGet {
        property: "direction".into(),
        self_context: true,
    })
    .with_pin(SourcePin::output("value", PinKind::Value));
    let break_node = SourceNode::new(NodeVariant::NativeBreak {
        function: "BreakVector".into(),
    })
    .with_pin(SourcePin::input("in", PinKind::Value).linked_to(variable_get.guid, "value"))
    .with_pin(SourcePin::output("x", PinKind::Value));
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: false,
    })
    .with_pin(SourcePin::input("play_rate", PinKind::Value).linked_to(break_node.guid, "x"))
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(variable_get)
        .with(break_node)
        .with(player)
        .with(root);
    let document = document_with(vec![graph], vec![variable("direction", FieldKind::Vector)]);

    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());
    let [handler] = compiled.class.handlers.as_slice() else {
        panic!("expected one handler");
    };
    assert!(handler.is_fast_path());
    let copy = &handler.copy_records[0];
    assert_eq!(copy.source_property, "direction");
    assert_eq!(copy.source_sub_member.as_deref(), Some("x"));
    assert_eq!(copy.size, 4);
    assert_eq!(copy.post_operation, PostCopyOperation::None);
}

#[test]
fn impure_calls_invalidate_the_fast_path() {
    let variable_get = SourceNode::new(NodeVariant::VariableGet {
        property: "flag".into(),
        self_context: true,
    })
    .with_pin(SourcePin::output("value", PinKind::Value));
    // The negate matches the pattern, but the impure call feeding it taints
    // the whole expression.
    let call = SourceNode::new(NodeVariant::CallFunction(CallFunctionData {
        function: "RollDice".into(),
        pure: false,
        thread_safe: false,
    }))
    .with_pin(SourcePin::output("out", PinKind::Value));
    let negate = SourceNode::new(NodeVariant::CallFunction(CallFunctionData {
        function: "Not_PreBool".into(),
        pure: true,
        thread_safe: true,
    }))
    .with_pin(SourcePin::input("a", PinKind::Value).linked_to(variable_get.guid, "value"))
    .with_pin(SourcePin::input("b", PinKind::Value).linked_to(call.guid, "out"))
    .with_pin(SourcePin::output("out", PinKind::Value));
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: false,
    })
    .with_pin(SourcePin::input("looping", PinKind::Value).linked_to(negate.guid, "out"))
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(variable_get)
        .with(call)
        .with(negate)
        .with(player)
        .with(root);
    let document = document_with(vec![graph], vec![variable("flag", FieldKind::Bool)]);

    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());
    let [handler] = compiled.class.handlers.as_slice() else {
        panic!("expected one handler");
    };
    assert!(!handler.is_fast_path());
    // The impure call also forces the instance back onto the game thread.
    assert!(!compiled.class.worker_thread_update);
    assert!(compiled.log.find("RollDice").is_some());
}

fn state_graph(name: &str, sequence: &str) -> SourceGraph {
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: sequence.into(),
        looping: true,
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let result = SourceNode::new(NodeVariant::StateResult)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));
    SourceGraph::new(name, GraphKind::State).with(player).with(result)
}

fn rule_graph(name: &str) -> SourceGraph {
    SourceGraph::new(name, GraphKind::TransitionRule).with(
        SourceNode::new(NodeVariant::TransitionResult)
            .with_pin(SourcePin::input("can_enter", PinKind::Value).with_default("true")),
    )
}

fn state(name: &str, graph: GraphRef, notify: Option<NotifyRef>) -> SourceNode {
    SourceNode::new(NodeVariant::State(StateNodeData {
        name: name.into(),
        graph,
        entered_notify: notify,
        left_notify: None,
        fully_blended_notify: None,
        always_reset_on_entry: false,
    }))
}

fn transition(previous: Uuid, next: Uuid, rule: GraphRef, priority: i32) -> SourceNode {
    SourceNode::new(NodeVariant::Transition(TransitionNodeData {
        previous_state: Some(previous),
        next_state: Some(next),
        rule,
        custom_blend: None,
        crossfade_duration: 0.25,
        blend_mode: BlendMode::Linear,
        custom_blend_curve: None,
        blend_profile: None,
        priority_order: priority,
        bidirectional: false,
        automatic_rule: false,
        start_notify: None,
        end_notify: None,
        interrupt_notify: None,
    }))
}

/// Two state machine without an entry node. States bake in authoring order.
fn machine_document() -> (BlendDocument, Uuid) {
    let idle = state("Idle", GraphRef(2), Some(NotifyRef::named("StateChanged")));
    let walk = state("Walk", GraphRef(3), Some(NotifyRef::named("StateChanged")));
    let exit = transition(idle.guid, walk.guid, GraphRef(4), 0);
    let machine_graph = SourceGraph::new("Locomotion", GraphKind::StateMachine)
        .with(idle)
        .with(walk)
        .with(exit);

    let machine_node = SourceNode::new(NodeVariant::StateMachine {
        machine: GraphRef(1),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(machine_node.guid, "pose"));
    let machine_guid = machine_node.guid;
    let main = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(machine_node)
        .with(root);

    let document = document_with(
        vec![
            main,
            machine_graph,
            state_graph("IdleState", "IdleAnim"),
            state_graph("WalkState", "WalkAnim"),
            rule_graph("WalkRule"),
        ],
        Vec::new(),
    );
    (document, machine_guid)
}

#[test]
fn machine_without_entry_defaults_to_the_first_state() {
    let (document, machine_guid) = machine_document();
    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let warning = compiled.log.find("no entry connection").expect("Valid");
    assert_eq!(warning.severity, Severity::Warning);

    let class = &compiled.class;
    let [machine] = class.state_machines.as_slice() else {
        panic!("expected one machine, got {:?}", class.state_machines);
    };
    assert_eq!(machine.name, "Locomotion");
    assert_eq!(machine.initial_state, Some(StateIndex(0)));
    assert_eq!(machine.total_states(), 2);
    assert_eq!(machine.states[0].name, "Idle");
    assert_eq!(machine.states[1].name, "Walk");
    assert!(!machine.states[0].is_conduit);

    let [exit] = machine.states[0].transitions.as_slice() else {
        panic!("expected one exit from Idle");
    };
    assert_eq!(exit.transition, TransitionIndex(0));
    assert!(exit.can_take_node.is_some());
    let baked = machine.transition(exit.transition).expect("Valid");
    assert_eq!(baked.previous_state, Some(StateIndex(0)));
    assert_eq!(baked.next_state, Some(StateIndex(1)));
    assert_eq!(baked.crossfade_duration, 0.25);

    // Both states bound the same notify triple; the table dedups it.
    assert_eq!(class.notifies.len(), 1);
    assert_eq!(class.notifies[0].name, "StateChanged");
    assert_eq!(machine.states[0].entered_notify, machine.states[1].entered_notify);

    // Each state compiled its result graph and found its asset player.
    for state in &machine.states {
        assert!(state.root_node.is_some());
        assert_eq!(state.player_nodes.len(), 1);
    }

    // The owning node stores the baked machine index.
    let node = class.node_guids[&machine_guid];
    assert_eq!(read_index(class, node, 0), 0);
}

#[test]
fn duplicate_entry_nodes_are_rejected() {
    let idle = state("Idle", GraphRef(2), None);
    let walk = state("Walk", GraphRef(3), None);
    let first = SourceNode::new(NodeVariant::Entry {
        target: Some(idle.guid),
    });
    let second = SourceNode::new(NodeVariant::Entry {
        target: Some(walk.guid),
    });
    let machine_graph = SourceGraph::new("Locomotion", GraphKind::StateMachine)
        .with(first)
        .with(second)
        .with(idle)
        .with(walk);

    let machine_node = SourceNode::new(NodeVariant::StateMachine {
        machine: GraphRef(1),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(machine_node.guid, "pose"));
    let main = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(machine_node)
        .with(root);

    let document = document_with(
        vec![
            main,
            machine_graph,
            state_graph("IdleState", "IdleAnim"),
            state_graph("WalkState", "WalkAnim"),
        ],
        Vec::new(),
    );
    let compiled = compile_document(&document);
    assert!(!compiled.is_success());
    assert!(compiled.log.find("multiple entry nodes").is_some());

    // The first connected entry keeps the initial state.
    let machine = &compiled.class.state_machines[0];
    assert_eq!(machine.initial_state, Some(StateIndex(0)));
    assert_eq!(machine.states[0].name, "Idle");
}

#[test]
fn conduit_entry_states_are_rejected() {
    let conduit = SourceNode::new(NodeVariant::Conduit {
        name: "Gate".into(),
        rule: GraphRef(2),
    });
    let entry = SourceNode::new(NodeVariant::Entry {
        target: Some(conduit.guid),
    });
    let machine_graph = SourceGraph::new("Locomotion", GraphKind::StateMachine)
        .with(entry)
        .with(conduit);

    let machine_node = SourceNode::new(NodeVariant::StateMachine {
        machine: GraphRef(1),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(machine_node.guid, "pose"));
    let main = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(machine_node)
        .with(root);

    let document = document_with(vec![main, machine_graph, rule_graph("GateRule")], Vec::new());
    let compiled = compile_document(&document);
    assert!(!compiled.is_success());
    assert!(compiled.log.find("conduit as its entry state").is_some());

    let machine = &compiled.class.state_machines[0];
    assert_eq!(machine.initial_state, Some(StateIndex(0)));
    assert!(machine.states[0].is_conduit);
}

#[test]
fn bidirectional_transitions_compile_one_directional() {
    let idle = state("Idle", GraphRef(2), None);
    let walk = state("Walk", GraphRef(3), None);
    let entry = SourceNode::new(NodeVariant::Entry {
        target: Some(idle.guid),
    });
    let mut exit = transition(idle.guid, walk.guid, GraphRef(4), 0);
    if let NodeVariant::Transition(data) = &mut exit.variant {
        data.bidirectional = true;
    }
    let machine_graph = SourceGraph::new("Locomotion", GraphKind::StateMachine)
        .with(entry)
        .with(idle)
        .with(walk)
        .with(exit);

    let machine_node = SourceNode::new(NodeVariant::StateMachine {
        machine: GraphRef(1),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(machine_node.guid, "pose"));
    let main = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(machine_node)
        .with(root);

    let document = document_with(
        vec![
            main,
            machine_graph,
            state_graph("IdleState", "IdleAnim"),
            state_graph("WalkState", "WalkAnim"),
            rule_graph("WalkRule"),
        ],
        Vec::new(),
    );
    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let warning = compiled
        .log
        .find("Bidirectional transitions are not supported")
        .expect("Valid");
    assert_eq!(warning.severity, Severity::Warning);

    // One baked transition, one direction only.
    let machine = &compiled.class.state_machines[0];
    assert_eq!(machine.total_transitions(), 1);
    assert_eq!(machine.transitions[0].previous_state, Some(StateIndex(0)));
    assert_eq!(machine.transitions[0].next_state, Some(StateIndex(1)));
    assert_eq!(machine.states[0].transitions.len(), 1);
    assert!(machine.states[1].transitions.is_empty());
}

#[test]
fn automatic_rules_need_a_single_asset_player() {
    // Walk blends two players, so an automatic remaining-time rule leaving
    // it has no single player to measure.
    let first = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "WalkA".into(),
        looping: true,
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let second = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "WalkB".into(),
        looping: true,
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let blend = SourceNode::new(NodeVariant::BlendTwoWay)
        .with_pin(SourcePin::input("a", PinKind::Pose).linked_to(first.guid, "pose"))
        .with_pin(SourcePin::input("b", PinKind::Pose).linked_to(second.guid, "pose"))
        .with_pin(SourcePin::input("alpha", PinKind::Value).with_default("0.5"))
        .with_pin(SourcePin::output("pose", PinKind::Pose));
    let result = SourceNode::new(NodeVariant::StateResult)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(blend.guid, "pose"));
    let walk_graph = SourceGraph::new("WalkState", GraphKind::State)
        .with(first)
        .with(second)
        .with(blend)
        .with(result);

    let idle = state("Idle", GraphRef(2), None);
    let walk = state("Walk", GraphRef(3), None);
    let mut exit = transition(walk.guid, idle.guid, GraphRef(4), 0);
    if let NodeVariant::Transition(data) = &mut exit.variant {
        data.automatic_rule = true;
    }
    let entry = SourceNode::new(NodeVariant::Entry {
        target: Some(idle.guid),
    });
    let machine_graph = SourceGraph::new("Locomotion", GraphKind::StateMachine)
        .with(entry)
        .with(idle)
        .with(walk)
        .with(exit);

    let machine_node = SourceNode::new(NodeVariant::StateMachine {
        machine: GraphRef(1),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(machine_node.guid, "pose"));
    let main = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(machine_node)
        .with(root);

    let document = document_with(
        vec![
            main,
            machine_graph,
            state_graph("IdleState", "IdleAnim"),
            walk_graph,
            rule_graph("WalkRule"),
        ],
        Vec::new(),
    );
    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let warning = compiled
        .log
        .find("requires the state to play a single asset")
        .expect("Valid");
    assert_eq!(warning.severity, Severity::Warning);
    let machine = &compiled.class.state_machines[0];
    assert_eq!(machine.initial_state, Some(StateIndex(0)));
    assert!(machine.states[1].transitions[0].automatic_remaining_time_rule);
}

#[test]
fn cached_pose_cycles_are_reported() {
    let use_main = SourceNode::new(NodeVariant::UseCachedPose {
        cache_name: "A".into(),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(use_main.guid, "pose"));
    let use_b = SourceNode::new(NodeVariant::UseCachedPose {
        cache_name: "B".into(),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let save_a = SourceNode::new(NodeVariant::SaveCachedPose {
        cache_name: "A".into(),
    })
    .with_pin(SourcePin::input("pose", PinKind::Pose).linked_to(use_b.guid, "pose"));
    let use_a = SourceNode::new(NodeVariant::UseCachedPose {
        cache_name: "A".into(),
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let save_b = SourceNode::new(NodeVariant::SaveCachedPose {
        cache_name: "B".into(),
    })
    .with_pin(SourcePin::input("pose", PinKind::Pose).linked_to(use_a.guid, "pose"));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(use_main)
        .with(root)
        .with(use_b)
        .with(save_a)
        .with(use_a)
        .with(save_b);
    let document = document_with(vec![graph], Vec::new());

    let compiled = compile_document(&document);
    assert!(!compiled.is_success());
    assert!(compiled.log.find("Infinite recursion detected").is_some());
}

#[test]
fn pose_link_cycles_terminate() {
    // Two blends feeding each other never happens in a well formed
    // document; the orderer must still return.
    let mut first = SourceNode::new(NodeVariant::BlendTwoWay);
    let mut second = SourceNode::new(NodeVariant::BlendTwoWay);
    let (first_guid, second_guid) = (first.guid, second.guid);
    first = first
        .with_pin(SourcePin::input("a", PinKind::Pose).linked_to(second_guid, "pose"))
        .with_pin(SourcePin::input("b", PinKind::Pose))
        .with_pin(SourcePin::input("alpha", PinKind::Value).with_default("0.5"))
        .with_pin(SourcePin::output("pose", PinKind::Pose));
    second = second
        .with_pin(SourcePin::input("a", PinKind::Pose).linked_to(first_guid, "pose"))
        .with_pin(SourcePin::input("b", PinKind::Pose))
        .with_pin(SourcePin::input("alpha", PinKind::Value).with_default("0.5"))
        .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(first_guid, "pose"));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(first)
        .with(second)
        .with(root);
    let compiled = compile_document(&document_with(vec![graph], Vec::new()));
    assert!(compiled.class.cached_pose_order["Main"].is_empty());
}

#[test]
fn duplicate_cache_names_are_rejected() {
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: true,
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));
    let first = SourceNode::new(NodeVariant::SaveCachedPose {
        cache_name: "Shared".into(),
    })
    .with_pin(SourcePin::input("pose", PinKind::Pose));
    let second = SourceNode::new(NodeVariant::SaveCachedPose {
        cache_name: "Shared".into(),
    })
    .with_pin(SourcePin::input("pose", PinKind::Pose));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(player)
        .with(root)
        .with(first)
        .with(second);
    let compiled = compile_document(&document_with(vec![graph], Vec::new()));
    assert!(!compiled.is_success());
    assert!(compiled.log.find("named 'Shared'").is_some());
}

#[test]
fn disconnected_nodes_are_pruned_but_inputs_survive() {
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: true,
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(player.guid, "pose"));
    let stray = SourceNode::new(NodeVariant::BlendTwoWay)
        .with_pin(SourcePin::input("a", PinKind::Pose))
        .with_pin(SourcePin::input("b", PinKind::Pose))
        .with_pin(SourcePin::output("pose", PinKind::Pose));
    let sub_input = SourceNode::new(NodeVariant::SubInput {
        input_name: "Params".into(),
    })
    .with_pin(SourcePin::output("Scale", PinKind::Value).typed(FieldKind::F32))
    .with_pin(SourcePin::output("pose", PinKind::Pose));

    let stray_guid = stray.guid;
    let input_guid = sub_input.guid;
    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(player)
        .with(root)
        .with(stray)
        .with(sub_input);
    let compiled = compile_document(&document_with(vec![graph], Vec::new()));
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let class = &compiled.class;
    assert_eq!(class.animation_nodes.len(), 3);
    assert!(!class.node_guids.contains_key(&stray_guid));
    assert!(class.node_guids.contains_key(&input_guid));
    assert!(class.find_field_by_name("Params_Scale").is_some());
}

#[test]
fn sub_instances_host_inputs_and_stay_on_the_game_thread() {
    let variable_get = SourceNode::new(NodeVariant::VariableGet {
        property: "speed".into(),
        self_context: true,
    })
    .with_pin(SourcePin::output("value", PinKind::Value));
    let sub = SourceNode::new(NodeVariant::SubInstance {
        info: SubInstanceInfo {
            target_class: "ChildBlueprint".into(),
            slot_names: Vec::new(),
            machine_names: Vec::new(),
            nested: Vec::new(),
        },
    })
    .with_pin(
        SourcePin::input("Speed", PinKind::Value)
            .typed(FieldKind::F32)
            .linked_to(variable_get.guid, "value"),
    )
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(sub.guid, "pose"));

    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(variable_get)
        .with(sub)
        .with(root);
    let document = document_with(vec![graph], vec![variable("speed", FieldKind::F32)]);

    let compiled = compile_document(&document);
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let class = &compiled.class;
    assert!(class.find_field_by_name("Speed").is_some());
    let [handler] = class.handlers.as_slice() else {
        panic!("expected one handler");
    };
    assert!(handler.is_fast_path());
    let copy = &handler.copy_records[0];
    assert!(copy.instance_target);
    assert_eq!(copy.source_property, "speed");
    assert_eq!(copy.dest_property, "Speed");
    assert_eq!(copy.size, 4);

    assert!(!class.worker_thread_update);
    assert!(compiled.log.find("cannot update on worker threads").is_some());
}

#[test]
fn asset_player_getters_resolve_to_allocations() {
    let player = SourceNode::new(NodeVariant::SequencePlayer {
        sequence: "Idle".into(),
        looping: true,
    })
    .with_pin(SourcePin::output("pose", PinKind::Pose));
    let getter = SourceNode::new(NodeVariant::Getter(GetterNodeData {
        kind: GetterKind::AssetPlayerTime,
        source_node: Some(player.guid),
        source_state: None,
    }))
    .with_pin(SourcePin::output("value", PinKind::Value));
    let blend = SourceNode::new(NodeVariant::BlendTwoWay)
        .with_pin(SourcePin::input("a", PinKind::Pose).linked_to(player.guid, "pose"))
        .with_pin(SourcePin::input("b", PinKind::Pose))
        .with_pin(SourcePin::input("alpha", PinKind::Value).linked_to(getter.guid, "value"))
        .with_pin(SourcePin::output("pose", PinKind::Pose));
    let root = SourceNode::new(NodeVariant::Root)
        .with_pin(SourcePin::input("result", PinKind::Pose).linked_to(blend.guid, "pose"));

    let player_guid = player.guid;
    let graph = SourceGraph::new("Main", GraphKind::BlendGraph)
        .with(player)
        .with(getter)
        .with(blend)
        .with(root);
    let compiled = compile_document(&document_with(vec![graph], Vec::new()));
    assert!(compiled.is_success(), "{:?}", compiled.log.messages());

    let class = &compiled.class;
    let [resolved] = class.getters.as_slice() else {
        panic!("expected one getter, got {:?}", class.getters);
    };
    assert_eq!(resolved.kind, GetterKind::AssetPlayerTime);
    assert_eq!(resolved.source_node, Some(class.node_guids[&player_guid]));

    // A getter feeding the pin is dynamic; the handler binds its function.
    let [handler] = class.handlers.as_slice() else {
        panic!("expected one handler");
    };
    assert!(!handler.is_fast_path());
}

#[test]
fn missing_skeleton_aborts_compilation() {
    let registry = LayoutRegistry::with_default_nodes();
    let document = BlendDocument {
        name: "Broken".into(),
        skeleton: None,
        variables: Vec::new(),
        graphs: Vec::new(),
    };
    let result = compile(&document, &registry, CompileOptions::default());
    assert!(matches!(result, Err(CompileError::MissingSkeleton(name)) if name == "Broken"));
}
