use std::collections::HashSet;

use uuid::Uuid;

use crate::compiler::graph::{GraphNodeId, PinId};
use crate::compiler::CompilationSession;
use crate::{native_break_struct, ClassFieldKind, FieldKind, IndexType, NodeVariant, PinKind};

/// Well known evaluation name all dynamic input pins of a node group
/// under.
pub const EVALUATION_HANDLER_NAME: &str = "EvaluateGraphExposedInputs";

/// Unconnected pin literal, applied once into the default object.
#[derive(Debug, Clone)]
pub struct ConstantRecord {
    pub node: GraphNodeId,
    pub field: String,
    pub array_index: Option<IndexType>,
    pub literal: String,
}

/// Source pattern a copy record matched during classification. Stays a
/// candidate until patch time byte size validation confirms it.
#[derive(Debug, Clone)]
pub struct FastPathSource {
    pub property: String,
    pub sub_member: Option<String>,
    pub negate: bool,
}

#[derive(Debug, Clone)]
pub struct WorkingCopy {
    pub dest_pin: PinId,
    pub dest_field: String,
    pub dest_array_index: Option<IndexType>,
    pub instance_target: bool,
    pub fast_path: Option<FastPathSource>,
}

/// One evaluation handler under construction: all dynamic value pins of
/// one node. Materialized only when it services at least one property.
#[derive(Debug, Clone)]
pub struct HandlerRecord {
    pub node: GraphNodeId,
    /// Deterministic synthetic name, exposed only when the handler does
    /// not finalize as fast path.
    pub function_name: String,
    pub copies: Vec<WorkingCopy>,
}

/// Partition a node's value input pins into effective constants, dynamic
/// copy records and ignored pins, then file the handler if anything was
/// dynamic.
pub fn build_handler(session: &mut CompilationSession<'_>, id: GraphNodeId) {
    let node = session.graph.node(id);
    let guid = node.source_guid;
    let graph_name = node.graph_name.clone();
    let class_name = node.variant.class_name();
    let is_sub_instance = matches!(node.variant, NodeVariant::SubInstance { .. });
    let Some(struct_name) = node.variant.runtime_struct() else {
        return;
    };
    let Ok(layout) = session.registry.node(struct_name).cloned() else {
        return;
    };

    let mut copies = Vec::new();
    let pins: Vec<PinId> = session.graph.input_pins(id).collect();
    for pin_id in pins {
        let pin = session.graph.pin(pin_id).clone();
        if pin.kind != PinKind::Value {
            continue;
        }

        let on_node = layout.field_location(session.registry, &pin.name).is_ok();
        if !on_node && !is_sub_instance {
            session.log.note(
                format!("Pin '{}' is visible but ignored", pin.name),
                [guid],
            );
            continue;
        }
        let instance_target = !on_node;
        if instance_target {
            // Exposed input delegated to another instance, hosted as a
            // field directly on the class.
            let kind = pin.value_kind.clone().unwrap_or(FieldKind::F32);
            if let Err(error) = session.class.create_named_field(
                &pin.name,
                ClassFieldKind::Value(kind),
                session.registry,
            ) {
                session.log.error(
                    format!("Failed to host exposed input '{}': {error}", pin.name),
                    [guid],
                );
                continue;
            }
        }

        if pin.link.is_none() {
            // Class defaults already cover unconnected instance inputs.
            if instance_target || pin.default_literal.is_empty() {
                continue;
            }
            session.constants.push(ConstantRecord {
                node: id,
                field: pin.name.clone(),
                array_index: pin.array_index,
                literal: pin.default_literal.clone(),
            });
            continue;
        }

        let fast_path = if session.options.optimize_member_variable_access {
            let candidate = classify_fast_path(session, pin_id);
            if candidate.is_some() && !member_only_access(session, pin_id) {
                None
            } else {
                candidate
            }
        } else {
            None
        };

        copies.push(WorkingCopy {
            dest_pin: pin_id,
            dest_field: pin.name.clone(),
            dest_array_index: pin.array_index,
            instance_target,
            fast_path,
        });
    }

    if copies.is_empty() {
        return;
    }
    let function_name = make_handler_name(
        &mut session.handler_names,
        &graph_name,
        class_name,
        guid,
    );
    session.handlers.push(HandlerRecord {
        node: id,
        function_name,
        copies,
    });
}

/// Fixed order pattern match over the pin's upstream expression; first
/// match wins.
fn classify_fast_path(session: &CompilationSession<'_>, pin: PinId) -> Option<FastPathSource> {
    let (node, out_pin) = session.graph.follow_link(pin)?;
    if let Some(source) = check_variable_get(session, node, out_pin) {
        return Some(source);
    }
    if let Some(source) = check_logical_not(session, node) {
        return Some(source);
    }
    check_struct_member_access(session, node, out_pin)
}

/// Direct, non-container read of a self owned field, possibly one split
/// sub-element of a struct valued one.
fn check_variable_get(
    session: &CompilationSession<'_>,
    node: GraphNodeId,
    out_pin: PinId,
) -> Option<FastPathSource> {
    let NodeVariant::VariableGet {
        property,
        self_context,
    } = &session.graph.node(node).variant
    else {
        return None;
    };
    if !self_context {
        return None;
    }
    Some(FastPathSource {
        property: property.clone(),
        sub_member: session.graph.pin(out_pin).sub_member.clone(),
        negate: false,
    })
}

/// Boolean negate of a plain read: same copy, negate on apply.
fn check_logical_not(
    session: &CompilationSession<'_>,
    node: GraphNodeId,
) -> Option<FastPathSource> {
    let is_not = match &session.graph.node(node).variant {
        NodeVariant::LogicalNot => true,
        NodeVariant::CallFunction(data) => data.function == "Not_PreBool",
        _ => false,
    };
    if !is_not {
        return None;
    }
    let input = session.graph.first_input_pin(node, PinKind::Value)?;
    let (inner, inner_pin) = session.graph.follow_link(input)?;
    let mut source = check_variable_get(session, inner, inner_pin)
        .or_else(|| check_struct_member_access(session, inner, inner_pin))?;
    source.negate = true;
    Some(source)
}

/// Break of a struct valued read, restricted to explicit break nodes and
/// the whitelisted native breaks.
fn check_struct_member_access(
    session: &CompilationSession<'_>,
    node: GraphNodeId,
    out_pin: PinId,
) -> Option<FastPathSource> {
    let allowed = match &session.graph.node(node).variant {
        NodeVariant::BreakStruct { .. } => true,
        NodeVariant::NativeBreak { function } => native_break_struct(function).is_some(),
        _ => false,
    };
    if !allowed {
        return None;
    }
    let input = session.graph.first_input_pin(node, PinKind::Value)?;
    let (inner, inner_pin) = session.graph.follow_link(input)?;
    let mut source = check_variable_get(session, inner, inner_pin)?;
    if source.sub_member.is_some() {
        // Already one level deep, a second break disqualifies.
        return None;
    }
    source.sub_member = Some(session.graph.pin(out_pin).name.clone());
    Some(source)
}

/// Walk every path upstream of the pin and confirm all intermediate nodes
/// are pure, self contained reads. Any impure call or external context
/// access invalidates the fast path regardless of the earlier match.
fn member_only_access(session: &CompilationSession<'_>, pin: PinId) -> bool {
    let graph = &session.graph;
    let Some(link) = graph.pin(pin).link else {
        return true;
    };

    let mut visited: HashSet<GraphNodeId> = HashSet::new();
    let mut stack = vec![graph.pin(link).owner];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        match &graph.node(node).variant {
            NodeVariant::VariableGet { self_context, .. } => {
                if !self_context {
                    return false;
                }
            }
            NodeVariant::Getter(_) => {}
            NodeVariant::Reroute
            | NodeVariant::LogicalNot
            | NodeVariant::BreakStruct { .. }
            | NodeVariant::NativeBreak { .. } => {
                push_value_producers(session, node, &mut stack);
            }
            NodeVariant::CallFunction(data) => {
                if !data.pure {
                    return false;
                }
                push_value_producers(session, node, &mut stack);
            }
            _ => return false,
        }
    }
    true
}

fn push_value_producers(
    session: &CompilationSession<'_>,
    node: GraphNodeId,
    stack: &mut Vec<GraphNodeId>,
) {
    let graph = &session.graph;
    let pins: Vec<PinId> = graph.input_pins(node).collect();
    for pin in pins {
        if graph.pin(pin).kind != PinKind::Value {
            continue;
        }
        if let Some(link) = graph.pin(pin).link {
            stack.push(graph.pin(link).owner);
        }
    }
}

/// Deterministic name from (handler kind, graph, node class, node guid),
/// retried with an incrementing suffix until unique within this compile.
pub fn make_handler_name(
    taken: &mut HashSet<String>,
    graph_name: &str,
    class_name: &str,
    guid: Uuid,
) -> String {
    let base = format!(
        "{EVALUATION_HANDLER_NAME}_{graph_name}_{class_name}_{}",
        guid.simple()
    );
    let mut candidate = base.clone();
    let mut suffix = 0;
    while !taken.insert(candidate.clone()) {
        suffix += 1;
        candidate = format!("{base}_{suffix}");
    }
    candidate
}
