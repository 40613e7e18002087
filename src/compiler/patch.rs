use std::collections::HashSet;

use crate::compiler::graph::{GraphNodeId, PinId};
use crate::compiler::CompilationSession;
use crate::{
    ClassFieldKind, CopyRecord, ExposedValueHandler, FieldKind, IndexType, NodeLayout, NodeVariant,
    PinKind, PostCopyOperation,
};

/// Final stage, run only with a clean error count: copy node templates
/// into the default object, patch link indices, finalize handlers, apply
/// literal constants and settle the threading decision.
pub fn finalize(session: &mut CompilationSession<'_>) {
    copy_node_templates(session);
    patch_pose_links(session);
    finalize_handlers(session);
    apply_constants(session);
    decide_thread_safety(session);
}

enum FieldValue<'a> {
    Name(&'a str),
    Index(IndexType),
    Bool(bool),
}

fn write_field(
    session: &mut CompilationSession<'_>,
    layout: &NodeLayout,
    base_offset: usize,
    field: &str,
    value: FieldValue<'_>,
) {
    let location = match layout.field_location(session.registry, field) {
        Ok((offset, _)) => base_offset + offset,
        Err(error) => {
            session
                .log
                .error(format!("Template patch failed: {error}"), []);
            return;
        }
    };
    let result = match value {
        FieldValue::Name(name) => {
            let interned = session.class.intern_name(name);
            session.class.copy_raw_bytes(location, &interned.to_le_bytes())
        }
        FieldValue::Index(index) => session.class.copy_raw_bytes(location, &index.to_le_bytes()),
        FieldValue::Bool(value) => session.class.copy_raw_bytes(location, &[value as u8]),
    };
    if let Err(error) = result {
        session
            .log
            .error(format!("Template patch failed: {error}"), []);
    }
}

/// Bulk copy every allocated node's template bytes, then patch the fields
/// whose values are only known to the compiler: graph names on roots and
/// sub-graph inputs, cache and asset names, baked machine indices.
fn copy_node_templates(session: &mut CompilationSession<'_>) {
    for position in 0..session.allocation_order.len() {
        let id = session.allocation_order[position];
        let node = session.graph.node(id);
        let graph_name = node.graph_name.clone();
        let variant = node.variant.clone();
        let Some(struct_name) = variant.runtime_struct() else {
            continue;
        };
        let Ok(layout) = session.registry.node(struct_name).cloned() else {
            continue;
        };

        let Some(offset) = session
            .class
            .animation_nodes
            .get(position)
            .copied()
            .and_then(|field| session.class.field(field))
            .map(|field| field.offset)
        else {
            session.log.error("Allocated node lost its field", []);
            continue;
        };

        match layout.default_bytes(session.registry) {
            Ok(template) => {
                if let Err(error) = session.class.copy_raw_bytes(offset, &template) {
                    session
                        .log
                        .error(format!("Template copy failed: {error}"), []);
                    continue;
                }
            }
            Err(error) => {
                session
                    .log
                    .error(format!("Template copy failed: {error}"), []);
                continue;
            }
        }

        match &variant {
            NodeVariant::Root => {
                write_field(session, &layout, offset, "name", FieldValue::Name(&graph_name));
            }
            NodeVariant::SaveCachedPose { cache_name } => {
                write_field(
                    session,
                    &layout,
                    offset,
                    "cache_name",
                    FieldValue::Name(cache_name),
                );
            }
            NodeVariant::SequencePlayer { sequence, looping } => {
                write_field(session, &layout, offset, "sequence", FieldValue::Name(sequence));
                write_field(session, &layout, offset, "looping", FieldValue::Bool(*looping));
            }
            NodeVariant::StateMachine { .. } => {
                let machine = session
                    .machines
                    .iter()
                    .find(|record| record.node == id)
                    .map(|record| record.machine_index.0);
                if let Some(machine) = machine {
                    write_field(
                        session,
                        &layout,
                        offset,
                        "machine_index",
                        FieldValue::Index(machine),
                    );
                }
            }
            NodeVariant::SubInstance { info } => {
                write_field(
                    session,
                    &layout,
                    offset,
                    "target_class",
                    FieldValue::Name(&info.target_class),
                );
            }
            NodeVariant::SubInput { input_name } => {
                write_field(session, &layout, offset, "graph", FieldValue::Name(&graph_name));
                write_field(
                    session,
                    &layout,
                    offset,
                    "input_name",
                    FieldValue::Name(input_name),
                );
            }
            _ => {}
        }
    }
}

/// Write each producer's allocation index into the consumer's link field.
/// Both ends must have allocated; anything else is a compile error.
fn patch_pose_links(session: &mut CompilationSession<'_>) {
    let records = session.pose_links.clone();
    for record in records {
        let consumer_guid = session.graph.node(record.consumer).source_guid;
        let (Some(consumer), Some(producer)) = (
            session.allocated.get(&record.consumer).copied(),
            session.allocated.get(&record.producer).copied(),
        ) else {
            session.log.error(
                format!("Pose link through '{}' could not be resolved", record.field),
                [consumer_guid],
            );
            continue;
        };

        let node = session.graph.node(record.consumer);
        let Some(struct_name) = node.variant.runtime_struct() else {
            continue;
        };
        let Ok(layout) = session.registry.node(struct_name).cloned() else {
            continue;
        };
        let locus =
            match layout.pose_link_location(session.registry, &record.field, record.array_index) {
                Ok(locus) => locus,
                Err(error) => {
                    session.log.error(
                        format!("Pose link through '{}' has no locus: {error}", record.field),
                        [consumer_guid],
                    );
                    continue;
                }
            };

        let Some(base) = session.class.node_field(consumer).map(|field| field.offset) else {
            continue;
        };
        if let Err(error) = session
            .class
            .copy_raw_bytes(base + locus, &producer.0.to_le_bytes())
        {
            session
                .log
                .error(format!("Pose link patch failed: {error}"), [consumer_guid]);
        }
    }
}

/// Validate every fast path candidate against the finished class and emit
/// the exposed input handler table. One failing copy demotes the whole
/// handler to its synthetic function.
fn finalize_handlers(session: &mut CompilationSession<'_>) {
    let records = session.handlers.clone();
    for record in records {
        let Some(node_index) = session.allocated.get(&record.node).copied() else {
            session
                .log
                .error("Evaluation handler references an unallocated node", []);
            continue;
        };
        let node = session.graph.node(record.node);
        let layout = node
            .variant
            .runtime_struct()
            .and_then(|name| session.registry.node(name).ok())
            .cloned();

        let mut all_fast = true;
        let mut finalized = Vec::new();
        for copy in &record.copies {
            let dest_size = destination_size(session, &layout, copy);
            let validated = copy.fast_path.as_ref().and_then(|fast| {
                let dest_size = dest_size?;
                let (_, field) = session.class.find_field_by_name(&fast.property)?;
                let ClassFieldKind::Value(kind) = &field.kind else {
                    return None;
                };
                // Arrays never qualify as fast path sources.
                if kind.is_array() {
                    return None;
                }
                let source_size = match &fast.sub_member {
                    None => kind.size(session.registry).ok()?,
                    Some(member) => {
                        let struct_name = match kind {
                            FieldKind::Struct(name) => name.as_str(),
                            FieldKind::Vector => "Vector",
                            _ => return None,
                        };
                        let structure = session.registry.structure(struct_name).ok()?;
                        let (_, member_layout) =
                            structure.member_location(session.registry, member).ok()?;
                        member_layout.kind.size(session.registry).ok()?
                    }
                };
                (source_size == dest_size).then_some(source_size)
            });

            match (&copy.fast_path, validated) {
                (Some(fast), Some(size)) => finalized.push(CopyRecord {
                    source_property: fast.property.clone(),
                    source_sub_member: fast.sub_member.clone(),
                    dest_property: copy.dest_field.clone(),
                    dest_array_index: copy.dest_array_index,
                    size,
                    post_operation: if fast.negate {
                        PostCopyOperation::LogicalNegateBool
                    } else {
                        PostCopyOperation::None
                    },
                    instance_target: copy.instance_target,
                }),
                _ => all_fast = false,
            }
        }

        session.class.handlers.push(ExposedValueHandler {
            node: node_index,
            bound_function: (!all_fast).then(|| record.function_name.clone()),
            copy_records: if all_fast { finalized } else { Vec::new() },
        });
    }
}

fn destination_size(
    session: &CompilationSession<'_>,
    layout: &Option<std::sync::Arc<NodeLayout>>,
    copy: &crate::compiler::WorkingCopy,
) -> Option<usize> {
    if copy.instance_target {
        let (_, field) = session.class.find_field_by_name(&copy.dest_field)?;
        return Some(field.size);
    }
    let layout = layout.as_ref()?;
    let (_, field) = layout
        .field_location(session.registry, &copy.dest_field)
        .ok()?;
    if copy.dest_array_index.is_some() {
        field.kind.element_size(session.registry).ok()
    } else {
        field.kind.size(session.registry).ok()
    }
}

/// Parse each unconnected pin's literal text straight into the node's raw
/// default memory. Failure to locate or parse is a hard error.
fn apply_constants(session: &mut CompilationSession<'_>) {
    let records = session.constants.clone();
    for record in records {
        let guid = session.graph.node(record.node).source_guid;
        let Some(index) = session.allocated.get(&record.node).copied() else {
            continue;
        };
        let node = session.graph.node(record.node);
        let Some(struct_name) = node.variant.runtime_struct() else {
            continue;
        };
        let Ok(layout) = session.registry.node(struct_name).cloned() else {
            continue;
        };

        let (field_offset, field) =
            match layout.field_location(session.registry, &record.field) {
                Ok(found) => found,
                Err(error) => {
                    session.log.error(
                        format!(
                            "Failed to push default value '{}' into '{}': {error}",
                            record.literal, record.field
                        ),
                        [guid],
                    );
                    continue;
                }
            };

        let (kind, element_offset) = match (&field.kind, record.array_index) {
            (FieldKind::Array(inner, count), Some(element)) => {
                if element >= *count {
                    session.log.error(
                        format!(
                            "Failed to push default value '{}' into '{}': index {element} out of bounds",
                            record.literal, record.field
                        ),
                        [guid],
                    );
                    continue;
                }
                let size = match inner.size(session.registry) {
                    Ok(size) => size,
                    Err(_) => continue,
                };
                ((**inner).clone(), element as usize * size)
            }
            (FieldKind::Array(..), None) => {
                session.log.error(
                    format!(
                        "Failed to push default value '{}' into array '{}' without an index",
                        record.literal, record.field
                    ),
                    [guid],
                );
                continue;
            }
            (kind, _) => (kind.clone(), 0),
        };

        let Some(base) = session.class.node_field(index).map(|field| field.offset) else {
            continue;
        };
        let registry = session.registry;
        if let Err(error) = session.class.parse_literal_into_field(
            &kind,
            &record.literal,
            base + field_offset + element_offset,
            registry,
        ) {
            session.log.error(
                format!(
                    "Failed to push default value '{}' into '{}': {error}",
                    record.literal, record.field
                ),
                [guid],
            );
        }
    }
}

/// One global decision per compiled class, made after all handlers are
/// finalized: any main-thread-only node or any handler calling an impure
/// or unsafe function demotes the whole instance.
fn decide_thread_safety(session: &mut CompilationSession<'_>) {
    if !session.options.allow_worker_thread_update {
        session.class.worker_thread_update = false;
        return;
    }

    for position in 0..session.allocation_order.len() {
        let id = session.allocation_order[position];
        let node = session.graph.node(id);
        let guid = node.source_guid;
        let Some(struct_name) = node.variant.runtime_struct() else {
            continue;
        };
        let Ok(layout) = session.registry.node(struct_name) else {
            continue;
        };
        if !layout.worker_thread_safe {
            session.log.warning(
                format!("Node '{struct_name}' cannot update on worker threads"),
                [guid],
            );
            session.class.worker_thread_update = false;
        }
    }

    let handlers: Vec<(GraphNodeId, Vec<PinId>, bool)> = session
        .handlers
        .iter()
        .zip(session.class.handlers.iter())
        .map(|(record, emitted)| {
            (
                record.node,
                record.copies.iter().map(|copy| copy.dest_pin).collect(),
                emitted.is_fast_path(),
            )
        })
        .collect();
    for (node, pins, fast) in handlers {
        if fast {
            continue;
        }
        if let Some(function) = unsafe_call_in_expression(session, &pins) {
            session.log.warning(
                format!("Handler calls '{function}' which is not safe off the game thread"),
                [session.graph.node(node).source_guid],
            );
            session.class.worker_thread_update = false;
        }
    }
}

/// First function upstream of the given pins that is not both pure and
/// thread safe tagged.
fn unsafe_call_in_expression(
    session: &CompilationSession<'_>,
    pins: &[PinId],
) -> Option<String> {
    let graph = &session.graph;
    let mut visited: HashSet<GraphNodeId> = HashSet::new();
    let mut stack: Vec<GraphNodeId> = pins
        .iter()
        .filter_map(|pin| graph.pin(*pin).link)
        .map(|link| graph.pin(link).owner)
        .collect();

    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        if let NodeVariant::CallFunction(data) = &graph.node(node).variant {
            if !(data.pure && data.thread_safe) {
                return Some(data.function.clone());
            }
        }
        for pin in graph.input_pins(node) {
            if graph.pin(pin).kind != PinKind::Value {
                continue;
            }
            if let Some(link) = graph.pin(pin).link {
                stack.push(graph.pin(link).owner);
            }
        }
    }
    None
}
