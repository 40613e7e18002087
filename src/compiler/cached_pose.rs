use std::collections::HashSet;

use log::debug;

use crate::compiler::graph::GraphNodeId;
use crate::compiler::CompilationSession;
use crate::state_machine::NodeIndex;
use crate::NodeVariant;

/// Compute, per true root, the order in which save cached pose nodes must
/// update so producers run before their consumers. Discovery order with
/// re-queueing: a save referenced again bubbles to the last discovered
/// position.
pub fn order_cached_poses(session: &mut CompilationSession<'_>) {
    let roots = session.root_nodes.clone();
    for root in roots {
        let graph_name = session.graph.node(root).graph_name.clone();
        let mut ordered: Vec<GraphNodeId> = Vec::new();
        let mut chain: Vec<GraphNodeId> = Vec::new();
        expand_traversal(session, root, &mut ordered, &mut chain);

        if session.options.debug_cached_pose_ordering {
            let names: Vec<&str> = ordered
                .iter()
                .filter_map(|id| cache_name(session, *id))
                .collect();
            debug!("cached pose order for '{graph_name}': {names:?}");
        }

        let indices: Vec<NodeIndex> = ordered
            .iter()
            .filter_map(|id| session.allocated.get(id).copied())
            .collect();
        session.class.cached_pose_order.insert(graph_name, indices);
    }
}

/// Collect the saves referenced under `from`, then recurse from each with
/// the ancestor chain carried explicitly: a save already on the chain is a
/// true cycle, not a legal revisit.
fn expand_traversal(
    session: &mut CompilationSession<'_>,
    from: GraphNodeId,
    ordered: &mut Vec<GraphNodeId>,
    chain: &mut Vec<GraphNodeId>,
) {
    let mut found: Vec<GraphNodeId> = Vec::new();
    let mut visited: HashSet<GraphNodeId> = HashSet::new();
    visited.insert(from);
    traverse(session, from, &mut found, &mut visited);

    for save in found {
        if chain.contains(&save) {
            let first = cache_name(session, *chain.last().unwrap_or(&from))
                .unwrap_or("?")
                .to_string();
            let second = cache_name(session, save).unwrap_or("?").to_string();
            let nodes = [
                session.graph.node(save).source_guid,
                session.graph.node(from).source_guid,
            ];
            session.log.error(
                format!(
                    "Infinite recursion detected between SaveCachedPose '{first}' and '{second}'"
                ),
                nodes,
            );
            continue;
        }

        if let Some(position) = ordered.iter().position(|existing| *existing == save) {
            ordered.remove(position);
        }
        ordered.push(save);

        chain.push(save);
        expand_traversal(session, save, ordered, chain);
        chain.pop();
    }
}

/// Depth first over pose links. Use nodes record their paired save without
/// descending into it; nested state machines descend into each compiled
/// state result as if directly linked. The visited set keeps malformed pose
/// link cycles from recursing forever.
fn traverse(
    session: &CompilationSession<'_>,
    node: GraphNodeId,
    found: &mut Vec<GraphNodeId>,
    visited: &mut HashSet<GraphNodeId>,
) {
    for producer in session.graph.pose_producers(node) {
        match &session.graph.node(producer).variant {
            NodeVariant::UseCachedPose { cache_name } => {
                if let Some(save) = session.saved_poses.get(cache_name) {
                    if let Some(position) = found.iter().position(|existing| existing == save) {
                        found.remove(position);
                    }
                    found.push(*save);
                }
            }
            NodeVariant::StateMachine { .. } => {
                if !visited.insert(producer) {
                    continue;
                }
                if let Some(record) = session
                    .machines
                    .iter()
                    .find(|record| record.node == producer)
                {
                    for result in record.state_results.clone() {
                        if visited.insert(result) {
                            traverse(session, result, found, visited);
                        }
                    }
                }
            }
            _ => {
                if visited.insert(producer) {
                    traverse(session, producer, found, visited);
                }
            }
        }
    }
}

fn cache_name<'a>(session: &'a CompilationSession<'_>, id: GraphNodeId) -> Option<&'a str> {
    match &session.graph.node(id).variant {
        NodeVariant::SaveCachedPose { cache_name } => Some(cache_name),
        _ => None,
    }
}
