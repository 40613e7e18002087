use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BlendMode, IndexType};

/// Allocation index of a node field on the generated class.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct NodeIndex(pub IndexType);

impl From<NodeIndex> for usize {
    fn from(value: NodeIndex) -> Self {
        value.0 as usize
    }
}

impl From<IndexType> for NodeIndex {
    fn from(value: IndexType) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MachineIndex(pub IndexType);

impl From<MachineIndex> for usize {
    fn from(value: MachineIndex) -> Self {
        value.0 as usize
    }
}

impl From<IndexType> for MachineIndex {
    fn from(value: IndexType) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct StateIndex(pub IndexType);

impl From<StateIndex> for usize {
    fn from(value: StateIndex) -> Self {
        value.0 as usize
    }
}

impl From<IndexType> for StateIndex {
    fn from(value: IndexType) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct TransitionIndex(pub IndexType);

impl From<TransitionIndex> for usize {
    fn from(value: TransitionIndex) -> Self {
        value.0 as usize
    }
}

impl From<IndexType> for TransitionIndex {
    fn from(value: IndexType) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct NotifyIndex(pub IndexType);

impl From<NotifyIndex> for usize {
    fn from(value: NotifyIndex) -> Self {
        value.0 as usize
    }
}

impl From<IndexType> for NotifyIndex {
    fn from(value: IndexType) -> Self {
        Self(value)
    }
}

#[derive(Error, Debug)]
pub enum MachineValidationError {
    #[error("too many states")]
    TooManyStates,
    #[error("too many transitions")]
    TooManyTransitions,
    #[error("missing initial state")]
    MissingInitialState,
    #[error("initial state out of range")]
    InitialStateOutOfRange,
    #[error("initial state is a conduit")]
    InitialStateIsConduit,
    #[error("transition state out of range")]
    TransitionStateOutOfRange,
    #[error("state exit references missing transition")]
    MissingExitTransition,
    #[error("notify index out of range")]
    NotifyOutOfRange,
    #[error("node index out of range")]
    NodeOutOfRange,
}

/// Deduplicated notify binding referenced by index from baked states and
/// transitions.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BakedNotify {
    pub name: String,
    pub event_asset: Option<String>,
    pub state_asset: Option<String>,
}

/// Flattened, array indexed runtime form of an authored state machine
/// graph.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BakedStateMachine {
    pub name: String,
    /// Always a valid state index after validation succeeds.
    pub initial_state: Option<StateIndex>,
    pub states: Vec<BakedState>,
    pub transitions: Vec<BakedTransition>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BakedState {
    pub name: String,
    pub is_conduit: bool,
    /// Allocation index of the state's compiled result node, or of the
    /// entry rule result for conduits.
    pub root_node: Option<NodeIndex>,
    pub entered_notify: Option<NotifyIndex>,
    pub left_notify: Option<NotifyIndex>,
    pub fully_blended_notify: Option<NotifyIndex>,
    pub always_reset_on_entry: bool,
    /// Asset players reachable inside this state, nested machines excluded.
    pub player_nodes: Vec<NodeIndex>,
    /// Outgoing transitions in priority order.
    pub transitions: Vec<BakedStateExit>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BakedStateExit {
    pub transition: TransitionIndex,
    /// Compiled rule result, shared across exits with identical rule
    /// graphs.
    pub can_take_node: Option<NodeIndex>,
    /// Result of the custom blend graph, when one is attached.
    pub custom_result_node: Option<NodeIndex>,
    /// Pose evaluators inside the custom blend graph, pre-populated by the
    /// runtime before the blend starts.
    pub pose_evaluator_nodes: Vec<NodeIndex>,
    pub automatic_remaining_time_rule: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BakedTransition {
    pub previous_state: Option<StateIndex>,
    pub next_state: Option<StateIndex>,
    pub crossfade_duration: f32,
    pub blend_mode: BlendMode,
    pub custom_blend_curve: Option<String>,
    pub blend_profile: Option<String>,
    pub start_notify: Option<NotifyIndex>,
    pub end_notify: Option<NotifyIndex>,
    pub interrupt_notify: Option<NotifyIndex>,
}

impl BakedStateMachine {
    pub fn total_states(&self) -> usize {
        self.states.len()
    }

    pub fn total_transitions(&self) -> usize {
        self.transitions.len()
    }

    pub fn state(&self, index: StateIndex) -> Option<&BakedState> {
        self.states.get(index.0 as usize)
    }

    pub fn transition(&self, index: TransitionIndex) -> Option<&BakedTransition> {
        self.transitions.get(index.0 as usize)
    }

    pub fn validate(
        &self,
        total_notifies: usize,
        total_nodes: usize,
    ) -> Result<(), MachineValidationError> {
        const MAX_COUNT: usize = IndexType::MAX as usize - 1;
        use MachineValidationError::*;

        if self.states.len() >= MAX_COUNT {
            return Err(TooManyStates);
        }
        if self.transitions.len() >= MAX_COUNT {
            return Err(TooManyTransitions);
        }

        let initial = self.initial_state.ok_or(MissingInitialState)?;
        let initial_state = self.state(initial).ok_or(InitialStateOutOfRange)?;
        if initial_state.is_conduit {
            return Err(InitialStateIsConduit);
        }

        let check_notify = |notify: Option<NotifyIndex>| {
            if notify.is_some_and(|index| index.0 as usize >= total_notifies) {
                Err(NotifyOutOfRange)
            } else {
                Ok(())
            }
        };
        let check_node = |node: Option<NodeIndex>| {
            if node.is_some_and(|index| index.0 as usize >= total_nodes) {
                Err(NodeOutOfRange)
            } else {
                Ok(())
            }
        };

        for state in &self.states {
            check_node(state.root_node)?;
            check_notify(state.entered_notify)?;
            check_notify(state.left_notify)?;
            check_notify(state.fully_blended_notify)?;
            for node in &state.player_nodes {
                check_node(Some(*node))?;
            }
            for exit in &state.transitions {
                if exit.transition.0 as usize >= self.transitions.len() {
                    return Err(MissingExitTransition);
                }
                check_node(exit.can_take_node)?;
                check_node(exit.custom_result_node)?;
                for node in &exit.pose_evaluator_nodes {
                    check_node(Some(*node))?;
                }
            }
        }

        for transition in &self.transitions {
            for state in [transition.previous_state, transition.next_state] {
                if state.is_some_and(|index| index.0 as usize >= self.states.len()) {
                    return Err(TransitionStateOutOfRange);
                }
            }
            check_notify(transition.start_notify)?;
            check_notify(transition.end_notify)?;
            check_notify(transition.interrupt_notify)?;
        }

        Ok(())
    }
}
