use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FieldKind, IndexType};

/// An authored blend graph document: the visual program as saved by the
/// editor, before any compilation. Node identity is a [`Uuid`] that is
/// stable across edits and recompiles.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BlendDocument {
    pub name: String,
    /// Required asset context. Compilation aborts without one.
    pub skeleton: Option<String>,
    #[serde(default)]
    pub variables: Vec<ClassVariable>,
    #[serde(default)]
    pub graphs: Vec<SourceGraph>,
}

impl BlendDocument {
    pub fn graph(&self, graph: GraphRef) -> Option<&SourceGraph> {
        self.graphs.get(graph.0 as usize)
    }

    /// Top level graphs compiled as independent roots. Sub-graphs (state
    /// contents, transition rules, custom blends) are only reached through
    /// the node that owns them.
    pub fn root_graphs(&self) -> impl Iterator<Item = (GraphRef, &SourceGraph)> {
        self.graphs
            .iter()
            .enumerate()
            .filter(|(_, graph)| graph.kind == GraphKind::BlendGraph)
            .map(|(index, graph)| (GraphRef(index as IndexType), graph))
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Member variable declared on the document, realized as a field on the
/// generated class before any node is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassVariable {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub default_literal: String,
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct GraphRef(pub IndexType);

impl From<GraphRef> for usize {
    fn from(value: GraphRef) -> Self {
        value.0 as usize
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphKind {
    #[default]
    BlendGraph,
    StateMachine,
    State,
    TransitionRule,
    CustomBlend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceGraph {
    pub name: String,
    pub kind: GraphKind,
    pub nodes: Vec<SourceNode>,
}

impl SourceGraph {
    pub fn new(name: impl Into<String>, kind: GraphKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nodes: Vec::new(),
        }
    }

    pub fn with(mut self, node: SourceNode) -> Self {
        self.nodes.push(node);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceNode {
    pub guid: Uuid,
    pub variant: NodeVariant,
    #[serde(default)]
    pub pins: Vec<SourcePin>,
}

impl SourceNode {
    pub fn new(variant: NodeVariant) -> Self {
        Self {
            guid: Uuid::new_v4(),
            variant,
            pins: Vec::new(),
        }
    }

    pub fn with_pin(mut self, pin: SourcePin) -> Self {
        self.pins.push(pin);
        self
    }

    pub fn find_pin(&self, name: &str) -> Option<&SourcePin> {
        self.pins.iter().find(|pin| pin.name == name)
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinDirection {
    #[default]
    Input,
    Output,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinKind {
    /// An animation pose edge. Pose edges form the primary DAG the runtime
    /// evaluator walks each frame.
    Pose,
    /// A scalar/struct data edge feeding a node property.
    #[default]
    Value,
}

/// Reference to another node's output pin within the same graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinLink {
    pub node: Uuid,
    pub pin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePin {
    pub name: String,
    pub direction: PinDirection,
    pub kind: PinKind,
    /// Element index for array-typed properties addressed per element.
    #[serde(default)]
    pub array_index: Option<IndexType>,
    #[serde(default)]
    pub link: Option<PinLink>,
    #[serde(default)]
    pub default_literal: String,
    /// Set on output pins that expose one split member of a struct-valued
    /// property, e.g. the `y` of a vector variable.
    #[serde(default)]
    pub sub_member: Option<String>,
    /// Value type for pins that become class hosted fields (sub-instance
    /// inputs, sub-graph input parameters).
    #[serde(default)]
    pub value_kind: Option<FieldKind>,
}

impl SourcePin {
    pub fn input(name: impl Into<String>, kind: PinKind) -> Self {
        Self {
            name: name.into(),
            direction: PinDirection::Input,
            kind,
            array_index: None,
            link: None,
            default_literal: String::new(),
            sub_member: None,
            value_kind: None,
        }
    }

    pub fn output(name: impl Into<String>, kind: PinKind) -> Self {
        Self {
            name: name.into(),
            direction: PinDirection::Output,
            ..Self::input("", kind)
        }
    }

    pub fn linked_to(mut self, node: Uuid, pin: impl Into<String>) -> Self {
        self.link = Some(PinLink {
            node,
            pin: pin.into(),
        });
        self
    }

    pub fn with_default(mut self, literal: impl Into<String>) -> Self {
        self.default_literal = literal.into();
        self
    }

    pub fn element(mut self, index: IndexType) -> Self {
        self.array_index = Some(index);
        self
    }

    pub fn splitting(mut self, member: impl Into<String>) -> Self {
        self.sub_member = Some(member.into());
        self
    }

    pub fn typed(mut self, kind: FieldKind) -> Self {
        self.value_kind = Some(kind);
        self
    }
}

/// Notify binding baked into the class notify table, deduplicated by the
/// full (name, event asset, state asset) triple.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotifyRef {
    pub name: String,
    #[serde(default)]
    pub event_asset: Option<String>,
    #[serde(default)]
    pub state_asset: Option<String>,
}

impl NotifyRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_asset: None,
            state_asset: None,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Linear,
    Cubic,
    EaseIn,
    EaseOut,
    EaseInOut,
    Custom,
}

/// What a getter node queries once indices are known. Resolution happens in
/// a deferred pass after all machines are baked.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GetterKind {
    AssetPlayerTime,
    AssetPlayerLength,
    AssetPlayerTimeFromEnd,
    StateWeight,
    CurrentStateElapsedTime,
    TransitionCrossfadeDuration,
}

/// Nested sub-instance metadata used for the duplicated slot and state
/// machine name scan. Nesting mirrors the delegation chain of the target
/// classes.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SubInstanceInfo {
    pub target_class: String,
    #[serde(default)]
    pub slot_names: Vec<String>,
    #[serde(default)]
    pub machine_names: Vec<String>,
    #[serde(default)]
    pub nested: Vec<SubInstanceInfo>,
}

/// Every node kind the compiler understands. Closed set: validation, baking
/// and layout hooks dispatch over the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeVariant {
    /// Final output of a top level blend graph.
    Root,
    /// Final output of a state's inner graph.
    StateResult,
    /// Boolean result of a transition or conduit rule graph.
    TransitionResult,
    /// Final output of a transition's custom blend graph.
    CustomBlendResult,
    /// Owns a nested state machine graph.
    StateMachine { machine: GraphRef },
    SaveCachedPose { cache_name: String },
    UseCachedPose { cache_name: String },
    /// Asset player sampling an animation sequence.
    SequencePlayer { sequence: String, looping: bool },
    BlendTwoWay,
    /// Pre-populated pose source inside a custom transition blend.
    PoseEvaluator,
    SubInstance { info: SubInstanceInfo },
    /// Named pose input of a graph meant to be driven externally. Survives
    /// pruning regardless of reachability.
    SubInput { input_name: String },

    // State machine graph members.
    Entry { target: Option<Uuid> },
    State(StateNodeData),
    Conduit { name: String, rule: GraphRef },
    Transition(TransitionNodeData),

    // Pure expression nodes feeding value pins.
    VariableGet { property: String, self_context: bool },
    LogicalNot,
    BreakStruct { struct_name: String },
    NativeBreak { function: String },
    CallFunction(CallFunctionData),
    Reroute,
    Getter(GetterNodeData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateNodeData {
    pub name: String,
    pub graph: GraphRef,
    #[serde(default)]
    pub entered_notify: Option<NotifyRef>,
    #[serde(default)]
    pub left_notify: Option<NotifyRef>,
    #[serde(default)]
    pub fully_blended_notify: Option<NotifyRef>,
    #[serde(default)]
    pub always_reset_on_entry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionNodeData {
    pub previous_state: Option<Uuid>,
    pub next_state: Option<Uuid>,
    pub rule: GraphRef,
    #[serde(default)]
    pub custom_blend: Option<GraphRef>,
    #[serde(default)]
    pub crossfade_duration: f32,
    #[serde(default)]
    pub blend_mode: BlendMode,
    #[serde(default)]
    pub custom_blend_curve: Option<String>,
    #[serde(default)]
    pub blend_profile: Option<String>,
    #[serde(default)]
    pub priority_order: i32,
    #[serde(default)]
    pub bidirectional: bool,
    /// Take the transition automatically when the source asset player has
    /// less than the crossfade duration remaining.
    #[serde(default)]
    pub automatic_rule: bool,
    #[serde(default)]
    pub start_notify: Option<NotifyRef>,
    #[serde(default)]
    pub end_notify: Option<NotifyRef>,
    #[serde(default)]
    pub interrupt_notify: Option<NotifyRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFunctionData {
    pub function: String,
    #[serde(default)]
    pub pure: bool,
    #[serde(default)]
    pub thread_safe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetterNodeData {
    pub kind: GetterKind,
    /// Asset player or state machine node the query targets.
    #[serde(default)]
    pub source_node: Option<Uuid>,
    #[serde(default)]
    pub source_state: Option<Uuid>,
}

impl NodeVariant {
    /// Name of the runtime struct backing this node, if it is an animation
    /// node that gets allocated a field on the generated class.
    pub fn runtime_struct(&self) -> Option<&'static str> {
        use NodeVariant::*;
        Some(match self {
            Root => "RootNode",
            StateResult => "StateResultNode",
            TransitionResult => "TransitionResultNode",
            CustomBlendResult => "CustomBlendResultNode",
            StateMachine { .. } => "StateMachineNode",
            SaveCachedPose { .. } => "SaveCachedPoseNode",
            UseCachedPose { .. } => "UseCachedPoseNode",
            SequencePlayer { .. } => "SequencePlayerNode",
            BlendTwoWay => "BlendTwoWayNode",
            PoseEvaluator => "PoseEvaluatorNode",
            SubInstance { .. } => "SubInstanceNode",
            SubInput { .. } => "SubInputNode",
            _ => return None,
        })
    }

    pub fn is_animation_node(&self) -> bool {
        self.runtime_struct().is_some()
    }

    /// Short class name used when deriving handler function names.
    pub fn class_name(&self) -> &'static str {
        use NodeVariant::*;
        match self {
            Root => "Root",
            StateResult => "StateResult",
            TransitionResult => "TransitionResult",
            CustomBlendResult => "CustomBlendResult",
            StateMachine { .. } => "StateMachine",
            SaveCachedPose { .. } => "SaveCachedPose",
            UseCachedPose { .. } => "UseCachedPose",
            SequencePlayer { .. } => "SequencePlayer",
            BlendTwoWay => "BlendTwoWay",
            PoseEvaluator => "PoseEvaluator",
            SubInstance { .. } => "SubInstance",
            SubInput { .. } => "SubInput",
            Entry { .. } => "Entry",
            State(_) => "State",
            Conduit { .. } => "Conduit",
            Transition(_) => "Transition",
            VariableGet { .. } => "VariableGet",
            LogicalNot => "LogicalNot",
            BreakStruct { .. } => "BreakStruct",
            NativeBreak { .. } => "NativeBreak",
            CallFunction(_) => "CallFunction",
            Reroute => "Reroute",
            Getter(_) => "Getter",
        }
    }

    /// Result nodes of graphs: legitimate endpoints whose pose inputs may
    /// stay unconnected without making the graph unreachable.
    pub fn is_result(&self) -> bool {
        matches!(
            self,
            NodeVariant::Root
                | NodeVariant::StateResult
                | NodeVariant::TransitionResult
                | NodeVariant::CustomBlendResult
        )
    }

    /// True roots for cached pose ordering. Inner result nodes are reached
    /// through their owning node and are not independent roots.
    pub fn is_true_root(&self) -> bool {
        matches!(self, NodeVariant::Root)
    }

    /// Side effect free nodes that may stay in the graph even when no pose
    /// path reaches them.
    pub fn is_pure(&self) -> bool {
        use NodeVariant::*;
        match self {
            VariableGet { .. } | LogicalNot | BreakStruct { .. } | NativeBreak { .. }
            | Reroute | Getter(_) => true,
            CallFunction(data) => data.pure,
            _ => false,
        }
    }

    /// Nodes kept through pruning even when unreachable, for later external
    /// wiring.
    pub fn survives_pruning(&self) -> bool {
        matches!(self, NodeVariant::SubInput { .. })
    }

    /// Whether getters may ask this node for playback time and length.
    pub fn supports_time_query(&self) -> bool {
        matches!(self, NodeVariant::SequencePlayer { .. })
    }

    pub fn is_asset_player(&self) -> bool {
        matches!(self, NodeVariant::SequencePlayer { .. })
    }
}
