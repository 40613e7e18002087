use std::collections::HashMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{IndexType, INDEX_NONE};

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("unknown node layout '{0}'")]
    UnknownNodeLayout(String),
    #[error("unknown struct layout '{0}'")]
    UnknownStructLayout(String),
    #[error("unknown field '{field}' on '{owner}'")]
    UnknownField { owner: String, field: String },
    #[error("field '{0}' is not a pose link")]
    NotAPoseLink(String),
    #[error("array index {index} out of bounds for '{field}'")]
    ArrayIndexOutOfBounds { field: String, index: IndexType },
}

/// Storage kind of a field in a runtime struct or on the generated class.
/// Sizes are fixed; the default object is a packed little-endian byte image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    F32,
    I32,
    /// Index into the class name table.
    Name,
    /// Three packed f32 components, see [`glam::Vec3`].
    Vector,
    /// Allocation index of a linked node, [`INDEX_NONE`] when unlinked.
    PoseLink,
    Array(Box<FieldKind>, IndexType),
    Struct(String),
}

impl FieldKind {
    pub fn size(&self, registry: &LayoutRegistry) -> Result<usize, LayoutError> {
        Ok(match self {
            FieldKind::Bool => 1,
            FieldKind::F32 | FieldKind::I32 => 4,
            FieldKind::Name | FieldKind::PoseLink => std::mem::size_of::<IndexType>(),
            FieldKind::Vector => 12,
            FieldKind::Array(inner, count) => inner.size(registry)? * *count as usize,
            FieldKind::Struct(name) => registry.structure(name)?.size(registry)?,
        })
    }

    /// Zeroed defaults, except link and name indices which default to
    /// [`INDEX_NONE`].
    pub fn default_bytes(&self, registry: &LayoutRegistry) -> Result<Vec<u8>, LayoutError> {
        Ok(match self {
            FieldKind::Name | FieldKind::PoseLink => INDEX_NONE.to_le_bytes().to_vec(),
            FieldKind::Array(inner, count) => {
                let element = inner.default_bytes(registry)?;
                element.repeat(*count as usize)
            }
            FieldKind::Struct(name) => registry.structure(name)?.default_bytes(registry)?,
            _ => vec![0; self.size(registry)?],
        })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldKind::Array(..))
    }

    /// Size of one element: the inner size for arrays, the full size
    /// otherwise.
    pub fn element_size(&self, registry: &LayoutRegistry) -> Result<usize, LayoutError> {
        match self {
            FieldKind::Array(inner, _) => inner.size(registry),
            other => other.size(registry),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldLayout {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldLayout {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Declared memory layout of one runtime node struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLayout {
    pub name: String,
    pub fields: Vec<FieldLayout>,
    /// Whether the runtime update of this node may run off the main thread.
    pub worker_thread_safe: bool,
}

impl NodeLayout {
    pub fn new(name: impl Into<String>, fields: Vec<FieldLayout>) -> Self {
        Self {
            name: name.into(),
            fields,
            worker_thread_safe: true,
        }
    }

    pub fn main_thread_only(mut self) -> Self {
        self.worker_thread_safe = false;
        self
    }

    pub fn size(&self, registry: &LayoutRegistry) -> Result<usize, LayoutError> {
        let mut total = 0;
        for field in &self.fields {
            total += field.kind.size(registry)?;
        }
        Ok(total)
    }

    /// Byte offset of a named field within the struct.
    pub fn field_location(
        &self,
        registry: &LayoutRegistry,
        name: &str,
    ) -> Result<(usize, &FieldLayout), LayoutError> {
        let mut offset = 0;
        for field in &self.fields {
            if field.name == name {
                return Ok((offset, field));
            }
            offset += field.kind.size(registry)?;
        }
        Err(LayoutError::UnknownField {
            owner: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Byte offset where the link index of a pose typed field is stored,
    /// addressing one element for pose link arrays.
    pub fn pose_link_location(
        &self,
        registry: &LayoutRegistry,
        name: &str,
        array_index: Option<IndexType>,
    ) -> Result<usize, LayoutError> {
        let (offset, field) = self.field_location(registry, name)?;
        match (&field.kind, array_index) {
            (FieldKind::PoseLink, None) => Ok(offset),
            (FieldKind::Array(inner, count), Some(index)) => {
                if **inner != FieldKind::PoseLink {
                    return Err(LayoutError::NotAPoseLink(name.to_string()));
                }
                if index >= *count {
                    return Err(LayoutError::ArrayIndexOutOfBounds {
                        field: name.to_string(),
                        index,
                    });
                }
                Ok(offset + index as usize * std::mem::size_of::<IndexType>())
            }
            _ => Err(LayoutError::NotAPoseLink(name.to_string())),
        }
    }

    pub fn default_bytes(&self, registry: &LayoutRegistry) -> Result<Vec<u8>, LayoutError> {
        let mut bytes = Vec::new();
        for field in &self.fields {
            bytes.extend(field.kind.default_bytes(registry)?);
        }
        Ok(bytes)
    }
}

/// Value struct that can be split or broken member-wise, e.g. a vector
/// variable read one component at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructLayout {
    pub name: String,
    pub members: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn size(&self, registry: &LayoutRegistry) -> Result<usize, LayoutError> {
        let mut total = 0;
        for member in &self.members {
            total += member.kind.size(registry)?;
        }
        Ok(total)
    }

    pub fn default_bytes(&self, registry: &LayoutRegistry) -> Result<Vec<u8>, LayoutError> {
        let mut bytes = Vec::new();
        for member in &self.members {
            bytes.extend(member.kind.default_bytes(registry)?);
        }
        Ok(bytes)
    }

    pub fn member_location(
        &self,
        registry: &LayoutRegistry,
        name: &str,
    ) -> Result<(usize, &FieldLayout), LayoutError> {
        let mut offset = 0;
        for member in &self.members {
            if member.name == name {
                return Ok((offset, member));
            }
            offset += member.kind.size(registry)?;
        }
        Err(LayoutError::UnknownField {
            owner: self.name.clone(),
            field: name.to_string(),
        })
    }
}

/// Native break functions allowed as fast path struct accessors, mapped to
/// the struct they break.
pub fn native_break_struct(function: &str) -> Option<&'static str> {
    match function {
        "BreakVector" => Some("Vector"),
        "BreakVector2D" => Some("Vector2D"),
        "BreakRotator" => Some("Rotator"),
        _ => None,
    }
}

#[derive(Default, Clone)]
pub struct LayoutRegistry {
    nodes: HashMap<String, Arc<NodeLayout>>,
    structs: HashMap<String, Arc<StructLayout>>,
}

impl LayoutRegistry {
    pub fn register_node(&mut self, layout: NodeLayout) {
        self.nodes.insert(layout.name.clone(), Arc::new(layout));
    }

    pub fn register_struct(&mut self, layout: StructLayout) {
        self.structs.insert(layout.name.clone(), Arc::new(layout));
    }

    pub fn node(&self, name: &str) -> Result<&Arc<NodeLayout>, LayoutError> {
        self.nodes
            .get(name)
            .ok_or_else(|| LayoutError::UnknownNodeLayout(name.to_string()))
    }

    pub fn structure(&self, name: &str) -> Result<&Arc<StructLayout>, LayoutError> {
        self.structs
            .get(name)
            .ok_or_else(|| LayoutError::UnknownStructLayout(name.to_string()))
    }

    /// Registry with the built in node set and breakable value structs.
    pub fn with_default_nodes() -> Self {
        use FieldKind::*;
        let mut registry = Self::default();

        registry.register_struct(StructLayout {
            name: "Vector".into(),
            members: vec![
                FieldLayout::new("x", F32),
                FieldLayout::new("y", F32),
                FieldLayout::new("z", F32),
            ],
        });
        registry.register_struct(StructLayout {
            name: "Vector2D".into(),
            members: vec![FieldLayout::new("x", F32), FieldLayout::new("y", F32)],
        });
        registry.register_struct(StructLayout {
            name: "Rotator".into(),
            members: vec![
                FieldLayout::new("roll", F32),
                FieldLayout::new("pitch", F32),
                FieldLayout::new("yaw", F32),
            ],
        });

        registry.register_node(NodeLayout::new(
            "RootNode",
            vec![
                FieldLayout::new("result", PoseLink),
                FieldLayout::new("name", Name),
            ],
        ));
        registry.register_node(NodeLayout::new(
            "StateResultNode",
            vec![FieldLayout::new("result", PoseLink)],
        ));
        registry.register_node(NodeLayout::new(
            "TransitionResultNode",
            vec![FieldLayout::new("can_enter", Bool)],
        ));
        registry.register_node(NodeLayout::new(
            "CustomBlendResultNode",
            vec![FieldLayout::new("result", PoseLink)],
        ));
        registry.register_node(NodeLayout::new(
            "StateMachineNode",
            vec![FieldLayout::new("machine_index", Name)],
        ));
        registry.register_node(NodeLayout::new(
            "SaveCachedPoseNode",
            vec![
                FieldLayout::new("pose", PoseLink),
                FieldLayout::new("cache_name", Name),
            ],
        ));
        registry.register_node(NodeLayout::new(
            "UseCachedPoseNode",
            vec![FieldLayout::new("source", PoseLink)],
        ));
        registry.register_node(NodeLayout::new(
            "SequencePlayerNode",
            vec![
                FieldLayout::new("sequence", Name),
                FieldLayout::new("play_rate", F32),
                FieldLayout::new("start_position", F32),
                FieldLayout::new("looping", Bool),
            ],
        ));
        registry.register_node(NodeLayout::new(
            "BlendTwoWayNode",
            vec![
                FieldLayout::new("a", PoseLink),
                FieldLayout::new("b", PoseLink),
                FieldLayout::new("alpha", F32),
            ],
        ));
        registry.register_node(NodeLayout::new(
            "PoseEvaluatorNode",
            vec![FieldLayout::new("source", Name)],
        ));
        // Delegates into another compiled instance on the game thread.
        registry.register_node(
            NodeLayout::new(
                "SubInstanceNode",
                vec![
                    FieldLayout::new("target_class", Name),
                    FieldLayout::new("input_poses", Array(Box::new(PoseLink), 4)),
                ],
            )
            .main_thread_only(),
        );
        registry.register_node(NodeLayout::new(
            "SubInputNode",
            vec![
                FieldLayout::new("graph", Name),
                FieldLayout::new("input_name", Name),
            ],
        ));

        registry
    }
}
