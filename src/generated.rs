use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::{
    BakedNotify, BakedStateMachine, MachineIndex, MachineValidationError, NodeIndex, StateIndex,
    TransitionIndex,
};
use crate::{FieldKind, GetterKind, IndexType, LayoutError, LayoutRegistry};

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct FieldIndex(pub IndexType);

impl From<FieldIndex> for usize {
    fn from(value: FieldIndex) -> Self {
        value.0 as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClassFieldKind {
    /// Plain value field, e.g. a document variable or a sub-graph input.
    Value(FieldKind),
    /// Embedded runtime node struct, named by its layout.
    Node(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassField {
    pub name: String,
    pub kind: ClassFieldKind,
    pub offset: usize,
    pub size: usize,
}

#[derive(Error, Debug)]
pub enum LiteralError {
    #[error("cannot parse '{text}' as {kind:?}")]
    Parse { text: String, kind: FieldKind },
    #[error("literal values are not supported for {0:?}")]
    Unsupported(FieldKind),
    #[error("write of {size} bytes at {offset} is out of bounds")]
    OutOfBounds { offset: usize, size: usize },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostCopyOperation {
    #[default]
    None,
    LogicalNegateBool,
}

/// Finalized fast path copy: a raw memory move performed every frame
/// without invoking any function.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CopyRecord {
    pub source_property: String,
    pub source_sub_member: Option<String>,
    pub dest_property: String,
    pub dest_array_index: Option<IndexType>,
    pub size: usize,
    pub post_operation: PostCopyOperation,
    /// Destination is a field hosted directly on the class rather than
    /// inside the node struct.
    pub instance_target: bool,
}

/// One entry of the exposed input handler table: either a compact copy
/// record array (fast path) or the name of a synthetic update function.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExposedValueHandler {
    pub node: NodeIndex,
    /// `None` when every copy qualified as fast path.
    pub bound_function: Option<String>,
    pub copy_records: Vec<CopyRecord>,
}

impl ExposedValueHandler {
    pub fn is_fast_path(&self) -> bool {
        self.bound_function.is_none()
    }
}

/// Getter query resolved to compiled indices during the deferred wiring
/// pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledGetter {
    pub kind: GetterKind,
    pub source_node: Option<NodeIndex>,
    pub machine: Option<MachineIndex>,
    pub state: Option<StateIndex>,
    pub transition: Option<TransitionIndex>,
}

#[derive(Error, Debug)]
pub enum ClassValidationError {
    #[error("machine '{name}': {error}")]
    Machine {
        name: String,
        error: MachineValidationError,
    },
    #[error("handler references missing node {0:?}")]
    HandlerNodeOutOfRange(NodeIndex),
    #[error("cached pose order references missing node {0:?}")]
    CachedPoseNodeOutOfRange(NodeIndex),
    #[error("animation node field out of range")]
    NodeFieldOutOfRange,
}

/// The persistent output of one compile: field layout, patched default
/// object bytes and the baked tables the runtime evaluator consumes.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GeneratedClass {
    pub name: String,
    pub fields: Vec<ClassField>,
    /// Interned strings referenced by `FieldKind::Name` values.
    pub names: Vec<String>,
    pub default_object: Vec<u8>,
    /// Dense array of allocated node fields, indexed by [`NodeIndex`].
    pub animation_nodes: Vec<FieldIndex>,
    pub state_machines: Vec<BakedStateMachine>,
    pub notifies: Vec<BakedNotify>,
    /// Per root graph, save-node update order for the runtime evaluator.
    pub cached_pose_order: BTreeMap<String, Vec<NodeIndex>>,
    pub handlers: Vec<ExposedValueHandler>,
    pub getters: Vec<CompiledGetter>,
    /// Source node association surviving recompiles, for pose watching.
    pub node_guids: BTreeMap<Uuid, NodeIndex>,
    pub worker_thread_update: bool,
}

impl GeneratedClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_thread_update: true,
            ..Default::default()
        }
    }

    /// Allocate a typed field on the class under construction, extending
    /// the default object with the field's default bytes. Returns `None`
    /// when the name is already taken.
    pub fn create_named_field(
        &mut self,
        name: &str,
        kind: ClassFieldKind,
        registry: &LayoutRegistry,
    ) -> Result<Option<FieldIndex>, LayoutError> {
        if self.find_field_by_name(name).is_some() {
            return Ok(None);
        }
        let defaults = match &kind {
            ClassFieldKind::Value(value) => value.default_bytes(registry)?,
            ClassFieldKind::Node(layout) => registry.node(layout)?.default_bytes(registry)?,
        };
        let index = FieldIndex(self.fields.len() as IndexType);
        self.fields.push(ClassField {
            name: name.to_string(),
            kind,
            offset: self.default_object.len(),
            size: defaults.len(),
        });
        self.default_object.extend(defaults);
        Ok(Some(index))
    }

    pub fn find_field_by_name(&self, name: &str) -> Option<(FieldIndex, &ClassField)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, field)| field.name == name)
            .map(|(index, field)| (FieldIndex(index as IndexType), field))
    }

    pub fn field(&self, index: FieldIndex) -> Option<&ClassField> {
        self.fields.get(index.0 as usize)
    }

    pub fn node_field(&self, node: NodeIndex) -> Option<&ClassField> {
        let field = *self.animation_nodes.get(node.0 as usize)?;
        self.field(field)
    }

    pub fn intern_name(&mut self, name: &str) -> IndexType {
        if let Some(index) = self.names.iter().position(|existing| existing == name) {
            return index as IndexType;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as IndexType
    }

    pub fn name(&self, index: IndexType) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    /// Copy raw bytes into the default object at an absolute offset.
    pub fn copy_raw_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), LiteralError> {
        let end = offset + bytes.len();
        if end > self.default_object.len() {
            return Err(LiteralError::OutOfBounds {
                offset,
                size: bytes.len(),
            });
        }
        self.default_object[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_raw_bytes(&self, offset: usize, size: usize) -> Option<&[u8]> {
        self.default_object.get(offset..offset + size)
    }

    /// Parse literal text directly into the raw memory of a field element.
    pub fn parse_literal_into_field(
        &mut self,
        kind: &FieldKind,
        literal: &str,
        offset: usize,
        registry: &LayoutRegistry,
    ) -> Result<(), LiteralError> {
        let bytes = self.literal_bytes(kind, literal, registry)?;
        self.copy_raw_bytes(offset, &bytes)
    }

    fn literal_bytes(
        &mut self,
        kind: &FieldKind,
        literal: &str,
        registry: &LayoutRegistry,
    ) -> Result<Vec<u8>, LiteralError> {
        let parse_error = || LiteralError::Parse {
            text: literal.to_string(),
            kind: kind.clone(),
        };
        Ok(match kind {
            FieldKind::Bool => {
                let value = match literal.trim() {
                    "true" | "True" | "1" => true,
                    "false" | "False" | "0" => false,
                    _ => return Err(parse_error()),
                };
                vec![value as u8]
            }
            FieldKind::F32 => {
                let value: f32 = literal.trim().parse().map_err(|_| parse_error())?;
                value.to_le_bytes().to_vec()
            }
            FieldKind::I32 => {
                let value: i32 = literal.trim().parse().map_err(|_| parse_error())?;
                value.to_le_bytes().to_vec()
            }
            FieldKind::Name => self.intern_name(literal).to_le_bytes().to_vec(),
            FieldKind::Vector => {
                let mut components = literal.split(',');
                let mut next = || -> Result<f32, LiteralError> {
                    components
                        .next()
                        .and_then(|part| part.trim().parse().ok())
                        .ok_or_else(parse_error)
                };
                let value = glam::Vec3::new(next()?, next()?, next()?);
                let mut bytes = Vec::with_capacity(12);
                for component in value.to_array() {
                    bytes.extend(component.to_le_bytes());
                }
                bytes
            }
            FieldKind::Struct(name) => {
                let object: serde_json::Value =
                    serde_json::from_str(literal).map_err(|_| parse_error())?;
                let layout = registry.structure(name)?.clone();
                let mut bytes = Vec::new();
                for member in &layout.members {
                    match object.get(&member.name) {
                        Some(value) => {
                            let text = match value.as_str() {
                                Some(text) => text.to_string(),
                                None => value.to_string(),
                            };
                            bytes.extend(self.literal_bytes(&member.kind, &text, registry)?);
                        }
                        None => bytes.extend(member.kind.default_bytes(registry)?),
                    }
                }
                bytes
            }
            FieldKind::PoseLink | FieldKind::Array(..) => {
                return Err(LiteralError::Unsupported(kind.clone()))
            }
        })
    }

    pub fn validate(&self) -> Result<(), ClassValidationError> {
        let total_nodes = self.animation_nodes.len();

        for field in &self.animation_nodes {
            if field.0 as usize >= self.fields.len() {
                return Err(ClassValidationError::NodeFieldOutOfRange);
            }
        }

        for machine in &self.state_machines {
            machine
                .validate(self.notifies.len(), total_nodes)
                .map_err(|error| ClassValidationError::Machine {
                    name: machine.name.clone(),
                    error,
                })?;
        }

        for handler in &self.handlers {
            if handler.node.0 as usize >= total_nodes {
                return Err(ClassValidationError::HandlerNodeOutOfRange(handler.node));
            }
        }

        for order in self.cached_pose_order.values() {
            for node in order {
                if node.0 as usize >= total_nodes {
                    return Err(ClassValidationError::CachedPoseNodeOutOfRange(*node));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_extend_the_default_object() {
        let registry = LayoutRegistry::with_default_nodes();
        let mut class = GeneratedClass::new("Test");
        let first = class
            .create_named_field("alpha", ClassFieldKind::Value(FieldKind::F32), &registry)
            .unwrap()
            .unwrap();
        let second = class
            .create_named_field(
                "player",
                ClassFieldKind::Node("SequencePlayerNode".into()),
                &registry,
            )
            .unwrap()
            .unwrap();
        assert!(class
            .create_named_field("alpha", ClassFieldKind::Value(FieldKind::Bool), &registry)
            .unwrap()
            .is_none());

        let alpha = class.field(first).unwrap();
        assert_eq!((alpha.offset, alpha.size), (0, 4));
        let player = class.field(second).unwrap();
        assert_eq!(player.offset, 4);
        assert_eq!(class.default_object.len(), player.offset + player.size);
    }

    #[test]
    fn literals_parse_into_raw_memory() {
        let registry = LayoutRegistry::with_default_nodes();
        let mut class = GeneratedClass::new("Test");
        class
            .create_named_field("speed", ClassFieldKind::Value(FieldKind::F32), &registry)
            .unwrap()
            .unwrap();

        class
            .parse_literal_into_field(&FieldKind::F32, "2.5", 0, &registry)
            .unwrap();
        let bytes = class.read_raw_bytes(0, 4).unwrap();
        assert_eq!(f32::from_le_bytes(bytes.try_into().unwrap()), 2.5);

        assert!(class
            .parse_literal_into_field(&FieldKind::F32, "fast", 0, &registry)
            .is_err());
        assert!(class
            .parse_literal_into_field(&FieldKind::PoseLink, "1", 0, &registry)
            .is_err());
    }

    #[test]
    fn names_are_interned_once() {
        let mut class = GeneratedClass::new("Test");
        let first = class.intern_name("Idle");
        let second = class.intern_name("Walk");
        assert_eq!(class.intern_name("Idle"), first);
        assert_ne!(first, second);
        assert_eq!(class.name(second), Some("Walk"));
    }
}
