pub type IndexType = u16;

/// Sentinel for "no node linked" in raw default object memory.
pub const INDEX_NONE: IndexType = IndexType::MAX;

#[cfg(feature = "compiler")]
pub mod compiler;

mod diagnostics;
mod generated;
mod layout;
mod model;

pub mod state_machine;

pub use crate::diagnostics::*;
pub use crate::generated::*;
pub use crate::layout::*;
pub use crate::model::*;

pub use anyhow;
pub use glam;
pub use serde;
pub use serde_derive;
pub use serde_json;
pub use uuid;
