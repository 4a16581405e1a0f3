//! Type graph

pub mod type_system;

pub use type_system::{Builtin, Magic, MagicTable, TypeArena, TypeId, TypeKind, TypeStats};
