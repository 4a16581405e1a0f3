//! Abstract Syntax Tree definitions for Ember
//!
//! Nodes live in an arena (`Ast`) and refer to each other by `NodeId`.
//! Children are listed in the node kind; `parent`, `func`, `module` and
//! `this` are plain back-references filled in by the resolver.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::frontend::symtab::{EntryId, ScopeId};
use crate::types::TypeId;
use crate::utils::Span;

/// Handle to a node of the AST arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(index: usize) -> Self {
        NodeId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

bitflags! {
    /// Per-node semantic flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u16 {
        /// The node denotes a type
        const TYPE   = 1 << 0;
        /// The node is an lvalue
        const ADDR   = 1 << 1;
        const MUT    = 1 << 2;
        /// The node may be assigned to
        const VAR    = 1 << 3;
        const CONST  = 1 << 4;
        const USED   = 1 << 5;
        /// The node has no value
        const VOID   = 1 << 6;
        const PURE   = 1 << 7;
        const MEMBER = 1 << 8;
        /// Method accessed through a value
        const STATIC = 1 << 9;

        /// Flags an identifier inherits from its declaration
        const STORAGE = Self::MUT.bits() | Self::VAR.bits() | Self::CONST.bits();
    }
}

/// Memoized type slot of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeState {
    #[default]
    Untyped,
    InProgress,
    Typed(TypeId),
}

impl TypeState {
    pub fn get(self) -> Option<TypeId> {
        match self {
            TypeState::Typed(ty) => Some(ty),
            _ => None,
        }
    }
}

/// Declared storage class of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    Const,
    #[default]
    Immutable,
    Mut,
    Var,
}

impl Storage {
    pub fn flags(self) -> NodeFlags {
        match self {
            Storage::Const => NodeFlags::CONST,
            Storage::Immutable => NodeFlags::empty(),
            Storage::Mut => NodeFlags::MUT,
            Storage::Var => NodeFlags::MUT | NodeFlags::VAR,
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Comparison operators, which always yield `bool`
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

/// Where a typed declaration appears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclRole {
    Param,
    Field,
    Global,
}

/// Function attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunAttrs {
    pub export: bool,
    /// External symbol; imported functions have no body
    pub import: Option<String>,
    pub export_as: Option<String>,
    /// Requires a mutable receiver
    pub mutating: bool,
}

// ==================== Nodes ====================

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Ident {
        name: String,
    },
    Int {
        value: u64,
    },
    Str {
        value: String,
    },
    BinOp {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    AddrOf {
        operand: NodeId,
    },
    Deref {
        operand: NodeId,
    },
    Call {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    Index {
        base: NodeId,
        index: NodeId,
    },
    Attr {
        base: NodeId,
        name: String,
    },
    New {
        ty: NodeId,
        args: Vec<NodeId>,
    },
    Cast {
        expr: NodeId,
        ty: NodeId,
    },
    PtrType {
        mutable: bool,
        pointee: NodeId,
    },
    Generic {
        base: NodeId,
        args: Vec<NodeId>,
    },
    TypeParam {
        name: String,
        index: usize,
    },
    Struct {
        name: String,
        params: Vec<NodeId>,
        members: Vec<NodeId>,
        export: bool,
    },
    Fun {
        name: String,
        ret: Option<NodeId>,
        params: NodeId,
        body: Option<NodeId>,
        attrs: FunAttrs,
    },
    ArgList {
        items: Vec<NodeId>,
    },
    Decl {
        name: String,
        ty: NodeId,
        init: Option<NodeId>,
        storage: Storage,
        role: DeclRole,
        export: bool,
    },
    Let {
        name: String,
        init: NodeId,
        storage: Storage,
    },
    Assign {
        lhs: NodeId,
        rhs: NodeId,
    },
    Return {
        value: Option<NodeId>,
    },
    If {
        cond: NodeId,
        then: NodeId,
        els: Option<NodeId>,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    Block {
        stmts: Vec<NodeId>,
    },
    Module {
        name: String,
        imports: Vec<String>,
        decls: Vec<NodeId>,
    },
    /// Synthetic `this` of a struct or method
    Receiver {
        owner: NodeId,
    },
}

/// One AST node with its semantic annotations
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub flags: NodeFlags,
    pub ty: TypeState,
    /// Scope the node is resolved in
    pub scope: Option<ScopeId>,
    /// Scope owned by modules, structs (members) and functions
    pub inner_scope: Option<ScopeId>,
    /// Symbol-table entry of an identifier
    pub entry: Option<EntryId>,
    /// Declaration an identifier, attribute, call or `new` ends up at
    pub target: Option<NodeId>,
    pub parent: Option<NodeId>,
    pub func: Option<NodeId>,
    pub module: Option<NodeId>,
    pub this: Option<NodeId>,
}

impl Node {
    fn new(kind: NodeKind, span: Span) -> Self {
        Self {
            kind,
            span,
            flags: NodeFlags::empty(),
            ty: TypeState::Untyped,
            scope: None,
            inner_scope: None,
            entry: None,
            target: None,
            parent: None,
            func: None,
            module: None,
            this: None,
        }
    }

    /// Name introduced by a declaration
    pub fn decl_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Struct { name, .. }
            | NodeKind::Fun { name, .. }
            | NodeKind::Decl { name, .. }
            | NodeKind::Let { name, .. }
            | NodeKind::TypeParam { name, .. }
            | NodeKind::Module { name, .. } => Some(name),
            NodeKind::Receiver { .. } => Some("this"),
            _ => None,
        }
    }

    /// Declarations that own storage
    pub fn is_storage(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Decl { .. } | NodeKind::Let { .. } | NodeKind::Receiver { .. }
        )
    }

    pub fn is_exported(&self) -> bool {
        match &self.kind {
            NodeKind::Struct { export, .. } | NodeKind::Decl { export, .. } => *export,
            NodeKind::Fun { attrs, .. } => attrs.export,
            _ => false,
        }
    }
}

/// AST arena
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
    modules: Vec<NodeId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: NodeKind, span: Span) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(Node::new(kind, span));
        id
    }

    /// Add a module node and register it as a compilation root
    pub fn add_module(
        &mut self,
        name: &str,
        imports: Vec<String>,
        decls: Vec<NodeId>,
        span: Span,
    ) -> NodeId {
        let id = self.add(
            NodeKind::Module {
                name: name.to_string(),
                imports,
                decls,
            },
            span,
        );
        self.modules.push(id);
        id
    }

    pub fn modules(&self) -> &[NodeId] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId::new)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.index()) {
            Some(n) => n,
            None => crate::ice!("dangling node id {}", id),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.index()) {
            Some(n) => n,
            None => crate::ice!("dangling node id {}", id),
        }
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.node(id).span
    }

    pub fn flags(&self, id: NodeId) -> NodeFlags {
        self.node(id).flags
    }

    pub fn type_of(&self, id: NodeId) -> Option<TypeId> {
        self.node(id).ty.get()
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.node(id).decl_name()
    }

    /// Name of the module a node belongs to
    pub fn module_name(&self, id: NodeId) -> &str {
        let module = if matches!(self.kind(id), NodeKind::Module { .. }) {
            Some(id)
        } else {
            self.node(id).module
        };
        module.and_then(|m| self.name(m)).unwrap_or("<builtin>")
    }

    /// Children in source order
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.kind(id) {
            NodeKind::Ident { .. }
            | NodeKind::Int { .. }
            | NodeKind::Str { .. }
            | NodeKind::TypeParam { .. }
            | NodeKind::Receiver { .. } => Vec::new(),
            NodeKind::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeKind::AddrOf { operand } | NodeKind::Deref { operand } => vec![*operand],
            NodeKind::Call { callee, args } => {
                std::iter::once(*callee).chain(args.iter().copied()).collect()
            }
            NodeKind::Index { base, index } => vec![*base, *index],
            NodeKind::Attr { base, .. } => vec![*base],
            NodeKind::New { ty, args } => std::iter::once(*ty).chain(args.iter().copied()).collect(),
            NodeKind::Cast { expr, ty } => vec![*expr, *ty],
            NodeKind::PtrType { pointee, .. } => vec![*pointee],
            NodeKind::Generic { base, args } => {
                std::iter::once(*base).chain(args.iter().copied()).collect()
            }
            NodeKind::Struct {
                params, members, ..
            } => params.iter().chain(members).copied().collect(),
            NodeKind::Fun {
                ret, params, body, ..
            } => ret
                .iter()
                .copied()
                .chain(std::iter::once(*params))
                .chain(body.iter().copied())
                .collect(),
            NodeKind::ArgList { items } => items.clone(),
            NodeKind::Decl { ty, init, .. } => {
                std::iter::once(*ty).chain(init.iter().copied()).collect()
            }
            NodeKind::Let { init, .. } => vec![*init],
            NodeKind::Assign { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Return { value } => value.iter().copied().collect(),
            NodeKind::If { cond, then, els } => {
                let mut v = vec![*cond, *then];
                v.extend(els.iter().copied());
                v
            }
            NodeKind::While { cond, body } => vec![*cond, *body],
            NodeKind::Block { stmts } => stmts.clone(),
            NodeKind::Module { decls, .. } => decls.clone(),
        }
    }

    /// Parameter declarations of a function
    pub fn fun_params(&self, fun: NodeId) -> Vec<NodeId> {
        match self.kind(fun) {
            NodeKind::Fun { params, .. } => self.children(*params),
            _ => Vec::new(),
        }
    }

    pub fn is_literal(&self, id: NodeId) -> bool {
        matches!(self.kind(id), NodeKind::Int { .. })
    }

    /// Whether a function is a constructor (magic `new` of a struct)
    pub fn is_constructor(&self, fun: NodeId) -> bool {
        matches!(self.kind(fun), NodeKind::Fun { name, .. } if name == "new")
            && self.flags(fun).contains(NodeFlags::MEMBER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_follow_source_order() {
        let mut ast = Ast::new();
        let f = ast.add(NodeKind::Ident { name: "f".into() }, Span::dummy());
        let a = ast.add(NodeKind::Int { value: 1 }, Span::dummy());
        let b = ast.add(NodeKind::Int { value: 2 }, Span::dummy());
        let call = ast.add(
            NodeKind::Call {
                callee: f,
                args: vec![a, b],
            },
            Span::dummy(),
        );
        assert_eq!(ast.children(call), vec![f, a, b]);
        assert!(ast.is_literal(a));
    }

    #[test]
    fn test_storage_flags() {
        assert_eq!(Storage::Var.flags(), NodeFlags::MUT | NodeFlags::VAR);
        assert!(Storage::Immutable.flags().is_empty());
        assert!(NodeFlags::STORAGE.contains(NodeFlags::CONST));
    }

    #[test]
    fn test_module_name_of_nested_node() {
        let mut ast = Ast::new();
        let x = ast.add(NodeKind::Ident { name: "x".into() }, Span::dummy());
        let m = ast.add_module("main", Vec::new(), Vec::new(), Span::dummy());
        ast.node_mut(x).module = Some(m);
        assert_eq!(ast.module_name(x), "main");
        assert_eq!(ast.module_name(m), "main");
    }
}
