//! Parser output contract
//!
//! The parser hands over a serialized tree (JSON in practice). This module
//! defines its shape and lowers it into the `Ast` arena; nothing in here
//! carries semantic information.

use serde::{Deserialize, Serialize};

use crate::frontend::ast::{Ast, BinOp, DeclRole, FunAttrs, NodeFlags, NodeId, NodeKind, Storage};
use crate::utils::{Options, Span};

/// A compilation unit: every module handed over by the parser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub modules: Vec<Module>,
    /// Overrides for the driver options
    #[serde(default)]
    pub options: Option<Options>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Item {
    Struct(StructItem),
    Fun(FunItem),
    Global(DeclItem),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructItem {
    pub name: String,
    /// Type parameter names of a generic struct
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub members: Vec<Item>,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunItem {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub ret: Option<Expr>,
    /// Absent for imported functions
    #[serde(default)]
    pub body: Option<Vec<Stmt>>,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub import: Option<String>,
    #[serde(default)]
    pub export_as: Option<String>,
    #[serde(default)]
    pub mutating: bool,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Expr,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub span: Span,
}

/// Struct field or global
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclItem {
    pub name: String,
    pub ty: Expr,
    #[serde(default)]
    pub init: Option<Expr>,
    #[serde(default = "default_decl_storage")]
    pub storage: Storage,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub span: Span,
}

fn default_decl_storage() -> Storage {
    Storage::Var
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stmt {
    Let {
        name: String,
        init: Expr,
        #[serde(default)]
        storage: Storage,
        #[serde(default)]
        span: Span,
    },
    Assign {
        lhs: Expr,
        rhs: Expr,
        #[serde(default)]
        span: Span,
    },
    Return {
        #[serde(default)]
        value: Option<Expr>,
        #[serde(default)]
        span: Span,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        #[serde(default, rename = "else")]
        els: Option<Vec<Stmt>>,
        #[serde(default)]
        span: Span,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        #[serde(default)]
        span: Span,
    },
    Block {
        stmts: Vec<Stmt>,
        #[serde(default)]
        span: Span,
    },
    Expr {
        expr: Expr,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Ident {
        name: String,
        #[serde(default)]
        span: Span,
    },
    Int {
        value: u64,
        #[serde(default)]
        span: Span,
    },
    Str {
        value: String,
        #[serde(default)]
        span: Span,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Addr {
        operand: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Deref {
        operand: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Call {
        callee: Box<Expr>,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        span: Span,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Attr {
        base: Box<Expr>,
        name: String,
        #[serde(default)]
        span: Span,
    },
    New {
        ty: Box<Expr>,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        span: Span,
    },
    Cast {
        expr: Box<Expr>,
        ty: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Ptr {
        #[serde(default)]
        mutable: bool,
        pointee: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Generic {
        base: Box<Expr>,
        args: Vec<Expr>,
        #[serde(default)]
        span: Span,
    },
}

// ==================== Lowering ====================

impl Unit {
    /// Lower every module into `ast`, returning the module nodes
    pub fn lower(&self, ast: &mut Ast) -> Vec<NodeId> {
        self.modules.iter().map(|m| m.lower(ast)).collect()
    }
}

impl Module {
    fn lower(&self, ast: &mut Ast) -> NodeId {
        let decls = self.items.iter().map(|i| i.lower(ast)).collect();
        ast.add_module(&self.name, self.imports.clone(), decls, self.span)
    }
}

impl Item {
    fn lower(&self, ast: &mut Ast) -> NodeId {
        match self {
            Item::Struct(s) => {
                let params = s
                    .params
                    .iter()
                    .enumerate()
                    .map(|(index, name)| {
                        ast.add(
                            NodeKind::TypeParam {
                                name: name.clone(),
                                index,
                            },
                            s.span,
                        )
                    })
                    .collect();
                let members = s
                    .members
                    .iter()
                    .map(|m| match m {
                        Item::Global(d) => d.lower(ast, DeclRole::Field),
                        other => other.lower(ast),
                    })
                    .collect();
                ast.add(
                    NodeKind::Struct {
                        name: s.name.clone(),
                        params,
                        members,
                        export: s.export,
                    },
                    s.span,
                )
            }
            Item::Fun(f) => f.lower(ast),
            Item::Global(d) => d.lower(ast, DeclRole::Global),
        }
    }
}

impl FunItem {
    fn lower(&self, ast: &mut Ast) -> NodeId {
        let ret = self.ret.as_ref().map(|r| r.lower(ast));
        let items = self
            .params
            .iter()
            .map(|p| {
                let ty = p.ty.lower(ast);
                ast.add(
                    NodeKind::Decl {
                        name: p.name.clone(),
                        ty,
                        init: None,
                        storage: p.storage,
                        role: DeclRole::Param,
                        export: false,
                    },
                    p.span,
                )
            })
            .collect();
        let params = ast.add(NodeKind::ArgList { items }, self.span);
        let body = self.body.as_ref().map(|b| lower_block(ast, b, self.span));
        ast.add(
            NodeKind::Fun {
                name: self.name.clone(),
                ret,
                params,
                body,
                attrs: FunAttrs {
                    export: self.export,
                    import: self.import.clone(),
                    export_as: self.export_as.clone(),
                    mutating: self.mutating,
                },
            },
            self.span,
        )
    }
}

impl DeclItem {
    fn lower(&self, ast: &mut Ast, role: DeclRole) -> NodeId {
        let ty = self.ty.lower(ast);
        let init = self.init.as_ref().map(|i| i.lower(ast));
        ast.add(
            NodeKind::Decl {
                name: self.name.clone(),
                ty,
                init,
                storage: self.storage,
                role,
                export: self.export,
            },
            self.span,
        )
    }
}

fn lower_block(ast: &mut Ast, stmts: &[Stmt], span: Span) -> NodeId {
    let stmts = stmts.iter().map(|s| s.lower(ast)).collect();
    ast.add(NodeKind::Block { stmts }, span)
}

impl Stmt {
    fn lower(&self, ast: &mut Ast) -> NodeId {
        match self {
            Stmt::Let {
                name,
                init,
                storage,
                span,
            } => {
                let init = init.lower(ast);
                ast.add(
                    NodeKind::Let {
                        name: name.clone(),
                        init,
                        storage: *storage,
                    },
                    *span,
                )
            }
            Stmt::Assign { lhs, rhs, span } => {
                let lhs = lhs.lower(ast);
                let rhs = rhs.lower(ast);
                ast.add(NodeKind::Assign { lhs, rhs }, *span)
            }
            Stmt::Return { value, span } => {
                let value = value.as_ref().map(|v| v.lower(ast));
                ast.add(NodeKind::Return { value }, *span)
            }
            Stmt::If {
                cond,
                then,
                els,
                span,
            } => {
                let cond = cond.lower(ast);
                let then = lower_block(ast, then, *span);
                let els = els.as_ref().map(|e| lower_block(ast, e, *span));
                ast.add(NodeKind::If { cond, then, els }, *span)
            }
            Stmt::While { cond, body, span } => {
                let cond = cond.lower(ast);
                let body = lower_block(ast, body, *span);
                ast.add(NodeKind::While { cond, body }, *span)
            }
            Stmt::Block { stmts, span } => lower_block(ast, stmts, *span),
            Stmt::Expr { expr } => expr.lower(ast),
        }
    }
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Ident { span, .. }
            | Expr::Int { span, .. }
            | Expr::Str { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Addr { span, .. }
            | Expr::Deref { span, .. }
            | Expr::Call { span, .. }
            | Expr::Index { span, .. }
            | Expr::Attr { span, .. }
            | Expr::New { span, .. }
            | Expr::Cast { span, .. }
            | Expr::Ptr { span, .. }
            | Expr::Generic { span, .. } => *span,
        }
    }

    fn lower(&self, ast: &mut Ast) -> NodeId {
        let span = self.span();
        match self {
            Expr::Ident { name, .. } => ast.add(NodeKind::Ident { name: name.clone() }, span),
            Expr::Int { value, .. } => {
                let id = ast.add(NodeKind::Int { value: *value }, span);
                ast.node_mut(id).flags |= NodeFlags::PURE;
                id
            }
            Expr::Str { value, .. } => {
                let id = ast.add(
                    NodeKind::Str {
                        value: value.clone(),
                    },
                    span,
                );
                ast.node_mut(id).flags |= NodeFlags::PURE;
                id
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let lhs = lhs.lower(ast);
                let rhs = rhs.lower(ast);
                ast.add(NodeKind::BinOp { op: *op, lhs, rhs }, span)
            }
            Expr::Addr { operand, .. } => {
                let operand = operand.lower(ast);
                ast.add(NodeKind::AddrOf { operand }, span)
            }
            Expr::Deref { operand, .. } => {
                let operand = operand.lower(ast);
                let id = ast.add(NodeKind::Deref { operand }, span);
                ast.node_mut(id).flags |= NodeFlags::ADDR;
                id
            }
            Expr::Call { callee, args, .. } => {
                let callee = callee.lower(ast);
                let args = args.iter().map(|a| a.lower(ast)).collect();
                ast.add(NodeKind::Call { callee, args }, span)
            }
            Expr::Index { base, index, .. } => {
                let base = base.lower(ast);
                let index = index.lower(ast);
                let id = ast.add(NodeKind::Index { base, index }, span);
                ast.node_mut(id).flags |= NodeFlags::ADDR;
                id
            }
            Expr::Attr { base, name, .. } => {
                let base = base.lower(ast);
                ast.add(
                    NodeKind::Attr {
                        base,
                        name: name.clone(),
                    },
                    span,
                )
            }
            Expr::New { ty, args, .. } => {
                let ty = ty.lower(ast);
                let args = args.iter().map(|a| a.lower(ast)).collect();
                ast.add(NodeKind::New { ty, args }, span)
            }
            Expr::Cast { expr, ty, .. } => {
                let expr = expr.lower(ast);
                let ty = ty.lower(ast);
                ast.add(NodeKind::Cast { expr, ty }, span)
            }
            Expr::Ptr {
                mutable, pointee, ..
            } => {
                let pointee = pointee.lower(ast);
                ast.add(
                    NodeKind::PtrType {
                        mutable: *mutable,
                        pointee,
                    },
                    span,
                )
            }
            Expr::Generic { base, args, .. } => {
                let base = base.lower(ast);
                let args = args.iter().map(|a| a.lower(ast)).collect();
                ast.add(NodeKind::Generic { base, args }, span)
            }
        }
    }
}
