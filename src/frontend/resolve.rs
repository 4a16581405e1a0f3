//! Scope resolution
//!
//! Two passes over the tree:
//! - bind: fills back-references, creates scopes and enters every
//!   declaration before its siblings are visited, so module and struct
//!   bodies may refer forward;
//! - resolve: looks up every identifier and checks address-of operands.

use std::collections::HashMap;

use crate::frontend::ast::{Ast, DeclRole, NodeFlags, NodeId, NodeKind};
use crate::frontend::symtab::{Binding, ScopeId, SymbolTable};
use crate::utils::{Diagnostics, Error};

#[derive(Debug, Clone, Copy, Default)]
struct Ctx {
    module: Option<NodeId>,
    func: Option<NodeId>,
    strukt: Option<NodeId>,
}

/// Scope resolver
pub struct Resolver<'a> {
    ast: &'a mut Ast,
    symtab: &'a mut SymbolTable,
    diags: &'a mut Diagnostics,
    module_scopes: HashMap<String, ScopeId>,
}

impl<'a> Resolver<'a> {
    pub fn new(ast: &'a mut Ast, symtab: &'a mut SymbolTable, diags: &'a mut Diagnostics) -> Self {
        Self {
            ast,
            symtab,
            diags,
            module_scopes: HashMap::new(),
        }
    }

    /// Run both passes over every module of the AST
    pub fn run(&mut self) {
        let modules = self.ast.modules().to_vec();
        let root = self.symtab.root();
        for &m in &modules {
            self.bind(m, None, root, Ctx::default());
        }
        self.link_imports(&modules);
        for &m in &modules {
            self.diags.set_module(self.ast.module_name(m));
            self.resolve_node(m);
        }
        log::debug!(
            "resolved {} module(s), {} scope(s), {} error(s)",
            modules.len(),
            self.symtab.scope_count(),
            self.diags.error_count()
        );
    }

    // ==================== Pass 1: bind ====================

    fn link(&mut self, n: NodeId, parent: Option<NodeId>, scope: ScopeId, ctx: Ctx) {
        let node = self.ast.node_mut(n);
        node.parent = parent;
        node.scope = Some(scope);
        node.module = ctx.module;
        node.func = ctx.func;
    }

    fn add(&mut self, scope: ScopeId, name: &str, binding: Binding) {
        self.symtab.add(scope, name, binding, &*self.ast, &mut *self.diags);
    }

    /// Enter a module or struct member ahead of its siblings
    fn declare(&mut self, scope: ScopeId, d: NodeId, ctx: Ctx) {
        self.ast.node_mut(d).module = ctx.module;
        let binding = match self.ast.kind(d) {
            NodeKind::Fun { .. } => Binding::Overloads(vec![d]),
            NodeKind::Struct { .. } | NodeKind::Decl { .. } => Binding::Node(d),
            _ => return,
        };
        if let Some(name) = self.ast.name(d).map(str::to_string) {
            self.add(scope, &name, binding);
        }
    }

    fn receiver(&mut self, owner: NodeId, scope: ScopeId, flags: NodeFlags, ctx: Ctx) -> NodeId {
        let span = self.ast.span(owner);
        let this = self.ast.add(NodeKind::Receiver { owner }, span);
        self.link(this, Some(owner), scope, ctx);
        self.ast.node_mut(this).flags |= flags;
        self.ast.node_mut(owner).this = Some(this);
        self.add(scope, "this", Binding::Node(this));
        this
    }

    fn bind(&mut self, n: NodeId, parent: Option<NodeId>, scope: ScopeId, ctx: Ctx) {
        self.link(n, parent, scope, ctx);
        let kind = self.ast.kind(n).clone();
        match kind {
            NodeKind::Module { name, decls, .. } => {
                let ms = self.symtab.new_scope(scope);
                self.ast.node_mut(n).inner_scope = Some(ms);
                self.module_scopes.entry(name.clone()).or_insert(ms);
                self.diags.set_module(&name);
                let ctx = Ctx {
                    module: Some(n),
                    ..Ctx::default()
                };
                for &d in &decls {
                    self.declare(ms, d, ctx);
                }
                for &d in &decls {
                    self.bind(d, Some(n), ms, ctx);
                }
            }
            NodeKind::Struct {
                params, members, ..
            } => {
                let ps = self.symtab.new_scope(scope);
                for &p in &params {
                    self.link(p, Some(n), ps, ctx);
                    if let Some(name) = self.ast.name(p).map(str::to_string) {
                        self.add(ps, &name, Binding::Node(p));
                    }
                }
                let ms = self.symtab.new_scope(ps);
                self.symtab.negate(ms);
                self.ast.node_mut(n).inner_scope = Some(ms);
                self.receiver(n, ms, NodeFlags::empty(), ctx);

                let ctx = Ctx {
                    strukt: Some(n),
                    ..ctx
                };
                for &m in &members {
                    self.ast.node_mut(m).flags |= NodeFlags::MEMBER;
                    self.declare(ms, m, ctx);
                }
                for &m in &members {
                    self.bind(m, Some(n), ms, ctx);
                }
            }
            NodeKind::Fun {
                ret,
                params,
                body,
                attrs,
                ..
            } => {
                let fs = self.symtab.new_scope(scope);
                self.ast.node_mut(n).inner_scope = Some(fs);
                let fctx = Ctx {
                    module: ctx.module,
                    func: Some(n),
                    strukt: None,
                };
                if ctx.strukt.is_some() && self.ast.flags(n).contains(NodeFlags::MEMBER) {
                    let flags = if attrs.mutating || self.ast.is_constructor(n) {
                        NodeFlags::MUT | NodeFlags::VAR
                    } else {
                        NodeFlags::empty()
                    };
                    self.receiver(n, fs, flags, fctx);
                }
                if let Some(r) = ret {
                    self.bind(r, Some(n), fs, fctx);
                }
                self.bind(params, Some(n), fs, fctx);
                if let Some(b) = body {
                    self.bind(b, Some(n), fs, fctx);
                }
            }
            NodeKind::Decl {
                name,
                ty,
                init,
                storage,
                role,
                ..
            } => {
                self.ast.node_mut(n).flags |= storage.flags();
                self.bind(ty, Some(n), scope, ctx);
                if role == DeclRole::Param {
                    self.add(scope, &name, Binding::Node(n));
                }
                if let Some(i) = init {
                    self.bind(i, Some(n), scope, ctx);
                }
            }
            NodeKind::Let {
                name,
                init,
                storage,
            } => {
                self.ast.node_mut(n).flags |= storage.flags();
                let outer = self.symtab.scope(scope).parent.unwrap_or(scope);
                let isolated = self.symtab.new_scope(outer);
                self.symtab.set_isolation(isolated, scope);
                self.bind(init, Some(n), isolated, ctx);
                self.add(scope, &name, Binding::Node(n));
            }
            NodeKind::Block { stmts } => {
                let mut cur = scope;
                for &s in &stmts {
                    cur = self.symtab.new_scope(cur);
                    self.bind(s, Some(n), cur, ctx);
                }
            }
            _ => {
                for c in self.ast.children(n) {
                    self.bind(c, Some(n), scope, ctx);
                }
            }
        }
    }

    fn link_imports(&mut self, modules: &[NodeId]) {
        for &m in modules {
            let (NodeKind::Module { imports, .. }, Some(ms)) =
                (self.ast.kind(m).clone(), self.ast.node(m).inner_scope)
            else {
                continue;
            };
            self.diags.set_module(self.ast.module_name(m));
            for name in imports {
                match self.module_scopes.get(&name) {
                    Some(&target) if target != ms => self.symtab.add_import(ms, target),
                    Some(_) => {}
                    None => self
                        .diags
                        .error(self.ast.span(m), Error::UnknownImport { name }),
                }
            }
        }
    }

    // ==================== Pass 2: resolve ====================

    fn resolve_node(&mut self, n: NodeId) {
        match self.ast.kind(n).clone() {
            NodeKind::Ident { name } => self.resolve_ident(n, &name),
            NodeKind::AddrOf { operand } => {
                self.resolve_node(operand);
                if !self.ast.flags(operand).contains(NodeFlags::ADDR) {
                    self.diags
                        .error(self.ast.span(operand), Error::NotAddressable);
                    self.declared_here(operand);
                }
            }
            NodeKind::Attr { base, .. } => {
                self.resolve_node(base);
                let inherited = self.ast.flags(base) & (NodeFlags::STORAGE | NodeFlags::ADDR);
                self.ast.node_mut(n).flags |= inherited;
            }
            _ => {
                for c in self.ast.children(n) {
                    self.resolve_node(c);
                }
            }
        }
    }

    fn resolve_ident(&mut self, n: NodeId, name: &str) {
        let span = self.ast.span(n);
        let Some(scope) = self.ast.node(n).scope else {
            crate::ice!("identifier {} was never bound to a scope", n);
        };

        let Some(e) = self.symtab.find(scope, name) else {
            let isolated = self
                .symtab
                .isolation_of(scope)
                .and_then(|iso| self.symtab.find_local(iso, name));
            match isolated {
                Some(e) => {
                    self.diags.error(
                        span,
                        Error::SelfReference {
                            name: name.to_string(),
                        },
                    );
                    if let Some(d) = self.symtab.entry(e).binding.node() {
                        self.diags
                            .note(self.ast.span(d), format!("'{}' declared here", name));
                    }
                }
                None => self.diags.error(
                    span,
                    Error::UndeclaredIdentifier {
                        name: name.to_string(),
                    },
                ),
            }
            return;
        };

        let entry = self.symtab.entry(e).clone();
        if entry.level < 0 {
            self.diags.error(
                span,
                Error::NeedsReceiver {
                    name: name.to_string(),
                },
            );
            if let Some(&d) = entry.binding.candidates().first() {
                self.declared_here(d);
            }
            return;
        }

        self.ast.node_mut(n).entry = Some(e);
        self.ast.node_mut(n).flags |= NodeFlags::USED;
        let candidates = entry.binding.candidates().to_vec();
        if let Some(&first) = candidates.first() {
            let target = self.ast.node(first);
            if target.module != self.ast.node(n).module && !target.is_exported() {
                self.diags.error(
                    span,
                    Error::Unexported {
                        name: name.to_string(),
                    },
                );
                self.declared_here(first);
            }
        }
        for &c in &candidates {
            self.ast.node_mut(c).flags |= NodeFlags::USED;
        }
        if let Some(t) = entry.binding.node() {
            let target = self.ast.node(t);
            let mut flags = target.flags & NodeFlags::STORAGE;
            if target.is_storage() {
                flags |= NodeFlags::ADDR;
            }
            let node = self.ast.node_mut(n);
            node.flags |= flags;
            node.target = Some(t);
        }
    }

    fn declared_here(&mut self, n: NodeId) {
        let target = self.ast.node(n).target.unwrap_or(n);
        if let Some(name) = self.ast.name(target) {
            let msg = format!("'{}' declared here", name);
            self.diags.note(self.ast.span(target), msg);
        }
    }
}

/// Resolve every module of `ast`
pub fn resolve(ast: &mut Ast, symtab: &mut SymbolTable, diags: &mut Diagnostics) {
    Resolver::new(ast, symtab, diags).run();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::syntax::Unit;
    use crate::types::TypeArena;
    use serde_json::{json, Value};

    fn run(unit: Value) -> (Ast, Diagnostics) {
        let unit: Unit = serde_json::from_value(unit).unwrap();
        let types = TypeArena::new();
        let mut ast = Ast::new();
        let mut symtab = SymbolTable::new(&types);
        let mut diags = Diagnostics::new();
        unit.lower(&mut ast);
        resolve(&mut ast, &mut symtab, &mut diags);
        (ast, diags)
    }

    fn int() -> Value {
        json!({ "kind": "ident", "name": "int" })
    }

    fn ident(name: &str) -> Value {
        json!({ "kind": "ident", "name": name })
    }

    #[test]
    fn test_self_reference_in_let() {
        let (_, diags) = run(json!({
            "modules": [{
                "name": "main",
                "items": [
                    { "kind": "fun", "name": "f", "ret": int(),
                      "params": [{ "name": "a", "ty": int() }],
                      "body": [{ "kind": "return", "value": ident("a") }] },
                    { "kind": "fun", "name": "g", "body": [
                        { "kind": "let", "name": "x", "init": {
                            "kind": "call", "callee": ident("f"), "args": [ident("x")] } }
                    ] }
                ]
            }]
        }));
        let errors: Vec<_> = diags.errors().collect();
        assert_eq!(
            errors,
            vec![&Error::SelfReference {
                name: "x".to_string()
            }]
        );
    }

    #[test]
    fn test_let_is_visible_to_later_statements() {
        let (ast, diags) = run(json!({
            "modules": [{
                "name": "main",
                "items": [{ "kind": "fun", "name": "g", "body": [
                    { "kind": "let", "name": "x", "init": { "kind": "int", "value": 1 } },
                    { "kind": "let", "name": "y", "init": ident("x") }
                ] }]
            }]
        }));
        assert!(!diags.has_errors());
        let x_use = ast
            .ids()
            .find(|&id| matches!(ast.kind(id), NodeKind::Ident { name } if name == "x"))
            .unwrap();
        let target = ast.node(x_use).target.unwrap();
        assert!(matches!(ast.kind(target), NodeKind::Let { name, .. } if name == "x"));
        assert!(ast.flags(target).contains(NodeFlags::USED));
        assert!(ast.flags(x_use).contains(NodeFlags::ADDR));
    }

    #[test]
    fn test_forward_reference_between_functions() {
        let (_, diags) = run(json!({
            "modules": [{
                "name": "main",
                "items": [
                    { "kind": "fun", "name": "a", "body": [
                        { "kind": "expr", "expr": { "kind": "call", "callee": ident("b") } }
                    ] },
                    { "kind": "fun", "name": "b", "body": [] }
                ]
            }]
        }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_member_needs_receiver() {
        let (_, diags) = run(json!({
            "modules": [{
                "name": "main",
                "items": [{
                    "kind": "struct", "name": "S",
                    "members": [
                        { "kind": "global", "name": "len", "ty": int() },
                        { "kind": "fun", "name": "get", "ret": int(), "body": [
                            { "kind": "return", "value": ident("len") }
                        ] }
                    ]
                }]
            }]
        }));
        assert!(matches!(
            diags.errors().next(),
            Some(Error::NeedsReceiver { name }) if name == "len"
        ));
    }

    #[test]
    fn test_unexported_access_across_modules() {
        let (_, diags) = run(json!({
            "modules": [
                { "name": "lib", "items": [
                    { "kind": "fun", "name": "hidden", "body": [] },
                    { "kind": "fun", "name": "shown", "export": true, "body": [] }
                ] },
                { "name": "main", "imports": ["lib"], "items": [
                    { "kind": "fun", "name": "main", "body": [
                        { "kind": "expr", "expr": { "kind": "call", "callee": ident("shown") } },
                        { "kind": "expr", "expr": { "kind": "call", "callee": ident("hidden") } }
                    ] }
                ] }
            ]
        }));
        let errors: Vec<_> = diags.errors().collect();
        assert_eq!(
            errors,
            vec![&Error::Unexported {
                name: "hidden".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_import_and_undeclared() {
        let (_, diags) = run(json!({
            "modules": [{ "name": "main", "imports": ["nowhere"], "items": [
                { "kind": "fun", "name": "main", "body": [
                    { "kind": "expr", "expr": ident("ghost") }
                ] }
            ] }]
        }));
        let errors: Vec<_> = diags.errors().cloned().collect();
        assert_eq!(
            errors,
            vec![
                Error::UnknownImport {
                    name: "nowhere".to_string()
                },
                Error::UndeclaredIdentifier {
                    name: "ghost".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_address_of_non_lvalue() {
        let (_, diags) = run(json!({
            "modules": [{ "name": "main", "items": [
                { "kind": "fun", "name": "main", "body": [
                    { "kind": "let", "name": "p", "init": {
                        "kind": "addr", "operand": { "kind": "int", "value": 4 } } }
                ] }
            ] }]
        }));
        assert_eq!(diags.errors().next(), Some(&Error::NotAddressable));
    }

    #[test]
    fn test_shadowing_local_warns() {
        let (_, diags) = run(json!({
            "modules": [{ "name": "main", "items": [
                { "kind": "fun", "name": "main", "body": [
                    { "kind": "let", "name": "x", "init": { "kind": "int", "value": 1 } },
                    { "kind": "let", "name": "x", "init": ident("x") }
                ] }
            ] }]
        }));
        assert!(!diags.has_errors());
        assert_eq!(diags.warning_count(), 1);
    }
}
