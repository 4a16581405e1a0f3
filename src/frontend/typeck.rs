//! Type checking
//!
//! `type_node` assigns a type to each node exactly once; the tri-state slot
//! on the node both memoizes the result and detects recursive definitions.
//! Every failure is reported and replaced by the `Any` type, which every
//! later check accepts, so one mistake yields one diagnostic.
//!
//! Every type stored on a node is an acquired reference (see `store`).

use crate::frontend::ast::{Ast, NodeFlags, NodeId, NodeKind, TypeState};
use crate::frontend::overload::{self, ArgInfo, Outcome};
use crate::frontend::symtab::{Binding, SymbolTable};
use crate::types::{Builtin, Magic, TypeArena, TypeId, TypeKind};
use crate::utils::{Diagnostics, Error, Options};

/// Type checker over a resolved AST
pub struct TypeChecker<'a> {
    ast: &'a mut Ast,
    symtab: &'a SymbolTable,
    types: &'a mut TypeArena,
    diags: &'a mut Diagnostics,
    options: &'a Options,
}

impl<'a> TypeChecker<'a> {
    pub fn new(
        ast: &'a mut Ast,
        symtab: &'a SymbolTable,
        types: &'a mut TypeArena,
        diags: &'a mut Diagnostics,
        options: &'a Options,
    ) -> Self {
        Self {
            ast,
            symtab,
            types,
            diags,
            options,
        }
    }

    /// Type every module
    pub fn run(&mut self) {
        let modules = self.ast.modules().to_vec();
        for m in modules {
            self.type_node(m);
        }
        log::debug!(
            "type checking done: {} live type(s), {} error(s)",
            self.types.stats().live,
            self.diags.error_count()
        );
    }

    // ==================== Memoization ====================

    /// Type of `n`, computing it on first use
    pub fn type_node(&mut self, n: NodeId) -> TypeId {
        match self.ast.node(n).ty {
            TypeState::Typed(t) => return t,
            TypeState::InProgress => {
                self.error(n, Error::RecursiveType);
                self.ast.node_mut(n).ty = TypeState::Typed(TypeId::ANY);
                return TypeId::ANY;
            }
            TypeState::Untyped => {}
        }
        self.ast.node_mut(n).ty = TypeState::InProgress;
        self.compute(n);
        match self.ast.node(n).ty {
            TypeState::Typed(t) => t,
            _ => crate::ice!("node {} ({:?}) left untyped", n, self.ast.kind(n)),
        }
    }

    /// Store an owned reference as the type of `n`
    fn store(&mut self, n: NodeId, ty: TypeId) {
        if let TypeState::Typed(old) = self.ast.node(n).ty {
            self.types.release(old);
        }
        self.ast.node_mut(n).ty = TypeState::Typed(ty);
    }

    fn share(&mut self, ty: TypeId) -> TypeId {
        self.types.acquire(ty)
    }

    fn ty(&self, n: NodeId) -> TypeId {
        self.ast.type_of(n).unwrap_or(TypeId::ANY)
    }

    fn flag(&mut self, n: NodeId, flags: NodeFlags) {
        self.ast.node_mut(n).flags |= flags;
    }

    fn show(&self, ty: TypeId) -> String {
        self.types.display(ty)
    }

    // ==================== Diagnostics ====================

    fn error(&mut self, at: NodeId, err: Error) {
        self.diags.set_module(self.ast.module_name(at));
        self.diags.error(self.ast.span(at), err);
    }

    fn note(&mut self, at: NodeId, msg: String) {
        self.diags.note(self.ast.span(at), msg);
    }

    /// Declaration an expression refers to, if any
    fn decl_of(&self, n: NodeId) -> Option<NodeId> {
        self.ast.node(n).target
    }

    fn declared_here(&mut self, n: NodeId) {
        if let Some(d) = self.decl_of(n) {
            if let Some(name) = self.ast.name(d) {
                let msg = format!("'{}' declared here", name);
                self.note(d, msg);
            }
        }
    }

    /// Remediation note on a declaration that lacks `var` or `mut`
    fn make_mutvar(&mut self, decl: NodeId, want_var: bool, current: NodeFlags) {
        let msg = if want_var && current.contains(NodeFlags::MUT) {
            "change 'mut' to 'var' to make it variable".to_string()
        } else if want_var {
            "add 'var' to make it variable".to_string()
        } else {
            "add 'mut' to make it mutable".to_string()
        };
        self.note(decl, msg);
    }

    // ==================== Contexts ====================

    /// Type `n` and require it to denote a type
    fn expect_type(&mut self, n: NodeId) -> TypeId {
        let t = self.type_node(n);
        if !self.ast.flags(n).contains(NodeFlags::TYPE) && !self.types.is_any(t) {
            self.error(n, Error::NotAType);
            self.declared_here(n);
            self.store(n, TypeId::ANY);
        }
        self.ty(n)
    }

    /// Type `n` and require it to be a value
    fn expect_value(&mut self, n: NodeId) -> TypeId {
        self.type_node(n);
        let flags = self.ast.flags(n);
        if flags.contains(NodeFlags::TYPE) {
            self.error(n, Error::TypeInExpression);
            self.declared_here(n);
            self.store(n, TypeId::ANY);
        } else if flags.contains(NodeFlags::VOID) {
            self.error(n, Error::VoidValue);
            if let NodeKind::Call { callee, .. } = self.ast.kind(n) {
                let callee = *callee;
                self.declared_here(callee);
            }
        }
        self.ty(n)
    }

    fn literal(&self, n: NodeId) -> bool {
        self.ast.is_literal(n)
    }

    fn is_callee(&self, n: NodeId) -> bool {
        match self.ast.node(n).parent.map(|p| self.ast.kind(p)) {
            Some(NodeKind::Call { callee, .. }) => *callee == n,
            _ => false,
        }
    }

    /// Whether an index expression is used as an lvalue
    fn wants_address(&self, n: NodeId) -> bool {
        match self.ast.node(n).parent.map(|p| self.ast.kind(p)) {
            Some(NodeKind::Assign { lhs, .. }) => *lhs == n,
            Some(NodeKind::AddrOf { .. }) => true,
            _ => false,
        }
    }

    // ==================== Rules ====================

    fn compute(&mut self, n: NodeId) {
        let kind = self.ast.kind(n).clone();
        match kind {
            NodeKind::Module { .. } | NodeKind::ArgList { .. } | NodeKind::Block { .. } => {
                for c in self.ast.children(n) {
                    self.type_node(c);
                }
                self.store(n, TypeId::ANY);
            }
            NodeKind::TypeParam { name, index } => {
                self.flag(n, NodeFlags::TYPE);
                let Some(owner) = self.ast.node(n).parent else {
                    crate::ice!("type parameter {} has no struct", n);
                };
                let v = self.types.generic_var(&name, owner, index);
                self.store(n, v);
            }
            NodeKind::Struct {
                name,
                params,
                members,
                ..
            } => self.type_struct(n, &name, &params, &members),
            NodeKind::Receiver { owner } => {
                let strukt = match self.ast.kind(owner) {
                    NodeKind::Struct { .. } => Some(owner),
                    _ => self.ast.node(owner).parent,
                };
                let Some(strukt) = strukt else {
                    crate::ice!("receiver {} outside of a struct", n);
                };
                let t = self.type_node(strukt);
                let t = self.share(t);
                self.store(n, t);
            }
            NodeKind::Fun { .. } => self.type_fun(n),
            NodeKind::Decl { ty, init, .. } => {
                let t = self.expect_type(ty);
                let t = self.share(t);
                self.store(n, t);
                if let Some(i) = init {
                    let it = self.expect_value(i);
                    if !self.types.matches(t, it, self.literal(i), false) {
                        let err = Error::TypeMismatch {
                            expected: self.show(t),
                            got: self.show(it),
                            context: "assignment".to_string(),
                        };
                        self.error(i, err);
                        self.declared_here(i);
                    }
                }
            }
            NodeKind::Let { name, init, .. } => {
                let it = self.expect_value(init);
                let t = if self.ast.flags(init).contains(NodeFlags::VOID) {
                    TypeId::ANY
                } else {
                    self.share(it)
                };
                self.store(n, t);
                if self.options.emit_unused_warnings
                    && !self.ast.flags(n).contains(NodeFlags::USED)
                {
                    self.diags.set_module(self.ast.module_name(n));
                    self.diags
                        .warning(self.ast.span(n), format!("unused variable '{}'", name));
                }
            }
            NodeKind::Assign { lhs, rhs } => self.type_assign(n, lhs, rhs),
            NodeKind::Return { value } => self.type_return(n, value),
            NodeKind::If { cond, then, els } => {
                self.check_condition(cond);
                self.type_node(then);
                if let Some(e) = els {
                    self.type_node(e);
                }
                self.store(n, TypeId::ANY);
            }
            NodeKind::While { cond, body } => {
                self.check_condition(cond);
                self.type_node(body);
                self.store(n, TypeId::ANY);
            }
            NodeKind::PtrType { mutable, pointee } => {
                self.flag(n, NodeFlags::TYPE);
                let t = self.expect_type(pointee);
                let t = if self.types.is_any(t) {
                    TypeId::ANY
                } else {
                    self.types.pointer(mutable, t)
                };
                self.store(n, t);
            }
            NodeKind::Generic { base, args } => self.type_generic(n, base, &args),
            NodeKind::Deref { operand } => {
                let t = self.expect_value(operand);
                self.flag(n, NodeFlags::ADDR);
                if self.types.is_any(t) {
                    self.store(n, TypeId::ANY);
                } else if let Some((mutable, pointee)) = self.types.pointee(t) {
                    if mutable {
                        self.flag(n, NodeFlags::MUT | NodeFlags::VAR);
                    }
                    let p = self.share(pointee);
                    self.store(n, p);
                } else {
                    let err = Error::NotAPointer { ty: self.show(t) };
                    self.error(operand, err);
                    self.declared_here(operand);
                    self.store(n, TypeId::ANY);
                }
            }
            NodeKind::AddrOf { operand } => {
                let t = self.expect_value(operand);
                // a by-value `[]` rewrite leaves a call here
                if !self.types.is_any(t) && !self.ast.flags(operand).contains(NodeFlags::ADDR) {
                    self.error(operand, Error::NotAddressable);
                    self.declared_here(operand);
                    self.store(n, TypeId::ANY);
                    return;
                }
                let t = if self.types.is_any(t) {
                    TypeId::ANY
                } else {
                    let mutable = self.ast.flags(operand).contains(NodeFlags::VAR);
                    self.types.pointer(mutable, t)
                };
                self.store(n, t);
            }
            NodeKind::Cast { expr, ty } => {
                self.expect_value(expr);
                let t = self.expect_type(ty);
                if self.ast.flags(expr).contains(NodeFlags::PURE) {
                    self.flag(n, NodeFlags::PURE);
                }
                let t = self.share(t);
                self.store(n, t);
            }
            NodeKind::Index { base, index } => self.type_index(n, base, index),
            NodeKind::Attr { base, name } => self.type_attr(n, base, &name),
            NodeKind::Call { callee, args } => self.type_call(n, callee, &args),
            NodeKind::New { ty, args } => self.type_new(n, ty, &args),
            NodeKind::BinOp { op, lhs, rhs } => {
                let l = self.expect_value(lhs);
                let r = self.expect_value(rhs);
                let (ll, rl) = (self.literal(lhs), self.literal(rhs));
                if op.is_relational() {
                    if !self.types.matches(l, r, rl, false) && !self.types.matches(r, l, ll, false) {
                        let err = Error::InvalidOperands {
                            left: self.show(l),
                            right: self.show(r),
                            context: "comparison".to_string(),
                        };
                        self.error(n, err);
                    }
                    self.store(n, self.types.builtin(Builtin::Bool));
                } else {
                    let scalar = |t: TypeId| self.types.is_any(t) || self.types.is_builtin(t);
                    let res = if !(scalar(l) && scalar(r)) {
                        None
                    } else if self.types.matches(l, r, rl, false) {
                        Some(l)
                    } else if self.types.matches(r, l, ll, false) {
                        Some(r)
                    } else {
                        None
                    };
                    match res {
                        Some(t) => {
                            let t = self.share(t);
                            self.store(n, t);
                        }
                        None => {
                            let err = Error::InvalidOperands {
                                left: self.show(l),
                                right: self.show(r),
                                context: "binary".to_string(),
                            };
                            self.error(n, err);
                            self.store(n, TypeId::ANY);
                        }
                    }
                }
                if (self.ast.flags(lhs) & self.ast.flags(rhs)).contains(NodeFlags::PURE) {
                    self.flag(n, NodeFlags::PURE);
                }
            }
            NodeKind::Ident { name } => self.type_ident(n, &name),
            NodeKind::Int { .. } => {
                self.flag(n, NodeFlags::PURE);
                self.store(n, self.types.builtin(Builtin::Int));
            }
            NodeKind::Str { .. } => {
                self.flag(n, NodeFlags::PURE);
                let c = self.types.builtin(Builtin::Char);
                let p = self.types.pointer(false, c);
                self.store(n, p);
            }
        }
    }

    fn type_ident(&mut self, n: NodeId, name: &str) {
        let Some(e) = self.ast.node(n).entry else {
            crate::ice!("identifier '{}' ({}) reached type checking unresolved", name, n);
        };
        match self.symtab.entry(e).binding.clone() {
            Binding::Builtin(t) => {
                self.flag(n, NodeFlags::TYPE);
                self.store(n, t);
            }
            Binding::Node(t) => self.type_ident_target(n, t),
            Binding::Overloads(c) if c.len() == 1 => self.type_ident_target(n, c[0]),
            Binding::Overloads(candidates) => {
                if !self.is_callee(n) {
                    self.error(
                        n,
                        Error::AmbiguousOverload {
                            name: name.to_string(),
                        },
                    );
                    for c in candidates {
                        self.note(c, format!("candidate '{}' declared here", name));
                    }
                }
                self.store(n, TypeId::ANY);
            }
        }
    }

    fn type_ident_target(&mut self, n: NodeId, target: NodeId) {
        let t = self.type_node(target);
        let inherited = self.ast.flags(target) & NodeFlags::TYPE;
        self.flag(n, inherited);
        self.ast.node_mut(n).target = Some(target);
        let t = self.share(t);
        self.store(n, t);
    }

    fn type_struct(&mut self, n: NodeId, name: &str, params: &[NodeId], members: &[NodeId]) {
        self.flag(n, NodeFlags::TYPE);
        let mut vars = Vec::with_capacity(params.len());
        for &p in params {
            vars.push(self.type_node(p));
        }
        let st = self.types.structure(name, n, vars);
        self.store(n, st);
        if let Some(this) = self.ast.node(n).this {
            self.type_node(this);
        }

        let Some(ms) = self.ast.node(n).inner_scope else {
            crate::ice!("struct '{}' has no member scope", name);
        };
        for magic in Magic::ALL {
            if let Some(e) = self.symtab.find_local(ms, magic.name()) {
                self.types.set_magic(st, magic, e);
            }
        }
        for &m in members {
            self.type_node(m);
        }
        self.check_magic(st);
        if self.types.magic(st, Magic::New).is_none() {
            self.error(n, Error::MissingConstructor);
        }
    }

    fn check_magic(&mut self, st: TypeId) {
        for magic in Magic::ALL {
            let Some(e) = self.types.magic(st, magic) else {
                continue;
            };
            for c in self.symtab.entry(e).binding.candidates().to_vec() {
                let problem = match self.ast.kind(c) {
                    NodeKind::Fun { .. } => self.magic_problem(magic, c, st),
                    _ => Some("must be a method"),
                };
                if let Some(reason) = problem {
                    let err = Error::MalformedMagic {
                        method: magic.name().to_string(),
                        reason: reason.to_string(),
                    };
                    self.error(c, err);
                }
            }
        }
    }

    fn magic_problem(&self, magic: Magic, fun: NodeId, st: TypeId) -> Option<&'static str> {
        let (ret, params) = self.types.signature(self.ty(fun))?;
        match magic {
            Magic::New => ret.map(|_| "constructor must not return a value"),
            Magic::Delete if ret.is_some() => Some("destructor must not return a value"),
            Magic::Delete if !params.is_empty() => Some("destructor must take no arguments"),
            Magic::Copy if !params.is_empty() => Some("copy constructor must take no arguments"),
            Magic::Copy if !ret.is_some_and(|r| self.types.same(r, st)) => {
                Some("copy constructor must return its own struct type")
            }
            Magic::Bool if !params.is_empty() => Some("boolean converter must take no arguments"),
            Magic::Bool if ret.and_then(|r| self.types.as_builtin(r)) != Some(Builtin::Bool) => {
                Some("boolean converter must return bool")
            }
            Magic::Index | Magic::AddrIndex if params.len() != 1 => {
                Some("index operator must take exactly one argument")
            }
            Magic::AddrIndex if !ret.is_some_and(|r| self.types.is_pointer(r)) => {
                Some("mutable index operator must return a pointer")
            }
            _ => None,
        }
    }

    fn type_fun(&mut self, n: NodeId) {
        let NodeKind::Fun {
            name,
            ret,
            params,
            body,
            attrs,
        } = self.ast.kind(n).clone()
        else {
            crate::ice!("type_fun on non-function {}", n);
        };
        if let Some(this) = self.ast.node(n).this {
            self.type_node(this);
        }
        let ret_t = ret.map(|r| self.expect_type(r));
        self.type_node(params);
        let param_tys: Vec<_> = self
            .ast
            .fun_params(n)
            .into_iter()
            .map(|p| self.ty(p))
            .collect();
        let no_params = param_tys.is_empty();
        let f = self.types.function(ret_t, param_tys);
        self.store(n, f);

        let member = self.ast.flags(n).contains(NodeFlags::MEMBER);
        if !member && name == self.options.entry_point {
            let ret_ok = ret_t.map_or(true, |r| {
                self.types.is_any(r) || self.types.as_builtin(r) == Some(Builtin::Int)
            });
            if !(no_params && ret_ok) {
                self.error(n, Error::InvalidEntrySignature { name });
            }
        }

        if let (Some(b), None) = (body, attrs.import) {
            self.type_node(b);
        }
    }

    fn type_generic(&mut self, n: NodeId, base: NodeId, args: &[NodeId]) {
        self.flag(n, NodeFlags::TYPE);
        let bt = self.expect_type(base);
        let mut arg_tys = Vec::with_capacity(args.len());
        for &a in args {
            arg_tys.push(self.expect_type(a));
        }
        if self.types.is_any(bt) {
            self.store(n, TypeId::ANY);
            return;
        }
        let arity = match self.types.kind(bt) {
            TypeKind::Struct { params, .. } if !params.is_empty() => params.len(),
            _ => {
                let err = Error::NotGeneric { ty: self.show(bt) };
                self.error(base, err);
                self.store(n, TypeId::ANY);
                return;
            }
        };
        if arity != args.len() {
            let err = Error::GenericArity {
                ty: self.show(bt),
                expected: arity,
                got: args.len(),
            };
            self.error(n, err);
            self.store(n, TypeId::ANY);
            return;
        }
        let inst = self.types.generic_instance(bt, arg_tys);
        self.store(n, inst);
    }

    fn type_assign(&mut self, n: NodeId, lhs: NodeId, rhs: NodeId) {
        let lt = self.expect_value(lhs);
        let rt = self.expect_value(rhs);
        let flags = self.ast.flags(lhs);
        if flags.contains(NodeFlags::CONST) {
            self.error(lhs, Error::AssignConstant);
            self.declared_here(lhs);
        } else if !flags.contains(NodeFlags::ADDR) {
            self.error(lhs, Error::AssignNotAddressable);
            self.declared_here(lhs);
        } else if !flags.contains(NodeFlags::VAR) {
            self.error(lhs, Error::AssignNotVariable);
            self.declared_here(lhs);
            if let Some(d) = self.decl_of(lhs) {
                self.make_mutvar(d, true, flags);
            }
        }
        if !self.types.matches(lt, rt, self.literal(rhs), false) {
            let err = Error::TypeMismatch {
                expected: self.show(lt),
                got: self.show(rt),
                context: "assignment".to_string(),
            };
            self.error(n, err);
        }
        let t = self.share(lt);
        self.store(n, t);
    }

    fn type_return(&mut self, n: NodeId, value: Option<NodeId>) {
        let Some(f) = self.ast.node(n).func else {
            crate::ice!("return {} outside of a function", n);
        };
        let vt = value.map(|v| self.expect_value(v));
        self.store(n, TypeId::ANY);
        let Some((ret, _)) = self.types.signature(self.ty(f)) else {
            return;
        };
        let ret_node = match self.ast.kind(f) {
            NodeKind::Fun { ret, .. } => *ret,
            _ => None,
        };
        match (ret, value, vt) {
            (Some(_), None, _) => {
                self.error(n, Error::MissingReturnValue);
                if let Some(r) = ret_node {
                    self.note(r, "function return type declared here".to_string());
                }
            }
            (Some(rt), Some(v), Some(vt)) => {
                if !self.types.matches(rt, vt, self.literal(v), false) {
                    let err = Error::ReturnMismatch {
                        expected: self.show(rt),
                        got: self.show(vt),
                    };
                    self.error(v, err);
                    if let Some(r) = ret_node {
                        self.note(r, "function return type declared here".to_string());
                    }
                }
            }
            (None, Some(v), _) => {
                let what = if self.ast.is_constructor(f) {
                    "constructor"
                } else {
                    "function"
                };
                self.error(
                    v,
                    Error::UnexpectedReturnValue {
                        what: what.to_string(),
                    },
                );
                self.note(f, format!("{} declared here", what));
            }
            _ => {}
        }
    }

    fn check_condition(&mut self, cond: NodeId) {
        let t = self.expect_value(cond);
        let ok = self.types.is_any(t)
            || self.types.is_builtin(t)
            || self.types.is_pointer(t)
            || self.types.magic(t, Magic::Bool).is_some();
        if !ok {
            let err = Error::InvalidCondition { ty: self.show(t) };
            self.error(cond, err);
        }
    }

    fn type_index(&mut self, n: NodeId, base: NodeId, index: NodeId) {
        let bt = self.expect_value(base);
        let it = self.expect_value(index);
        if self.types.is_any(bt) {
            self.store(n, TypeId::ANY);
        } else if let Some((mutable, pointee)) = self.types.pointee(bt) {
            let integral = self.types.is_any(it)
                || matches!(self.types.as_builtin(it), Some(b) if b != Builtin::Bool);
            if !integral {
                let err = Error::InvalidIndex { ty: self.show(it) };
                self.error(index, err);
                self.store(n, TypeId::ANY);
                return;
            }
            self.flag(n, NodeFlags::ADDR);
            if mutable {
                self.flag(n, NodeFlags::MUT | NodeFlags::VAR);
            }
            let p = self.share(pointee);
            self.store(n, p);
        } else {
            let order = if self.wants_address(n) {
                [Magic::AddrIndex, Magic::Index]
            } else {
                [Magic::Index, Magic::AddrIndex]
            };
            match order.into_iter().find(|&m| self.types.magic(bt, m).is_some()) {
                Some(magic) => {
                    self.rewrite_index(n, base, index, magic);
                    self.compute(n);
                }
                None => {
                    let err = Error::NotIndexable { ty: self.show(bt) };
                    self.error(n, err);
                    self.store(n, TypeId::ANY);
                }
            }
        }
    }

    /// Turn `base[index]` into a call of the struct's index operator.
    /// `&[]` returns a pointer, so its call is dereferenced.
    fn rewrite_index(&mut self, n: NodeId, base: NodeId, index: NodeId, magic: Magic) {
        let span = self.ast.span(n);
        let attr = self.ast.add(
            NodeKind::Attr {
                base,
                name: magic.name().to_string(),
            },
            span,
        );
        let inherited = self.ast.flags(base) & (NodeFlags::STORAGE | NodeFlags::ADDR);
        self.copy_links(n, attr);
        self.flag(attr, inherited);
        self.ast.node_mut(base).parent = Some(attr);

        let call_kind = NodeKind::Call {
            callee: attr,
            args: vec![index],
        };
        if magic == Magic::AddrIndex {
            let call = self.ast.add(call_kind, span);
            self.copy_links(n, call);
            self.ast.node_mut(call).parent = Some(n);
            self.ast.node_mut(attr).parent = Some(call);
            self.ast.node_mut(index).parent = Some(call);
            self.ast.node_mut(n).kind = NodeKind::Deref { operand: call };
        } else {
            self.ast.node_mut(attr).parent = Some(n);
            let node = self.ast.node_mut(n);
            node.kind = call_kind;
            node.flags.remove(NodeFlags::ADDR);
        }
        log::trace!("rewrote index {} into a call of '{}'", n, magic.name());
    }

    fn copy_links(&mut self, from: NodeId, to: NodeId) {
        let src = self.ast.node(from).clone();
        let node = self.ast.node_mut(to);
        node.parent = src.parent;
        node.scope = src.scope;
        node.module = src.module;
        node.func = src.func;
    }

    fn type_attr(&mut self, n: NodeId, base: NodeId, name: &str) {
        let bt = self.expect_value(base);
        if self.types.is_any(bt) {
            self.store(n, TypeId::ANY);
            return;
        }
        let Some(decl) = self.types.struct_decl(bt) else {
            let err = Error::NotAStruct { ty: self.show(bt) };
            self.error(base, err);
            self.declared_here(base);
            self.store(n, TypeId::ANY);
            return;
        };
        let Some(ms) = self.ast.node(decl).inner_scope else {
            crate::ice!("struct {} has no member scope", decl);
        };
        let entry = match self.symtab.find_local(ms, name) {
            Some(e) if name != "this" => e,
            _ => {
                self.error(
                    n,
                    Error::UndefinedAttribute {
                        name: name.to_string(),
                    },
                );
                self.declared_here(base);
                self.store(n, TypeId::ANY);
                return;
            }
        };
        self.ast.node_mut(n).entry = Some(entry);

        match self.symtab.entry(entry).binding.clone() {
            Binding::Node(field) => {
                let ft = self.type_node(field);
                let t = self.types.substitute(ft, bt);
                let field_flags = self.ast.flags(field);
                let rw = NodeFlags::MUT | NodeFlags::VAR;
                let flags = self.ast.flags(base) & field_flags & rw;
                let node = self.ast.node_mut(n);
                node.flags.remove(rw);
                node.flags |= flags | (field_flags & NodeFlags::CONST);
                node.target = Some(field);
                self.store(n, t);
            }
            Binding::Overloads(candidates) => {
                self.flag(n, NodeFlags::STATIC);
                self.ast.node_mut(n).flags.remove(NodeFlags::ADDR);
                if !self.is_callee(n) {
                    self.error(
                        n,
                        Error::MethodValue {
                            name: name.to_string(),
                        },
                    );
                    if let Some(&first) = candidates.first() {
                        self.note(first, format!("'{}' declared here", name));
                    }
                    self.store(n, TypeId::ANY);
                    return;
                }
                if let [only] = candidates[..] {
                    let ft = self.type_node(only);
                    let t = self.types.substitute(ft, bt);
                    self.ast.node_mut(n).target = Some(only);
                    self.store(n, t);
                } else {
                    self.store(n, TypeId::ANY);
                }
            }
            Binding::Builtin(_) => crate::ice!("builtin bound in member scope of {}", decl),
        }
    }

    /// Candidates still to be chosen for a callee
    fn pending_overloads(&self, callee: NodeId) -> Option<Vec<NodeId>> {
        let node = self.ast.node(callee);
        if node.target.is_some() {
            return None;
        }
        let e = node.entry?;
        match &self.symtab.entry(e).binding {
            Binding::Overloads(c) if c.len() > 1 => Some(c.clone()),
            _ => None,
        }
    }

    fn arg_infos(&mut self, args: &[NodeId]) -> Vec<ArgInfo> {
        let mut infos = Vec::with_capacity(args.len());
        for &a in args {
            let ty = self.expect_value(a);
            infos.push(ArgInfo {
                ty,
                literal: self.literal(a),
            });
        }
        infos
    }

    /// Choose among `candidates`; reports and returns `None` on failure.
    /// `receiver` is the type methods are looked up on, for substitution.
    fn resolve_overload(
        &mut self,
        at: NodeId,
        name: &str,
        candidates: &[NodeId],
        receiver: Option<TypeId>,
        args: &[ArgInfo],
    ) -> Option<NodeId> {
        let mut sigs = Vec::with_capacity(candidates.len());
        for &c in candidates {
            let t = self.type_node(c);
            sigs.push(match receiver {
                Some(r) => self.types.substitute(t, r),
                None => self.share(t),
            });
        }

        let chosen = match overload::select(&*self.types, &sigs, args) {
            Outcome::Unique { index, rounds } => {
                log::trace!(
                    "'{}' resolved to candidate {} of {} after {} round(s)",
                    name,
                    index,
                    candidates.len(),
                    rounds
                );
                Some(candidates[index])
            }
            Outcome::NoMatch => {
                self.error(
                    at,
                    Error::NoMatchingOverload {
                        name: name.to_string(),
                    },
                );
                for (i, &c) in candidates.iter().enumerate() {
                    let reason = overload::check(&*self.types, sigs[i], args, false)
                        .err()
                        .map(|m| m.to_string())
                        .unwrap_or_default();
                    let msg = format!(
                        "candidate '{}' of type '{}': {}",
                        name,
                        self.show(sigs[i]),
                        reason
                    );
                    self.note(c, msg);
                }
                None
            }
            Outcome::Ambiguous(survivors) => {
                self.error(
                    at,
                    Error::AmbiguousOverload {
                        name: name.to_string(),
                    },
                );
                for i in survivors {
                    let msg = format!("candidate '{}' of type '{}'", name, self.show(sigs[i]));
                    self.note(candidates[i], msg);
                }
                None
            }
        };
        for s in sigs {
            self.types.release(s);
        }
        chosen
    }

    fn check_args(&mut self, what: &str, call: NodeId, sig: TypeId, args: &[NodeId], infos: &[ArgInfo]) {
        let params = match self.types.signature(sig) {
            Some((_, params)) => params.to_vec(),
            None => return,
        };
        if params.len() != args.len() {
            self.error(
                call,
                Error::ArgCountMismatch {
                    what: what.to_string(),
                    expected: params.len(),
                    got: args.len(),
                },
            );
        }
        for ((&p, &a), info) in params.iter().zip(args).zip(infos) {
            if !self.types.matches(p, info.ty, info.literal, false) {
                let err = Error::ArgTypeMismatch {
                    what: what.to_string(),
                    expected: self.show(p),
                    got: self.show(info.ty),
                };
                self.error(a, err);
            }
        }
    }

    fn type_call(&mut self, n: NodeId, callee: NodeId, args: &[NodeId]) {
        let infos = self.arg_infos(args);
        self.type_node(callee);

        let base = match self.ast.kind(callee) {
            NodeKind::Attr { base, .. } => Some(*base),
            _ => None,
        };
        if let Some(candidates) = self.pending_overloads(callee) {
            let name = match self.ast.kind(callee) {
                NodeKind::Ident { name } | NodeKind::Attr { name, .. } => name.clone(),
                _ => String::new(),
            };
            let receiver = base.map(|b| self.ty(b));
            match self.resolve_overload(n, &name, &candidates, receiver, &infos) {
                Some(chosen) => {
                    let ft = self.type_node(chosen);
                    let t = match receiver {
                        Some(r) => self.types.substitute(ft, r),
                        None => self.share(ft),
                    };
                    self.ast.node_mut(callee).target = Some(chosen);
                    self.store(callee, t);
                }
                None => {
                    self.store(n, TypeId::ANY);
                    return;
                }
            }
        }

        let ct = self.expect_value(callee);
        if self.types.is_any(ct) {
            self.store(n, TypeId::ANY);
            return;
        }
        let Some((ret, _)) = self.types.signature(ct) else {
            let err = Error::NotCallable { ty: self.show(ct) };
            self.error(n, err);
            self.declared_here(callee);
            self.store(n, TypeId::ANY);
            return;
        };

        let target = self.decl_of(callee);
        let what = if base.is_some() { "method" } else { "function" };
        self.check_args(what, n, ct, args, &infos);

        if let (Some(b), Some(t)) = (base, target) {
            let mutating = matches!(self.ast.kind(t), NodeKind::Fun { attrs, .. } if attrs.mutating);
            let flags = self.ast.flags(b);
            if mutating && !flags.contains(NodeFlags::MUT) {
                let method = self.ast.name(t).unwrap_or_default().to_string();
                self.error(n, Error::ImmutableReceiver { method });
                if let Some(d) = self.decl_of(b) {
                    self.make_mutvar(d, false, flags);
                }
            }
        }

        self.ast.node_mut(n).target = target;
        match ret {
            Some(r) => {
                let r = self.share(r);
                self.store(n, r);
            }
            None => {
                self.flag(n, NodeFlags::VOID);
                self.store(n, TypeId::ANY);
            }
        }
    }

    fn type_new(&mut self, n: NodeId, ty: NodeId, args: &[NodeId]) {
        let t = self.expect_type(ty);
        let infos = self.arg_infos(args);
        if self.types.is_any(t) {
            self.store(n, TypeId::ANY);
            return;
        }
        if self.types.struct_of(t).is_none() {
            let err = Error::NotAStruct { ty: self.show(t) };
            self.error(ty, err);
            self.store(n, TypeId::ANY);
            return;
        }
        let Some(e) = self.types.magic(t, Magic::New) else {
            // reported on the struct itself
            self.store(n, TypeId::ANY);
            return;
        };
        let candidates = self.symtab.entry(e).binding.candidates().to_vec();
        let chosen = if candidates.len() > 1 {
            self.resolve_overload(n, Magic::New.name(), &candidates, Some(t), &infos)
        } else {
            candidates.first().copied()
        };
        if let Some(ctor) = chosen {
            let ft = self.type_node(ctor);
            let sig = self.types.substitute(ft, t);
            self.check_args("constructor", n, sig, args, &infos);
            self.types.release(sig);
            self.ast.node_mut(n).target = Some(ctor);
        }
        let t = self.share(t);
        self.store(n, t);
    }
}

/// Type check every module of a resolved AST
pub fn check(
    ast: &mut Ast,
    symtab: &SymbolTable,
    types: &mut TypeArena,
    diags: &mut Diagnostics,
    options: &Options,
) {
    TypeChecker::new(ast, symtab, types, diags, options).run();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::resolve::resolve;
    use crate::frontend::syntax::Unit;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    struct Checked {
        ast: Ast,
        types: TypeArena,
        diags: Diagnostics,
    }

    fn check_unit(unit: Value) -> Checked {
        let unit: Unit = serde_json::from_value(unit).unwrap();
        let mut types = TypeArena::new();
        let mut ast = Ast::new();
        let mut symtab = SymbolTable::new(&types);
        let mut diags = Diagnostics::new();
        let options = Options::default();
        unit.lower(&mut ast);
        resolve(&mut ast, &mut symtab, &mut diags);
        assert_eq!(diags.error_count(), 0, "{:?}", diags.items());
        check(&mut ast, &symtab, &mut types, &mut diags, &options);
        Checked { ast, types, diags }
    }

    fn module(items: Value) -> Value {
        json!({ "modules": [{ "name": "main", "items": items }] })
    }

    fn ident(name: &str) -> Value {
        json!({ "kind": "ident", "name": name })
    }

    fn int(v: u64) -> Value {
        json!({ "kind": "int", "value": v })
    }

    fn errors(c: &Checked) -> Vec<Error> {
        c.diags.errors().cloned().collect()
    }

    fn find_let(c: &Checked, name: &str) -> NodeId {
        c.ast
            .ids()
            .find(|&id| matches!(c.ast.kind(id), NodeKind::Let { name: n, .. } if n == name))
            .unwrap()
    }

    #[test]
    fn test_literal_matches_byte_but_values_do_not() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "params": [
                { "name": "a", "ty": ident("int") },
                { "name": "b", "ty": ident("byte") }
            ], "body": [
                { "kind": "let", "name": "ok", "storage": "var", "init": ident("b") },
                { "kind": "assign", "lhs": ident("ok"), "rhs": int(7) },
                { "kind": "assign", "lhs": ident("ok"), "rhs": ident("a") }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::TypeMismatch {
                expected: "byte".to_string(),
                got: "int".to_string(),
                context: "assignment".to_string(),
            }]
        );
    }

    #[test]
    fn test_arithmetic_takes_non_literal_side() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "params": [{ "name": "b", "ty": ident("byte") }],
              "ret": ident("byte"),
              "body": [
                { "kind": "let", "name": "sum", "init": {
                    "kind": "binary", "op": "add", "lhs": int(1), "rhs": ident("b") } },
                { "kind": "return", "value": ident("sum") }
              ] }
        ])));
        assert!(errors(&c).is_empty());
        let sum = find_let(&c, "sum");
        assert_eq!(c.types.display(c.ast.type_of(sum).unwrap()), "byte");
    }

    #[test]
    fn test_recursive_return_type() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "ret": ident("f"), "body": [] }
        ])));
        assert_eq!(errors(&c), vec![Error::RecursiveType]);
    }

    #[test]
    fn test_missing_constructor_and_bad_magic() {
        let c = check_unit(module(json!([
            { "kind": "struct", "name": "S", "members": [
                { "kind": "fun", "name": "bool", "ret": ident("int"), "body": [
                    { "kind": "return", "value": int(1) }
                ] }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![
                Error::MalformedMagic {
                    method: "bool".to_string(),
                    reason: "boolean converter must return bool".to_string(),
                },
                Error::MissingConstructor,
            ]
        );
    }

    #[test]
    fn test_overloads_resolved_by_strict_round() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "params": [{ "name": "x", "ty": ident("byte") }], "body": [] },
            { "kind": "fun", "name": "f", "params": [{ "name": "x", "ty": ident("int") }], "body": [] },
            { "kind": "fun", "name": "g", "body": [
                { "kind": "expr", "expr": { "kind": "call", "callee": ident("f"), "args": [int(3)] } }
            ] }
        ])));
        assert!(errors(&c).is_empty());
        let call = c
            .ast
            .ids()
            .find(|&id| matches!(c.ast.kind(id), NodeKind::Call { .. }))
            .unwrap();
        let target = c.ast.node(call).target.unwrap();
        let params = c.ast.fun_params(target);
        assert_eq!(c.types.display(c.ast.type_of(params[0]).unwrap()), "int");
    }

    #[test]
    fn test_no_matching_overload_lists_candidates() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "params": [{ "name": "x", "ty": ident("bool") }], "body": [] },
            { "kind": "fun", "name": "f", "params": [
                { "name": "x", "ty": ident("int") }, { "name": "y", "ty": ident("int") }
            ], "body": [] },
            { "kind": "fun", "name": "g", "body": [
                { "kind": "expr", "expr": { "kind": "call", "callee": ident("f"), "args": [int(3)] } }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::NoMatchingOverload {
                name: "f".to_string()
            }]
        );
        let notes = c
            .diags
            .items()
            .iter()
            .filter(|d| d.severity == crate::utils::Severity::Note)
            .count();
        assert_eq!(notes, 2);
    }

    fn vec_struct() -> Value {
        json!({ "kind": "struct", "name": "Vec", "members": [
            { "kind": "global", "name": "data", "ty": { "kind": "ptr", "mutable": true, "pointee": ident("int") } },
            { "kind": "fun", "name": "new", "body": [] },
            { "kind": "fun", "name": "[]", "ret": ident("int"),
              "params": [{ "name": "i", "ty": ident("size") }],
              "body": [{ "kind": "return", "value": int(0) }] },
            { "kind": "fun", "name": "&[]", "ret": { "kind": "ptr", "mutable": true, "pointee": ident("int") },
              "params": [{ "name": "i", "ty": ident("size") }],
              "body": [{ "kind": "return", "value": {
                  "kind": "attr", "base": ident("this"), "name": "data" } }] },
            { "kind": "fun", "name": "push", "mutating": true,
              "params": [{ "name": "x", "ty": ident("int") }], "body": [] }
        ] })
    }

    #[test]
    fn test_index_rewritten_to_magic_calls() {
        let c = check_unit(module(json!([
            vec_struct(),
            { "kind": "fun", "name": "g", "body": [
                { "kind": "let", "name": "v", "init": { "kind": "new", "ty": ident("Vec") } },
                { "kind": "let", "name": "x", "init": {
                    "kind": "index", "base": ident("v"), "index": int(0) } },
                { "kind": "assign",
                  "lhs": { "kind": "index", "base": ident("v"), "index": int(1) },
                  "rhs": ident("x") }
            ] }
        ])));
        assert!(errors(&c).is_empty(), "{:?}", errors(&c));

        let x = find_let(&c, "x");
        let NodeKind::Let { init, .. } = c.ast.kind(x) else { unreachable!() };
        let NodeKind::Call { callee, .. } = c.ast.kind(*init) else {
            panic!("read access should call []");
        };
        assert!(matches!(c.ast.kind(*callee), NodeKind::Attr { name, .. } if name == "[]"));

        let assign = c
            .ast
            .ids()
            .find(|&id| matches!(c.ast.kind(id), NodeKind::Assign { .. }))
            .unwrap();
        let NodeKind::Assign { lhs, .. } = c.ast.kind(assign) else { unreachable!() };
        assert!(matches!(c.ast.kind(*lhs), NodeKind::Deref { .. }));
        assert!(c.ast.flags(*lhs).contains(NodeFlags::VAR));
    }

    #[test]
    fn test_mutating_method_needs_mutable_receiver() {
        let c = check_unit(module(json!([
            vec_struct(),
            { "kind": "fun", "name": "g", "body": [
                { "kind": "let", "name": "v", "init": { "kind": "new", "ty": ident("Vec") } },
                { "kind": "expr", "expr": { "kind": "call",
                    "callee": { "kind": "attr", "base": ident("v"), "name": "push" },
                    "args": [int(1)] } }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::ImmutableReceiver {
                method: "push".to_string()
            }]
        );
        assert!(c
            .diags
            .items()
            .iter()
            .any(|d| d.message == "add 'mut' to make it mutable"));
    }

    #[test]
    fn test_generic_arity_and_substitution() {
        let c = check_unit(module(json!([
            { "kind": "struct", "name": "Box", "params": ["T"], "members": [
                { "kind": "global", "name": "item", "ty": ident("T") },
                { "kind": "fun", "name": "new", "params": [{ "name": "v", "ty": ident("T") }], "body": [
                    { "kind": "assign",
                      "lhs": { "kind": "attr", "base": ident("this"), "name": "item" },
                      "rhs": ident("v") }
                ] }
            ] },
            { "kind": "fun", "name": "g", "ret": ident("int"), "body": [
                { "kind": "let", "name": "b", "init": { "kind": "new",
                    "ty": { "kind": "generic", "base": ident("Box"), "args": [ident("int")] },
                    "args": [int(4)] } },
                { "kind": "return", "value": { "kind": "attr", "base": ident("b"), "name": "item" } }
            ] },
            { "kind": "fun", "name": "h", "body": [
                { "kind": "let", "name": "bad", "init": { "kind": "new",
                    "ty": { "kind": "generic", "base": ident("Box"), "args": [ident("int"), ident("int")] },
                    "args": [int(4)] } }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::GenericArity {
                ty: "Box".to_string(),
                expected: 1,
                got: 2,
            }]
        );
        let b = find_let(&c, "b");
        assert_eq!(c.types.display(c.ast.type_of(b).unwrap()), "Box[int]");
    }

    #[test]
    fn test_assignment_to_immutable_let() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "g", "body": [
                { "kind": "let", "name": "x", "storage": "mut", "init": int(1) },
                { "kind": "assign", "lhs": ident("x"), "rhs": int(2) }
            ] }
        ])));
        assert_eq!(errors(&c), vec![Error::AssignNotVariable]);
        assert!(c
            .diags
            .items()
            .iter()
            .any(|d| d.message == "change 'mut' to 'var' to make it variable"));
    }

    #[test]
    fn test_return_rules_and_unused_warning() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "ret": ident("int"), "body": [{ "kind": "return" }] },
            { "kind": "fun", "name": "g", "body": [
                { "kind": "let", "name": "unused", "init": int(1) },
                { "kind": "return", "value": int(1) }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![
                Error::MissingReturnValue,
                Error::UnexpectedReturnValue {
                    what: "function".to_string()
                },
            ]
        );
        assert_eq!(c.diags.warning_count(), 1);
    }

    #[test]
    fn test_entry_signature_checked() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "main", "params": [{ "name": "x", "ty": ident("int") }], "body": [] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::InvalidEntrySignature {
                name: "main".to_string()
            }]
        );
    }

    #[test]
    fn test_types_and_values_in_wrong_position() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "g", "params": [{ "name": "n", "ty": ident("int") }], "body": [
                { "kind": "let", "name": "t", "init": ident("int") },
                { "kind": "let", "name": "p", "init": { "kind": "cast", "expr": int(0), "ty": ident("n") } },
                { "kind": "let", "name": "u", "init": { "kind": "call", "callee": ident("g"), "args": [int(1)] } }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::TypeInExpression, Error::NotAType, Error::VoidValue]
        );
    }

    #[test]
    fn test_ambiguous_call_lists_survivors_right_after_error() {
        let c = check_unit(module(json!([
            { "kind": "fun", "name": "f", "params": [{ "name": "x", "ty": ident("byte") }], "body": [] },
            { "kind": "fun", "name": "f", "params": [{ "name": "x", "ty": ident("char") }], "body": [] },
            { "kind": "fun", "name": "g", "body": [
                { "kind": "expr", "expr": { "kind": "call", "callee": ident("f"), "args": [int(3)] } }
            ] }
        ])));
        let items = c.diags.items();
        assert_eq!(items.len(), 3, "{:?}", items);
        assert_eq!(
            items[0].error,
            Some(Error::AmbiguousOverload {
                name: "f".to_string()
            })
        );
        for note in &items[1..] {
            assert_eq!(note.severity, crate::utils::Severity::Note);
            assert!(note.message.starts_with("candidate 'f'"), "{}", note.message);
        }
    }

    #[test]
    fn test_method_cannot_be_used_as_value() {
        let c = check_unit(module(json!([
            { "kind": "struct", "name": "S", "members": [
                { "kind": "fun", "name": "new", "body": [] },
                { "kind": "fun", "name": "get", "ret": ident("int"),
                  "body": [{ "kind": "return", "value": int(1) }] }
            ] },
            { "kind": "fun", "name": "f", "body": [
                { "kind": "let", "name": "s", "init": { "kind": "new", "ty": ident("S") } },
                { "kind": "let", "name": "g", "init": { "kind": "attr", "base": ident("s"), "name": "get" } }
            ] }
        ])));
        assert_eq!(
            errors(&c),
            vec![Error::MethodValue {
                name: "get".to_string()
            }]
        );
    }

    #[test]
    fn test_address_of_by_value_index_is_rejected() {
        let c = check_unit(module(json!([
            { "kind": "struct", "name": "V", "members": [
                { "kind": "fun", "name": "new", "body": [] },
                { "kind": "fun", "name": "[]", "ret": ident("int"),
                  "params": [{ "name": "i", "ty": ident("int") }],
                  "body": [{ "kind": "return", "value": ident("i") }] }
            ] },
            { "kind": "fun", "name": "f", "body": [
                { "kind": "let", "name": "v", "init": { "kind": "new", "ty": ident("V") } },
                { "kind": "let", "name": "p", "init": { "kind": "addr", "operand": {
                    "kind": "index", "base": ident("v"), "index": int(0) } } }
            ] }
        ])));
        assert_eq!(errors(&c), vec![Error::NotAddressable]);
    }
}
