//! IR Generator - typed AST to Ember IR
//!
//! Lowers an error-free, fully typed AST into one `Decl` per function or
//! global. While walking a body the generator keeps a stack of live frames,
//! one per block; struct values recorded there are destroyed in reverse
//! order when their block ends or a `return` unwinds past it.
//!
//! Methods of generic structs are lowered once per distinct instance, from a
//! queue, with the instance substituted into every type on the way.

use std::collections::{HashMap, VecDeque};

use crate::frontend::ast::{Ast, DeclRole, NodeFlags, NodeId, NodeKind};
use crate::frontend::symtab::SymbolTable;
use crate::middle::ir::{
    DeclId, DeclKind, InstrKind, Instr, IrProgram, Label, Module, StructLayout, VarFlags, VarId,
    VarShape,
};
use crate::types::{Builtin, Magic, TypeArena, TypeId, TypeKind};
use crate::utils::Options;

/// Per-declaration lowering state
struct FnState {
    decl: DeclId,
    locals: HashMap<NodeId, VarId>,
    frames: Vec<Vec<VarId>>,
    /// The current path already left through a `return`
    terminated: bool,
    /// Generic instance whose method is being lowered
    subst: Option<TypeId>,
    tail_return: Option<NodeId>,
}

impl FnState {
    fn new(decl: DeclId, subst: Option<TypeId>) -> Self {
        Self {
            decl,
            locals: HashMap::new(),
            frames: vec![Vec::new()],
            terminated: false,
            subst,
            tail_return: None,
        }
    }
}

/// Instance method waiting to be lowered; owns a reference to `instance`
struct Pending {
    decl: DeclId,
    fun: NodeId,
    instance: TypeId,
}

/// IR Generator
pub struct IrGenerator<'a> {
    ast: &'a Ast,
    symtab: &'a SymbolTable,
    types: &'a mut TypeArena,
    options: &'a Options,
    program: IrProgram,
    /// Declarations of functions, globals and fields
    decls: HashMap<NodeId, DeclId>,
    /// Instance methods by function and instance name
    instances: HashMap<(NodeId, String), DeclId>,
    /// Struct layouts by display name: (module, index)
    layouts: HashMap<String, (usize, usize)>,
    module_index: HashMap<NodeId, usize>,
    pending: VecDeque<Pending>,
    state: Option<FnState>,
}

impl<'a> IrGenerator<'a> {
    pub fn new(
        ast: &'a Ast,
        symtab: &'a SymbolTable,
        types: &'a mut TypeArena,
        options: &'a Options,
    ) -> Self {
        Self {
            ast,
            symtab,
            types,
            options,
            program: IrProgram::new(),
            decls: HashMap::new(),
            instances: HashMap::new(),
            layouts: HashMap::new(),
            module_index: HashMap::new(),
            pending: VecDeque::new(),
            state: None,
        }
    }

    /// Lower every module of the AST
    pub fn generate(mut self) -> IrProgram {
        let modules = self.ast.modules().to_vec();
        for (i, &m) in modules.iter().enumerate() {
            self.declare_module(i, m);
        }
        for (i, &m) in modules.iter().enumerate() {
            self.lower_module(i, m);
        }
        while let Some(p) = self.pending.pop_front() {
            self.lower_fun(p.decl, p.fun, Some(p.instance));
            self.types.release(p.instance);
        }
        log::debug!(
            "generated {} declaration(s), {} variable(s), {} instance method(s)",
            self.program.decls.len(),
            self.program.vars.len(),
            self.instances.len()
        );
        self.program
    }

    // ==================== Declarations ====================

    fn declare_module(&mut self, index: usize, m: NodeId) {
        let NodeKind::Module {
            name,
            imports,
            decls,
        } = self.ast.kind(m).clone()
        else {
            crate::ice!("module root {} is not a module", m);
        };
        self.module_index.insert(m, index);
        self.program.modules.push(Module::new(&name, imports));
        let init = self.program.alloc_decl(index, "", DeclKind::Function, None);
        self.program.decl_mut(init).export = true;

        for d in decls {
            match self.ast.kind(d) {
                NodeKind::Struct { .. } => self.declare_struct(index, d),
                NodeKind::Fun { name, .. } => {
                    let is_main = *name == self.options.entry_point;
                    let decl = self.declare_fun(index, d, None);
                    if is_main {
                        self.program.modules[index].main = Some(decl);
                    }
                }
                NodeKind::Decl { .. } => {
                    self.declare_global(index, d);
                }
                _ => crate::ice!("unexpected module member {}", d),
            }
        }
    }

    fn declare_struct(&mut self, module: usize, s: NodeId) {
        let NodeKind::Struct {
            name,
            params,
            members,
            export,
        } = self.ast.kind(s).clone()
        else {
            crate::ice!("declare_struct on {}", s);
        };
        let Some(st) = self.ast.type_of(s) else {
            crate::ice!("struct '{}' reached lowering untyped", name);
        };
        let ty = self.types.acquire(st);
        let mut layout = StructLayout {
            name: name.clone(),
            ty,
            fields: Vec::new(),
            methods: Vec::new(),
        };
        for m in members {
            match self.ast.kind(m) {
                NodeKind::Decl { .. } => {
                    let d = self.declare_global(module, m);
                    let decl = self.program.decl_mut(d);
                    decl.member = true;
                    decl.export = export;
                    layout.fields.push(d);
                }
                // generic methods are lowered per instance
                NodeKind::Fun { .. } if params.is_empty() => {
                    let d = self.declare_fun(module, m, None);
                    self.program.decl_mut(d).export |= export;
                    layout.methods.push(d);
                }
                _ => {}
            }
        }
        let structs = &mut self.program.modules[module].structs;
        self.layouts.insert(name, (module, structs.len()));
        structs.push(layout);
    }

    fn declare_fun(&mut self, module: usize, fun: NodeId, instance: Option<TypeId>) -> DeclId {
        let NodeKind::Fun { name, attrs, .. } = self.ast.kind(fun).clone() else {
            crate::ice!("declare_fun on {}", fun);
        };
        let member = self.ast.flags(fun).contains(NodeFlags::MEMBER);
        let owner = self.ast.node(fun).parent.and_then(|p| self.ast.name(p));
        let qualified = match (instance, owner) {
            (Some(inst), _) => format!("{}.{}", self.types.display(inst), name),
            (None, Some(owner)) if member => format!("{}.{}", owner, name),
            _ => name,
        };
        let ty = self.ast.type_of(fun).map(|t| match instance {
            Some(inst) => self.types.substitute(t, inst),
            None => self.types.acquire(t),
        });
        let d = self
            .program
            .alloc_decl(module, &qualified, DeclKind::Function, ty);
        let decl = self.program.decl_mut(d);
        decl.member = member;
        decl.export = attrs.export;
        decl.export_as = attrs.export_as;
        decl.import = attrs.import;
        if instance.is_none() {
            self.decls.insert(fun, d);
        }
        d
    }

    fn declare_global(&mut self, module: usize, g: NodeId) -> DeclId {
        let NodeKind::Decl { name, export, .. } = self.ast.kind(g).clone() else {
            crate::ice!("declare_global on {}", g);
        };
        let ty = self.ast.type_of(g).map(|t| self.types.acquire(t));
        let d = self.program.alloc_decl(module, &name, DeclKind::Global, ty);
        let decl = self.program.decl_mut(d);
        decl.export = export;
        let value = decl.value;
        // globals are never dropped
        self.program.var_mut(value).uses += 1;
        self.decls.insert(g, d);
        d
    }

    /// Declaration to call for `fun`, instantiating generic methods on demand
    fn callee_decl(&mut self, fun: NodeId, owner: Option<TypeId>) -> DeclId {
        let generic = self
            .ast
            .node(fun)
            .parent
            .and_then(|p| self.ast.type_of(p))
            .is_some_and(|t| !self.types.generic_params(t).is_empty());
        if !generic {
            return match self.decls.get(&fun) {
                Some(&d) => d,
                None => crate::ice!("function {} was never declared", fun),
            };
        }

        let subst = self.state.as_ref().and_then(|s| s.subst);
        let mut inst = match owner {
            Some(t) => self.owned_ty(t),
            None => TypeId::ANY,
        };
        if !matches!(self.types.kind(inst), TypeKind::GenericInstance { .. }) {
            // the bare generic struct inside one of its own methods
            self.types.release(inst);
            inst = match subst {
                Some(s) => self.types.acquire(s),
                None => crate::ice!("generic method {} used without an instance", fun),
            };
        }
        let key = (fun, self.types.display(inst));
        if let Some(&d) = self.instances.get(&key) {
            self.types.release(inst);
            return d;
        }

        let module = self
            .ast
            .node(fun)
            .module
            .and_then(|m| self.module_index.get(&m).copied())
            .unwrap_or(0);
        let layout = self.instance_layout(inst);
        let d = self.declare_fun(module, fun, Some(inst));
        if let Some((m, i)) = layout {
            self.program.modules[m].structs[i].methods.push(d);
        }
        log::trace!("instantiating '{}'", self.program.decl(d).name);
        self.instances.insert(key, d);
        self.pending.push_back(Pending {
            decl: d,
            fun,
            instance: inst,
        });
        d
    }

    /// Layout of a generic instance, sharing the fields of its base
    fn instance_layout(&mut self, inst: TypeId) -> Option<(usize, usize)> {
        let name = self.types.display(inst);
        if let Some(&at) = self.layouts.get(&name) {
            return Some(at);
        }
        let base = self.types.struct_of(inst)?;
        let (m, i) = *self.layouts.get(&self.types.display(base))?;
        let fields = self.program.modules[m].structs[i].fields.clone();
        let ty = self.types.acquire(inst);
        let structs = &mut self.program.modules[m].structs;
        structs.push(StructLayout {
            name: name.clone(),
            ty,
            fields,
            methods: Vec::new(),
        });
        let at = (m, structs.len() - 1);
        self.layouts.insert(name, at);
        Some(at)
    }

    // ==================== Bodies ====================

    fn lower_module(&mut self, index: usize, m: NodeId) {
        let decls = self.ast.children(m);
        let Some(init) = self.program.modules[index].init() else {
            crate::ice!("module {} has no initializer", index);
        };

        self.begin(init, None);
        for &d in &decls {
            if let NodeKind::Decl { init: Some(value), .. } = self.ast.kind(d) {
                let value = *value;
                self.lower_global_init(d, value);
            }
        }
        self.end_frame();
        self.finish();

        for d in decls {
            match self.ast.kind(d).clone() {
                NodeKind::Fun { .. } => {
                    let decl = self.decls[&d];
                    self.lower_fun(decl, d, None);
                }
                NodeKind::Struct {
                    params, members, ..
                } if params.is_empty() => {
                    for m in members {
                        if let Some(&decl) = self.decls.get(&m) {
                            if matches!(self.ast.kind(m), NodeKind::Fun { .. }) {
                                self.lower_fun(decl, m, None);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn lower_global_init(&mut self, global: NodeId, value: NodeId) {
        let v = self.lower_expr(value);
        self.take(v);
        let g = self.program.decl(self.decls[&global]).value;
        let addr = self.address_of(g);
        self.emit(InstrKind::Set, None, vec![addr, v], false);
    }

    fn begin(&mut self, decl: DeclId, subst: Option<TypeId>) {
        self.state = Some(FnState::new(decl, subst));
        let label = self.program.decl_mut(decl).new_label();
        self.program.decl_mut(decl).return_label = Some(label);
    }

    /// Close the declaration: unified return point, then `Return`
    fn finish(&mut self) {
        let decl = self.cur().decl;
        let (label, ret_var) = {
            let d = self.program.decl(decl);
            (d.return_label, d.ret_var)
        };
        if let Some(l) = label {
            self.emit(InstrKind::Label(l), None, Vec::new(), false);
        }
        self.emit(InstrKind::Return, None, ret_var.into_iter().collect(), false);
        self.state = None;
    }

    fn lower_fun(&mut self, decl: DeclId, fun: NodeId, instance: Option<TypeId>) {
        let NodeKind::Fun { body, attrs, .. } = self.ast.kind(fun).clone() else {
            crate::ice!("lower_fun on {}", fun);
        };
        log::trace!("lowering '{}'", self.program.decl(decl).name);
        self.state = Some(FnState::new(decl, instance));

        if let Some(this) = self.ast.node(fun).this {
            self.lower_receiver(this);
        }
        for p in self.ast.fun_params(fun) {
            let ty = self.node_ty(p);
            let name = self.ast.name(p).map(str::to_string);
            let v = self.program.alloc_var(decl, name, ty, VarShape::Plain);
            self.program.var_mut(v).flags |= VarFlags::ARG;
            let d = self.program.decl_mut(decl);
            d.args.push(v);
            d.vars.push(v);
            self.cur().locals.insert(p, v);
        }

        let ret = self
            .ast
            .type_of(fun)
            .and_then(|t| self.types.signature(t))
            .and_then(|(r, _)| r);
        if let Some(r) = ret {
            let rt = self.owned_ty(r);
            let slot_ty = self.types.acquire(rt);
            let by_pointer = !(self.types.is_builtin(rt) || self.types.is_pointer(rt));
            let ret_var = self
                .program
                .alloc_var(decl, None, Some(slot_ty), VarShape::Plain);
            let d = self.program.decl_mut(decl);
            d.ret = Some(rt);
            d.ret_var = Some(ret_var);
            d.by_pointer = by_pointer;
        }

        let body = match (body, attrs.import) {
            (Some(b), None) => b,
            _ => {
                self.state = None;
                return;
            }
        };
        let label = self.program.decl_mut(decl).new_label();
        self.program.decl_mut(decl).return_label = Some(label);
        let tail = match self.ast.kind(body) {
            NodeKind::Block { stmts } => stmts
                .last()
                .copied()
                .filter(|&s| matches!(self.ast.kind(s), NodeKind::Return { .. })),
            _ => None,
        };
        self.cur().tail_return = tail;
        let is_ctor =
            matches!(self.ast.kind(fun), NodeKind::Fun { name, .. } if name == Magic::New.name());
        if let (true, Some(this)) = (is_ctor, self.ast.node(fun).this) {
            self.lower_field_inits(fun, this);
        }
        self.lower_block(body);
        self.end_frame();
        self.finish();
    }

    /// Field initializers run before the constructor body, in declaration order
    fn lower_field_inits(&mut self, ctor: NodeId, this: NodeId) {
        let Some(owner) = self.ast.node(ctor).parent else {
            return;
        };
        let NodeKind::Struct { members, .. } = self.ast.kind(owner).clone() else {
            return;
        };
        let Some(&recv) = self.cur().locals.get(&this) else {
            crate::ice!("constructor {} lowered before its receiver", ctor);
        };
        for m in members {
            let NodeKind::Decl {
                init: Some(value), ..
            } = self.ast.kind(m).clone()
            else {
                continue;
            };
            let v = self.lower_expr(value);
            let v = self.copy_if_needed(value, v);
            self.take(v);
            let link = match self.decls.get(&m) {
                Some(&d) => self.program.decl(d).value,
                None => crate::ice!("field {} has no declaration", m),
            };
            let ty = self.node_ty(m);
            let field = self.composite(
                VarShape::Attrs {
                    base: recv,
                    chain: vec![link],
                },
                ty,
            );
            self.mark_assigned(field);
            let addr = self.address_of(field);
            let pure = self.is_pure(addr) && self.is_pure(v);
            self.emit(InstrKind::Set, None, vec![addr, v], pure);
        }
    }

    /// `this` arrives as a pointer argument and is used through a `Deref`
    fn lower_receiver(&mut self, this: NodeId) {
        let decl = self.cur().decl;
        let Some(st) = self.node_ty(this) else {
            crate::ice!("receiver {} reached lowering untyped", this);
        };
        let ptr = self.types.pointer(true, st);
        let module = self.program.decl(decl).module;
        let kept = self.types.acquire(ptr);
        self.program.modules[module].types.push(kept);

        let arg = self
            .program
            .alloc_var(decl, Some("this".to_string()), Some(ptr), VarShape::Plain);
        let var = self.program.var_mut(arg);
        var.flags |= VarFlags::ARG;
        var.uses = 1;
        let d = self.program.decl_mut(decl);
        d.args.push(arg);
        d.vars.push(arg);

        let deref = self.composite(VarShape::Deref { base: arg }, Some(st));
        self.cur().locals.insert(this, deref);
    }

    // ==================== Helpers ====================

    fn cur(&mut self) -> &mut FnState {
        match self.state.as_mut() {
            Some(s) => s,
            None => crate::ice!("lowering outside of a declaration"),
        }
    }

    /// Owned reference to `ty` with the active instance substituted
    fn owned_ty(&mut self, ty: TypeId) -> TypeId {
        match self.state.as_ref().and_then(|s| s.subst) {
            // the generic struct itself stands for the instance
            Some(inst)
                if matches!(self.types.kind(ty), TypeKind::Struct { .. })
                    && self.types.struct_of(inst) == Some(ty) =>
            {
                self.types.acquire(inst)
            }
            Some(inst) => self.types.substitute(ty, inst),
            None => self.types.acquire(ty),
        }
    }

    fn node_ty(&mut self, n: NodeId) -> Option<TypeId> {
        if self.ast.flags(n).contains(NodeFlags::VOID) {
            return None;
        }
        let t = self.ast.type_of(n)?;
        Some(self.owned_ty(t))
    }

    fn emit(&mut self, kind: InstrKind, dst: Option<VarId>, operands: Vec<VarId>, pure: bool) {
        let decl = self.cur().decl;
        let index = self.program.decl(decl).instrs.len();
        for &op in &operands {
            self.program.var_mut(op).uses += 1;
        }
        if let Some(d) = dst {
            self.program.var_mut(d).def = Some(index);
        }
        self.program
            .decl_mut(decl)
            .instrs
            .push(Instr::new(kind, dst, operands, pure));
    }

    /// Fresh temporary recorded in the innermost live frame
    fn temp(&mut self, ty: Option<TypeId>) -> VarId {
        let decl = self.cur().decl;
        let v = self.program.alloc_var(decl, None, ty, VarShape::Plain);
        self.program.decl_mut(decl).vars.push(v);
        if let Some(frame) = self.cur().frames.last_mut() {
            frame.push(v);
        }
        v
    }

    fn composite(&mut self, shape: VarShape, ty: Option<TypeId>) -> VarId {
        let decl = self.cur().decl;
        let refs = shape.refs();
        let v = self.program.alloc_var(decl, None, ty, shape);
        for r in refs {
            self.program.var_mut(r).uses += 1;
        }
        self.program.decl_mut(decl).composites.push(v);
        v
    }

    /// Whether a variable's value comes from a side-effect-free computation
    fn is_pure(&self, v: VarId) -> bool {
        let var = self.program.var(v);
        match var.def {
            Some(i) => self.program.decl(var.owner).instrs[i].pure,
            None => true,
        }
    }

    fn mark_assigned(&mut self, v: VarId) {
        let mut cur = Some(v);
        while let Some(id) = cur {
            let var = self.program.var_mut(id);
            var.flags |= VarFlags::ASSIGNED;
            cur = match &var.shape {
                VarShape::Attrs { base, .. } => Some(*base),
                _ => None,
            };
        }
    }

    fn address_of(&mut self, v: VarId) -> VarId {
        let ty = self.program.var(v).ty.map(|t| self.types.pointer(true, t));
        let t = self.temp(ty);
        let pure = self.is_pure(v);
        self.emit(InstrKind::Addr, Some(t), vec![v], pure);
        t
    }

    /// Hand a temporary's destruction over to its new owner
    fn take(&mut self, v: VarId) {
        if self.program.var(v).name.is_some() {
            return;
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };
        for frame in state.frames.iter_mut().rev() {
            if let Some(pos) = frame.iter().position(|&x| x == v) {
                frame.remove(pos);
                self.program.var_mut(v).flags |= VarFlags::DROPPED;
                return;
            }
        }
    }

    /// Declaration of the magic method `magic` of `ty`'s struct
    fn magic_decl(&mut self, ty: TypeId, magic: Magic) -> Option<DeclId> {
        let e = self.types.magic(ty, magic)?;
        let fun = *self.symtab.entry(e).binding.candidates().first()?;
        Some(self.callee_decl(fun, Some(ty)))
    }

    fn destroy(&mut self, v: VarId) {
        let var = self.program.var(v);
        if var.flags.contains(VarFlags::DROPPED) {
            return;
        }
        let Some(ty) = var.ty else {
            return;
        };
        if self.types.struct_of(ty).is_none() {
            return;
        }
        if let Some(d) = self.magic_decl(ty, Magic::Delete) {
            let dtor = self.program.decl(d).value;
            self.emit(InstrKind::Destroy, None, vec![dtor, v], false);
        }
    }

    /// Destroy a frame's variables, last declared first
    fn destroy_frame(&mut self, frame: &[VarId], keep: Option<VarId>) {
        for &v in frame.iter().rev() {
            if Some(v) != keep {
                self.destroy(v);
            }
        }
    }

    fn end_frame(&mut self) {
        let frame = self.cur().frames.pop().unwrap_or_default();
        if !self.cur().terminated {
            self.destroy_frame(&frame, None);
        }
    }

    /// Copy an lvalue struct through its `copy` method, if it has one
    fn copy_if_needed(&mut self, node: NodeId, v: VarId) -> VarId {
        if !self.ast.flags(node).contains(NodeFlags::ADDR) {
            return v;
        }
        let Some(ty) = self.program.var(v).ty else {
            return v;
        };
        let Some(d) = self.magic_decl(ty, Magic::Copy) else {
            return v;
        };
        let copy = self.program.decl(d).value;
        let addr = self.address_of(v);
        let ty = self.types.acquire(ty);
        let t = self.temp(Some(ty));
        self.emit(InstrKind::Call, Some(t), vec![copy, addr], false);
        t
    }

    // ==================== Statements ====================

    fn lower_block(&mut self, block: NodeId) {
        let NodeKind::Block { stmts } = self.ast.kind(block).clone() else {
            self.lower_stmt(block);
            return;
        };
        self.cur().frames.push(Vec::new());
        for s in stmts {
            if self.cur().terminated {
                break;
            }
            self.lower_stmt(s);
        }
        self.end_frame();
    }

    fn lower_stmt(&mut self, s: NodeId) {
        match self.ast.kind(s).clone() {
            NodeKind::Block { .. } => self.lower_block(s),
            NodeKind::Let { name, init, .. } => self.lower_let(s, name, init),
            NodeKind::Assign { lhs, rhs } => self.lower_assign(lhs, rhs),
            NodeKind::Return { value } => self.lower_return(s, value),
            NodeKind::If { cond, then, els } => self.lower_if(cond, then, els),
            NodeKind::While { cond, body } => self.lower_while(cond, body),
            _ => {
                self.lower_expr(s);
            }
        }
    }

    fn lower_let(&mut self, s: NodeId, name: String, init: NodeId) {
        let v = self.lower_expr(init);
        let v = self.copy_if_needed(init, v);
        self.take(v);
        let ty = self.node_ty(s);
        let decl = self.cur().decl;
        let local = self
            .program
            .alloc_var(decl, Some(name), ty, VarShape::Plain);
        self.program.decl_mut(decl).vars.push(local);
        let pure = self.is_pure(v);
        self.emit(InstrKind::New, Some(local), vec![v], pure);
        let state = self.cur();
        if let Some(frame) = state.frames.last_mut() {
            frame.push(local);
        }
        state.locals.insert(s, local);
    }

    fn lower_assign(&mut self, lhs: NodeId, rhs: NodeId) {
        let v = self.lower_expr(rhs);
        let v = self.copy_if_needed(rhs, v);
        self.take(v);
        let target = self.lower_expr(lhs);
        self.destroy(target);
        self.mark_assigned(target);
        let addr = self.address_of(target);
        let pure = self.is_pure(addr) && self.is_pure(v);
        self.emit(InstrKind::Set, None, vec![addr, v], pure);
    }

    fn lower_return(&mut self, s: NodeId, value: Option<NodeId>) {
        let decl = self.cur().decl;
        let mut keep = None;
        if let Some(value) = value {
            let r = self.lower_expr(value);
            let named = {
                let var = self.program.var(r);
                var.name.is_some() && !var.is_composite()
            };
            let r = if named {
                keep = Some(r);
                r
            } else {
                let r = self.copy_if_needed(value, r);
                self.take(r);
                r
            };
            let Some(slot) = self.program.decl(decl).ret_var else {
                crate::ice!("return value in '{}' without a return slot", self.program.decl(decl).name);
            };
            let pure = self.is_pure(r);
            self.emit(InstrKind::New, Some(slot), vec![r], pure);
        }

        let frames = self.cur().frames.clone();
        for frame in frames.iter().rev() {
            self.destroy_frame(frame, keep);
        }
        if self.cur().tail_return != Some(s) {
            if let Some(l) = self.program.decl(decl).return_label {
                self.emit(InstrKind::Jump(l), None, Vec::new(), false);
            }
        }
        self.cur().terminated = true;
    }

    fn new_label(&mut self) -> Label {
        let decl = self.cur().decl;
        self.program.decl_mut(decl).new_label()
    }

    /// Lower a condition; its temporaries die before the jump
    fn lower_condition(&mut self, cond: NodeId) -> VarId {
        self.cur().frames.push(Vec::new());
        let mut c = self.lower_expr(cond);
        if let Some(ty) = self.program.var(c).ty {
            if self.types.struct_of(ty).is_some() {
                if let Some(d) = self.magic_decl(ty, Magic::Bool) {
                    let conv = self.program.decl(d).value;
                    let addr = self.address_of(c);
                    let bool_ty = self.types.builtin(Builtin::Bool);
                    let t = self.temp(Some(bool_ty));
                    self.emit(InstrKind::Call, Some(t), vec![conv, addr], false);
                    c = t;
                }
            }
        }
        self.end_frame();
        c
    }

    fn lower_if(&mut self, cond: NodeId, then: NodeId, els: Option<NodeId>) {
        let end = self.new_label();
        let c = self.lower_condition(cond);
        let Some(els) = els else {
            self.emit(InstrKind::JumpUnless(end), None, vec![c], false);
            self.lower_block(then);
            self.emit(InstrKind::Label(end), None, Vec::new(), false);
            self.cur().terminated = false;
            return;
        };

        let other = self.new_label();
        self.emit(InstrKind::JumpUnless(other), None, vec![c], false);
        self.lower_block(then);
        let then_done = self.cur().terminated;
        if !then_done {
            self.emit(InstrKind::Jump(end), None, Vec::new(), false);
        }
        self.emit(InstrKind::Label(other), None, Vec::new(), false);
        self.cur().terminated = false;
        self.lower_block(els);
        let else_done = self.cur().terminated;
        self.emit(InstrKind::Label(end), None, Vec::new(), false);
        self.cur().terminated = then_done && else_done;
    }

    fn lower_while(&mut self, cond: NodeId, body: NodeId) {
        let start = self.new_label();
        let end = self.new_label();
        self.emit(InstrKind::Label(start), None, Vec::new(), false);
        let c = self.lower_condition(cond);
        self.emit(InstrKind::JumpUnless(end), None, vec![c], false);
        self.lower_block(body);
        if !self.cur().terminated {
            self.emit(InstrKind::Jump(start), None, Vec::new(), false);
        }
        self.emit(InstrKind::Label(end), None, Vec::new(), false);
        self.cur().terminated = false;
    }

    // ==================== Expressions ====================

    /// Variable an identifier, field or receiver refers to
    fn lookup(&mut self, n: NodeId) -> VarId {
        let Some(target) = self.ast.node(n).target else {
            crate::ice!("identifier {} reached lowering unresolved", n);
        };
        if let Some(&v) = self.cur().locals.get(&target) {
            return v;
        }
        match self.decls.get(&target) {
            Some(&d) => self.program.decl(d).value,
            None => crate::ice!("{} refers to {} which was never lowered", n, target),
        }
    }

    fn lower_expr(&mut self, n: NodeId) -> VarId {
        match self.ast.kind(n).clone() {
            NodeKind::Int { value } => {
                let ty = self.node_ty(n);
                let t = self.temp(ty);
                self.emit(InstrKind::Int(value), Some(t), Vec::new(), true);
                t
            }
            NodeKind::Str { value } => {
                let ty = self.node_ty(n);
                let t = self.temp(ty);
                self.emit(InstrKind::Str(value), Some(t), Vec::new(), true);
                t
            }
            NodeKind::Ident { .. } => self.lookup(n),
            NodeKind::BinOp { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                let pure = self.is_pure(l) && self.is_pure(r);
                let ty = self.node_ty(n);
                let t = self.temp(ty);
                self.emit(InstrKind::Op(op), Some(t), vec![l, r], pure);
                t
            }
            NodeKind::AddrOf { operand } => {
                let v = self.lower_expr(operand);
                self.mark_assigned(v);
                let pure = self.is_pure(v);
                let ty = self.node_ty(n);
                let t = self.temp(ty);
                self.emit(InstrKind::Addr, Some(t), vec![v], pure);
                t
            }
            NodeKind::Deref { operand } => {
                let base = self.lower_expr(operand);
                let ty = self.node_ty(n);
                self.composite(VarShape::Deref { base }, ty)
            }
            NodeKind::Index { .. } => {
                let mut chain = Vec::new();
                let base = self.index_chain(n, &mut chain);
                let ty = self.node_ty(n);
                self.composite(VarShape::Indexes { base, chain }, ty)
            }
            NodeKind::Attr { .. } => {
                let mut chain = Vec::new();
                let base = self.attr_chain(n, &mut chain);
                let ty = self.node_ty(n);
                self.composite(VarShape::Attrs { base, chain }, ty)
            }
            NodeKind::Call { callee, args } => self.lower_call(n, callee, &args),
            NodeKind::New { args, .. } => self.lower_new(n, &args),
            NodeKind::Cast { expr, .. } => {
                let v = self.lower_expr(expr);
                let pure = self.is_pure(v);
                let ty = self.node_ty(n);
                let t = self.temp(ty);
                self.emit(InstrKind::Cast, Some(t), vec![v], pure);
                t
            }
            other => crate::ice!("unexpected {:?} in expression position", other),
        }
    }

    fn index_chain(&mut self, n: NodeId, chain: &mut Vec<VarId>) -> VarId {
        match self.ast.kind(n).clone() {
            NodeKind::Index { base, index } => {
                let b = self.index_chain(base, chain);
                let i = self.lower_expr(index);
                chain.push(i);
                b
            }
            _ => self.lower_expr(n),
        }
    }

    /// Fields of the chain come first, outermost last
    fn attr_chain(&mut self, n: NodeId, chain: &mut Vec<VarId>) -> VarId {
        let field = match self.ast.kind(n) {
            NodeKind::Attr { base, .. } => self
                .ast
                .node(n)
                .target
                .filter(|&t| {
                    matches!(self.ast.kind(t), NodeKind::Decl { role: DeclRole::Field, .. })
                })
                .map(|t| (*base, t)),
            _ => None,
        };
        match field {
            Some((base, f)) => {
                let b = self.attr_chain(base, chain);
                let link = match self.decls.get(&f) {
                    Some(&d) => self.program.decl(d).value,
                    None => crate::ice!("field {} has no declaration", f),
                };
                chain.push(link);
                b
            }
            None if matches!(self.ast.kind(n), NodeKind::Attr { .. }) => {
                crate::ice!("attribute {} reached lowering without a field", n)
            }
            None => self.lower_expr(n),
        }
    }

    fn lower_call(&mut self, n: NodeId, callee: NodeId, args: &[NodeId]) -> VarId {
        let mut ops = Vec::with_capacity(args.len() + 2);
        match self.ast.kind(callee).clone() {
            NodeKind::Attr { base, .. } if self.ast.flags(callee).contains(NodeFlags::STATIC) => {
                let Some(fun) = self.ast.node(callee).target else {
                    crate::ice!("method call {} reached lowering unresolved", n);
                };
                let owner = self.ast.type_of(base);
                let d = self.callee_decl(fun, owner);
                ops.push(self.program.decl(d).value);
                let recv = self.lower_expr(base);
                if matches!(self.ast.kind(fun), NodeKind::Fun { attrs, .. } if attrs.mutating) {
                    self.mark_assigned(recv);
                }
                let addr = self.address_of(recv);
                ops.push(addr);
            }
            _ => {
                let c = self.lower_expr(callee);
                ops.push(c);
            }
        }
        for &a in args {
            let v = self.lower_expr(a);
            ops.push(v);
        }
        let ty = self.node_ty(n);
        let t = self.temp(ty);
        self.emit(InstrKind::Call, Some(t), ops, false);
        t
    }

    fn lower_new(&mut self, n: NodeId, args: &[NodeId]) -> VarId {
        let Some(ctor) = self.ast.node(n).target else {
            crate::ice!("construction {} has no constructor", n);
        };
        let owner = self.ast.type_of(n);
        let d = self.callee_decl(ctor, owner);
        let mut ops = vec![self.program.decl(d).value];
        for &a in args {
            let v = self.lower_expr(a);
            ops.push(v);
        }
        let ty = self.node_ty(n);
        let t = self.temp(ty);
        self.emit(InstrKind::Construct, Some(t), ops, false);
        t
    }
}

/// Lower a checked AST into IR
pub fn generate(
    ast: &Ast,
    symtab: &SymbolTable,
    types: &mut TypeArena,
    options: &Options,
) -> IrProgram {
    IrGenerator::new(ast, symtab, types, options).generate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::resolve::resolve;
    use crate::frontend::syntax::Unit;
    use crate::frontend::typeck::check;
    use crate::middle::ir::Decl;
    use crate::utils::Diagnostics;
    use serde_json::{json, Value};

    fn lower(items: Value) -> (IrProgram, TypeArena) {
        let unit: Unit =
            serde_json::from_value(json!({ "modules": [{ "name": "main", "items": items }] }))
                .unwrap();
        let mut types = TypeArena::new();
        let mut ast = Ast::new();
        let mut symtab = SymbolTable::new(&types);
        let mut diags = Diagnostics::new();
        let options = Options::default();
        unit.lower(&mut ast);
        resolve(&mut ast, &mut symtab, &mut diags);
        check(&mut ast, &symtab, &mut types, &mut diags, &options);
        assert_eq!(diags.error_count(), 0, "{:?}", diags.items());
        let program = generate(&ast, &symtab, &mut types, &options);
        (program, types)
    }

    fn ident(name: &str) -> Value {
        json!({ "kind": "ident", "name": name })
    }

    fn int(v: u64) -> Value {
        json!({ "kind": "int", "value": v })
    }

    fn kinds(decl: &Decl) -> Vec<&InstrKind> {
        decl.live_instrs().map(|i| &i.kind).collect()
    }

    fn res_struct(name: &str, with_dtor: bool) -> Value {
        let mut members = vec![json!({ "kind": "fun", "name": "new", "body": [] })];
        if with_dtor {
            members.push(json!({ "kind": "fun", "name": "delete", "body": [] }));
        }
        json!({ "kind": "struct", "name": name, "members": members })
    }

    #[test]
    fn test_if_else_lowers_to_labels_and_jumps() {
        let (program, _) = lower(json!([
            { "kind": "fun", "name": "f", "params": [{ "name": "c", "ty": ident("bool") }],
              "ret": ident("int"),
              "body": [
                { "kind": "if", "cond": ident("c"),
                  "then": [{ "kind": "return", "value": int(1) }],
                  "else": [{ "kind": "return", "value": int(2) }] },
              ] }
        ]));
        let f = program.find_decl("main", "f").unwrap();
        let k = kinds(f);
        assert!(matches!(k[0], InstrKind::JumpUnless(_)));
        let jumps = k.iter().filter(|k| matches!(k, InstrKind::Jump(_))).count();
        assert_eq!(jumps, 2);
        assert_eq!(k.last(), Some(&&InstrKind::Return));
        assert!(f.ret_var.is_some());
        assert!(!f.by_pointer);
    }

    #[test]
    fn test_block_exit_destroys_in_reverse_order() {
        let (program, _) = lower(json!([
            res_struct("A", true),
            res_struct("B", true),
            res_struct("C", false),
            { "kind": "fun", "name": "f", "body": [
                { "kind": "let", "name": "a", "init": { "kind": "new", "ty": ident("A") } },
                { "kind": "let", "name": "c", "init": { "kind": "new", "ty": ident("C") } },
                { "kind": "let", "name": "b", "init": { "kind": "new", "ty": ident("B") } }
            ] }
        ]));
        let f = program.find_decl("main", "f").unwrap();
        let destroyed: Vec<_> = f
            .live_instrs()
            .filter(|i| i.kind == InstrKind::Destroy)
            .map(|i| program.var(i.operands[1]).name.clone().unwrap_or_default())
            .collect();
        assert_eq!(destroyed, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_early_return_unwinds_every_frame() {
        let (program, _) = lower(json!([
            res_struct("A", true),
            { "kind": "fun", "name": "f", "params": [{ "name": "c", "ty": ident("bool") }], "body": [
                { "kind": "let", "name": "outer", "init": { "kind": "new", "ty": ident("A") } },
                { "kind": "if", "cond": ident("c"), "then": [
                    { "kind": "let", "name": "inner", "init": { "kind": "new", "ty": ident("A") } },
                    { "kind": "return" }
                ] }
            ] }
        ]));
        let f = program.find_decl("main", "f").unwrap();
        let destroyed: Vec<_> = f
            .live_instrs()
            .filter(|i| i.kind == InstrKind::Destroy)
            .map(|i| program.var(i.operands[1]).name.clone().unwrap_or_default())
            .collect();
        // early return path, then the fall-through path
        assert_eq!(destroyed, vec!["inner", "outer", "outer"]);
    }

    #[test]
    fn test_method_receives_this_pointer() {
        let (program, types) = lower(json!([
            { "kind": "struct", "name": "S", "members": [
                { "kind": "global", "name": "x", "ty": ident("int") },
                { "kind": "fun", "name": "new", "body": [
                    { "kind": "assign",
                      "lhs": { "kind": "attr", "base": ident("this"), "name": "x" },
                      "rhs": int(0) }
                ] }
            ] }
        ]));
        let ctor = program.find_decl("main", "S.new").unwrap();
        assert!(ctor.member);
        let this = program.var(ctor.args[0]);
        assert_eq!(types.display(this.ty.unwrap()), "*mut S");
        let set = ctor.live_instrs().find(|i| i.kind == InstrKind::Set).unwrap();
        let addr = program.var(set.operands[0]);
        let target = program.var(program.decl(ctor.id).instrs[addr.def.unwrap()].operands[0]);
        assert!(matches!(target.shape, VarShape::Attrs { .. }));
        assert_eq!(program.modules[0].structs[0].fields.len(), 1);
    }

    #[test]
    fn test_field_initializers_run_before_constructor_body() {
        let (program, _) = lower(json!([
            { "kind": "struct", "name": "S", "members": [
                { "kind": "global", "name": "a", "ty": ident("int"), "init": int(7) },
                { "kind": "global", "name": "b", "ty": ident("int"), "init": int(8) },
                { "kind": "fun", "name": "new", "body": [
                    { "kind": "assign",
                      "lhs": { "kind": "attr", "base": ident("this"), "name": "b" },
                      "rhs": int(1) }
                ] },
                { "kind": "fun", "name": "get", "ret": ident("int"), "body": [
                    { "kind": "return", "value": { "kind": "attr", "base": ident("this"), "name": "a" } }
                ] }
            ] }
        ]));
        let ctor = program.find_decl("main", "S.new").unwrap();
        assert_eq!(
            kinds(ctor)[..9],
            [
                &InstrKind::Int(7),
                &InstrKind::Addr,
                &InstrKind::Set,
                &InstrKind::Int(8),
                &InstrKind::Addr,
                &InstrKind::Set,
                &InstrKind::Int(1),
                &InstrKind::Addr,
                &InstrKind::Set,
            ]
        );
        let first = ctor.live_instrs().find(|i| i.kind == InstrKind::Addr).unwrap();
        let VarShape::Attrs { chain, .. } = &program.var(first.operands[0]).shape else {
            panic!("field store goes through an attribute chain");
        };
        assert_eq!(program.var(chain[0]).name.as_deref(), Some("a"));

        // other methods do not repeat the initializers
        let get = program.find_decl("main", "S.get").unwrap();
        assert!(!kinds(get).contains(&&InstrKind::Int(7)));
    }

    #[test]
    fn test_global_initializer_goes_through_init() {
        let (program, _) = lower(json!([
            { "kind": "global", "name": "g", "ty": ident("int"), "init": int(5) }
        ]));
        let init = program.decl(program.modules[0].init().unwrap());
        assert!(init.export);
        assert_eq!(
            kinds(init)[..3],
            [&InstrKind::Int(5), &InstrKind::Addr, &InstrKind::Set]
        );
    }

    #[test]
    fn test_generic_methods_lowered_per_instance() {
        let (program, _) = lower(json!([
            { "kind": "struct", "name": "Box", "params": ["T"], "members": [
                { "kind": "global", "name": "item", "ty": ident("T") },
                { "kind": "fun", "name": "new", "params": [{ "name": "v", "ty": ident("T") }], "body": [
                    { "kind": "assign",
                      "lhs": { "kind": "attr", "base": ident("this"), "name": "item" },
                      "rhs": ident("v") }
                ] }
            ] },
            { "kind": "fun", "name": "f", "body": [
                { "kind": "let", "name": "a", "init": { "kind": "new",
                    "ty": { "kind": "generic", "base": ident("Box"), "args": [ident("int")] },
                    "args": [int(1)] } },
                { "kind": "let", "name": "b", "init": { "kind": "new",
                    "ty": { "kind": "generic", "base": ident("Box"), "args": [ident("int")] },
                    "args": [int(2)] } },
                { "kind": "let", "name": "c", "init": { "kind": "new",
                    "ty": { "kind": "generic", "base": ident("Box"), "args": [ident("byte")] },
                    "args": [int(3)] } }
            ] }
        ]));
        let names: Vec<_> = program
            .decls
            .iter()
            .filter(|d| d.name.ends_with(".new"))
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["Box[int].new", "Box[byte].new"]);
        let ctor = program.find_decl("main", "Box[byte].new").unwrap();
        assert!(!ctor.instrs.is_empty());
    }
}
