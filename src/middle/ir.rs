//! Ember IR definitions
//!
//! Flat per-declaration instruction lists over typed variables. Lvalue
//! chains stay composite variables (`VarShape`) instead of being split into
//! loads, so the consuming instruction computes the address.
//!
//! Every `TypeId` stored in the IR is an owned reference.

use std::fmt;

use bitflags::bitflags;

use crate::frontend::ast::BinOp;
use crate::types::{TypeArena, TypeId};

/// IR variable handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// IR declaration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(pub u32);

/// Jump target, local to a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VarFlags: u8 {
        /// Function argument
        const ARG      = 1 << 0;
        /// Stored through or had its address taken
        const ASSIGNED = 1 << 1;
        /// Destruction handed over to someone else
        const DROPPED  = 1 << 2;
    }
}

/// How a variable is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarShape {
    /// Owns storage
    Plain,
    /// `*base`
    Deref { base: VarId },
    /// `base.a.b`, one field variable per link
    Attrs { base: VarId, chain: Vec<VarId> },
    /// `base[i][j]`
    Indexes { base: VarId, chain: Vec<VarId> },
}

impl VarShape {
    /// Variables a composite refers to
    pub fn refs(&self) -> Vec<VarId> {
        match self {
            VarShape::Plain => Vec::new(),
            VarShape::Deref { base } => vec![*base],
            VarShape::Attrs { base, chain } | VarShape::Indexes { base, chain } => {
                std::iter::once(*base).chain(chain.iter().copied()).collect()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Var {
    pub id: VarId,
    pub name: Option<String>,
    pub uses: u32,
    pub owner: DeclId,
    /// Index of the defining instruction in the owner's list
    pub def: Option<usize>,
    /// `None` once the optimizer drops the variable's storage
    pub ty: Option<TypeId>,
    pub shape: VarShape,
    pub flags: VarFlags,
}

impl Var {
    pub fn is_composite(&self) -> bool {
        self.shape != VarShape::Plain
    }
}

// ==================== Instructions ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrKind {
    /// Removed instruction
    Nop,
    Label(Label),
    Jump(Label),
    /// Jump when the operand is false
    JumpUnless(Label),
    /// Define a local from the operand
    New,
    /// `[address, value]`
    Set,
    Return,
    Addr,
    /// `[constructor, args..]`
    Construct,
    /// `[callee, receiver address?, args..]`
    Call,
    /// `[destructor, target]`
    Destroy,
    Cast,
    Op(BinOp),
    Int(u64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub kind: InstrKind,
    pub dst: Option<VarId>,
    pub operands: Vec<VarId>,
    /// Free of side effects, may be dropped with its result
    pub pure: bool,
}

impl Instr {
    pub fn new(kind: InstrKind, dst: Option<VarId>, operands: Vec<VarId>, pure: bool) -> Self {
        Self {
            kind,
            dst,
            operands,
            pure,
        }
    }

    pub fn is_nop(&self) -> bool {
        self.kind == InstrKind::Nop
    }
}

// ==================== Declarations ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Function,
    Global,
}

#[derive(Debug, Clone)]
pub struct Decl {
    pub id: DeclId,
    /// Empty for a module initializer
    pub name: String,
    pub kind: DeclKind,
    pub module: usize,
    /// Locals and temporaries that own storage
    pub vars: Vec<VarId>,
    pub composites: Vec<VarId>,
    pub args: Vec<VarId>,
    pub instrs: Vec<Instr>,
    pub ret: Option<TypeId>,
    /// Return slot, not listed in `vars`
    pub ret_var: Option<VarId>,
    pub return_label: Option<Label>,
    pub labels: u32,
    /// Result is returned through a caller-provided address
    pub by_pointer: bool,
    pub export: bool,
    pub export_as: Option<String>,
    pub import: Option<String>,
    pub member: bool,
    /// The function or global itself
    pub value: VarId,
}

impl Decl {
    pub fn new_label(&mut self) -> Label {
        let l = Label(self.labels);
        self.labels += 1;
        l
    }

    pub fn live_instrs(&self) -> impl Iterator<Item = &Instr> {
        self.instrs.iter().filter(|i| !i.is_nop())
    }
}

/// Field and method declarations of one struct (or generic instance)
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub name: String,
    pub ty: TypeId,
    pub fields: Vec<DeclId>,
    pub methods: Vec<DeclId>,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    /// Initializer first
    pub decls: Vec<DeclId>,
    /// Types introduced by lowering, such as receiver pointers
    pub types: Vec<TypeId>,
    pub imports: Vec<String>,
    pub structs: Vec<StructLayout>,
    pub main: Option<DeclId>,
}

impl Module {
    pub fn new(name: &str, imports: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            decls: Vec::new(),
            types: Vec::new(),
            imports,
            structs: Vec::new(),
            main: None,
        }
    }

    pub fn init(&self) -> Option<DeclId> {
        self.decls.first().copied()
    }
}

/// Lowered compilation unit
#[derive(Debug, Clone, Default)]
pub struct IrProgram {
    pub modules: Vec<Module>,
    pub decls: Vec<Decl>,
    pub vars: Vec<Var>,
}

impl IrProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(&self, id: VarId) -> &Var {
        match self.vars.get(id.0 as usize) {
            Some(v) => v,
            None => crate::ice!("dangling variable {}", id),
        }
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Var {
        match self.vars.get_mut(id.0 as usize) {
            Some(v) => v,
            None => crate::ice!("dangling variable {}", id),
        }
    }

    pub fn decl(&self, id: DeclId) -> &Decl {
        match self.decls.get(id.0 as usize) {
            Some(d) => d,
            None => crate::ice!("dangling declaration d{}", id.0),
        }
    }

    pub fn decl_mut(&mut self, id: DeclId) -> &mut Decl {
        match self.decls.get_mut(id.0 as usize) {
            Some(d) => d,
            None => crate::ice!("dangling declaration d{}", id.0),
        }
    }

    /// Allocate a variable without listing it in its owner
    pub fn alloc_var(
        &mut self,
        owner: DeclId,
        name: Option<String>,
        ty: Option<TypeId>,
        shape: VarShape,
    ) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Var {
            id,
            name,
            uses: 0,
            owner,
            def: None,
            ty,
            shape,
            flags: VarFlags::empty(),
        });
        id
    }

    /// Allocate a declaration together with its value variable
    pub fn alloc_decl(
        &mut self,
        module: usize,
        name: &str,
        kind: DeclKind,
        ty: Option<TypeId>,
    ) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        let value = self.alloc_var(id, Some(name.to_string()), ty, VarShape::Plain);
        self.decls.push(Decl {
            id,
            name: name.to_string(),
            kind,
            module,
            vars: Vec::new(),
            composites: Vec::new(),
            args: Vec::new(),
            instrs: Vec::new(),
            ret: None,
            ret_var: None,
            return_label: None,
            labels: 0,
            by_pointer: false,
            export: false,
            export_as: None,
            import: None,
            member: false,
            value,
        });
        if let Some(m) = self.modules.get_mut(module) {
            m.decls.push(id);
        }
        id
    }

    /// Declaration called `name` in module `module`
    pub fn find_decl(&self, module: &str, name: &str) -> Option<&Decl> {
        let m = self.modules.iter().find(|m| m.name == module)?;
        m.decls
            .iter()
            .map(|&d| self.decl(d))
            .find(|d| d.name == name)
    }

    /// Release every type reference held by the IR
    pub fn release_types(&mut self, types: &mut TypeArena) {
        for v in &mut self.vars {
            if let Some(t) = v.ty.take() {
                types.release(t);
            }
        }
        for d in &mut self.decls {
            if let Some(t) = d.ret.take() {
                types.release(t);
            }
        }
        for m in &mut self.modules {
            for t in m.types.drain(..) {
                types.release(t);
            }
            for s in &mut m.structs {
                types.release(s.ty);
                s.ty = TypeId::ANY;
            }
        }
    }
}
