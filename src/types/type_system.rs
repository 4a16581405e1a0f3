//! Type System for Ember
//!
//! Types live in a reference-counted arena. Every `TypeId` stored anywhere
//! (AST type slots, IR vars, module type lists, constituents of other types)
//! is an acquired reference; releasing the last one frees the slot and
//! releases its constituents. `Any` and the builtin scalars are singletons
//! at fixed ids and are never counted.

use std::fmt;

use crate::frontend::ast::NodeId;
use crate::frontend::symtab::EntryId;

// ==================== Ids & Kinds ====================

/// Handle to a slot of the type arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// The error-recovery sentinel
    pub const ANY: TypeId = TypeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Builtin scalar types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Int,
    Char,
    Byte,
    Size,
    Bool,
}

impl Builtin {
    pub const ALL: [Builtin; 5] = [
        Builtin::Int,
        Builtin::Char,
        Builtin::Byte,
        Builtin::Size,
        Builtin::Bool,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Int => "int",
            Builtin::Char => "char",
            Builtin::Byte => "byte",
            Builtin::Size => "size",
            Builtin::Bool => "bool",
        }
    }

    fn id(self) -> TypeId {
        TypeId(1 + self as u32)
    }
}

/// Methods a struct may declare under a reserved name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    New,
    Delete,
    Copy,
    Bool,
    Index,
    AddrIndex,
}

impl Magic {
    pub const COUNT: usize = 6;

    pub const ALL: [Magic; Magic::COUNT] = [
        Magic::New,
        Magic::Delete,
        Magic::Copy,
        Magic::Bool,
        Magic::Index,
        Magic::AddrIndex,
    ];

    /// Reserved method name
    pub fn name(self) -> &'static str {
        match self {
            Magic::New => "new",
            Magic::Delete => "delete",
            Magic::Copy => "copy",
            Magic::Bool => "bool",
            Magic::Index => "[]",
            Magic::AddrIndex => "&[]",
        }
    }

    pub fn from_name(name: &str) -> Option<Magic> {
        Magic::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// Magic method table of a struct, indexed by `Magic`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MagicTable([Option<EntryId>; Magic::COUNT]);

impl MagicTable {
    pub fn get(&self, magic: Magic) -> Option<EntryId> {
        self.0[magic as usize]
    }

    pub fn set(&mut self, magic: Magic, entry: EntryId) {
        self.0[magic as usize] = Some(entry);
    }
}

/// Kind of a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Any,
    Builtin(Builtin),
    Pointer {
        mutable: bool,
        pointee: TypeId,
    },
    Function {
        ret: Option<TypeId>,
        params: Vec<TypeId>,
    },
    /// Members are reached through `decl`, never owned by the type
    Struct {
        name: String,
        decl: NodeId,
        magic: MagicTable,
        params: Vec<TypeId>,
    },
    GenericVar {
        name: String,
        decl: NodeId,
        index: usize,
    },
    GenericInstance {
        base: TypeId,
        args: Vec<TypeId>,
    },
}

impl TypeKind {
    /// References held by this kind
    fn constituents(&self) -> Vec<TypeId> {
        match self {
            TypeKind::Any | TypeKind::Builtin(_) | TypeKind::GenericVar { .. } => Vec::new(),
            TypeKind::Pointer { pointee, .. } => vec![*pointee],
            TypeKind::Function { ret, params } => ret.iter().chain(params).copied().collect(),
            TypeKind::Struct { params, .. } => params.clone(),
            TypeKind::GenericInstance { base, args } => {
                std::iter::once(*base).chain(args.iter().copied()).collect()
            }
        }
    }
}

// ==================== Arena ====================

#[derive(Debug)]
struct Slot {
    kind: TypeKind,
    rc: u32,
}

/// Reference accounting, used to verify acquire/release balance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeStats {
    /// Fresh allocations plus explicit acquires
    pub acquires: usize,
    pub releases: usize,
    /// Counted slots currently alive
    pub live: usize,
}

/// Reference-counted type arena
#[derive(Debug)]
pub struct TypeArena {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    stats: TypeStats,
}

const SINGLETONS: u32 = 1 + Builtin::ALL.len() as u32;

impl TypeArena {
    pub fn new() -> Self {
        let mut slots = vec![Some(Slot {
            kind: TypeKind::Any,
            rc: 1,
        })];
        for b in Builtin::ALL {
            slots.push(Some(Slot {
                kind: TypeKind::Builtin(b),
                rc: 1,
            }));
        }
        Self {
            slots,
            free: Vec::new(),
            stats: TypeStats::default(),
        }
    }

    pub fn any(&self) -> TypeId {
        TypeId::ANY
    }

    pub fn builtin(&self, b: Builtin) -> TypeId {
        b.id()
    }

    pub fn is_singleton(&self, ty: TypeId) -> bool {
        ty.0 < SINGLETONS
    }

    pub fn stats(&self) -> TypeStats {
        self.stats
    }

    /// Take another reference to `ty`
    pub fn acquire(&mut self, ty: TypeId) -> TypeId {
        if self.is_singleton(ty) {
            return ty;
        }
        match self.slots.get_mut(ty.index()).and_then(Option::as_mut) {
            Some(slot) => slot.rc += 1,
            None => crate::ice!("acquire of freed type {}", ty),
        }
        self.stats.acquires += 1;
        ty
    }

    /// Drop a reference; the slot is freed at zero
    pub fn release(&mut self, ty: TypeId) {
        if self.is_singleton(ty) {
            return;
        }
        self.stats.releases += 1;
        let slot = match self.slots.get_mut(ty.index()).and_then(Option::as_mut) {
            Some(slot) => slot,
            None => crate::ice!("release of freed type {}", ty),
        };
        slot.rc -= 1;
        if slot.rc > 0 {
            return;
        }
        let freed = self.slots[ty.index()].take();
        self.free.push(ty.0);
        self.stats.live -= 1;
        log::trace!("freed type {}", ty);
        if let Some(slot) = freed {
            for c in slot.kind.constituents() {
                self.release(c);
            }
        }
    }

    fn alloc(&mut self, kind: TypeKind) -> TypeId {
        self.stats.acquires += 1;
        self.stats.live += 1;
        let slot = Some(Slot { kind, rc: 1 });
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = slot;
                TypeId(i)
            }
            None => {
                self.slots.push(slot);
                TypeId(self.slots.len() as u32 - 1)
            }
        }
    }

    // ==================== Constructors ====================
    //
    // Constructors acquire their constituents themselves and hand back a
    // fresh reference owned by the caller.

    pub fn pointer(&mut self, mutable: bool, pointee: TypeId) -> TypeId {
        self.acquire(pointee);
        self.alloc(TypeKind::Pointer { mutable, pointee })
    }

    pub fn function(&mut self, ret: Option<TypeId>, params: Vec<TypeId>) -> TypeId {
        if let Some(r) = ret {
            self.acquire(r);
        }
        for &p in &params {
            self.acquire(p);
        }
        self.alloc(TypeKind::Function { ret, params })
    }

    pub fn structure(&mut self, name: &str, decl: NodeId, params: Vec<TypeId>) -> TypeId {
        for &p in &params {
            self.acquire(p);
        }
        self.alloc(TypeKind::Struct {
            name: name.to_string(),
            decl,
            magic: MagicTable::default(),
            params,
        })
    }

    pub fn generic_var(&mut self, name: &str, decl: NodeId, index: usize) -> TypeId {
        self.alloc(TypeKind::GenericVar {
            name: name.to_string(),
            decl,
            index,
        })
    }

    pub fn generic_instance(&mut self, base: TypeId, args: Vec<TypeId>) -> TypeId {
        self.acquire(base);
        for &a in &args {
            self.acquire(a);
        }
        self.alloc(TypeKind::GenericInstance { base, args })
    }

    // ==================== Queries ====================

    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        match self.slots.get(ty.index()).and_then(Option::as_ref) {
            Some(slot) => &slot.kind,
            None => crate::ice!("use of freed type {}", ty),
        }
    }

    pub fn refcount(&self, ty: TypeId) -> u32 {
        self.slots
            .get(ty.index())
            .and_then(Option::as_ref)
            .map_or(0, |s| s.rc)
    }

    pub fn is_any(&self, ty: TypeId) -> bool {
        ty == TypeId::ANY
    }

    pub fn is_builtin(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Builtin(_))
    }

    pub fn as_builtin(&self, ty: TypeId) -> Option<Builtin> {
        match self.kind(ty) {
            TypeKind::Builtin(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Pointer { .. })
    }

    pub fn pointee(&self, ty: TypeId) -> Option<(bool, TypeId)> {
        match self.kind(ty) {
            TypeKind::Pointer { mutable, pointee } => Some((*mutable, *pointee)),
            _ => None,
        }
    }

    /// Return and parameter types of a function type
    pub fn signature(&self, ty: TypeId) -> Option<(Option<TypeId>, &[TypeId])> {
        match self.kind(ty) {
            TypeKind::Function { ret, params } => Some((*ret, params.as_slice())),
            _ => None,
        }
    }

    /// The struct type behind `ty`, looking through generic instances
    pub fn struct_of(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Struct { .. } => Some(ty),
            TypeKind::GenericInstance { base, .. } => self.struct_of(*base),
            _ => None,
        }
    }

    /// Declaring node of a struct (or instance) type
    pub fn struct_decl(&self, ty: TypeId) -> Option<NodeId> {
        match self.struct_of(ty).map(|s| self.kind(s)) {
            Some(TypeKind::Struct { decl, .. }) => Some(*decl),
            _ => None,
        }
    }

    pub fn generic_params(&self, ty: TypeId) -> &[TypeId] {
        match self.kind(ty) {
            TypeKind::Struct { params, .. } => params,
            _ => &[],
        }
    }

    pub fn magic(&self, ty: TypeId, magic: Magic) -> Option<EntryId> {
        match self.struct_of(ty).map(|s| self.kind(s)) {
            Some(TypeKind::Struct { magic: table, .. }) => table.get(magic),
            _ => None,
        }
    }

    pub fn set_magic(&mut self, ty: TypeId, magic: Magic, entry: EntryId) {
        match self.slots.get_mut(ty.index()).and_then(Option::as_mut) {
            Some(Slot {
                kind: TypeKind::Struct { magic: table, .. },
                ..
            }) => table.set(magic, entry),
            _ => crate::ice!("magic table update on non-struct type {}", ty),
        }
    }

    // ==================== Matching ====================

    /// Whether a value of type `given` may be used where `expected` is wanted.
    ///
    /// `literal` is set when the given side is an integer literal node; in
    /// loose mode it lets the literal match any non-bool builtin. `strict`
    /// turns that relaxation off. A mutable pointer may flow into an
    /// immutable one, not the reverse.
    pub fn matches(&self, expected: TypeId, given: TypeId, literal: bool, strict: bool) -> bool {
        if expected == given || self.is_any(expected) || self.is_any(given) {
            return true;
        }
        match (self.kind(expected), self.kind(given)) {
            (TypeKind::Builtin(a), TypeKind::Builtin(b)) => {
                a == b || (literal && !strict && *a != Builtin::Bool && *b != Builtin::Bool)
            }
            (
                TypeKind::Pointer {
                    mutable: m1,
                    pointee: p1,
                },
                TypeKind::Pointer {
                    mutable: m2,
                    pointee: p2,
                },
            ) => (!m1 || *m2) && self.same(*p1, *p2),
            (
                TypeKind::Function {
                    ret: r1,
                    params: a1,
                },
                TypeKind::Function {
                    ret: r2,
                    params: a2,
                },
            ) => {
                let ret_ok = match (r1, r2) {
                    (None, None) => true,
                    (Some(x), Some(y)) => self.same(*x, *y),
                    _ => false,
                };
                ret_ok && a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| self.same(*x, *y))
            }
            (
                TypeKind::GenericVar {
                    decl: d1,
                    index: i1,
                    ..
                },
                TypeKind::GenericVar {
                    decl: d2,
                    index: i2,
                    ..
                },
            ) => d1 == d2 && i1 == i2,
            (
                TypeKind::GenericInstance { base: b1, args: a1 },
                TypeKind::GenericInstance { base: b2, args: a2 },
            ) => b1 == b2 && a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| self.same(*x, *y)),
            _ => false,
        }
    }

    /// Strict structural equality
    pub fn same(&self, a: TypeId, b: TypeId) -> bool {
        self.matches(a, b, false, true) && self.matches(b, a, false, true)
    }

    // ==================== Substitution ====================

    /// Rebuild `ty` with the generic variables of `instance`'s base replaced
    /// by its arguments. Returns a fresh reference.
    pub fn substitute(&mut self, ty: TypeId, instance: TypeId) -> TypeId {
        let (base, args) = match self.kind(instance) {
            TypeKind::GenericInstance { base, args } => (*base, args.clone()),
            _ => return self.acquire(ty),
        };
        let params = self.generic_params(base).to_vec();
        self.subst_with(ty, &params, &args)
    }

    fn subst_with(&mut self, ty: TypeId, params: &[TypeId], args: &[TypeId]) -> TypeId {
        if let Some(i) = params.iter().position(|&p| self.same(p, ty)) {
            if let Some(&arg) = args.get(i) {
                return self.acquire(arg);
            }
        }
        match self.kind(ty).clone() {
            TypeKind::Pointer { mutable, pointee } => {
                let p = self.subst_with(pointee, params, args);
                let res = self.pointer(mutable, p);
                self.release(p);
                res
            }
            TypeKind::Function { ret, params: ps } => {
                let r = ret.map(|r| self.subst_with(r, params, args));
                let ps: Vec<_> = ps.iter().map(|&p| self.subst_with(p, params, args)).collect();
                let res = self.function(r, ps.clone());
                r.into_iter().chain(ps).for_each(|t| self.release(t));
                res
            }
            TypeKind::GenericInstance { base, args: inner } => {
                let inner: Vec<_> = inner
                    .iter()
                    .map(|&a| self.subst_with(a, params, args))
                    .collect();
                let res = self.generic_instance(base, inner.clone());
                inner.into_iter().for_each(|t| self.release(t));
                res
            }
            _ => self.acquire(ty),
        }
    }

    /// Whether `ty` mentions a generic variable
    pub fn is_generic(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::GenericVar { .. } => true,
            TypeKind::Pointer { pointee, .. } => self.is_generic(*pointee),
            TypeKind::Function { ret, params } => {
                ret.iter().chain(params).any(|&t| self.is_generic(t))
            }
            TypeKind::GenericInstance { args, .. } => args.iter().any(|&t| self.is_generic(t)),
            _ => false,
        }
    }

    // ==================== Display ====================

    pub fn display(&self, ty: TypeId) -> String {
        match self.kind(ty) {
            TypeKind::Any => "any".to_string(),
            TypeKind::Builtin(b) => b.name().to_string(),
            TypeKind::Pointer { mutable, pointee } => {
                let inner = self.display(*pointee);
                let inner = if inner.contains(' ') {
                    format!("({})", inner)
                } else {
                    inner
                };
                if *mutable {
                    format!("*mut {}", inner)
                } else {
                    format!("*{}", inner)
                }
            }
            TypeKind::Function { ret, params } => {
                let params: Vec<_> = params.iter().map(|&p| self.display(p)).collect();
                match ret {
                    Some(r) => format!("({}) -> {}", params.join(", "), self.display(*r)),
                    None => format!("({})", params.join(", ")),
                }
            }
            TypeKind::Struct { name, .. } | TypeKind::GenericVar { name, .. } => name.clone(),
            TypeKind::GenericInstance { base, args } => {
                let args: Vec<_> = args.iter().map(|&a| self.display(a)).collect();
                format!("{}[{}]", self.display(*base), args.join(", "))
            }
        }
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_frees_constituents() {
        let mut types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let p = types.pointer(false, int);
        let pp = types.pointer(true, p);
        types.release(p);
        assert_eq!(types.refcount(p), 1);

        types.release(pp);
        assert_eq!(types.refcount(p), 0);
        let stats = types.stats();
        assert_eq!(stats.acquires, stats.releases);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_singletons_are_not_counted() {
        let mut types = TypeArena::new();
        let b = types.builtin(Builtin::Bool);
        types.acquire(b);
        types.release(b);
        types.release(TypeId::ANY);
        assert_eq!(types.stats(), TypeStats::default());
    }

    #[test]
    fn test_literal_relaxation_is_one_sided() {
        let types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let byte = types.builtin(Builtin::Byte);
        let bool_ = types.builtin(Builtin::Bool);

        assert!(types.matches(byte, int, true, false));
        assert!(!types.matches(byte, int, false, false));
        assert!(!types.matches(byte, int, true, true));
        assert!(!types.matches(bool_, int, true, false));
    }

    #[test]
    fn test_pointer_mutability_flows_one_way() {
        let mut types = TypeArena::new();
        let char_ = types.builtin(Builtin::Char);
        let imm = types.pointer(false, char_);
        let mutable = types.pointer(true, char_);

        assert!(types.matches(imm, mutable, false, false));
        assert!(!types.matches(mutable, imm, false, false));
        assert!(!types.same(imm, mutable));
    }

    #[test]
    fn test_substitute_replaces_generic_vars() {
        let mut types = TypeArena::new();
        let t = types.generic_var("T", NodeId::new(1), 0);
        let boxed = types.structure("Box", NodeId::new(0), vec![t]);
        let int = types.builtin(Builtin::Int);
        let inst = types.generic_instance(boxed, vec![int]);
        let ptr_t = types.pointer(true, t);

        let res = types.substitute(ptr_t, inst);
        assert_eq!(types.display(res), "*mut int");
        assert_eq!(types.display(inst), "Box[int]");

        for ty in [res, ptr_t, inst, boxed, t] {
            types.release(ty);
        }
        assert_eq!(types.stats().live, 0);
        assert_eq!(types.stats().acquires, types.stats().releases);
    }

    #[test]
    fn test_display_function_pointer() {
        let mut types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let byte = types.builtin(Builtin::Byte);
        let f = types.function(Some(int), vec![int, byte]);
        let p = types.pointer(false, f);
        assert_eq!(types.display(f), "(int, byte) -> int");
        assert_eq!(types.display(p), "*((int, byte) -> int)");
    }
}
