//! Symbol table
//!
//! Scopes form a tree rooted at the builtin scope (level 0). A scope's level
//! is its nesting depth; a negative level marks a member-only scope, whose
//! entries are reachable through attribute access but not by a bare name.

use std::collections::HashMap;
use std::fmt;

use crate::frontend::ast::{Ast, NodeId};
use crate::types::{Builtin, TypeArena, TypeId};
use crate::utils::{Diagnostics, Error};

// ==================== Ids ====================

/// Unique identifier for a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);

/// Unique identifier for an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// What a name is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Node(NodeId),
    /// Candidate declarations of an overloadable name
    Overloads(Vec<NodeId>),
    Builtin(TypeId),
}

impl Binding {
    /// Declaring node, when the binding has exactly one
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Binding::Node(n) => Some(*n),
            Binding::Overloads(c) if c.len() == 1 => Some(c[0]),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[NodeId] {
        match self {
            Binding::Node(n) => std::slice::from_ref(n),
            Binding::Overloads(c) => c,
            Binding::Builtin(_) => &[],
        }
    }
}

/// Symbol-table entry
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub binding: Binding,
    pub level: i32,
    pub scope: ScopeId,
}

/// A scope containing entries
#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    /// Scope excluded from lookup while resolving a `let` initializer
    pub isolation: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    /// Module scopes searched after this scope's own entries
    pub imports: Vec<ScopeId>,
    entries: HashMap<String, EntryId>,
    pub level: i32,
}

/// Symbol table with nested scopes
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    entries: Vec<Entry>,
}

impl SymbolTable {
    /// Create the table with the builtin scope as root
    pub fn new(types: &TypeArena) -> Self {
        let mut table = Self {
            scopes: vec![Scope {
                parent: None,
                isolation: None,
                children: Vec::new(),
                imports: Vec::new(),
                entries: HashMap::new(),
                level: 0,
            }],
            entries: Vec::new(),
        };
        let root = table.root();
        for b in Builtin::ALL {
            table.insert(root, b.name(), Binding::Builtin(types.builtin(b)));
        }
        table
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Create a child scope one level deeper than `parent`
    pub fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        let level = self.scope(parent).level.abs() + 1;
        self.scopes.push(Scope {
            parent: Some(parent),
            isolation: None,
            children: Vec::new(),
            imports: Vec::new(),
            entries: HashMap::new(),
            level,
        });
        self.scope_mut(parent).children.push(id);
        id
    }

    /// Mark a scope member-only
    pub fn negate(&mut self, scope: ScopeId) {
        let s = self.scope_mut(scope);
        s.level = -s.level.abs();
    }

    pub fn set_isolation(&mut self, scope: ScopeId, isolation: ScopeId) {
        self.scope_mut(scope).isolation = Some(isolation);
    }

    pub fn add_import(&mut self, scope: ScopeId, module_scope: ScopeId) {
        let s = self.scope_mut(scope);
        if !s.imports.contains(&module_scope) {
            s.imports.push(module_scope);
        }
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        match self.scopes.get(id.0 as usize) {
            Some(s) => s,
            None => crate::ice!("dangling scope id {}", id.0),
        }
    }

    fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        match self.scopes.get_mut(id.0 as usize) {
            Some(s) => s,
            None => crate::ice!("dangling scope id {}", id.0),
        }
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        match self.entries.get(id.0 as usize) {
            Some(e) => e,
            None => crate::ice!("dangling entry id {}", id),
        }
    }

    pub fn level(&self, scope: ScopeId) -> i32 {
        self.scope(scope).level
    }

    fn insert(&mut self, scope: ScopeId, name: &str, binding: Binding) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(Entry {
            name: name.to_string(),
            binding,
            level: self.scope(scope).level,
            scope,
        });
        self.scope_mut(scope).entries.insert(name.to_string(), id);
        id
    }

    /// Bind `name` in `scope`.
    ///
    /// An existing entry at the same |level| is a duplicate, unless both are
    /// overload groups of the same scope, in which case the candidates
    /// accumulate. Shadowing an ancestor entry of the same module warns;
    /// shadowing a builtin is an error.
    pub fn add(
        &mut self,
        scope: ScopeId,
        name: &str,
        binding: Binding,
        ast: &Ast,
        diags: &mut Diagnostics,
    ) -> EntryId {
        let level = self.level(scope);
        let decl = binding.candidates().first().copied();
        let span = decl.map(|d| ast.span(d)).unwrap_or_default();

        if let Some(prev) = self.find_any(scope, name) {
            let p = self.entry(prev);
            let prev_level = p.level;
            if prev_level.abs() == level.abs() {
                let groups = p.scope == scope
                    && matches!(p.binding, Binding::Overloads(_))
                    && matches!(binding, Binding::Overloads(_));
                if groups {
                    if let (Binding::Overloads(c), Binding::Overloads(new)) =
                        (&mut self.entries[prev.0 as usize].binding, binding)
                    {
                        c.extend(new);
                    }
                    return prev;
                }
                diags.error(
                    span,
                    Error::DuplicateDefinition {
                        name: name.to_string(),
                    },
                );
                self.note_declared(prev, ast, diags);
                return prev;
            }
            // members are only reachable through a receiver and shadow nothing
            if prev_level == 0 && level > 0 {
                diags.error(
                    span,
                    Error::ShadowsBuiltin {
                        name: name.to_string(),
                    },
                );
            } else if prev_level > 0 && level > 0 && self.visible_from(prev, decl, ast) {
                diags.warning(span, format!("declaration of '{}' shadows outer definition", name));
                self.note_declared(prev, ast, diags);
            }
        }
        log::trace!("bind '{}' at level {}", name, level);
        self.insert(scope, name, binding)
    }

    fn visible_from(&self, prev: EntryId, decl: Option<NodeId>, ast: &Ast) -> bool {
        let (Some(p), Some(d)) = (self.entry(prev).binding.candidates().first(), decl) else {
            return false;
        };
        let prev_node = ast.node(*p);
        prev_node.module == ast.node(d).module || prev_node.is_exported()
    }

    fn note_declared(&self, entry: EntryId, ast: &Ast, diags: &mut Diagnostics) {
        if let Some(&n) = self.entry(entry).binding.candidates().first() {
            diags.note(ast.span(n), format!("'{}' declared here", self.entry(entry).name));
        }
    }

    fn lookup_in(&self, scope: ScopeId, name: &str) -> Option<EntryId> {
        let s = self.scope(scope);
        s.entries.get(name).copied().or_else(|| {
            s.imports
                .iter()
                .find_map(|&m| self.scope(m).entries.get(name).copied())
        })
    }

    /// Nearest entry through the parent chain, regardless of level
    fn find_any(&self, scope: ScopeId, name: &str) -> Option<EntryId> {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            if let Some(e) = self.lookup_in(id, name) {
                return Some(e);
            }
            cur = self.scope(id).parent;
        }
        None
    }

    /// Look up `name` from `scope` upward.
    ///
    /// Member-only entries are skipped; the first one met is returned only
    /// when nothing reachable is found.
    pub fn find(&self, scope: ScopeId, name: &str) -> Option<EntryId> {
        let mut negative = None;
        let mut cur = Some(scope);
        while let Some(id) = cur {
            if let Some(e) = self.lookup_in(id, name) {
                if self.entry(e).level >= 0 {
                    return Some(e);
                }
                negative.get_or_insert(e);
            }
            cur = self.scope(id).parent;
        }
        negative
    }

    /// Look up `name` in `scope` only
    pub fn find_local(&self, scope: ScopeId, name: &str) -> Option<EntryId> {
        self.scope(scope).entries.get(name).copied()
    }

    /// Nearest isolation link on the way up from `scope`
    pub fn isolation_of(&self, scope: ScopeId) -> Option<ScopeId> {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let s = self.scope(id);
            if s.isolation.is_some() {
                return s.isolation;
            }
            cur = s.parent;
        }
        None
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}
