//! Compilation driver
//!
//! A `Session` owns everything one compilation needs (AST, symbol table,
//! type arena, diagnostics, options) and runs the passes in order. A pass
//! only runs when the ones before it reported no errors.

use crate::frontend::ast::{Ast, TypeState};
use crate::frontend::resolve::resolve;
use crate::frontend::symtab::SymbolTable;
use crate::frontend::syntax::Unit;
use crate::frontend::typeck;
use crate::middle::ir::IrProgram;
use crate::middle::ir_gen;
use crate::middle::optimize::Optimizer;
use crate::types::TypeArena;
use crate::utils::Diagnostics;

pub use crate::utils::Options;

/// Pass reached by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Parsed,
    Resolved,
    Checked,
    Lowered,
}

/// One compilation
pub struct Session {
    pub options: Options,
    pub ast: Ast,
    pub symtab: SymbolTable,
    pub types: TypeArena,
    pub diags: Diagnostics,
    stage: Stage,
}

impl Session {
    pub fn new(options: Options) -> Self {
        let types = TypeArena::new();
        let symtab = SymbolTable::new(&types);
        Self {
            options,
            ast: Ast::new(),
            symtab,
            types,
            diags: Diagnostics::new(),
            stage: Stage::Parsed,
        }
    }

    /// Session over a parsed unit; options carried by the unit win
    pub fn from_unit(unit: &Unit, options: Options) -> Self {
        let options = unit.options.clone().unwrap_or(options);
        let mut session = Self::new(options);
        unit.lower(&mut session.ast);
        log::debug!(
            "loaded {} module(s), {} node(s)",
            session.ast.modules().len(),
            session.ast.len()
        );
        session
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Resolve names and check types. Returns whether no errors were found.
    pub fn analyze(&mut self) -> bool {
        if self.stage < Stage::Resolved {
            resolve(&mut self.ast, &mut self.symtab, &mut self.diags);
            self.stage = Stage::Resolved;
        }
        if self.diags.has_errors() {
            log::debug!("resolution failed, skipping type checking");
            return false;
        }
        if self.stage < Stage::Checked {
            typeck::check(
                &mut self.ast,
                &self.symtab,
                &mut self.types,
                &mut self.diags,
                &self.options,
            );
            self.stage = Stage::Checked;
        }
        !self.diags.has_errors()
    }

    /// Lower to IR, optimizing when enabled. `None` when analysis failed.
    pub fn lower(&mut self) -> Option<IrProgram> {
        if !self.analyze() {
            return None;
        }
        let mut program = ir_gen::generate(&self.ast, &self.symtab, &mut self.types, &self.options);
        if self.options.optimize {
            Optimizer::new().optimize(&mut program, &mut self.types);
        }
        self.stage = Stage::Lowered;
        Some(program)
    }

    /// Give back every type reference held by the AST and `program`
    pub fn teardown(&mut self, program: Option<IrProgram>) {
        if let Some(mut p) = program {
            p.release_types(&mut self.types);
        }
        let ids: Vec<_> = self.ast.ids().collect();
        for id in ids {
            if let TypeState::Typed(t) = self.ast.node(id).ty {
                self.types.release(t);
            }
            self.ast.node_mut(id).ty = TypeState::Untyped;
        }
        let stats = self.types.stats();
        log::debug!(
            "teardown: {} acquire(s), {} release(s), {} type(s) still alive",
            stats.acquires,
            stats.releases,
            stats.live
        );
    }
}
