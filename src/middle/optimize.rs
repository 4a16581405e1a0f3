//! IR Optimizer for Ember
//!
//! Dead-variable elimination and copy folding, repeated until neither pass
//! changes anything. Both passes only ever remove storage or instructions,
//! so the loop always terminates and a second run is a no-op.

use crate::middle::ir::{DeclId, InstrKind, IrProgram, VarFlags, VarId};
use crate::types::TypeArena;

/// Optimization pass trait
pub trait OptimizationPass {
    /// Name of the optimization pass
    fn name(&self) -> &'static str;

    /// Run the pass on every declaration of a module
    fn run_on_module(&mut self, program: &mut IrProgram, module: usize, types: &mut TypeArena) -> bool {
        let decls = program.modules[module].decls.clone();
        let mut changed = false;
        for d in decls {
            changed |= self.run_on_decl(program, d, types);
        }
        changed
    }

    /// Run the pass on one declaration
    fn run_on_decl(&mut self, program: &mut IrProgram, decl: DeclId, types: &mut TypeArena) -> bool;
}

/// The optimizer - runs optimization passes to a fixed point
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        let mut opt = Self { passes: Vec::new() };
        opt.add_pass(Box::new(DeadVariableElimination::new()));
        opt.add_pass(Box::new(CopyFolding::new()));
        opt
    }

    /// Add an optimization pass
    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    /// Run all passes until nothing changes; returns the number of rounds
    pub fn optimize(&mut self, program: &mut IrProgram, types: &mut TypeArena) -> usize {
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for pass in &mut self.passes {
                for m in 0..program.modules.len() {
                    if pass.run_on_module(program, m, types) {
                        log::trace!("{} changed module '{}'", pass.name(), program.modules[m].name);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        log::debug!("optimizer reached a fixed point after {} round(s)", rounds);
        rounds
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn an instruction into `Nop`, giving back its operand uses
fn nullify(program: &mut IrProgram, decl: DeclId, index: usize) {
    let instr = &mut program.decl_mut(decl).instrs[index];
    let operands = std::mem::take(&mut instr.operands);
    let dst = instr.dst.take();
    instr.kind = InstrKind::Nop;
    for op in operands {
        let var = program.var_mut(op);
        var.uses = var.uses.saturating_sub(1);
    }
    if let Some(d) = dst {
        let var = program.var_mut(d);
        if var.def == Some(index) {
            var.def = None;
        }
    }
}

// ==================== Dead Variable Elimination ====================

/// Drops the storage of variables nobody reads
pub struct DeadVariableElimination;

impl DeadVariableElimination {
    pub fn new() -> Self {
        Self
    }

    fn drop_var(program: &mut IrProgram, decl: DeclId, v: VarId, types: &mut TypeArena) -> bool {
        let var = program.var(v);
        if var.uses > 0 || var.flags.contains(VarFlags::ARG) {
            return false;
        }
        let Some(ty) = var.ty else {
            return false;
        };
        let refs = var.shape.refs();
        let def = var.def;

        types.release(ty);
        program.var_mut(v).ty = None;
        for r in refs {
            let base = program.var_mut(r);
            base.uses = base.uses.saturating_sub(1);
        }
        if let Some(i) = def {
            let instr = &program.decl(decl).instrs[i];
            if instr.pure && instr.dst == Some(v) {
                nullify(program, decl, i);
            }
        }
        true
    }
}

impl Default for DeadVariableElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for DeadVariableElimination {
    fn name(&self) -> &'static str {
        "dead-variable-elimination"
    }

    fn run_on_decl(&mut self, program: &mut IrProgram, decl: DeclId, types: &mut TypeArena) -> bool {
        let (vars, composites) = {
            let d = program.decl(decl);
            (d.vars.clone(), d.composites.clone())
        };
        let mut changed = false;
        for v in vars.into_iter().chain(composites) {
            changed |= Self::drop_var(program, decl, v, types);
        }
        changed
    }
}

// ==================== Copy Folding ====================

/// Folds `New local <- tmp` into the instruction that computed `tmp`
pub struct CopyFolding;

impl CopyFolding {
    pub fn new() -> Self {
        Self
    }

    /// Index of the instruction defining `tmp`, if `tmp` can be folded away
    fn foldable(program: &IrProgram, tmp: VarId, local: VarId) -> Option<usize> {
        let t = program.var(tmp);
        let l = program.var(local);
        if t.name.is_some() || t.uses != 1 || t.is_composite() || t.owner != l.owner {
            return None;
        }
        if l.flags.intersects(VarFlags::ASSIGNED | VarFlags::ARG) || l.is_composite() {
            return None;
        }
        let def = t.def?;
        (program.decl(t.owner).instrs[def].dst == Some(tmp)).then_some(def)
    }
}

impl Default for CopyFolding {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for CopyFolding {
    fn name(&self) -> &'static str {
        "copy-folding"
    }

    fn run_on_decl(&mut self, program: &mut IrProgram, decl: DeclId, types: &mut TypeArena) -> bool {
        let mut changed = false;
        for i in 0..program.decl(decl).instrs.len() {
            let instr = &program.decl(decl).instrs[i];
            let (Some(local), [tmp]) = (instr.dst, instr.operands.as_slice()) else {
                continue;
            };
            if instr.kind != InstrKind::New {
                continue;
            }
            let tmp = *tmp;
            let Some(def) = Self::foldable(program, tmp, local) else {
                continue;
            };

            // the source now writes straight into the local
            program.decl_mut(decl).instrs[def].dst = Some(local);
            program.var_mut(tmp).def = None;
            nullify(program, decl, i);
            program.var_mut(local).def = Some(def);
            if let Some(t) = program.var_mut(tmp).ty.take() {
                types.release(t);
            }
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::{DeclKind, Instr, Module, VarShape};
    use crate::types::Builtin;

    struct Builder {
        program: IrProgram,
        types: TypeArena,
        decl: DeclId,
    }

    impl Builder {
        fn new() -> Self {
            let mut program = IrProgram::new();
            program.modules.push(Module::new("main", Vec::new()));
            let decl = program.alloc_decl(0, "f", DeclKind::Function, None);
            Self {
                program,
                types: TypeArena::new(),
                decl,
            }
        }

        fn var(&mut self, name: Option<&str>) -> VarId {
            let int = self.types.builtin(Builtin::Int);
            let v = self
                .program
                .alloc_var(self.decl, name.map(str::to_string), Some(int), VarShape::Plain);
            self.program.decl_mut(self.decl).vars.push(v);
            v
        }

        fn emit(&mut self, kind: InstrKind, dst: Option<VarId>, operands: Vec<VarId>, pure: bool) -> usize {
            let index = self.program.decl(self.decl).instrs.len();
            for &op in &operands {
                self.program.var_mut(op).uses += 1;
            }
            if let Some(d) = dst {
                self.program.var_mut(d).def = Some(index);
            }
            self.program
                .decl_mut(self.decl)
                .instrs
                .push(Instr::new(kind, dst, operands, pure));
            index
        }

        fn live(&self) -> Vec<InstrKind> {
            self.program
                .decl(self.decl)
                .live_instrs()
                .map(|i| i.kind.clone())
                .collect()
        }
    }

    #[test]
    fn test_dead_chain_removed_to_fixed_point() {
        let mut b = Builder::new();
        let t0 = b.var(None);
        let t1 = b.var(None);
        let x = b.var(Some("x"));
        b.emit(InstrKind::Int(1), Some(t0), vec![], true);
        b.emit(InstrKind::Op(crate::frontend::ast::BinOp::Add), Some(t1), vec![t0, t0], true);
        b.emit(InstrKind::New, Some(x), vec![t1], true);
        b.emit(InstrKind::Return, None, vec![], false);

        let rounds = Optimizer::new().optimize(&mut b.program, &mut b.types);
        assert!(rounds > 1);
        assert_eq!(b.live(), vec![InstrKind::Return]);
        for v in [t0, t1, x] {
            assert_eq!(b.program.var(v).ty, None);
            assert_eq!(b.program.var(v).uses, 0);
        }
    }

    #[test]
    fn test_impure_definition_survives() {
        let mut b = Builder::new();
        let callee = b.program.decl(b.decl).value;
        let t = b.var(None);
        b.emit(InstrKind::Call, Some(t), vec![callee], false);

        Optimizer::new().optimize(&mut b.program, &mut b.types);
        assert_eq!(b.live(), vec![InstrKind::Call]);
        assert_eq!(b.program.var(t).ty, None);
    }

    #[test]
    fn test_copy_folds_into_source() {
        let mut b = Builder::new();
        let callee = b.program.decl(b.decl).value;
        let t = b.var(None);
        let x = b.var(Some("x"));
        let call = b.emit(InstrKind::Call, Some(t), vec![callee], false);
        b.emit(InstrKind::New, Some(x), vec![t], false);
        b.emit(InstrKind::Return, None, vec![x], false);

        let mut pass = CopyFolding::new();
        assert!(pass.run_on_decl(&mut b.program, b.decl, &mut b.types));
        assert_eq!(b.live(), vec![InstrKind::Call, InstrKind::Return]);
        assert_eq!(b.program.decl(b.decl).instrs[call].dst, Some(x));
        assert_eq!(b.program.var(x).def, Some(call));
        assert_eq!(b.program.var(t).uses, 0);
        assert!(!pass.run_on_decl(&mut b.program, b.decl, &mut b.types));
    }

    #[test]
    fn test_assigned_local_is_not_folded() {
        let mut b = Builder::new();
        let t = b.var(None);
        let x = b.var(Some("x"));
        b.emit(InstrKind::Int(3), Some(t), vec![], true);
        b.emit(InstrKind::New, Some(x), vec![t], true);
        b.emit(InstrKind::Return, None, vec![x], false);
        b.program.var_mut(x).flags |= VarFlags::ASSIGNED;

        assert!(!CopyFolding::new().run_on_decl(&mut b.program, b.decl, &mut b.types));
        assert_eq!(b.live().len(), 3);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut b = Builder::new();
        let t = b.var(None);
        let x = b.var(Some("x"));
        let y = b.var(Some("y"));
        b.emit(InstrKind::Int(3), Some(t), vec![], true);
        b.emit(InstrKind::New, Some(x), vec![t], true);
        b.emit(InstrKind::New, Some(y), vec![x], true);
        b.emit(InstrKind::Return, None, vec![y], false);

        let mut opt = Optimizer::new();
        opt.optimize(&mut b.program, &mut b.types);
        let once = b.program.decl(b.decl).instrs.clone();
        let rounds = opt.optimize(&mut b.program, &mut b.types);
        assert_eq!(rounds, 1);
        assert_eq!(b.program.decl(b.decl).instrs, once);
    }
}
