//! IR Printer - Pretty print Ember IR
//!
//! Outputs human-readable IR for `--emit-ir` and for debugging.

use std::fmt::{self, Write};

use crate::middle::ir::{Decl, DeclKind, Instr, InstrKind, IrProgram, Module, VarId, VarShape};
use crate::types::TypeArena;

/// Pretty printer for Ember IR
pub struct IrPrinter<'a> {
    program: &'a IrProgram,
    types: &'a TypeArena,
    output: String,
}

impl<'a> IrPrinter<'a> {
    pub fn new(program: &'a IrProgram, types: &'a TypeArena) -> Self {
        Self {
            program,
            types,
            output: String::new(),
        }
    }

    /// Print every module to a string
    pub fn print(mut self) -> String {
        let program = self.program;
        for m in &program.modules {
            if self.print_module(m).is_err() {
                break;
            }
        }
        self.output
    }

    fn print_module(&mut self, module: &Module) -> fmt::Result {
        writeln!(self.output, "; module {}", module.name)?;
        if !module.imports.is_empty() {
            writeln!(self.output, "; imports {}", module.imports.join(", "))?;
        }
        for s in &module.structs {
            let fields: Vec<_> = s
                .fields
                .iter()
                .map(|&f| self.program.decl(f).name.as_str())
                .collect();
            writeln!(self.output, "struct {} {{ {} }}", s.name, fields.join(", "))?;
        }
        let program = self.program;
        for &d in &module.decls {
            let decl = program.decl(d);
            if decl.member && decl.kind == DeclKind::Global {
                continue;
            }
            self.print_decl(decl, module.main == Some(d))?;
        }
        writeln!(self.output)
    }

    fn print_decl(&mut self, decl: &Decl, main: bool) -> fmt::Result {
        let name = if decl.name.is_empty() {
            "<init>"
        } else {
            decl.name.as_str()
        };
        let mut attrs = Vec::new();
        if decl.export {
            attrs.push("export".to_string());
        }
        if let Some(sym) = &decl.export_as {
            attrs.push(format!("export_as({})", sym));
        }
        if let Some(sym) = &decl.import {
            attrs.push(format!("import({})", sym));
        }
        if main {
            attrs.push("main".to_string());
        }
        let prefix = if attrs.is_empty() {
            String::new()
        } else {
            format!("{} ", attrs.join(" "))
        };

        if decl.kind == DeclKind::Global {
            let ty = self.ty(decl.value);
            return writeln!(self.output, "{}global {}: {}", prefix, name, ty);
        }

        let args: Vec<_> = decl
            .args
            .iter()
            .map(|&a| format!("{}: {}", a, self.ty(a)))
            .collect();
        write!(self.output, "{}fn {}({})", prefix, name, args.join(", "))?;
        if let Some(r) = decl.ret {
            write!(self.output, " -> {}", self.types.display(r))?;
            if decl.by_pointer {
                write!(self.output, " [by pointer]")?;
            }
        }
        if decl.instrs.is_empty() {
            return writeln!(self.output);
        }
        writeln!(self.output, " {{")?;
        for &v in decl.vars.iter().chain(decl.ret_var.iter()) {
            let var = self.program.var(v);
            if var.ty.is_some() && !decl.args.contains(&v) {
                writeln!(self.output, "    local {}: {}", self.var(v), self.ty(v))?;
            }
        }
        for instr in decl.live_instrs() {
            self.print_instr(instr)?;
        }
        writeln!(self.output, "}}")
    }

    fn print_instr(&mut self, instr: &Instr) -> fmt::Result {
        if let InstrKind::Label(l) = &instr.kind {
            return writeln!(self.output, "  {}:", l);
        }
        write!(self.output, "    ")?;
        if let Some(d) = instr.dst {
            write!(self.output, "{} = ", self.var(d))?;
        }
        let operands: Vec<_> = instr.operands.iter().map(|&o| self.var(o)).collect();
        let operands = operands.join(", ");
        match &instr.kind {
            InstrKind::Jump(l) => write!(self.output, "jump {}", l)?,
            InstrKind::JumpUnless(l) => write!(self.output, "jump {} unless {}", l, operands)?,
            InstrKind::Op(op) => write!(self.output, "op {} {}", op.symbol(), operands)?,
            InstrKind::Int(v) => write!(self.output, "int {}", v)?,
            InstrKind::Str(s) => write!(self.output, "str {:?}", s)?,
            kind => {
                let mnemonic = match kind {
                    InstrKind::New => "new",
                    InstrKind::Set => "set",
                    InstrKind::Return => "return",
                    InstrKind::Addr => "addr",
                    InstrKind::Construct => "construct",
                    InstrKind::Call => "call",
                    InstrKind::Destroy => "destroy",
                    InstrKind::Cast => "cast",
                    _ => "nop",
                };
                write!(self.output, "{}", mnemonic)?;
                if !operands.is_empty() {
                    write!(self.output, " {}", operands)?;
                }
            }
        }
        if instr.pure {
            write!(self.output, " ; pure")?;
        }
        writeln!(self.output)
    }

    /// Variable as written in operands: composites spell out their chain
    fn var(&self, v: VarId) -> String {
        let var = self.program.var(v);
        let plain = |id: VarId| {
            let var = self.program.var(id);
            match &var.name {
                Some(name) if var.owner != self.program.var(v).owner || name.is_empty() => {
                    format!("@{}", name)
                }
                Some(name) => format!("{}.{}", id, name),
                None => id.to_string(),
            }
        };
        match &var.shape {
            VarShape::Plain => plain(v),
            VarShape::Deref { base } => format!("*{}", self.var(*base)),
            VarShape::Attrs { base, chain } => {
                let mut s = self.var(*base);
                for &link in chain {
                    let field = self.program.var(link).name.clone().unwrap_or_default();
                    let field = field.rsplit('.').next().unwrap_or_default().to_string();
                    write!(s, ".{}", field).ok();
                }
                s
            }
            VarShape::Indexes { base, chain } => {
                let mut s = self.var(*base);
                for &i in chain {
                    write!(s, "[{}]", self.var(i)).ok();
                }
                s
            }
        }
    }

    fn ty(&self, v: VarId) -> String {
        match self.program.var(v).ty {
            Some(t) => self.types.display(t),
            None => "-".to_string(),
        }
    }
}

/// Render a program as text
pub fn print_program(program: &IrProgram, types: &TypeArena) -> String {
    IrPrinter::new(program, types).print()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Builtin;

    #[test]
    fn test_print_function() {
        let types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let mut program = IrProgram::new();
        program.modules.push(Module::new("main", vec!["io".to_string()]));
        let f = program.alloc_decl(0, "f", DeclKind::Function, None);
        let x = program.alloc_var(f, Some("x".to_string()), Some(int), VarShape::Plain);
        let t = program.alloc_var(f, None, Some(int), VarShape::Plain);
        let label = program.decl_mut(f).new_label();
        let decl = program.decl_mut(f);
        decl.vars.extend([x, t]);
        decl.instrs = vec![
            Instr::new(InstrKind::Int(7), Some(t), vec![], true),
            Instr::new(InstrKind::New, Some(x), vec![t], true),
            Instr::new(InstrKind::Label(label), None, vec![], false),
            Instr::new(InstrKind::Return, None, vec![], false),
        ];
        program.modules[0].main = Some(f);

        let text = print_program(&program, &types);
        let expected = "\
; module main
; imports io
main fn f() {
    local %1.x: int
    local %2: int
    %2 = int 7 ; pure
    %1.x = new %2 ; pure
  L0:
    return
}

";
        pretty_assertions::assert_eq!(text, expected);
    }
}
