//! Structured Feedback Module
//!
//! Machine-readable output of a compilation: every diagnostic with its
//! code, location and attached notes, plus IR statistics when lowering ran.

use serde::{Deserialize, Serialize};

use crate::middle::ir::{DeclKind, IrProgram};
use crate::utils::{Diagnostic, Diagnostics, Error, Severity};

// ==================== Structured Report ====================

/// One error or warning, with the notes reported right after it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Error code (e.g. "E0020"); absent for warnings
    pub code: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub location: Location,
    pub notes: Vec<Note>,
    /// Suggested fix, when one is obvious
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub module: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub message: String,
    pub location: Location,
}

impl Location {
    fn of(d: &Diagnostic) -> Self {
        Self {
            module: d.module.clone(),
            line: d.span.first_line,
            column: d.span.first_column,
            end_line: d.span.last_line,
            end_column: d.span.last_column,
        }
    }
}

impl DiagnosticReport {
    fn from_diagnostic(d: &Diagnostic) -> Self {
        Self {
            code: d.error.as_ref().map(|e| e.code().to_string()),
            severity: d.severity,
            message: d.message.clone(),
            location: Location::of(d),
            notes: Vec::new(),
            suggestion: d.error.as_ref().and_then(suggest),
        }
    }
}

/// Fix suggestion for the errors that have a mechanical one
fn suggest(error: &Error) -> Option<String> {
    match error {
        Error::ImmutableReceiver { .. } => {
            Some("declare the receiver with 'mut' or 'var'".to_string())
        }
        Error::AssignConstant => Some("declare the target without 'const'".to_string()),
        Error::MissingConstructor => Some("add a 'new' method to the struct".to_string()),
        Error::Unexported { name } => Some(format!("mark '{}' with 'export'", name)),
        Error::ArgCountMismatch { expected, got, .. } if got < expected => {
            Some(format!("add {} more argument(s)", expected - got))
        }
        Error::ArgCountMismatch { expected, got, .. } => {
            Some(format!("remove {} extra argument(s)", got - expected))
        }
        Error::TypeMismatch { expected, got, .. } => {
            Some(format!("cast the value: '({} as {})'", got, expected))
        }
        _ => None,
    }
}

// ==================== Compilation Feedback ====================

/// Complete compilation feedback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationFeedback {
    pub success: bool,
    pub source_file: String,
    pub diagnostics: Vec<DiagnosticReport>,
    pub stats: CompilationStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationStats {
    pub errors: usize,
    pub warnings: usize,
    pub modules: usize,
    pub functions: usize,
    pub globals: usize,
    pub variables: usize,
    /// Instructions left after optimization
    pub instructions: usize,
}

impl CompilationStats {
    fn of_program(program: &IrProgram) -> Self {
        let functions = program
            .decls
            .iter()
            .filter(|d| d.kind == DeclKind::Function)
            .count();
        Self {
            modules: program.modules.len(),
            functions,
            globals: program.decls.len() - functions,
            variables: program.vars.iter().filter(|v| v.ty.is_some()).count(),
            instructions: program.decls.iter().map(|d| d.live_instrs().count()).sum(),
            ..Self::default()
        }
    }
}

impl CompilationFeedback {
    /// Collect the diagnostics of a session and, if lowering ran, its IR stats
    pub fn collect(source_file: &str, diags: &Diagnostics, program: Option<&IrProgram>) -> Self {
        let mut reports: Vec<DiagnosticReport> = Vec::new();
        for d in diags.items() {
            match (d.severity, reports.last_mut()) {
                (Severity::Note, Some(last)) => last.notes.push(Note {
                    message: d.message.clone(),
                    location: Location::of(d),
                }),
                // a note with nothing before it stands alone
                _ => reports.push(DiagnosticReport::from_diagnostic(d)),
            }
        }

        let mut stats = program.map(CompilationStats::of_program).unwrap_or_default();
        stats.errors = diags.error_count();
        stats.warnings = diags.warning_count();
        Self {
            success: !diags.has_errors() && program.is_some(),
            source_file: source_file.to_string(),
            diagnostics: reports,
            stats,
        }
    }

    /// Output as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Output as compact JSON (for programmatic use)
    pub fn to_json_compact(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Span;

    #[test]
    fn test_notes_fold_into_previous_report() {
        let mut diags = Diagnostics::new();
        diags.set_module("main");
        diags.error(
            Span::at(4, 2),
            Error::ImmutableReceiver {
                method: "push".to_string(),
            },
        );
        diags.note(Span::at(2, 5), "add 'mut' to make it mutable");
        diags.warning(Span::at(7, 1), "unused variable 'y'");

        let feedback = CompilationFeedback::collect("main.json", &diags, None);
        assert!(!feedback.success);
        assert_eq!(feedback.diagnostics.len(), 2);
        let first = &feedback.diagnostics[0];
        assert_eq!(first.code.as_deref(), Some("E0031"));
        assert_eq!(first.notes.len(), 1);
        assert_eq!(first.notes[0].location.line, 2);
        assert!(first.suggestion.is_some());
        assert_eq!(feedback.diagnostics[1].severity, Severity::Warning);
        assert_eq!(feedback.stats.errors, 1);
        assert_eq!(feedback.stats.warnings, 1);
    }

    #[test]
    fn test_json_shape() {
        let diags = Diagnostics::new();
        let program = IrProgram::new();
        let feedback = CompilationFeedback::collect("a.json", &diags, Some(&program));
        let value: serde_json::Value = serde_json::from_str(&feedback.to_json_compact()).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["stats"]["functions"], 0);
        assert!(value["diagnostics"].as_array().unwrap().is_empty());
    }
}
