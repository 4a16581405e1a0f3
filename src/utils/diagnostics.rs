//! Diagnostics sink
//!
//! Every pass reports through a `Diagnostics` value threaded by the driver.
//! Errors and warnings are counted; notes elaborate the diagnostic right
//! before them and are never counted on their own.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Error, Span};

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// One reported diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub span: Span,
    /// Name of the module the location belongs to
    pub module: String,
    pub message: String,
    /// Set for errors coming from the taxonomy
    pub error: Option<Error>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.module, self.span, self.severity, self.message
        )
    }
}

/// Collects diagnostics for one compilation session
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
    module: String,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module name attached to subsequent diagnostics
    pub fn set_module(&mut self, name: &str) {
        if self.module != name {
            self.module = name.to_string();
        }
    }

    pub fn error(&mut self, span: Span, error: Error) {
        log::trace!("error at {}: {}", span, error);
        self.errors += 1;
        self.items.push(Diagnostic {
            severity: Severity::Error,
            span,
            module: self.module.clone(),
            message: error.to_string(),
            error: Some(error),
        });
    }

    pub fn warning(&mut self, span: Span, message: impl Into<String>) {
        self.warnings += 1;
        self.push(Severity::Warning, span, message.into());
    }

    pub fn note(&mut self, span: Span, message: impl Into<String>) {
        self.push(Severity::Note, span, message.into());
    }

    fn push(&mut self, severity: Severity, span: Span, message: String) {
        self.items.push(Diagnostic {
            severity,
            span,
            module: self.module.clone(),
            message,
            error: None,
        });
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn items(&self) -> &[Diagnostic] {
        &self.items
    }

    /// Errors only, in report order
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.items.iter().filter_map(|d| d.error.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notes_are_not_counted() {
        let mut diags = Diagnostics::new();
        diags.set_module("main");
        diags.error(
            Span::at(2, 5),
            Error::UndeclaredIdentifier {
                name: "x".to_string(),
            },
        );
        diags.note(Span::at(1, 1), "declared here");
        diags.warning(Span::at(3, 1), "unused variable 'y'");

        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.warning_count(), 1);
        assert_eq!(diags.items().len(), 3);
        assert_eq!(diags.items()[1].severity, Severity::Note);
        assert_eq!(
            diags.items()[0].to_string(),
            "main:2:5: error: undeclared identifier 'x'"
        );
    }
}
