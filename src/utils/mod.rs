//! Utility module

mod diagnostics;
mod error;
mod options;
mod span;

pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{Error, Result};
pub use options::Options;
pub use span::Span;
