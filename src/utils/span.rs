//! Source location tracking

use std::fmt;

use serde::{Deserialize, Serialize};

/// A span covers a line/column range of one module's source text.
///
/// Lines and columns are 1-based. A zero line marks a synthetic location
/// (compiler-generated nodes, builtins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub first_line: u32,
    pub first_column: u32,
    pub last_line: u32,
    pub last_column: u32,
}

impl Span {
    /// Create a new span
    pub fn new(first_line: u32, first_column: u32, last_line: u32, last_column: u32) -> Self {
        Self {
            first_line,
            first_column,
            last_line,
            last_column,
        }
    }

    /// A span covering a single position
    pub fn at(line: u32, column: u32) -> Self {
        Self::new(line, column, line, column)
    }

    /// Create a dummy span (for testing and synthesized nodes)
    pub fn dummy() -> Self {
        Self::default()
    }

    /// Merge two spans
    pub fn merge(&self, other: &Span) -> Span {
        let (first_line, first_column) = (self.first_line, self.first_column)
            .min((other.first_line, other.first_column));
        let (last_line, last_column) =
            (self.last_line, self.last_column).max((other.last_line, other.last_column));
        Span::new(first_line, first_column, last_line, last_column)
    }

    pub fn is_synthetic(&self) -> bool {
        self.first_line == 0
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.first_line, self.first_column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_orders_positions() {
        let a = Span::new(3, 4, 3, 9);
        let b = Span::new(1, 7, 2, 1);
        let m = a.merge(&b);
        assert_eq!(m, Span::new(1, 7, 3, 9));
    }

    #[test]
    fn test_dummy_is_synthetic() {
        assert!(Span::dummy().is_synthetic());
        assert!(!Span::at(1, 1).is_synthetic());
    }
}
