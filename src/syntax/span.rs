//! Source positions attached to syntax nodes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Line/column range of a syntax node.
///
/// Lines and columns are 1-based. `end_col` is inclusive: a single character
/// at column 5 has `start_col == end_col == 5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// First line covered by the node
    pub start_line: usize,
    /// Column of the first character on `start_line`
    pub start_col: usize,
    /// Last line covered by the node
    pub end_line: usize,
    /// Column of the last character on `end_line`
    pub end_col: usize,
}

impl Span {
    /// Create a span from explicit start and end positions
    pub fn new(start_line: usize, start_col: usize, end_line: usize, end_col: usize) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// Create a span covering `start_col..=end_col` of a single line
    pub fn line(line: usize, start_col: usize, end_col: usize) -> Self {
        Self::new(line, start_col, line, end_col)
    }

    /// True if the span starts and ends on the same line
    pub fn is_single_line(&self) -> bool {
        self.start_line == self.end_line
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start_line, self.start_col, self.end_line, self.end_col
        )
    }
}
