//! Source excerpts for compile errors
//!
//! Renders the lines a [`Span`] covers with up to four lines of context on
//! either side and a caret underline:
//!
//! ```text
//! On line 2:
//!   1| var a: u4;
//!   2| var a: s1;
//!          ^------^
//! ```

use crate::syntax::Span;
use std::fmt::Write as _;

/// Lines of context shown above and below the covered lines
pub const CONTEXT_LINES: usize = 4;

/// Width of the `nnn| ` gutter the underline has to skip
const GUTTER: &str = "     ";

/// Render the excerpt of `source` covered by `span`
pub fn render(source: &str, span: &Span) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let start = span.start_line.max(1);
    let end = span.end_line.max(start);

    let mut out = if start == end {
        format!("On line {}:", start)
    } else {
        format!("On lines {} to {}:", start, end)
    };

    let line = |n: usize| lines.get(n - 1).copied().unwrap_or("");
    let numbered = |out: &mut String, n: usize| {
        let _ = write!(out, "\n{:>3}| {}", n, line(n));
    };

    let first_context = start.saturating_sub(CONTEXT_LINES).max(1);
    for n in first_context..start {
        numbered(&mut out, n);
    }

    let lead = |col: usize| " ".repeat(col.saturating_sub(1));
    if start == end {
        numbered(&mut out, start);
        let underline = if span.end_col <= span.start_col {
            "^".to_string()
        } else {
            format!("^{}^", "-".repeat(span.end_col - span.start_col - 1))
        };
        let _ = write!(out, "\n{}{}{}", GUTTER, lead(span.start_col), underline);
    } else {
        numbered(&mut out, start);
        let first_len = line(start).chars().count();
        let _ = write!(
            out,
            "\n{}{}^{}",
            GUTTER,
            lead(span.start_col),
            "-".repeat(first_len.saturating_sub(span.start_col))
        );
        for n in start + 1..end {
            numbered(&mut out, n);
            let _ = write!(out, "\n{}{}", GUTTER, "-".repeat(line(n).chars().count()));
        }
        numbered(&mut out, end);
        let _ = write!(out, "\n{}{}^", GUTTER, "-".repeat(span.end_col.saturating_sub(1)));
    }

    let last_context = (end + CONTEXT_LINES).min(lines.len());
    for n in end + 1..=last_context {
        numbered(&mut out, n);
    }
    out
}
