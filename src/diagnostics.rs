//! Human-readable rendering of positioned errors.
//!
//! ```text
//! error: operator 'semantic_summarize' cannot be used in WHERE (at 22..37)
//!  --> 1:23
//!   |
//! 1 | SELECT * FROM t WHERE SUMMARIZE(body) = 'x'
//!   |                       ^^^^^^^^^^^^^^^
//! ```

use colored::{ColoredString, Colorize};

use crate::error::{CompileError, Diagnostic, Span};

/// 1-based line and column (in characters) of a byte offset.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = floor_char_boundary(source, offset.min(source.len()));
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = source[line_start..offset].chars().count() + 1;
    (line, column)
}

fn floor_char_boundary(source: &str, mut offset: usize) -> usize {
    while offset > 0 && !source.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

fn paint(text: &str, color: bool, style: impl Fn(&str) -> ColoredString) -> String {
    if color { style(text).to_string() } else { text.to_string() }
}

/// Render `message` with the source line under `span` and a caret marker.
pub fn render(source: &str, span: Span, message: &str, color: bool) -> String {
    let (line, column) = line_col(source, span.start);
    let start = floor_char_boundary(source, span.start.min(source.len()));
    let line_start = source[..start].rfind('\n').map_or(0, |i| i + 1);
    let line_end = source[start..].find('\n').map_or(source.len(), |i| start + i);
    let text = &source[line_start..line_end];

    let end = floor_char_boundary(source, span.end.clamp(start, line_end));
    let width = source[start..end].chars().count().max(1);
    let number = line.to_string();
    let gutter = " ".repeat(number.len());

    let mut out = String::new();
    out.push_str(&format!("{}: {}\n", paint("error", color, |s| s.red().bold()), message));
    out.push_str(&format!("{}{} {}:{}\n", gutter, paint("-->", color, |s| s.blue().bold()), line, column));
    out.push_str(&format!("{} {}\n", gutter, paint("|", color, |s| s.blue().bold())));
    out.push_str(&format!("{} {} {}\n", paint(&number, color, |s| s.blue().bold()), paint("|", color, |s| s.blue().bold()), text));
    out.push_str(&format!(
        "{} {} {}{}",
        gutter,
        paint("|", color, |s| s.blue().bold()),
        " ".repeat(column - 1),
        paint(&"^".repeat(width), color, |s| s.red().bold())
    ));
    out
}

/// Render a rewrite diagnostic against the query it came from.
pub fn render_diagnostic(query: &str, diagnostic: &Diagnostic, color: bool) -> String {
    render(query, diagnostic.span(), &diagnostic.message(), color)
}

/// Render a template compile error against its template.
pub fn render_compile_error(error: &CompileError, color: bool) -> String {
    let span = Span::new(error.position, error.position + 1);
    render(&error.template, span, &format!("{}", error.kind), color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause::Clause;
    use crate::error::{ClauseContextError, CompileErrorKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_col() {
        let src = "SELECT a\nFROM t\nWHERE x";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 9), (2, 1));
        assert_eq!(line_col(src, 22), (3, 7));
        assert_eq!(line_col(src, 999), (3, 8));
    }

    #[test]
    fn test_render_diagnostic() {
        let query = "SELECT * FROM t WHERE SUMMARIZE(body) = 'x'";
        let diagnostic = Diagnostic::ClauseContext(ClauseContextError {
            operator: "semantic_summarize".to_string(),
            clause: Clause::Where,
            span: Span::new(22, 37),
        });
        let expected = "\
error: operator 'semantic_summarize' cannot be used in WHERE (at 22..37)
 --> 1:23
  |
1 | SELECT * FROM t WHERE SUMMARIZE(body) = 'x'
  |                       ^^^^^^^^^^^^^^^";
        assert_eq!(render_diagnostic(query, &diagnostic, false), expected);
    }

    #[test]
    fn test_render_second_line() {
        let out = render("SELECT a\nFROM t MEANS", Span::new(16, 21), "bad", false);
        assert!(out.contains(" --> 2:8\n"));
        assert!(out.ends_with("  |        ^^^^^"));
    }

    #[test]
    fn test_render_compile_error() {
        let err = CompileError::new(CompileErrorKind::AmbiguousCapture, 6, "{{a}} {{b}}");
        let out = render_compile_error(&err, false);
        assert!(out.starts_with("error: ambiguous capture"));
        assert!(out.ends_with("|       ^"));
    }
}
