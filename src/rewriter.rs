//! Single-pass pattern matcher and rewriter.
//!
//! The query is tokenized once and scanned left to right. At each significant
//! token the registry's candidates for that position are tried in priority
//! order; the first one whose elements all match is emitted and the scan
//! resumes after it. Tokens nothing matches are copied through unchanged, so
//! literals, comments and whitespace survive byte for byte.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use serde::Serialize;

use crate::ast::{BlockSpec, CaptureKind, Element, Keyword, OperatorSpec, Pattern, Shape};
use crate::block::{self, BlockMatch, BlockOperatorEngine};
use crate::clause::{Clause, ClauseContextTracker};
use crate::config::RewriteOptions;
use crate::error::{ClauseContextError, Diagnostic, SemqlError, SemqlResult, Span};
use crate::registry::{Matcher, PositionClass, RegistrySnapshot};
use crate::tokenizer::{Token, TokenKind, normalize, tokenize};

/// Words that end an undelimited expression capture.
const BOUNDARY_WORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "ON", "USING", "UNION", "INTERSECT", "EXCEPT", "WINDOW", "QUALIFY",
    "RETURNING", "VALUES", "SET", "INTO", "WHEN", "THEN", "ELSE", "END", "AS", "ASC", "DESC", "NULLS",
];

/// Prefix of synthesized dimension CTE names.
pub const DIMENSION_PREFIX: &str = "_semql_dim_";

/// One operator use that was rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub operator: String,
    pub shape: Shape,
    /// Cache hint forwarded from the declaration.
    pub cache: bool,
    /// Byte span of the original text.
    pub span: Span,
}

/// Result of rewriting one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rewrite {
    pub sql: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Innermost uses first.
    pub invocations: Vec<Invocation>,
    /// Names of synthesized dimension CTEs.
    pub dimensions: Vec<String>,
    pub snapshot_version: u64,
}

/// Rewrites queries against one registry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Rewriter<'s> {
    snapshot: &'s RegistrySnapshot,
    options: &'s RewriteOptions,
}

impl<'s> Rewriter<'s> {
    pub fn new(snapshot: &'s RegistrySnapshot, options: &'s RewriteOptions) -> Self {
        Self { snapshot, options }
    }

    pub fn rewrite(&self, sql: &str) -> SemqlResult<Rewrite> {
        if sql.len() > self.options.max_query_bytes {
            return Err(SemqlError::QueryTooLarge {
                size: sql.len(),
                limit: self.options.max_query_bytes,
            });
        }

        let tokens = tokenize(sql);
        let mut pass = Pass::new(self.snapshot, self.options, &tokens);
        let body = pass.rewrite_range(0, tokens.len());
        let ctes: Vec<String> = pass.dimensions.iter().map(|d| d.cte.clone()).collect();
        let sql = attach_ctes(body, &ctes);

        Ok(Rewrite {
            sql,
            diagnostics: pass.diagnostics,
            invocations: pass.invocations,
            dimensions: pass.dimensions.into_iter().map(|d| d.name).collect(),
            snapshot_version: self.snapshot.version(),
        })
    }
}

#[derive(Debug)]
struct Dimension {
    name: String,
    cte: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DimensionKey {
    operator: String,
    captures: Vec<String>,
    from: Option<String>,
}

/// A successful flat pattern match.
#[derive(Debug)]
pub(crate) struct PatternMatch {
    /// Token index just past the match.
    end: usize,
    bindings: Vec<(String, Range<usize>)>,
    /// Index of the first keyword token.
    anchor: usize,
    negated: bool,
}

/// Memoized expression scans over one token stream.
///
/// Every depth-zero token a scan passes through would end its own scan at the
/// same place, so each start is walked at most once per stop keyword, mode
/// and range end.
#[derive(Debug, Default)]
pub(crate) struct ScanCache {
    ends: HashMap<(Option<Keyword>, bool, usize), HashMap<usize, Option<usize>>>,
}

impl ScanCache {
    /// Same result as [`scan_expression`] with at most one stop keyword.
    fn scan(
        &mut self,
        tokens: &[Token<'_>],
        start: usize,
        end: usize,
        stop: Option<&Keyword>,
        delimited: bool,
    ) -> Option<Range<usize>> {
        let end = end.min(tokens.len());
        let stops: Vec<&Keyword> = stop.into_iter().collect();
        let memo = self.ends.entry((stop.cloned(), delimited, end)).or_default();

        let mut visited = Vec::new();
        let mut depth = 0usize;
        let mut case_depth = 0usize;
        let mut last = None;
        let mut known = None;

        let mut i = start;
        while i < end {
            let token = &tokens[i];
            if token.is_trivia() {
                i += 1;
                continue;
            }
            if depth == 0 && case_depth == 0 {
                if let Some(&hit) = memo.get(&i) {
                    known = Some(hit);
                    break;
                }
                if ends_expression(tokens, i, end, &stops, delimited) {
                    break;
                }
                visited.push(i);
            }
            if token.opens_group() {
                depth += 1;
            } else if token.closes_group() {
                let Some(d) = depth.checked_sub(1) else {
                    known = Some(None);
                    break;
                };
                depth = d;
            } else if token.is_word("CASE") {
                case_depth += 1;
            } else if token.is_word("END") && case_depth > 0 {
                case_depth -= 1;
            }
            last = Some(i);
            i += 1;
        }

        let stop_at = match known {
            Some(hit) => hit,
            None if depth == 0 => last.map(|last| last + 1),
            None => None,
        };
        for v in visited {
            memo.insert(v, stop_at);
        }
        stop_at.map(|e| start..e)
    }
}

/// State of one rewrite.
struct Pass<'s, 't, 'a> {
    snapshot: &'s RegistrySnapshot,
    options: &'s RewriteOptions,
    tokens: &'t [Token<'a>],
    tracker: ClauseContextTracker,
    vocabulary: HashSet<String>,
    diagnostics: Vec<Diagnostic>,
    diagnosed: HashSet<(String, usize)>,
    invocations: Vec<Invocation>,
    dimensions: Vec<Dimension>,
    dimension_index: HashMap<DimensionKey, usize>,
    /// Rewritten FROM text per scope.
    from_texts: HashMap<usize, Option<String>>,
    scans: ScanCache,
}

impl<'s, 't, 'a> Pass<'s, 't, 'a> {
    fn new(snapshot: &'s RegistrySnapshot, options: &'s RewriteOptions, tokens: &'t [Token<'a>]) -> Self {
        let vocabulary = tokens
            .iter()
            .filter(|t| !t.is_trivia())
            .map(|t| match t.kind {
                TokenKind::Word => t.text.to_ascii_uppercase(),
                _ => t.text.to_string(),
            })
            .collect();
        Self {
            snapshot,
            options,
            tokens,
            tracker: ClauseContextTracker::new(tokens),
            vocabulary,
            diagnostics: Vec::new(),
            diagnosed: HashSet::new(),
            invocations: Vec::new(),
            dimensions: Vec::new(),
            dimension_index: HashMap::new(),
            from_texts: HashMap::new(),
            scans: ScanCache::default(),
        }
    }

    fn rewrite_range(&mut self, start: usize, end: usize) -> String {
        let tokens = self.tokens;
        let mut out = String::new();
        let mut i = start;
        while i < end {
            let token = &tokens[i];
            if !token.is_trivia() {
                if let Some((text, next)) = self.try_match(i, end) {
                    out.push_str(&text);
                    i = next;
                    continue;
                }
            }
            out.push_str(token.text);
            i += 1;
        }
        out
    }

    /// Rewritten FROM clause of a scope, computed once.
    fn from_text(&mut self, scope: usize) -> Option<String> {
        if let Some(text) = self.from_texts.get(&scope) {
            return text.clone();
        }
        self.from_texts.insert(scope, None);

        let range = self.tracker.from_range(scope)?;
        // Uses inside FROM are recorded when the main scan reaches them.
        let recorded = self.invocations.len();
        let text = self.rewrite_range(range.start, range.end);
        self.invocations.truncate(recorded);

        let text = Some(text.trim().to_string()).filter(|t| !t.is_empty());
        self.from_texts.insert(scope, text.clone());
        text
    }

    fn span(&self, start: usize, end: usize) -> Span {
        let first = self.tokens.get(start).map_or(0, |t| t.span.start);
        let last = end
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(first, |t| t.span.end);
        Span::new(first, last)
    }

    fn try_match(&mut self, i: usize, end: usize) -> Option<(String, usize)> {
        // NOT directly before a keyword-led match negates it.
        if self.tokens[i].is_word("NOT") {
            if let Some(next) = next_significant(self.tokens, i + 1, end) {
                if let Some((text, after)) = self.match_at(i, next, end, true) {
                    return Some((negate(&text), after));
                }
            }
        }
        self.match_at(i, i, end, false)
    }

    /// Try every candidate at `at`; `origin` is where the emitted span starts.
    fn match_at(&mut self, origin: usize, at: usize, end: usize, keyword_led_only: bool) -> Option<(String, usize)> {
        let snapshot = self.snapshot;
        let tokens = self.tokens;
        let class = PositionClass::of(&tokens[at]);

        for candidate in snapshot.lookup_candidates(class) {
            if !candidate.possible(&self.vocabulary) {
                continue;
            }
            match candidate.matcher {
                Matcher::Block(spec) => {
                    let Some(m) = BlockOperatorEngine::new(spec).match_at(tokens, at, end) else {
                        continue;
                    };
                    let text = self.emit_block(spec, &m);
                    self.record(candidate.spec, origin, m.end);
                    return Some((text, m.end));
                }
                Matcher::Pattern(pattern) => {
                    if keyword_led_only && pattern.leading_keyword().is_none() {
                        continue;
                    }
                    let Some(m) = match_pattern(tokens, pattern, at, end, &mut self.scans) else {
                        continue;
                    };
                    let clause = self.tracker.clause_at(m.anchor);
                    if !clause.permits(candidate.spec.shape) {
                        self.reject(candidate.spec, clause, origin, &m);
                        continue;
                    }
                    let mut text = self.emit_pattern(candidate.spec, &m);
                    if m.negated {
                        text = negate(&text);
                    }
                    self.record(candidate.spec, origin, m.end);
                    return Some((text, m.end));
                }
            }
        }
        None
    }

    fn record(&mut self, spec: &OperatorSpec, start: usize, end: usize) {
        let span = self.span(start, end);
        tracing::debug!(operator = %spec.name, shape = %spec.shape, span = %span, "operator rewritten");
        self.invocations.push(Invocation {
            operator: spec.name.clone(),
            shape: spec.shape,
            cache: spec.cache,
            span,
        });
    }

    fn reject(&mut self, spec: &OperatorSpec, clause: Clause, start: usize, m: &PatternMatch) {
        if !self.diagnosed.insert((spec.name.clone(), m.anchor)) {
            return;
        }
        let span = self.span(start, m.end);
        tracing::debug!(operator = %spec.name, clause = %clause, span = %span, "operator not permitted in clause");
        self.diagnostics.push(Diagnostic::ClauseContext(ClauseContextError {
            operator: spec.name.clone(),
            clause,
            span,
        }));
    }

    /// Rewrite every captured range.
    fn render_bindings(&mut self, bindings: &[(String, Range<usize>)]) -> HashMap<String, String> {
        bindings
            .iter()
            .map(|(name, range)| (name.clone(), self.rewrite_range(range.start, range.end)))
            .collect()
    }

    fn emit_pattern(&mut self, spec: &OperatorSpec, m: &PatternMatch) -> String {
        let mut values = self.render_bindings(&m.bindings);

        match spec.shape {
            Shape::Scalar => render_output(spec, &values),
            Shape::Aggregate => {
                if let Some(value) = spec.context_arg.as_ref().and_then(|arg| values.get_mut(arg)) {
                    *value = format!("{}({})", self.options.collection_function, value);
                }
                render_output(spec, &values)
            }
            Shape::Dimension => {
                let context = spec
                    .context_arg
                    .as_ref()
                    .and_then(|arg| values.get(arg).cloned())
                    .unwrap_or_default();
                let name = self.dimension(spec, m, &values, &context);
                format!(
                    "{}((SELECT assignment FROM {}), {})",
                    self.options.dimension_lookup_function, name, context
                )
            }
        }
    }

    /// Name of the CTE computing this dimension, creating it on first use.
    fn dimension(
        &mut self,
        spec: &OperatorSpec,
        m: &PatternMatch,
        values: &HashMap<String, String>,
        context: &str,
    ) -> String {
        let from = self.from_text(self.tracker.scope_at(m.anchor));
        let key = DimensionKey {
            operator: spec.name.clone(),
            captures: m
                .bindings
                .iter()
                .map(|(_, range)| normalize(&self.tokens[range.clone()]))
                .collect(),
            from: from.clone(),
        };
        if let Some(&index) = self.dimension_index.get(&key) {
            return self.dimensions[index].name.clone();
        }

        let mut collected = values.clone();
        if let Some(arg) = &spec.context_arg {
            collected.insert(
                arg.clone(),
                format!("{}({})", self.options.collection_function, context),
            );
        }
        let computation = render_output(spec, &collected);
        let name = format!("{}{}_{}", DIMENSION_PREFIX, spec.name, self.dimensions.len() + 1);
        let cte = match &from {
            Some(from) => format!("{name} AS (SELECT {computation} AS assignment FROM {from})"),
            None => format!("{name} AS (SELECT {computation} AS assignment)"),
        };
        tracing::debug!(operator = %spec.name, cte = %name, "dimension synthesized");

        self.dimension_index.insert(key, self.dimensions.len());
        self.dimensions.push(Dimension {
            name: name.clone(),
            cte,
        });
        name
    }

    fn emit_block(&mut self, block: &BlockSpec, m: &BlockMatch) -> String {
        let top = self.render_bindings(&m.top);
        let branches: Vec<HashMap<String, String>> =
            m.branches.iter().map(|b| self.render_bindings(b)).collect();
        block::fold(&block.output, &top, &branches)
    }
}

fn render_output(spec: &OperatorSpec, values: &HashMap<String, String>) -> String {
    spec.output_template.render(|binding| {
        values.get(binding).cloned().or_else(|| {
            spec.args
                .iter()
                .find(|a| a.name == binding)
                .and_then(|a| a.default.clone())
        })
    })
}

/// Match a flat pattern starting at significant token `start`.
pub(crate) fn match_pattern(
    tokens: &[Token<'_>],
    pattern: &Pattern,
    start: usize,
    end: usize,
    scans: &mut ScanCache,
) -> Option<PatternMatch> {
    let structure = &pattern.structure;
    let mut pos = start;
    let mut bindings = Vec::new();
    let mut anchor = None;
    let mut negated = false;

    for (k, element) in structure.iter().enumerate() {
        let mut at = next_significant(tokens, pos, end)?;
        match element {
            Element::Keyword(keyword) => {
                let leading_capture = k == 1 && matches!(structure.first(), Some(Element::Capture(_)));
                if leading_capture && tokens[at].is_word("NOT") && !keyword.first().eq_ignore_ascii_case("NOT") {
                    let after = next_significant(tokens, at + 1, end)?;
                    if match_keyword(tokens, after, end, keyword).is_some() {
                        negated = true;
                        at = after;
                    }
                }
                pos = match_keyword(tokens, at, end, keyword)?;
                anchor.get_or_insert(at);
            }
            Element::Capture(capture) => {
                let range = match capture.kind {
                    CaptureKind::StringLiteral => literal_at(tokens, at)?,
                    CaptureKind::Expression => {
                        let next = structure.get(k + 1).and_then(Element::as_keyword);
                        let delimited = next.is_some_and(|kw| matches!(kw.first(), "," | ")" | "]"));
                        scans.scan(tokens, at, end, next, delimited)?
                    }
                };
                pos = range.end;
                bindings.push((capture.binding.clone(), range));
            }
        }
    }

    Some(PatternMatch {
        end: pos,
        bindings,
        anchor: anchor?,
        negated,
    })
}

/// First significant token index in `from..end`.
pub(crate) fn next_significant(tokens: &[Token<'_>], from: usize, end: usize) -> Option<usize> {
    (from..end.min(tokens.len())).find(|&i| !tokens[i].is_trivia())
}

/// Match every word of `keyword` starting at significant token `at`; returns
/// the index just past the last word.
pub(crate) fn match_keyword(tokens: &[Token<'_>], at: usize, end: usize, keyword: &Keyword) -> Option<usize> {
    let mut pos = at;
    for word in &keyword.words {
        let i = next_significant(tokens, pos, end)?;
        if !tokens[i].matches_keyword_word(word) {
            return None;
        }
        pos = i + 1;
    }
    Some(pos)
}

/// A single quoted literal or parameter placeholder.
pub(crate) fn literal_at(tokens: &[Token<'_>], at: usize) -> Option<Range<usize>> {
    let token = tokens.get(at)?;
    matches!(token.kind, TokenKind::StringLiteral | TokenKind::Parameter).then(|| at..at + 1)
}

fn is_boundary_word(token: &Token<'_>) -> bool {
    token.kind == TokenKind::Word && BOUNDARY_WORDS.iter().any(|w| token.text.eq_ignore_ascii_case(w))
}

/// Whether an expression at bracket and `CASE` depth zero ends before token `i`.
fn ends_expression(tokens: &[Token<'_>], i: usize, end: usize, stops: &[&Keyword], delimited: bool) -> bool {
    let token = &tokens[i];
    stops.iter().any(|k| match_keyword(tokens, i, end, k).is_some())
        || token.is_punct(',')
        || token.is_punct(';')
        || token.closes_group()
        || (!delimited && is_boundary_word(token))
}

/// Scan a balanced expression starting at significant token `start`.
///
/// Stops, at bracket and `CASE` depth zero, before any of `stops`, a comma or
/// semicolon, a closing bracket, or (unless `delimited`) a boundary word.
/// Returns `None` for an empty or unbalanced capture.
pub(crate) fn scan_expression(
    tokens: &[Token<'_>],
    start: usize,
    end: usize,
    stops: &[&Keyword],
    delimited: bool,
) -> Option<Range<usize>> {
    let end = end.min(tokens.len());
    let mut depth = 0usize;
    let mut case_depth = 0usize;
    let mut last = None;

    let mut i = start;
    while i < end {
        let token = &tokens[i];
        if token.is_trivia() {
            i += 1;
            continue;
        }
        if depth == 0 && case_depth == 0 && ends_expression(tokens, i, end, stops, delimited) {
            break;
        }
        if token.opens_group() {
            depth += 1;
        } else if token.closes_group() {
            depth = depth.checked_sub(1)?;
        } else if token.is_word("CASE") {
            case_depth += 1;
        } else if token.is_word("END") && case_depth > 0 {
            case_depth -= 1;
        }
        last = Some(i);
        i += 1;
    }

    if depth != 0 {
        return None;
    }
    last.map(|last| start..last + 1)
}

/// `NOT f(...)` for a single call, `NOT (...)` otherwise.
pub fn negate(sql: &str) -> String {
    if is_single_call(sql) {
        format!("NOT {sql}")
    } else {
        format!("NOT ({sql})")
    }
}

fn is_single_call(sql: &str) -> bool {
    let tokens: Vec<Token<'_>> = tokenize(sql).into_iter().filter(|t| !t.is_trivia()).collect();
    let [name, open, rest @ ..] = tokens.as_slice() else {
        return false;
    };
    if name.kind != TokenKind::Word || !open.is_punct('(') {
        return false;
    }
    let mut depth = 1usize;
    for (i, token) in rest.iter().enumerate() {
        if token.opens_group() {
            depth += 1;
        } else if token.closes_group() {
            depth -= 1;
            if depth == 0 {
                return i == rest.len() - 1;
            }
        }
    }
    false
}

/// Merge dimension CTEs into a leading `WITH [RECURSIVE]` list, or prepend one.
fn attach_ctes(sql: String, ctes: &[String]) -> String {
    if ctes.is_empty() {
        return sql;
    }
    let list = ctes.join(", ");
    let tokens = tokenize(&sql);
    let Some(first) = next_significant(&tokens, 0, tokens.len()) else {
        return sql;
    };

    if !tokens[first].is_word("WITH") {
        let at = tokens[first].span.start;
        return format!("{}WITH {} {}", &sql[..at], list, &sql[at..]);
    }

    let mut entry = next_significant(&tokens, first + 1, tokens.len());
    let mut insert_at = tokens[first].span.end;
    if let Some(recursive) = entry.filter(|&i| tokens[i].is_word("RECURSIVE")) {
        insert_at = tokens[recursive].span.end;
        entry = next_significant(&tokens, recursive + 1, tokens.len());
    }

    // After the body of the last well-formed entry.
    let mut last_body = None;
    while let Some(name) = entry {
        let Some(close) = cte_body_end(&tokens, name) else {
            break;
        };
        last_body = Some(close);
        entry = next_significant(&tokens, close + 1, tokens.len())
            .filter(|&i| tokens[i].is_punct(','))
            .and_then(|comma| next_significant(&tokens, comma + 1, tokens.len()));
    }

    match last_body {
        Some(close) => {
            let pos = tokens[close].span.end;
            format!("{}, {}{}", &sql[..pos], list, &sql[pos..])
        }
        // Malformed WITH list: put ours first.
        None => format!("{} {},{}", &sql[..insert_at], list, &sql[insert_at..]),
    }
}

/// Closing bracket of the body of `name [(columns)] AS [NOT] [MATERIALIZED] (body)`.
fn cte_body_end(tokens: &[Token<'_>], name: usize) -> Option<usize> {
    let next = |from: usize| next_significant(tokens, from, tokens.len());
    if !matches!(
        tokens[name].kind,
        TokenKind::Word | TokenKind::QuotedIdent | TokenKind::StringLiteral
    ) {
        return None;
    }
    let mut at = next(name + 1)?;
    if tokens[at].is_punct('(') {
        at = next(closing_bracket(tokens, at)? + 1)?;
    }
    if !tokens[at].is_word("AS") {
        return None;
    }
    at = next(at + 1)?;
    if tokens[at].is_word("NOT") {
        at = next(at + 1)?;
    }
    if tokens[at].is_word("MATERIALIZED") {
        at = next(at + 1)?;
    }
    if !tokens[at].is_punct('(') {
        return None;
    }
    closing_bracket(tokens, at)
}

/// Index of the bracket closing the one at `open`.
fn closing_bracket(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.opens_group() {
            depth += 1;
        } else if token.closes_group() {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieBreak;
    use crate::registry::{BuiltinSource, InlineSource, OperatorSource};
    use pretty_assertions::assert_eq;

    fn registry(extra: &str) -> RegistrySnapshot {
        let mut sources: Vec<Box<dyn OperatorSource>> = vec![Box::new(BuiltinSource)];
        if !extra.is_empty() {
            sources.push(Box::new(InlineSource::new("test", extra)));
        }
        RegistrySnapshot::build(&sources, TieBreak::Declaration, 1)
    }

    fn rewrite_with(snapshot: &RegistrySnapshot, sql: &str) -> Rewrite {
        let options = RewriteOptions::default();
        Rewriter::new(snapshot, &options).rewrite(sql).unwrap()
    }

    fn rewrite(sql: &str) -> String {
        rewrite_with(&registry(""), sql).sql
    }

    #[test]
    fn test_infix_in_where() {
        assert_eq!(
            rewrite("SELECT * FROM t WHERE col MEANS 'urgent'"),
            "SELECT * FROM t WHERE semantic_matches(col, 'urgent')"
        );
    }

    #[test]
    fn test_trailing_capture_stops_at_boundary() {
        assert_eq!(
            rewrite("SELECT * FROM t WHERE col MEANS 'a' AND x = 1"),
            "SELECT * FROM t WHERE semantic_matches(col, 'a') AND x = 1"
        );
        assert_eq!(
            rewrite("SELECT a MEANS 'x', b FROM t"),
            "SELECT semantic_matches(a, 'x'), b FROM t"
        );
    }

    #[test]
    fn test_capture_is_balanced() {
        assert_eq!(
            rewrite("SELECT lower(a || b) MEANS 'x' FROM t"),
            "SELECT semantic_matches(lower(a || b), 'x') FROM t"
        );
        assert_eq!(
            rewrite("SELECT f(a MEANS 'x') FROM t"),
            "SELECT f(semantic_matches(a, 'x')) FROM t"
        );
    }

    #[test]
    fn test_case_insensitive_and_multiline_keyword() {
        assert_eq!(
            rewrite("SELECT * FROM t WHERE body aligns\n\t  with 'refund'"),
            "SELECT * FROM t WHERE semantic_aligns(body, 'refund')"
        );
    }

    #[test]
    fn test_comment_between_keyword_words() {
        assert_eq!(
            rewrite("SELECT * FROM t WHERE body ALIGNS /* c */ WITH 'x'"),
            "SELECT * FROM t WHERE semantic_aligns(body, 'x')"
        );
    }

    #[test]
    fn test_literals_and_comments_untouched() {
        let sql = "SELECT 'a MEANS b', \"x MEANS y\" FROM t -- c MEANS d\n/* e MEANS f */";
        assert_eq!(rewrite(sql), sql);
    }

    #[test]
    fn test_negation() {
        assert_eq!(
            rewrite("SELECT * FROM t WHERE col NOT MEANS 'x'"),
            "SELECT * FROM t WHERE NOT semantic_matches(col, 'x')"
        );
    }

    #[test]
    fn test_not_before_keyword_led_match() {
        let snapshot = registry("op_within: {patterns: ['WITHIN {{a}} OF {{b}}'], output: '{{a}} <= {{b}}'}");
        assert_eq!(
            rewrite_with(&snapshot, "SELECT * FROM t WHERE NOT WITHIN d OF 5").sql,
            "SELECT * FROM t WHERE NOT (d <= 5)"
        );
    }

    #[test]
    fn test_string_literal_capture() {
        assert_eq!(
            rewrite("SELECT body EXTRACTS 'price' FROM t"),
            "SELECT semantic_extract(body, 'price') FROM t"
        );
        // A non-literal is not a valid extraction pattern.
        assert_eq!(
            rewrite("SELECT body EXTRACTS price FROM t"),
            "SELECT body EXTRACTS price FROM t"
        );
    }

    #[test]
    fn test_symbol_infix() {
        assert_eq!(
            rewrite("SELECT a <~> b AS s FROM t"),
            "SELECT semantic_similarity(a, b) AS s FROM t"
        );
    }

    #[test]
    fn test_aggregate_in_select_and_where() {
        let snapshot = registry("");
        let ok = rewrite_with(&snapshot, "SELECT SUMMARIZE(body) FROM t GROUP BY k");
        assert_eq!(ok.sql, "SELECT semantic_summarize(LIST(body)) FROM t GROUP BY k");
        assert!(ok.diagnostics.is_empty());

        let sql = "SELECT * FROM t WHERE SUMMARIZE(body) = 'x'";
        let bad = rewrite_with(&snapshot, sql);
        assert_eq!(bad.sql, sql);
        assert_eq!(bad.diagnostics.len(), 1);
        let Diagnostic::ClauseContext(err) = &bad.diagnostics[0];
        assert_eq!(err.operator, "semantic_summarize");
        assert_eq!(err.clause, crate::clause::Clause::Where);
        assert_eq!(&sql[err.span.start..err.span.end], "SUMMARIZE(body)");
    }

    #[test]
    fn test_dimension_dedup() {
        let out = rewrite_with(
            &registry(""),
            "SELECT TOPICS(body, 3), count(*) FROM tickets GROUP BY TOPICS(body, 3)",
        );
        assert_eq!(out.dimensions, vec!["_semql_dim_semantic_topics_1".to_string()]);
        assert_eq!(
            out.sql,
            "WITH _semql_dim_semantic_topics_1 AS (SELECT semantic_topics(LIST(body), 3) AS assignment FROM tickets) \
             SELECT dimension_bucket((SELECT assignment FROM _semql_dim_semantic_topics_1), body), count(*) FROM tickets \
             GROUP BY dimension_bucket((SELECT assignment FROM _semql_dim_semantic_topics_1), body)"
        );
    }

    #[test]
    fn test_dimension_merges_into_with() {
        let out = rewrite("WITH x AS (SELECT * FROM t) SELECT TOPICS(body, 2) FROM x");
        assert_eq!(
            out,
            "WITH x AS (SELECT * FROM t), _semql_dim_semantic_topics_1 AS (SELECT semantic_topics(LIST(body), 2) AS assignment FROM x) \
             SELECT dimension_bucket((SELECT assignment FROM _semql_dim_semantic_topics_1), body) FROM x"
        );
    }

    #[test]
    fn test_dimension_after_column_list_cte() {
        let out = rewrite("WITH x(a) AS (SELECT body FROM t) SELECT TOPICS(a) FROM x");
        assert_eq!(
            out,
            "WITH x(a) AS (SELECT body FROM t), _semql_dim_semantic_topics_1 AS (SELECT semantic_topics(LIST(a), 5) AS assignment FROM x) \
             SELECT dimension_bucket((SELECT assignment FROM _semql_dim_semantic_topics_1), a) FROM x"
        );
    }

    #[test]
    fn test_dimension_after_recursive_materialized_ctes() {
        let out = rewrite("WITH RECURSIVE r(n) AS MATERIALIZED (SELECT 1), s AS (SELECT n FROM r) SELECT TOPICS(n) FROM s");
        assert_eq!(
            out,
            "WITH RECURSIVE r(n) AS MATERIALIZED (SELECT 1), s AS (SELECT n FROM r), \
             _semql_dim_semantic_topics_1 AS (SELECT semantic_topics(LIST(n), 5) AS assignment FROM s) \
             SELECT dimension_bucket((SELECT assignment FROM _semql_dim_semantic_topics_1), n) FROM s"
        );
    }

    #[test]
    fn test_attach_ctes_malformed_with() {
        let ctes = vec!["d AS (SELECT 1)".to_string()];
        assert_eq!(attach_ctes("WITH SELECT 1".to_string(), &ctes), "WITH d AS (SELECT 1), SELECT 1");
        assert_eq!(attach_ctes("SELECT 1".to_string(), &ctes), "WITH d AS (SELECT 1) SELECT 1");
    }

    #[test]
    fn test_block_case() {
        let out = rewrite(
            "SELECT SEMANTIC CASE body WHEN 'refund' THEN 'billing' WHEN 'crash' THEN 'bug' ELSE 'other' END AS team FROM t",
        );
        assert_eq!(
            out,
            "SELECT CASE WHEN semantic_matches(body, 'refund') THEN 'billing' ELSE \
             CASE WHEN semantic_matches(body, 'crash') THEN 'bug' ELSE 'other' END END AS team FROM t"
        );
    }

    #[test]
    fn test_block_abort_copies_through() {
        let sql = "SELECT SEMANTIC CASE body ELSE 'x' END FROM t";
        assert_eq!(rewrite(sql), sql);
    }

    #[test]
    fn test_nested_operator_in_capture() {
        assert_eq!(
            rewrite("SELECT (a <~> b) MEANS 'close' FROM t"),
            "SELECT semantic_matches((semantic_similarity(a, b)), 'close') FROM t"
        );
    }

    #[test]
    fn test_invocations_recorded() {
        let out = rewrite_with(&registry(""), "SELECT * FROM t WHERE col MEANS 'urgent'");
        assert_eq!(out.invocations.len(), 1);
        let inv = &out.invocations[0];
        assert_eq!(inv.operator, "semantic_matches");
        assert!(inv.cache);
        assert_eq!(inv.span, Span::new(22, 40));
    }

    #[test]
    fn test_query_too_large() {
        let snapshot = registry("");
        let options = RewriteOptions {
            max_query_bytes: 8,
            ..RewriteOptions::default()
        };
        let err = Rewriter::new(&snapshot, &options).rewrite("SELECT * FROM t").unwrap_err();
        assert!(matches!(err, SemqlError::QueryTooLarge { size: 15, limit: 8 }));
    }

    #[test]
    fn test_scan_cache_agrees_with_scan() {
        let tokens = tokenize("a + f(b, c) * CASE WHEN d THEN 1 END MEANS 'x', e AND (g");
        let means = Keyword::new(["MEANS"]);
        let mut cache = ScanCache::default();
        for delimited in [false, true] {
            for start in (0..tokens.len()).filter(|&i| !tokens[i].is_trivia()) {
                assert_eq!(
                    cache.scan(&tokens, start, tokens.len(), Some(&means), delimited),
                    scan_expression(&tokens, start, tokens.len(), &[&means], delimited),
                    "start {start}, delimited {delimited}"
                );
            }
        }
    }

    #[test]
    fn test_negate() {
        assert_eq!(negate("f(a, b)"), "NOT f(a, b)");
        assert_eq!(negate("f(a) AND g(b)"), "NOT (f(a) AND g(b))");
        assert_eq!(negate("a <= b"), "NOT (a <= b)");
    }

    #[test]
    fn test_scan_expression_stops() {
        let tokens = tokenize("a + (b, c) AND d");
        let range = scan_expression(&tokens, 0, tokens.len(), &[], false).unwrap();
        let text: String = tokens[range].iter().map(|t| t.text).collect();
        assert_eq!(text, "a + (b, c)");
        assert!(scan_expression(&tokens, 0, 4, &[], false).is_some());
        let unbalanced = tokenize("f(a");
        assert!(scan_expression(&unbalanced, 0, unbalanced.len(), &[], false).is_none());
    }
}
