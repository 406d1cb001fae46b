//! Clause context tracking.
//!
//! Scans a token stream once and records, for every token, which logical
//! query clause it belongs to and which SELECT scope encloses it. Parentheses
//! open a nested frame that inherits the outer clause until a clause keyword
//! (typically a subquery's SELECT) changes it.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::ast::Shape;
use crate::tokenizer::{Token, TokenKind};

/// Logical clause of a SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    /// Outside any recognized clause.
    Statement,
    Select,
    From,
    JoinOn,
    Where,
    GroupBy,
    Having,
    Window,
    Qualify,
    OrderBy,
    Limit,
    Values,
    Set,
    Returning,
}

impl Clause {
    /// Whether an operator of `shape` may be used in this clause.
    pub fn permits(self, shape: Shape) -> bool {
        match shape {
            Shape::Scalar => true,
            Shape::Aggregate => matches!(self, Self::Select | Self::Having | Self::OrderBy),
            Shape::Dimension => matches!(
                self,
                Self::Select | Self::GroupBy | Self::Having | Self::OrderBy
            ),
        }
    }

    const fn is_from(self) -> bool {
        matches!(self, Self::From | Self::JoinOn)
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Statement => "statement",
            Self::Select => "SELECT",
            Self::From => "FROM",
            Self::JoinOn => "ON",
            Self::Where => "WHERE",
            Self::GroupBy => "GROUP BY",
            Self::Having => "HAVING",
            Self::Window => "WINDOW",
            Self::Qualify => "QUALIFY",
            Self::OrderBy => "ORDER BY",
            Self::Limit => "LIMIT",
            Self::Values => "VALUES",
            Self::Set => "SET",
            Self::Returning => "RETURNING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    clause: Clause,
    scope: usize,
    /// Set once a SELECT inside this frame opened `scope`.
    owns_scope: bool,
    /// Token index after the FROM keyword, while the FROM clause is open.
    from_start: Option<usize>,
}

/// Per-token clause and scope information for one query.
#[derive(Debug, Clone, Default)]
pub struct ClauseContextTracker {
    clauses: Vec<Clause>,
    scopes: Vec<usize>,
    from_ranges: HashMap<usize, Range<usize>>,
}

impl ClauseContextTracker {
    pub fn new(tokens: &[Token<'_>]) -> Self {
        let root = Frame {
            clause: Clause::Statement,
            scope: 0,
            owns_scope: false,
            from_start: None,
        };
        let mut stack = vec![root];
        let mut next_scope = 1;
        let mut tracker = Self {
            clauses: Vec::with_capacity(tokens.len()),
            scopes: Vec::with_capacity(tokens.len()),
            from_ranges: HashMap::new(),
        };

        for (i, token) in tokens.iter().enumerate() {
            if token.closes_group() && stack.len() > 1 {
                if let Some(frame) = stack.pop() {
                    tracker.close_from(&frame, i);
                }
            } else if token.is_punct(';') {
                while let Some(frame) = stack.pop() {
                    tracker.close_from(&frame, i);
                }
                stack.push(root);
            } else if token.kind == TokenKind::Word {
                let next_word = next_significant(tokens, i);
                if let Some(clause) = clause_keyword(token, next_word) {
                    if let Some(frame) = stack.last_mut() {
                        if frame.clause.is_from() && !clause.is_from() {
                            if let Some(start) = frame.from_start.take() {
                                tracker.from_ranges.insert(frame.scope, start..i);
                            }
                        }
                        if clause == Clause::Select {
                            frame.scope = next_scope;
                            frame.owns_scope = true;
                            next_scope += 1;
                        }
                        if clause == Clause::From && frame.owns_scope && frame.from_start.is_none() {
                            frame.from_start = Some(i + 1);
                        }
                        frame.clause = clause;
                    }
                }
            }

            let top = stack.last().copied().unwrap_or(root);
            tracker.clauses.push(top.clause);
            tracker.scopes.push(top.scope);

            if token.opens_group() {
                stack.push(Frame {
                    owns_scope: false,
                    from_start: None,
                    ..top
                });
            }
        }

        let end = tokens.len();
        while let Some(frame) = stack.pop() {
            tracker.close_from(&frame, end);
        }
        tracker
    }

    fn close_from(&mut self, frame: &Frame, end: usize) {
        if let Some(start) = frame.from_start {
            self.from_ranges.entry(frame.scope).or_insert(start..end);
        }
    }

    /// Clause of the token at `index` (`Statement` when out of range).
    pub fn clause_at(&self, index: usize) -> Clause {
        self.clauses.get(index).copied().unwrap_or(Clause::Statement)
    }

    /// SELECT scope of the token at `index`; 0 is the statement root.
    pub fn scope_at(&self, index: usize) -> usize {
        self.scopes.get(index).copied().unwrap_or(0)
    }

    /// Token range of the FROM clause (including joins) of a scope.
    pub fn from_range(&self, scope: usize) -> Option<Range<usize>> {
        self.from_ranges.get(&scope).cloned()
    }
}

fn next_significant<'a, 'b>(tokens: &'b [Token<'a>], index: usize) -> Option<&'b Token<'a>> {
    tokens[index + 1..].iter().find(|t| !t.is_trivia())
}

fn clause_keyword(token: &Token<'_>, next: Option<&Token<'_>>) -> Option<Clause> {
    let followed_by_by = next.is_some_and(|t| t.is_word("BY"));
    let upper = token.text.to_ascii_uppercase();
    let clause = match upper.as_str() {
        "SELECT" => Clause::Select,
        "FROM" | "JOIN" | "USING" => Clause::From,
        "ON" => Clause::JoinOn,
        "WHERE" => Clause::Where,
        "GROUP" if followed_by_by => Clause::GroupBy,
        "HAVING" => Clause::Having,
        "WINDOW" => Clause::Window,
        "PARTITION" if followed_by_by => Clause::Window,
        "QUALIFY" => Clause::Qualify,
        "ORDER" if followed_by_by => Clause::OrderBy,
        "LIMIT" | "OFFSET" | "FETCH" => Clause::Limit,
        "VALUES" => Clause::Values,
        "SET" => Clause::Set,
        "RETURNING" => Clause::Returning,
        "UNION" | "INTERSECT" | "EXCEPT" | "INSERT" | "UPDATE" | "DELETE" | "WITH" => Clause::Statement,
        _ => return None,
    };
    Some(clause)
}
