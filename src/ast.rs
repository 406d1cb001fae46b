//! Compiled operator data model.
//!
//! Everything a rewrite needs is plain data: a closed set of structural node
//! kinds interpreted by one generic matcher.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::template::OutputTemplate;

/// How an operator consumes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// One value in, one value out.
    #[default]
    Scalar,
    /// Many values in, one value out; clause restricted.
    Aggregate,
    /// Many values in, bucketed; computed once per distinct capture.
    Dimension,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::Dimension => write!(f, "dimension"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CaptureKind {
    /// Any balanced expression.
    Expression,
    /// Exactly one quoted literal or parameter placeholder.
    StringLiteral,
}

/// A named placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub binding: String,
    pub kind: CaptureKind,
}

/// One or more literal words matched as a unit.
///
/// Words compare case-insensitively; symbol and punctuation words compare
/// exactly. Whitespace and comments between words are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Keyword {
    pub words: Vec<String>,
}

impl Keyword {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    pub fn first(&self) -> &str {
        self.words.first().map_or("", String::as_str)
    }

    /// Number of word-like entries (identifiers), ignoring symbols.
    pub fn word_count(&self) -> usize {
        self.words.iter().filter(|w| is_wordlike(w)).count()
    }

    /// True when no entry is an identifier-like word.
    pub fn is_symbolic(&self) -> bool {
        self.word_count() == 0
    }

    pub fn phrase(&self) -> String {
        self.words.join(" ")
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.phrase())
    }
}

/// Identifier-like (starts with a letter or underscore).
pub fn is_wordlike(word: &str) -> bool {
    word.chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Element {
    Capture(Capture),
    Keyword(Keyword),
}

impl Element {
    pub fn as_keyword(&self) -> Option<&Keyword> {
        match self {
            Self::Keyword(k) => Some(k),
            Self::Capture(_) => None,
        }
    }

    pub fn as_capture(&self) -> Option<&Capture> {
        match self {
            Self::Capture(c) => Some(c),
            Self::Keyword(_) => None,
        }
    }
}

/// Structural class of a flat pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StructuralClass {
    /// `NAME(capture, ...)`
    FunctionCall,
    /// Keywords made only of operator symbols.
    SymbolInfix,
    /// Keywords containing at least one word.
    WordInfix,
}

/// One compiled template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pattern {
    pub template: String,
    pub structure: Vec<Element>,
    pub class: StructuralClass,
}

impl Pattern {
    pub fn captures(&self) -> impl Iterator<Item = &Capture> {
        self.structure.iter().filter_map(Element::as_capture)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &Keyword> {
        self.structure.iter().filter_map(Element::as_keyword)
    }

    /// Word count across every keyword (1 for function calls).
    pub fn phrase_len(&self) -> usize {
        match self.class {
            StructuralClass::FunctionCall => 1,
            StructuralClass::SymbolInfix => self.keywords().map(|k| k.words.len()).sum(),
            StructuralClass::WordInfix => self.keywords().map(Keyword::word_count).sum(),
        }
    }

    /// Keyword the pattern starts with, if it does not start with a capture.
    pub fn leading_keyword(&self) -> Option<&Keyword> {
        self.structure.first().and_then(Element::as_keyword)
    }

    /// First keyword anywhere in the structure.
    pub fn trigger(&self) -> Option<&Keyword> {
        self.keywords().next()
    }
}

/// Node of a block operator's structure tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BlockNode {
    Capture(Capture),
    Keyword(Keyword),
    Repeat { min: usize, inner: Vec<BlockNode> },
    Optional { inner: Vec<BlockNode> },
}

impl BlockNode {
    /// Keyword this node must start with, if any.
    pub fn leading_keyword(&self) -> Option<&Keyword> {
        match self {
            Self::Keyword(k) => Some(k),
            Self::Capture(_) => None,
            Self::Repeat { inner, .. } | Self::Optional { inner } => {
                inner.first().and_then(BlockNode::leading_keyword)
            }
        }
    }

    /// Whether the node may match zero tokens.
    pub fn is_nullable(&self) -> bool {
        match self {
            Self::Optional { .. } => true,
            Self::Repeat { min, .. } => *min == 0,
            Self::Capture(_) | Self::Keyword(_) => false,
        }
    }
}

/// How a matched block is folded into one expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockOutput {
    /// Emitted once per repeat element; `{{rest}}` is the fold of the rest.
    pub branch: OutputTemplate,
    /// Final value when all of its bindings were captured.
    pub fallback: Option<OutputTemplate>,
    /// Final value otherwise.
    pub otherwise: OutputTemplate,
}

/// A structured multi-keyword operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSpec {
    pub start: Keyword,
    pub end: Keyword,
    pub structure: Vec<BlockNode>,
    pub output: BlockOutput,
}

/// Where an operator came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum Origin {
    Builtin,
    User(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin => write!(f, "builtin"),
            Self::User(source) => write!(f, "user:{source}"),
        }
    }
}

/// Declared argument of the target function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: Option<String>,
    /// Literal SQL used when no pattern binds this argument.
    #[serde(default)]
    pub default: Option<String>,
}

/// A fully compiled operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorSpec {
    pub name: String,
    pub shape: Shape,
    pub patterns: Vec<Pattern>,
    pub block: Option<BlockSpec>,
    pub output_template: OutputTemplate,
    pub context_arg: Option<String>,
    pub cache: bool,
    pub precedence: i32,
    pub args: Vec<ArgSpec>,
    pub returns: Option<String>,
    pub origin: Origin,
    /// Global declaration order across all sources of one load.
    pub sequence: usize,
}

/// Priority tier, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Tier {
    FunctionCall,
    SymbolInfix,
    SingleWordInfix,
    MultiWordInfix,
    Dimension,
    Block,
}

impl Tier {
    pub fn of(shape: Shape, pattern: &Pattern) -> Self {
        if shape == Shape::Dimension {
            return Self::Dimension;
        }
        match pattern.class {
            StructuralClass::FunctionCall => Self::FunctionCall,
            StructuralClass::SymbolInfix => Self::SymbolInfix,
            StructuralClass::WordInfix if pattern.phrase_len() > 1 => Self::MultiWordInfix,
            StructuralClass::WordInfix => Self::SingleWordInfix,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FunctionCall => "function",
            Self::SymbolInfix => "symbol",
            Self::SingleWordInfix => "word",
            Self::MultiWordInfix => "multi-word",
            Self::Dimension => "dimension",
            Self::Block => "block",
        };
        f.write_str(s)
    }
}

/// Derived priority; greater sorts first.
///
/// Field order is the comparison order: tier, then keyword phrase length, then
/// the explicit precedence. Remaining ties go to the registry's tie-break rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Priority {
    pub tier: Tier,
    pub phrase_len: usize,
    pub precedence: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let block = Priority {
            tier: Tier::Block,
            phrase_len: 1,
            precedence: 0,
        };
        let long = Priority {
            tier: Tier::MultiWordInfix,
            phrase_len: 3,
            precedence: 0,
        };
        let short = Priority {
            tier: Tier::MultiWordInfix,
            phrase_len: 2,
            precedence: 10,
        };
        let func = Priority {
            tier: Tier::FunctionCall,
            phrase_len: 1,
            precedence: 100,
        };
        assert!(block > long);
        assert!(long > short);
        assert!(short > func);
    }

    #[test]
    fn test_keyword_word_count() {
        assert_eq!(Keyword::new(["ALIGNS", "WITH"]).word_count(), 2);
        assert!(Keyword::new(["<~>"]).is_symbolic());
        assert!(!Keyword::new(["IS", "~"]).is_symbolic());
    }

    #[test]
    fn test_nullable_nodes() {
        let optional = BlockNode::Optional {
            inner: vec![BlockNode::Keyword(Keyword::new(["ELSE"]))],
        };
        assert!(optional.is_nullable());
        assert_eq!(optional.leading_keyword().map(Keyword::first), Some("ELSE"));
        let repeat = BlockNode::Repeat {
            min: 1,
            inner: vec![BlockNode::Keyword(Keyword::new(["WHEN"]))],
        };
        assert!(!repeat.is_nullable());
    }
}
