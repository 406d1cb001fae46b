//! Template compiler.
//!
//! Turns a declaration template into a flat structural pattern:
//!
//! ```text
//! {{text}} ALIGNS WITH '{{narrative}}'
//! ───┬──── ─────┬───── ──────┬───────
//!    │          │            └── Capture(narrative, StringLiteral)
//!    │          └── Keyword[ALIGNS, WITH]
//!    └── Capture(text, Expression)
//! ```
//!
//! Literal text is lexed with the query tokenizer, so keyword words follow the
//! same boundaries the matcher sees at rewrite time.

use std::collections::HashSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::ast::{Capture, CaptureKind, Element, Keyword, Pattern, StructuralClass, is_wordlike};
use crate::error::{CompileError, CompileErrorKind};
use crate::tokenizer::tokenize;

enum Part<'a> {
    Literal { text: &'a str },
    Capture { capture: Capture, start: usize },
}

/// Compile one template string into a pattern.
pub fn compile(template: &str) -> Result<Pattern, CompileError> {
    let parts = split_parts(template)?;

    let mut structure: Vec<Element> = Vec::new();
    let mut seen = HashSet::new();

    for part in parts {
        match part {
            Part::Literal { text } => {
                let words = literal_words(text);
                if !words.is_empty() {
                    structure.push(Element::Keyword(Keyword { words }));
                }
            }
            Part::Capture { capture, start } => {
                if matches!(structure.last(), Some(Element::Capture(_))) {
                    return Err(CompileError::new(CompileErrorKind::AmbiguousCapture, start, template));
                }
                if !seen.insert(capture.binding.clone()) {
                    return Err(CompileError::new(CompileErrorKind::DuplicateCapture, start, template));
                }
                structure.push(Element::Capture(capture));
            }
        }
    }

    if !structure.iter().any(|e| matches!(e, Element::Keyword(_))) {
        return Err(CompileError::new(CompileErrorKind::EmptyKeyword, 0, template));
    }

    let class = classify(&structure);
    Ok(Pattern {
        template: template.to_string(),
        structure,
        class,
    })
}

/// Compile a keyword-only phrase such as a block's start or end keyword.
pub fn compile_keyword(phrase: &str) -> Result<Keyword, CompileError> {
    if phrase.contains("{{") || phrase.contains("}}") {
        let position = phrase.find("{{").or_else(|| phrase.find("}}")).unwrap_or(0);
        return Err(CompileError::new(CompileErrorKind::UnbalancedBraces, position, phrase));
    }
    let words = literal_words(phrase);
    if words.is_empty() {
        return Err(CompileError::new(CompileErrorKind::EmptyKeyword, 0, phrase));
    }
    Ok(Keyword { words })
}

/// Split a template into literal runs and captures.
fn split_parts(template: &str) -> Result<Vec<Part<'_>>, CompileError> {
    let unbalanced = |at| CompileError::new(CompileErrorKind::UnbalancedBraces, at, template);

    let mut parts = Vec::new();
    let mut literal_start = 0;

    loop {
        let rest = &template[literal_start..];
        let open = rest.find("{{").map(|i| literal_start + i);
        let close = rest.find("}}").map(|i| literal_start + i);

        let (open, close) = match (open, close) {
            (None, None) => break,
            (None, Some(c)) => return Err(unbalanced(c)),
            (Some(o), None) => return Err(unbalanced(o)),
            (Some(o), Some(c)) if c < o => return Err(unbalanced(c)),
            (Some(o), Some(c)) => (o, c),
        };

        let raw_name = &template[open + 2..close];
        if raw_name.contains("{{") {
            return Err(unbalanced(open));
        }

        // '{{name}}' forces a string-literal capture.
        let quoted = open > literal_start
            && template[..open].ends_with('\'')
            && template[close + 2..].starts_with('\'');
        let (literal_end, next) = if quoted {
            (open - 1, close + 3)
        } else {
            (open, close + 2)
        };

        parts.push(Part::Literal {
            text: &template[literal_start..literal_end],
        });

        let name = raw_name.trim();
        if !is_binding_name(name) {
            return Err(CompileError::new(CompileErrorKind::InvalidCaptureName, open, template));
        }
        parts.push(Part::Capture {
            capture: Capture {
                binding: name.to_string(),
                kind: if quoted {
                    CaptureKind::StringLiteral
                } else {
                    CaptureKind::Expression
                },
            },
            start: if quoted { open - 1 } else { open },
        });

        literal_start = next;
    }

    parts.push(Part::Literal {
        text: &template[literal_start..],
    });
    Ok(parts)
}

fn literal_words(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !t.is_trivia())
        .map(|t| t.text.to_string())
        .collect()
}

pub(crate) fn is_binding_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn classify(structure: &[Element]) -> StructuralClass {
    if is_function_call(structure) {
        return StructuralClass::FunctionCall;
    }
    let symbolic = structure
        .iter()
        .filter_map(Element::as_keyword)
        .all(Keyword::is_symbolic);
    if symbolic {
        StructuralClass::SymbolInfix
    } else {
        StructuralClass::WordInfix
    }
}

/// `NAME ( capture (, capture)* )`
fn is_function_call(structure: &[Element]) -> bool {
    let (Some(Element::Keyword(head)), Some(Element::Keyword(tail))) = (structure.first(), structure.last())
    else {
        return false;
    };
    if structure.len() < 3
        || head.words.len() != 2
        || !is_wordlike(&head.words[0])
        || head.words[1] != "("
        || tail.words != [")"]
    {
        return false;
    }
    structure[1..structure.len() - 1]
        .iter()
        .enumerate()
        .all(|(i, element)| match element {
            Element::Capture(_) => i % 2 == 0,
            Element::Keyword(k) => i % 2 == 1 && k.words == [","],
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Binding(String),
}

/// An output skeleton such as `semantic_matches({{a}}, {{b}})`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl OutputTemplate {
    pub fn parse(source: &str) -> Result<Self, CompileError> {
        let unbalanced = |at| CompileError::new(CompileErrorKind::UnbalancedBraces, at, source);

        let mut segments = Vec::new();
        let mut cursor = 0;
        while let Some(offset) = source[cursor..].find("{{") {
            let open = cursor + offset;
            if let Some(stray) = source[cursor..open].find("}}") {
                return Err(unbalanced(cursor + stray));
            }
            let close = source[open + 2..]
                .find("}}")
                .map(|i| open + 2 + i)
                .ok_or_else(|| unbalanced(open))?;
            let name = source[open + 2..close].trim();
            if !is_binding_name(name) {
                return Err(CompileError::new(CompileErrorKind::InvalidCaptureName, open, source));
            }
            if open > cursor {
                segments.push(Segment::Text(source[cursor..open].to_string()));
            }
            segments.push(Segment::Binding(name.to_string()));
            cursor = close + 2;
        }
        if let Some(stray) = source[cursor..].find("}}") {
            return Err(unbalanced(cursor + stray));
        }
        if cursor < source.len() {
            segments.push(Segment::Text(source[cursor..].to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// `function({{arg1}}, {{arg2}}, ...)`
    pub fn call<S: AsRef<str>>(function: &str, args: &[S]) -> Result<Self, CompileError> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        Self::parse(&format!("{}({})", function, args.join(", ")))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn bindings(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Binding(name) => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Substitute bindings; unbound names render as `NULL`.
    pub fn render<F>(&self, mut value: F) -> String
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Binding(name) => match value(name) {
                    Some(v) => out.push_str(&v),
                    None => out.push_str("NULL"),
                },
            }
        }
        out
    }

    /// Output text with every binding replaced by `value`.
    pub fn sample(&self, value: &str) -> String {
        self.render(|_| Some(value.to_string()))
    }
}

impl fmt::Display for OutputTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for OutputTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}
