//! Block operator matching.
//!
//! A block is a start keyword, a structure tree and an end keyword:
//!
//! ```text
//! SEMANTIC CASE {{subject}} (WHEN {{condition}} THEN {{result}})+ [ELSE {{default}}] END
//! ```
//!
//! Matching never backtracks. Each capture stops at the keywords that may
//! follow it (its follow set), so a repeat element ends where the next
//! element, an optional tail or the end keyword begins. Any structural
//! mismatch aborts the whole block.

use std::collections::HashMap;
use std::ops::Range;

use crate::ast::{BlockNode, BlockOutput, BlockSpec, CaptureKind, Keyword};
use crate::decl::REST_BINDING;
use crate::rewriter::{literal_at, match_keyword, next_significant, scan_expression};
use crate::tokenizer::Token;

/// Captured token ranges, in match order.
pub type Bindings = Vec<(String, Range<usize>)>;

/// A successful block match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMatch {
    /// Token index just past the end keyword.
    pub end: usize,
    /// Captures outside any repeat.
    pub top: Bindings,
    /// Captures of each repeat element.
    pub branches: Vec<Bindings>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Top,
    Branch,
}

impl BlockMatch {
    fn bind(&mut self, target: Target, binding: &str, range: Range<usize>) {
        let entry = (binding.to_string(), range);
        match (target, self.branches.last_mut()) {
            (Target::Branch, Some(branch)) => branch.push(entry),
            _ => self.top.push(entry),
        }
    }
}

/// Matches one block operator's structure against a token stream.
#[derive(Debug, Clone, Copy)]
pub struct BlockOperatorEngine<'s> {
    spec: &'s BlockSpec,
}

impl<'s> BlockOperatorEngine<'s> {
    pub fn new(spec: &'s BlockSpec) -> Self {
        Self { spec }
    }

    /// Match the whole block starting at token `start`, not reading past `end`.
    pub fn match_at(&self, tokens: &[Token<'_>], start: usize, end: usize) -> Option<BlockMatch> {
        let mut state = BlockMatch::default();
        let pos = match_keyword(tokens, start, end, &self.spec.start)?;
        let pos = self.match_nodes(tokens, &self.spec.structure, pos, end, &[&self.spec.end], &mut state, Target::Top)?;
        let at = next_significant(tokens, pos, end)?;
        state.end = match_keyword(tokens, at, end, &self.spec.end)?;
        Some(state)
    }

    #[allow(clippy::too_many_arguments)]
    fn match_nodes(
        &self,
        tokens: &[Token<'_>],
        nodes: &'s [BlockNode],
        mut pos: usize,
        end: usize,
        follow: &[&'s Keyword],
        state: &mut BlockMatch,
        target: Target,
    ) -> Option<usize> {
        for (k, node) in nodes.iter().enumerate() {
            match node {
                BlockNode::Keyword(keyword) => {
                    let at = next_significant(tokens, pos, end)?;
                    pos = match_keyword(tokens, at, end, keyword)?;
                }
                BlockNode::Capture(capture) => {
                    let at = next_significant(tokens, pos, end)?;
                    let range = match capture.kind {
                        CaptureKind::StringLiteral => literal_at(tokens, at)?,
                        CaptureKind::Expression => {
                            let stops = follow_set(&nodes[k + 1..], follow);
                            scan_expression(tokens, at, end, &stops, true)?
                        }
                    };
                    pos = range.end;
                    state.bind(target, &capture.binding, range);
                }
                BlockNode::Repeat { min, inner } => {
                    let lead = node.leading_keyword()?;
                    let mut inner_follow = follow_set(&nodes[k + 1..], follow);
                    inner_follow.push(lead);

                    let mut count = 0;
                    while let Some(at) = self.starts_with(tokens, pos, end, lead) {
                        state.branches.push(Vec::new());
                        // A started element that fails aborts the block.
                        pos = self.match_nodes(tokens, inner, at, end, &inner_follow, state, Target::Branch)?;
                        count += 1;
                    }
                    if count < *min {
                        return None;
                    }
                }
                BlockNode::Optional { inner } => {
                    let lead = node.leading_keyword()?;
                    if let Some(at) = self.starts_with(tokens, pos, end, lead) {
                        let inner_follow = follow_set(&nodes[k + 1..], follow);
                        pos = self.match_nodes(tokens, inner, at, end, &inner_follow, state, target)?;
                    }
                }
            }
        }
        Some(pos)
    }

    fn starts_with(&self, tokens: &[Token<'_>], pos: usize, end: usize, keyword: &Keyword) -> Option<usize> {
        let at = next_significant(tokens, pos, end)?;
        match_keyword(tokens, at, end, keyword).map(|_| at)
    }
}

/// Keywords that can directly follow a node, given the nodes after it.
fn follow_set<'k>(rest: &'k [BlockNode], outer: &[&'k Keyword]) -> Vec<&'k Keyword> {
    let mut set = Vec::new();
    for node in rest {
        if let Some(keyword) = node.leading_keyword() {
            set.push(keyword);
        }
        if !node.is_nullable() {
            return set;
        }
    }
    set.extend(outer.iter().copied());
    set
}

/// Fold rendered captures into one expression.
///
/// `branch` is applied from the last repeat element outwards, each time with
/// `{{rest}}` bound to the fold so far; the innermost value is `fallback` when
/// all of its bindings were captured, `otherwise` if not.
pub fn fold(output: &BlockOutput, top: &HashMap<String, String>, branches: &[HashMap<String, String>]) -> String {
    let last = match &output.fallback {
        Some(fallback) if fallback.bindings().all(|b| top.contains_key(b)) => {
            fallback.render(|b| top.get(b).cloned())
        }
        _ => output.otherwise.render(|b| top.get(b).cloned()),
    };

    branches.iter().rev().fold(last, |rest, branch| {
        output.branch.render(|b| {
            if b == REST_BINDING {
                Some(rest.clone())
            } else {
                branch.get(b).or_else(|| top.get(b)).cloned()
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Origin;
    use crate::decl::{OperatorDecl, compile_operator};
    use crate::tokenizer::tokenize;

    const CASE: &str = r#"
block:
  start: SEMANTIC CASE
  end: END
  structure:
    - capture: subject
    - repeat:
        min: 1
        pattern: "WHEN {{condition}} THEN {{result}}"
    - optional:
        pattern: "ELSE {{default}}"
  output:
    branch: "CASE WHEN m({{subject}}, {{condition}}) THEN {{result}} ELSE {{rest}} END"
    fallback: "{{default}}"
"#;

    fn spec() -> BlockSpec {
        let decl: OperatorDecl = serde_yaml::from_str(CASE).unwrap();
        compile_operator("semantic_case", &decl, Origin::Builtin, 0)
            .unwrap()
            .block
            .unwrap()
    }

    fn texts(tokens: &[Token<'_>], bindings: &Bindings) -> Vec<(String, String)> {
        bindings
            .iter()
            .map(|(name, range)| {
                let text: String = tokens[range.clone()].iter().map(|t| t.text).collect();
                (name.clone(), text)
            })
            .collect()
    }

    #[test]
    fn test_match_with_else() {
        let spec = spec();
        let sql = "SEMANTIC CASE body WHEN 'refund' THEN 'billing' WHEN 'crash' THEN 'bug' ELSE 'other' END";
        let tokens = tokenize(sql);
        let m = BlockOperatorEngine::new(&spec).match_at(&tokens, 0, tokens.len()).unwrap();
        assert_eq!(m.end, tokens.len());
        assert_eq!(m.branches.len(), 2);
        assert_eq!(
            texts(&tokens, &m.top),
            vec![
                ("subject".to_string(), "body".to_string()),
                ("default".to_string(), "'other'".to_string())
            ]
        );
        assert_eq!(
            texts(&tokens, &m.branches[1]),
            vec![
                ("condition".to_string(), "'crash'".to_string()),
                ("result".to_string(), "'bug'".to_string())
            ]
        );
    }

    #[test]
    fn test_nested_case_in_result() {
        let spec = spec();
        let sql = "SEMANTIC CASE b WHEN 'x' THEN CASE WHEN y THEN 1 ELSE 2 END END";
        let tokens = tokenize(sql);
        let m = BlockOperatorEngine::new(&spec).match_at(&tokens, 0, tokens.len()).unwrap();
        assert_eq!(
            texts(&tokens, &m.branches[0])[1].1,
            "CASE WHEN y THEN 1 ELSE 2 END"
        );
    }

    #[test]
    fn test_min_unmet_aborts() {
        let spec = spec();
        let tokens = tokenize("SEMANTIC CASE body ELSE 'other' END");
        assert!(BlockOperatorEngine::new(&spec).match_at(&tokens, 0, tokens.len()).is_none());
    }

    #[test]
    fn test_missing_end_aborts() {
        let spec = spec();
        let tokens = tokenize("SEMANTIC CASE body WHEN 'a' THEN 'b'");
        assert!(BlockOperatorEngine::new(&spec).match_at(&tokens, 0, tokens.len()).is_none());
    }

    #[test]
    fn test_partial_element_aborts() {
        let spec = spec();
        let tokens = tokenize("SEMANTIC CASE body WHEN 'a' END");
        assert!(BlockOperatorEngine::new(&spec).match_at(&tokens, 0, tokens.len()).is_none());
    }

    #[test]
    fn test_fold() {
        let spec = spec();
        let top: HashMap<String, String> = [("subject".to_string(), "body".to_string())].into();
        let branches = vec![
            HashMap::from([
                ("condition".to_string(), "'a'".to_string()),
                ("result".to_string(), "1".to_string()),
            ]),
            HashMap::from([
                ("condition".to_string(), "'b'".to_string()),
                ("result".to_string(), "2".to_string()),
            ]),
        ];
        assert_eq!(
            fold(&spec.output, &top, &branches),
            "CASE WHEN m(body, 'a') THEN 1 ELSE CASE WHEN m(body, 'b') THEN 2 ELSE NULL END END"
        );

        let mut with_default = top.clone();
        with_default.insert("default".to_string(), "0".to_string());
        assert_eq!(
            fold(&spec.output, &with_default, &branches[..1]),
            "CASE WHEN m(body, 'a') THEN 1 ELSE 0 END"
        );
    }

    #[test]
    fn test_follow_set_skips_nullable() {
        let spec = spec();
        let follow = follow_set(&spec.structure[2..], &[&spec.end]);
        let phrases: Vec<String> = follow.iter().map(|k| k.phrase()).collect();
        assert_eq!(phrases, vec!["ELSE", "END"]);
    }
}
