//! Operator declarations.
//!
//! Declarations are plain YAML mappings from operator name to definition:
//!
//! ```yaml
//! semantic_matches:
//!   patterns: ["{{a}} MEANS {{b}}"]
//!   args: [{name: a, type: VARCHAR}, {name: b, type: VARCHAR}]
//!   returns: BOOLEAN
//!   cache: true
//! ```
//!
//! Each entry is deserialized and compiled on its own, so one malformed
//! operator never prevents the others from loading.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::ast::{
    ArgSpec, BlockNode, BlockOutput, BlockSpec, Capture, CaptureKind, Element, OperatorSpec, Origin,
    Pattern, Shape,
};
use crate::error::RegistryLoadError;
use crate::template::{OutputTemplate, compile, compile_keyword, is_binding_name};

/// Binding that receives the fold of the remaining block branches.
pub const REST_BINDING: &str = "rest";

/// One operator as written in a declaration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorDecl {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub context_arg: Option<String>,
    #[serde(default)]
    pub cache: bool,
    /// Explicit tie-break between patterns of equal class and phrase length.
    #[serde(default)]
    pub precedence: i32,
    /// Output template override; defaults to `name(args...)`.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub returns: Option<String>,
    #[serde(default)]
    pub block: Option<BlockDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockDecl {
    pub start: String,
    pub end: String,
    pub structure: Vec<NodeDecl>,
    pub output: BlockOutputDecl,
}

/// One structure node; exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDecl {
    /// Expression capture.
    #[serde(default)]
    pub capture: Option<String>,
    /// String-literal capture.
    #[serde(default)]
    pub literal: Option<String>,
    #[serde(default)]
    pub keyword: Option<String>,
    /// Flat template spliced in place.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub repeat: Option<GroupDecl>,
    #[serde(default)]
    pub optional: Option<GroupDecl>,
}

/// Body of a `repeat` or `optional` node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDecl {
    #[serde(default)]
    pub min: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub structure: Vec<NodeDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockOutputDecl {
    pub branch: String,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default = "default_otherwise")]
    pub otherwise: String,
}

fn default_otherwise() -> String {
    "NULL".to_string()
}

/// Result of reading one declaration document.
#[derive(Debug, Default)]
pub struct ParsedDocument {
    pub operators: Vec<(String, OperatorDecl)>,
    pub errors: Vec<RegistryLoadError>,
}

/// Parse a YAML document of operator declarations.
///
/// The document is either a mapping of operators or a mapping with a single
/// `operators` key holding one. Fails only when the document itself is not a
/// mapping; bad entries are reported in `errors`.
pub fn parse_document(text: &str, source_id: &str) -> Result<ParsedDocument, RegistryLoadError> {
    let source_error = |message: String| RegistryLoadError::Source {
        source_id: source_id.to_string(),
        message,
    };

    let value: Value = serde_yaml::from_str(text).map_err(|e| source_error(e.to_string()))?;
    let mut mapping = match value {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        other => return Err(source_error(format!("expected a mapping, found {}", kind_name(&other)))),
    };
    if mapping.len() == 1 {
        if let Some(Value::Mapping(inner)) = mapping.get("operators") {
            mapping = inner.clone();
        }
    }

    let mut doc = ParsedDocument::default();
    for (key, value) in mapping {
        let name = match key {
            Value::String(name) => name,
            other => {
                doc.errors.push(RegistryLoadError::Malformed {
                    operator: format!("{other:?}"),
                    source_id: source_id.to_string(),
                    message: "operator names must be strings".to_string(),
                });
                continue;
            }
        };
        match serde_yaml::from_value::<OperatorDecl>(value) {
            Ok(decl) => doc.operators.push((name, decl)),
            Err(e) => doc.errors.push(RegistryLoadError::Malformed {
                operator: name,
                source_id: source_id.to_string(),
                message: e.to_string(),
            }),
        }
    }
    Ok(doc)
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Compile one declaration into an operator spec.
pub fn compile_operator(
    name: &str,
    decl: &OperatorDecl,
    origin: Origin,
    sequence: usize,
) -> Result<OperatorSpec, RegistryLoadError> {
    let malformed = |message: &str| RegistryLoadError::Malformed {
        operator: name.to_string(),
        source_id: origin.to_string(),
        message: message.to_string(),
    };

    if name.trim().is_empty() {
        return Err(malformed("operator name is empty"));
    }
    for arg in &decl.args {
        if !is_binding_name(&arg.name) {
            return Err(malformed(&format!("argument name '{}' is not an identifier", arg.name)));
        }
    }

    let (patterns, block, output_template) = match &decl.block {
        Some(block_decl) => {
            if !decl.patterns.is_empty() {
                return Err(invalid_block(name, "block operators take no patterns"));
            }
            if decl.shape != Shape::Scalar {
                return Err(invalid_block(name, "block operators must be scalar"));
            }
            let block = compile_block(name, block_decl)?;
            let output = block.output.branch.clone();
            (Vec::new(), Some(block), output)
        }
        None => {
            if decl.patterns.is_empty() {
                return Err(malformed("no patterns declared"));
            }
            let patterns = decl
                .patterns
                .iter()
                .map(|template| {
                    compile(template).map_err(|error| RegistryLoadError::Compile {
                        operator: name.to_string(),
                        error,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let output = output_template(name, decl, &patterns)?;
            (patterns, None, output)
        }
    };

    if matches!(decl.shape, Shape::Aggregate | Shape::Dimension) {
        let bound_everywhere = decl.context_arg.as_deref().is_some_and(|arg| {
            patterns
                .iter()
                .all(|p| p.captures().any(|c| c.binding == arg))
        });
        if !bound_everywhere {
            return Err(RegistryLoadError::MissingContextArg {
                operator: name.to_string(),
                shape: decl.shape.to_string(),
            });
        }
    }

    Ok(OperatorSpec {
        name: name.to_string(),
        shape: decl.shape,
        patterns,
        block,
        output_template,
        context_arg: decl.context_arg.clone(),
        cache: decl.cache,
        precedence: decl.precedence,
        args: decl.args.clone(),
        returns: decl.returns.clone(),
        origin,
        sequence,
    })
}

/// Output template for a flat operator, checked against its captures.
fn output_template(
    name: &str,
    decl: &OperatorDecl,
    patterns: &[Pattern],
) -> Result<OutputTemplate, RegistryLoadError> {
    let compile_error = |error| RegistryLoadError::Compile {
        operator: name.to_string(),
        error,
    };

    let template = match &decl.output {
        Some(source) => OutputTemplate::parse(source).map_err(compile_error)?,
        None if decl.args.is_empty() => {
            // Bindings in order of first appearance.
            let mut seen = HashSet::new();
            let bindings: Vec<String> = patterns
                .iter()
                .flat_map(Pattern::captures)
                .filter(|c| seen.insert(c.binding.clone()))
                .map(|c| format!("{{{{{}}}}}", c.binding))
                .collect();
            OutputTemplate::call(name, &bindings).map_err(compile_error)?
        }
        None => {
            let bindings: Vec<String> = decl.args.iter().map(|a| format!("{{{{{}}}}}", a.name)).collect();
            OutputTemplate::call(name, &bindings).map_err(compile_error)?
        }
    };

    for binding in template.bindings() {
        let captured = patterns.iter().any(|p| p.captures().any(|c| c.binding == binding));
        let defaulted = decl
            .args
            .iter()
            .any(|a| a.name == binding && a.default.is_some());
        if !captured && !defaulted {
            return Err(RegistryLoadError::UnknownBinding {
                operator: name.to_string(),
                binding: binding.to_string(),
            });
        }
    }
    Ok(template)
}

fn invalid_block(name: &str, message: &str) -> RegistryLoadError {
    RegistryLoadError::InvalidBlock {
        operator: name.to_string(),
        message: message.to_string(),
    }
}

fn compile_block(name: &str, decl: &BlockDecl) -> Result<BlockSpec, RegistryLoadError> {
    let compile_error = |error| RegistryLoadError::Compile {
        operator: name.to_string(),
        error,
    };

    let start = compile_keyword(&decl.start).map_err(compile_error)?;
    let end = compile_keyword(&decl.end).map_err(compile_error)?;
    let structure = compile_nodes(name, &decl.structure, 0)?;

    let mut ordered = vec![BlockNode::Keyword(start.clone())];
    ordered.extend(structure.iter().cloned());
    ordered.push(BlockNode::Keyword(end.clone()));
    check_adjacent_captures(name, &ordered)?;

    let repeats = structure
        .iter()
        .filter(|n| matches!(n, BlockNode::Repeat { .. }))
        .count();
    if repeats > 1 {
        return Err(invalid_block(name, "at most one repeat node is allowed"));
    }

    let mut top_level = HashSet::new();
    let mut branch_level = HashSet::new();
    collect_bindings(&structure, &mut top_level, &mut branch_level, false);
    let mut all: HashSet<String> = top_level.union(&branch_level).cloned().collect();
    if all.contains(REST_BINDING) {
        return Err(invalid_block(name, "'rest' is reserved for the branch fold"));
    }

    let branch = OutputTemplate::parse(&decl.output.branch).map_err(compile_error)?;
    let fallback = decl
        .output
        .fallback
        .as_deref()
        .map(OutputTemplate::parse)
        .transpose()
        .map_err(compile_error)?;
    let otherwise = OutputTemplate::parse(&decl.output.otherwise).map_err(compile_error)?;

    let unknown = |template: &OutputTemplate, allowed: &HashSet<String>| {
        template
            .bindings()
            .find(|b| !allowed.contains(*b))
            .map(|b| RegistryLoadError::UnknownBinding {
                operator: name.to_string(),
                binding: b.to_string(),
            })
    };

    all.insert(REST_BINDING.to_string());
    if let Some(err) = unknown(&branch, &all) {
        return Err(err);
    }
    if let Some(err) = fallback.as_ref().and_then(|f| unknown(f, &top_level)) {
        return Err(err);
    }
    if let Some(err) = unknown(&otherwise, &top_level) {
        return Err(err);
    }

    Ok(BlockSpec {
        start,
        end,
        structure,
        output: BlockOutput {
            branch,
            fallback,
            otherwise,
        },
    })
}

fn compile_nodes(name: &str, decls: &[NodeDecl], repeat_depth: usize) -> Result<Vec<BlockNode>, RegistryLoadError> {
    let mut nodes = Vec::new();
    for decl in decls {
        let set = [
            decl.capture.is_some(),
            decl.literal.is_some(),
            decl.keyword.is_some(),
            decl.pattern.is_some(),
            decl.repeat.is_some(),
            decl.optional.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set != 1 {
            return Err(invalid_block(name, "each structure node needs exactly one field"));
        }

        if let Some(binding) = decl.capture.as_ref().or(decl.literal.as_ref()) {
            if !is_binding_name(binding) {
                return Err(invalid_block(name, &format!("'{binding}' is not a valid capture name")));
            }
            let kind = if decl.capture.is_some() {
                CaptureKind::Expression
            } else {
                CaptureKind::StringLiteral
            };
            nodes.push(BlockNode::Capture(Capture {
                binding: binding.clone(),
                kind,
            }));
        } else if let Some(phrase) = &decl.keyword {
            let keyword = compile_keyword(phrase).map_err(|error| RegistryLoadError::Compile {
                operator: name.to_string(),
                error,
            })?;
            nodes.push(BlockNode::Keyword(keyword));
        } else if let Some(template) = &decl.pattern {
            nodes.extend(pattern_nodes(name, template)?);
        } else if let Some(group) = &decl.repeat {
            if repeat_depth > 0 {
                return Err(invalid_block(name, "repeat nodes cannot nest"));
            }
            let inner = group_nodes(name, group, repeat_depth + 1)?;
            nodes.push(BlockNode::Repeat {
                min: group.min.unwrap_or(1),
                inner,
            });
        } else if let Some(group) = &decl.optional {
            if group.min.is_some() {
                return Err(invalid_block(name, "optional nodes take no min"));
            }
            let inner = group_nodes(name, group, repeat_depth)?;
            nodes.push(BlockNode::Optional { inner });
        }
    }
    Ok(nodes)
}

fn group_nodes(name: &str, group: &GroupDecl, repeat_depth: usize) -> Result<Vec<BlockNode>, RegistryLoadError> {
    let mut inner = Vec::new();
    if let Some(template) = &group.pattern {
        inner.extend(pattern_nodes(name, template)?);
    }
    inner.extend(compile_nodes(name, &group.structure, repeat_depth)?);
    if !matches!(inner.first(), Some(BlockNode::Keyword(_))) {
        return Err(invalid_block(name, "repeat and optional bodies must start with a keyword"));
    }
    Ok(inner)
}

fn pattern_nodes(name: &str, template: &str) -> Result<Vec<BlockNode>, RegistryLoadError> {
    let pattern = compile(template).map_err(|error| RegistryLoadError::Compile {
        operator: name.to_string(),
        error,
    })?;
    Ok(pattern
        .structure
        .into_iter()
        .map(|element| match element {
            Element::Capture(c) => BlockNode::Capture(c),
            Element::Keyword(k) => BlockNode::Keyword(k),
        })
        .collect())
}

/// Reject a capture that can be directly followed by another capture,
/// looking through nullable nodes.
fn check_adjacent_captures(name: &str, nodes: &[BlockNode]) -> Result<(), RegistryLoadError> {
    for (i, node) in nodes.iter().enumerate() {
        if let BlockNode::Capture(_) = node {
            for next in &nodes[i + 1..] {
                if starts_with_capture(next) {
                    return Err(ambiguous(name, node));
                }
                if !next.is_nullable() {
                    break;
                }
            }
        }
        if let BlockNode::Repeat { inner, .. } | BlockNode::Optional { inner } = node {
            check_adjacent_captures(name, inner)?;
        }
    }
    Ok(())
}

fn starts_with_capture(node: &BlockNode) -> bool {
    match node {
        BlockNode::Capture(_) => true,
        BlockNode::Keyword(_) => false,
        BlockNode::Repeat { inner, .. } | BlockNode::Optional { inner } => {
            inner.first().is_some_and(starts_with_capture)
        }
    }
}

fn ambiguous(name: &str, node: &BlockNode) -> RegistryLoadError {
    let binding = match node {
        BlockNode::Capture(c) => c.binding.clone(),
        _ => "group".to_string(),
    };
    invalid_block(name, &format!("ambiguous capture boundary after '{binding}'"))
}

fn collect_bindings(
    nodes: &[BlockNode],
    top_level: &mut HashSet<String>,
    branch_level: &mut HashSet<String>,
    in_repeat: bool,
) {
    for node in nodes {
        match node {
            BlockNode::Capture(c) => {
                if in_repeat {
                    branch_level.insert(c.binding.clone());
                } else {
                    top_level.insert(c.binding.clone());
                }
            }
            BlockNode::Keyword(_) => {}
            BlockNode::Repeat { inner, .. } => collect_bindings(inner, top_level, branch_level, true),
            BlockNode::Optional { inner } => collect_bindings(inner, top_level, branch_level, in_repeat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Keyword;

    const DOC: &str = r#"
semantic_matches:
  patterns: ["{{a}} MEANS {{b}}"]
  args:
    - {name: a, type: VARCHAR}
    - {name: b, type: VARCHAR}
  returns: BOOLEAN
  cache: true
broken:
  patterns: 42
semantic_summarize:
  patterns: ["SUMMARIZE({{texts}})"]
  shape: aggregate
  context_arg: texts
"#;

    fn decl(yaml: &str) -> OperatorDecl {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_document_isolates_errors() {
        let doc = parse_document(DOC, "test.yaml").unwrap();
        let names: Vec<&str> = doc.operators.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["semantic_matches", "semantic_summarize"]);
        assert_eq!(doc.errors.len(), 1);
        assert_eq!(doc.errors[0].operator(), Some("broken"));
    }

    #[test]
    fn test_parse_document_wrapped() {
        let doc = parse_document("operators:\n  f:\n    patterns: ['{{a}} F {{b}}']\n", "w.yaml").unwrap();
        assert_eq!(doc.operators.len(), 1);
        assert_eq!(doc.operators[0].0, "f");
    }

    #[test]
    fn test_parse_document_not_a_mapping() {
        let err = parse_document("- a\n- b\n", "list.yaml").unwrap_err();
        assert!(matches!(err, RegistryLoadError::Source { .. }));
    }

    #[test]
    fn test_compile_derives_output_from_args() {
        let doc = parse_document(DOC, "test.yaml").unwrap();
        let (name, d) = &doc.operators[0];
        let spec = compile_operator(name, d, Origin::Builtin, 0).unwrap();
        assert_eq!(spec.output_template.as_str(), "semantic_matches({{a}}, {{b}})");
        assert!(spec.cache);
    }

    #[test]
    fn test_compile_derives_output_without_args() {
        let d = decl("patterns: ['{{text}} EXTRACTS {{pattern}}']");
        let spec = compile_operator("semantic_extract", &d, Origin::Builtin, 0).unwrap();
        assert_eq!(spec.output_template.as_str(), "semantic_extract({{text}}, {{pattern}})");
    }

    #[test]
    fn test_missing_context_arg() {
        let d = decl("patterns: ['SUMMARIZE({{texts}})']\nshape: aggregate");
        let err = compile_operator("s", &d, Origin::Builtin, 0).unwrap_err();
        assert!(matches!(err, RegistryLoadError::MissingContextArg { .. }));

        let d = decl("patterns: ['SUMMARIZE({{texts}})']\nshape: aggregate\ncontext_arg: other");
        assert!(compile_operator("s", &d, Origin::Builtin, 0).is_err());
    }

    #[test]
    fn test_unknown_binding() {
        let d = decl("patterns: ['{{a}} MEANS {{b}}']\noutput: 'f({{a}}, {{c}})'");
        let err = compile_operator("f", &d, Origin::Builtin, 0).unwrap_err();
        assert_eq!(
            err,
            RegistryLoadError::UnknownBinding {
                operator: "f".to_string(),
                binding: "c".to_string()
            }
        );
    }

    #[test]
    fn test_defaulted_arg_is_known() {
        let d = decl("patterns: ['{{a}} NEAR {{b}}']\nargs: [{name: a}, {name: b}, {name: k, default: '5'}]");
        let spec = compile_operator("near", &d, Origin::Builtin, 0).unwrap();
        assert_eq!(spec.output_template.as_str(), "near({{a}}, {{b}}, {{k}})");
    }

    #[test]
    fn test_compile_error_is_wrapped() {
        let d = decl("patterns: ['{{a}} {{b}}']");
        let err = compile_operator("f", &d, Origin::Builtin, 0).unwrap_err();
        assert!(matches!(err, RegistryLoadError::Compile { .. }));
    }

    const BLOCK: &str = r#"
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
    branch: "CASE WHEN semantic_matches({{subject}}, {{condition}}) THEN {{result}} ELSE {{rest}} END"
    fallback: "{{default}}"
"#;

    #[test]
    fn test_compile_block() {
        let spec = compile_operator("semantic_case", &decl(BLOCK), Origin::Builtin, 0).unwrap();
        let block = spec.block.unwrap();
        assert_eq!(block.start, Keyword::new(["SEMANTIC", "CASE"]));
        assert_eq!(block.structure.len(), 3);
        assert!(matches!(block.structure[1], BlockNode::Repeat { min: 1, .. }));
        assert_eq!(block.output.otherwise.as_str(), "NULL");
    }

    #[test]
    fn test_block_rejects_adjacent_captures() {
        let yaml = BLOCK.replace("- capture: subject", "- capture: subject\n    - capture: other");
        let err = compile_operator("b", &decl(&yaml), Origin::Builtin, 0).unwrap_err();
        assert!(matches!(err, RegistryLoadError::InvalidBlock { .. }));
    }

    #[test]
    fn test_block_group_must_start_with_keyword() {
        let yaml = BLOCK.replace("WHEN {{condition}} THEN {{result}}", "{{condition}} THEN {{result}}");
        let err = compile_operator("b", &decl(&yaml), Origin::Builtin, 0).unwrap_err();
        assert!(matches!(err, RegistryLoadError::InvalidBlock { .. }));
    }

    #[test]
    fn test_block_unknown_binding() {
        let yaml = BLOCK.replace("fallback: \"{{default}}\"", "fallback: \"{{result}}\"");
        let err = compile_operator("b", &decl(&yaml), Origin::Builtin, 0).unwrap_err();
        assert!(matches!(err, RegistryLoadError::UnknownBinding { .. }));
    }
}
