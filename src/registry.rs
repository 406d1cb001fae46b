//! Operator registry.
//!
//! Operators are loaded from an ordered list of sources (builtins first), each
//! operator compiled on its own, and published as an immutable
//! [`RegistrySnapshot`]. Readers clone the current `Arc` and never observe a
//! half-loaded set; [`OperatorRegistry::reload`] builds a fresh snapshot
//! outside the lock and swaps it in.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ast::{BlockSpec, Keyword, OperatorSpec, Origin, Pattern, Priority, Tier, is_wordlike};
use crate::config::{RegistryConfig, TieBreak};
use crate::block::BlockOperatorEngine;
use crate::decl::{compile_operator, parse_document};
use crate::error::RegistryLoadError;
use crate::rewriter::{ScanCache, match_pattern};
use crate::tokenizer::{Token, TokenKind, tokenize};

const BUILTIN_OPERATORS: &str = include_str!("../operators/builtin.yaml");

/// A place operator declarations are read from.
pub trait OperatorSource: Send + Sync + fmt::Debug {
    /// Identifier used in logs and load errors.
    fn id(&self) -> String;

    fn origin(&self) -> Origin;

    /// Declaration documents as `(document id, YAML text)` pairs.
    fn documents(&self) -> Result<Vec<(String, String)>, RegistryLoadError>;
}

/// The bundled operator set.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSource;

impl OperatorSource for BuiltinSource {
    fn id(&self) -> String {
        "builtin".to_string()
    }

    fn origin(&self) -> Origin {
        Origin::Builtin
    }

    fn documents(&self) -> Result<Vec<(String, String)>, RegistryLoadError> {
        Ok(vec![(self.id(), BUILTIN_OPERATORS.to_string())])
    }
}

/// A YAML file, or a directory of `*.yaml` / `*.yml` files read in name order.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<String, RegistryLoadError> {
        fs::read_to_string(path).map_err(|e| RegistryLoadError::Source {
            source_id: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl OperatorSource for FileSource {
    fn id(&self) -> String {
        self.path.display().to_string()
    }

    fn origin(&self) -> Origin {
        Origin::User(self.id())
    }

    fn documents(&self) -> Result<Vec<(String, String)>, RegistryLoadError> {
        if !self.path.is_dir() {
            return Ok(vec![(self.id(), Self::read(&self.path)?)]);
        }

        let entries = fs::read_dir(&self.path).map_err(|e| RegistryLoadError::Source {
            source_id: self.id(),
            message: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        files.sort();

        files
            .iter()
            .map(|file| Ok((file.display().to_string(), Self::read(file)?)))
            .collect()
    }
}

/// Declarations held in memory.
#[derive(Debug, Clone)]
pub struct InlineSource {
    id: String,
    text: String,
}

impl InlineSource {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

impl OperatorSource for InlineSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn origin(&self) -> Origin {
        Origin::User(self.id.clone())
    }

    fn documents(&self) -> Result<Vec<(String, String)>, RegistryLoadError> {
        Ok(vec![(self.id.clone(), self.text.clone())])
    }
}

/// What happened during one load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Source ids in load order.
    pub sources: Vec<String>,
    pub errors: Vec<RegistryLoadError>,
    /// Operators replaced by a later source, as `(name, replaced origin)`.
    pub overridden: Vec<(String, String)>,
}

/// How a query position can start a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionClass<'a> {
    /// A bare word; compared case-insensitively.
    Word(&'a str),
    /// A symbol run or punctuation; compared exactly.
    Symbol(&'a str),
    /// Anything else can only begin a capture.
    Other,
}

impl<'a> PositionClass<'a> {
    pub fn of(token: &Token<'a>) -> Self {
        match token.kind {
            TokenKind::Word => Self::Word(token.text),
            TokenKind::Symbol | TokenKind::Punct => Self::Symbol(token.text),
            _ => Self::Other,
        }
    }

    fn key(self) -> Option<String> {
        match self {
            Self::Word(w) => Some(w.to_ascii_uppercase()),
            Self::Symbol(s) => Some(s.to_string()),
            Self::Other => None,
        }
    }
}

/// Index key for a keyword word.
pub(crate) fn word_key(word: &str) -> String {
    if is_wordlike(word) {
        word.to_ascii_uppercase()
    } else {
        word.to_string()
    }
}

/// What a candidate matches.
#[derive(Debug, Clone, Copy)]
pub enum Matcher<'s> {
    Pattern(&'s Pattern),
    Block(&'s BlockSpec),
}

/// One pattern of one operator, in priority order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'s> {
    pub spec: &'s OperatorSpec,
    pub matcher: Matcher<'s>,
    pub priority: Priority,
}

impl Candidate<'_> {
    /// Every keyword word this candidate needs.
    pub fn keywords(&self) -> Vec<&Keyword> {
        match self.matcher {
            Matcher::Pattern(p) => p.keywords().collect(),
            Matcher::Block(b) => vec![&b.start, &b.end],
        }
    }

    /// Whether every keyword word occurs in `vocabulary`.
    pub fn possible(&self, vocabulary: &HashSet<String>) -> bool {
        self.keywords()
            .iter()
            .flat_map(|k| k.words.iter())
            .all(|w| vocabulary.contains(&word_key(w)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    operator: usize,
    /// `None` for the block structure.
    pattern: Option<usize>,
    priority: Priority,
}

/// An immutable, versioned set of compiled operators.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    tie_break: TieBreak,
    operators: Vec<OperatorSpec>,
    /// Sorted by priority, highest first.
    entries: Vec<Entry>,
    /// Entries led by a keyword, keyed by the keyword's first word.
    leading: HashMap<String, Vec<usize>>,
    /// Entries led by a capture.
    capture_led: Vec<usize>,
    report: LoadReport,
}

impl RegistrySnapshot {
    /// Load and compile every source in order.
    pub fn build(sources: &[Box<dyn OperatorSource>], tie_break: TieBreak, version: u64) -> Self {
        let mut report = LoadReport::default();
        let mut operators: Vec<OperatorSpec> = Vec::new();
        let mut sequence = 0;

        for source in sources {
            report.sources.push(source.id());
            let documents = match source.documents() {
                Ok(documents) => documents,
                Err(e) => {
                    tracing::warn!(source = %source.id(), error = %e, "operator source skipped");
                    report.errors.push(e);
                    continue;
                }
            };

            for (document_id, text) in documents {
                let parsed = match parse_document(&text, &document_id) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(source = %document_id, error = %e, "operator document skipped");
                        report.errors.push(e);
                        continue;
                    }
                };
                for e in parsed.errors {
                    tracing::warn!(error = %e, "operator skipped");
                    report.errors.push(e);
                }

                for (name, decl) in parsed.operators {
                    match compile_operator(&name, &decl, source.origin(), sequence) {
                        Ok(spec) => {
                            if let Some(pos) = operators.iter().position(|o| o.name == spec.name) {
                                let old = operators.remove(pos);
                                tracing::debug!(operator = %name, replaced = %old.origin, "operator overridden");
                                report.overridden.push((name.clone(), old.origin.to_string()));
                            }
                            tracing::debug!(operator = %name, origin = %spec.origin, "operator compiled");
                            operators.push(spec);
                        }
                        Err(e) => {
                            tracing::warn!(operator = %name, error = %e, "operator skipped");
                            report.errors.push(e);
                        }
                    }
                    sequence += 1;
                }
            }
        }

        let rejected = reentrant_operators(&operators);
        for error in rejected {
            tracing::warn!(error = %error, "operator skipped");
            if let Some(name) = error.operator() {
                operators.retain(|o| o.name != name);
            }
            report.errors.push(error);
        }

        let mut snapshot = Self {
            version,
            loaded_at: Utc::now(),
            tie_break,
            operators,
            entries: Vec::new(),
            leading: HashMap::new(),
            capture_led: Vec::new(),
            report,
        };
        snapshot.index();
        snapshot
    }

    fn index(&mut self) {
        let mut entries = Vec::new();
        for (op_index, spec) in self.operators.iter().enumerate() {
            if let Some(block) = &spec.block {
                entries.push(Entry {
                    operator: op_index,
                    pattern: None,
                    priority: Priority {
                        tier: Tier::Block,
                        phrase_len: block.start.words.len(),
                        precedence: spec.precedence,
                    },
                });
            }
            for (pattern_index, pattern) in spec.patterns.iter().enumerate() {
                entries.push(Entry {
                    operator: op_index,
                    pattern: Some(pattern_index),
                    priority: Priority {
                        tier: Tier::of(spec.shape, pattern),
                        phrase_len: pattern.phrase_len(),
                        precedence: spec.precedence,
                    },
                });
            }
        }

        let operators = &self.operators;
        let tie_break = self.tie_break;
        entries.sort_by(|a, b| {
            let (sa, sb) = (&operators[a.operator], &operators[b.operator]);
            b.priority
                .cmp(&a.priority)
                .then_with(|| match tie_break {
                    TieBreak::Declaration => sa.sequence.cmp(&sb.sequence),
                    TieBreak::Alphabetical => sa.name.cmp(&sb.name).then(sa.sequence.cmp(&sb.sequence)),
                })
                .then(a.pattern.cmp(&b.pattern))
        });

        for (i, entry) in entries.iter().enumerate() {
            let spec = &operators[entry.operator];
            let lead = match entry.pattern {
                None => spec.block.as_ref().map(|b| b.start.first()),
                Some(p) => spec.patterns[p].leading_keyword().map(Keyword::first),
            };
            match lead {
                Some(word) => self.leading.entry(word_key(word)).or_default().push(i),
                None => self.capture_led.push(i),
            }
        }
        self.entries = entries;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// The tie-break rule this snapshot was ordered with.
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&OperatorSpec> {
        self.operators.iter().find(|o| o.name == name)
    }

    /// Operators in load order.
    pub fn operators(&self) -> impl Iterator<Item = &OperatorSpec> {
        self.operators.iter()
    }

    fn candidate(&self, entry: &Entry) -> Option<Candidate<'_>> {
        let spec = self.operators.get(entry.operator)?;
        let matcher = match entry.pattern {
            Some(p) => Matcher::Pattern(spec.patterns.get(p)?),
            None => Matcher::Block(spec.block.as_ref()?),
        };
        Some(Candidate {
            spec,
            matcher,
            priority: entry.priority,
        })
    }

    /// Every pattern in priority order.
    pub fn candidates(&self) -> impl Iterator<Item = Candidate<'_>> {
        self.entries.iter().filter_map(|e| self.candidate(e))
    }

    /// Patterns that can start at a position of `class`, in priority order:
    /// those led by a matching keyword merged with all capture-led patterns.
    pub fn lookup_candidates(&self, class: PositionClass<'_>) -> impl Iterator<Item = Candidate<'_>> {
        let led: &[usize] = class
            .key()
            .and_then(|key| self.leading.get(&key))
            .map_or(&[], Vec::as_slice);
        MergeSorted {
            a: led,
            b: &self.capture_led,
        }
        .filter_map(|i| self.entries.get(i))
        .filter_map(|e| self.candidate(e))
    }
}

/// Merge of two ascending index lists.
struct MergeSorted<'i> {
    a: &'i [usize],
    b: &'i [usize],
}

impl<'i> Iterator for MergeSorted<'i> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let take_a = match (self.a.first(), self.b.first()) {
            (Some(x), Some(y)) => x <= y,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        let list = if take_a { &mut self.a } else { &mut self.b };
        let slice: &'i [usize] = *list;
        let (head, tail) = slice.split_first()?;
        *list = tail;
        Some(*head)
    }
}

/// Stands in for every binding when checking outputs; literal and
/// expression captures both accept it.
const SAMPLE_VALUE: &str = "'_'";

/// Operators whose output an operator of the same set would match again.
fn reentrant_operators(operators: &[OperatorSpec]) -> Vec<RegistryLoadError> {
    let mut errors = Vec::new();
    for spec in operators {
        let mut outputs = vec![&spec.output_template];
        if let Some(block) = &spec.block {
            outputs.extend([&block.output.branch, &block.output.otherwise]);
            outputs.extend(block.output.fallback.as_ref());
        }

        let hit = outputs
            .iter()
            .find_map(|template| first_match(operators, &template.sample(SAMPLE_VALUE)));
        if let Some((trigger, other)) = hit {
            errors.push(RegistryLoadError::ReentrantOutput {
                operator: spec.name.clone(),
                trigger,
                other,
            });
        }
    }
    errors
}

/// First operator matching anywhere in `sql`, as `(keyword phrase, operator)`.
fn first_match(operators: &[OperatorSpec], sql: &str) -> Option<(String, String)> {
    let tokens = tokenize(sql);
    let end = tokens.len();
    let mut scans = ScanCache::default();

    for at in (0..end).filter(|&i| !tokens[i].is_trivia()) {
        for spec in operators {
            if let Some(block) = &spec.block {
                if BlockOperatorEngine::new(block).match_at(&tokens, at, end).is_some() {
                    return Some((block.start.phrase(), spec.name.clone()));
                }
            }
            for pattern in &spec.patterns {
                if match_pattern(&tokens, pattern, at, end, &mut scans).is_some() {
                    let trigger = pattern.trigger().map(Keyword::phrase).unwrap_or_default();
                    return Some((trigger, spec.name.clone()));
                }
            }
        }
    }
    None
}

/// Shared, reloadable operator registry.
#[derive(Debug)]
pub struct OperatorRegistry {
    sources: Vec<Box<dyn OperatorSource>>,
    tie_break: TieBreak,
    current: RwLock<Arc<RegistrySnapshot>>,
    next_version: AtomicU64,
}

impl OperatorRegistry {
    /// Load `sources` in order and publish the first snapshot.
    pub fn new(sources: Vec<Box<dyn OperatorSource>>, tie_break: TieBreak) -> Self {
        let snapshot = RegistrySnapshot::build(&sources, tie_break, 1);
        log_published(&snapshot);
        Self {
            sources,
            tie_break,
            current: RwLock::new(Arc::new(snapshot)),
            next_version: AtomicU64::new(2),
        }
    }

    /// Builtins (if enabled) followed by every configured path.
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(sources_for(config, &[]), config.tie_break)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Re-read every source and atomically install the result.
    ///
    /// A snapshot is only installed if no newer one was installed while it
    /// was being built.
    pub fn reload(&self) -> Arc<RegistrySnapshot> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(RegistrySnapshot::build(&self.sources, self.tie_break, version));

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if guard.version() < snapshot.version() {
            *guard = Arc::clone(&snapshot);
            drop(guard);
            log_published(&snapshot);
            snapshot
        } else {
            Arc::clone(&guard)
        }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }
}

/// Source list for a registry config plus extra paths.
pub fn sources_for(config: &RegistryConfig, extra: &[PathBuf]) -> Vec<Box<dyn OperatorSource>> {
    let mut sources: Vec<Box<dyn OperatorSource>> = Vec::new();
    if config.include_builtins {
        sources.push(Box::new(BuiltinSource));
    }
    for path in config.operator_paths.iter().chain(extra) {
        sources.push(Box::new(FileSource::new(path)));
    }
    sources
}

fn log_published(snapshot: &RegistrySnapshot) {
    tracing::info!(
        version = snapshot.version(),
        operators = snapshot.len(),
        errors = snapshot.report().errors.len(),
        "registry snapshot published"
    );
}
