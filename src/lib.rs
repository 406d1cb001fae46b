//! # semql: Declarative SQL Operators
//!
//! > **Declare the syntax. Keep the SQL.**
//!
//! semql lets you add new query syntax (infix keywords, symbols, function
//! forms and multi-keyword blocks) through plain YAML declarations, and
//! rewrites queries using that syntax into ordinary function calls before they
//! reach the database.
//!
//! ## Quick Example
//!
//! ```rust
//! use semql::prelude::*;
//!
//! let engine = Engine::default();
//! let out = engine.rewrite("SELECT col EXTRACTS 'price' FROM t").unwrap();
//! assert_eq!(out.sql, "SELECT semantic_extract(col, 'price') FROM t");
//! ```
//!
//! ## Declaring Operators
//!
//! ```yaml
//! semantic_matches:
//!   patterns: ["{{a}} MEANS {{b}}"]
//!   args: [{name: a, type: VARCHAR}, {name: b, type: VARCHAR}]
//!   returns: BOOLEAN
//! ```
//!
//! ## Pattern Forms
//!
//! | Form          | Example                      | Priority |
//! |---------------|------------------------------|----------|
//! | Block         | `SEMANTIC CASE ... END`      | highest  |
//! | Dimension     | `TOPICS({{texts}})`          |          |
//! | Multi-word    | `{{a}} ALIGNS WITH {{b}}`    |          |
//! | Single word   | `{{a}} MEANS {{b}}`          |          |
//! | Symbol        | `{{a}} <~> {{b}}`            |          |
//! | Function call | `SUMMARIZE({{texts}})`       | lowest   |

pub mod ast;
pub mod block;
pub mod clause;
pub mod config;
pub mod decl;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod registry;
pub mod rewriter;
pub mod template;
pub mod tokenizer;

pub use config::Config;
pub use engine::Engine;

pub mod prelude {
    pub use crate::ast::{OperatorSpec, Origin, Shape};
    pub use crate::config::{Config, RewriteOptions, TieBreak};
    pub use crate::engine::Engine;
    pub use crate::error::*;
    pub use crate::registry::{BuiltinSource, FileSource, InlineSource, OperatorRegistry, OperatorSource, RegistrySnapshot};
    pub use crate::rewriter::{Invocation, Rewrite};
}

/// Rewrite a query with the bundled operators and default options.
///
/// # Example
///
/// ```
/// let out = semql::rewrite("SELECT * FROM t WHERE col MEANS 'urgent'").unwrap();
/// assert_eq!(out.sql, "SELECT * FROM t WHERE semantic_matches(col, 'urgent')");
/// ```
pub fn rewrite(sql: &str) -> error::SemqlResult<rewriter::Rewrite> {
    let sources: Vec<Box<dyn registry::OperatorSource>> = vec![Box::new(registry::BuiltinSource)];
    let snapshot = registry::RegistrySnapshot::build(&sources, config::TieBreak::default(), 0);
    rewriter::Rewriter::new(&snapshot, &config::RewriteOptions::default()).rewrite(sql)
}
