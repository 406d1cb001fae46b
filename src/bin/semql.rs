//! semql: the semql CLI
//!
//! Rewrites queries that use declared operators into plain SQL.
//!
//! # Usage
//!
//! ```bash
//! # Rewrite a query
//! semql "SELECT * FROM t WHERE col MEANS 'urgent'"
//!
//! # Load extra operator declarations
//! semql "SELECT x ~~ y FROM t" --operators ./ops.yaml
//!
//! # Show what was rewritten and why
//! semql explain "SELECT SUMMARIZE(body) FROM t WHERE SUMMARIZE(body) = 'x'"
//! ```

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use semql::diagnostics::{render_compile_error, render_diagnostic};
use semql::prelude::*;
use semql::registry::{Candidate, Matcher, sources_for};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "semql")]
#[command(author = "semql contributors")]
#[command(version)]
#[command(about = "Declarative semantic operators for SQL", long_about = None)]
#[command(after_help = "EXAMPLES:
    semql \"SELECT * FROM t WHERE col MEANS 'urgent'\"
    semql explain \"SELECT TOPICS(body) FROM t GROUP BY TOPICS(body)\"
    semql operators --operators ./ops
    semql check ./ops/custom.yaml")]
struct Cli {
    /// The query to rewrite (`-` reads standard input)
    query: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "SEMQL_CONFIG")]
    config: Option<PathBuf>,

    /// Extra operator declaration file or directory (repeatable)
    #[arg(short, long = "operators")]
    operators: Vec<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a query and list every operator use
    Explain {
        /// The query to explain
        query: String,
    },
    /// List loaded operators in match priority order
    Operators,
    /// Validate operator declaration files
    Check {
        /// Declaration file or directory
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Some(Commands::Explain { query }) => explain_query(query, &cli),
        Some(Commands::Operators) => list_operators(&cli),
        Some(Commands::Check { path }) => check_operators(path, &cli),
        None => match &cli.query {
            Some(query) => rewrite_query(query, &cli),
            None => {
                println!("{}", "semql: declarative semantic operators for SQL".cyan().bold());
                println!();
                println!("Usage: semql <QUERY> [OPTIONS]");
                println!();
                println!("Try: semql --help");
                Ok(true)
            }
        },
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "semql=debug" } else { "semql=warn" };
    let filter = EnvFilter::try_from_env("SEMQL_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_engine(cli: &Cli) -> Result<Engine> {
    let config = Config::discover(cli.config.as_deref()).context("loading config")?;
    Ok(Engine::with_operator_paths(config, &cli.operators))
}

fn read_query(query: &str) -> Result<String> {
    if query != "-" {
        return Ok(query.to_string());
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("reading query from stdin")?;
    Ok(buf)
}

/// Returns `Ok(false)` when diagnostics were reported.
fn rewrite_query(query: &str, cli: &Cli) -> Result<bool> {
    let engine = load_engine(cli)?;
    let query = read_query(query)?;
    let out = engine.rewrite(&query)?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
        OutputFormat::Text => {
            if cli.verbose {
                eprintln!("{} {}", "Input:".dimmed(), query.yellow());
            }
            println!("{}", out.sql);
            for diagnostic in &out.diagnostics {
                eprintln!("{}", render_diagnostic(&query, diagnostic, true));
            }
        }
    }
    Ok(out.diagnostics.is_empty())
}

fn explain_query(query: &str, cli: &Cli) -> Result<bool> {
    let engine = load_engine(cli)?;
    let query = read_query(query)?;
    let out = engine.rewrite(&query)?;

    if let OutputFormat::Json = cli.format {
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(out.diagnostics.is_empty());
    }

    println!("{}", "semql Query Explanation".cyan().bold());
    println!();
    println!("{} {}", "Query:".dimmed(), query.yellow());
    println!("{} {}", "Snapshot:".dimmed(), out.snapshot_version.to_string().cyan());
    println!();

    if out.invocations.is_empty() {
        println!("{}", "(no operators matched)".dimmed());
    } else {
        println!("{}", "Operators:".green().bold());
        for inv in &out.invocations {
            let text = query.get(inv.span.start..inv.span.end).unwrap_or_default();
            let cache = if inv.cache { " cached".dimmed().to_string() } else { String::new() };
            println!(
                "  {} {} {}{}",
                inv.operator.cyan(),
                format!("[{}]", inv.shape).dimmed(),
                text.white(),
                cache
            );
        }
    }

    if !out.dimensions.is_empty() {
        println!();
        println!("{}", "Dimensions:".green().bold());
        for name in &out.dimensions {
            println!("  • {}", name.white());
        }
    }

    if !out.diagnostics.is_empty() {
        println!();
        for diagnostic in &out.diagnostics {
            println!("{}", render_diagnostic(&query, diagnostic, true));
            println!();
        }
    }

    println!();
    println!("{}", "Rewritten SQL:".green().bold());
    println!("  {}", out.sql.white());
    Ok(out.diagnostics.is_empty())
}

fn describe(candidate: &Candidate<'_>) -> String {
    match candidate.matcher {
        Matcher::Pattern(pattern) => pattern.template.clone(),
        Matcher::Block(block) => format!("{} ... {}", block.start, block.end),
    }
}

fn list_operators(cli: &Cli) -> Result<bool> {
    let engine = load_engine(cli)?;
    let snapshot = engine.snapshot();

    if let OutputFormat::Json = cli.format {
        let operators: Vec<serde_json::Value> = snapshot
            .candidates()
            .map(|c| {
                serde_json::json!({
                    "operator": c.spec.name,
                    "pattern": describe(&c),
                    "tier": c.priority.tier.to_string(),
                    "precedence": c.priority.precedence,
                    "shape": c.spec.shape,
                    "origin": c.spec.origin.to_string(),
                })
            })
            .collect();
        let doc = serde_json::json!({
            "version": snapshot.version(),
            "loaded_at": snapshot.loaded_at(),
            "tie_break": snapshot.tie_break(),
            "operators": operators,
            "errors": snapshot.report().errors,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(snapshot.report().errors.is_empty());
    }

    println!(
        "{} {} {} {}",
        "Snapshot".white().bold(),
        snapshot.version().to_string().cyan(),
        "loaded".dimmed(),
        snapshot.loaded_at().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("{} {:?}", "Tie-break:".dimmed(), snapshot.tie_break());
    println!();
    println!(
        "{:4} {:22} {:11} {:10} {}",
        "#".white().bold(),
        "Operator".white().bold(),
        "Tier".white().bold(),
        "Shape".white().bold(),
        "Pattern".white().bold()
    );
    println!("{}", "─".repeat(80).dimmed());

    for (i, c) in snapshot.candidates().enumerate() {
        println!(
            "{:4} {:22} {:11} {:10} {}",
            (i + 1).to_string().dimmed(),
            c.spec.name.cyan(),
            c.priority.tier.to_string().yellow(),
            c.spec.shape.to_string(),
            describe(&c).white()
        );
    }

    let errors = &snapshot.report().errors;
    if !errors.is_empty() {
        println!();
        println!("{}", "Load errors:".red().bold());
        for e in errors {
            println!("  {} {}", "✗".red(), e);
        }
    }
    Ok(errors.is_empty())
}

fn check_operators(path: &std::path::Path, cli: &Cli) -> Result<bool> {
    let config = Config::discover(cli.config.as_deref()).context("loading config")?;
    let sources = sources_for(&config.registry, &[path.to_path_buf()]);
    let snapshot = RegistrySnapshot::build(&sources, config.registry.tie_break, 0);
    let target = path.display().to_string();
    let loaded = snapshot
        .operators()
        .filter(|o| matches!(&o.origin, Origin::User(source) if source.starts_with(&target)))
        .count();

    let errors = &snapshot.report().errors;
    if let OutputFormat::Json = cli.format {
        let doc = serde_json::json!({ "operators": loaded, "errors": errors });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(errors.is_empty());
    }

    for e in errors {
        match e {
            RegistryLoadError::Compile { operator, error } => {
                println!("{} {}", "✗".red(), operator.cyan());
                println!("{}", render_compile_error(error, true));
            }
            other => println!("{} {}", "✗".red(), other),
        }
    }

    if errors.is_empty() {
        println!("{} {} operator(s) OK in {}", "✓".green(), loaded, target.cyan());
    } else {
        println!();
        println!("{} {} error(s)", "✗".red().bold(), errors.len());
    }
    Ok(errors.is_empty())
}
