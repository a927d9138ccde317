//! rspack-test-runner - run bundler test fixtures inside a Boa sandbox
//!
//! - `run` executes bundles that already sit in a dist directory
//! - `case` builds, runs and checks one fixture
//! - `cases` discovers fixtures under a root and runs each of them

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Instant,
};
use tracing_subscriber::EnvFilter;

use rspack_test_runner::{
    cli::{self, Summary},
    config::{DomMode, RunnerEnvironment, RunnerOptions, TestConfig},
    runtime::Runner,
    tester::{BundlerKind, CaseEntry, CaseReport, Tester, discover_cases},
};

#[derive(Parser)]
#[command(name = "rspack-test-runner")]
#[command(author, version, about = "Run bundler test fixtures inside a sandboxed JS engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute bundles from a dist directory and report registered tests
    Run {
        /// Directory holding the bundles
        dist: PathBuf,
        /// Entry files relative to dist (defaults to main.js)
        #[arg(short, long)]
        entry: Vec<String>,
        /// Fixture directory with test.config.json/test.config.js
        #[arg(short, long)]
        source: Option<PathBuf>,
        /// Install a document facsimile
        #[arg(long, value_parser = ["fake", "jsdom"])]
        web: Option<String>,
        /// Treat .mjs files as ES modules
        #[arg(long)]
        esm: bool,
    },
    /// Build, run and check a single fixture
    Case {
        fixture: PathBuf,
        /// Output directory (a temp directory when omitted)
        #[arg(short, long)]
        dist: Option<PathBuf>,
        /// Drive the fixture's update steps
        #[arg(long)]
        hot: bool,
        /// External bundler command (overrides RSPACK_TEST_BUNDLER)
        #[arg(long)]
        bundler: Option<String>,
    },
    /// Discover fixtures under a root and run each of them
    Cases {
        root: PathBuf,
        /// Only cases whose name contains this text
        #[arg(short, long)]
        filter: Option<String>,
        /// Treat every case as a hot case
        #[arg(long)]
        hot: bool,
        #[arg(long)]
        bundler: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if let Err(err) = builder.try_init() {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let success = match cli.command {
        Commands::Run {
            dist,
            entry,
            source,
            web,
            esm,
        } => run_dist(&dist, entry, source, web.as_deref(), esm)?,
        Commands::Case {
            fixture,
            dist,
            hot,
            bundler,
        } => {
            let started = Instant::now();
            let name = fixture
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "case".to_string());
            let entry = CaseEntry {
                name,
                path: fixture,
                skipped: None,
            };
            let report = run_case(&entry, dist, hot, &bundler_kind(bundler))?;
            cli::print_case(&report);
            let mut summary = Summary::default();
            summary.add(&report);
            summary.print(started.elapsed());
            summary.success()
        }
        Commands::Cases {
            root,
            filter,
            hot,
            bundler,
        } => run_cases(&root, filter.as_deref(), hot, &bundler_kind(bundler))?,
    };

    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn bundler_kind(flag: Option<String>) -> BundlerKind {
    match flag {
        Some(command) => BundlerKind::Command(command),
        None => BundlerKind::from_env(),
    }
}

/// Execute prebuilt bundles without any build step
fn run_dist(dist: &Path, entries: Vec<String>, source: Option<PathBuf>, web: Option<&str>, esm: bool) -> Result<bool> {
    let source = source.unwrap_or_else(|| dist.to_path_buf());
    let mut test_config = TestConfig::load(&source).into_diagnostic()?;
    test_config.esm |= esm;
    let environment = match web {
        Some("jsdom") => RunnerEnvironment::Web(DomMode::Jsdom),
        Some(_) => RunnerEnvironment::Web(DomMode::Fake),
        None => RunnerEnvironment::Node,
    };
    let options = RunnerOptions::new("main", &source, dist)
        .environment(environment)
        .test_config(test_config);
    let mut runner = Runner::new(options).into_diagnostic()?;

    let entries = if entries.is_empty() {
        vec!["main.js".to_string()]
    } else {
        entries
    };
    let started = Instant::now();
    for entry in &entries {
        let value = runner.run(entry).into_diagnostic()?;
        if !value.is_undefined() {
            let shown = runner.display(&value);
            println!("{} {} {}", "→".cyan(), entry, shown.dimmed());
        }
    }
    let outcomes = runner.run_tests().into_diagnostic()?;
    cli::print_outcomes(&outcomes, "");

    let report = CaseReport {
        name: dist.display().to_string(),
        source,
        outcomes,
        ..CaseReport::default()
    };
    let mut summary = Summary::default();
    summary.add(&report);
    summary.print(started.elapsed());
    Ok(summary.success())
}

/// Hot when asked for, or when the case lives under a `hot*` directory
fn is_hot(entry: &CaseEntry, forced: bool) -> bool {
    forced || entry.name.split('/').any(|segment| segment.to_ascii_lowercase().starts_with("hot"))
}

fn run_case(entry: &CaseEntry, dist: Option<PathBuf>, hot: bool, bundler: &BundlerKind) -> Result<CaseReport> {
    if let Some(reason) = &entry.skipped {
        return Ok(CaseReport::skipped(&entry.name, &entry.path, reason));
    }
    let scratch = tempfile::tempdir().into_diagnostic()?;
    let dist = match dist {
        Some(dist) => {
            std::fs::create_dir_all(&dist).into_diagnostic()?;
            dist
        }
        None => scratch.path().join("dist"),
    };
    let tester = if is_hot(entry, hot) {
        let temp = scratch.path().join("source");
        Tester::hot(&entry.name, &entry.path, dist, temp, bundler.clone())
    } else {
        Tester::basic(&entry.name, &entry.path, dist, bundler.clone())
    };
    Ok(tester.run())
}

fn run_cases(root: &Path, filter: Option<&str>, hot: bool, bundler: &BundlerKind) -> Result<bool> {
    let started = Instant::now();
    let cases = discover_cases(root).into_diagnostic()?;
    let mut summary = Summary::default();
    for entry in cases
        .iter()
        .filter(|entry| filter.is_none_or(|text| entry.name.contains(text)))
    {
        let report = run_case(entry, None, hot, bundler)?;
        cli::print_case(&report);
        summary.add(&report);
    }
    summary.print(started.elapsed());
    Ok(summary.success())
}
