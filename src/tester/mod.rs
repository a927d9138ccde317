//! Case orchestration
//!
//! A [`Tester`] owns the [`TestContext`] of one fixture and a list of
//! [`Processor`] steps. Each step builds through its compiler manager,
//! runs the bundles in a [`Runner`](crate::runtime::Runner) and checks the
//! diagnostics; the outcome of the whole case lands in a [`CaseReport`].

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub mod compiler;
pub mod context;
pub mod discover;
pub mod processor;
pub mod update;

pub use compiler::{BundlerKind, CommandCompiler, Compiler, PrebuiltCompiler};
pub use context::{CompilerManager, TestContext};
pub use discover::{CaseEntry, discover_cases};
pub use processor::{BasicProcessor, HotProcessor, Processor};

use crate::{
    config::ConfigError,
    runtime::{RunnerError, expectation::ExpectationError, hot::ProtocolError, test_env::TestOutcome},
};

#[derive(Error, Debug)]
pub enum TesterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Expectation(#[from] ExpectationError),

    #[error("build of step {step} failed: {message}")]
    Compile { step: usize, message: String },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler '{0}' was never created")]
    NoCompiler(String),

    #[error("hot cases need a temp directory")]
    NoTemp,

    #[error("case has no processor steps")]
    NoSteps,

    #[error("failed to walk cases: {0}")]
    Discover(String),
}

pub type TesterResult<T> = Result<T, TesterError>;

/// Everything one case produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub source: PathBuf,
    pub outcomes: Vec<TestOutcome>,
    pub errors: Vec<String>,
    pub skipped: Option<String>,
}

impl CaseReport {
    pub fn skipped(name: impl Into<String>, source: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            skipped: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn passed(&self) -> bool {
        self.errors.is_empty() && self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failed_tests(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed).count()
    }
}

/// Runs the processor steps of one case
pub struct Tester {
    name: String,
    context: TestContext,
    steps: Vec<Box<dyn Processor>>,
    step: usize,
    outcomes: Vec<TestOutcome>,
}

impl Tester {
    pub fn new(name: impl Into<String>, context: TestContext, steps: Vec<Box<dyn Processor>>) -> Self {
        Self {
            name: name.into(),
            context,
            steps,
            step: 0,
            outcomes: Vec::new(),
        }
    }

    /// Single build of a fixture
    pub fn basic(name: impl Into<String>, source: impl Into<PathBuf>, dist: impl Into<PathBuf>, bundler: BundlerKind) -> Self {
        let name = name.into();
        let context = TestContext::new(source, dist, None, bundler);
        let processor = BasicProcessor::new(processor_name(&name));
        Self::new(name, context, vec![Box::new(processor)])
    }

    /// Hot fixture whose update steps are written into `temp`
    pub fn hot(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        dist: impl Into<PathBuf>,
        temp: impl Into<PathBuf>,
        bundler: BundlerKind,
    ) -> Self {
        let name = name.into();
        let context = TestContext::new(source, dist, Some(temp.into()), bundler);
        let processor = HotProcessor::new(processor_name(&name));
        Self::new(name, context, vec![Box::new(processor)])
    }

    pub fn context(&self) -> &TestContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TestContext {
        &mut self.context
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Configure, create and build the compiler of the current step
    pub fn compile(&mut self) -> TesterResult<()> {
        let step = self.step;
        let processor = self.steps.get_mut(step).ok_or(TesterError::NoSteps)?;
        tracing::debug!(case = %self.name, step, processor = processor.name(), "compile");
        processor.config(&mut self.context)?;
        processor.compiler(&mut self.context)?;
        processor.build(&mut self.context)
    }

    /// Run the bundles of the current step and check its diagnostics
    pub fn check(&mut self) -> TesterResult<Vec<TestOutcome>> {
        let processor = self.steps.get_mut(self.step).ok_or(TesterError::NoSteps)?;
        let outcomes = processor.run(&mut self.context)?;
        self.outcomes.extend(outcomes.iter().cloned());
        processor.check(&mut self.context)?;
        Ok(outcomes)
    }

    /// Move to the next step; `false` when this was the last one
    pub fn next_step(&mut self) -> bool {
        if self.step + 1 >= self.steps.len() {
            return false;
        }
        self.step += 1;
        true
    }

    /// Let every processor clean up and close the compilers
    pub fn resume(&mut self) -> TesterResult<()> {
        for processor in &mut self.steps {
            processor.after_all(&mut self.context)?;
        }
        self.context.close_compilers()
    }

    /// Drive every step; the first failing step ends the case
    pub fn run(mut self) -> CaseReport {
        let mut errors = Vec::new();
        if self.steps.is_empty() {
            errors.push(TesterError::NoSteps.to_string());
        } else {
            loop {
                if let Err(e) = self.compile().and_then(|_| self.check().map(|_| ())) {
                    tracing::debug!(case = %self.name, step = self.step, error = %e, "step failed");
                    errors.push(e.to_string());
                    break;
                }
                if !self.next_step() {
                    break;
                }
            }
        }
        if let Err(e) = self.resume() {
            errors.push(e.to_string());
        }
        CaseReport {
            name: self.name,
            source: self.context.source().to_path_buf(),
            outcomes: self.outcomes,
            errors,
            skipped: None,
        }
    }
}

/// Compiler and runner name for a case (its last path segment)
fn processor_name(case: &str) -> String {
    case.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("main").to_string()
}
