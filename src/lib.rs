//! rspack-test-runner - sandboxed execution of bundler test output
//!
//! - `runtime`: the Boa-backed [`Runner`] with CommonJS/ESM requirers, the
//!   DOM facsimile and the hot-update protocol
//! - `resolver`: file and package resolution for the requirers
//! - `config`: runner options and fixture configuration
//! - `tester`: case orchestration over compilers, processors and runners

pub mod cli;
pub mod config;
pub mod resolver;
pub mod runtime;
pub mod tester;

pub use config::{CompilerOptions, DomMode, RunnerEnvironment, RunnerOptions, TestConfig};
pub use resolver::{FileResolver, ModulePath, ResolveError};
pub use runtime::{Runner, RunnerError, RunnerResult};
pub use tester::{CaseReport, Tester, TesterError, TesterResult};
