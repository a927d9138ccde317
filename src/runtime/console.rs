//! Console gating for sandboxed code
//!
//! `log`/`info`/`warn` only reach the terminal when the runner was asked to
//! print (`PRINT_LOGGER`); `error` always does. Every line is also kept in
//! an in-memory record so callers can inspect what a bundle printed.

use boa_engine::{Context, JsResult};
use boa_gc::{Finalize, Gc, GcRefCell, Trace};
use boa_runtime::{ConsoleState, Logger};

/// Severity of a captured console line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// One captured console line
#[derive(Debug, Clone, PartialEq, Eq, Trace, Finalize)]
pub struct ConsoleRecord {
    #[unsafe_ignore_trace]
    pub level: ConsoleLevel,
    pub message: String,
}

pub(crate) type ConsoleRecords = Gc<GcRefCell<Vec<ConsoleRecord>>>;

/// `boa_runtime` logger with the runner's verbosity gate
#[derive(Debug, Clone, Trace, Finalize)]
pub(crate) struct RunnerLogger {
    print: bool,
    records: ConsoleRecords,
}

impl RunnerLogger {
    pub(crate) fn new(print: bool, records: ConsoleRecords) -> Self {
        Self { print, records }
    }

    fn record(&self, level: ConsoleLevel, message: &str) {
        self.records.borrow_mut().push(ConsoleRecord {
            level,
            message: message.to_string(),
        });
    }
}

impl Logger for RunnerLogger {
    fn log(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.record(ConsoleLevel::Log, &msg);
        if self.print {
            println!("{}", msg);
        }
        Ok(())
    }

    fn info(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.record(ConsoleLevel::Info, &msg);
        if self.print {
            println!("{}", msg);
        }
        Ok(())
    }

    fn warn(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.record(ConsoleLevel::Warn, &msg);
        if self.print {
            eprintln!("{}", msg);
        }
        Ok(())
    }

    fn error(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.record(ConsoleLevel::Error, &msg);
        eprintln!("{}", msg);
        Ok(())
    }
}
