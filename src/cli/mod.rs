//! Terminal reporting for the `rspack-test-runner` binary

use colored::Colorize;
use std::time::Duration;

use crate::{runtime::test_env::TestOutcome, tester::CaseReport};

fn millis(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// One line per test, failures followed by their message
pub fn print_outcomes(outcomes: &[TestOutcome], indent: &str) {
    for outcome in outcomes {
        if outcome.passed {
            println!("{indent}{} {} {}", "✓".green(), outcome.name, millis(outcome.duration).dimmed());
        } else {
            println!("{indent}{} {}", "✗".red(), outcome.name.red());
            if let Some(error) = &outcome.error {
                for line in error.lines() {
                    println!("{indent}    {line}");
                }
            }
        }
    }
}

/// Header, tests and errors of one case
pub fn print_case(report: &CaseReport) {
    if let Some(reason) = &report.skipped {
        println!("{} {} {}", "SKIP".yellow().bold(), report.name, format!("({reason})").dimmed());
        return;
    }
    let badge = if report.passed() {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!("{badge} {}", report.name);
    print_outcomes(&report.outcomes, "  ");
    for error in &report.errors {
        println!("  {} {}", "error:".red().bold(), error.lines().next().unwrap_or_default());
        for line in error.lines().skip(1) {
            println!("    {line}");
        }
    }
}

/// Totals over every reported case
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub tests: usize,
    pub failed_tests: usize,
}

impl Summary {
    pub fn add(&mut self, report: &CaseReport) {
        if report.skipped.is_some() {
            self.skipped += 1;
            return;
        }
        if report.passed() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.tests += report.outcomes.len();
        self.failed_tests += report.failed_tests();
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print(&self, elapsed: Duration) {
        println!();
        let mut cases = vec![format!("{} passed", self.passed).green().to_string()];
        if self.failed > 0 {
            cases.push(format!("{} failed", self.failed).red().to_string());
        }
        if self.skipped > 0 {
            cases.push(format!("{} skipped", self.skipped).yellow().to_string());
        }
        println!("{} {}", "Cases:".bold(), cases.join(", "));
        println!(
            "{} {} total, {} failed",
            "Tests:".bold(),
            self.tests,
            self.failed_tests
        );
        println!("{} {}", "Time:".bold(), millis(elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(passed: bool) -> TestOutcome {
        TestOutcome {
            name: "t".to_string(),
            passed,
            error: (!passed).then(|| "boom".to_string()),
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = Summary::default();
        summary.add(&CaseReport {
            outcomes: vec![outcome(true), outcome(false)],
            ..CaseReport::default()
        });
        summary.add(&CaseReport {
            outcomes: vec![outcome(true)],
            ..CaseReport::default()
        });
        summary.add(&CaseReport::skipped("s", "/s", "flaky"));
        assert_eq!(
            summary,
            Summary {
                passed: 1,
                failed: 1,
                skipped: 1,
                tests: 3,
                failed_tests: 1,
            }
        );
        assert!(!summary.success());
    }
}
