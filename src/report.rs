//! Human-readable preflight and result reports printed around the supervised run.
use std::{
    io::{self, Write},
    sync::LazyLock,
};

use regex::Regex;

use crate::{
    checkenv::{EnvCheck, EnvOrigin},
    depends::DependencyOutcome,
    env::EnvSource,
    supervisor::ProcessRun,
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const GRAY: &str = "\x1b[90m";
const BANNER: &str = "\x1b[1;7;94m";
const RESET: &str = "\x1b[0m";

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ansi pattern is valid"));

/// One rendered report line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub text: String,
    pub error: bool,
}

/// Ordered lines of one report section.
#[derive(Debug, Clone, Default)]
pub struct Report {
    lines: Vec<ReportLine>,
}

impl Report {
    pub fn push(&mut self, text: impl Into<String>, error: bool) {
        self.lines.push(ReportLine {
            text: text.into(),
            error,
        });
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.lines.iter().any(|line| line.error)
    }

    /// Writes the lines, only the failing ones when `error_only` is set.
    ///
    /// Returns `true` when the report has no error.
    pub fn dump(&self, out: &mut dyn Write, error_only: bool, color: bool) -> io::Result<bool> {
        for line in &self.lines {
            if !error_only || line.error {
                writeln!(out, "{}", paint(&line.text, color))?;
            }
        }
        Ok(!self.has_error())
    }
}

/// Strips colour sequences unless `color` is set.
pub fn paint(text: &str, color: bool) -> String {
    if color {
        text.to_string()
    } else {
        ANSI.replace_all(text, "").into_owned()
    }
}

/// Section heading.
pub fn banner(title: &str) -> String {
    format!("{BANNER}  {title}  {RESET}\n")
}

/// Trailer printed under a section without errors.
pub fn no_error() -> String {
    format!("    {GREEN_BOLD}No Error{RESET}\n")
}

fn badge_ok() -> String {
    format!("{GREEN_BOLD}OK{RESET}")
}

fn badge_ng() -> String {
    format!("{RED_BOLD}NG{RESET}")
}

/// Stars standing in for a masked value, loosely tracking its length.
fn stars(value: &str) -> String {
    "*".repeat(value.chars().count().saturating_sub(2).max(1))
}

/// One line per checked variable.
pub fn env_report(results: &[EnvCheck]) -> Report {
    let mut report = Report::default();
    for result in results {
        let error = result.error();
        let mut text = String::from("  ");
        text.push_str(&match (&result.origin, &error) {
            (EnvOrigin::Unspecified, _) => format!("{BLUE}--{RESET}"),
            (_, None) => badge_ok(),
            (_, Some(_)) => badge_ng(),
        });
        text.push_str(&format!(" {BLUE}{}{RESET}{GRAY}={RESET}", result.key));

        if result.masked {
            text.push_str(&format!("{GRAY}{} (masked){RESET}", stars(&result.value)));
        } else if result.value.is_empty() {
            text.push_str(&format!("{GRAY}(empty){RESET}"));
        } else {
            text.push_str(&format!("{CYAN}{}{RESET}", result.value));
        }
        if result.value != result.raw_value && !result.masked {
            text.push_str(&format!(" <= {MAGENTA}{}{RESET}", result.raw_value));
        }
        match result.origin {
            EnvOrigin::Store(EnvSource::DotEnv) => {
                text.push_str(&format!(" {GRAY}(from .env){RESET}"))
            }
            EnvOrigin::Store(EnvSource::DeclaredDefault) => {
                text.push_str(&format!(" {GRAY}(from cradle's default){RESET}"))
            }
            _ => {}
        }
        if let Some(err) = &error {
            text.push_str(&format!("\n      {RED_BOLD}... {err}.{RESET}"));
            if let Some(suggest) = &result.suggest {
                text.push_str(&format!(" Did you mean {CYAN}{suggest}{RESET}?"));
            }
        }
        report.push(text, error.is_some());
    }
    report
}

/// One line per dependency outcome.
pub fn dependency_report(outcomes: &[DependencyOutcome]) -> Report {
    let mut report = Report::default();
    for outcome in outcomes {
        let text = match &outcome.result {
            Ok(()) => format!(
                "  {} {BLUE}{}{RESET} {GRAY}(wait {:?}){RESET}",
                badge_ok(),
                outcome.url,
                outcome.elapsed
            ),
            Err(_) if outcome.timed_out() => format!(
                "  {} {BLUE}{}{RESET} {RED_BOLD}Target service doesn't exist{RESET} {GRAY}(wait {:?}){RESET}",
                badge_ng(),
                outcome.url,
                outcome.timeout
            ),
            Err(err) => format!(
                "  {} {BLUE}{}{RESET} {RED_BOLD}Error occurred: {err}{RESET}",
                badge_ng(),
                outcome.url
            ),
        };
        report.push(text, !outcome.is_ready());
    }
    report
}

/// `$ command args...`, or `(dry run) command args...`.
pub fn command_line(command: &str, args: &[String], dry_run: bool) -> String {
    let mut text = if dry_run {
        format!("{GRAY}(dry run){RESET} ")
    } else {
        format!("{GRAY}${RESET} ")
    };
    text.push_str(&format!("{CYAN}{command}{RESET}"));
    for arg in args {
        text.push_str(&format!(" {YELLOW}{arg}{RESET}"));
    }
    text.push('\n');
    text
}

/// Final status line of a finished run.
pub fn process_result(run: &ProcessRun) -> String {
    let color = if run.success() { GREEN_BOLD } else { RED_BOLD };
    let mut text = format!("    {color}{}{RESET}", run.status_text());
    if run.force_killed {
        text.push_str(&format!(" {GRAY}(killed after grace period){RESET}"));
    }
    text.push('\n');
    text
}
