use crate::driver::FailureKind;
use crate::driver::SuiteReport;
use crate::driver::Verdict;
use anyhow::Context;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Bumped whenever the JSON layout changes incompatibly.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Top-level JSON document for one harness invocation.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
  pub schema_version: u32,
  pub success: bool,
  pub suites: &'a [SuiteReport],
}

impl<'a> RunReport<'a> {
  pub fn new(suites: &'a [SuiteReport]) -> Self {
    Self {
      schema_version: REPORT_SCHEMA_VERSION,
      success: suites.iter().all(SuiteReport::is_success),
      suites,
    }
  }
}

/// Pretty JSON with a trailing newline. Results are sorted by id and maps are
/// `BTreeMap`/`BTreeSet`, so equal runs render identically apart from
/// durations.
pub fn render_json<T: Serialize>(report: &T) -> anyhow::Result<String> {
  let mut text = serde_json::to_string_pretty(report).context("serialize JSON report")?;
  text.push('\n');
  Ok(text)
}

/// Writes the report to `path`, creating missing parent directories.
pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> anyhow::Result<()> {
  let text = render_json(report)?;
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
  }
  fs::write(path, text).with_context(|| format!("write report to {}", path.display()))
}

pub fn print_json_report<T: Serialize>(report: &T) -> anyhow::Result<()> {
  let text = render_json(report)?;
  io::stdout()
    .lock()
    .write_all(text.as_bytes())
    .context("write JSON report to stdout")
}

/// Human-readable rendition: one block per failing test, then scan warnings,
/// completeness problems and the summary line. Skips are listed only when
/// `verbose` is set.
pub fn render_human(report: &SuiteReport, verbose: bool) -> String {
  let mut out = String::new();
  for result in &report.results {
    match result.verdict {
      Verdict::Pass => {
        if verbose {
          let _ = writeln!(out, "PASS {}", result.id);
        }
      }
      Verdict::Skipped => {
        if verbose {
          let _ = writeln!(
            out,
            "SKIP {} ({})",
            result.id,
            result.skip_reason.as_deref().unwrap_or("skipped")
          );
        }
      }
      Verdict::Fail => {
        let _ = writeln!(out, "FAIL {}", result.id);
        // Mismatches are shown through the diff below.
        for failure in &result.failures {
          if failure.kind != FailureKind::ComparisonMismatch {
            let _ = writeln!(out, "  {}", failure.message);
          }
        }
        if let Some(diff) = &result.diff {
          for line in diff.render().lines() {
            let _ = writeln!(out, "  {line}");
          }
        }
        if let Some(detail) = &result.detail {
          for line in detail.lines() {
            let _ = writeln!(out, "  | {line}");
          }
        }
      }
    }
    if verbose {
      for note in &result.notes {
        let _ = writeln!(out, "  note: {note}");
      }
    }
  }

  for warning in &report.warnings {
    let _ = writeln!(out, "warning: {warning}");
  }
  if let Some(completeness) = &report.completeness {
    out.push_str(&completeness.render());
  }

  let summary = &report.summary;
  let _ = writeln!(
    out,
    "{} [{} {}]: ran {} test(s): {} passed, {} failed, {} skipped",
    report.suite,
    report.backend,
    report.mode.as_str(),
    summary.total,
    summary.passed,
    summary.failed,
    summary.skipped
  );
  out
}
