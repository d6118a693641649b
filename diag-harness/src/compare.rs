use crate::diagnostic::Diagnostic;
use crate::directives::Suppression;
use crate::expect::BackendExpectation;
use crate::expect::ExpectationSet;
use crate::expect::ExpectedDiagnostic;
use crate::expect::ExpectedLocation;
use crate::pipeline::StageRecord;
use crate::pipeline::StageStatus;
use crate::source::LineIndex;
use crate::source::VirtualFile;
use clap::ValueEnum;
use serde::Deserialize;
use serde::Serialize;
use similar::ChangeTag;
use similar::TextDiff;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
  /// Exact ranges, codes, and message substrings.
  #[default]
  Exact,
  /// Ignores messages and accepts overlapping ranges.
  Lenient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticDiff {
  pub missing: Vec<ExpectedDiagnostic>,
  pub unexpected: Vec<Diagnostic>,
  /// Actual diagnostics dropped by `DIAGNOSTICS:` suppression.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub ignored: Vec<Diagnostic>,
}

impl DiagnosticDiff {
  pub fn is_match(&self) -> bool {
    self.missing.is_empty() && self.unexpected.is_empty()
  }

  pub fn render(&self) -> String {
    let mut out = String::new();
    for expected in &self.missing {
      let _ = writeln!(out, "- {}", expected.describe());
    }
    for actual in &self.unexpected {
      let _ = writeln!(out, "+ {}", actual.describe());
    }
    out
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
  Strict,
  Loose,
}

/// Pairs expectations with actual diagnostics. Each actual diagnostic
/// satisfies at most one expectation; exact locations are paired before
/// overlapping ones so a loose match cannot steal an exact one.
pub fn compare(
  expected: &ExpectationSet,
  actual: &[Diagnostic],
  suppression: &Suppression,
  mode: CompareMode,
) -> DiagnosticDiff {
  let (ignored, considered): (Vec<&Diagnostic>, Vec<&Diagnostic>) =
    actual.iter().partition(|diag| suppression.is_ignored(diag));

  let mut used = vec![false; considered.len()];
  let mut satisfied = vec![false; expected.len()];
  let passes: &[Pass] = match mode {
    CompareMode::Exact => &[Pass::Strict],
    CompareMode::Lenient => &[Pass::Strict, Pass::Loose],
  };

  for pass in passes {
    for (exp_idx, exp) in expected.iter().enumerate() {
      if satisfied[exp_idx] {
        continue;
      }
      let found = considered
        .iter()
        .enumerate()
        .find(|(idx, actual)| !used[*idx] && matches(exp, actual, mode, *pass));
      if let Some((idx, _)) = found {
        used[idx] = true;
        satisfied[exp_idx] = true;
      }
    }
  }

  DiagnosticDiff {
    missing: expected
      .iter()
      .zip(&satisfied)
      .filter(|(_, ok)| !**ok)
      .map(|(exp, _)| exp.clone())
      .collect(),
    unexpected: considered
      .iter()
      .zip(&used)
      .filter(|(diag, used)| !**used && diag.severity.must_match())
      .map(|(diag, _)| (*diag).clone())
      .collect(),
    ignored: ignored.into_iter().cloned().collect(),
  }
}

fn matches(expected: &ExpectedDiagnostic, actual: &Diagnostic, mode: CompareMode, pass: Pass) -> bool {
  if expected.file != actual.file || expected.severity != actual.severity {
    return false;
  }
  if let Some(code) = &expected.code {
    if actual.code.as_deref() != Some(code.as_str()) {
      return false;
    }
  }
  if mode == CompareMode::Exact {
    if let Some(message) = &expected.message {
      if !actual
        .message
        .as_deref()
        .is_some_and(|actual| actual.contains(message.as_str()))
      {
        return false;
      }
    }
  }

  let range = &actual.range;
  match (&expected.location, pass) {
    (ExpectedLocation::Line { line }, Pass::Strict) => range.start.line == *line,
    (ExpectedLocation::Line { line }, Pass::Loose) => range.spans_line(*line),
    (ExpectedLocation::Point { position }, Pass::Strict) => {
      range.start.line == position.line && range.start.column == position.column
    }
    (ExpectedLocation::Point { position }, Pass::Loose) => range.contains(position),
    (ExpectedLocation::Range { range: want }, Pass::Strict) => {
      range.start.offset == want.start.offset && range.end.offset == want.end.offset
    }
    (ExpectedLocation::Range { range: want }, Pass::Loose) => range.overlaps(want),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendViolation {
  pub expected: BackendExpectation,
  pub message: String,
}

/// Checks the back-end result against the expectation. Stage failures and
/// runs skipped after front-end errors are not violations; they are reported
/// elsewhere or are the expected outcome.
pub fn check_backend(
  expectation: BackendExpectation,
  backend: &StageRecord,
) -> Option<BackendViolation> {
  if expectation == BackendExpectation::None || backend.status != StageStatus::Ok {
    return None;
  }

  let succeeded = backend.success == Some(true);
  let message = match expectation {
    BackendExpectation::MustSucceed if !succeeded => {
      "expected back end to succeed, but it failed".to_string()
    }
    BackendExpectation::MustFailWithoutOutput if succeeded => {
      "expected back end to fail, but it succeeded".to_string()
    }
    BackendExpectation::MustFailWithoutOutput if !backend.artifacts.is_empty() => format!(
      "back end failed but left artifacts: {}",
      backend.artifacts.join(", ")
    ),
    _ => return None,
  };

  Some(BackendViolation {
    expected: expectation,
    message,
  })
}

/// Renders expected and actual diagnostics as `//~` annotation lines under the
/// source lines they start on, and diffs the two renditions. Returns an empty
/// string when they agree.
pub fn render_marked_diff(
  files: &[VirtualFile],
  expected: &ExpectationSet,
  actual: &[Diagnostic],
) -> String {
  let expected_text = annotate(files, |file, line| {
    expected
      .iter()
      .filter(|e| e.file == file && e.location.start_line() == line)
      .map(|e| annotation(e.severity.as_str(), e.code.as_deref(), e.message.as_deref()))
      .collect()
  });
  let actual_text = annotate(files, |file, line| {
    actual
      .iter()
      .filter(|d| d.file == file && d.range.start.line == line)
      .map(|d| annotation(d.severity.as_str(), d.code.as_deref(), d.message.as_deref()))
      .collect()
  });

  if expected_text == actual_text {
    return String::new();
  }

  let mut out = String::from("--- expected\n+++ actual\n");
  let diff = TextDiff::from_lines(&expected_text, &actual_text);
  for change in diff.iter_all_changes() {
    let sign = match change.tag() {
      ChangeTag::Delete => "-",
      ChangeTag::Insert => "+",
      ChangeTag::Equal => " ",
    };
    out.push_str(sign);
    out.push_str(&change.to_string_lossy());
    if !out.ends_with('\n') {
      out.push('\n');
    }
  }
  out
}

fn annotation(severity: &str, code: Option<&str>, message: Option<&str>) -> String {
  let mut out = format!("//~ {severity}");
  if let Some(code) = code {
    let _ = write!(out, "[{code}]");
  }
  if let Some(message) = message {
    let _ = write!(out, " {message:?}");
  }
  out
}

fn annotate(files: &[VirtualFile], notes_for: impl Fn(&str, usize) -> Vec<String>) -> String {
  let mut out = String::new();
  for file in files {
    if files.len() > 1 {
      let _ = writeln!(out, "// FILE: {}", file.name);
    }
    let index = LineIndex::new(&file.content);
    for line in 1..=index.line_count() {
      out.push_str(index.line_text(line).unwrap_or(""));
      out.push('\n');
      let mut notes = notes_for(&file.name, line);
      notes.sort();
      for note in notes {
        out.push_str(&note);
        out.push('\n');
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::diagnostic::RawDiagnostic;
  use crate::diagnostic::Severity;
  use crate::diagnostic::Stage;
  use crate::expect::extract_expectations;
  use crate::source::TestFile;
  use std::path::PathBuf;

  const SOURCE: &str = "fun main() {\n  val unused = 1\n  println(missing)\n}\n";

  fn expectations(annotations: &str) -> (Vec<VirtualFile>, ExpectationSet) {
    let source = format!("{SOURCE}{annotations}");
    let test = TestFile::from_source("a.kt", PathBuf::from("a.kt"), &source);
    let extracted = extract_expectations(&test).unwrap();
    (extracted.files, extracted.expectations)
  }

  fn actual(files: &[VirtualFile], raws: Vec<RawDiagnostic>) -> Vec<Diagnostic> {
    raws
      .iter()
      .map(|raw| raw.resolve(files, Stage::Frontend))
      .collect()
  }

  fn unused_warning() -> RawDiagnostic {
    RawDiagnostic::new(Severity::Warning)
      .with_code("UNUSED_VARIABLE")
      .with_message("variable 'unused' is never used")
      .with_span(19, 25)
  }

  #[test]
  fn matching_line_expectation_passes() {
    let (files, expected) = expectations("// expect: warning UNUSED_VARIABLE at 2 \"never used\"\n");
    let diff = compare(
      &expected,
      &actual(&files, vec![unused_warning()]),
      &Suppression::default(),
      CompareMode::Exact,
    );
    assert!(diff.is_match(), "{}", diff.render());
  }

  #[test]
  fn wrong_line_reports_both_sides() {
    let (files, expected) = expectations("// expect: warning at 3\n");
    let diff = compare(
      &expected,
      &actual(&files, vec![unused_warning()]),
      &Suppression::default(),
      CompareMode::Exact,
    );
    assert_eq!(diff.missing.len(), 1);
    assert_eq!(diff.unexpected.len(), 1);
    assert_eq!(
      diff.render(),
      "- a.kt:3 warning\n+ a.kt:2:7 warning[UNUSED_VARIABLE] \"variable 'unused' is never used\"\n"
    );
  }

  #[test]
  fn message_must_be_a_substring_in_exact_mode_only() {
    let (files, expected) = expectations("// expect: warning at 2 \"is always used\"\n");
    let actual = actual(&files, vec![unused_warning()]);
    let exact = compare(&expected, &actual, &Suppression::default(), CompareMode::Exact);
    assert!(!exact.is_match());
    let lenient = compare(&expected, &actual, &Suppression::default(), CompareMode::Lenient);
    assert!(lenient.is_match());
  }

  #[test]
  fn lenient_mode_accepts_overlap() {
    let (files, expected) = expectations("// expect: warning at 2:3-2:11\n");
    let actual = actual(&files, vec![unused_warning()]);
    assert!(!compare(&expected, &actual, &Suppression::default(), CompareMode::Exact).is_match());
    assert!(compare(&expected, &actual, &Suppression::default(), CompareMode::Lenient).is_match());
  }

  #[test]
  fn strict_matches_win_over_loose_ones() {
    let (files, expected) =
      expectations("// expect: warning at 2:3-2:11\n// expect: warning at 2:7-2:13\n");
    let wide = RawDiagnostic::new(Severity::Warning).with_span(15, 23);
    let actual = actual(&files, vec![unused_warning(), wide]);
    let diff = compare(&expected, &actual, &Suppression::default(), CompareMode::Lenient);
    assert!(diff.is_match(), "{}", diff.render());
  }

  #[test]
  fn infos_are_tolerated_and_suppressed_codes_ignored() {
    let (files, expected) = expectations("");
    let info = RawDiagnostic::new(Severity::Info).with_code("NOTE").with_span(0, 3);
    let actual = actual(&files, vec![unused_warning(), info]);
    let mut suppression = Suppression::default();
    suppression.codes.insert("UNUSED_VARIABLE".to_string());
    let diff = compare(&expected, &actual, &suppression, CompareMode::Exact);
    assert!(diff.is_match());
    assert_eq!(diff.ignored.len(), 1);
  }

  #[test]
  fn new_error_is_unexpected() {
    let (files, expected) = expectations("// expect: warning at 2\n");
    let error = RawDiagnostic::new(Severity::Error)
      .with_code("UNRESOLVED_REFERENCE")
      .at(3, 11);
    let diff = compare(
      &expected,
      &actual(&files, vec![unused_warning(), error]),
      &Suppression::default(),
      CompareMode::Exact,
    );
    assert!(diff.missing.is_empty());
    assert_eq!(diff.unexpected.len(), 1);
    assert_eq!(diff.unexpected[0].code.as_deref(), Some("UNRESOLVED_REFERENCE"));
  }

  fn backend(success: bool, artifacts: &[&str]) -> StageRecord {
    let mut record = StageRecord::not_run(None);
    record.status = StageStatus::Ok;
    record.success = Some(success);
    record.artifacts = artifacts.iter().map(|s| s.to_string()).collect();
    record
  }

  #[test]
  fn backend_expectations() {
    use BackendExpectation as B;
    assert!(check_backend(B::MustSucceed, &backend(true, &["out/main.js"])).is_none());
    assert!(check_backend(B::MustSucceed, &backend(false, &[])).is_some());
    assert!(check_backend(B::MustFailWithoutOutput, &backend(false, &[])).is_none());
    let violation =
      check_backend(B::MustFailWithoutOutput, &backend(true, &["out/main.js"])).unwrap();
    assert!(violation.message.contains("succeeded"));
    let violation =
      check_backend(B::MustFailWithoutOutput, &backend(false, &["out/partial.js"])).unwrap();
    assert!(violation.message.contains("out/partial.js"));
    let blocked = StageRecord::not_run(Some("front end reported errors"));
    assert!(check_backend(B::MustSucceed, &blocked).is_none());
    assert!(check_backend(B::None, &backend(false, &[])).is_none());
  }

  #[test]
  fn marked_diff_shows_annotations() {
    let (files, expected) = expectations("// expect: warning at 3\n");
    let actual = actual(&files, vec![unused_warning()]);
    let diff = render_marked_diff(&files, &expected, &actual);
    assert!(diff.contains("+//~ warning[UNUSED_VARIABLE]"));
    assert!(diff.contains("-//~ warning\n"));

    let (files, expected) = expectations("");
    assert_eq!(render_marked_diff(&files, &expected, &[]), "");
  }
}
