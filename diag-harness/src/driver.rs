use crate::audit::audit;
use crate::audit::CompletenessReport;
use crate::compare::check_backend;
use crate::compare::compare;
use crate::compare::render_marked_diff;
use crate::compare::BackendViolation;
use crate::compare::CompareMode;
use crate::compare::DiagnosticDiff;
use crate::expect::extract_expectations;
use crate::expect::BackendExpectation;
use crate::patterns::RuleSet;
use crate::patterns::RunMode;
use crate::patterns::TargetBackend;
use crate::pipeline::Compiler;
use crate::pipeline::PipelineRunner;
use crate::pipeline::StageRecord;
use crate::pipeline::StageStatus;
use crate::scan::scan_corpus;
use crate::scan::Filter;
use crate::scan::ScanOptions;
use crate::scan::Shard;
use crate::source::group_of;
use crate::source::TestFile;
use crate::timeout::CancelToken;
use crate::HarnessError;
use crate::Result;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::debug_span;
use tracing::info;
use tracing::warn;

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SuiteOptions {
  pub name: String,
  pub root: PathBuf,
  pub backend: TargetBackend,
  pub mode: RunMode,
  pub rules: RuleSet,
  pub scan: ScanOptions,
  pub filter: Filter,
  pub shard: Option<Shard>,
  pub jobs: usize,
  pub stage_timeout: Duration,
  pub scratch_root: PathBuf,
  pub compare: CompareMode,
  pub allow_empty: bool,
  /// Tripping this cancels in-flight stages; files not yet started are skipped.
  pub abort: CancelToken,
}

impl SuiteOptions {
  pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<SuiteOptions> {
    let backend = TargetBackend::default();
    Ok(SuiteOptions {
      name: name.into(),
      root: root.into(),
      rules: RuleSet::with_defaults(backend.clone())?,
      backend,
      mode: RunMode::WithBackend,
      scan: ScanOptions::default(),
      filter: Filter::All,
      shard: None,
      jobs: num_cpus::get().max(1),
      stage_timeout: DEFAULT_STAGE_TIMEOUT,
      scratch_root: std::env::temp_dir().join("diag-harness"),
      compare: CompareMode::Exact,
      allow_empty: false,
      abort: CancelToken::new(),
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
  Pass,
  Fail,
  Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  MalformedExpectation,
  StageFailure,
  Timeout,
  ComparisonMismatch,
  BackendViolation,
  /// `IGNORE_BACKEND` names the suite backend but the test passes.
  UnexpectedPass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
  pub kind: FailureKind,
  pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
  pub id: String,
  pub path: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub group: Vec<String>,
  pub verdict: Verdict,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub failures: Vec<FailureReason>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diff: Option<DiagnosticDiff>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub backend_violation: Option<BackendViolation>,
  pub frontend: StageRecord,
  pub backend: StageRecord,
  pub duration_ms: u128,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub notes: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub skip_reason: Option<String>,
  /// Source-annotated diff of expected vs. actual diagnostics.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

impl TestResult {
  fn new(id: &str, path: &Path) -> TestResult {
    TestResult {
      id: id.to_string(),
      path: path.display().to_string(),
      group: group_of(id),
      verdict: Verdict::Pass,
      failures: Vec::new(),
      diff: None,
      backend_violation: None,
      frontend: StageRecord::not_run(None),
      backend: StageRecord::not_run(None),
      duration_ms: 0,
      notes: Vec::new(),
      skip_reason: None,
      detail: None,
    }
  }

  fn skip(mut self, reason: String, started: Instant) -> TestResult {
    self.verdict = Verdict::Skipped;
    self.skip_reason = Some(reason);
    self.duration_ms = started.elapsed().as_millis();
    self
  }

  fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
    self.failures.push(FailureReason {
      kind,
      message: message.into(),
    });
  }

  pub fn has_failure(&self, kind: FailureKind) -> bool {
    self.failures.iter().any(|f| f.kind == kind)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
  pub total: usize,
  pub passed: usize,
  pub failed: usize,
  pub skipped: usize,
  pub timed_out: usize,
  pub malformed: usize,
  pub stage_failures: usize,
  pub mismatches: usize,
  pub backend_violations: usize,
  pub unexpected_passes: usize,
}

impl Summary {
  fn from_results(results: &[TestResult]) -> Summary {
    let mut summary = Summary {
      total: results.len(),
      ..Summary::default()
    };
    for result in results {
      match result.verdict {
        Verdict::Pass => summary.passed += 1,
        Verdict::Skipped => summary.skipped += 1,
        Verdict::Fail => {
          summary.failed += 1;
          for failure in &result.failures {
            let counter = match failure.kind {
              FailureKind::MalformedExpectation => &mut summary.malformed,
              FailureKind::StageFailure => &mut summary.stage_failures,
              FailureKind::Timeout => &mut summary.timed_out,
              FailureKind::ComparisonMismatch => &mut summary.mismatches,
              FailureKind::BackendViolation => &mut summary.backend_violations,
              FailureKind::UnexpectedPass => &mut summary.unexpected_passes,
            };
            *counter += 1;
          }
        }
      }
    }
    summary
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
  pub suite: String,
  pub backend: TargetBackend,
  pub mode: RunMode,
  pub summary: Summary,
  pub results: Vec<TestResult>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub warnings: Vec<String>,
  /// Present when registrations were supplied.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completeness: Option<CompletenessReport>,
}

impl SuiteReport {
  pub fn is_success(&self) -> bool {
    self.summary.failed == 0 && self.completeness.as_ref().map_or(true, |c| c.is_empty())
  }
}

/// Ids of the active files of a suite, in scan order, before filtering.
pub fn active_ids(opts: &SuiteOptions) -> Result<(Vec<String>, Vec<String>)> {
  let corpus = scan_corpus(&opts.root, opts.scan.clone())?;
  let active = opts
    .rules
    .active_ids(&corpus.entries, &opts.backend, opts.mode);
  Ok((active, corpus.warnings))
}

pub fn run_suite<C: Compiler>(
  opts: &SuiteOptions,
  compiler: Arc<C>,
  registered: Option<&BTreeSet<String>>,
) -> Result<SuiteReport> {
  let (active, warnings) = active_ids(opts)?;
  let completeness = registered.map(|registered| audit(active.iter().map(String::as_str), registered));

  let selected: Vec<String> = active
    .into_iter()
    .filter(|id| opts.filter.matches(id))
    .enumerate()
    .filter(|(idx, _)| opts.shard.map_or(true, |shard| shard.includes(*idx)))
    .map(|(_, id)| id)
    .collect();
  if selected.is_empty() && !opts.allow_empty {
    return Err(HarnessError::EmptySuite {
      root: opts.root.clone(),
    });
  }
  info!(
    suite = %opts.name,
    backend = %opts.backend,
    mode = opts.mode.as_str(),
    tests = selected.len(),
    "running suite"
  );

  let runner = PipelineRunner::new(
    compiler,
    opts.backend.clone(),
    opts.stage_timeout,
    opts.scratch_root.clone(),
  );
  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(opts.jobs.max(1))
    .build()
    .map_err(|err| HarnessError::Config(format!("create thread pool: {err}")))?;

  let runner_ref = &runner;
  let mut results: Vec<TestResult> = pool.install(|| {
    selected
      .into_par_iter()
      .map(|id| evaluate(&id, opts, runner_ref))
      .collect::<Result<Vec<_>>>()
  })?;
  results.sort_by(|a, b| Path::new(&a.id).cmp(Path::new(&b.id)));

  Ok(SuiteReport {
    suite: opts.name.clone(),
    backend: opts.backend.clone(),
    mode: opts.mode,
    summary: Summary::from_results(&results),
    results,
    warnings,
    completeness,
  })
}

fn evaluate<C: Compiler>(
  id: &str,
  opts: &SuiteOptions,
  runner: &PipelineRunner<C>,
) -> Result<TestResult> {
  let started = Instant::now();
  let span = debug_span!("test", id = %id);
  let _enter = span.enter();

  if opts.abort.is_cancelled() {
    return Ok(TestResult::new(id, &opts.root.join(id)).skip("run aborted".to_string(), started));
  }

  let test = TestFile::load(&opts.root, id)?;
  let mut result = TestResult::new(id, &test.path);
  result.notes = test.notes.clone();

  if !test.options.runs_on(&opts.backend) {
    let targets: Vec<&str> = test
      .options
      .target_backends
      .iter()
      .map(|b| b.as_str())
      .collect();
    return Ok(result.skip(
      format!(
        "TARGET_BACKEND {} excludes {}",
        targets.join(", "),
        opts.backend
      ),
      started,
    ));
  }

  let extracted = match extract_expectations(&test) {
    Ok(extracted) => extracted,
    Err(err) => {
      warn!(test = id, error = %err, "malformed expectation");
      result.fail(FailureKind::MalformedExpectation, err.to_string());
      result.verdict = Verdict::Fail;
      result.duration_ms = started.elapsed().as_millis();
      return Ok(result);
    }
  };

  let expectation = match opts.mode {
    RunMode::FrontendOnly => BackendExpectation::None,
    RunMode::WithBackend => extracted
      .backend
      .unwrap_or(BackendExpectation::MustSucceed),
  };
  let outcome = runner.run(
    &test.id,
    &test.path,
    &extracted.files,
    expectation,
    &test.options.suppression,
    &opts.abort,
  );
  result.frontend = outcome.frontend;
  result.backend = outcome.backend;

  let stages = [
    ("front end", result.frontend.status, result.frontend.error.clone()),
    ("back end", result.backend.status, result.backend.error.clone()),
  ];
  for (stage, status, error) in stages {
    let message = error.unwrap_or_default();
    match status {
      StageStatus::Timeout => {
        warn!(test = id, stage, "stage timed out");
        result.fail(FailureKind::Timeout, message);
      }
      StageStatus::Failed => {
        warn!(test = id, stage, error = %message, "stage failed");
        result.fail(FailureKind::StageFailure, message);
      }
      StageStatus::Aborted => {
        return Ok(result.skip("run aborted".to_string(), started));
      }
      StageStatus::Ok | StageStatus::NotRun => {}
    }
  }

  if result.frontend.is_ok() {
    let diff = compare(
      &extracted.expectations,
      &outcome.diagnostics,
      &test.options.suppression,
      opts.compare,
    );
    if !diff.is_match() {
      result.fail(FailureKind::ComparisonMismatch, diff.render());
      let considered: Vec<_> = outcome
        .diagnostics
        .iter()
        .filter(|d| !test.options.suppression.is_ignored(d))
        .cloned()
        .collect();
      let marked = render_marked_diff(&extracted.files, &extracted.expectations, &considered);
      result.detail = (!marked.is_empty()).then_some(marked);
    }
    result.diff = Some(diff);
  }

  if let Some(violation) = check_backend(expectation, &result.backend) {
    result.fail(FailureKind::BackendViolation, violation.message.clone());
    result.backend_violation = Some(violation);
  }

  result.verdict = if result.failures.is_empty() {
    Verdict::Pass
  } else {
    Verdict::Fail
  };

  if opts.mode == RunMode::WithBackend && test.options.ignores(&opts.backend) {
    match result.verdict {
      Verdict::Fail => {
        result.verdict = Verdict::Skipped;
        result.skip_reason = Some(format!("known failure on {} (IGNORE_BACKEND)", opts.backend));
      }
      Verdict::Pass => {
        result.fail(
          FailureKind::UnexpectedPass,
          format!(
            "test passes on {}; remove it from IGNORE_BACKEND",
            opts.backend
          ),
        );
        result.verdict = Verdict::Fail;
      }
      Verdict::Skipped => {}
    }
  }

  result.duration_ms = started.elapsed().as_millis();
  Ok(result)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn result(verdict: Verdict, kinds: &[FailureKind]) -> TestResult {
    let mut result = TestResult::new("a.kt", Path::new("a.kt"));
    result.verdict = verdict;
    for kind in kinds {
      result.fail(*kind, "x");
    }
    result
  }

  #[test]
  fn summary_counts_failure_kinds_of_failed_tests_only() {
    let summary = Summary::from_results(&[
      result(Verdict::Pass, &[]),
      result(
        Verdict::Fail,
        &[FailureKind::ComparisonMismatch, FailureKind::BackendViolation],
      ),
      result(Verdict::Fail, &[FailureKind::Timeout]),
      result(Verdict::Skipped, &[FailureKind::StageFailure]),
    ]);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.mismatches, 1);
    assert_eq!(summary.backend_violations, 1);
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.stage_failures, 0);
  }

  #[test]
  fn groups_come_from_directories() {
    let result = TestResult::new("diagnostics/nested/a.kt", Path::new("x"));
    assert_eq!(result.group, vec!["diagnostics", "nested"]);
  }

  #[test]
  fn report_success_requires_complete_registrations() {
    let mut report = SuiteReport {
      suite: "s".to_string(),
      backend: TargetBackend::default(),
      mode: RunMode::WithBackend,
      summary: Summary::default(),
      results: Vec::new(),
      warnings: Vec::new(),
      completeness: Some(CompletenessReport::default()),
    };
    assert!(report.is_success());
    report
      .completeness
      .as_mut()
      .unwrap()
      .missing_registrations
      .insert("b.kt".to_string());
    assert!(!report.is_success());
  }
}
