use crate::diagnostic::sort_diagnostics;
use crate::diagnostic::Diagnostic;
use crate::diagnostic::RawDiagnostic;
use crate::diagnostic::Severity;
use crate::diagnostic::Stage;
use crate::directives::Suppression;
use crate::expect::BackendExpectation;
use crate::patterns::TargetBackend;
use crate::source::VirtualFile;
use crate::timeout::run_stage;
use crate::timeout::CancelToken;
use crate::timeout::StageWait;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

/// Input to the front end. Files have had their expectation markers removed.
#[derive(Debug, Clone)]
pub struct FrontendRequest {
  pub test_id: String,
  pub test_path: PathBuf,
  pub files: Vec<VirtualFile>,
  pub backend: TargetBackend,
  /// Directory owned by this run; removed when the run ends.
  pub scratch: PathBuf,
}

#[derive(Debug)]
pub struct FrontendOutput<U> {
  pub success: bool,
  pub diagnostics: Vec<RawDiagnostic>,
  /// Handle passed on to [`Compiler::compile`].
  pub unit: Option<U>,
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
  pub test_id: String,
  pub backend: TargetBackend,
  pub scratch: PathBuf,
  /// Where generated artifacts go.
  pub out_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct BackendOutput {
  pub success: bool,
  pub diagnostics: Vec<RawDiagnostic>,
  pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
  #[error("{0}")]
  Failed(String),
  #[error("stage cancelled")]
  Cancelled,
}

/// The compiler under test. Both stages are black boxes; they should poll the
/// token and return [`StageError::Cancelled`] once it trips.
pub trait Compiler: Send + Sync + 'static {
  type Unit: Send + 'static;

  fn analyze(
    &self,
    request: FrontendRequest,
    cancel: &CancelToken,
  ) -> Result<FrontendOutput<Self::Unit>, StageError>;

  fn compile(
    &self,
    unit: Self::Unit,
    request: BackendRequest,
    cancel: &CancelToken,
  ) -> Result<BackendOutput, StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
  Ok,
  Failed,
  Timeout,
  Aborted,
  NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
  pub status: StageStatus,
  pub duration_ms: u128,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Success flag reported by the stage itself.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub success: Option<bool>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<String>,
}

impl StageRecord {
  pub fn not_run(reason: Option<&str>) -> StageRecord {
    StageRecord {
      status: StageStatus::NotRun,
      duration_ms: 0,
      error: reason.map(str::to_string),
      success: None,
      artifacts: Vec::new(),
    }
  }

  fn finished(status: StageStatus, started: Instant, error: Option<String>) -> StageRecord {
    StageRecord {
      status,
      duration_ms: started.elapsed().as_millis(),
      error,
      success: None,
      artifacts: Vec::new(),
    }
  }

  pub fn is_ok(&self) -> bool {
    self.status == StageStatus::Ok
  }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
  pub frontend: StageRecord,
  pub backend: StageRecord,
  /// Diagnostics of both stages, resolved and sorted.
  pub diagnostics: Vec<Diagnostic>,
}

pub struct PipelineRunner<C: Compiler> {
  compiler: Arc<C>,
  backend: TargetBackend,
  stage_timeout: Duration,
  scratch_root: PathBuf,
}

impl<C: Compiler> PipelineRunner<C> {
  pub fn new(
    compiler: Arc<C>,
    backend: TargetBackend,
    stage_timeout: Duration,
    scratch_root: PathBuf,
  ) -> Self {
    Self {
      compiler,
      backend,
      stage_timeout,
      scratch_root,
    }
  }

  /// Runs the front end and, when `expectation` asks for it and the front end
  /// reported no unsuppressed errors, the back end.
  pub fn run(
    &self,
    test_id: &str,
    test_path: &Path,
    files: &[VirtualFile],
    expectation: BackendExpectation,
    suppression: &Suppression,
    abort: &CancelToken,
  ) -> PipelineOutcome {
    let started = Instant::now();
    // Stage threads hold their own handle, so a stage that outlives its
    // timeout removes the directory when it finally returns.
    let scratch = match std::fs::create_dir_all(&self.scratch_root).and_then(|_| {
      tempfile::Builder::new()
        .prefix("diag-")
        .tempdir_in(&self.scratch_root)
    }) {
      Ok(dir) => Arc::new(dir),
      Err(err) => {
        return PipelineOutcome {
          frontend: StageRecord::finished(
            StageStatus::Failed,
            started,
            Some(format!(
              "failed to create scratch directory in {}: {err}",
              self.scratch_root.display()
            )),
          ),
          backend: StageRecord::not_run(None),
          diagnostics: Vec::new(),
        };
      }
    };

    let request = FrontendRequest {
      test_id: test_id.to_string(),
      test_path: test_path.to_path_buf(),
      files: files.to_vec(),
      backend: self.backend.clone(),
      scratch: scratch.path().to_path_buf(),
    };
    let compiler = Arc::clone(&self.compiler);
    let stage_scratch = Arc::clone(&scratch);
    let wait = run_stage(self.stage_timeout, abort, move |token| {
      let _scratch = stage_scratch;
      compiler.analyze(request, &token)
    });

    let (mut frontend, output) = self.finish_stage(wait, started, "front end");
    let Some(output) = output else {
      return PipelineOutcome {
        frontend,
        backend: StageRecord::not_run(None),
        diagnostics: Vec::new(),
      };
    };

    let mut diagnostics: Vec<Diagnostic> = output
      .diagnostics
      .iter()
      .map(|raw| raw.resolve(files, Stage::Frontend))
      .collect();
    let has_errors = diagnostics
      .iter()
      .any(|d| d.severity == Severity::Error && !suppression.is_ignored(d));
    // Suppressed errors still explain a failed front end.
    let reported_errors = diagnostics.iter().any(|d| d.severity == Severity::Error);
    frontend.success = Some(output.success);
    if !output.success && !reported_errors {
      frontend.status = StageStatus::Failed;
      frontend.error = Some("front end reported failure without error diagnostics".to_string());
    }

    let backend = if !frontend.is_ok() || expectation == BackendExpectation::None {
      StageRecord::not_run(None)
    } else if has_errors {
      debug!(test = test_id, "skipping back end after front-end errors");
      StageRecord::not_run(Some("front end reported errors"))
    } else {
      match output.unit {
        Some(unit) => self.run_backend(test_id, unit, &scratch, files, &mut diagnostics, abort),
        None => StageRecord {
          status: StageStatus::Failed,
          duration_ms: 0,
          error: Some("front end produced no analyzed unit".to_string()),
          success: None,
          artifacts: Vec::new(),
        },
      }
    };

    sort_diagnostics(&mut diagnostics);
    PipelineOutcome {
      frontend,
      backend,
      diagnostics,
    }
  }

  fn run_backend(
    &self,
    test_id: &str,
    unit: C::Unit,
    scratch_dir: &Arc<TempDir>,
    files: &[VirtualFile],
    diagnostics: &mut Vec<Diagnostic>,
    abort: &CancelToken,
  ) -> StageRecord {
    let started = Instant::now();
    let scratch = scratch_dir.path();
    let out_dir = scratch.join("out");
    if let Err(err) = std::fs::create_dir_all(&out_dir) {
      return StageRecord::finished(
        StageStatus::Failed,
        started,
        Some(format!("failed to create {}: {err}", out_dir.display())),
      );
    }

    let request = BackendRequest {
      test_id: test_id.to_string(),
      backend: self.backend.clone(),
      scratch: scratch.to_path_buf(),
      out_dir,
    };
    let compiler = Arc::clone(&self.compiler);
    let stage_scratch = Arc::clone(scratch_dir);
    let wait = run_stage(self.stage_timeout, abort, move |token| {
      let _scratch = stage_scratch;
      compiler.compile(unit, request, &token)
    });

    let (mut record, output) = self.finish_stage(wait, started, "back end");
    if let Some(output) = output {
      diagnostics.extend(
        output
          .diagnostics
          .iter()
          .map(|raw| raw.resolve(files, Stage::Backend)),
      );
      record.success = Some(output.success);
      record.artifacts = output
        .artifacts
        .iter()
        .map(|path| {
          path
            .strip_prefix(scratch)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
        })
        .collect();
    }
    record
  }

  fn finish_stage<T>(
    &self,
    wait: StageWait<Result<T, StageError>>,
    started: Instant,
    stage: &str,
  ) -> (StageRecord, Option<T>) {
    match wait {
      StageWait::Completed(Ok(value)) => (StageRecord::finished(StageStatus::Ok, started, None), Some(value)),
      StageWait::Completed(Err(err)) => (
        StageRecord::finished(StageStatus::Failed, started, Some(format!("{stage} failed: {err}"))),
        None,
      ),
      StageWait::Panicked(message) => (
        StageRecord::finished(
          StageStatus::Failed,
          started,
          Some(format!("{stage} panicked: {message}")),
        ),
        None,
      ),
      StageWait::TimedOut => (
        StageRecord::finished(
          StageStatus::Timeout,
          started,
          Some(format!(
            "{stage} exceeded {:.1}s timeout",
            self.stage_timeout.as_secs_f64()
          )),
        ),
        None,
      ),
      StageWait::Aborted => (
        StageRecord::finished(StageStatus::Aborted, started, Some(format!("{stage} aborted"))),
        None,
      ),
    }
  }
}
