#![allow(dead_code)]

use diag_harness::pipeline::BackendOutput;
use diag_harness::pipeline::BackendRequest;
use diag_harness::pipeline::FrontendOutput;
use diag_harness::pipeline::FrontendRequest;
use diag_harness::pipeline::StageError;
use diag_harness::CancelToken;
use diag_harness::Compiler;
use diag_harness::RawDiagnostic;
use diag_harness::Severity;
use diag_harness::SuiteOptions;
use diag_harness::VirtualFile;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Front end driven by tokens in the source text. Comment lines are ignored.
///
/// - `unused` reports warning `UNUSED_VALUE` "unused value"
/// - `missing_ref` reports error `UNRESOLVED_REFERENCE` "unresolved reference"
/// - `note_here` reports info `NOTE`
/// - `frontend_fail` makes the front end return an error
/// - `sleep_forever` spins until cancelled
/// - `panic_now` panics
///
/// The back end writes `out/main.js` unless the source mentions
/// `backend_error` (fails cleanly) or `backend_leak` (fails but leaves output).
#[derive(Default)]
pub struct FakeCompiler {
  pub frontend_calls: AtomicUsize,
  pub backend_calls: AtomicUsize,
  pub scratch_dirs: Mutex<Vec<std::path::PathBuf>>,
}

pub struct FakeUnit {
  files: Vec<VirtualFile>,
}

fn code_lines(file: &VirtualFile) -> impl Iterator<Item = (usize, &str)> {
  file
    .content
    .lines()
    .enumerate()
    .map(|(idx, line)| (idx + 1, line))
    .filter(|(_, line)| !line.trim_start().starts_with("//"))
}

fn mentions(files: &[VirtualFile], token: &str) -> bool {
  files
    .iter()
    .any(|file| code_lines(file).any(|(_, line)| line.contains(token)))
}

fn token_diagnostics(
  file: &VirtualFile,
  token: &str,
  severity: Severity,
  code: &str,
  message: &str,
) -> Vec<RawDiagnostic> {
  let mut out = Vec::new();
  for (line, text) in code_lines(file) {
    for (byte, _) in text.match_indices(token) {
      let column = text[..byte].chars().count() + 1;
      let mut diag = RawDiagnostic::new(severity)
        .with_code(code)
        .with_message(message)
        .in_file(file.name.clone())
        .at(line, column);
      diag.end_line = Some(line);
      diag.end_column = Some(column + token.chars().count());
      out.push(diag);
    }
  }
  out
}

impl Compiler for FakeCompiler {
  type Unit = FakeUnit;

  fn analyze(
    &self,
    request: FrontendRequest,
    cancel: &CancelToken,
  ) -> Result<FrontendOutput<FakeUnit>, StageError> {
    self.frontend_calls.fetch_add(1, Ordering::SeqCst);
    self
      .scratch_dirs
      .lock()
      .unwrap()
      .push(request.scratch.clone());
    let files = request.files;

    if mentions(&files, "panic_now") {
      panic!("front end exploded");
    }
    if mentions(&files, "sleep_forever") {
      while !cancel.is_cancelled() {
        std::thread::sleep(Duration::from_millis(5));
      }
      return Err(StageError::Cancelled);
    }
    if mentions(&files, "frontend_fail") {
      return Err(StageError::Failed("analyzer crashed".to_string()));
    }

    let mut diagnostics = Vec::new();
    for file in &files {
      diagnostics.extend(token_diagnostics(
        file,
        "unused",
        Severity::Warning,
        "UNUSED_VALUE",
        "unused value",
      ));
      diagnostics.extend(token_diagnostics(
        file,
        "missing_ref",
        Severity::Error,
        "UNRESOLVED_REFERENCE",
        "unresolved reference",
      ));
      diagnostics.extend(token_diagnostics(
        file,
        "note_here",
        Severity::Info,
        "NOTE",
        "note",
      ));
    }
    let success = !diagnostics
      .iter()
      .any(|d| d.severity == Some(Severity::Error));
    Ok(FrontendOutput {
      success,
      diagnostics,
      unit: Some(FakeUnit { files }),
    })
  }

  fn compile(
    &self,
    unit: FakeUnit,
    request: BackendRequest,
    _cancel: &CancelToken,
  ) -> Result<BackendOutput, StageError> {
    self.backend_calls.fetch_add(1, Ordering::SeqCst);
    let leak = mentions(&unit.files, "backend_leak");
    let fail = leak || mentions(&unit.files, "backend_error");
    let mut artifacts = Vec::new();
    if !fail || leak {
      let out = request.out_dir.join("main.js");
      std::fs::write(&out, "// generated\n").map_err(|err| StageError::Failed(err.to_string()))?;
      artifacts.push(out);
    }
    Ok(BackendOutput {
      success: !fail,
      diagnostics: Vec::new(),
      artifacts,
    })
  }
}

pub struct Corpus {
  pub dir: TempDir,
}

impl Corpus {
  pub fn new(files: &[(&str, &str)]) -> Corpus {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
      write_file(dir.path(), name, contents);
    }
    Corpus { dir }
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }

  pub fn write(&self, name: &str, contents: &str) {
    write_file(self.root(), name, contents);
  }

  pub fn remove(&self, name: &str) {
    std::fs::remove_file(self.root().join(name)).unwrap();
  }

  /// Options with a scratch root inside a separate temp dir the caller keeps.
  pub fn options(&self, scratch: &TempDir) -> SuiteOptions {
    let mut opts = SuiteOptions::new("diagnostics", self.root()).unwrap();
    opts.jobs = 2;
    opts.scratch_root = scratch.path().to_path_buf();
    opts.stage_timeout = Duration::from_secs(5);
    opts
  }
}

pub fn write_file(root: &Path, name: &str, contents: &str) {
  let path = root.join(name);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, contents).unwrap();
}
