//! Runs the compiler under test as external commands speaking JSON.
//!
//! The front-end command prints `{"success": bool, "diagnostics": [...]}` on
//! stdout; the back-end command prints the same plus `"artifacts": [paths]`.

use crate::diagnostic::RawDiagnostic;
use crate::pipeline::BackendOutput;
use crate::pipeline::BackendRequest;
use crate::pipeline::Compiler;
use crate::pipeline::FrontendOutput;
use crate::pipeline::FrontendRequest;
use crate::pipeline::StageError;
use crate::timeout::CancelToken;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL: usize = 2000;

pub const ENV_TEST: &str = "DIAG_HARNESS_TEST";
pub const ENV_BACKEND: &str = "DIAG_HARNESS_BACKEND";
pub const ENV_SCRATCH: &str = "DIAG_HARNESS_SCRATCH";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
  /// Program followed by its arguments. Arguments may use `{backend}`,
  /// `{scratch}`, `{out}`, `{test}`, and a standalone `{files}`.
  pub command: Vec<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FrontendReport {
  success: bool,
  #[serde(default)]
  diagnostics: Vec<RawDiagnostic>,
}

#[derive(Debug, Deserialize)]
struct BackendReport {
  success: bool,
  #[serde(default)]
  diagnostics: Vec<RawDiagnostic>,
  #[serde(default)]
  artifacts: Vec<PathBuf>,
}

/// What the front end leaves behind for the back end.
#[derive(Debug, Clone)]
pub struct ProcessUnit {
  test_path: PathBuf,
  files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ProcessCompiler {
  frontend: CommandSpec,
  backend: Option<CommandSpec>,
}

impl ProcessCompiler {
  pub fn new(frontend: CommandSpec, backend: Option<CommandSpec>) -> anyhow::Result<Self> {
    if frontend.command.is_empty() {
      bail!("front-end command is empty");
    }
    if backend.as_ref().is_some_and(|spec| spec.command.is_empty()) {
      bail!("back-end command is empty");
    }
    Ok(Self { frontend, backend })
  }

  fn analyze_inner(
    &self,
    request: &FrontendRequest,
    cancel: &CancelToken,
  ) -> anyhow::Result<Option<FrontendOutput<ProcessUnit>>> {
    let src_dir = request.scratch.join("src");
    let mut files = Vec::with_capacity(request.files.len());
    for file in &request.files {
      let path = src_dir.join(safe_relative(&file.name)?);
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
          .with_context(|| format!("create {}", parent.display()))?;
      }
      std::fs::write(&path, file.content.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
      files.push(path);
    }

    let vars = Placeholders {
      backend: request.backend.as_str(),
      scratch: &request.scratch,
      out: &request.scratch.join("out"),
      test: &request.test_path,
      files: &files,
    };
    let Some(stdout) = run_command(&self.frontend, &vars, cancel)? else {
      return Ok(None);
    };
    let report: FrontendReport = serde_json::from_str(stdout.trim())
      .with_context(|| format!("parse front-end report: {}", truncate(&stdout)))?;

    Ok(Some(FrontendOutput {
      success: report.success,
      diagnostics: relativize(report.diagnostics, &src_dir),
      unit: Some(ProcessUnit {
        test_path: request.test_path.clone(),
        files,
      }),
    }))
  }

  fn compile_inner(
    &self,
    spec: &CommandSpec,
    unit: &ProcessUnit,
    request: &BackendRequest,
    cancel: &CancelToken,
  ) -> anyhow::Result<Option<BackendOutput>> {
    let vars = Placeholders {
      backend: request.backend.as_str(),
      scratch: &request.scratch,
      out: &request.out_dir,
      test: &unit.test_path,
      files: &unit.files,
    };
    let Some(stdout) = run_command(spec, &vars, cancel)? else {
      return Ok(None);
    };
    let report: BackendReport = serde_json::from_str(stdout.trim())
      .with_context(|| format!("parse back-end report: {}", truncate(&stdout)))?;

    // Files left in the output directory count even if the command did not
    // report them.
    let mut artifacts: BTreeSet<PathBuf> = report
      .artifacts
      .into_iter()
      .map(|path| {
        if path.is_absolute() {
          path
        } else {
          request.scratch.join(path)
        }
      })
      .collect();
    for entry in WalkDir::new(&request.out_dir).into_iter().filter_map(|e| e.ok()) {
      if entry.file_type().is_file() {
        artifacts.insert(entry.into_path());
      }
    }

    Ok(Some(BackendOutput {
      success: report.success,
      diagnostics: relativize(report.diagnostics, &request.scratch.join("src")),
      artifacts: artifacts.into_iter().collect(),
    }))
  }
}

impl Compiler for ProcessCompiler {
  type Unit = ProcessUnit;

  fn analyze(
    &self,
    request: FrontendRequest,
    cancel: &CancelToken,
  ) -> Result<FrontendOutput<ProcessUnit>, StageError> {
    match self.analyze_inner(&request, cancel) {
      Ok(Some(output)) => Ok(output),
      Ok(None) => Err(StageError::Cancelled),
      Err(err) => Err(StageError::Failed(format!("{err:#}"))),
    }
  }

  fn compile(
    &self,
    unit: ProcessUnit,
    request: BackendRequest,
    cancel: &CancelToken,
  ) -> Result<BackendOutput, StageError> {
    let Some(spec) = &self.backend else {
      return Err(StageError::Failed("no back-end command configured".to_string()));
    };
    match self.compile_inner(spec, &unit, &request, cancel) {
      Ok(Some(output)) => Ok(output),
      Ok(None) => Err(StageError::Cancelled),
      Err(err) => Err(StageError::Failed(format!("{err:#}"))),
    }
  }
}

struct Placeholders<'a> {
  backend: &'a str,
  scratch: &'a Path,
  out: &'a Path,
  test: &'a Path,
  files: &'a [PathBuf],
}

impl Placeholders<'_> {
  fn expand(&self, args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
      if arg == "{files}" {
        out.extend(self.files.iter().map(|p| p.display().to_string()));
        continue;
      }
      out.push(
        arg
          .replace("{backend}", self.backend)
          .replace("{scratch}", &self.scratch.display().to_string())
          .replace("{out}", &self.out.display().to_string())
          .replace("{test}", &self.test.display().to_string()),
      );
    }
    out
  }
}

/// Virtual file names come from the test file; keep them inside the scratch
/// directory.
fn safe_relative(name: &str) -> anyhow::Result<PathBuf> {
  let path = Path::new(name);
  if name.is_empty()
    || path
      .components()
      .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
  {
    bail!("virtual file name '{name}' escapes the scratch directory");
  }
  Ok(path.to_path_buf())
}

fn relativize(mut diagnostics: Vec<RawDiagnostic>, src_dir: &Path) -> Vec<RawDiagnostic> {
  for diag in &mut diagnostics {
    if let Some(file) = &diag.file {
      if let Ok(rel) = Path::new(file).strip_prefix(src_dir) {
        diag.file = Some(rel.to_string_lossy().replace('\\', "/"));
      }
    }
  }
  diagnostics
}

/// Runs a command to completion, killing it once `cancel` trips. Returns
/// `None` if it was cancelled.
fn run_command(
  spec: &CommandSpec,
  vars: &Placeholders<'_>,
  cancel: &CancelToken,
) -> anyhow::Result<Option<String>> {
  let args = vars.expand(&spec.command);
  let (program, rest) = args
    .split_first()
    .ok_or_else(|| anyhow!("command is empty"))?;

  let mut command = Command::new(program);
  command
    .args(rest)
    .current_dir(vars.scratch)
    .env(ENV_TEST, vars.test)
    .env(ENV_BACKEND, vars.backend)
    .env(ENV_SCRATCH, vars.scratch)
    .envs(&spec.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  debug!(program = %program, args = ?rest, "spawning compiler stage");

  let mut child = command
    .spawn()
    .with_context(|| format!("spawn {program}"))?;
  let stdout = child.stdout.take().context("failed to open stdout")?;
  let stderr = child.stderr.take().context("failed to open stderr")?;
  let stdout_reader = std::thread::spawn(move || drain(stdout));
  let stderr_reader = std::thread::spawn(move || drain(stderr));

  let status = loop {
    if let Some(status) = child.try_wait()? {
      break status;
    }
    if cancel.is_cancelled() {
      let _ = child.kill();
      let _ = child.wait();
      return Ok(None);
    }
    std::thread::sleep(POLL_INTERVAL);
  };

  let stdout = stdout_reader
    .join()
    .map_err(|_| anyhow!("stdout reader panicked"))?;
  let stderr = stderr_reader
    .join()
    .map_err(|_| anyhow!("stderr reader panicked"))?;

  if stdout.trim().is_empty() {
    bail!(
      "{program} exited with {status} and printed no report; stderr: {}",
      truncate(&stderr)
    );
  }
  if !status.success() {
    debug!(program = %program, %status, "stage command exited unsuccessfully");
  }
  Ok(Some(stdout))
}

fn drain(mut stream: impl Read) -> String {
  let mut buf = Vec::new();
  let _ = stream.read_to_end(&mut buf);
  String::from_utf8_lossy(&buf).into_owned()
}

fn truncate(text: &str) -> &str {
  let text = text.trim();
  if text.len() <= STDERR_TAIL {
    return text;
  }
  let mut start = text.len() - STDERR_TAIL;
  while !text.is_char_boundary(start) {
    start += 1;
  }
  &text[start..]
}
