//! Diagnostic-comparison test harness for compiler front ends.
//!
//! A corpus of annotated source files is scanned, classified against ordered
//! include/exclude rules, and each active file is run through an external
//! compiler (front end, optionally followed by code generation). The produced
//! diagnostics are compared against the expectations embedded in the file, and
//! the active file set can be audited against a registration manifest.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

pub mod audit;
pub mod compare;
pub mod config;
pub mod diagnostic;
pub mod directives;
pub mod driver;
pub mod expect;
pub mod patterns;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod scan;
pub mod source;
pub mod timeout;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
  #[error(transparent)]
  Io(#[from] io::Error),
  /// The corpus itself could not be read; every other result is suspect.
  #[error("scan failed at {}: {message}", path.display())]
  Scan { path: PathBuf, message: String },
  #[error("invalid shard specification '{0}'")]
  InvalidShard(String),
  #[error("invalid filter '{0}'")]
  InvalidFilter(String),
  #[error("invalid pattern '{pattern}': {message}")]
  InvalidPattern { pattern: String, message: String },
  #[error("config error: {0}")]
  Config(String),
  #[error("registration manifest error: {0}")]
  Registrations(String),
  #[error("no tests discovered under {}", root.display())]
  EmptySuite { root: PathBuf },
  #[error("output failed: {0}")]
  Output(String),
}

/// Reads a corpus file, treating unreadable or non-UTF-8 content as a scan
/// failure.
pub fn read_utf8_file(path: &Path) -> Result<String> {
  let bytes = std::fs::read(path).map_err(|err| HarnessError::Scan {
    path: path.to_path_buf(),
    message: err.to_string(),
  })?;
  String::from_utf8(bytes).map_err(|err| HarnessError::Scan {
    path: path.to_path_buf(),
    message: format!("not valid UTF-8: {err}"),
  })
}

pub use audit::audit;
pub use audit::CompletenessReport;
pub use audit::Registrations;
pub use compare::compare;
pub use compare::CompareMode;
pub use compare::DiagnosticDiff;
pub use config::HarnessConfig;
pub use diagnostic::Diagnostic;
pub use diagnostic::RawDiagnostic;
pub use diagnostic::Severity;
pub use driver::run_suite;
pub use driver::SuiteOptions;
pub use driver::SuiteReport;
pub use driver::TestResult;
pub use driver::Verdict;
pub use expect::extract_expectations;
pub use expect::BackendExpectation;
pub use expect::ExpectationSet;
pub use expect::MalformedExpectation;
pub use patterns::Classification;
pub use patterns::PatternRule;
pub use patterns::RuleSet;
pub use patterns::RunMode;
pub use patterns::TargetBackend;
pub use pipeline::Compiler;
pub use pipeline::PipelineRunner;
pub use scan::build_filter;
pub use scan::scan_corpus;
pub use scan::CorpusScanner;
pub use scan::Filter;
pub use scan::Shard;
pub use source::TestFile;
pub use source::VirtualFile;
pub use timeout::CancelToken;
