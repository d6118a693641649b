use crate::source::LineIndex;
use crate::source::VirtualFile;
use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Error,
  Warning,
  #[serde(alias = "note")]
  Info,
}

impl Severity {
  /// Case-insensitive keyword lookup used by in-file expectations.
  pub fn parse_keyword(raw: &str) -> Option<Severity> {
    match raw.to_ascii_lowercase().as_str() {
      "error" => Some(Severity::Error),
      "warning" => Some(Severity::Warning),
      "info" => Some(Severity::Info),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Severity::Error => "error",
      Severity::Warning => "warning",
      Severity::Info => "info",
    }
  }

  /// Unmatched actual diagnostics of this severity count as unexpected.
  pub fn must_match(self) -> bool {
    matches!(self, Severity::Error | Severity::Warning)
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Frontend,
  Backend,
}

/// A point in a virtual file. `line` and `column` are 1-based; columns count
/// characters, `offset` counts bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
  pub offset: usize,
  pub line: usize,
  pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceRange {
  pub start: Position,
  pub end: Position,
}

impl SourceRange {
  pub fn point(position: Position) -> SourceRange {
    SourceRange {
      start: position,
      end: position,
    }
  }

  /// Half-open overlap; empty ranges overlap anything that contains them.
  pub fn overlaps(&self, other: &SourceRange) -> bool {
    let (a_start, a_end) = (self.start.offset, self.end.offset);
    let (b_start, b_end) = (other.start.offset, other.end.offset);
    if a_start == a_end {
      return b_start <= a_start && a_start <= b_end;
    }
    if b_start == b_end {
      return a_start <= b_start && b_start <= a_end;
    }
    a_start < b_end && b_start < a_end
  }

  pub fn contains(&self, position: &Position) -> bool {
    self.start.offset <= position.offset && position.offset <= self.end.offset
  }

  pub fn spans_line(&self, line: usize) -> bool {
    self.start.line <= line && line <= self.end.line
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
  pub severity: Severity,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  pub file: String,
  pub range: SourceRange,
  pub stage: Stage,
}

impl Diagnostic {
  /// `a.kt:3:5 warning[CODE] "msg"`
  pub fn describe(&self) -> String {
    let mut out = format!(
      "{}:{}:{} {}",
      self.file, self.range.start.line, self.range.start.column, self.severity
    );
    if let Some(code) = &self.code {
      out.push('[');
      out.push_str(code);
      out.push(']');
    }
    if let Some(message) = &self.message {
      out.push_str(&format!(" {message:?}"));
    }
    if self.stage == Stage::Backend {
      out.push_str(" (backend)");
    }
    out
  }
}

fn diagnostic_order(a: &Diagnostic, b: &Diagnostic) -> Ordering {
  a.file
    .cmp(&b.file)
    .then(a.range.start.offset.cmp(&b.range.start.offset))
    .then(a.range.end.offset.cmp(&b.range.end.offset))
    .then(a.severity.cmp(&b.severity))
    .then(a.code.cmp(&b.code))
    .then(a.message.cmp(&b.message))
    .then(a.stage.cmp(&b.stage))
}

pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
  diagnostics.sort_by(diagnostic_order);
}

/// Diagnostic as reported by a compiler stage. Coordinates may be byte
/// offsets, line/column pairs, or both; whatever is missing is derived from
/// the virtual file text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDiagnostic {
  pub severity: Option<Severity>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub column: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_line: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_column: Option<usize>,
}

impl RawDiagnostic {
  pub fn new(severity: Severity) -> RawDiagnostic {
    RawDiagnostic {
      severity: Some(severity),
      ..RawDiagnostic::default()
    }
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  pub fn in_file(mut self, file: impl Into<String>) -> Self {
    self.file = Some(file.into());
    self
  }

  pub fn with_span(mut self, start: usize, end: usize) -> Self {
    self.start = Some(start);
    self.end = Some(end);
    self
  }

  pub fn at(mut self, line: usize, column: usize) -> Self {
    self.line = Some(line);
    self.column = Some(column);
    self
  }

  /// Resolves coordinates against the virtual files the stage saw. A missing
  /// file name refers to the first virtual file; a missing severity is an
  /// error.
  pub fn resolve(&self, files: &[VirtualFile], stage: Stage) -> Diagnostic {
    let severity = self.severity.unwrap_or(Severity::Error);
    let file = self
      .file
      .as_deref()
      .and_then(|name| files.iter().find(|f| f.name == name))
      .or_else(|| match self.file {
        Some(_) => None,
        None => files.first(),
      });
    let file_name = match (&self.file, file) {
      (Some(name), _) => name.clone(),
      (None, Some(file)) => file.name.clone(),
      (None, None) => String::new(),
    };

    let range = match file {
      Some(file) => self.resolve_range(&LineIndex::new(&file.content)),
      None => self.unanchored_range(),
    };

    Diagnostic {
      severity,
      code: self.code.clone(),
      message: self.message.clone(),
      file: file_name,
      range,
      stage,
    }
  }

  fn resolve_range(&self, index: &LineIndex<'_>) -> SourceRange {
    let start = match (self.start, self.line) {
      (Some(offset), _) => index.position(offset),
      (None, Some(line)) => index.position(index.clamped_offset(line, self.column.unwrap_or(1))),
      (None, None) => index.position(0),
    };
    let end = match (self.end, self.end_line, self.end_column) {
      (Some(offset), _, _) => index.position(offset.max(start.offset)),
      (None, Some(line), column) => {
        index.position(index.clamped_offset(line, column.unwrap_or(1)).max(start.offset))
      }
      (None, None, Some(column)) => {
        index.position(index.clamped_offset(start.line, column).max(start.offset))
      }
      (None, None, None) => start,
    };
    SourceRange { start, end }
  }

  fn unanchored_range(&self) -> SourceRange {
    let start = Position {
      offset: self.start.unwrap_or(0),
      line: self.line.unwrap_or(1),
      column: self.column.unwrap_or(1),
    };
    let end = Position {
      offset: self.end.unwrap_or(start.offset),
      line: self.end_line.unwrap_or(start.line),
      column: self.end_column.unwrap_or(start.column),
    };
    SourceRange { start, end }
  }
}
