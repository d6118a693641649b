//! Expectations embedded in test files.
//!
//! Three forms are understood:
//!
//! - inline markers, `<!warning:UNUSED_VALUE!>x<!>`, which are stripped before
//!   the file is handed to the compiler;
//! - comment lines, `// expect: error UNRESOLVED at 4:9-4:12 "unresolved"`;
//! - caret lines, `//   ^^^ warning UNUSED_VALUE`, pointing at the closest
//!   preceding non-caret line.

use crate::diagnostic::Position;
use crate::diagnostic::Severity;
use crate::diagnostic::SourceRange;
use crate::source::LineIndex;
use crate::source::TestFile;
use crate::source::VirtualFile;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

const MARKER_OPEN: &str = "<!";
const MARKER_SPEC_END: &str = "!>";
const MARKER_CLOSE: &str = "<!>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendExpectation {
  /// Do not run the back end.
  None,
  MustSucceed,
  MustFailWithoutOutput,
}

impl BackendExpectation {
  pub fn parse(raw: &str) -> Option<BackendExpectation> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "none" => Some(BackendExpectation::None),
      "success" | "must_succeed" => Some(BackendExpectation::MustSucceed),
      "fail_no_output" | "must_fail" => Some(BackendExpectation::MustFailWithoutOutput),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedLocation {
  Line { line: usize },
  Point { position: Position },
  Range { range: SourceRange },
}

impl ExpectedLocation {
  pub fn start_line(&self) -> usize {
    match self {
      ExpectedLocation::Line { line } => *line,
      ExpectedLocation::Point { position } => position.line,
      ExpectedLocation::Range { range } => range.start.line,
    }
  }

  fn start_column(&self) -> usize {
    match self {
      ExpectedLocation::Line { .. } => 0,
      ExpectedLocation::Point { position } => position.column,
      ExpectedLocation::Range { range } => range.start.column,
    }
  }
}

impl fmt::Display for ExpectedLocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExpectedLocation::Line { line } => write!(f, "{line}"),
      ExpectedLocation::Point { position } => write!(f, "{}:{}", position.line, position.column),
      ExpectedLocation::Range { range } => write!(
        f,
        "{}:{}-{}:{}",
        range.start.line, range.start.column, range.end.line, range.end.column
      ),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedDiagnostic {
  pub file: String,
  pub severity: Severity,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  pub location: ExpectedLocation,
  /// Line of the annotation itself.
  pub line: usize,
}

impl ExpectedDiagnostic {
  /// `a.kt:3:5 warning[CODE] "msg"`
  pub fn describe(&self) -> String {
    let mut out = format!("{}:{} {}", self.file, self.location, self.severity);
    if let Some(code) = &self.code {
      out.push('[');
      out.push_str(code);
      out.push(']');
    }
    if let Some(message) = &self.message {
      out.push_str(&format!(" {message:?}"));
    }
    out
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExpectationSet {
  entries: Vec<ExpectedDiagnostic>,
}

impl ExpectationSet {
  pub fn iter(&self) -> std::slice::Iter<'_, ExpectedDiagnostic> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn as_slice(&self) -> &[ExpectedDiagnostic] {
    &self.entries
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MalformedKind {
  #[error("location out of bounds: {0}")]
  OutOfBounds(String),
  #[error("duplicate expectation: {0}")]
  Duplicate(String),
  #[error("unknown severity '{0}'")]
  UnknownSeverity(String),
  #[error("unterminated marker")]
  UnterminatedMarker,
  #[error("closing marker without an opener")]
  UnmatchedClose,
  #[error("syntax error: {0}")]
  Syntax(String),
  #[error("unknown BACKEND expectation '{0}'")]
  UnknownBackendExpectation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{file}:{line}: {kind}")]
pub struct MalformedExpectation {
  pub file: String,
  pub line: usize,
  pub kind: MalformedKind,
}

#[derive(Debug, Clone)]
pub struct Extracted {
  /// Virtual files with inline markers removed.
  pub files: Vec<VirtualFile>,
  pub expectations: ExpectationSet,
  pub backend: Option<BackendExpectation>,
}

pub fn extract_expectations(test: &TestFile) -> Result<Extracted, MalformedExpectation> {
  let backend = match &test.options.backend {
    Some((raw, line)) => Some(BackendExpectation::parse(raw).ok_or_else(|| {
      MalformedExpectation {
        file: test.id.clone(),
        line: *line,
        kind: MalformedKind::UnknownBackendExpectation(raw.clone()),
      }
    })?),
    None => None,
  };

  let mut files = Vec::with_capacity(test.files.len());
  let mut entries = Vec::new();
  for file in &test.files {
    let stripped = strip_markers(&file.name, &file.content, &mut entries)?;
    collect_comment_expectations(&file.name, &stripped, &mut entries)?;
    files.push(VirtualFile::new(file.name.clone(), &stripped));
  }

  let mut seen = BTreeSet::new();
  for entry in &entries {
    let key = (
      entry.file.as_str(),
      &entry.location,
      entry.severity,
      entry.code.as_deref(),
    );
    if !seen.insert(key) {
      return Err(MalformedExpectation {
        file: entry.file.clone(),
        line: entry.line,
        kind: MalformedKind::Duplicate(entry.describe()),
      });
    }
  }

  entries.sort_by(|a, b| {
    a.file
      .cmp(&b.file)
      .then(a.location.start_line().cmp(&b.location.start_line()))
      .then(a.location.start_column().cmp(&b.location.start_column()))
      .then(a.location.cmp(&b.location))
      .then(a.severity.cmp(&b.severity))
      .then(a.code.cmp(&b.code))
  });

  Ok(Extracted {
    files,
    expectations: ExpectationSet { entries },
    backend,
  })
}

struct OpenMarker {
  specs: Vec<MarkerSpec>,
  start: usize,
  line: usize,
}

struct MarkerSpec {
  severity: Severity,
  code: String,
  message: Option<String>,
}

/// Removes inline markers, recording one expectation per spec with the range
/// of the wrapped text in the stripped output.
fn strip_markers(
  file: &str,
  text: &str,
  entries: &mut Vec<ExpectedDiagnostic>,
) -> Result<String, MalformedExpectation> {
  let malformed = |line: usize, kind: MalformedKind| MalformedExpectation {
    file: file.to_string(),
    line,
    kind,
  };

  let mut out = String::with_capacity(text.len());
  let mut stack: Vec<OpenMarker> = Vec::new();
  let mut closed: Vec<(OpenMarker, usize)> = Vec::new();
  let mut line = 1;
  let mut rest = text;

  while !rest.is_empty() {
    if let Some(after) = rest.strip_prefix(MARKER_CLOSE) {
      let open = stack
        .pop()
        .ok_or_else(|| malformed(line, MalformedKind::UnmatchedClose))?;
      closed.push((open, out.len()));
      rest = after;
    } else if let Some(after) = rest.strip_prefix(MARKER_OPEN) {
      let end = after
        .find(MARKER_SPEC_END)
        .filter(|end| !after[..*end].contains('\n'))
        .ok_or_else(|| malformed(line, MalformedKind::UnterminatedMarker))?;
      let specs = parse_marker_specs(&after[..end]).map_err(|kind| malformed(line, kind))?;
      stack.push(OpenMarker {
        specs,
        start: out.len(),
        line,
      });
      rest = &after[end + MARKER_SPEC_END.len()..];
    } else {
      let mut chars = rest.chars();
      if let Some(ch) = chars.next() {
        if ch == '\n' {
          line += 1;
        }
        out.push(ch);
      }
      rest = chars.as_str();
    }
  }

  if let Some(open) = stack.pop() {
    return Err(malformed(open.line, MalformedKind::UnterminatedMarker));
  }

  let index = LineIndex::new(&out);
  for (open, end) in closed {
    let range = SourceRange {
      start: index.position(open.start),
      end: index.position(end),
    };
    for spec in open.specs {
      entries.push(ExpectedDiagnostic {
        file: file.to_string(),
        severity: spec.severity,
        code: Some(spec.code),
        message: spec.message,
        location: ExpectedLocation::Range { range },
        line: open.line,
      });
    }
  }

  Ok(out)
}

fn parse_marker_specs(raw: &str) -> Result<Vec<MarkerSpec>, MalformedKind> {
  let mut specs = Vec::new();
  for part in split_outside_quotes(raw, ',') {
    let part = part.trim();
    let (severity, rest) = match part.split_once(':') {
      Some((prefix, rest)) if !prefix.contains('(') => (
        Severity::parse_keyword(prefix.trim())
          .ok_or_else(|| MalformedKind::UnknownSeverity(prefix.trim().to_string()))?,
        rest.trim(),
      ),
      _ => (Severity::Error, part),
    };

    let code_len = rest
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
      .unwrap_or(rest.len());
    let (code, args) = rest.split_at(code_len);
    if code.is_empty() {
      return Err(MalformedKind::Syntax(format!("marker '{part}' has no code")));
    }

    let message = if args.is_empty() {
      None
    } else {
      let inner = args
        .strip_prefix('(')
        .and_then(|a| a.strip_suffix(')'))
        .ok_or_else(|| MalformedKind::Syntax(format!("unexpected text in marker '{part}'")))?;
      let (head, message) = split_message(inner).map_err(MalformedKind::Syntax)?;
      if !head.trim().is_empty() || message.is_none() {
        return Err(MalformedKind::Syntax(format!(
          "marker arguments must be a single quoted message in '{part}'"
        )));
      }
      message
    };

    specs.push(MarkerSpec {
      severity,
      code: code.to_string(),
      message,
    });
  }
  Ok(specs)
}

fn split_outside_quotes(raw: &str, sep: char) -> Vec<&str> {
  let mut parts = Vec::new();
  let mut in_quotes = false;
  let mut escaped = false;
  let mut start = 0;
  for (idx, ch) in raw.char_indices() {
    match ch {
      _ if escaped => escaped = false,
      '\\' if in_quotes => escaped = true,
      '"' => in_quotes = !in_quotes,
      c if c == sep && !in_quotes => {
        parts.push(&raw[start..idx]);
        start = idx + ch.len_utf8();
      }
      _ => {}
    }
  }
  parts.push(&raw[start..]);
  parts
}

/// Splits `head "message"` into the head and the unescaped message. Text after
/// the closing quote is an error.
fn split_message(raw: &str) -> Result<(&str, Option<String>), String> {
  let Some(open) = raw.find('"') else {
    return Ok((raw, None));
  };

  let mut message = String::new();
  let mut chars = raw[open + 1..].char_indices();
  while let Some((idx, ch)) = chars.next() {
    match ch {
      '\\' => match chars.next() {
        Some((_, escaped)) => message.push(escaped),
        None => return Err("dangling escape in message".to_string()),
      },
      '"' => {
        let trailing = &raw[open + 1 + idx + 1..];
        if !trailing.trim().is_empty() {
          return Err(format!("unexpected text after message: '{}'", trailing.trim()));
        }
        return Ok((&raw[..open], Some(message)));
      }
      other => message.push(other),
    }
  }
  Err("unterminated message".to_string())
}

struct CaretLine<'a> {
  first_column: usize,
  last_column: usize,
  rest: &'a str,
}

fn caret_line(line: &str) -> Option<CaretLine<'_>> {
  let comment = line.trim_start().strip_prefix("//")?;
  if !comment.trim_start().starts_with('^') {
    return None;
  }

  let mut first = None;
  let mut last = 0;
  let mut rest_offset = line.len();
  for (column, (idx, ch)) in line.char_indices().enumerate() {
    match (ch, first) {
      ('^', None) => {
        first = Some(column + 1);
        last = column + 1;
      }
      ('^', Some(_)) => last = column + 1,
      (_, Some(_)) => {
        rest_offset = idx;
        break;
      }
      _ => {}
    }
  }

  Some(CaretLine {
    first_column: first?,
    last_column: last,
    rest: &line[rest_offset..],
  })
}

fn comment_expectation(line: &str) -> Option<&str> {
  let comment = line.trim_start().strip_prefix("//")?;
  comment.trim_start().strip_prefix("expect:")
}

/// Parses `<severity> [CODE]` and the optional quoted message.
fn parse_severity_and_code(
  raw: &str,
) -> Result<(Severity, Option<String>, Vec<String>, Option<String>), MalformedKind> {
  let (head, message) = split_message(raw).map_err(MalformedKind::Syntax)?;
  let mut tokens = head.split_whitespace();
  let keyword = tokens
    .next()
    .ok_or_else(|| MalformedKind::Syntax("missing severity".to_string()))?;
  let severity = Severity::parse_keyword(keyword)
    .ok_or_else(|| MalformedKind::UnknownSeverity(keyword.to_string()))?;
  let rest: Vec<String> = tokens.map(str::to_string).collect();
  let (code, rest) = match rest.first() {
    Some(first) if first != "at" => (Some(first.clone()), rest[1..].to_vec()),
    _ => (None, rest),
  };
  Ok((severity, code, rest, message))
}

fn collect_comment_expectations(
  file: &str,
  text: &str,
  entries: &mut Vec<ExpectedDiagnostic>,
) -> Result<(), MalformedExpectation> {
  let index = LineIndex::new(text);
  let mut target_line: Option<usize> = None;

  for line_no in 1..=index.line_count() {
    let line = index.line_text(line_no).unwrap_or("");
    let malformed = |kind: MalformedKind| MalformedExpectation {
      file: file.to_string(),
      line: line_no,
      kind,
    };

    if let Some(caret) = caret_line(line) {
      let target =
        target_line.ok_or_else(|| malformed(MalformedKind::OutOfBounds("caret line has no target line".to_string())))?;
      let (severity, code, extra, message) =
        parse_severity_and_code(caret.rest).map_err(malformed)?;
      if !extra.is_empty() {
        return Err(malformed(MalformedKind::Syntax(format!(
          "unexpected tokens after caret expectation: {}",
          extra.join(" ")
        ))));
      }
      let range = resolve_range(
        &index,
        (target, caret.first_column),
        (target, caret.last_column + 1),
      )
      .map_err(malformed)?;
      entries.push(ExpectedDiagnostic {
        file: file.to_string(),
        severity,
        code,
        message,
        location: ExpectedLocation::Range { range },
        line: line_no,
      });
      continue;
    }

    target_line = Some(line_no);

    let Some(body) = comment_expectation(line) else {
      continue;
    };
    let (severity, code, rest, message) = parse_severity_and_code(body).map_err(malformed)?;
    let location = match rest.as_slice() {
      [at, location] if at == "at" => {
        parse_location(&index, location).map_err(malformed)?
      }
      _ => {
        return Err(malformed(MalformedKind::Syntax(
          "expected `at <line>[:<col>[-<line>:<col>]]`".to_string(),
        )))
      }
    };
    entries.push(ExpectedDiagnostic {
      file: file.to_string(),
      severity,
      code,
      message,
      location,
      line: line_no,
    });
  }

  Ok(())
}

fn parse_location(index: &LineIndex<'_>, raw: &str) -> Result<ExpectedLocation, MalformedKind> {
  let syntax = || MalformedKind::Syntax(format!("invalid location '{raw}'"));
  let parse_point = |point: &str| -> Result<(usize, Option<usize>), MalformedKind> {
    match point.split_once(':') {
      Some((line, column)) => Ok((
        line.parse().map_err(|_| syntax())?,
        Some(column.parse().map_err(|_| syntax())?),
      )),
      None => Ok((point.parse().map_err(|_| syntax())?, None)),
    }
  };

  let (start, end) = match raw.split_once('-') {
    Some((start, end)) => (start, Some(end)),
    None => (raw, None),
  };
  let (line, column) = parse_point(start)?;

  match (column, end) {
    (None, None) => {
      if line == 0 || line > index.line_count() {
        return Err(MalformedKind::OutOfBounds(format!(
          "line {line} outside 1..={}",
          index.line_count()
        )));
      }
      Ok(ExpectedLocation::Line { line })
    }
    (Some(column), None) => {
      let offset = point_offset(index, line, column)?;
      Ok(ExpectedLocation::Point {
        position: index.position(offset),
      })
    }
    (Some(column), Some(end)) => {
      let (end_line, end_column) = parse_point(end)?;
      let end_column = end_column.ok_or_else(syntax)?;
      Ok(ExpectedLocation::Range {
        range: resolve_range(index, (line, column), (end_line, end_column))?,
      })
    }
    (None, Some(_)) => Err(syntax()),
  }
}

fn point_offset(index: &LineIndex<'_>, line: usize, column: usize) -> Result<usize, MalformedKind> {
  index.offset(line, column).ok_or_else(|| {
    MalformedKind::OutOfBounds(match index.line_len(line) {
      Some(len) => format!("column {column} past end of line {line} (length {len})"),
      None => format!("line {line} outside 1..={}", index.line_count()),
    })
  })
}

fn resolve_range(
  index: &LineIndex<'_>,
  start: (usize, usize),
  end: (usize, usize),
) -> Result<SourceRange, MalformedKind> {
  let start_offset = point_offset(index, start.0, start.1)?;
  let end_offset = point_offset(index, end.0, end.1)?;
  if end_offset < start_offset {
    return Err(MalformedKind::OutOfBounds(format!(
      "range ends before it starts ({}:{} > {}:{})",
      start.0, start.1, end.0, end.1
    )));
  }
  Ok(SourceRange {
    start: index.position(start_offset),
    end: index.position(end_offset),
  })
}
