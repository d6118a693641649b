use crate::diagnostic::Position;
use crate::directives::parse_directive;
use crate::directives::Directive;
use crate::directives::HarnessOptions;
use crate::directives::FILE_DIRECTIVE;
use crate::read_utf8_file;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualFile {
  pub name: String,
  #[serde(skip)]
  pub content: Arc<str>,
}

impl VirtualFile {
  pub fn new(name: impl Into<String>, content: &str) -> VirtualFile {
    VirtualFile {
      name: name.into(),
      content: Arc::from(content),
    }
  }
}

/// Line-start table over a text, for converting between byte offsets and
/// 1-based line/column positions.
pub struct LineIndex<'a> {
  text: &'a str,
  starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
  pub fn new(text: &'a str) -> Self {
    let mut starts = vec![0];
    for (idx, ch) in text.char_indices() {
      if ch == '\n' {
        starts.push(idx + 1);
      }
    }
    Self { text, starts }
  }

  /// Number of lines; a trailing newline does not open an extra line.
  pub fn line_count(&self) -> usize {
    let last = self.starts.len();
    if last > 1 && self.starts[last - 1] == self.text.len() {
      last - 1
    } else {
      last
    }
  }

  /// Text of a 1-based line without its terminator.
  pub fn line_text(&self, line: usize) -> Option<&'a str> {
    if line == 0 || line > self.line_count() {
      return None;
    }
    let (start, end) = self.line_bounds(line - 1);
    Some(&self.text[start..end])
  }

  /// Number of characters on a 1-based line.
  pub fn line_len(&self, line: usize) -> Option<usize> {
    self.line_text(line).map(|text| text.chars().count())
  }

  pub fn position(&self, offset: usize) -> Position {
    let mut offset = offset.min(self.text.len());
    while !self.text.is_char_boundary(offset) {
      offset -= 1;
    }
    let line_idx = match self.starts.binary_search(&offset) {
      Ok(idx) => idx,
      Err(0) => 0,
      Err(idx) => idx - 1,
    };
    let line_start = self.starts[line_idx];
    Position {
      offset,
      line: line_idx + 1,
      column: self.text[line_start..offset].chars().count() + 1,
    }
  }

  /// Byte offset of a 1-based line/column. The column may point one past the
  /// last character of the line.
  pub fn offset(&self, line: usize, column: usize) -> Option<usize> {
    let text = self.line_text(line)?;
    if column == 0 {
      return None;
    }
    let start = self.starts[line - 1];
    let mut chars = text.char_indices();
    match chars.nth(column - 1) {
      Some((idx, _)) => Some(start + idx),
      None if column - 1 == text.chars().count() => Some(start + text.len()),
      None => None,
    }
  }

  /// Like [`LineIndex::offset`], but clamps out-of-range coordinates into the
  /// text instead of failing.
  pub fn clamped_offset(&self, line: usize, column: usize) -> usize {
    let line = line.clamp(1, self.line_count().max(1));
    let len = self.line_len(line).unwrap_or(0);
    self
      .offset(line, column.clamp(1, len + 1))
      .unwrap_or(self.text.len())
  }

  fn line_bounds(&self, line_idx: usize) -> (usize, usize) {
    let start = *self.starts.get(line_idx).unwrap_or(&self.text.len());
    let end = if line_idx + 1 < self.starts.len() {
      self.starts[line_idx + 1].saturating_sub(1)
    } else {
      self.text.len()
    };
    let end = end.max(start);
    let line = &self.text[start..end];
    (start, start + line.trim_end_matches('\r').len())
  }
}

/// A corpus file, read once and split into the virtual files handed to the
/// compiler. Expectation markers are still present in `files`.
#[derive(Debug, Clone)]
pub struct TestFile {
  pub id: String,
  pub path: PathBuf,
  pub contents: Arc<str>,
  pub files: Vec<VirtualFile>,
  pub directives: Vec<Directive>,
  pub options: HarnessOptions,
  pub notes: Vec<String>,
}

impl TestFile {
  pub fn load(root: &Path, id: &str) -> Result<TestFile> {
    let path = root.join(id);
    let contents = read_utf8_file(&path)?;
    Ok(TestFile::from_source(id, path, &contents))
  }

  pub fn from_source(id: &str, path: PathBuf, contents: &str) -> TestFile {
    let split = split_test_file(&path, contents);
    let (options, mut notes) = HarnessOptions::from_directives(&split.directives);
    let mut all_notes = split.notes;
    all_notes.append(&mut notes);
    TestFile {
      id: id.to_string(),
      path,
      contents: Arc::from(contents),
      files: split.files,
      directives: split.directives,
      options,
      notes: all_notes,
    }
  }

  /// Directory components of the id, used as group tags.
  pub fn group(&self) -> Vec<String> {
    group_of(&self.id)
  }
}

pub fn group_of(id: &str) -> Vec<String> {
  let mut parts: Vec<String> = id.split('/').map(str::to_string).collect();
  parts.pop();
  parts
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplitResult {
  pub files: Vec<VirtualFile>,
  pub directives: Vec<Directive>,
  pub notes: Vec<String>,
}

/// Splits a test file on `// FILE: name` lines. Only the `FILE` lines are
/// dropped; every other line stays so line numbers inside a virtual file match
/// what the author sees.
pub fn split_test_file(path: &Path, contents: &str) -> SplitResult {
  let mut result = SplitResult::default();
  let default_name = path
    .file_name()
    .map(|p| p.to_string_lossy().to_string())
    .unwrap_or_else(|| "main.kt".to_string());

  let mut current_name = default_name;
  let mut current_content = String::new();
  let mut seen_file_directive = false;

  for (idx, raw_line) in contents.split_inclusive('\n').enumerate() {
    let line_number = idx + 1;
    let line = raw_line.trim_end_matches(['\n', '\r']);

    let Some(directive) = parse_directive(line, line_number) else {
      current_content.push_str(raw_line);
      continue;
    };

    if directive.name != FILE_DIRECTIVE {
      result.directives.push(directive);
      current_content.push_str(raw_line);
      continue;
    }

    match directive.value.clone() {
      Some(name) => {
        // Text before the first FILE line only survives if it is more than
        // blank lines and directives.
        if seen_file_directive || has_code(&current_content) {
          result.files.push(VirtualFile::new(
            std::mem::take(&mut current_name),
            &current_content,
          ));
        }
        current_content.clear();
        current_name = name;
        seen_file_directive = true;
      }
      None => result.notes.push(format!(
        "missing FILE value at line {line_number}; ignoring directive"
      )),
    }
    result.directives.push(directive);
  }

  result
    .files
    .push(VirtualFile::new(current_name, &current_content));

  let mut counts = BTreeMap::new();
  for file in &result.files {
    *counts.entry(file.name.as_str()).or_insert(0usize) += 1;
  }
  for (name, count) in counts {
    if count > 1 {
      result
        .notes
        .push(format!("duplicate FILE entry for {name}; contents kept separately"));
    }
  }

  result
}

fn has_code(text: &str) -> bool {
  text
    .lines()
    .enumerate()
    .any(|(idx, line)| !line.trim().is_empty() && parse_directive(line, idx + 1).is_none())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn line_index_round_trips_positions() {
    let index = LineIndex::new("ab\ncdé\n\nx");
    assert_eq!(index.line_count(), 4);
    assert_eq!(index.line_text(2), Some("cdé"));
    assert_eq!(index.line_len(2), Some(3));
    assert_eq!(index.offset(2, 4), Some(index.offset(3, 1).unwrap() - 1));
    assert_eq!(index.offset(2, 5), None);
    assert_eq!(index.offset(5, 1), None);

    let pos = index.position(5);
    assert_eq!((pos.line, pos.column), (2, 3));
    let pos = index.position(9);
    assert_eq!((pos.line, pos.column), (4, 1));
  }

  #[test]
  fn trailing_newline_does_not_add_a_line() {
    let index = LineIndex::new("a\nb\n");
    assert_eq!(index.line_count(), 2);
    assert_eq!(index.line_text(3), None);
    assert_eq!(LineIndex::new("").line_count(), 1);
  }

  #[test]
  fn strips_carriage_returns_from_lines() {
    let index = LineIndex::new("one\r\ntwo\r\n");
    assert_eq!(index.line_text(1), Some("one"));
    assert_eq!(index.offset(1, 4), Some(3));
  }

  #[test]
  fn splits_single_file_without_file_directives() {
    let source = "// TARGET_BACKEND: JS_IR\nfun main() {}\n";
    let result = split_test_file(Path::new("box/simple.kt"), source);
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].name, "simple.kt");
    assert_eq!(result.files[0].content.as_ref(), source);
    assert_eq!(result.directives.len(), 1);
  }

  #[test]
  fn splits_multiple_files() {
    let source = "// DIAGNOSTICS: -UNUSED_PARAMETER\n// FILE: a.kt\nfun a() {}\n// FILE: b.kt\nfun b() = a()\n";
    let result = split_test_file(Path::new("multi.kt"), source);
    let names: Vec<_> = result.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a.kt", "b.kt"]);
    assert_eq!(result.files[0].content.as_ref(), "fun a() {}\n");
    assert_eq!(result.files[1].content.as_ref(), "fun b() = a()\n");
    assert_eq!(result.directives.len(), 3);
  }

  #[test]
  fn keeps_leading_code_as_its_own_file() {
    let source = "fun lead() {}\n// FILE: b.kt\nfun b() {}\n";
    let result = split_test_file(Path::new("lead.kt"), source);
    let names: Vec<_> = result.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["lead.kt", "b.kt"]);
  }

  #[test]
  fn notes_duplicate_file_names() {
    let source = "// FILE: a.kt\nx\n// FILE: a.kt\ny\n";
    let result = split_test_file(Path::new("dup.kt"), source);
    assert_eq!(result.files.len(), 2);
    assert!(result.notes.iter().any(|n| n.contains("duplicate FILE entry for a.kt")));
  }

  #[test]
  fn test_file_exposes_groups_and_options() {
    let test = TestFile::from_source(
      "diagnostics/functions/a.kt",
      PathBuf::from("/corpus/diagnostics/functions/a.kt"),
      "// IGNORE_BACKEND: JS_IR\nfun f() {}\n",
    );
    assert_eq!(test.group(), vec!["diagnostics", "functions"]);
    assert_eq!(test.options.ignore_backends.len(), 1);
    assert!(group_of("top.kt").is_empty());
  }
}
