use crate::HarnessError;
use crate::Result;
use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use tracing::warn;
use walkdir::DirEntry;
use walkdir::FilterEntry;
use walkdir::WalkDir;

pub const DEFAULT_VARIANT_SUFFIXES: &[&str] = &[".fir.kt", ".fir.kts"];
const TEMP_SUFFIXES: &[&str] = &["~", ".swp", ".swo", ".tmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
  /// A candidate test case.
  Primary,
  /// An alternate rendition of a primary file (e.g. `a.fir.kt`).
  Variant,
  /// Support data that is never run on its own (`_`-prefixed).
  Ancillary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
  pub id: String,
  pub path: PathBuf,
  pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
  Entry(ScanEntry),
  /// Non-fatal problem such as a symlink cycle.
  Warning(String),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
  pub variant_suffixes: Vec<String>,
}

impl Default for ScanOptions {
  fn default() -> Self {
    Self {
      variant_suffixes: DEFAULT_VARIANT_SUFFIXES
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct CorpusScanner {
  root: PathBuf,
  options: ScanOptions,
}

impl CorpusScanner {
  pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> CorpusScanner {
    CorpusScanner {
      root: root.into(),
      options,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Starts a fresh walk. Entries come out in `Path` order of their ids.
  pub fn iter(&self) -> ScanIter<'_> {
    let walker = WalkDir::new(&self.root)
      .follow_links(true)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(keep_entry as fn(&DirEntry) -> bool);
    ScanIter {
      scanner: self,
      walker,
    }
  }

  fn classify(&self, name: &str) -> EntryKind {
    if name.starts_with('_') {
      EntryKind::Ancillary
    } else if self
      .options
      .variant_suffixes
      .iter()
      .any(|suffix| name.ends_with(suffix.as_str()))
    {
      EntryKind::Variant
    } else {
      EntryKind::Primary
    }
  }
}

pub struct ScanIter<'a> {
  scanner: &'a CorpusScanner,
  walker: FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
}

impl Iterator for ScanIter<'_> {
  type Item = Result<ScanEvent>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let entry = match self.walker.next()? {
        Ok(entry) => entry,
        Err(err) => {
          if let Some(ancestor) = err.loop_ancestor() {
            let path = err.path().unwrap_or(ancestor);
            let message = format!(
              "skipping symlink cycle at {} (points back to {})",
              path.display(),
              ancestor.display()
            );
            warn!(path = %path.display(), "symlink cycle in corpus");
            return Some(Ok(ScanEvent::Warning(message)));
          }
          let path = err
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.scanner.root.clone());
          return Some(Err(HarnessError::Scan {
            path,
            message: err.to_string(),
          }));
        }
      };

      if !entry.file_type().is_file() {
        continue;
      }

      let Some(name) = entry.file_name().to_str() else {
        return Some(Err(HarnessError::Scan {
          path: entry.path().to_path_buf(),
          message: "file name is not valid UTF-8".to_string(),
        }));
      };
      if is_temp_file(name) {
        continue;
      }

      let kind = self.scanner.classify(name);
      let path = entry.into_path();
      let id = normalize_id(&self.scanner.root, &path);
      return Some(Ok(ScanEvent::Entry(ScanEntry { id, path, kind })));
    }
  }
}

fn keep_entry(entry: &DirEntry) -> bool {
  entry.depth() == 0
    || !entry
      .file_name()
      .to_str()
      .is_some_and(|name| name.starts_with('.'))
}

fn is_temp_file(name: &str) -> bool {
  TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    || (name.len() > 1 && name.starts_with('#') && name.ends_with('#'))
}

fn normalize_id(root: &Path, path: &Path) -> String {
  path
    .strip_prefix(root)
    .unwrap_or(path)
    .to_string_lossy()
    .replace('\\', "/")
}

#[derive(Debug, Clone, Default)]
pub struct Corpus {
  pub entries: Vec<ScanEntry>,
  pub warnings: Vec<String>,
}

/// Runs a full scan. The first fatal error aborts it.
pub fn scan_corpus(root: &Path, options: ScanOptions) -> Result<Corpus> {
  let scanner = CorpusScanner::new(root, options);
  let mut corpus = Corpus::default();
  for event in scanner.iter() {
    match event? {
      ScanEvent::Entry(entry) => corpus.entries.push(entry),
      ScanEvent::Warning(warning) => corpus.warnings.push(warning),
    }
  }
  Ok(corpus)
}

#[derive(Debug, Clone)]
pub enum Filter {
  All,
  Glob(GlobSet),
  Regex(Regex),
}

pub fn build_filter(pattern: Option<&str>) -> Result<Filter> {
  match pattern {
    None => Ok(Filter::All),
    Some(raw) => {
      if let Ok(glob) = Glob::new(raw) {
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let set = builder
          .build()
          .map_err(|err| HarnessError::InvalidFilter(err.to_string()))?;
        return Ok(Filter::Glob(set));
      }

      let regex = Regex::new(raw).map_err(|err| HarnessError::InvalidFilter(err.to_string()))?;
      Ok(Filter::Regex(regex))
    }
  }
}

impl Filter {
  pub fn matches(&self, id: &str) -> bool {
    match self {
      Filter::All => true,
      Filter::Glob(set) => set.is_match(id),
      Filter::Regex(re) => re.is_match(id),
    }
  }
}

/// `index/total`, zero-based; position `p` belongs to shard `p % total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
  pub index: usize,
  pub total: usize,
}

impl Shard {
  pub fn parse(raw: &str) -> Result<Shard> {
    let invalid = || HarnessError::InvalidShard(raw.to_string());
    let (index, total) = raw.split_once('/').ok_or_else(invalid)?;
    let index: usize = index.trim().parse().map_err(|_| invalid())?;
    let total: usize = total.trim().parse().map_err(|_| invalid())?;
    if total == 0 || index >= total {
      return Err(invalid());
    }
    Ok(Shard { index, total })
  }

  pub fn includes(&self, position: usize) -> bool {
    position % self.total == self.index
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn touch(root: &Path, rel: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "fun main() {}\n").unwrap();
  }

  fn ids(corpus: &Corpus) -> Vec<&str> {
    corpus.entries.iter().map(|e| e.id.as_str()).collect()
  }

  #[test]
  fn walks_in_path_order_and_classifies() {
    let dir = tempdir().unwrap();
    for rel in [
      "b.kt",
      "a/z.kt",
      "a-b.kt",
      "a/_helper.kt",
      "a/x.fir.kt",
      "a/x.kt",
    ] {
      touch(dir.path(), rel);
    }

    let corpus = scan_corpus(dir.path(), ScanOptions::default()).unwrap();
    assert_eq!(
      ids(&corpus),
      vec!["a/_helper.kt", "a/x.fir.kt", "a/x.kt", "a/z.kt", "a-b.kt", "b.kt"]
    );
    let kinds: Vec<_> = corpus.entries.iter().map(|e| e.kind).collect();
    assert_eq!(
      kinds,
      vec![
        EntryKind::Ancillary,
        EntryKind::Variant,
        EntryKind::Primary,
        EntryKind::Primary,
        EntryKind::Primary,
        EntryKind::Primary,
      ]
    );
  }

  #[test]
  fn skips_hidden_and_temp_files() {
    let dir = tempdir().unwrap();
    for rel in [
      "keep.kt",
      ".hidden.kt",
      ".git/config.kt",
      "keep.kt~",
      "keep.kt.swp",
      "#keep.kt#",
      "scratch.tmp",
    ] {
      touch(dir.path(), rel);
    }

    let corpus = scan_corpus(dir.path(), ScanOptions::default()).unwrap();
    assert_eq!(ids(&corpus), vec!["keep.kt"]);
  }

  #[test]
  fn iteration_is_restartable() {
    let dir = tempdir().unwrap();
    touch(dir.path(), "one.kt");
    touch(dir.path(), "two.kt");

    let scanner = CorpusScanner::new(dir.path(), ScanOptions::default());
    let first: Vec<_> = scanner.iter().map(|e| e.unwrap()).collect();
    let second: Vec<_> = scanner.iter().map(|e| e.unwrap()).collect();
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
  }

  #[test]
  fn missing_root_is_fatal() {
    let dir = tempdir().unwrap();
    let err = scan_corpus(&dir.path().join("absent"), ScanOptions::default()).unwrap_err();
    assert!(matches!(err, HarnessError::Scan { .. }));
  }

  #[cfg(unix)]
  #[test]
  fn symlink_cycles_are_warnings() {
    let dir = tempdir().unwrap();
    touch(dir.path(), "nested/a.kt");
    std::os::unix::fs::symlink(dir.path().join("nested"), dir.path().join("nested/loop")).unwrap();

    let corpus = scan_corpus(dir.path(), ScanOptions::default()).unwrap();
    assert_eq!(ids(&corpus), vec!["nested/a.kt"]);
    assert_eq!(corpus.warnings.len(), 1);
    assert!(corpus.warnings[0].contains("symlink cycle"));
  }

  #[test]
  fn filters_by_glob_or_regex() {
    let glob = build_filter(Some("diagnostics/**/*.kt")).unwrap();
    assert!(glob.matches("diagnostics/functions/a.kt"));
    assert!(!glob.matches("box/a.kt"));

    assert!(build_filter(None).unwrap().matches("anything"));
    assert!(matches!(
      build_filter(Some("[unclosed")),
      Err(HarnessError::InvalidFilter(_))
    ));
  }

  #[test]
  fn shard_parsing() {
    let shard = Shard::parse("1/3").unwrap();
    assert!(shard.includes(1));
    assert!(shard.includes(4));
    assert!(!shard.includes(2));
    assert!(Shard::parse("3/3").is_err());
    assert!(Shard::parse("0/0").is_err());
    assert!(Shard::parse("x").is_err());
  }
}
