use crate::scan::EntryKind;
use crate::scan::ScanEntry;
use crate::HarnessError;
use crate::Result;
use clap::ValueEnum;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

pub const DEFAULT_INCLUDE: &str = r"[^_].*\.kt";
pub const DEFAULT_BACKEND: &str = "JS_IR";
pub const DEFAULT_FRONTEND_ONLY_SUFFIXES: &[&str] = &[".fir.kt", ".fir.kts"];

/// Backend tag. Stored upper-case; `ANY` is compatible with every backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TargetBackend(String);

impl TargetBackend {
  pub const ANY: &'static str = "ANY";

  pub fn new(raw: &str) -> TargetBackend {
    TargetBackend(raw.trim().to_ascii_uppercase())
  }

  pub fn any() -> TargetBackend {
    TargetBackend(Self::ANY.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_any(&self) -> bool {
    self.0 == Self::ANY
  }

  pub fn covers(&self, other: &TargetBackend) -> bool {
    self.is_any() || other.is_any() || self == other
  }
}

impl Default for TargetBackend {
  fn default() -> Self {
    TargetBackend::new(DEFAULT_BACKEND)
  }
}

impl From<String> for TargetBackend {
  fn from(raw: String) -> Self {
    TargetBackend::new(&raw)
  }
}

impl From<TargetBackend> for String {
  fn from(backend: TargetBackend) -> Self {
    backend.0
  }
}

impl fmt::Display for TargetBackend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
  /// Front end only; the back end never runs.
  FrontendOnly,
  /// Front end followed by code generation.
  #[default]
  WithBackend,
}

impl RunMode {
  pub fn as_str(self) -> &'static str {
    match self {
      RunMode::FrontendOnly => "frontend-only",
      RunMode::WithBackend => "with-backend",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
  Active,
  ExcludedByPattern,
  NotMatched,
}

#[derive(Debug, Clone)]
pub struct PatternRule {
  /// Relative directory the rule is scoped to; empty covers the whole corpus.
  pub dir: String,
  pub include: Regex,
  pub exclude: Option<Regex>,
  pub backend: TargetBackend,
}

impl PatternRule {
  pub fn new(
    dir: &str,
    include: &str,
    exclude: Option<&str>,
    backend: TargetBackend,
  ) -> Result<PatternRule> {
    Ok(PatternRule {
      dir: dir.trim_matches('/').replace('\\', "/"),
      include: compile_anchored(include)?,
      exclude: exclude.map(compile_anchored).transpose()?,
      backend,
    })
  }

  fn scopes(&self, id: &str) -> bool {
    self.dir.is_empty()
      || id
        .strip_prefix(self.dir.as_str())
        .is_some_and(|rest| rest.starts_with('/'))
  }

  fn excludes(&self, name: &str) -> bool {
    self.exclude.as_ref().is_some_and(|re| re.is_match(name))
  }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
  Regex::new(&format!("^(?:{pattern})$")).map_err(|err| HarnessError::InvalidPattern {
    pattern: pattern.to_string(),
    message: err.to_string(),
  })
}

#[derive(Debug, Clone)]
pub struct RuleSet {
  pub rules: Vec<PatternRule>,
  pub frontend_only_suffixes: Vec<String>,
}

impl RuleSet {
  pub fn new(rules: Vec<PatternRule>, frontend_only_suffixes: Vec<String>) -> RuleSet {
    RuleSet {
      rules,
      frontend_only_suffixes,
    }
  }

  /// Variants such as `a.fir.kt` are kept out of back-end runs by the
  /// frontend-only suffixes rather than an exclude pattern, so frontend-only
  /// runs still see them.
  pub fn with_defaults(backend: TargetBackend) -> Result<RuleSet> {
    let rule = PatternRule::new("", DEFAULT_INCLUDE, None, backend)?;
    Ok(RuleSet::new(
      vec![rule],
      DEFAULT_FRONTEND_ONLY_SUFFIXES
        .iter()
        .map(|s| s.to_string())
        .collect(),
    ))
  }

  /// Classifies a corpus id for a suite running `backend` in `mode`. Patterns
  /// see only the file name.
  pub fn classify(&self, id: &str, backend: &TargetBackend, mode: RunMode) -> Classification {
    let name = id.rsplit('/').next().unwrap_or(id);

    let mut winner: Option<(usize, &PatternRule)> = None;
    for (idx, rule) in self.rules.iter().enumerate() {
      if !rule.backend.covers(backend) || !rule.scopes(id) || !rule.include.is_match(name) {
        continue;
      }
      match winner {
        Some((_, current)) if current.dir.len() >= rule.dir.len() => {}
        _ => winner = Some((idx, rule)),
      }
    }

    let Some((winner_idx, winner)) = winner else {
      return Classification::NotMatched;
    };

    let excluded_earlier = self.rules[..winner_idx].iter().any(|rule| {
      rule.backend == winner.backend
        && rule.scopes(id)
        && rule.include.is_match(name)
        && rule.excludes(name)
    });
    if winner.excludes(name) || excluded_earlier {
      return Classification::ExcludedByPattern;
    }

    if mode == RunMode::WithBackend
      && self
        .frontend_only_suffixes
        .iter()
        .any(|suffix| name.ends_with(suffix.as_str()))
    {
      return Classification::ExcludedByPattern;
    }

    Classification::Active
  }

  /// Active ids among scanned entries, in scan order. Ancillary files are
  /// never tests.
  pub fn active_ids(
    &self,
    entries: &[ScanEntry],
    backend: &TargetBackend,
    mode: RunMode,
  ) -> Vec<String> {
    entries
      .iter()
      .filter(|entry| entry.kind != EntryKind::Ancillary)
      .filter(|entry| self.classify(&entry.id, backend, mode) == Classification::Active)
      .map(|entry| entry.id.clone())
      .collect()
  }
}
