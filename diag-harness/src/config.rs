//! `diag-harness.toml`: commands, scratch space, and suites.
//!
//! Relative paths are resolved against the directory holding the config file.
//! CLI flags override anything set here.

use crate::compare::CompareMode;
use crate::driver::SuiteOptions;
use crate::driver::DEFAULT_STAGE_TIMEOUT;
use crate::patterns::PatternRule;
use crate::patterns::RuleSet;
use crate::patterns::RunMode;
use crate::patterns::TargetBackend;
use crate::patterns::DEFAULT_FRONTEND_ONLY_SUFFIXES;
use crate::process::CommandSpec;
use crate::scan::ScanOptions;
use crate::HarnessError;
use crate::Result;
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "diag-harness.toml";

fn default_stage_timeout_secs() -> u64 {
  DEFAULT_STAGE_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
  #[serde(default)]
  pub scratch_root: Option<PathBuf>,
  #[serde(default)]
  pub jobs: Option<usize>,
  #[serde(default = "default_stage_timeout_secs")]
  pub stage_timeout_secs: u64,
  #[serde(default)]
  pub compare: CompareMode,
  #[serde(default)]
  pub frontend: Option<CommandSpec>,
  #[serde(default)]
  pub backend: Option<CommandSpec>,
  /// Registration manifest checked by the completeness audit.
  #[serde(default)]
  pub registrations: Option<PathBuf>,
  #[serde(default)]
  pub suites: Vec<SuiteConfig>,
  #[serde(skip)]
  pub base_dir: PathBuf,
}

impl Default for HarnessConfig {
  fn default() -> Self {
    Self {
      scratch_root: None,
      jobs: None,
      stage_timeout_secs: default_stage_timeout_secs(),
      compare: CompareMode::default(),
      frontend: None,
      backend: None,
      registrations: None,
      suites: Vec::new(),
      base_dir: PathBuf::from("."),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
  pub name: String,
  pub root: PathBuf,
  #[serde(default)]
  pub backend: TargetBackend,
  #[serde(default)]
  pub mode: RunMode,
  /// Empty means the default include/exclude rule for the suite backend.
  #[serde(default)]
  pub rules: Vec<RuleConfig>,
  #[serde(default)]
  pub variant_suffixes: Option<Vec<String>>,
  #[serde(default)]
  pub frontend_only_suffixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
  #[serde(default)]
  pub dir: String,
  pub include: String,
  #[serde(default)]
  pub exclude: Option<String>,
  /// Defaults to the suite backend.
  #[serde(default)]
  pub backend: Option<TargetBackend>,
}

impl HarnessConfig {
  pub fn load(path: &Path) -> Result<HarnessConfig> {
    let raw = std::fs::read_to_string(path)
      .map_err(|err| HarnessError::Config(format!("read {}: {err}", path.display())))?;
    let mut config = Self::from_str(&raw)
      .map_err(|err| HarnessError::Config(format!("{}: {err}", path.display())))?;
    let parent = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));
    // Stage commands run inside scratch directories, so paths handed to them
    // must not depend on the working directory.
    config.base_dir = if parent.is_absolute() {
      parent
    } else {
      std::env::current_dir()
        .map_err(|err| HarnessError::Config(format!("resolve current directory: {err}")))?
        .join(parent)
    };
    Ok(config)
  }

  #[allow(clippy::should_implement_trait)]
  pub fn from_str(raw: &str) -> Result<HarnessConfig> {
    let config: HarnessConfig =
      toml::from_str(raw).map_err(|err| HarnessError::Config(err.to_string()))?;
    for (idx, suite) in config.suites.iter().enumerate() {
      if config.suites[..idx].iter().any(|s| s.name == suite.name) {
        return Err(HarnessError::Config(format!(
          "suite '{}' defined twice",
          suite.name
        )));
      }
    }
    Ok(config)
  }

  pub fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.base_dir.join(path)
    }
  }

  pub fn suite(&self, name: &str) -> Option<&SuiteConfig> {
    self.suites.iter().find(|suite| suite.name == name)
  }

  pub fn registrations_path(&self) -> Option<PathBuf> {
    self.registrations.as_deref().map(|p| self.resolve(p))
  }

  /// Suite options from the config layer alone; the CLI adjusts them after.
  pub fn suite_options(&self, suite: &SuiteConfig) -> Result<SuiteOptions> {
    let mut opts = SuiteOptions::new(suite.name.clone(), self.resolve(&suite.root))?;
    opts.backend = suite.backend.clone();
    opts.mode = suite.mode;
    opts.rules = suite.rule_set()?;
    opts.scan = suite.scan_options();
    opts.stage_timeout = Duration::from_secs(self.stage_timeout_secs);
    opts.compare = self.compare;
    if let Some(jobs) = self.jobs {
      opts.jobs = jobs.max(1);
    }
    if let Some(scratch) = &self.scratch_root {
      opts.scratch_root = self.resolve(scratch);
    }
    Ok(opts)
  }
}

impl SuiteConfig {
  pub fn rule_set(&self) -> Result<RuleSet> {
    let frontend_only = self.frontend_only_suffixes.clone().unwrap_or_else(|| {
      DEFAULT_FRONTEND_ONLY_SUFFIXES
        .iter()
        .map(|s| s.to_string())
        .collect()
    });
    if self.rules.is_empty() {
      let mut rules = RuleSet::with_defaults(self.backend.clone())?;
      rules.frontend_only_suffixes = frontend_only;
      return Ok(rules);
    }

    let rules = self
      .rules
      .iter()
      .map(|rule| {
        PatternRule::new(
          &rule.dir,
          &rule.include,
          rule.exclude.as_deref(),
          rule.backend.clone().unwrap_or_else(|| self.backend.clone()),
        )
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(RuleSet::new(rules, frontend_only))
  }

  pub fn scan_options(&self) -> ScanOptions {
    match &self.variant_suffixes {
      Some(suffixes) => ScanOptions {
        variant_suffixes: suffixes.clone(),
      },
      None => ScanOptions::default(),
    }
  }
}
