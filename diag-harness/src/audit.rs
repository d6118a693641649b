use crate::HarnessError;
use crate::Result;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::Path;

/// Disagreement between the active corpus and the registered test ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletenessReport {
  /// Active files nobody registered.
  pub missing_registrations: BTreeSet<String>,
  /// Registered ids with no active file behind them.
  pub orphan_registrations: BTreeSet<String>,
}

impl CompletenessReport {
  pub fn is_empty(&self) -> bool {
    self.missing_registrations.is_empty() && self.orphan_registrations.is_empty()
  }

  pub fn render(&self) -> String {
    let mut out = String::new();
    for id in &self.missing_registrations {
      let _ = writeln!(out, "missing registration: {id}");
    }
    for id in &self.orphan_registrations {
      let _ = writeln!(out, "orphan registration: {id}");
    }
    out
  }
}

pub fn audit<'a>(
  active: impl IntoIterator<Item = &'a str>,
  registered: &BTreeSet<String>,
) -> CompletenessReport {
  let active: BTreeSet<String> = active.into_iter().map(str::to_string).collect();
  CompletenessReport {
    missing_registrations: active.difference(registered).cloned().collect(),
    orphan_registrations: registered.difference(&active).cloned().collect(),
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteRegistration {
  pub name: String,
  #[serde(default)]
  pub tests: BTreeSet<String>,
}

/// Registration manifest: which test ids each suite claims to cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registrations {
  #[serde(default, rename = "suite")]
  pub suites: Vec<SuiteRegistration>,
}

impl Registrations {
  pub fn load(path: &Path) -> Result<Registrations> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
      HarnessError::Registrations(format!("read {}: {err}", path.display()))
    })?;
    Self::from_str(&raw)
      .map_err(|err| HarnessError::Registrations(format!("{}: {err}", path.display())))
  }

  #[allow(clippy::should_implement_trait)]
  pub fn from_str(raw: &str) -> Result<Registrations> {
    let parsed: Registrations =
      toml::from_str(raw).map_err(|err| HarnessError::Registrations(err.to_string()))?;
    let mut names = BTreeSet::new();
    for suite in &parsed.suites {
      if !names.insert(suite.name.as_str()) {
        return Err(HarnessError::Registrations(format!(
          "suite '{}' registered twice",
          suite.name
        )));
      }
    }
    Ok(parsed)
  }

  pub fn write(&self, path: &Path) -> Result<()> {
    let raw =
      toml::to_string_pretty(self).map_err(|err| HarnessError::Registrations(err.to_string()))?;
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    std::fs::write(path, raw)?;
    Ok(())
  }

  pub fn suite(&self, name: &str) -> Option<&BTreeSet<String>> {
    self
      .suites
      .iter()
      .find(|suite| suite.name == name)
      .map(|suite| &suite.tests)
  }

  pub fn set_suite(&mut self, name: &str, tests: BTreeSet<String>) {
    match self.suites.iter_mut().find(|suite| suite.name == name) {
      Some(existing) => existing.tests = tests,
      None => self.suites.push(SuiteRegistration {
        name: name.to_string(),
        tests,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn reports_missing_and_orphans() {
    let report = audit(["a.kt", "b.kt"], &set(&["a.kt", "c.kt"]));
    assert_eq!(report.missing_registrations, set(&["b.kt"]));
    assert_eq!(report.orphan_registrations, set(&["c.kt"]));
    assert_eq!(
      report.render(),
      "missing registration: b.kt\norphan registration: c.kt\n"
    );
    assert!(audit(["a.kt"], &set(&["a.kt"])).is_empty());
  }

  #[test]
  fn manifest_round_trips_through_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested/registrations.toml");
    let mut registrations = Registrations::default();
    registrations.set_suite("diagnostics", set(&["b.kt", "a.kt"]));
    registrations.set_suite("fir", set(&["a.fir.kt"]));
    registrations.set_suite("diagnostics", set(&["a.kt"]));
    registrations.write(&path).unwrap();

    let loaded = Registrations::load(&path).unwrap();
    assert_eq!(loaded, registrations);
    assert_eq!(loaded.suite("diagnostics"), Some(&set(&["a.kt"])));
    assert_eq!(loaded.suite("absent"), None);
  }

  #[test]
  fn rejects_duplicate_suites() {
    let raw = "[[suite]]\nname = \"x\"\n[[suite]]\nname = \"x\"\n";
    assert!(matches!(
      Registrations::from_str(raw),
      Err(HarnessError::Registrations(_))
    ));
  }
}
