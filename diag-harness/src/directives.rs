use crate::diagnostic::Diagnostic;
use crate::diagnostic::Severity;
use crate::patterns::TargetBackend;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

pub const FILE_DIRECTIVE: &str = "FILE";
pub const TARGET_BACKEND_DIRECTIVE: &str = "TARGET_BACKEND";
pub const IGNORE_BACKEND_DIRECTIVE: &str = "IGNORE_BACKEND";
pub const DIAGNOSTICS_DIRECTIVE: &str = "DIAGNOSTICS";
pub const BACKEND_DIRECTIVE: &str = "BACKEND";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
  /// Directive name as written (e.g. `FILE`, `TARGET_BACKEND`).
  pub name: String,
  /// Raw value after the colon, trimmed; `None` if omitted or empty.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
  /// 1-based line number within the original test file.
  pub line: usize,
}

/// Parse a directive from a single line of text.
///
/// Directives are line comments of the form `// NAME` or `// NAME: value`,
/// where `NAME` is an upper-case identifier. Anything else after the name
/// (e.g. `// TODO fix this`) is ordinary comment text and not a directive.
pub fn parse_directive(raw_line: &str, line_number: usize) -> Option<Directive> {
  let trimmed = raw_line.trim_start();
  if !trimmed.starts_with("//") {
    return None;
  }

  let content = trimmed.trim_start_matches('/').trim();
  let name_len = content
    .char_indices()
    .take_while(|(idx, c)| {
      if *idx == 0 {
        c.is_ascii_uppercase()
      } else {
        c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_'
      }
    })
    .count();
  if name_len == 0 {
    return None;
  }

  let (name, rest) = content.split_at(name_len);
  let value = if rest.is_empty() {
    None
  } else if let Some(value) = rest.strip_prefix(':') {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
  } else {
    return None;
  };

  Some(Directive {
    name: name.to_string(),
    value,
    line: line_number,
  })
}

/// Ignorable-diagnostic markers accumulated from `DIAGNOSTICS:` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suppression {
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub codes: BTreeSet<String>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub severities: BTreeSet<Severity>,
}

impl Suppression {
  pub fn is_empty(&self) -> bool {
    self.codes.is_empty() && self.severities.is_empty()
  }

  pub fn is_ignored(&self, diagnostic: &Diagnostic) -> bool {
    if self.severities.contains(&diagnostic.severity) {
      return true;
    }
    diagnostic
      .code
      .as_ref()
      .is_some_and(|code| self.codes.contains(code))
  }

  /// Applies one `-X` / `+X` token. Returns `false` for tokens that carry no
  /// sign or name nothing.
  fn apply_token(&mut self, token: &str) -> bool {
    let (enable, name) = if let Some(name) = token.strip_prefix('-') {
      (false, name)
    } else if let Some(name) = token.strip_prefix('+') {
      (true, name)
    } else {
      return false;
    };
    if name.is_empty() {
      return false;
    }

    let severity = match name {
      "warnings" | "warning" => Some(Severity::Warning),
      "infos" | "info" => Some(Severity::Info),
      _ => None,
    };
    match (severity, enable) {
      (Some(severity), false) => {
        self.severities.insert(severity);
      }
      (Some(severity), true) => {
        self.severities.remove(&severity);
      }
      (None, false) => {
        self.codes.insert(name.to_string());
      }
      (None, true) => {
        self.codes.remove(name);
      }
    }
    true
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HarnessOptions {
  /// Backends the test is restricted to; empty means every backend.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub target_backends: Vec<TargetBackend>,
  /// Backends the test is known to fail on.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub ignore_backends: Vec<TargetBackend>,
  #[serde(default, skip_serializing_if = "Suppression::is_empty")]
  pub suppression: Suppression,
  /// Raw `BACKEND:` value with the line it came from; validated by the
  /// expectation extractor.
  #[serde(skip)]
  pub backend: Option<(String, usize)>,
}

impl HarnessOptions {
  /// Folds directives in order. Scalar directives are last-one-wins;
  /// `DIAGNOSTICS` accumulates.
  pub fn from_directives(directives: &[Directive]) -> (HarnessOptions, Vec<String>) {
    let mut options = HarnessOptions::default();
    let mut notes = Vec::new();
    for directive in directives {
      let value = directive.value.as_deref();
      match directive.name.as_str() {
        TARGET_BACKEND_DIRECTIVE => options.target_backends = parse_backends(value),
        IGNORE_BACKEND_DIRECTIVE => options.ignore_backends = parse_backends(value),
        DIAGNOSTICS_DIRECTIVE => {
          for token in parse_list(value) {
            if !options.suppression.apply_token(&token) {
              notes.push(format!(
                "ignoring DIAGNOSTICS token '{token}' at line {}; expected -NAME or +NAME",
                directive.line
              ));
            }
          }
        }
        BACKEND_DIRECTIVE => match value {
          Some(value) => options.backend = Some((value.to_string(), directive.line)),
          None => notes.push(format!(
            "missing BACKEND value at line {}; ignoring directive",
            directive.line
          )),
        },
        _ => {}
      }
    }

    (options, notes)
  }

  pub fn runs_on(&self, backend: &TargetBackend) -> bool {
    self.target_backends.is_empty() || self.target_backends.iter().any(|b| b.covers(backend))
  }

  pub fn ignores(&self, backend: &TargetBackend) -> bool {
    self.ignore_backends.iter().any(|b| b.covers(backend))
  }
}

fn parse_backends(raw: Option<&str>) -> Vec<TargetBackend> {
  parse_list(raw).iter().map(|s| TargetBackend::new(s)).collect()
}

fn parse_list(raw: Option<&str>) -> Vec<String> {
  let Some(raw) = raw else {
    return Vec::new();
  };

  raw
    .split(|c| c == ',' || c == ' ' || c == '\t')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(|s| s.to_string())
    .collect()
}
