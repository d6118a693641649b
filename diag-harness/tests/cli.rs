#![cfg(unix)]

use assert_cmd::Command;
use diag_harness::Registrations;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

fn diag_harness() -> Command {
  let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("diag-harness");
  cmd.timeout(Duration::from_secs(60));
  cmd
}

fn fixtures() -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

fn fixture_config() -> PathBuf {
  fixtures().join("diag-harness.toml")
}

/// Fixture config without the registration manifest, written next to a
/// corpus in `dir`.
fn write_config(dir: &std::path::Path) -> PathBuf {
  let raw = std::fs::read_to_string(fixture_config())
    .unwrap()
    .replace("registrations = \"registrations.toml\"\n", "");
  let path = dir.join("diag-harness.toml");
  std::fs::write(&path, raw).unwrap();
  path
}

#[test]
fn runs_fixture_corpus() {
  let scratch = tempdir().unwrap();
  let assert = diag_harness()
    .arg("run")
    .arg("--config")
    .arg(fixture_config())
    .arg("--scratch")
    .arg(scratch.path())
    .assert()
    .success();
  let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
  assert!(
    stdout.contains("diagnostics [JS_IR with-backend]: ran 6 test(s): 5 passed, 0 failed, 1 skipped"),
    "{stdout}"
  );
}

#[test]
fn emits_json_report() {
  let scratch = tempdir().unwrap();
  let out = tempdir().unwrap();
  let json_out = out.path().join("reports/run.json");
  let assert = diag_harness()
    .arg("run")
    .arg("--config")
    .arg(fixture_config())
    .arg("--scratch")
    .arg(scratch.path())
    .arg("--json")
    .arg("--json-out")
    .arg(&json_out)
    .assert()
    .success();

  let report: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
  assert_eq!(report["schema_version"], 1);
  assert_eq!(report["success"], true);
  let suite = &report["suites"][0];
  assert_eq!(suite["suite"], "diagnostics");
  assert_eq!(suite["summary"]["passed"], 5);
  assert_eq!(suite["completeness"]["missing_registrations"], Value::Array(vec![]));

  let written: Value = serde_json::from_str(&std::fs::read_to_string(&json_out).unwrap()).unwrap();
  assert_eq!(written["suites"][0]["summary"], suite["summary"]);
}

#[test]
fn mismatch_exits_with_one_and_shows_diff() {
  let dir = tempdir().unwrap();
  let corpus = dir.path().join("corpus");
  std::fs::create_dir_all(&corpus).unwrap();
  std::fs::write(
    corpus.join("a.kt"),
    "fun main() {\n  val x = 1\n  println(x)\n  val unused = 2\n}\n// expect: warning UNUSED_VALUE at 3\n",
  )
  .unwrap();
  std::fs::write(
    corpus.join("a.kt.json"),
    r#"{"success": true, "diagnostics": [{"severity": "warning", "code": "UNUSED_VALUE", "line": 4, "column": 7}]}"#,
  )
  .unwrap();
  let config = write_config(dir.path());

  let assert = diag_harness()
    .arg("run")
    .arg("--config")
    .arg(&config)
    .arg("--mode")
    .arg("frontend-only")
    .arg("--scratch")
    .arg(dir.path().join("scratch"))
    .assert()
    .code(1);
  let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
  assert!(stdout.contains("FAIL a.kt\n"), "{stdout}");
  assert!(stdout.contains("- a.kt:3 warning[UNUSED_VALUE]"), "{stdout}");
  assert!(stdout.contains("+ a.kt:4:7 warning[UNUSED_VALUE]"), "{stdout}");
  assert!(stdout.contains("1 failed"), "{stdout}");
}

#[test]
fn harness_errors_exit_with_two() {
  let dir = tempdir().unwrap();
  let assert = diag_harness()
    .arg("run")
    .arg("--config")
    .arg(fixture_config())
    .arg("--root")
    .arg(dir.path().join("absent"))
    .assert()
    .code(2);
  let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
  assert!(stderr.starts_with("error: scan failed"), "{stderr}");

  diag_harness()
    .current_dir(dir.path())
    .arg("run")
    .arg("--root")
    .arg(".")
    .assert()
    .code(2);

  diag_harness()
    .arg("run")
    .arg("--config")
    .arg(fixture_config())
    .arg("--shard")
    .arg("3/2")
    .assert()
    .code(2);
}

#[test]
fn lists_active_ids() {
  let assert = diag_harness()
    .arg("list")
    .arg("--config")
    .arg(fixture_config())
    .assert()
    .success();
  let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
  let mut ids: Vec<&str> = stdout.lines().collect();
  ids.sort();
  assert_eq!(
    ids,
    vec![
      "backend/must_fail.kt",
      "jvm_only.kt",
      "markers.kt",
      "multi/two_files.kt",
      "suppressed.kt",
      "unused.kt",
    ]
  );
}

#[test]
fn audit_and_register_keep_manifest_in_sync() {
  diag_harness()
    .arg("audit")
    .arg("--config")
    .arg(fixture_config())
    .assert()
    .success();

  let dir = tempdir().unwrap();
  let manifest = dir.path().join("registrations.toml");
  std::fs::write(
    &manifest,
    "[[suite]]\nname = \"diagnostics\"\ntests = [\"jvm_only.kt\", \"deleted.kt\"]\n",
  )
  .unwrap();

  let assert = diag_harness()
    .arg("audit")
    .arg("--config")
    .arg(fixture_config())
    .arg("--registrations")
    .arg(&manifest)
    .assert()
    .code(1);
  let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
  assert!(stdout.contains("missing registration: unused.kt\n"), "{stdout}");
  assert!(stdout.contains("orphan registration: deleted.kt\n"), "{stdout}");

  diag_harness()
    .arg("register")
    .arg("--config")
    .arg(fixture_config())
    .arg("--registrations")
    .arg(&manifest)
    .assert()
    .success();
  let rewritten = Registrations::load(&manifest).unwrap();
  let expected = Registrations::load(&fixtures().join("registrations.toml")).unwrap();
  assert_eq!(rewritten, expected);

  diag_harness()
    .arg("audit")
    .arg("--config")
    .arg(fixture_config())
    .arg("--registrations")
    .arg(&manifest)
    .assert()
    .success();
}
