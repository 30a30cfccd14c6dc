//! CLI test cases.
//!
//! These avoid needing tesseract or poppler by configuring the installed
//! language packs explicitly, and by only exercising paths that fail or
//! finish before any external tool would run.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("docquery-ocr").unwrap();
    // Keep the developer's environment out of our tests.
    for var in [
        "DOCQUERY_MAX_CONCURRENT_PAGES",
        "DOCQUERY_PAGE_TIMEOUT",
        "DOCQUERY_CONFIDENCE_THRESHOLD",
        "DOCQUERY_INSTALLED_LANGUAGES",
        "DOCQUERY_RASTERIZE_DPI",
        "DOCQUERY_KEEP_COLOR",
        "DOCQUERY_IGNORE_TEXT_LAYER",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("DOCQUERY_PAGE_TIMEOUT"));
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    cmd()
        .args(["schema", "OcrOutput"])
        .assert()
        .success()
        .stdout(predicate::str::contains("overall_status"))
        .stdout(predicate::str::contains("COMPLETE"));
}

#[test]
fn test_languages_uses_configured_packs() {
    cmd()
        .args(["languages", "--installed-languages", "fra,eng"])
        .assert()
        .success()
        .stdout("eng\nfra\n");
}

#[test]
fn test_unsupported_language_is_rejected() {
    cmd()
        .args(["ocr", "--languages", "klingon", "whatever.pdf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported language"));
}

#[test]
fn test_uninstalled_language_is_rejected() {
    cmd()
        .args([
            "ocr",
            "--installed-languages",
            "eng",
            "--languages",
            "fra,eng",
            "tests/fixtures/does-not-exist.pdf",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not installed"));
}

#[test]
fn test_unreadable_file_becomes_error_record() {
    cmd()
        .args([
            "ocr",
            "--installed-languages",
            "eng",
            "tests/fixtures/does-not-exist.pdf",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("could not read file"));
}
