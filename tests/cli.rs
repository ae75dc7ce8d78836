//! CLI test cases.
//!
//! Most of these use the offline `echo` driver, which answers every prompt
//! with the prompt's own text. That lets us check the whole pipeline, and the
//! prompts we build, without a real model. Tests which need a real
//! OpenAI-compatible server are ignored by default.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

static PAGE_1: &str = "tests/fixtures/pages/page1.png";
static PAGE_2: &str = "tests/fixtures/pages/page2.png";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("paper-smith").unwrap()
}

/// A `generate` command using the echo driver.
fn generate_with_echo() -> Command {
    let mut cmd = cmd();
    cmd.arg("generate").arg("--driver").arg("echo");
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_generate_with_echo() {
    generate_with_echo()
        .arg(PAGE_1)
        .arg(PAGE_2)
        .arg("--marks")
        .arg("20")
        .assert()
        .success()
        .stdout(predicate::str::contains("a total of 20 marks"))
        .stdout(predicate::str::contains(
            "multiple choice, short answer, and essay questions",
        ))
        .stdout(predicate::str::contains("Transcribe all of the text"));
}

#[test]
fn test_generate_with_options() {
    generate_with_echo()
        .arg(PAGE_1)
        .arg("--marks")
        .arg("50")
        .arg("--language")
        .arg("Spanish")
        .arg("-t")
        .arg("Essay")
        .arg("-t")
        .arg("essay")
        .arg("-t")
        .arg("Fill in the blanks")
        .arg("--format-instructions")
        .arg("Number questions with Roman numerals.")
        .assert()
        .success()
        .stdout(predicate::str::contains("a total of 50 marks"))
        .stdout(predicate::str::contains(
            "Use only these question types: Essay, Fill in the blanks.",
        ))
        .stdout(predicate::str::contains("Write the entire test paper in Spanish."))
        .stdout(predicate::str::contains("Number questions with Roman numerals."))
        .stdout(predicate::str::contains("multiple choice, short answer").not());
}

#[test]
fn test_generate_from_request_file() {
    generate_with_echo()
        .arg("--request")
        .arg("tests/fixtures/request.toml")
        .assert()
        .success()
        .stdout(predicate::str::contains("a total of 20 marks"))
        .stdout(predicate::str::contains("Essay, True/False"))
        .stdout(predicate::str::contains("Write the entire test paper in French."))
        .stdout(predicate::str::contains("Section A: true/false. Section B: one essay."))
        .stdout(predicate::str::contains("sample test paper"));
}

#[test]
fn test_generate_json_output_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("paper.json");
    generate_with_echo()
        .arg(PAGE_1)
        .arg(PAGE_2)
        .arg("--marks")
        .arg("20")
        .arg("--output-format")
        .arg("json")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let output: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(output["marks"], 20);
    assert_eq!(output["image_count"], 2);
    assert!(output["test_paper"].as_str().unwrap().contains("20 marks"));
    assert!(output.get("skipped_pages").is_none());
}

#[test]
fn test_generate_rejects_zero_marks() {
    generate_with_echo()
        .arg(PAGE_1)
        .arg("--marks")
        .arg("0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("marks must be a positive number"));
}

#[test]
fn test_generate_requires_marks() {
    generate_with_echo().arg(PAGE_1).assert().failure();
}

#[test]
fn test_generate_rejects_non_images() {
    generate_with_echo()
        .arg("tests/fixtures/not_an_image.txt")
        .arg("--marks")
        .arg("10")
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected an image"));
}

#[test]
fn test_generate_request_conflicts_with_images() {
    generate_with_echo()
        .arg(PAGE_1)
        .arg("--request")
        .arg("tests/fixtures/request.toml")
        .assert()
        .failure();
}

#[test]
fn test_ocr_with_echo() {
    cmd()
        .arg("ocr")
        .arg("--driver")
        .arg("echo")
        .arg(PAGE_1)
        .arg(PAGE_2)
        .arg("--output-format")
        .arg("json")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""path": "tests/fixtures/pages/page2.png""#))
        .stdout(predicate::str::contains("Transcribe all of the text"));
}

#[test]
fn test_schema() {
    for (schema_type, field) in [
        ("PaperRequest", "format_reference"),
        ("PaperOutput", "test_paper"),
        ("OcrOutput", "path"),
    ] {
        cmd()
            .arg("schema")
            .arg(schema_type)
            .assert()
            .success()
            .stdout(predicate::str::contains(field));
    }
}

#[test]
#[ignore = "Needs an OpenAI-compatible server and OPENAI_API_KEY"]
fn test_generate_with_real_model() {
    cmd()
        .arg("generate")
        .arg(PAGE_1)
        .arg(PAGE_2)
        .arg("--marks")
        .arg("10")
        .arg("--best-effort")
        .assert()
        .success();
}
