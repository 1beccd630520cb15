use anyhow::Result;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::{TempDir, tempdir};

/// Run the CLI binary against `data_dir` with given args
fn run_cli(data_dir: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_docsearch"))
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--in-process")
        .args(args)
        .env("RUST_LOG", "error") // Reduce log noise
        .output()?;
    Ok(output)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A data directory configured for the hashing model, and a documents folder.
fn setup() -> Result<(TempDir, TempDir)> {
    let data = tempdir()?;
    std::fs::write(
        data.path().join("docsearch.toml"),
        r#"
concurrency = 2
embedder_pool_size = 1

[model]
model = { kind = "hashing", dimension = 128 }
"#,
    )?;

    let docs = tempdir()?;
    std::fs::write(
        docs.path().join("cats.md"),
        "# Cats\n\nCats purr when they are content.\n",
    )?;
    std::fs::write(
        docs.path().join("garden.txt"),
        "Tomatoes need full sun and regular watering.\n",
    )?;
    Ok((data, docs))
}

#[test]
fn test_index_and_search() -> Result<()> {
    let (data, docs) = setup()?;
    let docs_arg = docs.path().to_string_lossy().into_owned();

    let output = run_cli(data.path(), &["index", &docs_arg])?;
    assert!(output.status.success(), "index failed: {output:?}");
    assert!(stdout(&output).contains("2 new"));

    let output = run_cli(data.path(), &["search", "cats purr", "-k", "1", "--format", "json"])?;
    assert!(output.status.success(), "search failed: {output:?}");
    let results: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let results = results.as_array().expect("array of results");
    assert_eq!(results.len(), 1);
    assert!(results[0]["path"].as_str().unwrap().ends_with("cats.md"));
    Ok(())
}

#[test]
fn test_files_status_and_clear() -> Result<()> {
    let (data, docs) = setup()?;
    let docs_arg = docs.path().to_string_lossy().into_owned();
    assert!(run_cli(data.path(), &["index", &docs_arg])?.status.success());

    let output = run_cli(data.path(), &["files", "--status", "indexed"])?;
    assert!(output.status.success());
    assert!(stdout(&output).contains("Found 2 files"));

    let output = run_cli(data.path(), &["status", "--format", "json"])?;
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(status["total_files"], 2);
    assert_eq!(status["files_by_status"]["indexed"], 2);

    let cats = docs.path().join("cats.md");
    let output = run_cli(data.path(), &["remove", &cats.to_string_lossy()])?;
    assert!(output.status.success());
    assert!(stdout(&output).contains("Removed 1 files"));

    assert!(run_cli(data.path(), &["clear"])?.status.success());
    let output = run_cli(data.path(), &["status"])?;
    assert!(stdout(&output).contains("Files: 0"));
    Ok(())
}

#[test]
fn test_invalid_arguments() -> Result<()> {
    let (data, _docs) = setup()?;

    let output = run_cli(data.path(), &["files", "--status", "bogus"])?;
    assert!(!output.status.success());

    let output = run_cli(data.path(), &["similar", "/definitely/not/indexed.md"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("is not indexed"));
    Ok(())
}
