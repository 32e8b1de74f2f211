//! CLI surface tests
//!
//! Exercise the binary end to end with the in-process memory adapter:
//! exit code 2 for configuration errors, 0 for clean runs, and per-file
//! failures not failing the process.

use assert_cmd::Command;
use predicates::prelude::*;

fn base_cmd(root: &std::path::Path) -> Command {
    let drop_dir = root.join("drop");
    std::fs::create_dir_all(&drop_dir).unwrap();
    let mut cmd = Command::cargo_bin("fileloader").unwrap();
    cmd.current_dir(root)
        .env_clear()
        .env("DATABASE_URL", "memory://")
        .env("DIRECTORY_PATH", drop_dir)
        .env("ARCHIVE_PATH", root.join("archive"))
        .env("DUPLICATE_FILES_PATH", root.join("duplicates"))
        .env("WORKERS", "2");
    cmd
}

#[test]
fn help_lists_the_run_command() {
    let mut cmd = Command::cargo_bin("fileloader").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("--help"));
}

#[test]
fn missing_configuration_exits_2() {
    let root = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("fileloader").unwrap();
    cmd.current_dir(root.path()).env_clear().arg("run");
    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("DATABASE_URL"));
}

#[test]
fn unsupported_database_scheme_exits_2() {
    let root = tempfile::tempdir().unwrap();
    let mut cmd = base_cmd(root.path());
    cmd.env("DATABASE_URL", "oracle://db").arg("run");
    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("unsupported database driver"));
}

#[test]
fn empty_drop_directory_is_a_clean_run() {
    let root = tempfile::tempdir().unwrap();
    let mut cmd = base_cmd(root.path());
    cmd.arg("run");
    cmd.assert().success();
}

#[test]
fn per_file_failure_still_exits_0() {
    let root = tempfile::tempdir().unwrap();
    let mut cmd = base_cmd(root.path());
    // matches the catalog's `customers` source but misses required columns
    std::fs::write(root.path().join("drop/customers.csv"), "id,other\n1,x\n").unwrap();
    cmd.arg("run");
    cmd.assert().success();
    assert!(root.path().join("duplicates/customers.csv").exists());
}

#[test]
fn successful_file_is_archived_and_removed_from_drop() {
    let root = tempfile::tempdir().unwrap();
    let mut cmd = base_cmd(root.path());
    std::fs::write(
        root.path().join("drop/customers.csv"),
        "id,name,age\n1,alice,30\n2,bob,25\n",
    )
    .unwrap();
    cmd.arg("run");
    cmd.assert().success();
    assert!(root.path().join("archive/customers.csv").exists());
    assert!(!root.path().join("drop/customers.csv").exists());
}

#[test]
fn unknown_source_restriction_exits_2() {
    let root = tempfile::tempdir().unwrap();
    let mut cmd = base_cmd(root.path());
    cmd.args(["run", "--source", "nope"]);
    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("unknown source"));
}

#[test]
fn single_file_mode_processes_the_given_path() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("elsewhere");
    std::fs::create_dir_all(&path).unwrap();
    let file = path.join("customers.csv");
    std::fs::write(&file, "id,name,age\n7,zoe,28\n").unwrap();

    let mut cmd = base_cmd(root.path());
    cmd.args(["run", "--file", file.to_str().unwrap()]);
    cmd.assert().success();
    assert!(root.path().join("archive/customers.csv").exists());
    assert!(!file.exists());
}
