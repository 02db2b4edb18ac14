//! Command-line behavior of the `hashpack` binary

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn project() -> TempDir {
    let tmp = TempDir::new().unwrap();
    write(
        tmp.path(),
        "hashpack.toml",
        "[project]\nname = \"demo\"\n\n[entries]\nmain = \"./src/index\"\n",
    );
    write(tmp.path(), "src/index.js", "require('./a');\nrequire('./b');\n");
    write(tmp.path(), "src/a.js", "require('./shared');\n");
    write(tmp.path(), "src/b.js", "require('./shared');\n");
    write(tmp.path(), "src/shared.js", "module.exports = 1;\n");
    tmp
}

fn hashpack(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("hashpack").unwrap();
    cmd.current_dir(dir)
        .env_remove("HASHPACK_STAMP")
        .env_remove("HASHPACK_CONFIG")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn build_writes_manifest_and_prints_summary() {
    let tmp = project();

    hashpack(tmp.path())
        .arg("build")
        .assert()
        .success()
        .stderr(predicate::str::contains("Building demo v0.1.0"))
        .stderr(predicate::str::contains("Built"));

    assert!(tmp.path().join("dist/manifest.json").exists());
    assert!(tmp.path().join("dist/main.html").exists());
}

#[test]
fn build_json_prints_manifest_on_stdout() {
    let tmp = project();

    let output = hashpack(tmp.path())
        .args(["build", "--json", "--stamp", "r42"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let manifest: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let scripts = manifest["main"]["scripts"].as_array().unwrap();
    assert_eq!(scripts.len(), 3);
    assert!(scripts
        .iter()
        .all(|s| s.as_str().unwrap().ends_with("-r42.js")));
}

#[test]
fn build_outdir_flag_overrides_config() {
    let tmp = project();

    hashpack(tmp.path())
        .args(["build", "--outdir", "public", "--mode", "development"])
        .assert()
        .success();

    assert!(tmp.path().join("public/manifest.json").exists());
    assert!(!tmp.path().join("dist").exists());
}

#[test]
fn failed_build_exits_non_zero_with_json_errors() {
    let tmp = project();
    write(tmp.path(), "src/a.js", "require('./nope');\n");

    let output = hashpack(tmp.path())
        .args(["build", "--json"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let errors: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let errors = errors.as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["stage"], "resolve");
    assert!(errors[0]["message"].as_str().unwrap().contains("./nope"));
    assert!(errors[0]["module"].as_str().unwrap().ends_with("a.js"));
}

#[test]
fn check_prints_chunk_plan_without_writing() {
    let tmp = project();

    hashpack(tmp.path())
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("common"))
        .stdout(predicate::str::contains("src/shared.js"))
        .stdout(predicate::str::contains("1 module(s)"));

    assert!(!tmp.path().join("dist").exists());
}

#[test]
fn missing_config_fails() {
    let tmp = TempDir::new().unwrap();

    hashpack(tmp.path())
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("hashpack.toml"));
}
