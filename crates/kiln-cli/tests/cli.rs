//! CLI integration tests.
//!
//! Fake translator and toolchain scripts stand in for the real compilers.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const PROGRAM: &str = "parameters { real y; } model { y ~ normal(0,1); }";

fn kiln(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.arg("--home").arg(home);
    cmd.env_remove("KILN_HOME");
    cmd
}

#[test]
fn test_help() {
    Command::cargo_bin("kiln")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("delete"));
}

#[test]
fn test_list_empty_store() {
    let home = TempDir::new().unwrap();
    kiln(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No models stored."));
    assert!(home.path().join("store.sqlite3").exists());
}

#[test]
fn test_invalid_model_name_shows_hint() {
    let home = TempDir::new().unwrap();
    kiln(home.path())
        .args(["show", "not-a-model"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid model name"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn test_delete_missing_model() {
    let home = TempDir::new().unwrap();
    kiln(home.path())
        .args(["delete", "models/0123456789"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("model not found: models/0123456789"));
}

#[test]
fn test_compile_missing_file() {
    let home = TempDir::new().unwrap();
    kiln(home.path())
        .args(["compile", "does-not-exist.stan"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[cfg(unix)]
mod with_fake_tools {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const TRANSLATOR: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "fake-translator 2.32.0"; exit 0; fi
for arg in "$@"; do
  case "$arg" in
    --o=*) out="${arg#--o=}" ;;
    --name=*) ;;
    *) src="$arg" ;;
  esac
done
if grep -q "syntax error" "$src"; then echo "Syntax error in 'model', line 1" >&2; exit 1; fi
cp "$src" "$out"
"#;

    const TOOLCHAIN: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
base=$(basename "$out")
echo "warning: fake toolchain building ${base%.*}" >&2
printf 'fake module\000kiln_init_%s\000' "${base%.*}" > "$out"
"#;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Setup {
        _dir: TempDir,
        home: PathBuf,
        translator: PathBuf,
        toolchain: PathBuf,
        program: PathBuf,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let translator = script(dir.path(), "fake-translator", TRANSLATOR);
        let toolchain = script(dir.path(), "fake-toolchain", TOOLCHAIN);
        let program = dir.path().join("model.stan");
        fs::write(&program, PROGRAM).unwrap();

        Setup {
            home: dir.path().join("home"),
            _dir: dir,
            translator,
            toolchain,
            program,
        }
    }

    fn kiln_with_tools(setup: &Setup) -> Command {
        let mut cmd = kiln(&setup.home);
        cmd.env("KILN_TRANSLATOR", &setup.translator)
            .env("KILN_TOOLCHAIN", &setup.toolchain);
        cmd
    }

    fn model_name(setup: &Setup) -> String {
        let output = kiln_with_tools(setup)
            .arg("name")
            .arg(&setup.program)
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[test]
    fn test_name_is_stable() {
        let setup = setup();
        let first = model_name(&setup);
        assert!(first.starts_with("models/"));
        assert_eq!(first.len(), "models/".len() + 10);
        assert_eq!(model_name(&setup), first);
    }

    #[test]
    fn test_compile_list_show_delete() {
        let setup = setup();
        let name = model_name(&setup);

        kiln_with_tools(&setup)
            .arg("compile")
            .arg(&setup.program)
            .assert()
            .success()
            .stdout(predicate::str::contains(name.as_str()))
            .stdout(predicate::str::contains("built"));

        kiln_with_tools(&setup)
            .arg("compile")
            .arg(&setup.program)
            .assert()
            .success()
            .stdout(predicate::str::contains("cached"));

        kiln(&setup.home)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains(name.as_str()));

        kiln(&setup.home)
            .args(["show", name.as_str()])
            .assert()
            .success()
            .stdout(predicate::str::contains("warning: fake toolchain building model_"));

        // The fake image is not a real shared library.
        kiln(&setup.home)
            .args(["load", name.as_str()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed to load module"));

        kiln(&setup.home)
            .args(["delete", name.as_str()])
            .assert()
            .success();

        kiln(&setup.home)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No models stored."));

        // Nothing is left behind in scratch space.
        let scratch = setup.home.join("scratch");
        assert!(fs::read_dir(&scratch).unwrap().next().is_none());
    }

    #[test]
    fn test_translation_error_is_reported() {
        let setup = setup();
        fs::write(&setup.program, "model { syntax error }").unwrap();

        kiln_with_tools(&setup)
            .arg("compile")
            .arg(&setup.program)
            .assert()
            .failure()
            .stderr(predicate::str::contains("translation failed"))
            .stderr(predicate::str::contains("Syntax error"));

        kiln(&setup.home)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No models stored."));
    }
}
