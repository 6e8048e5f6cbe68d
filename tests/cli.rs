// End-to-end tests of the `tt` binary: exit codes, the listing surface, and nested-invocation
// recursion detection through a real child process.

#![cfg(unix)]

use std::{fs, path::Path, process::Command};

fn tt() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tt"))
}

fn write_project(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }
    dir
}

fn run_in(project: &Path, args: &[&str]) -> std::process::Output {
    tt().args(args)
        .current_dir(project)
        .env("TT_BIN", env!("CARGO_BIN_EXE_tt"))
        .env_remove("TT_CALL_CHAIN")
        .output()
        .unwrap()
}

#[test]
fn missing_recipe_exits_with_one() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_in(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("tasktree.yaml"));
}

#[test]
fn successful_task_exits_with_zero() {
    let dir = write_project(&[(
        "tasktree.yaml",
        "tasks:\n  build:\n    cmd: touch bin.ok\n    outputs: [bin.ok]\n",
    )]);
    let output = run_in(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(dir.path().join("bin.ok").exists());
}

#[test]
fn failing_task_exits_with_one() {
    let dir = write_project(&[("tasktree.yaml", "tasks:\n  broken:\n    cmd: exit 5\n")]);
    let output = run_in(dir.path(), &["broken"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn invalid_argument_exits_with_two() {
    let dir = write_project(&[(
        "tasktree.yaml",
        "tasks:\n  serve:\n    cmd: echo {{ arg.port }}\n    args: [\"port:int\"]\n",
    )]);
    let output = run_in(dir.path(), &["serve", "port=eighty"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_runner_override_exits_with_two() {
    let dir = write_project(&[("tasktree.yaml", "tasks:\n  build:\n    cmd: true\n")]);
    let output = run_in(dir.path(), &["--runner", "phantom", "build"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn list_hides_private_tasks() {
    let dir = write_project(&[(
        "tasktree.yaml",
        r#"
tasks:
  visible:
    desc: A visible task
    cmd: true
  hidden:
    private: true
    cmd: true
"#,
    )]);
    let output = run_in(dir.path(), &["--list"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("visible"));
    assert!(!stdout.contains("hidden"));
}

#[test]
fn dry_run_reports_the_plan_without_running() {
    let dir = write_project(&[(
        "tasktree.yaml",
        r#"
tasks:
  lint:
    cmd: touch lint.ok
    outputs: [lint.ok]
  build:
    cmd: touch bin.ok
    outputs: [bin.ok]
    deps: [lint]
"#,
    )]);
    let output = run_in(dir.path(), &["--dry-run", "build"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("never_run"));
    assert!(!dir.path().join("lint.ok").exists());
    assert!(!dir.path().join("bin.ok").exists());
}

#[test]
fn clean_state_resets_freshness() {
    let dir = write_project(&[(
        "tasktree.yaml",
        "tasks:\n  build:\n    cmd: touch bin.ok\n    outputs: [bin.ok]\n",
    )]);
    assert_eq!(run_in(dir.path(), &["build"]).status.code(), Some(0));
    assert!(dir.path().join(".tasktree-state").exists());

    let output = run_in(dir.path(), &["--clean-state"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(!dir.path().join(".tasktree-state").exists());
}

#[test]
fn nested_self_invocation_is_rejected() {
    let dir = write_project(&[(
        "tasktree.yaml",
        "tasks:\n  selfcall:\n    cmd: '\"$TT_BIN\" selfcall'\n",
    )]);

    let output = run_in(dir.path(), &["selfcall"]);
    assert_ne!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Recursion"));
}

#[test]
fn nested_invocation_of_a_different_task_works() {
    let dir = write_project(&[(
        "tasktree.yaml",
        r#"
tasks:
  inner:
    cmd: touch inner.ok
  outer:
    cmd: '"$TT_BIN" inner'
"#,
    )]);

    let output = run_in(dir.path(), &["outer"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(dir.path().join("inner.ok").exists());
}
