use crate::recipe::{Runner, RunnerKind, Task};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// Hash widths, in hexadecimal characters. Task and argument identifiers only need to be unique
// within one project's state file; runner identity gets a wider margin because it also guards
// container image reuse.
const TASK_HASH_WIDTH: usize = 8;
const ARGS_HASH_WIDTH: usize = 8;
const RUNNER_HASH_WIDTH: usize = 16;

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

// Fingerprint a task definition. Fields whose order is not semantic (outputs, args, deps) are
// sorted first so that reordering them in the recipe does not invalidate cached state. The
// effective runner name participates because switching runners must re-run the task.
pub fn hash_task(task: &Task, runner_name: &str) -> String {
    let mut outputs = task
        .outputs
        .iter()
        .map(|entry| match &entry.name {
            Some(name) => format!("{}={}", name, entry.pattern),
            None => entry.pattern.clone(),
        })
        .collect::<Vec<_>>();
    outputs.sort();

    let mut args = task
        .args
        .iter()
        .map(crate::recipe::ArgSpec::canonical)
        .collect::<Vec<_>>();
    args.sort();

    let mut deps = task
        .deps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    deps.sort();

    // `serde_json`'s map type keeps keys sorted, so this serialization is deterministic.
    let canonical = serde_json::json!({
        "args": args,
        "cmd": task.cmd,
        "deps": deps,
        "outputs": outputs,
        "runner": runner_name,
        "working_dir": task.working_dir,
    });

    digest(&canonical.to_string())[..TASK_HASH_WIDTH].to_owned()
}

// Fingerprint an argument binding. The map is already name-sorted; values are in their canonical
// string forms, so equal bindings hash equally no matter how they were written on the command
// line or in a dep entry.
pub fn hash_args(args: &BTreeMap<String, String>) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    digest(&canonical)[..ARGS_HASH_WIDTH].to_owned()
}

// The key a task invocation's state is stored under.
pub fn cache_key(task_hash: &str, args: &BTreeMap<String, String>) -> String {
    if args.is_empty() {
        task_hash.to_owned()
    } else {
        format!("{}__{}", task_hash, hash_args(args))
    }
}

// Fingerprint a runner definition. Shell flag order is not semantic and is sorted away;
// container `extra_args` order is semantic and preserved.
pub fn hash_runner(runner: &Runner) -> String {
    let mut shell_args = runner.args.clone();
    if runner.kind() == RunnerKind::Shell {
        shell_args.sort();
    }

    let canonical = serde_json::json!({
        "args": shell_args,
        "build_args": runner.build_args,
        "context": runner.context,
        "dockerfile": runner.dockerfile,
        "env_vars": runner.env_vars,
        "extra_args": runner.extra_args,
        "ports": runner.ports,
        "preamble": runner.preamble,
        "run_as_root": runner.run_as_root,
        "shell": runner.shell,
        "volumes": runner.volumes,
        "working_dir": runner.working_dir,
    });

    digest(&canonical.to_string())[..RUNNER_HASH_WIDTH].to_owned()
}
