use crate::{
    failure::Failure,
    format::CodeStr,
    graph::EffectiveInput,
    state::{InputStamp, TaskState},
};
use std::{fmt, path::Path, time::UNIX_EPOCH};

// Why a task will (or won't) run. The variants are listed in decision order; the first matching
// reason wins.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunReason {
    Forced,
    NoOutputs,
    DependencyTriggered,
    NeverRun,
    RunnerChanged,
    InputsChanged,
    OutputsMissing,
    Fresh,
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let rendered = match self {
            RunReason::Forced => "forced",
            RunReason::NoOutputs => "no_outputs",
            RunReason::DependencyTriggered => "dependency_triggered",
            RunReason::NeverRun => "never_run",
            RunReason::RunnerChanged => "runner_changed",
            RunReason::InputsChanged => "inputs_changed",
            RunReason::OutputsMissing => "outputs_missing",
            RunReason::Fresh => "fresh",
        };
        write!(f, "{}", rendered)
    }
}

// The staleness verdict for one node of the plan.
#[derive(Clone, Debug)]
pub struct TaskStatus {
    pub will_run: bool,
    pub reason: RunReason,
    pub changed_files: Vec<String>,
    pub last_run: Option<f64>,
}

impl TaskStatus {
    fn run(reason: RunReason) -> Self {
        TaskStatus {
            will_run: true,
            reason,
            changed_files: vec![],
            last_run: None,
        }
    }
}

// The modification time of a file as fractional seconds since the epoch, or `None` when the file
// is missing or unreadable.
pub fn file_mtime(path: &Path) -> Option<f64> {
    let metadata = path.metadata().ok()?;
    let modified = metadata.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_secs_f64())
}

// Expand project-root-relative glob patterns into the project-root-relative paths of the files
// they currently match. Matching is filesystem-order-independent: results are sorted.
pub fn expand_globs(project_root: &Path, patterns: &[String]) -> Result<Vec<String>, Failure> {
    let mut files = vec![];

    for pattern in patterns {
        let absolute = project_root.join(pattern);
        let matches = glob::glob(&absolute.to_string_lossy()).map_err(|error| {
            Failure::User(
                format!(
                    "The glob pattern {} is invalid. Reason: {}",
                    pattern.code_str(),
                    error,
                ),
                None,
            )
        })?;

        for entry in matches.flatten() {
            if entry.is_file() {
                let relative = entry
                    .strip_prefix(project_root)
                    .map(|path| path.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| entry.to_string_lossy().into_owned());
                files.push(relative);
            }
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

// Decide whether a task needs to run. `runner_changed` is only consulted once the cheaper
// reasons have been ruled out, because for container runners it may have to build an image.
pub fn check_status(
    project_root: &Path,
    force: bool,
    effective_inputs: &[EffectiveInput],
    output_patterns: &[String],
    dependency_triggered: bool,
    cached: Option<&TaskState>,
    runner_changed: impl FnOnce() -> Result<bool, Failure>,
) -> Result<TaskStatus, Failure> {
    if force {
        return Ok(TaskStatus::run(RunReason::Forced));
    }

    // A task with nothing to compare against always runs.
    if effective_inputs.is_empty() && output_patterns.is_empty() {
        return Ok(TaskStatus::run(RunReason::NoOutputs));
    }

    if dependency_triggered {
        return Ok(TaskStatus::run(RunReason::DependencyTriggered));
    }

    let Some(cached) = cached else {
        return Ok(TaskStatus::run(RunReason::NeverRun));
    };
    let last_run = Some(cached.last_run);

    if runner_changed()? {
        return Ok(TaskStatus {
            will_run: true,
            reason: RunReason::RunnerChanged,
            changed_files: vec![],
            last_run,
        });
    }

    // Inputs: a matched file that is absent from the cached record, or whose modification time
    // is strictly newer than the recorded one, makes the task stale. Rolling a file's time
    // backwards does not.
    let mut changed_files = vec![];
    for input in effective_inputs {
        match input {
            EffectiveInput::Glob(pattern) => {
                let files = expand_globs(project_root, std::slice::from_ref(pattern))?;
                for file in files {
                    let Some(current) = file_mtime(&project_root.join(&file)) else {
                        continue;
                    };
                    match cached.input_state.get(&file) {
                        Some(InputStamp::Mtime(recorded)) if current <= *recorded => {}
                        _ => changed_files.push(file),
                    }
                }
            }
            EffectiveInput::Token(token) => {
                if !cached.input_state.contains_key(token) {
                    changed_files.push(token.clone());
                }
            }
        }
    }
    if !changed_files.is_empty() {
        changed_files.sort();
        changed_files.dedup();
        return Ok(TaskStatus {
            will_run: true,
            reason: RunReason::InputsChanged,
            changed_files,
            last_run,
        });
    }

    // Outputs: every declared output pattern must match something.
    let mut missing_outputs = vec![];
    for pattern in output_patterns {
        if expand_globs(project_root, std::slice::from_ref(pattern))?.is_empty() {
            missing_outputs.push(pattern.clone());
        }
    }
    if !missing_outputs.is_empty() {
        return Ok(TaskStatus {
            will_run: true,
            reason: RunReason::OutputsMissing,
            changed_files: missing_outputs,
            last_run,
        });
    }

    Ok(TaskStatus {
        will_run: false,
        reason: RunReason::Fresh,
        changed_files: vec![],
        last_run,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        graph::EffectiveInput,
        state::{InputStamp, TaskState},
        status::{check_status, expand_globs, file_mtime, RunReason},
    };
    use std::fs;

    fn glob_input(pattern: &str) -> Vec<EffectiveInput> {
        vec![EffectiveInput::Glob(pattern.to_owned())]
    }

    fn cached_with(entries: &[(&str, InputStamp)]) -> TaskState {
        TaskState {
            last_run: 1_700_000_000.0,
            input_state: entries
                .iter()
                .map(|(path, stamp)| ((*path).to_owned(), stamp.clone()))
                .collect(),
        }
    }

    fn never_changed_runner() -> impl FnOnce() -> Result<bool, crate::failure::Failure> {
        || Ok(false)
    }

    #[test]
    fn expand_globs_matches_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.c"), "").unwrap();
        fs::write(dir.path().join("src/b.c"), "").unwrap();
        fs::write(dir.path().join("src/c.h"), "").unwrap();

        let files = expand_globs(dir.path(), &["src/*.c".to_owned()]).unwrap();
        assert_eq!(files, vec!["src/a.c".to_owned(), "src/b.c".to_owned()]);
    }

    #[test]
    fn forced_wins_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        let status = check_status(
            dir.path(),
            true,
            &[],
            &[],
            true,
            None,
            never_changed_runner(),
        )
        .unwrap();
        assert!(status.will_run);
        assert_eq!(status.reason, RunReason::Forced);
    }

    #[test]
    fn no_inputs_or_outputs_always_runs() {
        let dir = tempfile::tempdir().unwrap();
        let status = check_status(
            dir.path(),
            false,
            &[],
            &[],
            false,
            None,
            never_changed_runner(),
        )
        .unwrap();
        assert!(status.will_run);
        assert_eq!(status.reason, RunReason::NoOutputs);
    }

    #[test]
    fn dependency_triggering_beats_cache_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let status = check_status(
            dir.path(),
            false,
            &glob_input("src/*.c"),
            &[],
            true,
            None,
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::DependencyTriggered);
    }

    #[test]
    fn missing_cache_entry_means_never_run() {
        let dir = tempfile::tempdir().unwrap();
        let status = check_status(
            dir.path(),
            false,
            &glob_input("src/*.c"),
            &[],
            false,
            None,
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::NeverRun);
    }

    #[test]
    fn runner_change_beats_input_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let cached = cached_with(&[]);
        let status = check_status(
            dir.path(),
            false,
            &glob_input("src/*.c"),
            &[],
            false,
            Some(&cached),
            || Ok(true),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::RunnerChanged);
        assert_eq!(status.last_run, Some(1_700_000_000.0));
    }

    #[test]
    fn new_file_is_a_changed_input() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("source.txt"), "data").unwrap();
        let cached = cached_with(&[]);
        let status = check_status(
            dir.path(),
            false,
            &glob_input("source.txt"),
            &[],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::InputsChanged);
        assert_eq!(status.changed_files, vec!["source.txt".to_owned()]);
    }

    #[test]
    fn newer_mtime_is_a_changed_input() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("source.txt"), "data").unwrap();
        let actual = file_mtime(&dir.path().join("source.txt")).unwrap();
        let cached = cached_with(&[("source.txt", InputStamp::Mtime(actual - 10.0))]);
        let status = check_status(
            dir.path(),
            false,
            &glob_input("source.txt"),
            &[],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::InputsChanged);
    }

    #[test]
    fn older_mtime_does_not_trigger() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("source.txt"), "data").unwrap();
        let actual = file_mtime(&dir.path().join("source.txt")).unwrap();
        let cached = cached_with(&[("source.txt", InputStamp::Mtime(actual + 10.0))]);
        let status = check_status(
            dir.path(),
            false,
            &glob_input("source.txt"),
            &[],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert!(!status.will_run);
        assert_eq!(status.reason, RunReason::Fresh);
    }

    #[test]
    fn unseen_token_is_a_changed_input() {
        let dir = tempfile::tempdir().unwrap();
        let cached = cached_with(&[]);
        let status = check_status(
            dir.path(),
            false,
            &[EffectiveInput::Token("_docker_context_docker".to_owned())],
            &[],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::InputsChanged);
        assert_eq!(
            status.changed_files,
            vec!["_docker_context_docker".to_owned()],
        );
    }

    #[test]
    fn recorded_token_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let cached = cached_with(&[(
            "_docker_context_docker",
            InputStamp::Token("_docker_context_docker".to_owned()),
        )]);
        let status = check_status(
            dir.path(),
            false,
            &[EffectiveInput::Token("_docker_context_docker".to_owned())],
            &[],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::Fresh);
    }

    #[test]
    fn missing_output_triggers_rerun() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("source.txt"), "data").unwrap();
        let actual = file_mtime(&dir.path().join("source.txt")).unwrap();
        let cached = cached_with(&[("source.txt", InputStamp::Mtime(actual))]);
        let status = check_status(
            dir.path(),
            false,
            &glob_input("source.txt"),
            &["out.txt".to_owned()],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert_eq!(status.reason, RunReason::OutputsMissing);
        assert_eq!(status.changed_files, vec!["out.txt".to_owned()]);
    }

    #[test]
    fn satisfied_task_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("source.txt"), "data").unwrap();
        fs::write(dir.path().join("out.txt"), "result").unwrap();
        let actual = file_mtime(&dir.path().join("source.txt")).unwrap();
        let cached = cached_with(&[("source.txt", InputStamp::Mtime(actual))]);
        let status = check_status(
            dir.path(),
            false,
            &glob_input("source.txt"),
            &["out.txt".to_owned()],
            false,
            Some(&cached),
            never_changed_runner(),
        )
        .unwrap();
        assert!(!status.will_run);
        assert_eq!(status.reason, RunReason::Fresh);
    }

    #[test]
    fn status_display_names() {
        assert_eq!(RunReason::Fresh.to_string(), "fresh");
        assert_eq!(RunReason::NoOutputs.to_string(), "no_outputs");
        assert_eq!(
            RunReason::DependencyTriggered.to_string(),
            "dependency_triggered",
        );
    }
}
