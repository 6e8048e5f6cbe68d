use crate::{failure, failure::Failure, format::CodeStr};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

// The name of the state file, relative to the project root.
pub const STATE_FILE: &str = ".tasktree-state";

// One recorded value for an effective input: a file modification time, or an opaque fingerprint
// for the reserved `_`-prefixed entries (runner hashes, image IDs, context markers).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InputStamp {
    Mtime(f64),
    Token(String),
}

// The persistent record of one task invocation's last successful run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskState {
    pub last_run: f64,

    #[serde(default)]
    pub input_state: BTreeMap<String, InputStamp>,
}

// The on-disk map from cache key to `TaskState`, stored as a single JSON file in the project
// root. Writes are whole-file replacements through a temporary file, so a torn write leaves
// either the old file or the new one; a corrupt file just means every task re-runs.
pub struct StateManager {
    state_path: PathBuf,
    state: BTreeMap<String, TaskState>,
}

impl StateManager {
    pub fn new(project_root: &Path) -> Self {
        StateManager {
            state_path: project_root.join(STATE_FILE),
            state: BTreeMap::new(),
        }
    }

    // Load the state file. A missing or unreadable file yields empty state; a corrupt file is
    // reported and likewise yields empty state.
    pub fn load(&mut self) {
        self.state = Self::read(&self.state_path);
    }

    fn read(state_path: &Path) -> BTreeMap<String, TaskState> {
        let Ok(data) = fs::read_to_string(state_path) else {
            return BTreeMap::new();
        };

        match serde_json::from_str(&data) {
            Ok(state) => state,
            Err(error) => {
                warn!(
                    "The state file {} is corrupt and will be ignored. Reason: {}",
                    state_path.to_string_lossy().code_str(),
                    error,
                );
                BTreeMap::new()
            }
        }
    }

    pub fn get(&self, cache_key: &str) -> Option<&TaskState> {
        self.state.get(cache_key)
    }

    pub fn set(&mut self, cache_key: impl Into<String>, state: TaskState) {
        self.state.insert(cache_key.into(), state);
    }

    // Remove entries whose task-hash prefix is not in the given set. The part of the cache key
    // before `__` is the task hash; keys without `__` are bare task hashes.
    pub fn prune(&mut self, valid_task_hashes: &std::collections::HashSet<String>) {
        self.state.retain(|cache_key, _| {
            let task_hash = cache_key.split("__").next().unwrap_or(cache_key);
            valid_task_hashes.contains(task_hash)
        });
    }

    pub fn clear(&mut self) {
        self.state.clear();
    }

    // Merge entries written by another process (a nested `tt` invocation) under our own. Keys we
    // wrote in memory win; everything else on disk survives.
    pub fn reload_and_merge(&mut self) {
        let on_disk = Self::read(&self.state_path);
        for (cache_key, state) in on_disk {
            self.state.entry(cache_key).or_insert(state);
        }
    }

    // Write the state atomically: serialize into a sibling temporary file, then rename it over
    // the state file.
    pub fn save(&self) -> Result<(), Failure> {
        let data = serde_json::to_string_pretty(&self.state).map_err(failure::system(format!(
            "Unable to serialize the state for {}.",
            self.state_path.to_string_lossy().code_str(),
        )))?;

        // The temporary file must live in the same directory as the target so the rename stays on
        // one filesystem.
        let parent = self.state_path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent).map_err(failure::system(
            format!(
                "Unable to create a temporary file next to {}.",
                self.state_path.to_string_lossy().code_str(),
            ),
        ))?;

        temp_file
            .write_all(data.as_bytes())
            .map_err(failure::system(format!(
                "Unable to write the state for {}.",
                self.state_path.to_string_lossy().code_str(),
            )))?;

        temp_file
            .persist(&self.state_path)
            .map_err(failure::system(format!(
                "Unable to replace the state file {}.",
                self.state_path.to_string_lossy().code_str(),
            )))?;

        Ok(())
    }

    // Delete the state file entirely. Reports whether a file was removed.
    pub fn remove_file(&mut self) -> Result<bool, Failure> {
        self.state.clear();
        if self.state_path.exists() {
            fs::remove_file(&self.state_path).map_err(failure::system(format!(
                "Unable to remove the state file {}.",
                self.state_path.to_string_lossy().code_str(),
            )))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }
}

#[cfg(test)]
mod tests {
    use crate::state::{InputStamp, StateManager, TaskState, STATE_FILE};
    use std::{collections::HashSet, fs};

    fn sample_state() -> TaskState {
        let mut state = TaskState {
            last_run: 1_700_000_000.25,
            input_state: std::collections::BTreeMap::new(),
        };
        state
            .input_state
            .insert("src/main.c".to_owned(), InputStamp::Mtime(1_699_999_999.5));
        state.input_state.insert(
            "_runner_hash_local".to_owned(),
            InputStamp::Token("0123456789abcdef".to_owned()),
        );
        state
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = StateManager::new(dir.path());
        manager.load();
        assert!(manager.get("abcd1234").is_none());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), "{ not json").unwrap();
        let mut manager = StateManager::new(dir.path());
        manager.load();
        assert!(manager.get("abcd1234").is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = StateManager::new(dir.path());
        manager.load();
        manager.set("abcd1234__9f8e7d6c", sample_state());
        manager.save().unwrap();

        let mut reloaded = StateManager::new(dir.path());
        reloaded.load();
        assert_eq!(reloaded.get("abcd1234__9f8e7d6c"), Some(&sample_state()));
    }

    #[test]
    fn prune_drops_unknown_task_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = StateManager::new(dir.path());
        manager.set("abcd1234", sample_state());
        manager.set("abcd1234__9f8e7d6c", sample_state());
        manager.set("dead0000", sample_state());

        let valid = HashSet::from(["abcd1234".to_owned()]);
        manager.prune(&valid);

        assert!(manager.get("abcd1234").is_some());
        assert!(manager.get("abcd1234__9f8e7d6c").is_some());
        assert!(manager.get("dead0000").is_none());
    }

    #[test]
    fn prune_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = StateManager::new(dir.path());
        manager.set("abcd1234", sample_state());
        manager.set("dead0000", sample_state());

        let valid = HashSet::from(["abcd1234".to_owned()]);
        manager.prune(&valid);
        let after_first = manager.get("abcd1234").cloned();
        manager.prune(&valid);
        assert_eq!(manager.get("abcd1234").cloned(), after_first);
        assert!(manager.get("dead0000").is_none());
    }

    #[test]
    fn reload_and_merge_keeps_both_sides() {
        let dir = tempfile::tempdir().unwrap();

        // A "child" process writes one entry.
        let mut child = StateManager::new(dir.path());
        child.set("child000", sample_state());
        child.save().unwrap();

        // The "parent" has its own entry in memory and merges before saving.
        let mut parent = StateManager::new(dir.path());
        parent.set("parent00", sample_state());
        parent.reload_and_merge();
        parent.save().unwrap();

        let mut reloaded = StateManager::new(dir.path());
        reloaded.load();
        assert!(reloaded.get("child000").is_some());
        assert!(reloaded.get("parent00").is_some());
    }

    #[test]
    fn reload_and_merge_prefers_memory() {
        let dir = tempfile::tempdir().unwrap();

        let mut stale = StateManager::new(dir.path());
        let mut old = sample_state();
        old.last_run = 1.0;
        stale.set("abcd1234", old);
        stale.save().unwrap();

        let mut current = StateManager::new(dir.path());
        current.set("abcd1234", sample_state());
        current.reload_and_merge();
        assert_eq!(
            current.get("abcd1234").unwrap().last_run,
            sample_state().last_run,
        );
    }

    #[test]
    fn remove_file_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = StateManager::new(dir.path());
        assert!(!manager.remove_file().unwrap());
        manager.set("abcd1234", sample_state());
        manager.save().unwrap();
        assert!(manager.remove_file().unwrap());
        assert!(!manager.path().exists());
    }
}
