use crate::{failure, failure::Failure, format::CodeStr, parser, recipe::Runner};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

// The project-level config file name, discovered by walking up from the current directory.
pub const PROJECT_CONFIG_FILE: &str = ".tasktree-config.yml";

// A config file may declare exactly one runner, named `default`, which backs the bottom of the
// runner-resolution chain.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    runners: Option<serde_yaml::Mapping>,
}

// Find the project config by walking up from `start_dir`.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    let mut candidate_dir = start_dir.to_owned();
    loop {
        let candidate = candidate_dir.join(PROJECT_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !candidate_dir.pop() {
            return None;
        }
    }
}

// The user-level config location.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tasktree/config.yml"))
}

// The machine-level config location.
pub fn machine_config_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("C:\\ProgramData\\tasktree\\config.yml")
    } else {
        PathBuf::from("/etc/tasktree/config.yml")
    }
}

// Parse a config file and return its default runner, if it declares one. A missing or empty
// file, or one without a `runners` section, is fine and contributes nothing. A `runners`
// section that declares anything other than exactly one runner named `default` is an error.
pub fn parse_config_file(path: &Path) -> Result<Option<Runner>, Failure> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Ok(None);
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }

    let raw: RawConfig = serde_yaml::from_str(&contents).map_err(failure::user(format!(
        "Unable to parse the config file {}.",
        path.to_string_lossy().code_str(),
    )))?;

    let Some(runners) = raw.runners else {
        return Ok(None);
    };

    let mut default = None;
    for (key, value) in &runners {
        let name = key.as_str().ok_or_else(|| {
            Failure::User(
                format!(
                    "A runner name in {} must be a string.",
                    path.to_string_lossy().code_str(),
                ),
                None,
            )
        })?;

        if name != "default" {
            return Err(Failure::User(
                format!(
                    "The config file {} may only declare a runner named {}, but it declares {}.",
                    path.to_string_lossy().code_str(),
                    "default".code_str(),
                    name.code_str(),
                ),
                None,
            ));
        }

        default = Some(parser::convert_runner("default", value).map_err(|error| {
            Failure::User(
                format!(
                    "The config file {} is invalid. Reason: {}",
                    path.to_string_lossy().code_str(),
                    error,
                ),
                None,
            )
        })?);
    }

    if default.is_none() {
        return Err(Failure::User(
            format!(
                "The {} section of config file {} must declare exactly one runner named {}.",
                "runners".code_str(),
                path.to_string_lossy().code_str(),
                "default".code_str(),
            ),
            None,
        ));
    }

    Ok(default)
}

// One level of the config chain: its default runner, or the reason it couldn't supply one. A
// broken config file is only fatal when the runner-resolution chain actually reaches it; until
// then it's a warning.
#[derive(Default)]
pub struct ConfigLevel {
    pub runner: Option<Runner>,
    pub error: Option<String>,
}

impl ConfigLevel {
    pub fn with(runner: Runner) -> Self {
        ConfigLevel {
            runner: Some(runner),
            error: None,
        }
    }

    fn from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return ConfigLevel::default();
        };
        match parse_config_file(&path) {
            Ok(runner) => ConfigLevel {
                runner,
                error: None,
            },
            Err(failure) => {
                let message = failure.to_string();
                warn!("{}", message);
                ConfigLevel {
                    runner: None,
                    error: Some(message),
                }
            }
        }
    }
}

// The three config-supplied defaults, in precedence order.
#[derive(Default)]
pub struct ConfigRunners {
    pub project: ConfigLevel,
    pub user: ConfigLevel,
    pub machine: ConfigLevel,
}

impl ConfigRunners {
    // Load all three levels. Only the project level's discovery depends on where we are.
    pub fn load(start_dir: &Path) -> Self {
        ConfigRunners {
            project: ConfigLevel::from_path(find_project_config(start_dir)),
            user: ConfigLevel::from_path(user_config_path()),
            machine: ConfigLevel::from_path(Some(machine_config_path())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{find_project_config, parse_config_file, PROJECT_CONFIG_FILE},
        recipe::RunnerKind,
    };
    use std::fs;

    #[test]
    fn missing_file_is_no_default() {
        let dir = tempfile::tempdir().unwrap();
        let result = parse_config_file(&dir.path().join(PROJECT_CONFIG_FILE)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn empty_file_is_no_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "\n").unwrap();
        assert!(parse_config_file(&path).unwrap().is_none());
    }

    #[test]
    fn file_without_runners_is_no_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "{}").unwrap();
        assert!(parse_config_file(&path).unwrap().is_none());
    }

    #[test]
    fn default_shell_runner_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(
            &path,
            "runners:\n  default:\n    shell: zsh\n    preamble: set -e\n",
        )
        .unwrap();
        let runner = parse_config_file(&path).unwrap().unwrap();
        assert_eq!(runner.name, "default");
        assert_eq!(runner.shell, "zsh");
        assert_eq!(runner.kind(), RunnerKind::Shell);
    }

    #[test]
    fn default_container_runner_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "runners:\n  default:\n    dockerfile: Dockerfile\n").unwrap();
        let runner = parse_config_file(&path).unwrap().unwrap();
        assert_eq!(runner.kind(), RunnerKind::Container);
    }

    #[test]
    fn extra_runner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(
            &path,
            "runners:\n  default:\n    shell: bash\n  other:\n    shell: sh\n",
        )
        .unwrap();
        let result = parse_config_file(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("other"));
    }

    #[test]
    fn runners_without_default_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "runners: {}\n").unwrap();
        assert!(parse_config_file(&path).is_err());
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "runners: [not a mapping").unwrap();
        assert!(parse_config_file(&path).is_err());
    }

    #[test]
    fn project_config_discovered_upward() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_CONFIG_FILE), "{}").unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        let found = find_project_config(&nested).unwrap();
        assert!(found.ends_with(PROJECT_CONFIG_FILE));
    }
}
