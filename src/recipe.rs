use crate::{failure::Failure, format, format::CodeStr, template::VariableSpec};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::PathBuf,
};

// The argument types a task may declare. The set is closed; the parser rejects anything else.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArgType {
    Str,
    Int,
    Float,
    Bool,
    Path,
    Datetime,
    Ip,
    Ipv4,
    Ipv6,
    Email,
    Hostname,
}

impl ArgType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "str" => Some(ArgType::Str),
            "int" => Some(ArgType::Int),
            "float" => Some(ArgType::Float),
            "bool" => Some(ArgType::Bool),
            "path" => Some(ArgType::Path),
            "datetime" => Some(ArgType::Datetime),
            "ip" => Some(ArgType::Ip),
            "ipv4" => Some(ArgType::Ipv4),
            "ipv6" => Some(ArgType::Ipv6),
            "email" => Some(ArgType::Email),
            "hostname" => Some(ArgType::Hostname),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArgType::Str => "str",
            ArgType::Int => "int",
            ArgType::Float => "float",
            ArgType::Bool => "bool",
            ArgType::Path => "path",
            ArgType::Datetime => "datetime",
            ArgType::Ip => "ip",
            ArgType::Ipv4 => "ipv4",
            ArgType::Ipv6 => "ipv6",
            ArgType::Email => "email",
            ArgType::Hostname => "hostname",
        }
    }

    // Convert a raw value into its canonical string form, or explain why it can't be done. The
    // canonical form is what gets bound, hashed, and substituted, so it must be deterministic.
    pub fn convert(self, raw: &str) -> Result<String, String> {
        match self {
            ArgType::Str | ArgType::Path => Ok(raw.to_owned()),
            ArgType::Int => raw
                .trim()
                .parse::<i64>()
                .map(|value| value.to_string())
                .map_err(|_| format!("{} is not an integer", raw.code_str())),
            ArgType::Float => raw
                .trim()
                .parse::<f64>()
                .map(|value| value.to_string())
                .map_err(|_| format!("{} is not a number", raw.code_str())),
            ArgType::Bool => match raw.trim().to_lowercase().as_str() {
                "true" | "yes" => Ok("true".to_owned()),
                "false" | "no" => Ok("false".to_owned()),
                _ => Err(format!("{} is not a Boolean", raw.code_str())),
            },
            ArgType::Datetime => {
                let trimmed = raw.trim();
                if chrono::DateTime::parse_from_rfc3339(trimmed).is_ok()
                    || chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").is_ok()
                    || chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok()
                {
                    Ok(trimmed.to_owned())
                } else {
                    Err(format!("{} is not a datetime", raw.code_str()))
                }
            }
            ArgType::Ip => raw
                .trim()
                .parse::<IpAddr>()
                .map(|value| value.to_string())
                .map_err(|_| format!("{} is not an IP address", raw.code_str())),
            ArgType::Ipv4 => raw
                .trim()
                .parse::<Ipv4Addr>()
                .map(|value| value.to_string())
                .map_err(|_| format!("{} is not an IPv4 address", raw.code_str())),
            ArgType::Ipv6 => raw
                .trim()
                .parse::<Ipv6Addr>()
                .map(|value| value.to_string())
                .map_err(|_| format!("{} is not an IPv6 address", raw.code_str())),
            ArgType::Email => {
                let trimmed = raw.trim();
                let mut parts = trimmed.splitn(2, '@');
                let local = parts.next().unwrap_or("");
                let domain = parts.next().unwrap_or("");
                if local.is_empty() || domain.is_empty() || domain.contains('@') {
                    Err(format!("{} is not an email address", raw.code_str()))
                } else {
                    Ok(trimmed.to_owned())
                }
            }
            ArgType::Hostname => {
                let trimmed = raw.trim();
                if is_hostname(trimmed) {
                    Ok(trimmed.to_owned())
                } else {
                    Err(format!("{} is not a hostname", raw.code_str()))
                }
            }
        }
    }
}

// RFC 1123 labels: alphanumeric and hyphens, no leading or trailing hyphen, 253 chars total.
fn is_hostname(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.len() > 253 {
        return false;
    }
    candidate.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

// A single argument declaration on a task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub arg_type: ArgType,
    pub default: Option<String>,
    pub exported: bool,
    pub choices: Vec<String>,
}

impl ArgSpec {
    // The canonical compact form, a fixed point of the compact-spec parser.
    pub fn canonical(&self) -> String {
        let mut spec = String::new();
        if self.exported {
            spec.push('$');
        }
        spec.push_str(&self.name);
        if self.arg_type != ArgType::Str {
            spec.push(':');
            spec.push_str(self.arg_type.name());
        }
        if let Some(default) = &self.default {
            spec.push('=');
            spec.push_str(default);
        }
        spec
    }
}

// The arguments attached to a single dependency entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DepArgs {
    None,
    Positional(Vec<String>),
    Named(Vec<(String, String)>),
}

// One entry of a task's `deps` list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DepSpec {
    pub task: String,
    pub args: DepArgs,
}

impl fmt::Display for DepSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.args {
            DepArgs::None => write!(f, "{}", self.task),
            DepArgs::Positional(values) => write!(f, "{}({})", self.task, values.join(", ")),
            DepArgs::Named(pairs) => {
                let rendered = pairs
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{}({})", self.task, rendered)
            }
        }
    }
}

// One entry of a task's `inputs` or `outputs` list. Anonymous entries are bare glob strings;
// named entries are `{name: glob}` mappings addressable from templates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoEntry {
    pub name: Option<String>,
    pub pattern: String,
}

impl IoEntry {
    pub fn anonymous(pattern: impl Into<String>) -> Self {
        IoEntry {
            name: None,
            pattern: pattern.into(),
        }
    }

    pub fn named(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        IoEntry {
            name: Some(name.into()),
            pattern: pattern.into(),
        }
    }
}

// This struct represents a task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Task {
    pub name: String,
    pub cmd: String,
    pub desc: String,
    pub private: bool,
    pub deps: Vec<DepSpec>,
    pub inputs: Vec<IoEntry>,
    pub outputs: Vec<IoEntry>,
    pub args: Vec<ArgSpec>,
    pub working_dir: String,
    pub run_in: String,
    pub pin_runner: bool,
    pub source_file: PathBuf,
}

impl Task {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Task {
            name: name.into(),
            cmd: cmd.into(),
            desc: String::new(),
            private: false,
            deps: vec![],
            inputs: vec![],
            outputs: vec![],
            args: vec![],
            working_dir: ".".to_owned(),
            run_in: String::new(),
            pin_runner: false,
            source_file: PathBuf::new(),
        }
    }

    pub fn arg_spec(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|spec| spec.name == name)
    }

    pub fn named_output(&self, name: &str) -> Option<&IoEntry> {
        self.outputs
            .iter()
            .find(|entry| entry.name.as_deref() == Some(name))
    }

    pub fn named_input(&self, name: &str) -> Option<&IoEntry> {
        self.inputs
            .iter()
            .find(|entry| entry.name.as_deref() == Some(name))
    }

    // The names of this task's named outputs, for diagnostics.
    pub fn named_output_names(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter_map(|entry| entry.name.clone())
            .collect()
    }

    pub fn dep_names(&self) -> Vec<String> {
        self.deps.iter().map(|dep| dep.task.clone()).collect()
    }
}

// Whether a runner executes commands through a local shell or inside a container.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunnerKind {
    Shell,
    Container,
}

// This struct represents a named execution environment. Exactly one of `shell` and `dockerfile`
// is non-empty; `kind` reports which.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Runner {
    pub name: String,

    // Shell fields
    pub shell: String,
    pub args: Vec<String>,
    pub preamble: String,

    // Container fields
    pub dockerfile: String,
    pub context: String,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub working_dir: String,
    pub run_as_root: bool,
}

impl Runner {
    pub fn shell(name: impl Into<String>, shell: impl Into<String>) -> Self {
        Runner {
            name: name.into(),
            shell: shell.into(),
            args: vec![],
            preamble: String::new(),
            dockerfile: String::new(),
            context: String::new(),
            volumes: vec![],
            ports: vec![],
            env_vars: BTreeMap::new(),
            extra_args: vec![],
            build_args: BTreeMap::new(),
            working_dir: String::new(),
            run_as_root: false,
        }
    }

    pub fn container(name: impl Into<String>, dockerfile: impl Into<String>) -> Self {
        Runner {
            name: name.into(),
            shell: String::new(),
            args: vec![],
            preamble: String::new(),
            dockerfile: dockerfile.into(),
            context: ".".to_owned(),
            volumes: vec![],
            ports: vec![],
            env_vars: BTreeMap::new(),
            extra_args: vec![],
            build_args: BTreeMap::new(),
            working_dir: String::new(),
            run_as_root: false,
        }
    }

    pub fn kind(&self) -> RunnerKind {
        if self.dockerfile.is_empty() {
            RunnerKind::Shell
        } else {
            RunnerKind::Container
        }
    }
}

// This struct represents a fully parsed, import-resolved recipe.
#[derive(Clone, Debug)]
pub struct Recipe {
    pub tasks: BTreeMap<String, Task>,
    pub runners: BTreeMap<String, Runner>,
    pub variables: Vec<(String, VariableSpec)>,
    pub default_runner: String,
    pub project_root: PathBuf,
    pub recipe_path: PathBuf,
    pub global_runner_override: String,
}

impl Recipe {
    pub fn empty(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let recipe_path = project_root.join("tasktree.yaml");
        Recipe {
            tasks: BTreeMap::new(),
            runners: BTreeMap::new(),
            variables: vec![],
            default_runner: String::new(),
            project_root,
            recipe_path,
            global_runner_override: String::new(),
        }
    }
}

// Check that a runner is exactly one of shell and container.
pub fn check_runner_variant(runner: &Runner) -> Result<(), Failure> {
    match (runner.shell.is_empty(), runner.dockerfile.is_empty()) {
        (false, true) | (true, false) => Ok(()),
        (true, true) => Err(Failure::User(
            format!(
                "Runner {} must specify either {} or {}.",
                runner.name.code_str(),
                "shell".code_str(),
                "dockerfile".code_str(),
            ),
            None,
        )),
        (false, false) => Err(Failure::User(
            format!(
                "Runner {} specifies both {} and {}; it must be one or the other.",
                runner.name.code_str(),
                "shell".code_str(),
                "dockerfile".code_str(),
            ),
            None,
        )),
    }
}

// Check that every dep refers to an existing task.
pub fn check_dep_references(recipe: &Recipe) -> Result<(), Failure> {
    let mut violations: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, task) in &recipe.tasks {
        for dep in &task.deps {
            if !recipe.tasks.contains_key(&dep.task) {
                violations
                    .entry(name.clone())
                    .or_default()
                    .push(dep.task.clone());
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Failure::User(
            format!(
                "The following tasks have invalid dependencies: {}.",
                format::name_list(
                    violations
                        .iter()
                        .map(|(task, deps)| {
                            format!(
                                "{} ({})",
                                task.code_str(),
                                format::name_list(
                                    deps.iter()
                                        .map(|dep| dep.code_str().to_string())
                                        .collect::<Vec<_>>()
                                        .as_ref(),
                                ),
                            )
                        })
                        .collect::<Vec<_>>()
                        .as_ref(),
                ),
            ),
            None,
        ))
    }
}

// Check that every `run_in` and the default runner refer to existing runners.
pub fn check_runner_references(recipe: &Recipe) -> Result<(), Failure> {
    if !recipe.default_runner.is_empty() && !recipe.runners.contains_key(&recipe.default_runner) {
        return Err(Failure::User(
            format!(
                "The default runner {} is not defined.",
                recipe.default_runner.code_str(),
            ),
            None,
        ));
    }

    for (name, task) in &recipe.tasks {
        if !task.run_in.is_empty() && !recipe.runners.contains_key(&task.run_in) {
            return Err(Failure::User(
                format!(
                    "Task {} runs in {}, which is not a defined runner.",
                    name.code_str(),
                    task.run_in.code_str(),
                ),
                None,
            ));
        }
    }

    Ok(())
}

// Check that arg names are unique per task and that named inputs/outputs are unique per field.
pub fn check_name_uniqueness(task: &Task) -> Result<(), Failure> {
    let mut arg_names = HashSet::new();
    for spec in &task.args {
        if !arg_names.insert(spec.name.as_str()) {
            return Err(Failure::User(
                format!(
                    "Task {} declares argument {} more than once.",
                    task.name.code_str(),
                    spec.name.code_str(),
                ),
                None,
            ));
        }
    }

    for (field, entries) in [("inputs", &task.inputs), ("outputs", &task.outputs)] {
        let mut io_names = HashSet::new();
        for entry in entries {
            if let Some(name) = &entry.name {
                if !io_names.insert(name.as_str()) {
                    return Err(Failure::User(
                        format!(
                            "Task {} declares the {} name {} more than once.",
                            task.name.code_str(),
                            field,
                            name.code_str(),
                        ),
                        None,
                    ));
                }
            }
        }
    }

    Ok(())
}
