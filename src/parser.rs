use crate::{
    failure,
    failure::Failure,
    format::CodeStr,
    recipe::{
        check_dep_references, check_name_uniqueness, check_runner_references,
        check_runner_variant, ArgSpec, ArgType, DepArgs, DepSpec, IoEntry, Recipe, Runner, Task,
    },
    template,
    template::VariableSpec,
};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

// Recipe file names, in discovery order.
pub const RECIPE_FILE_NAMES: &[&str] = &["tasktree.yaml", "tt.yaml"];

// The raw, serde-level shape of a recipe file. Everything here is normalized into the types in
// `recipe.rs` before anything else sees it.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecipeFile {
    #[serde(default)]
    imports: Vec<RawImport>,

    #[serde(default)]
    variables: serde_yaml::Mapping,

    #[serde(default)]
    runners: serde_yaml::Mapping,

    #[serde(default)]
    tasks: BTreeMap<String, RawTask>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImport {
    file: String,

    #[serde(rename = "as")]
    namespace: String,

    #[serde(default)]
    run_in: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    cmd: String,

    #[serde(default)]
    desc: String,

    #[serde(default)]
    private: bool,

    #[serde(default)]
    deps: Vec<RawDep>,

    #[serde(default)]
    inputs: Vec<RawIoEntry>,

    #[serde(default)]
    outputs: Vec<RawIoEntry>,

    #[serde(default)]
    args: Vec<RawArgSpec>,

    #[serde(default)]
    working_dir: Option<String>,

    #[serde(default)]
    run_in: String,

    #[serde(default)]
    pin_runner: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDep {
    Bare(String),
    WithArgs(BTreeMap<String, RawDepArgs>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDepArgs {
    Positional(Vec<serde_yaml::Value>),
    Named(serde_yaml::Mapping),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIoEntry {
    Anonymous(String),
    Named(BTreeMap<String, String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArgSpec {
    Compact(String),
    Full(BTreeMap<String, RawArgSpecBody>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawArgSpecBody {
    #[serde(rename = "type", default)]
    arg_type: Option<String>,

    #[serde(default)]
    default: Option<serde_yaml::Value>,

    #[serde(default)]
    exported: bool,

    #[serde(default)]
    choices: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRunner {
    #[serde(default)]
    shell: String,

    #[serde(default)]
    preamble: String,

    #[serde(default)]
    dockerfile: String,

    #[serde(default)]
    context: Option<String>,

    #[serde(default)]
    volumes: Vec<String>,

    #[serde(default)]
    ports: Vec<String>,

    #[serde(default)]
    env_vars: BTreeMap<String, String>,

    #[serde(default)]
    extra_args: Vec<String>,

    // A sequence of shell flags for shell runners, or a mapping of build args for container
    // runners; disambiguated once the variant is known.
    #[serde(default)]
    args: Option<serde_yaml::Value>,

    #[serde(default)]
    working_dir: String,

    #[serde(default)]
    run_as_root: bool,
}

// Render a YAML scalar as the string it would have been written as.
fn scalar_to_string(value: &serde_yaml::Value, context: &str) -> Result<String, Failure> {
    match value {
        serde_yaml::Value::String(text) => Ok(text.clone()),
        serde_yaml::Value::Bool(flag) => Ok(flag.to_string()),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        _ => Err(Failure::User(
            format!("Expected a scalar value in {}.", context),
            None,
        )),
    }
}

// Find the recipe file by walking up from `start_dir`.
pub fn find_recipe_file(start_dir: &Path) -> Option<PathBuf> {
    let mut candidate_dir = start_dir.to_owned();
    loop {
        for name in RECIPE_FILE_NAMES {
            let candidate = candidate_dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if !candidate_dir.pop() {
            return None;
        }
    }
}

// Parse the compact argument spec form: `name[:type][=default]`, with a leading `$` marking the
// argument as exported.
pub fn parse_arg_spec(spec: &str) -> Result<ArgSpec, Failure> {
    let (exported, rest) = match spec.strip_prefix('$') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };

    let (name_type, default) = match rest.split_once('=') {
        Some((name_type, default)) => (name_type, Some(default.to_owned())),
        None => (rest, None),
    };

    let (name, type_name) = match name_type.split_once(':') {
        Some((name, type_name)) => (name, type_name),
        None => (name_type, "str"),
    };

    if name.is_empty() {
        return Err(Failure::User(
            format!("The argument spec {} has no name.", spec.code_str()),
            None,
        ));
    }

    let arg_type = ArgType::from_name(type_name).ok_or_else(|| {
        Failure::User(
            format!(
                "The argument spec {} has unknown type {}.",
                spec.code_str(),
                type_name.code_str(),
            ),
            None,
        )
    })?;

    // Type-check the default and store its canonical form.
    let default = match default {
        Some(raw) => Some(arg_type.convert(&raw).map_err(|reason| {
            Failure::User(
                format!(
                    "The default for argument {} is invalid: {}.",
                    name.code_str(),
                    reason,
                ),
                None,
            )
        })?),
        None => None,
    };

    Ok(ArgSpec {
        name: name.to_owned(),
        arg_type,
        default,
        exported,
        choices: vec![],
    })
}

fn convert_arg_spec(raw: &RawArgSpec, task_name: &str) -> Result<ArgSpec, Failure> {
    match raw {
        RawArgSpec::Compact(spec) => parse_arg_spec(spec),
        RawArgSpec::Full(mapping) => {
            if mapping.len() != 1 {
                return Err(Failure::User(
                    format!(
                        "An argument of task {} must be a single {} mapping.",
                        task_name.code_str(),
                        "name: {...}".code_str(),
                    ),
                    None,
                ));
            }

            // The `unwrap` is safe because the mapping was just checked to have one entry.
            let (name, body) = mapping.iter().next().unwrap();
            let type_name = body.arg_type.as_deref().unwrap_or("str");
            let arg_type = ArgType::from_name(type_name).ok_or_else(|| {
                Failure::User(
                    format!(
                        "Argument {} of task {} has unknown type {}.",
                        name.code_str(),
                        task_name.code_str(),
                        type_name.code_str(),
                    ),
                    None,
                )
            })?;

            let default = match &body.default {
                Some(value) => {
                    let raw_default = scalar_to_string(
                        value,
                        &format!("the default for argument {}", name.code_str()),
                    )?;
                    Some(arg_type.convert(&raw_default).map_err(|reason| {
                        Failure::User(
                            format!(
                                "The default for argument {} of task {} is invalid: {}.",
                                name.code_str(),
                                task_name.code_str(),
                                reason,
                            ),
                            None,
                        )
                    })?)
                }
                None => None,
            };

            Ok(ArgSpec {
                name: name.clone(),
                arg_type,
                default,
                exported: body.exported,
                choices: body.choices.clone(),
            })
        }
    }
}

fn convert_io_entries(raw: &[RawIoEntry], task_name: &str, field: &str) -> Result<Vec<IoEntry>, Failure> {
    raw.iter()
        .map(|entry| match entry {
            RawIoEntry::Anonymous(pattern) => Ok(IoEntry::anonymous(pattern.clone())),
            RawIoEntry::Named(mapping) => {
                if mapping.len() != 1 {
                    return Err(Failure::User(
                        format!(
                            "A named {} entry of task {} must be a single {} mapping.",
                            field,
                            task_name.code_str(),
                            "name: glob".code_str(),
                        ),
                        None,
                    ));
                }
                // The `unwrap` is safe because the mapping was just checked to have one entry.
                let (name, pattern) = mapping.iter().next().unwrap();
                Ok(IoEntry::named(name.clone(), pattern.clone()))
            }
        })
        .collect()
}

fn convert_deps(raw: &[RawDep], task_name: &str) -> Result<Vec<DepSpec>, Failure> {
    raw.iter()
        .map(|dep| match dep {
            RawDep::Bare(name) => Ok(DepSpec {
                task: name.clone(),
                args: DepArgs::None,
            }),
            RawDep::WithArgs(mapping) => {
                if mapping.len() != 1 {
                    return Err(Failure::User(
                        format!(
                            "A dependency of task {} must be a task name or a single {} mapping.",
                            task_name.code_str(),
                            "task: args".code_str(),
                        ),
                        None,
                    ));
                }

                // The `unwrap` is safe because the mapping was just checked to have one entry.
                let (name, args) = mapping.iter().next().unwrap();
                let args = match args {
                    RawDepArgs::Positional(values) => DepArgs::Positional(
                        values
                            .iter()
                            .map(|value| {
                                scalar_to_string(
                                    value,
                                    &format!("the arguments for dependency {}", name.code_str()),
                                )
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    RawDepArgs::Named(mapping) => DepArgs::Named(
                        mapping
                            .iter()
                            .map(|(key, value)| {
                                let key = scalar_to_string(
                                    key,
                                    &format!("the arguments for dependency {}", name.code_str()),
                                )?;
                                let value = scalar_to_string(
                                    value,
                                    &format!("the arguments for dependency {}", name.code_str()),
                                )?;
                                Ok((key, value))
                            })
                            .collect::<Result<Vec<_>, Failure>>()?,
                    ),
                };

                Ok(DepSpec {
                    task: name.clone(),
                    args,
                })
            }
        })
        .collect()
}

fn convert_variable(name: &str, value: &serde_yaml::Value) -> Result<VariableSpec, Failure> {
    match value {
        serde_yaml::Value::String(text) => Ok(VariableSpec::Literal(text.clone())),
        serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_) => Ok(VariableSpec::Literal(
            scalar_to_string(value, &format!("variable {}", name.code_str()))?,
        )),
        serde_yaml::Value::Mapping(mapping) => {
            let get = |key: &str| -> Option<&serde_yaml::Value> {
                mapping.get(&serde_yaml::Value::String(key.to_owned()))
            };

            let known_keys = mapping
                .iter()
                .filter_map(|(key, _)| key.as_str())
                .all(|key| matches!(key, "env" | "eval" | "read" | "default"));
            if !known_keys {
                return Err(Failure::User(
                    format!(
                        "Variable {} has an unrecognized delayed form; expected {}, {}, or {}.",
                        name.code_str(),
                        "env:".code_str(),
                        "eval:".code_str(),
                        "read:".code_str(),
                    ),
                    None,
                ));
            }

            if let Some(var) = get("env") {
                let var = scalar_to_string(var, &format!("variable {}", name.code_str()))?;
                let default = match get("default") {
                    Some(value) => Some(scalar_to_string(
                        value,
                        &format!("variable {}", name.code_str()),
                    )?),
                    None => None,
                };
                Ok(VariableSpec::Env { var, default })
            } else if let Some(command) = get("eval") {
                Ok(VariableSpec::Eval(scalar_to_string(
                    command,
                    &format!("variable {}", name.code_str()),
                )?))
            } else if let Some(path) = get("read") {
                Ok(VariableSpec::Read(PathBuf::from(scalar_to_string(
                    path,
                    &format!("variable {}", name.code_str()),
                )?)))
            } else {
                Err(Failure::User(
                    format!(
                        "Variable {} has a mapping value with none of {}, {}, or {}.",
                        name.code_str(),
                        "env:".code_str(),
                        "eval:".code_str(),
                        "read:".code_str(),
                    ),
                    None,
                ))
            }
        }
        _ => Err(Failure::User(
            format!("Variable {} must be a string or a delayed form.", name.code_str()),
            None,
        )),
    }
}

pub(crate) fn convert_runner(name: &str, value: &serde_yaml::Value) -> Result<Runner, Failure> {
    let raw: RawRunner = serde_yaml::from_value(value.clone()).map_err(failure::user(format!(
        "Unable to parse runner {}.",
        name.code_str(),
    )))?;

    let mut runner = Runner {
        name: name.to_owned(),
        shell: raw.shell,
        args: vec![],
        preamble: raw.preamble,
        dockerfile: raw.dockerfile,
        context: raw.context.unwrap_or_else(|| ".".to_owned()),
        volumes: raw.volumes,
        ports: raw.ports,
        env_vars: raw.env_vars,
        extra_args: raw.extra_args,
        build_args: BTreeMap::new(),
        working_dir: raw.working_dir,
        run_as_root: raw.run_as_root,
    };

    check_runner_variant(&runner)?;

    // `args` means shell flags for shell runners and build args for container runners.
    match raw.args {
        None => {}
        Some(serde_yaml::Value::Sequence(values)) if runner.dockerfile.is_empty() => {
            runner.args = values
                .iter()
                .map(|value| {
                    scalar_to_string(value, &format!("the args of runner {}", name.code_str()))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        Some(serde_yaml::Value::String(value)) if runner.dockerfile.is_empty() => {
            runner.args = vec![value];
        }
        Some(serde_yaml::Value::Mapping(mapping)) if !runner.dockerfile.is_empty() => {
            for (key, value) in &mapping {
                let key = scalar_to_string(
                    key,
                    &format!("the build args of runner {}", name.code_str()),
                )?;
                let value = scalar_to_string(
                    value,
                    &format!("the build args of runner {}", name.code_str()),
                )?;
                runner.build_args.insert(key, value);
            }
        }
        Some(_) => {
            return Err(Failure::User(
                format!(
                    "The {} of runner {} must be a list of shell flags for shell runners or a \
                     mapping of build args for container runners.",
                    "args".code_str(),
                    name.code_str(),
                ),
                None,
            ));
        }
    }

    Ok(runner)
}

// Apply import namespacing to a reference: bare names always get the prefix; dotted names get it
// only when their first segment is one of the current file's own import namespaces.
fn namespace_reference(
    reference: &str,
    namespace: &str,
    local_namespaces: &HashSet<String>,
) -> String {
    if reference.is_empty() {
        return String::new();
    }

    match reference.split('.').next() {
        Some(root) if reference.contains('.') => {
            if local_namespaces.contains(root) {
                format!("{}.{}", namespace, reference)
            } else {
                reference.to_owned()
            }
        }
        _ => format!("{}.{}", namespace, reference),
    }
}

// Everything a single file (plus its transitive imports) contributes to the recipe.
#[derive(Default)]
struct ParsedParts {
    tasks: BTreeMap<String, Task>,
    runners: BTreeMap<String, Runner>,
    variables: Vec<(String, VariableSpec)>,
    default_runner: String,
}

// Parse a recipe file and everything it imports.
pub fn parse_recipe(recipe_path: &Path) -> Result<Recipe, Failure> {
    let recipe_path = recipe_path
        .canonicalize()
        .map_err(failure::user(format!(
            "Unable to locate the recipe file {}.",
            recipe_path.to_string_lossy().code_str(),
        )))?;
    let project_root = recipe_path
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut parts = ParsedParts::default();
    let mut import_stack = vec![];
    parse_file(
        &recipe_path,
        None,
        &project_root,
        &mut import_stack,
        &mut parts,
    )?;

    let recipe = Recipe {
        tasks: parts.tasks,
        runners: parts.runners,
        variables: parts.variables,
        default_runner: parts.default_runner,
        project_root,
        recipe_path,
        global_runner_override: String::new(),
    };

    // Whole-recipe invariants, now that imports are resolved.
    for runner in recipe.runners.values() {
        check_runner_variant(runner)?;
    }
    check_dep_references(&recipe)?;
    check_runner_references(&recipe)?;
    template::check_variable_graph(&recipe.variables)?;

    Ok(recipe)
}

#[allow(clippy::too_many_lines)]
fn parse_file(
    file_path: &Path,
    namespace: Option<&str>,
    project_root: &Path,
    import_stack: &mut Vec<PathBuf>,
    parts: &mut ParsedParts,
) -> Result<(), Failure> {
    // Import cycle detection.
    if import_stack.iter().any(|entry| entry == file_path) {
        let mut chain = import_stack
            .iter()
            .map(|entry| entry.to_string_lossy().code_str().to_string())
            .collect::<Vec<_>>();
        chain.push(file_path.to_string_lossy().code_str().to_string());
        return Err(Failure::User(
            format!("The imports are circular: {}.", chain.join(" \u{2192} ")),
            None,
        ));
    }
    import_stack.push(file_path.to_owned());

    let data = fs::read_to_string(file_path).map_err(failure::user(format!(
        "Unable to read file {}.",
        file_path.to_string_lossy().code_str(),
    )))?;
    let raw: RawRecipeFile = serde_yaml::from_str(&data).map_err(failure::user(format!(
        "Unable to parse file {}.",
        file_path.to_string_lossy().code_str(),
    )))?;

    let file_dir = file_path
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(|| PathBuf::from("."));

    // Default working directory: the defining file's directory, relative to the project root.
    let default_working_dir = file_dir
        .strip_prefix(project_root)
        .ok()
        .filter(|relative| !relative.as_os_str().is_empty())
        .map_or_else(|| ".".to_owned(), |relative| relative.to_string_lossy().into_owned());

    // Process imports first so dependency rewriting can recognize their namespaces.
    let mut local_namespaces = HashSet::new();
    for import in &raw.imports {
        if import.namespace.is_empty() || import.namespace.contains('.') {
            return Err(Failure::User(
                format!(
                    "The import of {} in {} must be bound with a single-segment {} name.",
                    import.file.code_str(),
                    file_path.to_string_lossy().code_str(),
                    "as".code_str(),
                ),
                None,
            ));
        }
        local_namespaces.insert(import.namespace.clone());
    }

    let rewrite = |reference: &str| -> String {
        match namespace {
            Some(namespace) => namespace_reference(reference, namespace, &local_namespaces),
            None => reference.to_owned(),
        }
    };

    for import in &raw.imports {
        let child_namespace = match namespace {
            Some(parent) => format!("{}.{}", parent, import.namespace),
            None => import.namespace.clone(),
        };

        let child_path = file_dir.join(&import.file);
        let child_path = child_path.canonicalize().map_err(failure::user(format!(
            "Unable to locate the import {} in {}.",
            import.file.code_str(),
            file_path.to_string_lossy().code_str(),
        )))?;

        let mut child_parts = ParsedParts::default();
        parse_file(
            &child_path,
            Some(&child_namespace),
            project_root,
            import_stack,
            &mut child_parts,
        )?;

        // The import entry's own `run_in` is a reference in this file's namespace context.
        let import_run_in = rewrite(&import.run_in);
        for task in child_parts.tasks.values_mut() {
            if !import_run_in.is_empty() && task.run_in.is_empty() && !task.pin_runner {
                task.run_in = import_run_in.clone();
            }
        }

        parts.tasks.extend(child_parts.tasks);
        parts.runners.extend(child_parts.runners);
        parts.variables.extend(child_parts.variables);
    }

    // Variables, namespaced and with their own `var.*` references rewritten.
    for (key, value) in &raw.variables {
        let local_name = key.as_str().ok_or_else(|| {
            Failure::User(
                format!(
                    "A variable name in {} must be a string.",
                    file_path.to_string_lossy().code_str(),
                ),
                None,
            )
        })?;

        let mut spec = convert_variable(local_name, value)?;
        if namespace.is_some() {
            spec = match spec {
                VariableSpec::Literal(text) => {
                    VariableSpec::Literal(template::rewrite_namespaced_refs(&text, rewrite)?)
                }
                VariableSpec::Env { var, default } => VariableSpec::Env {
                    var,
                    default: match default {
                        Some(text) => Some(template::rewrite_namespaced_refs(&text, rewrite)?),
                        None => None,
                    },
                },
                VariableSpec::Eval(command) => {
                    VariableSpec::Eval(template::rewrite_namespaced_refs(&command, rewrite)?)
                }
                VariableSpec::Read(path) => VariableSpec::Read(path),
            };
        }

        let full_name = match namespace {
            Some(namespace) => format!("{}.{}", namespace, local_name),
            None => local_name.to_owned(),
        };
        parts.variables.push((full_name, spec));
    }

    // Runners. The `default` key inside `runners` names the default runner; it only has effect
    // in the entry file.
    for (key, value) in &raw.runners {
        let local_name = key.as_str().ok_or_else(|| {
            Failure::User(
                format!(
                    "A runner name in {} must be a string.",
                    file_path.to_string_lossy().code_str(),
                ),
                None,
            )
        })?;

        if local_name == "default" {
            let default_name =
                scalar_to_string(value, &format!("the {} runner entry", "default".code_str()))?;
            if namespace.is_none() {
                parts.default_runner = default_name;
            } else {
                debug!(
                    "Ignoring the default runner declared by imported file {}.",
                    file_path.to_string_lossy().code_str(),
                );
            }
            continue;
        }

        let runner = convert_runner(local_name, value)?;
        let full_name = match namespace {
            Some(namespace) => format!("{}.{}", namespace, local_name),
            None => local_name.to_owned(),
        };
        let mut runner = runner;
        runner.name = full_name.clone();
        parts.runners.insert(full_name, runner);
    }

    // Tasks.
    for (local_name, raw_task) in &raw.tasks {
        // Dots are reserved for import namespacing.
        if local_name.contains('.') {
            return Err(Failure::User(
                format!(
                    "Task {} in {} contains a {}, which is reserved for import namespacing.",
                    local_name.code_str(),
                    file_path.to_string_lossy().code_str(),
                    ".".code_str(),
                ),
                None,
            ));
        }

        let full_name = match namespace {
            Some(namespace) => format!("{}.{}", namespace, local_name),
            None => local_name.clone(),
        };

        let mut deps = convert_deps(&raw_task.deps, &full_name)?;
        for dep in &mut deps {
            if namespace.is_some() {
                dep.task = rewrite(&dep.task);
            }
        }

        let mut inputs = convert_io_entries(&raw_task.inputs, &full_name, "inputs")?;
        let mut outputs = convert_io_entries(&raw_task.outputs, &full_name, "outputs")?;
        let args = raw_task
            .args
            .iter()
            .map(|raw_arg| convert_arg_spec(raw_arg, &full_name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cmd = raw_task.cmd.clone();
        let mut working_dir = raw_task
            .working_dir
            .clone()
            .unwrap_or_else(|| default_working_dir.clone());
        if namespace.is_some() {
            cmd = template::rewrite_namespaced_refs(&cmd, rewrite)?;
            working_dir = template::rewrite_namespaced_refs(&working_dir, rewrite)?;
            for entry in inputs.iter_mut().chain(outputs.iter_mut()) {
                entry.pattern = template::rewrite_namespaced_refs(&entry.pattern, rewrite)?;
            }
        }

        let task = Task {
            name: full_name.clone(),
            cmd,
            desc: raw_task.desc.clone(),
            private: raw_task.private,
            deps,
            inputs,
            outputs,
            args,
            working_dir,
            run_in: rewrite(&raw_task.run_in),
            pin_runner: raw_task.pin_runner,
            source_file: file_path.to_owned(),
        };

        check_name_uniqueness(&task)?;
        parts.tasks.insert(full_name, task);
    }

    import_stack.pop();
    Ok(())
}
