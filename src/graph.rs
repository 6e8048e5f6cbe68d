use crate::{
    failure::Failure,
    format,
    format::CodeStr,
    recipe::{DepArgs, Recipe, Runner, RunnerKind, Task},
    template,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
};

// One node of the parameterized dependency graph. The same task invoked with different argument
// bindings is a different node; bindings hold canonical values, so equal invocations written
// differently collapse into one node.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct TaskNode {
    pub task: String,
    pub args: BTreeMap<String, String>,
}

impl TaskNode {
    pub fn new(task: impl Into<String>, args: BTreeMap<String, String>) -> Self {
        TaskNode {
            task: task.into(),
            args,
        }
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.task)
        } else {
            let rendered = self
                .args
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "{}({})", self.task, rendered)
        }
    }
}

// One effective input of a task: a glob pattern rooted at the project root, or an opaque token
// compared by name rather than matched against the filesystem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EffectiveInput {
    Glob(String),
    Token(String),
}

// A node of the finished plan: the task with its binding, its template-expanded fields, and the
// wiring the executor needs. The recipe's own `Task` values stay untouched; every node gets its
// own resolved copy so the same task under two bindings can't alias.
#[derive(Clone, Debug)]
pub struct PlannedTask {
    pub node: TaskNode,

    // Patterns expanded (working-dir-relative), `working_dir` expanded, `cmd` still raw; the
    // command is expanded at execution time so `env`/`git`/built-in references only resolve for
    // tasks that actually run.
    pub task: Task,

    // Expanded glob patterns rooted at the project root.
    pub inputs_root: Vec<String>,
    pub outputs_root: Vec<String>,

    // Declared inputs plus inherited and container-derived ones.
    pub effective_inputs: Vec<EffectiveInput>,

    pub dep_nodes: Vec<TaskNode>,

    // Dependency task name -> named output -> path, rebased onto this task's working directory.
    pub dep_outputs: BTreeMap<String, BTreeMap<String, String>>,
}

// Join a working directory and a working-dir-relative pattern into a project-root-relative
// pattern. Purely lexical; `.` segments are elided.
pub fn join_working_dir(working_dir: &str, pattern: &str) -> String {
    let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
    if working_dir.is_empty() || working_dir == "." {
        pattern.to_owned()
    } else {
        format!("{}/{}", working_dir.trim_end_matches('/'), pattern)
    }
}

// Rewrite a project-root-relative path so it is relative to the given working directory.
fn rebase(path_from_root: &str, working_dir: &str) -> String {
    if working_dir.is_empty() || working_dir == "." {
        return path_from_root.to_owned();
    }

    let path_components = path_from_root
        .split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .collect::<Vec<_>>();
    let dir_components = working_dir
        .split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .collect::<Vec<_>>();

    let shared = path_components
        .iter()
        .zip(dir_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut components = vec![".."; dir_components.len() - shared];
    components.extend(&path_components[shared..]);
    components.join("/")
}

// Convert an argument list into a canonical binding for a task: positional values map onto the
// declared order, named values are matched by name, defaults fill the gaps, and every value is
// type-converted. The error is a plain message so callers can decide between a user failure (dep
// entries) and a usage failure (the command line).
pub fn bind_args(
    task: &Task,
    positional: &[String],
    named: &[(String, String)],
) -> Result<BTreeMap<String, String>, String> {
    if task.args.is_empty() && (!positional.is_empty() || !named.is_empty()) {
        return Err(format!(
            "task {} does not accept arguments",
            task.name.code_str(),
        ));
    }

    if positional.len() > task.args.len() {
        return Err(format!(
            "task {} declares {} {}, but {} positional values were given",
            task.name.code_str(),
            task.args.len(),
            if task.args.len() == 1 {
                "argument"
            } else {
                "arguments"
            },
            positional.len(),
        ));
    }

    let mut raw: BTreeMap<String, String> = BTreeMap::new();

    for (spec, value) in task.args.iter().zip(positional.iter()) {
        raw.insert(spec.name.clone(), value.clone());
    }

    for (name, value) in named {
        if task.arg_spec(name).is_none() {
            return Err(format!(
                "task {} has no argument named {}; it accepts {}",
                task.name.code_str(),
                name.code_str(),
                format::name_list(
                    task.args
                        .iter()
                        .map(|spec| spec.canonical().code_str().to_string())
                        .collect::<Vec<_>>()
                        .as_ref(),
                ),
            ));
        }
        raw.insert(name.clone(), value.clone());
    }

    let mut binding = BTreeMap::new();
    for spec in &task.args {
        let value = match raw.remove(&spec.name) {
            Some(value) => value,
            None => match &spec.default {
                Some(default) => default.clone(),
                None => {
                    return Err(format!(
                        "missing required argument {} of task {}",
                        spec.name.code_str(),
                        task.name.code_str(),
                    ));
                }
            },
        };

        let converted = spec
            .arg_type
            .convert(&value)
            .map_err(|reason| format!("argument {}: {}", spec.name.code_str(), reason))?;

        if !spec.choices.is_empty() && !spec.choices.contains(&converted) {
            return Err(format!(
                "argument {} must be one of {}",
                spec.name.code_str(),
                format::name_list(
                    spec.choices
                        .iter()
                        .map(|choice| choice.code_str().to_string())
                        .collect::<Vec<_>>()
                        .as_ref(),
                ),
            ));
        }

        binding.insert(spec.name.clone(), converted);
    }

    Ok(binding)
}

// Normalize one dep entry of `task` into a graph node. Argument values may reference recipe
// variables and the named outputs of deps declared earlier in the same list.
fn normalize_dep(
    recipe: &Recipe,
    task: &Task,
    dep: &crate::recipe::DepSpec,
    variables: &BTreeMap<String, String>,
) -> Result<TaskNode, Failure> {
    let dep_task = recipe.tasks.get(&dep.task).ok_or_else(|| {
        Failure::User(
            format!(
                "Task {} depends on {}, which does not exist.",
                task.name.code_str(),
                dep.task.code_str(),
            ),
            None,
        )
    })?;

    let expand = |value: &str| -> Result<String, Failure> {
        let value = template::substitute_variables(value, variables)?;
        template::substitute_dep_refs(&value, |target, output, templated| {
            let Some(prior) = task
                .deps
                .iter()
                .map(|candidate| &candidate.task)
                .find(|candidate| *candidate == target)
            else {
                return Err(Failure::User(
                    format!(
                        "The template {} in a dependency of task {} refers to {}, which is not \
                         one of its dependencies.",
                        templated.code_str(),
                        task.name.code_str(),
                        target.code_str(),
                    ),
                    None,
                ));
            };

            let prior_task = &recipe.tasks[prior];
            let entry = prior_task.named_output(output).ok_or_else(|| {
                Failure::User(
                    format!(
                        "The template {} refers to output {} of task {}, which has no such named \
                         output. The available names are: {}.",
                        templated.code_str(),
                        output.code_str(),
                        prior.code_str(),
                        format::name_list(
                            prior_task
                                .named_output_names()
                                .iter()
                                .map(|name| name.code_str().to_string())
                                .collect::<Vec<_>>()
                                .as_ref(),
                        ),
                    ),
                    None,
                )
            })?;
            template::substitute_variables(&entry.pattern, variables)
        })
    };

    let binding = match &dep.args {
        DepArgs::None => bind_args(dep_task, &[], &[]),
        DepArgs::Positional(values) => {
            let values = values
                .iter()
                .map(|value| expand(value))
                .collect::<Result<Vec<_>, _>>()?;
            bind_args(dep_task, &values, &[])
        }
        DepArgs::Named(pairs) => {
            let pairs = pairs
                .iter()
                .map(|(name, value)| Ok((name.clone(), expand(value)?)))
                .collect::<Result<Vec<_>, Failure>>()?;
            bind_args(dep_task, &[], &pairs)
        }
    }
    .map_err(|reason| {
        Failure::User(
            format!(
                "Invalid arguments in dependency {} of task {}: {}.",
                dep.to_string().code_str(),
                task.name.code_str(),
                reason,
            ),
            None,
        )
    })?;

    Ok(TaskNode::new(dep.task.clone(), binding))
}

// Build the parameterized dependency graph rooted at the target and return its edges.
fn build_edges(
    recipe: &Recipe,
    root: &TaskNode,
    variables: &BTreeMap<String, String>,
) -> Result<HashMap<TaskNode, Vec<TaskNode>>, Failure> {
    let mut edges: HashMap<TaskNode, Vec<TaskNode>> = HashMap::new();
    let mut frontier = vec![root.clone()];

    while let Some(node) = frontier.pop() {
        if edges.contains_key(&node) {
            continue;
        }

        let task = recipe.tasks.get(&node.task).ok_or_else(|| {
            Failure::User(
                format!("Task {} does not exist.", node.task.code_str()),
                None,
            )
        })?;

        let mut dep_nodes = vec![];
        let mut seen = HashSet::new();
        for dep in &task.deps {
            let dep_node = normalize_dep(recipe, task, dep, variables)?;
            if seen.insert(dep_node.clone()) {
                dep_nodes.push(dep_node.clone());
                frontier.push(dep_node);
            }
        }

        edges.insert(node, dep_nodes);
    }

    Ok(edges)
}

// Find some cycle among the given nodes, following dependency edges. Only called when Kahn's
// algorithm has already proven one exists.
fn find_cycle(edges: &HashMap<TaskNode, Vec<TaskNode>>, remaining: &HashSet<TaskNode>) -> Vec<TaskNode> {
    let Some(start) = remaining.iter().min() else {
        return vec![];
    };

    let mut stack = vec![start.clone()];
    let mut path_set = HashSet::new();
    let mut current = start.clone();

    loop {
        path_set.insert(current.clone());
        let next = edges[&current]
            .iter()
            .find(|dep| remaining.contains(*dep))
            .cloned();
        match next {
            Some(next) => {
                if path_set.contains(&next) {
                    let position = stack.iter().position(|node| *node == next).unwrap_or(0);
                    let mut cycle = stack[position..].to_vec();
                    cycle.push(next);
                    return cycle;
                }
                stack.push(next.clone());
                current = next;
            }
            None => return vec![],
        }
    }
}

// Compute the execution order for a target invocation: every dependency strictly precedes its
// dependents, and ties break deterministically.
pub fn execution_order(
    recipe: &Recipe,
    target: &str,
    target_args: &BTreeMap<String, String>,
    variables: &BTreeMap<String, String>,
) -> Result<Vec<TaskNode>, Failure> {
    if !recipe.tasks.contains_key(target) {
        return Err(Failure::User(
            format!(
                "No task named {} in {}.",
                target.code_str(),
                recipe.recipe_path.to_string_lossy().code_str(),
            ),
            None,
        ));
    }

    let root = TaskNode::new(target, target_args.clone());
    let edges = build_edges(recipe, &root, variables)?;

    // Kahn's algorithm with a sorted ready set.
    let mut blocking: HashMap<TaskNode, usize> = edges
        .iter()
        .map(|(node, deps)| (node.clone(), deps.len()))
        .collect();
    let mut dependents: HashMap<TaskNode, Vec<TaskNode>> = HashMap::new();
    for (node, deps) in &edges {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(node.clone());
        }
    }

    let mut ready: BTreeSet<TaskNode> = blocking
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| node.clone())
        .collect();
    let mut order = vec![];

    while let Some(node) = ready.iter().next().cloned() {
        ready.remove(&node);
        order.push(node.clone());
        if let Some(nodes) = dependents.get(&node) {
            for dependent in nodes.clone() {
                // The `unwrap` is safe because every dependent is itself a key of `edges`.
                let count = blocking.get_mut(&dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < edges.len() {
        let remaining = edges
            .keys()
            .filter(|node| !order.contains(*node))
            .cloned()
            .collect::<HashSet<_>>();
        let cycle = find_cycle(&edges, &remaining);
        return Err(Failure::User(
            format!(
                "The dependencies are cyclic: {}.",
                cycle
                    .iter()
                    .map(|node| node.to_string().code_str().to_string())
                    .collect::<Vec<_>>()
                    .join(" \u{2192} "),
            ),
            None,
        ));
    }

    Ok(order)
}

// Expand a pattern-bearing task field: variables, then dependency-output references, then
// arguments. Environment, built-in, and git references are reserved for commands.
fn expand_field(
    text: &str,
    variables: &BTreeMap<String, String>,
    dep_outputs: &BTreeMap<String, BTreeMap<String, String>>,
    task: &Task,
    args: &BTreeMap<String, String>,
    exported: &HashSet<String>,
) -> Result<String, Failure> {
    let text = template::substitute_variables(text, variables)?;
    let text = substitute_node_dep_refs(&text, task, dep_outputs)?;
    template::substitute_arguments(&text, args, exported)
}

// Substitute `{{ dep.T.outputs.N }}` against this node's resolved dependency outputs.
fn substitute_node_dep_refs(
    text: &str,
    task: &Task,
    dep_outputs: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<String, Failure> {
    template::substitute_dep_refs(text, |target, output, templated| {
        let Some(outputs) = dep_outputs.get(target) else {
            return Err(Failure::User(
                format!(
                    "The template {} in task {} refers to {}, which is not one of its \
                     dependencies. The dependencies are: {}.",
                    templated.code_str(),
                    task.name.code_str(),
                    target.code_str(),
                    format::name_list(
                        task.dep_names()
                            .iter()
                            .map(|name| name.code_str().to_string())
                            .collect::<Vec<_>>()
                            .as_ref(),
                    ),
                ),
                None,
            ));
        };

        outputs.get(output).cloned().ok_or_else(|| {
            Failure::User(
                format!(
                    "The template {} refers to output {} of task {}, which has no such named \
                     output. The available names are: {}.",
                    templated.code_str(),
                    output.code_str(),
                    target.code_str(),
                    format::name_list(
                        outputs
                            .keys()
                            .map(|name| name.code_str().to_string())
                            .collect::<Vec<_>>()
                            .as_ref(),
                    ),
                ),
                None,
            )
        })
    })
}

// Build the full plan for a target invocation: the execution order plus, per node, the resolved
// task fields, effective inputs, and dependency-output wiring. `runner_for` resolves a task to
// its effective runner, if any; container runners contribute implicit inputs.
pub fn build_plan(
    recipe: &Recipe,
    target: &str,
    target_args: &BTreeMap<String, String>,
    variables: &BTreeMap<String, String>,
    runner_for: &dyn Fn(&Task) -> Option<Runner>,
) -> Result<Vec<PlannedTask>, Failure> {
    let order = execution_order(recipe, target, target_args, variables)?;

    let mut planned: Vec<PlannedTask> = vec![];
    let mut planned_index: HashMap<TaskNode, usize> = HashMap::new();

    for node in order {
        let task = &recipe.tasks[&node.task];
        let exported = task
            .args
            .iter()
            .filter(|spec| spec.exported)
            .map(|spec| spec.name.clone())
            .collect::<HashSet<_>>();

        // Recompute this node's dependency nodes; they are guaranteed to be planned already.
        let mut dep_nodes = vec![];
        let mut seen = HashSet::new();
        for dep in &task.deps {
            let dep_node = normalize_dep(recipe, task, dep, variables)?;
            if seen.insert(dep_node.clone()) {
                dep_nodes.push(dep_node);
            }
        }

        // Working directory first: dependency-output references inside it resolve to
        // project-root-relative paths, which is what a working directory is.
        let mut root_relative_outputs: BTreeMap<String, BTreeMap<String, String>> =
            BTreeMap::new();
        for dep_node in &dep_nodes {
            let dep_planned = &planned[planned_index[dep_node]];
            let mut named = BTreeMap::new();
            for entry in &dep_planned.task.outputs {
                if let Some(name) = &entry.name {
                    named.insert(
                        name.clone(),
                        join_working_dir(&dep_planned.task.working_dir, &entry.pattern),
                    );
                }
            }
            root_relative_outputs
                .entry(dep_node.task.clone())
                .or_insert(named);
        }

        let working_dir = expand_field(
            &task.working_dir,
            variables,
            &root_relative_outputs,
            task,
            &node.args,
            &exported,
        )?;

        // Dependency outputs rebased onto this task's working directory, for commands and
        // patterns.
        let mut dep_outputs: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (dep_name, named) in &root_relative_outputs {
            let rebased = named
                .iter()
                .map(|(name, path)| (name.clone(), rebase(path, &working_dir)))
                .collect::<BTreeMap<_, _>>();
            dep_outputs.insert(dep_name.clone(), rebased);
        }

        let mut resolved = task.clone();
        resolved.working_dir = working_dir.clone();
        for entry in resolved
            .inputs
            .iter_mut()
            .chain(resolved.outputs.iter_mut())
        {
            entry.pattern = expand_field(
                &entry.pattern,
                variables,
                &dep_outputs,
                task,
                &node.args,
                &exported,
            )?;
        }

        let inputs_root = resolved
            .inputs
            .iter()
            .map(|entry| join_working_dir(&working_dir, &entry.pattern))
            .collect::<Vec<_>>();
        let outputs_root = resolved
            .outputs
            .iter()
            .map(|entry| join_working_dir(&working_dir, &entry.pattern))
            .collect::<Vec<_>>();

        // Effective inputs: declared inputs, then inherited ones, then container artifacts.
        let mut effective_inputs = inputs_root
            .iter()
            .cloned()
            .map(EffectiveInput::Glob)
            .collect::<Vec<_>>();

        for dep_node in &dep_nodes {
            let dep_planned = &planned[planned_index[dep_node]];
            let inherited = if dep_planned.outputs_root.is_empty() {
                &dep_planned.inputs_root
            } else {
                &dep_planned.outputs_root
            };
            effective_inputs.extend(inherited.iter().cloned().map(EffectiveInput::Glob));
        }

        if let Some(runner) = runner_for(task) {
            if runner.kind() == RunnerKind::Container {
                effective_inputs.push(EffectiveInput::Glob(runner.dockerfile.clone()));

                let dockerignore = recipe
                    .project_root
                    .join(&runner.context)
                    .join(".dockerignore");
                if dockerignore.is_file() {
                    effective_inputs.push(EffectiveInput::Glob(join_working_dir(
                        &runner.context,
                        ".dockerignore",
                    )));
                }

                effective_inputs.push(EffectiveInput::Token(format!(
                    "_docker_context_{}",
                    runner.context,
                )));
                effective_inputs.push(EffectiveInput::Token(format!(
                    "_docker_dockerfile_{}",
                    runner.dockerfile,
                )));
            }
        }

        planned_index.insert(node.clone(), planned.len());
        planned.push(PlannedTask {
            node,
            task: resolved,
            inputs_root,
            outputs_root,
            effective_inputs,
            dep_nodes,
            dep_outputs,
        });
    }

    Ok(planned)
}

// Expand a node's command for execution: variables, dependency outputs, self references, and
// arguments. Environment, built-in, and git references are left for the executor, which owns
// their values.
pub fn expand_command(
    planned: &PlannedTask,
    variables: &BTreeMap<String, String>,
) -> Result<String, Failure> {
    let exported = planned
        .task
        .args
        .iter()
        .filter(|spec| spec.exported)
        .map(|spec| spec.name.clone())
        .collect::<HashSet<_>>();

    let text = template::substitute_variables(&planned.task.cmd, variables)?;
    let text = substitute_node_dep_refs(&text, &planned.task, &planned.dep_outputs)?;
    let text = template::substitute_self_refs(&text, &planned.task)?;
    template::substitute_arguments(&text, &planned.node.args, &exported)
}
