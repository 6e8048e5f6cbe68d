use crate::{
    config::ConfigRunners,
    docker,
    failure::Failure,
    fingerprint, format,
    format::CodeStr,
    graph,
    graph::{PlannedTask, TaskNode},
    recipe::{Recipe, Runner, RunnerKind, Task},
    runner::{CommandRunner, OutputMode, ShellRunner},
    state::{InputStamp, StateManager, TaskState},
    status,
    status::{RunReason, TaskStatus},
    template,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env,
    path::Path,
    time::UNIX_EPOCH,
};

// The environment variable carrying the ancestor chain of nested `tt` invocations, as
// comma-separated `cache_key:task_name` entries.
pub const CALL_CHAIN_VAR: &str = "TT_CALL_CHAIN";

// Execution switches, set from the command line.
pub struct ExecutorOptions {
    pub force: bool,
    pub only: bool,
    pub output: OutputMode,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            force: false,
            only: false,
            output: OutputMode::All,
        }
    }
}

// A test seam: given an effective runner, produce the backend that executes commands for it.
pub type RunnerFactory = Box<dyn Fn(&Runner, &Path, OutputMode) -> Box<dyn CommandRunner>>;

// The runner at the bottom of the resolution chain, used when nothing else names one.
pub fn platform_default_runner() -> Runner {
    if cfg!(windows) {
        Runner::shell("default", "powershell")
    } else {
        Runner::shell("default", "sh")
    }
}

// Format one entry of the nested-invocation chain.
fn call_chain_entry(cache_key: &str, task_name: &str) -> String {
    format!("{}:{}", cache_key, task_name)
}

// Parse the chain from its environment form. Malformed entries are ignored rather than fatal;
// the variable is ours, but another process may have mangled it.
fn parse_call_chain(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (cache_key, task_name) = entry.split_once(':')?;
            if cache_key.is_empty() {
                None
            } else {
                Some((cache_key.to_owned(), task_name.to_owned()))
            }
        })
        .collect()
}

// Check a task's cache key against the ancestor chain. The cache key encodes the argument
// binding, so the same task under different arguments is not a cycle.
fn check_recursion(
    chain: &[(String, String)],
    cache_key: &str,
    task_name: &str,
) -> Result<(), Failure> {
    let Some(position) = chain.iter().position(|(key, _)| key == cache_key) else {
        return Ok(());
    };

    let mut path = chain[position..]
        .iter()
        .map(|(_, name)| name.code_str().to_string())
        .collect::<Vec<_>>();
    path.push(task_name.code_str().to_string());

    Err(Failure::User(
        format!(
            "Recursion detected: task {} is already running in an ancestor invocation. The call \
             path is: {}.",
            task_name.code_str(),
            path.join(" \u{2192} "),
        ),
        None,
    ))
}

// Resolve a task's effective runner: the first non-empty level of the chain wins.
fn effective_runner(
    recipe: &Recipe,
    configs: &ConfigRunners,
    task: &Task,
) -> Result<Runner, Failure> {
    let by_name = |name: &str| -> Result<Runner, Failure> {
        recipe.runners.get(name).cloned().ok_or_else(|| {
            Failure::User(
                format!("The runner {} is not defined.", name.code_str()),
                None,
            )
        })
    };

    if !recipe.global_runner_override.is_empty() {
        return by_name(&recipe.global_runner_override);
    }
    if !task.run_in.is_empty() {
        // Import-level overrides were already folded into `run_in` during parsing, honoring
        // `pin_runner`.
        return by_name(&task.run_in);
    }
    if !recipe.default_runner.is_empty() {
        return by_name(&recipe.default_runner);
    }
    for level in [&configs.project, &configs.user, &configs.machine] {
        if let Some(runner) = &level.runner {
            return Ok(runner.clone());
        }
        // The chain reached a level whose config file was broken; what it would have said
        // matters now, so the parse failure becomes fatal.
        if let Some(message) = &level.error {
            return Err(Failure::User(message.clone(), None));
        }
    }
    Ok(platform_default_runner())
}

// Build the runner's image once per executor instance and remember its ID.
fn ensure_image_memoized(
    runner: &Runner,
    image_ids: &mut HashMap<String, String>,
    project_root: &Path,
) -> Result<String, Failure> {
    if let Some(id) = image_ids.get(&runner.name) {
        return Ok(id.clone());
    }
    let id = docker::ensure_image(runner, project_root)?;
    image_ids.insert(runner.name.clone(), id.clone());
    Ok(id)
}

// Has the effective runner changed since the cached run? The YAML fingerprint is checked first;
// only when it matches does a container runner pay for an image build to compare image IDs.
fn runner_freshness(
    runner: &Runner,
    cached: Option<&TaskState>,
    image_ids: &mut HashMap<String, String>,
    project_root: &Path,
) -> Result<bool, Failure> {
    let Some(cached) = cached else {
        return Ok(true);
    };

    let current = fingerprint::hash_runner(runner);
    let hash_key = format!("_runner_hash_{}", runner.name);
    match cached.input_state.get(&hash_key) {
        Some(InputStamp::Token(recorded)) if *recorded == current => {}
        _ => return Ok(true),
    }

    if runner.kind() == RunnerKind::Container {
        let image_id = ensure_image_memoized(runner, image_ids, project_root)?;
        let id_key = format!("_docker_image_id_{}", runner.name);
        match cached.input_state.get(&id_key) {
            Some(InputStamp::Token(recorded)) if *recorded == image_id => Ok(false),
            _ => Ok(true),
        }
    } else {
        Ok(false)
    }
}

// Drives a target invocation to completion: ordering, staleness, execution, and state updates.
pub struct Executor<'a> {
    recipe: &'a Recipe,
    state: StateManager,
    options: ExecutorOptions,
    configs: ConfigRunners,
    variables: BTreeMap<String, String>,
    git_cache: BTreeMap<String, String>,
    image_ids: HashMap<String, String>,
    runner_factory: Option<RunnerFactory>,
}

impl<'a> Executor<'a> {
    pub fn new(
        recipe: &'a Recipe,
        mut state: StateManager,
        options: ExecutorOptions,
        configs: ConfigRunners,
    ) -> Result<Self, Failure> {
        state.load();
        let variables = template::resolve_variables(&recipe.variables, &recipe.project_root)?;
        Ok(Executor {
            recipe,
            state,
            options,
            configs,
            variables,
            git_cache: BTreeMap::new(),
            image_ids: HashMap::new(),
            runner_factory: None,
        })
    }

    // Replace the execution backend, e.g. with a recording fake in tests.
    #[must_use]
    pub fn with_runner_factory(mut self, factory: RunnerFactory) -> Self {
        self.runner_factory = Some(factory);
        self
    }

    pub fn effective_runner_for(&self, task: &Task) -> Result<Runner, Failure> {
        effective_runner(self.recipe, &self.configs, task)
    }

    // Build the plan for a target invocation. With `only`, everything but the target itself is
    // dropped.
    pub fn plan(
        &self,
        target: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<PlannedTask>, Failure> {
        let recipe = self.recipe;
        let configs = &self.configs;
        let runner_for =
            |task: &Task| -> Option<Runner> { effective_runner(recipe, configs, task).ok() };

        let mut plan = graph::build_plan(recipe, target, args, &self.variables, &runner_for)?;
        if self.options.only {
            // The target is always the last node of the topological order.
            plan.drain(..plan.len() - 1);
        }
        Ok(plan)
    }

    // Compute the status of every node of the plan, in order, feeding dependency verdicts
    // forward.
    fn compute_statuses(&mut self, plan: &[PlannedTask]) -> Result<Vec<TaskStatus>, Failure> {
        let mut statuses: Vec<TaskStatus> = vec![];
        let mut index_by_node: HashMap<TaskNode, usize> = HashMap::new();

        // `--only` runs the target unconditionally; there is no dependency context to judge
        // freshness against.
        let force = self.options.force || self.options.only;

        for (index, planned) in plan.iter().enumerate() {
            let original = &self.recipe.tasks[&planned.node.task];
            let runner = self.effective_runner_for(original)?;
            let task_hash = fingerprint::hash_task(original, &runner.name);
            let cache_key = fingerprint::cache_key(&task_hash, &planned.node.args);

            let dependency_triggered = planned.dep_nodes.iter().any(|dep| {
                index_by_node
                    .get(dep)
                    .is_some_and(|dep_index| statuses[*dep_index].will_run)
            });

            let cached = self.state.get(&cache_key).cloned();
            let project_root = self.recipe.project_root.clone();
            let check_root = project_root.clone();
            let image_ids = &mut self.image_ids;
            let cached_for_runner = cached.clone();
            let runner_for_check = runner.clone();

            let status = status::check_status(
                &project_root,
                force,
                &planned.effective_inputs,
                &planned.outputs_root,
                dependency_triggered,
                cached.as_ref(),
                move || {
                    runner_freshness(
                        &runner_for_check,
                        cached_for_runner.as_ref(),
                        image_ids,
                        &check_root,
                    )
                },
            )?;

            index_by_node.insert(planned.node.clone(), index);
            statuses.push(status);
        }

        Ok(statuses)
    }

    // The plan with statuses but no execution: the dry-run and tree views.
    pub fn plan_statuses(
        &mut self,
        target: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<(PlannedTask, TaskStatus)>, Failure> {
        let plan = self.plan(target, args)?;
        let statuses = self.compute_statuses(&plan)?;
        Ok(plan.into_iter().zip(statuses).collect())
    }

    // Execute a target invocation.
    pub fn execute(
        &mut self,
        target: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<(TaskNode, TaskStatus)>, Failure> {
        let plan = self.plan(target, args)?;

        // Drop state entries that no longer correspond to any task in the recipe.
        let mut valid_hashes = HashSet::new();
        for task in self.recipe.tasks.values() {
            let runner = self.effective_runner_for(task)?;
            valid_hashes.insert(fingerprint::hash_task(task, &runner.name));
        }
        self.state.prune(&valid_hashes);
        self.state.save()?;

        let statuses = self.compute_statuses(&plan)?;

        let stale = statuses.iter().filter(|status| status.will_run).count();
        if stale > 0 {
            info!(
                "Ready to run {} {}: {}.",
                stale,
                if stale == 1 { "task" } else { "tasks" },
                format::name_list(
                    plan.iter()
                        .zip(&statuses)
                        .filter(|(_, status)| status.will_run)
                        .map(|(planned, _)| planned.node.to_string().code_str().to_string())
                        .collect::<Vec<_>>()
                        .as_ref(),
                ),
            );
        }

        let chain_raw = env::var(CALL_CHAIN_VAR).unwrap_or_default();
        let chain = parse_call_chain(&chain_raw);

        for (planned, status) in plan.iter().zip(&statuses) {
            if !status.will_run {
                info!(
                    "Task {} is fresh ({}).",
                    planned.node.to_string().code_str(),
                    status.reason,
                );
                continue;
            }

            if status.reason == RunReason::OutputsMissing {
                warn!(
                    "Re-running task {} because declared outputs are missing: {}.",
                    planned.node.to_string().code_str(),
                    format::name_list(
                        status
                            .changed_files
                            .iter()
                            .map(|file| file.code_str().to_string())
                            .collect::<Vec<_>>()
                            .as_ref(),
                    ),
                );
            }

            self.run_node(planned, &chain, &chain_raw)?;
        }

        Ok(plan
            .into_iter()
            .map(|planned| planned.node)
            .zip(statuses)
            .collect())
    }

    // The built-in `tt.*` variables, computed once at task start so every reference within one
    // execution sees the same values.
    fn builtins_for(&self, planned: &PlannedTask, working_dir_abs: &Path) -> BTreeMap<String, String> {
        let now = chrono::Local::now();
        let mut builtins = BTreeMap::new();
        builtins.insert(
            "project_root".to_owned(),
            self.recipe.project_root.to_string_lossy().into_owned(),
        );
        builtins.insert(
            "recipe_dir".to_owned(),
            self.recipe
                .recipe_path
                .parent()
                .unwrap_or(&self.recipe.project_root)
                .to_string_lossy()
                .into_owned(),
        );
        builtins.insert("task_name".to_owned(), planned.node.task.clone());
        builtins.insert(
            "working_dir".to_owned(),
            working_dir_abs.to_string_lossy().into_owned(),
        );
        builtins.insert("timestamp".to_owned(), now.to_rfc3339());
        builtins.insert("timestamp_unix".to_owned(), now.timestamp().to_string());
        builtins.insert(
            "user_home".to_owned(),
            dirs::home_dir()
                .map(|home| home.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        builtins.insert(
            "user_name".to_owned(),
            env::var("USER")
                .or_else(|_| env::var("USERNAME"))
                .unwrap_or_default(),
        );
        builtins
    }

    fn make_runner(&mut self, runner: &Runner) -> Result<Box<dyn CommandRunner>, Failure> {
        if let Some(factory) = &self.runner_factory {
            return Ok(factory(
                runner,
                &self.recipe.project_root,
                self.options.output,
            ));
        }

        match runner.kind() {
            RunnerKind::Shell => Ok(Box::new(ShellRunner {
                shell: runner.shell.clone(),
                args: runner.args.clone(),
                preamble: runner.preamble.clone(),
                project_root: self.recipe.project_root.clone(),
                output: self.options.output,
            })),
            RunnerKind::Container => {
                ensure_image_memoized(runner, &mut self.image_ids, &self.recipe.project_root)?;
                Ok(Box::new(docker::ContainerRunner {
                    runner: runner.clone(),
                    image: docker::image_tag(&runner.name),
                    project_root: self.recipe.project_root.clone(),
                    output: self.options.output,
                }))
            }
        }
    }

    // Run one stale node: recursion guard, template expansion, execution, and the state write.
    fn run_node(
        &mut self,
        planned: &PlannedTask,
        chain: &[(String, String)],
        chain_raw: &str,
    ) -> Result<(), Failure> {
        let original = &self.recipe.tasks[&planned.node.task];
        let runner = self.effective_runner_for(original)?;
        let task_hash = fingerprint::hash_task(original, &runner.name);
        let cache_key = fingerprint::cache_key(&task_hash, &planned.node.args);

        // Abort before spawning anything when an ancestor invocation is already running this
        // exact task.
        check_recursion(chain, &cache_key, &planned.node.task)?;

        info!("Running task {}...", planned.node.to_string().code_str());

        // Expand the command: variables, dependency outputs, self references, and arguments
        // first; then the environment, built-ins, and git queries.
        let working_dir_abs = crate::runner::resolve_working_dir(
            &self.recipe.project_root,
            &planned.task.working_dir,
        );
        let cmd = graph::expand_command(planned, &self.variables)?;
        let cmd = template::substitute_environment(&cmd)?;
        let builtins = self.builtins_for(planned, &working_dir_abs);
        let cmd = template::substitute_builtins(&cmd, &builtins)?;
        let cmd = template::substitute_git(&cmd, &working_dir_abs, &mut self.git_cache)?;

        // Exported arguments reach the task as environment variables, along with the extended
        // call chain for nested invocations.
        let mut env_vars = BTreeMap::new();
        for spec in &planned.task.args {
            if spec.exported {
                if let Some(value) = planned.node.args.get(&spec.name) {
                    env_vars.insert(spec.name.clone(), value.clone());
                }
            }
        }
        let own_entry = call_chain_entry(&cache_key, &planned.node.task);
        let extended_chain = if chain_raw.is_empty() {
            own_entry
        } else {
            format!("{},{}", chain_raw, own_entry)
        };
        env_vars.insert(CALL_CHAIN_VAR.to_owned(), extended_chain);

        let backend = self.make_runner(&runner)?;
        debug!("Using {}.", backend.describe());
        let exit_code = backend.run(&cmd, &planned.task.working_dir, &env_vars)?;
        if exit_code != 0 {
            return Err(Failure::User(
                format!(
                    "Task {} failed with exit code {}.",
                    planned.node.to_string().code_str(),
                    exit_code,
                ),
                None,
            ));
        }

        // Record the run: current input stamps, the runner fingerprint, and (for containers)
        // the image identity.
        let mut input_state: BTreeMap<String, InputStamp> = BTreeMap::new();
        for input in &planned.effective_inputs {
            match input {
                graph::EffectiveInput::Glob(pattern) => {
                    let files = status::expand_globs(
                        &self.recipe.project_root,
                        std::slice::from_ref(pattern),
                    )?;
                    for file in files {
                        if let Some(mtime) =
                            status::file_mtime(&self.recipe.project_root.join(&file))
                        {
                            input_state.insert(file, InputStamp::Mtime(mtime));
                        }
                    }
                }
                graph::EffectiveInput::Token(token) => {
                    input_state.insert(token.clone(), InputStamp::Token(token.clone()));
                }
            }
        }
        input_state.insert(
            format!("_runner_hash_{}", runner.name),
            InputStamp::Token(fingerprint::hash_runner(&runner)),
        );
        if runner.kind() == RunnerKind::Container {
            if let Some(image_id) = self.image_ids.get(&runner.name) {
                input_state.insert(
                    format!("_docker_image_id_{}", runner.name),
                    InputStamp::Token(image_id.clone()),
                );
            }
        }

        let last_run = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |duration| duration.as_secs_f64());
        self.state.set(
            cache_key,
            TaskState {
                last_run,
                input_state,
            },
        );

        // A nested invocation may have written its own entries while we ran; fold them in
        // before replacing the file.
        self.state.reload_and_merge();
        self.state.save()?;

        Ok(())
    }
}
