#[macro_use]
extern crate log;

use {
    atty::Stream,
    clap::{App, AppSettings, Arg},
    env_logger::{fmt::Color, Builder},
    log::{Level, LevelFilter},
    std::{collections::BTreeMap, env::current_dir, path::PathBuf, process::exit, str::FromStr},
    tasktree::{
        config::ConfigRunners,
        executor::{Executor, ExecutorOptions},
        failure,
        failure::Failure,
        format,
        format::CodeStr,
        graph,
        parser::{find_recipe_file, parse_recipe},
        recipe::Recipe,
        runner::OutputMode,
        state::StateManager,
        status::TaskStatus,
    },
};

// The program version
const VERSION: &str = env!("CARGO_PKG_VERSION");

// Defaults
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// Command-line argument and option names
const FILE_OPTION: &str = "file";
const FORCE_OPTION: &str = "force";
const ONLY_OPTION: &str = "only";
const OUTPUT_OPTION: &str = "output";
const RUNNER_OPTION: &str = "runner";
const LOG_LEVEL_OPTION: &str = "log-level";
const LIST_OPTION: &str = "list";
const TREE_OPTION: &str = "tree";
const DRY_RUN_OPTION: &str = "dry-run";
const SHOW_OPTION: &str = "show";
const CLEAN_STATE_OPTION: &str = "clean-state";
const TASK_OPTION: &str = "task";
const ARGS_OPTION: &str = "args";

// Set up the logger.
fn set_up_logging(level: LevelFilter) {
    Builder::new()
        .filter_module(module_path!(), level)
        .filter_module("tasktree", level)
        .format(|buf, record| {
            use std::io::Write;
            let mut style = buf.style();
            style.set_bold(true);
            match record.level() {
                Level::Error => {
                    style.set_color(Color::Red);
                }
                Level::Warn => {
                    style.set_color(Color::Yellow);
                }
                Level::Info => {
                    style.set_color(Color::Green);
                }
                Level::Debug | Level::Trace => {
                    style.set_color(Color::Blue);
                }
            }

            writeln!(
                buf,
                "{} {}",
                style.value(format!("[{}]", record.level())),
                record.args(),
            )
        })
        .init();
}

// This struct represents the command-line arguments.
struct Settings {
    recipe_path: Option<PathBuf>,
    force: bool,
    only: bool,
    output: OutputMode,
    runner_override: Option<String>,
    list: bool,
    tree: Option<String>,
    dry_run: Option<String>,
    show: Option<String>,
    clean_state: bool,
    task: Option<String>,
    task_args: Vec<String>,
}

// Parse the command-line arguments.
#[allow(clippy::too_many_lines)]
fn settings() -> Result<Settings, Failure> {
    let matches = App::new("TaskTree")
        .version(VERSION)
        .version_short("v")
        .author("Kevin Channon <kevin@tasktree.dev>")
        .about("TaskTree is an incremental task runner.")
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::NextLineHelp)
        .setting(AppSettings::UnifiedHelpMessage)
        .arg(
            Arg::with_name(FILE_OPTION)
                .value_name("PATH")
                .short("f")
                .long(FILE_OPTION)
                .help("Sets the path to the recipe file"),
        )
        .arg(
            Arg::with_name(FORCE_OPTION)
                .long(FORCE_OPTION)
                .help("Runs every scheduled task, even fresh ones"),
        )
        .arg(
            Arg::with_name(ONLY_OPTION)
                .long(ONLY_OPTION)
                .help("Runs only the named task, without its dependencies"),
        )
        .arg(
            Arg::with_name(OUTPUT_OPTION)
                .value_name("MODE")
                .short("o")
                .long(OUTPUT_OPTION)
                .help("Sets task output handling (all, none, or on-err)"),
        )
        .arg(
            Arg::with_name(RUNNER_OPTION)
                .value_name("RUNNER")
                .short("r")
                .long(RUNNER_OPTION)
                .help("Overrides the runner for every task"),
        )
        .arg(
            Arg::with_name(LOG_LEVEL_OPTION)
                .value_name("LEVEL")
                .long(LOG_LEVEL_OPTION)
                .help("Sets the log level (error, warn, info, debug, or trace)"),
        )
        .arg(
            Arg::with_name(LIST_OPTION)
                .short("l")
                .long(LIST_OPTION)
                .help("Lists the available tasks"),
        )
        .arg(
            Arg::with_name(TREE_OPTION)
                .value_name("TASK")
                .long(TREE_OPTION)
                .help("Shows the dependency tree of a task"),
        )
        .arg(
            Arg::with_name(DRY_RUN_OPTION)
                .value_name("TASK")
                .long(DRY_RUN_OPTION)
                .help("Shows the execution plan without running anything"),
        )
        .arg(
            Arg::with_name(SHOW_OPTION)
                .value_name("TASK")
                .long(SHOW_OPTION)
                .help("Shows a task definition"),
        )
        .arg(
            Arg::with_name(CLEAN_STATE_OPTION)
                .long(CLEAN_STATE_OPTION)
                .help("Removes the state file so every task runs fresh"),
        )
        .arg(
            Arg::with_name(TASK_OPTION)
                .value_name("TASK")
                .help("Sets the task to run"),
        )
        .arg(
            Arg::with_name(ARGS_OPTION)
                .value_name("ARGS")
                .help("Sets the task arguments, positional or name=value")
                .multiple(true),
        )
        .get_matches();

    let log_level = matches.value_of(LOG_LEVEL_OPTION).map_or_else(
        || {
            LevelFilter::from_str(
                &std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            )
            .unwrap_or(DEFAULT_LOG_LEVEL)
        },
        |level| LevelFilter::from_str(level).unwrap_or(DEFAULT_LOG_LEVEL),
    );
    set_up_logging(log_level);

    let output = matches
        .value_of(OUTPUT_OPTION)
        .map_or(Ok(OutputMode::All), str::parse)?;

    Ok(Settings {
        recipe_path: matches.value_of(FILE_OPTION).map(PathBuf::from),
        force: matches.is_present(FORCE_OPTION),
        only: matches.is_present(ONLY_OPTION),
        output,
        runner_override: matches.value_of(RUNNER_OPTION).map(ToOwned::to_owned),
        list: matches.is_present(LIST_OPTION),
        tree: matches.value_of(TREE_OPTION).map(ToOwned::to_owned),
        dry_run: matches.value_of(DRY_RUN_OPTION).map(ToOwned::to_owned),
        show: matches.value_of(SHOW_OPTION).map(ToOwned::to_owned),
        clean_state: matches.is_present(CLEAN_STATE_OPTION),
        task: matches.value_of(TASK_OPTION).map(ToOwned::to_owned),
        task_args: matches
            .values_of(ARGS_OPTION)
            .map_or_else(Vec::new, |values| {
                values.map(ToOwned::to_owned).collect::<Vec<_>>()
            }),
    })
}

// Locate and parse the recipe.
fn load_recipe(settings: &Settings) -> Result<Recipe, Failure> {
    let recipe_path = match &settings.recipe_path {
        Some(path) => path.clone(),
        None => {
            let start_dir = current_dir()
                .map_err(failure::system("Unable to determine the working directory."))?;
            find_recipe_file(&start_dir).ok_or_else(|| {
                Failure::User(
                    format!(
                        "No recipe file found ({} or {}).",
                        "tasktree.yaml".code_str(),
                        "tt.yaml".code_str(),
                    ),
                    None,
                )
            })?
        }
    };

    parse_recipe(&recipe_path)
}

// Convert the command-line task arguments into a binding: positional values first, then
// `name=value` pairs.
fn bind_cli_args(
    recipe: &Recipe,
    task_name: &str,
    raw_args: &[String],
) -> Result<BTreeMap<String, String>, Failure> {
    let task = recipe.tasks.get(task_name).ok_or_else(|| {
        Failure::User(
            format!(
                "No task named {} in {}.",
                task_name.code_str(),
                recipe.recipe_path.to_string_lossy().code_str(),
            ),
            None,
        )
    })?;

    let mut positional = vec![];
    let mut named = vec![];
    for raw in raw_args {
        match raw.split_once('=') {
            Some((name, value)) => named.push((name.to_owned(), value.to_owned())),
            None => positional.push(raw.clone()),
        }
    }

    graph::bind_args(task, &positional, &named)
        .map_err(|reason| Failure::Usage(format!("Invalid arguments: {}.", reason), None))
}

// List the tasks that aren't private, with their descriptions and argument specs.
fn list_tasks(recipe: &Recipe) {
    info!("Here are the available tasks:");
    for (name, task) in &recipe.tasks {
        if task.private {
            continue;
        }
        if task.desc.is_empty() {
            println!("* {}", name.code_str());
        } else {
            println!("* {} - {}", name.code_str(), task.desc);
        }
        for spec in &task.args {
            println!("  {}", spec.canonical().code_str());
        }
    }
}

// Show a task definition as YAML.
fn show_task(recipe: &Recipe, task_name: &str) -> Result<(), Failure> {
    let task = recipe.tasks.get(task_name).ok_or_else(|| {
        Failure::User(
            format!("No task named {}.", task_name.code_str()),
            None,
        )
    })?;

    println!("# {}", task.source_file.to_string_lossy());

    let mut body = serde_yaml::Mapping::new();
    let yaml = |value: &str| serde_yaml::Value::String(value.to_owned());
    if !task.desc.is_empty() {
        body.insert(yaml("desc"), yaml(&task.desc));
    }
    if !task.deps.is_empty() {
        body.insert(
            yaml("deps"),
            serde_yaml::Value::Sequence(
                task.deps.iter().map(|dep| yaml(&dep.to_string())).collect(),
            ),
        );
    }
    for (field, entries) in [("inputs", &task.inputs), ("outputs", &task.outputs)] {
        if !entries.is_empty() {
            body.insert(
                yaml(field),
                serde_yaml::Value::Sequence(
                    entries
                        .iter()
                        .map(|entry| match &entry.name {
                            Some(name) => {
                                let mut mapping = serde_yaml::Mapping::new();
                                mapping.insert(yaml(name), yaml(&entry.pattern));
                                serde_yaml::Value::Mapping(mapping)
                            }
                            None => yaml(&entry.pattern),
                        })
                        .collect(),
                ),
            );
        }
    }
    if !task.args.is_empty() {
        body.insert(
            yaml("args"),
            serde_yaml::Value::Sequence(
                task.args.iter().map(|spec| yaml(&spec.canonical())).collect(),
            ),
        );
    }
    if task.working_dir != "." {
        body.insert(yaml("working_dir"), yaml(&task.working_dir));
    }
    if !task.run_in.is_empty() {
        body.insert(yaml("run_in"), yaml(&task.run_in));
    }
    body.insert(yaml("cmd"), yaml(&task.cmd));

    let mut document = serde_yaml::Mapping::new();
    document.insert(yaml(task_name), serde_yaml::Value::Mapping(body));

    let rendered = serde_yaml::to_string(&serde_yaml::Value::Mapping(document))
        .map_err(failure::system("Unable to render the task definition."))?;
    println!("{}", rendered.trim_start_matches("---\n"));
    Ok(())
}

// Render a node's status for the tree and dry-run views.
fn status_summary(status: &TaskStatus) -> String {
    if status.will_run {
        format!("stale: {}", status.reason)
    } else {
        "fresh".to_owned()
    }
}

// Print the dependency tree of a task with staleness annotations.
fn show_tree(entries: &[(graph::PlannedTask, TaskStatus)], node: &graph::TaskNode, depth: usize) {
    let Some((planned, status)) = entries
        .iter()
        .find(|(planned, _)| planned.node == *node)
    else {
        return;
    };

    println!(
        "{}{} ({})",
        "  ".repeat(depth),
        planned.node.to_string().code_str(),
        status_summary(status),
    );
    for dep in &planned.dep_nodes {
        show_tree(entries, dep, depth + 1);
    }
}

// Print the execution plan without running it.
fn show_dry_run(entries: &[(graph::PlannedTask, TaskStatus)]) {
    let stale = entries
        .iter()
        .filter(|(_, status)| status.will_run)
        .collect::<Vec<_>>();
    let fresh = entries
        .iter()
        .filter(|(_, status)| !status.will_run)
        .collect::<Vec<_>>();

    if stale.is_empty() {
        println!("Nothing to run; every task is fresh.");
    } else {
        println!(
            "Will run {} task{}:",
            stale.len(),
            if stale.len() == 1 { "" } else { "s" },
        );
        for (position, (planned, status)) in stale.iter().enumerate() {
            println!(
                "  {}. {} ({})",
                position + 1,
                planned.node.to_string().code_str(),
                status.reason,
            );
            if !status.changed_files.is_empty() {
                println!(
                    "     changed: {}",
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
        }
    }

    if !fresh.is_empty() {
        println!(
            "Will skip {} task{}:",
            fresh.len(),
            if fresh.len() == 1 { "" } else { "s" },
        );
        for (planned, _) in fresh {
            println!("  - {} (fresh)", planned.node.to_string().code_str());
        }
    }
}

// Program entrypoint
#[allow(clippy::too_many_lines)]
fn entry() -> Result<(), Failure> {
    // Determine whether to print colored output.
    colored::control::set_override(atty::is(Stream::Stderr));

    // Parse the command-line arguments. This also sets up the logger.
    let settings = settings()?;

    // Removing the state file doesn't need a parsed recipe, just its location.
    if settings.clean_state {
        let recipe = load_recipe(&settings)?;
        let mut state = StateManager::new(&recipe.project_root);
        if state.remove_file()? {
            info!(
                "Removed {}. Every task will run fresh.",
                state.path().to_string_lossy().code_str(),
            );
        } else {
            info!("No state file to remove.");
        }
        return Ok(());
    }

    let mut recipe = load_recipe(&settings)?;

    // Apply the global runner override.
    if let Some(runner) = &settings.runner_override {
        if !recipe.runners.contains_key(runner) {
            return Err(Failure::Usage(
                format!(
                    "The runner {} is not defined. The available runners are: {}.",
                    runner.code_str(),
                    format::name_list(
                        recipe
                            .runners
                            .keys()
                            .map(|name| name.code_str().to_string())
                            .collect::<Vec<_>>()
                            .as_ref(),
                    ),
                ),
                None,
            ));
        }
        recipe.global_runner_override = runner.clone();
    }

    if settings.list {
        list_tasks(&recipe);
        return Ok(());
    }

    if let Some(task_name) = &settings.show {
        return show_task(&recipe, task_name);
    }

    let options = ExecutorOptions {
        force: settings.force,
        only: settings.only,
        output: settings.output,
    };
    let configs = ConfigRunners::load(
        &current_dir().map_err(failure::system("Unable to determine the working directory."))?,
    );
    let state = StateManager::new(&recipe.project_root);

    if let Some(task_name) = &settings.tree {
        let args = bind_cli_args(&recipe, task_name, &[])?;
        let mut executor = Executor::new(&recipe, state, options, configs)?;
        let entries = executor.plan_statuses(task_name, &args)?;
        // The target is always the last node of the topological order.
        if let Some((planned, _)) = entries.last() {
            let target = planned.node.clone();
            show_tree(&entries, &target, 0);
        }
        return Ok(());
    }

    if let Some(task_name) = &settings.dry_run {
        // With `--dry-run <task> args...`, the first task argument lands in the TASK slot.
        let mut raw_args = settings.task.iter().cloned().collect::<Vec<_>>();
        raw_args.extend(settings.task_args.iter().cloned());
        let args = bind_cli_args(&recipe, task_name, &raw_args)?;
        let mut executor = Executor::new(&recipe, state, options, configs)?;
        let entries = executor.plan_statuses(task_name, &args)?;
        show_dry_run(&entries);
        return Ok(());
    }

    // No verb and no task: list what's available.
    let Some(task_name) = &settings.task else {
        list_tasks(&recipe);
        println!();
        println!("Run a task with {}.", "tt <task> [args...]".code_str());
        return Ok(());
    };

    let args = bind_cli_args(&recipe, task_name, &settings.task_args)?;
    let mut executor = Executor::new(&recipe, state, options, configs)?;
    executor.execute(task_name, &args)?;
    info!("Task {} completed successfully.", task_name.code_str());
    Ok(())
}

// Let the fun begin!
fn main() {
    // Jump to the entrypoint and handle any resulting errors.
    if let Err(e) = entry() {
        error!("{}", e);
        exit(e.exit_code());
    }
}
