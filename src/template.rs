use crate::{failure::Failure, format, format::CodeStr, recipe::Task};
use regex_lite::Regex;
use std::{
    collections::{BTreeMap, HashSet},
    env,
    path::{Path, PathBuf},
    process::Command,
};

// Matches `{{ reference }}` with tolerant whitespace, where the reference is a dotted chain of
// identifiers. Each substitution pass only rewrites the references that belong to its own
// family; everything else passes through untouched for a later pass.
lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(
        r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\s*\.\s*[A-Za-z0-9_][A-Za-z0-9_-]*)*)\s*\}\}",
    )
    .unwrap();
}

// How a recipe variable gets its value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VariableSpec {
    // A literal string, possibly containing placeholders of any family.
    Literal(String),

    // `env:` — the value of an environment variable, with an optional fallback.
    Env {
        var: String,
        default: Option<String>,
    },

    // `eval:` — the trimmed standard output of a shell command run in the project root.
    Eval(String),

    // `read:` — the trimmed contents of a file relative to the project root.
    Read(PathBuf),
}

impl VariableSpec {
    // The raw text of the spec, scanned for `var.*` references when ordering resolution.
    fn raw_text(&self) -> &str {
        match self {
            VariableSpec::Literal(text) | VariableSpec::Eval(text) => text,
            VariableSpec::Env { default, .. } => default.as_deref().unwrap_or(""),
            VariableSpec::Read(path) => path.to_str().unwrap_or(""),
        }
    }
}

// Walk the placeholders in `text`, letting `matcher` decide per reference whether to substitute.
// The matcher receives the trimmed segments of the dotted reference and the full matched text
// (for diagnostics); returning `Ok(None)` leaves the reference for a later pass.
fn substitute<F>(text: &str, mut matcher: F) -> Result<String, Failure>
where
    F: FnMut(&[&str], &str) -> Result<Option<String>, Failure>,
{
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    for captures in PLACEHOLDER.captures_iter(text) {
        // The `unwrap`s are safe because both groups participate in every match.
        let whole = captures.get(0).unwrap();
        let reference = captures.get(1).unwrap().as_str();
        let segments = reference.split('.').map(str::trim).collect::<Vec<_>>();

        result.push_str(&text[last..whole.start()]);
        match matcher(&segments, whole.as_str())? {
            Some(replacement) => result.push_str(&replacement),
            None => result.push_str(whole.as_str()),
        }
        last = whole.end();
    }

    result.push_str(&text[last..]);
    Ok(result)
}

fn unknown_name_failure(template: &str, kind: &str, available: &[String]) -> Failure {
    let mut names = available.to_vec();
    names.sort();
    Failure::User(
        format!(
            "The template {} refers to an unknown {}. The available names are: {}.",
            template.code_str(),
            kind,
            format::name_list(
                names
                    .iter()
                    .map(|name| name.code_str().to_string())
                    .collect::<Vec<_>>()
                    .as_ref(),
            ),
        ),
        None,
    )
}

// Substitute `{{ var.name }}` references.
pub fn substitute_variables(
    text: &str,
    variables: &BTreeMap<String, String>,
) -> Result<String, Failure> {
    substitute(text, |segments, template| match segments {
        // Variable names may be dotted when they come from imports.
        ["var", rest @ ..] if !rest.is_empty() => {
            let name = rest.join(".");
            variables.get(&name).cloned().map(Some).ok_or_else(|| {
                unknown_name_failure(
                    template,
                    "variable",
                    &variables.keys().cloned().collect::<Vec<_>>(),
                )
            })
        }
        _ => Ok(None),
    })
}

// Substitute `{{ arg.name }}` references. Exported arguments live in the child environment, not
// in templates, so referencing one here is an error.
pub fn substitute_arguments(
    text: &str,
    args: &BTreeMap<String, String>,
    exported: &HashSet<String>,
) -> Result<String, Failure> {
    substitute(text, |segments, template| match segments {
        ["arg", name] => {
            if exported.contains(*name) {
                return Err(Failure::User(
                    format!(
                        "The template {} refers to the exported argument {}. Exported arguments \
                         are injected as environment variables; use {} in the command instead.",
                        template.code_str(),
                        (*name).code_str(),
                        format!("${}", name).code_str(),
                    ),
                    None,
                ));
            }
            args.get(*name).cloned().map(Some).ok_or_else(|| {
                unknown_name_failure(
                    template,
                    "argument",
                    &args.keys().cloned().collect::<Vec<_>>(),
                )
            })
        }
        _ => Ok(None),
    })
}

// Substitute `{{ env.NAME }}` references from the process environment at expansion time.
pub fn substitute_environment(text: &str) -> Result<String, Failure> {
    substitute(text, |segments, template| match segments {
        ["env", name] => env::var(name).map(Some).map_err(|_| {
            Failure::User(
                format!(
                    "The template {} refers to the environment variable {}, which is not set.",
                    template.code_str(),
                    (*name).code_str(),
                ),
                None,
            )
        }),
        _ => Ok(None),
    })
}

// Substitute `{{ tt.name }}` references from the closed set of built-in variables.
pub fn substitute_builtins(
    text: &str,
    builtins: &BTreeMap<String, String>,
) -> Result<String, Failure> {
    substitute(text, |segments, template| match segments {
        ["tt", name] => builtins.get(*name).cloned().map(Some).ok_or_else(|| {
            unknown_name_failure(
                template,
                "built-in variable",
                &builtins.keys().cloned().collect::<Vec<_>>(),
            )
        }),
        _ => Ok(None),
    })
}

// Substitute `{{ self.inputs.name }}` and `{{ self.outputs.name }}` references with the task's
// own named input/output patterns.
pub fn substitute_self_refs(text: &str, task: &Task) -> Result<String, Failure> {
    substitute(text, |segments, template| match segments {
        ["self", field, name] if *field == "inputs" || *field == "outputs" => {
            let entry = if *field == "inputs" {
                task.named_input(name)
            } else {
                task.named_output(name)
            };
            entry.map(|entry| Some(entry.pattern.clone())).ok_or_else(|| {
                let entries = if *field == "inputs" {
                    &task.inputs
                } else {
                    &task.outputs
                };
                let available = entries
                    .iter()
                    .filter_map(|entry| entry.name.clone())
                    .collect::<Vec<_>>();
                unknown_name_failure(
                    template,
                    &format!("named {} entry of task {}", field, task.name.code_str()),
                    &available,
                )
            })
        }
        _ => Ok(None),
    })
}

// Substitute `{{ dep.TASK.outputs.NAME }}` references. The lookup closure maps a (dependency
// name, output name) pair to the replacement path; it fails when the dependency is not declared
// or the output is not named.
pub fn substitute_dep_refs<F>(text: &str, mut lookup: F) -> Result<String, Failure>
where
    F: FnMut(&str, &str, &str) -> Result<String, Failure>,
{
    substitute(text, |segments, template| {
        // The dependency name itself may be dotted (import namespacing), so the shape is
        // `dep . <task segments...> . outputs . <name>`.
        if segments.len() >= 4 && segments[0] == "dep" && segments[segments.len() - 2] == "outputs"
        {
            let task = segments[1..segments.len() - 2].join(".");
            let name = segments[segments.len() - 1];
            lookup(&task, name, template).map(Some)
        } else {
            Ok(None)
        }
    })
}

// The closed set of git queries available as `{{ git.name }}`.
const GIT_QUERIES: &[(&str, &[&str])] = &[
    ("branch", &["rev-parse", "--abbrev-ref", "HEAD"]),
    ("commit", &["rev-parse", "HEAD"]),
    ("commit_short", &["rev-parse", "--short", "HEAD"]),
    ("describe", &["describe", "--tags"]),
    ("is_dirty", &["diff-index", "--quiet", "HEAD"]),
    ("tag", &["describe", "--tags", "--abbrev=0"]),
    ("user_email", &["config", "user.email"]),
    ("user_name", &["config", "user.name"]),
];

// Substitute `{{ git.name }}` references by shelling out to git in `working_dir`. Results are
// memoized in `cache`, which the executor shares across every task in one invocation.
pub fn substitute_git(
    text: &str,
    working_dir: &Path,
    cache: &mut BTreeMap<String, String>,
) -> Result<String, Failure> {
    substitute(text, |segments, template| match segments {
        ["git", name] => {
            if let Some(value) = cache.get(*name) {
                return Ok(Some(value.clone()));
            }

            let Some((_, git_args)) = GIT_QUERIES.iter().find(|(query, _)| query == name) else {
                return Err(unknown_name_failure(
                    template,
                    "git variable",
                    &GIT_QUERIES
                        .iter()
                        .map(|(query, _)| (*query).to_owned())
                        .collect::<Vec<_>>(),
                ));
            };

            let output = Command::new("git")
                .args(*git_args)
                .current_dir(working_dir)
                .output()
                .map_err(crate::failure::user(format!(
                    "Unable to run git for {}.",
                    template.code_str(),
                )))?;

            // `is_dirty` is answered by the exit code rather than the output.
            let value = if *name == "is_dirty" {
                if output.status.success() { "false" } else { "true" }.to_owned()
            } else if output.status.success() {
                String::from_utf8_lossy(&output.stdout).trim().to_owned()
            } else {
                return Err(Failure::User(
                    format!(
                        "Unable to resolve {}: {}",
                        template.code_str(),
                        String::from_utf8_lossy(&output.stderr).trim(),
                    ),
                    None,
                ));
            };

            cache.insert((*name).to_owned(), value.clone());
            Ok(Some(value))
        }
        _ => Ok(None),
    })
}

// The names of the `var.*` references appearing in `text`, used to order variable resolution.
fn variable_references(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|captures| {
            let segments = captures
                .get(1)
                .unwrap()
                .as_str()
                .split('.')
                .map(str::trim)
                .collect::<Vec<_>>();
            match segments.as_slice() {
                ["var", rest @ ..] if !rest.is_empty() => Some(rest.join(".")),
                _ => None,
            }
        })
        .collect()
}

// Rewrite `var` and `dep` references through a name-rewriting function. The parser uses this to
// apply import namespacing to template text in imported files; other families are untouched.
pub fn rewrite_namespaced_refs<F>(text: &str, rewrite_name: F) -> Result<String, Failure>
where
    F: Fn(&str) -> String,
{
    substitute(text, |segments, _| match segments {
        ["var", rest @ ..] if !rest.is_empty() => Ok(Some(format!(
            "{{{{ var.{} }}}}",
            rewrite_name(&rest.join(".")),
        ))),
        ["dep", middle @ .., outputs, name] if *outputs == "outputs" && !middle.is_empty() => {
            Ok(Some(format!(
                "{{{{ dep.{}.outputs.{} }}}}",
                rewrite_name(&middle.join(".")),
                name,
            )))
        }
        _ => Ok(None),
    })
}

// Check that the variable references form a DAG over defined names, without evaluating any
// delayed specs. Used at parse time; `resolve_variables` performs the same walk when the values
// are actually needed.
pub fn check_variable_graph(variables: &[(String, VariableSpec)]) -> Result<(), Failure> {
    let defined = variables
        .iter()
        .map(|(name, _)| name.clone())
        .collect::<HashSet<_>>();

    let mut references = BTreeMap::new();
    for (name, spec) in variables {
        let refs = variable_references(spec.raw_text());
        for reference in &refs {
            if !defined.contains(reference) {
                return Err(Failure::User(
                    format!(
                        "Variable {} refers to {}, which is not defined.",
                        name.code_str(),
                        reference.code_str(),
                    ),
                    None,
                ));
            }
        }
        references.insert(name.clone(), refs);
    }

    fn visit(
        name: &str,
        references: &BTreeMap<String, Vec<String>>,
        done: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Result<(), Failure> {
        if done.contains(name) {
            return Ok(());
        }

        if let Some(position) = stack.iter().position(|entry| entry == name) {
            let mut cycle = stack[position..].to_vec();
            cycle.push(name.to_owned());
            return Err(Failure::User(
                format!(
                    "The variable references are cyclic: {}.",
                    cycle
                        .iter()
                        .map(|entry| entry.code_str().to_string())
                        .collect::<Vec<_>>()
                        .join(" \u{2192} "),
                ),
                None,
            ));
        }

        stack.push(name.to_owned());
        for reference in &references[name] {
            visit(reference, references, done, stack)?;
        }
        stack.pop();
        done.insert(name.to_owned());
        Ok(())
    }

    let mut done = HashSet::new();
    let mut stack = vec![];
    for (name, _) in variables {
        visit(name, &references, &mut done, &mut stack)?;
    }

    Ok(())
}

// Evaluate a delayed variable spec into its raw string value.
fn evaluate_spec(name: &str, spec: &VariableSpec, project_root: &Path) -> Result<String, Failure> {
    match spec {
        VariableSpec::Literal(text) => Ok(text.clone()),
        VariableSpec::Env { var, default } => match env::var(var) {
            Ok(value) => Ok(value),
            Err(_) => default.clone().ok_or_else(|| {
                Failure::User(
                    format!(
                        "Variable {} reads the environment variable {}, which is not set and has \
                         no default.",
                        name.code_str(),
                        var.code_str(),
                    ),
                    None,
                )
            }),
        },
        VariableSpec::Eval(command) => {
            #[cfg(unix)]
            let output = Command::new("sh")
                .args(["-c", command])
                .current_dir(project_root)
                .output();
            #[cfg(windows)]
            let output = Command::new("cmd")
                .args(["/C", command])
                .current_dir(project_root)
                .output();

            let output = output.map_err(crate::failure::user(format!(
                "Unable to evaluate variable {}.",
                name.code_str(),
            )))?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_owned())
            } else {
                Err(Failure::User(
                    format!(
                        "Evaluation of variable {} failed: {}",
                        name.code_str(),
                        String::from_utf8_lossy(&output.stderr).trim(),
                    ),
                    None,
                ))
            }
        }
        VariableSpec::Read(path) => {
            let full_path = project_root.join(path);
            std::fs::read_to_string(&full_path)
                .map(|contents| contents.trim_end().to_owned())
                .map_err(crate::failure::user(format!(
                    "Variable {} reads {}, which could not be read.",
                    name.code_str(),
                    full_path.to_string_lossy().code_str(),
                )))
        }
    }
}

// Resolve every recipe variable to its final string value. References between variables are
// topologically ordered; cycles (including self-reference) and unknown references are errors.
// Placeholders of other families survive inside the resolved values for the later passes.
pub fn resolve_variables(
    variables: &[(String, VariableSpec)],
    project_root: &Path,
) -> Result<BTreeMap<String, String>, Failure> {
    let defined = variables
        .iter()
        .map(|(name, _)| name.clone())
        .collect::<HashSet<_>>();

    // Check references and build the dependency relation.
    let mut references = BTreeMap::new();
    for (name, spec) in variables {
        let refs = variable_references(spec.raw_text());
        for reference in &refs {
            if !defined.contains(reference) {
                return Err(Failure::User(
                    format!(
                        "Variable {} refers to {}, which is not defined.",
                        name.code_str(),
                        reference.code_str(),
                    ),
                    None,
                ));
            }
        }
        references.insert(name.clone(), refs);
    }

    // Depth-first resolution with an active stack for cycle reporting.
    let mut resolved: BTreeMap<String, String> = BTreeMap::new();
    let mut stack: Vec<String> = vec![];

    fn resolve_one(
        name: &str,
        variables: &[(String, VariableSpec)],
        references: &BTreeMap<String, Vec<String>>,
        resolved: &mut BTreeMap<String, String>,
        stack: &mut Vec<String>,
        project_root: &Path,
    ) -> Result<(), Failure> {
        if resolved.contains_key(name) {
            return Ok(());
        }

        if let Some(position) = stack.iter().position(|entry| entry == name) {
            let mut cycle = stack[position..].to_vec();
            cycle.push(name.to_owned());
            return Err(Failure::User(
                format!(
                    "The variable references are cyclic: {}.",
                    cycle
                        .iter()
                        .map(|entry| entry.code_str().to_string())
                        .collect::<Vec<_>>()
                        .join(" \u{2192} "),
                ),
                None,
            ));
        }

        stack.push(name.to_owned());
        for reference in &references[name] {
            resolve_one(reference, variables, references, resolved, stack, project_root)?;
        }
        stack.pop();

        // The `unwrap` is safe because every name reaching this point is a defined variable.
        let (_, spec) = variables
            .iter()
            .find(|(candidate, _)| candidate == name)
            .unwrap();
        let raw = evaluate_spec(name, spec, project_root)?;
        let value = substitute_variables(&raw, resolved)?;
        resolved.insert(name.to_owned(), value);
        Ok(())
    }

    for (name, _) in variables {
        resolve_one(
            name,
            variables,
            &references,
            &mut resolved,
            &mut stack,
            project_root,
        )?;
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use crate::{
        recipe::{IoEntry, Task},
        template::{
            resolve_variables, substitute_arguments, substitute_builtins, substitute_dep_refs,
            substitute_environment, substitute_self_refs, substitute_variables, VariableSpec,
        },
    };
    use std::{
        collections::{BTreeMap, HashSet},
        env,
        path::Path,
    };

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn variables_substituted() {
        let variables = map(&[("region", "eu-west-1")]);
        assert_eq!(
            substitute_variables("deploy to {{ var.region }}", &variables).unwrap(),
            "deploy to eu-west-1",
        );
    }

    #[test]
    fn whitespace_is_tolerated() {
        let variables = map(&[("region", "eu-west-1")]);
        assert_eq!(
            substitute_variables("{{var.region}} and {{  var . region  }}", &variables).unwrap(),
            "eu-west-1 and eu-west-1",
        );
    }

    #[test]
    fn other_families_pass_through() {
        let variables = map(&[("region", "eu-west-1")]);
        assert_eq!(
            substitute_variables("{{ var.region }} {{ arg.mode }}", &variables).unwrap(),
            "eu-west-1 {{ arg.mode }}",
        );
    }

    #[test]
    fn unknown_variable_lists_available_names() {
        let variables = map(&[("region", "eu-west-1"), ("zone", "a")]);
        let result = substitute_variables("{{ var.regoin }}", &variables);
        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("regoin"));
        assert!(message.contains("region"));
        assert!(message.contains("zone"));
    }

    #[test]
    fn arguments_substituted() {
        let args = map(&[("mode", "debug")]);
        assert_eq!(
            substitute_arguments("build --{{ arg.mode }}", &args, &HashSet::new()).unwrap(),
            "build --debug",
        );
    }

    #[test]
    fn exported_argument_rejected() {
        let args = map(&[]);
        let exported = HashSet::from(["PORT".to_owned()]);
        let result = substitute_arguments("listen {{ arg.PORT }}", &args, &exported);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exported"));
    }

    #[test]
    fn environment_substituted() {
        env::set_var("TT_TEMPLATE_TEST_1", "present");
        assert_eq!(
            substitute_environment("value: {{ env.TT_TEMPLATE_TEST_1 }}").unwrap(),
            "value: present",
        );
    }

    #[test]
    fn missing_environment_is_an_error() {
        env::remove_var("TT_TEMPLATE_TEST_2");
        let result = substitute_environment("{{ env.TT_TEMPLATE_TEST_2 }}");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("TT_TEMPLATE_TEST_2"));
    }

    #[test]
    fn builtins_substituted() {
        let builtins = map(&[("task_name", "build")]);
        assert_eq!(
            substitute_builtins("running {{ tt.task_name }}", &builtins).unwrap(),
            "running build",
        );
    }

    #[test]
    fn unknown_builtin_lists_available_names() {
        let builtins = map(&[("task_name", "build"), ("project_root", "/p")]);
        let result = substitute_builtins("{{ tt.bogus }}", &builtins);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("task_name"));
    }

    #[test]
    fn self_refs_substituted() {
        let mut task = Task::new("build", "true");
        task.inputs.push(IoEntry::named("source", "src/*.c"));
        task.outputs.push(IoEntry::named("binary", "bin/app"));
        assert_eq!(
            substitute_self_refs(
                "cc {{ self.inputs.source }} -o {{ self.outputs.binary }}",
                &task,
            )
            .unwrap(),
            "cc src/*.c -o bin/app",
        );
    }

    #[test]
    fn self_ref_of_anonymous_entry_is_an_error() {
        let mut task = Task::new("build", "true");
        task.outputs.push(IoEntry::anonymous("bin/app"));
        task.outputs.push(IoEntry::named("map", "bin/app.map"));
        let result = substitute_self_refs("{{ self.outputs.app }}", &task);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("map"));
    }

    #[test]
    fn dep_refs_parse_dotted_task_names() {
        let mut seen = vec![];
        substitute_dep_refs("cat {{ dep.base.gen.outputs.config }}", |task, name, _| {
            seen.push((task.to_owned(), name.to_owned()));
            Ok("generated/config.txt".to_owned())
        })
        .unwrap();
        assert_eq!(seen, vec![("base.gen".to_owned(), "config".to_owned())]);
    }

    #[test]
    fn literal_variables_resolve() {
        let variables = vec![(
            "greeting".to_owned(),
            VariableSpec::Literal("hello".to_owned()),
        )];
        let resolved = resolve_variables(&variables, Path::new(".")).unwrap();
        assert_eq!(resolved["greeting"], "hello");
    }

    #[test]
    fn variables_may_reference_variables() {
        let variables = vec![
            (
                "bucket".to_owned(),
                VariableSpec::Literal("{{ var.prefix }}-artifacts".to_owned()),
            ),
            ("prefix".to_owned(), VariableSpec::Literal("acme".to_owned())),
        ];
        let resolved = resolve_variables(&variables, Path::new(".")).unwrap();
        assert_eq!(resolved["bucket"], "acme-artifacts");
    }

    #[test]
    fn variable_self_reference_is_cyclic() {
        let variables = vec![(
            "loop".to_owned(),
            VariableSpec::Literal("{{ var.loop }}".to_owned()),
        )];
        let result = resolve_variables(&variables, Path::new("."));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cyclic"));
    }

    #[test]
    fn variable_cycle_reported() {
        let variables = vec![
            (
                "a".to_owned(),
                VariableSpec::Literal("{{ var.b }}".to_owned()),
            ),
            (
                "b".to_owned(),
                VariableSpec::Literal("{{ var.a }}".to_owned()),
            ),
        ];
        let result = resolve_variables(&variables, Path::new("."));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cyclic"));
    }

    #[test]
    fn unknown_variable_reference_rejected() {
        let variables = vec![(
            "a".to_owned(),
            VariableSpec::Literal("{{ var.ghost }}".to_owned()),
        )];
        let result = resolve_variables(&variables, Path::new("."));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("ghost"));
    }

    #[test]
    fn env_spec_uses_default() {
        env::remove_var("TT_TEMPLATE_TEST_3");
        let variables = vec![(
            "level".to_owned(),
            VariableSpec::Env {
                var: "TT_TEMPLATE_TEST_3".to_owned(),
                default: Some("info".to_owned()),
            },
        )];
        let resolved = resolve_variables(&variables, Path::new(".")).unwrap();
        assert_eq!(resolved["level"], "info");
    }

    #[test]
    fn env_spec_without_default_requires_value() {
        env::remove_var("TT_TEMPLATE_TEST_4");
        let variables = vec![(
            "level".to_owned(),
            VariableSpec::Env {
                var: "TT_TEMPLATE_TEST_4".to_owned(),
                default: None,
            },
        )];
        assert!(resolve_variables(&variables, Path::new(".")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn eval_spec_captures_stdout() {
        let variables = vec![(
            "word".to_owned(),
            VariableSpec::Eval("echo resolved".to_owned()),
        )];
        let resolved = resolve_variables(&variables, Path::new(".")).unwrap();
        assert_eq!(resolved["word"], "resolved");
    }

    #[test]
    fn read_spec_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version.txt"), "1.2.3\n").unwrap();
        let variables = vec![(
            "version".to_owned(),
            VariableSpec::Read("version.txt".into()),
        )];
        let resolved = resolve_variables(&variables, dir.path()).unwrap();
        assert_eq!(resolved["version"], "1.2.3");
    }
}
