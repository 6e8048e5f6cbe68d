use crate::{
    failure,
    failure::Failure,
    format::CodeStr,
    recipe::Runner,
    runner::{run_streaming, CommandRunner, OutputMode},
    script::{ScriptKind, TempScript},
};
use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

// The shell used inside containers. Container runners only declare a Dockerfile; the staged
// script runs under the image's POSIX shell.
const CONTAINER_SHELL: &str = "/bin/sh";

// The image tag a runner's image is built under.
pub fn image_tag(runner_name: &str) -> String {
    format!("tt-runner-{}", runner_name)
}

// Construct a Docker `Command` from an array of arguments.
fn docker_command(args: &[String]) -> Command {
    let mut command = Command::new("docker");
    for arg in args {
        command.arg(arg);
    }
    command
}

// Run a Docker command quietly, with a spinner when stderr is a terminal, and return its
// standard output. The spinner is cleared by a guard so every exit path cleans up the terminal.
fn run_quiet(spinner_message: &str, error: &str, args: &[String]) -> Result<String, Failure> {
    let _guard = if atty::is(Stream::Stderr) {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner());
        spinner.set_message(spinner_message.to_owned());
        spinner.enable_steady_tick(100);
        Some(scopeguard::guard(spinner, |spinner| {
            spinner.finish_and_clear();
        }))
    } else {
        None
    };

    let output = docker_command(args).output().map_err(failure::system(format!(
        "{} Perhaps you don't have Docker installed.",
        error,
    )))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(Failure::System(
            format!(
                "{}\n{}",
                error,
                String::from_utf8_lossy(&output.stderr).trim(),
            ),
            None,
        ))
    }
}

// The stage names and unpinned base images of a Dockerfile. A `FROM` line that names neither a
// previous build stage nor a digest-pinned image makes rebuilds nondeterministic; the caller
// warns about those.
fn unpinned_base_images(dockerfile_contents: &str) -> Vec<String> {
    let mut stage_names = vec![];
    let mut unpinned = vec![];

    for line in dockerfile_contents.lines() {
        let trimmed = line.trim();
        if !trimmed
            .get(..4)
            .is_some_and(|keyword| keyword.eq_ignore_ascii_case("from"))
        {
            continue;
        }

        let mut words = trimmed.split_whitespace().skip(1).filter(|word| {
            // `FROM --platform=... image` is still a FROM line.
            !word.starts_with("--")
        });
        let Some(image) = words.next() else {
            continue;
        };

        // Remember `FROM ... AS name` stages so later stages can refer to them.
        let mut remainder = words;
        if let Some(keyword) = remainder.next() {
            if keyword.eq_ignore_ascii_case("as") {
                if let Some(stage) = remainder.next() {
                    stage_names.push(stage.to_owned());
                }
            }
        }

        if image == "scratch" || stage_names.iter().any(|stage| stage == image) {
            continue;
        }

        if !image.contains("@sha256:") {
            unpinned.push(image.to_owned());
        }
    }

    unpinned
}

// Build a runner's image if needed and return the resulting image ID. The image ID is the
// runtime's content hash, so an unpinned base image that moved shows up as a new ID even when
// the Dockerfile itself is unchanged.
pub fn ensure_image(runner: &Runner, project_root: &Path) -> Result<String, Failure> {
    let tag = image_tag(&runner.name);
    let dockerfile = project_root.join(&runner.dockerfile);
    let context = project_root.join(&runner.context);

    if let Ok(contents) = fs::read_to_string(&dockerfile) {
        for image in unpinned_base_images(&contents) {
            warn!(
                "The base image {} in {} is not pinned by digest; the build may not be \
                 reproducible.",
                image.code_str(),
                runner.dockerfile.code_str(),
            );
        }
    }

    let mut args = vec![
        "build".to_owned(),
        "--tag".to_owned(),
        tag.clone(),
        "--file".to_owned(),
        dockerfile.to_string_lossy().into_owned(),
    ];
    for (name, value) in &runner.build_args {
        args.push("--build-arg".to_owned());
        args.push(format!("{}={}", name, value));
    }
    args.push(context.to_string_lossy().into_owned());

    debug!("Building image {}...", tag.code_str());
    run_quiet(
        "Building container image...",
        &format!("Unable to build the image for runner {}.", runner.name.code_str()),
        &args,
    )?;

    image_id(&tag)
}

// Query the runtime for an image's content hash.
pub fn image_id(image: &str) -> Result<String, Failure> {
    debug!("Inspecting image {}...", image.code_str());
    run_quiet(
        "Inspecting container image...",
        &format!("Unable to inspect the image {}.", image.code_str()),
        &[
            "image".to_owned(),
            "inspect".to_owned(),
            "--format".to_owned(),
            "{{.Id}}".to_owned(),
            image.to_owned(),
        ],
    )
    .map(|output| output.trim().to_owned())
}

// Resolve one `host:container[:options]` volume spec: `~` expands to the home directory and
// relative host paths resolve against the project root.
pub fn parse_volume(spec: &str, project_root: &Path) -> Result<String, Failure> {
    let Some((host, rest)) = spec.split_once(':') else {
        return Err(Failure::User(
            format!(
                "The volume {} has no {} separator between the host and container paths.",
                spec.code_str(),
                ":".code_str(),
            ),
            None,
        ));
    };

    let host_path = if let Some(suffix) = host.strip_prefix("~") {
        let home = dirs::home_dir().ok_or_else(|| {
            Failure::System("Unable to determine the home directory.".to_owned(), None)
        })?;
        home.join(suffix.trim_start_matches('/'))
    } else {
        let host_path = PathBuf::from(host);
        if host_path.is_absolute() {
            host_path
        } else {
            project_root.join(host_path)
        }
    };

    Ok(format!("{}:{}", host_path.to_string_lossy(), rest))
}

// Build the argv for `docker run`: mounts, ports, environment, extra arguments, the user
// mapping, the working directory, the read-only script mount, and finally the image and the
// in-container command.
#[allow(clippy::too_many_arguments)]
pub fn run_args(
    runner: &Runner,
    image: &str,
    project_root: &Path,
    task_working_dir: &str,
    env_vars: &BTreeMap<String, String>,
    script_host_path: &Path,
    script_container_path: &str,
) -> Result<Vec<String>, Failure> {
    let mut args = vec!["run".to_owned(), "--rm".to_owned()];

    for volume in &runner.volumes {
        args.push("--volume".to_owned());
        args.push(parse_volume(volume, project_root)?);
    }

    for port in &runner.ports {
        args.push("--publish".to_owned());
        args.push(port.clone());
    }

    for (name, value) in &runner.env_vars {
        args.push("--env".to_owned());
        args.push(format!("{}={}", name, value));
    }
    for (name, value) in env_vars {
        args.push("--env".to_owned());
        args.push(format!("{}={}", name, value));
    }

    // Extra arguments go before the image tag so they affect the run.
    args.extend(runner.extra_args.iter().cloned());

    // Tasks run as the invoking user unless the runner asks for root. Windows hosts have no
    // UID/GID to map.
    #[cfg(unix)]
    if !runner.run_as_root {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        args.push("--user".to_owned());
        args.push(format!("{}:{}", uid, gid));
    }

    // The container working directory is the runner's, extended by the task's. With neither
    // set, the image's own WORKDIR applies.
    if !runner.working_dir.is_empty() {
        let mut container_dir = runner.working_dir.trim_end_matches('/').to_owned();
        if !task_working_dir.is_empty() && task_working_dir != "." {
            container_dir = format!("{}/{}", container_dir, task_working_dir);
        }
        args.push("--workdir".to_owned());
        args.push(container_dir);
    }

    args.push("--volume".to_owned());
    args.push(format!(
        "{}:{}:ro",
        script_host_path.to_string_lossy(),
        script_container_path,
    ));

    args.push(image.to_owned());
    args.push(CONTAINER_SHELL.to_owned());
    args.push(script_container_path.to_owned());

    Ok(args)
}

// Run commands inside a container built from the runner's Dockerfile. The executor guarantees
// the image exists before this runner is used.
pub struct ContainerRunner {
    pub runner: Runner,
    pub image: String,
    pub project_root: PathBuf,
    pub output: OutputMode,
}

impl CommandRunner for ContainerRunner {
    fn run(
        &self,
        cmd: &str,
        working_dir: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<i32, Failure> {
        let script = TempScript::create(
            cmd,
            &self.runner.preamble,
            "sh",
            ScriptKind {
                extension: ".sh",
                shebang: true,
            },
        )?;

        // A unique in-container path per invocation, so concurrent runs can't collide.
        let suffix: u64 = rand::thread_rng().gen();
        let script_container_path = format!("/tmp/tt-script-{:016x}.sh", suffix);

        let args = run_args(
            &self.runner,
            &self.image,
            &self.project_root,
            working_dir,
            env_vars,
            script.path(),
            &script_container_path,
        )?;

        debug!(
            "Running task in container image {}...",
            self.image.code_str(),
        );
        run_streaming(&mut docker_command(&args), self.output)
    }

    fn describe(&self) -> String {
        format!("container {}", self.runner.name.code_str())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        docker::{image_tag, parse_volume, run_args, unpinned_base_images},
        recipe::Runner,
    };
    use std::{collections::BTreeMap, path::Path};

    fn container_runner() -> Runner {
        let mut runner = Runner::container("ci", "docker/Dockerfile");
        runner.context = "docker".to_owned();
        runner
    }

    #[test]
    fn image_tags_are_stable() {
        assert_eq!(image_tag("ci"), "tt-runner-ci");
        assert_eq!(image_tag("base.ci"), "tt-runner-base.ci");
    }

    #[test]
    fn volume_with_absolute_host_path() {
        let resolved = parse_volume("/data:/data:ro", Path::new("/tmp/project")).unwrap();
        assert_eq!(resolved, "/data:/data:ro");
    }

    #[test]
    fn volume_with_relative_host_path() {
        let resolved = parse_volume(".:/work", Path::new("/tmp/project")).unwrap();
        assert_eq!(resolved, "/tmp/project/.:/work");
    }

    #[test]
    fn volume_without_separator_is_rejected() {
        let result = parse_volume("/data", Path::new("/tmp/project"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains(':'));
    }

    #[test]
    fn volume_with_tilde_expands_home() {
        let resolved = parse_volume("~/cache:/cache", Path::new("/tmp/project")).unwrap();
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with(":/cache"));
    }

    #[test]
    fn run_args_shape() {
        let mut runner = container_runner();
        runner.volumes.push(".:/work".to_owned());
        runner.ports.push("8080:80".to_owned());
        runner
            .env_vars
            .insert("CI".to_owned(), "1".to_owned());
        runner.extra_args.push("--network=host".to_owned());

        let mut env = BTreeMap::new();
        env.insert("TT_CALL_CHAIN".to_owned(), "abc:build".to_owned());

        let args = run_args(
            &runner,
            "tt-runner-ci",
            Path::new("/tmp/project"),
            ".",
            &env,
            Path::new("/tmp/tt-script-host.sh"),
            "/tmp/tt-script-0.sh",
        )
        .unwrap();

        assert_eq!(args[0], "run");
        assert_eq!(args[1], "--rm");
        assert!(args.contains(&"--volume".to_owned()));
        assert!(args.contains(&"/tmp/project/.:/work".to_owned()));
        assert!(args.contains(&"8080:80".to_owned()));
        assert!(args.contains(&"CI=1".to_owned()));
        assert!(args.contains(&"TT_CALL_CHAIN=abc:build".to_owned()));

        // The extra argument must precede the image tag.
        let extra = args.iter().position(|arg| arg == "--network=host").unwrap();
        let image = args.iter().position(|arg| arg == "tt-runner-ci").unwrap();
        assert!(extra < image);

        // The script path is the final positional argument.
        assert_eq!(args.last().unwrap(), "/tmp/tt-script-0.sh");
        assert_eq!(args[args.len() - 2], "/bin/sh");
        assert_eq!(args[args.len() - 3], "tt-runner-ci");
    }

    #[cfg(unix)]
    #[test]
    fn user_mapping_unless_root() {
        let runner = container_runner();
        let args = run_args(
            &runner,
            "tt-runner-ci",
            Path::new("/tmp/project"),
            ".",
            &BTreeMap::new(),
            Path::new("/tmp/s.sh"),
            "/tmp/tt-script-0.sh",
        )
        .unwrap();
        assert!(args.contains(&"--user".to_owned()));

        let mut root_runner = container_runner();
        root_runner.run_as_root = true;
        let args = run_args(
            &root_runner,
            "tt-runner-ci",
            Path::new("/tmp/project"),
            ".",
            &BTreeMap::new(),
            Path::new("/tmp/s.sh"),
            "/tmp/tt-script-0.sh",
        )
        .unwrap();
        assert!(!args.contains(&"--user".to_owned()));
    }

    #[test]
    fn workdir_joins_runner_and_task_dirs() {
        let mut runner = container_runner();
        runner.working_dir = "/workspace".to_owned();
        let args = run_args(
            &runner,
            "tt-runner-ci",
            Path::new("/tmp/project"),
            "app",
            &BTreeMap::new(),
            Path::new("/tmp/s.sh"),
            "/tmp/tt-script-0.sh",
        )
        .unwrap();
        let position = args.iter().position(|arg| arg == "--workdir").unwrap();
        assert_eq!(args[position + 1], "/workspace/app");
    }

    #[test]
    fn workdir_omitted_when_unset() {
        let runner = container_runner();
        let args = run_args(
            &runner,
            "tt-runner-ci",
            Path::new("/tmp/project"),
            "app",
            &BTreeMap::new(),
            Path::new("/tmp/s.sh"),
            "/tmp/tt-script-0.sh",
        )
        .unwrap();
        assert!(!args.contains(&"--workdir".to_owned()));
    }

    #[test]
    fn unpinned_bases_are_detected() {
        let dockerfile = "FROM ubuntu:22.04\nRUN true\n";
        assert_eq!(unpinned_base_images(dockerfile), vec!["ubuntu:22.04"]);
    }

    #[test]
    fn digest_pinned_bases_are_fine() {
        let dockerfile = "FROM ubuntu@sha256:abcdef\n";
        assert!(unpinned_base_images(dockerfile).is_empty());
    }

    #[test]
    fn scratch_and_stages_are_fine() {
        let dockerfile = "FROM golang@sha256:123 AS builder\nFROM builder\nFROM scratch\n";
        assert!(unpinned_base_images(dockerfile).is_empty());
    }

    #[test]
    fn multi_stage_unpinned_detected() {
        let dockerfile = "FROM golang:1.22 AS builder\nFROM alpine:3\n";
        assert_eq!(
            unpinned_base_images(dockerfile),
            vec!["golang:1.22", "alpine:3"],
        );
    }
}
