use crate::{
    failure,
    failure::Failure,
    format::CodeStr,
    script::{script_kind, TempScript},
};
use std::{
    collections::BTreeMap,
    io,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    str::FromStr,
    thread,
};

// What to do with a task's stdout and stderr: stream them, drop them, or hold them back and
// replay them only when the task fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    All,
    None,
    OnErr,
}

impl FromStr for OutputMode {
    type Err = Failure;

    fn from_str(value: &str) -> Result<Self, Failure> {
        match value {
            "all" => Ok(OutputMode::All),
            "none" => Ok(OutputMode::None),
            "on-err" => Ok(OutputMode::OnErr),
            _ => Err(Failure::Usage(
                format!(
                    "{} is not an output mode; expected {}, {}, or {}.",
                    value.code_str(),
                    "all".code_str(),
                    "none".code_str(),
                    "on-err".code_str(),
                ),
                None,
            )),
        }
    }
}

// A task execution backend. The command arrives fully template-expanded; the runner stages it as
// a script, executes it, and reports the exit code. Runners never interpret a non-zero exit as
// an error themselves; the executor owns that policy.
pub trait CommandRunner {
    // `working_dir` is relative to the project root.
    fn run(
        &self,
        cmd: &str,
        working_dir: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<i32, Failure>;

    fn describe(&self) -> String;
}

// Where one of the child's streams should end up.
enum Sink {
    Stdout,
    Stderr,
}

// Pump one child pipe on its own thread. Two of these run per task so neither pipe can fill up
// and deadlock the child. Returns the captured bytes when `capture` is set (on-err mode).
fn pump<R: Read + Send + 'static>(
    source: R,
    sink: Sink,
    echo: bool,
    capture: bool,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut source = source;
        let mut captured = vec![];
        let mut buffer = [0_u8; 8192];

        loop {
            match source.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    let chunk = &buffer[..count];
                    if echo {
                        let result = match sink {
                            Sink::Stdout => io::stdout()
                                .write_all(chunk)
                                .and_then(|()| io::stdout().flush()),
                            Sink::Stderr => io::stderr()
                                .write_all(chunk)
                                .and_then(|()| io::stderr().flush()),
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                    if capture {
                        captured.extend_from_slice(chunk);
                    }
                }
            }
        }

        captured
    })
}

// Spawn a prepared command, stream or buffer its output per the mode, wait for it, and return
// its exit code. Shared by the shell and container runners.
pub fn run_streaming(command: &mut Command, output: OutputMode) -> Result<i32, Failure> {
    if output == OutputMode::None {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }
    command.stdin(Stdio::null());

    let mut child = command
        .spawn()
        .map_err(failure::system("Unable to spawn the task process."))?;

    let echo = output == OutputMode::All;
    let capture = output == OutputMode::OnErr;

    let stdout_thread = child
        .stdout
        .take()
        .map(|pipe| pump(pipe, Sink::Stdout, echo, capture));
    let stderr_thread = child
        .stderr
        .take()
        .map(|pipe| pump(pipe, Sink::Stderr, echo, capture));

    // The reader threads exit when their pipes close, which happens no later than child exit.
    let captured_stdout = stdout_thread.map(|handle| handle.join().unwrap_or_default());
    let captured_stderr = stderr_thread.map(|handle| handle.join().unwrap_or_default());

    let status = child
        .wait()
        .map_err(failure::system("Unable to wait for the task process."))?;
    let code = status.code().unwrap_or(1);

    // In on-err mode, the held-back output is replayed only when the task failed.
    if capture && code != 0 {
        if let Some(bytes) = captured_stdout {
            drop(io::stdout().write_all(&bytes));
        }
        if let Some(bytes) = captured_stderr {
            drop(io::stderr().write_all(&bytes));
        }
    }

    Ok(code)
}

// Run commands through a local shell program, e.g. `bash -e <script>`.
pub struct ShellRunner {
    pub shell: String,
    pub args: Vec<String>,
    pub preamble: String,
    pub project_root: PathBuf,
    pub output: OutputMode,
}

impl CommandRunner for ShellRunner {
    fn run(
        &self,
        cmd: &str,
        working_dir: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<i32, Failure> {
        let script = TempScript::create(cmd, &self.preamble, &self.shell, script_kind(&self.shell))?;

        let mut command = Command::new(&self.shell);
        command
            .args(&self.args)
            .arg(script.path())
            .current_dir(resolve_working_dir(&self.project_root, working_dir))
            .envs(env_vars);

        run_streaming(&mut command, self.output)
    }

    fn describe(&self) -> String {
        format!("shell {}", self.shell.code_str())
    }
}

// Resolve a project-root-relative working directory to an absolute host path.
pub fn resolve_working_dir(project_root: &Path, working_dir: &str) -> PathBuf {
    if working_dir.is_empty() || working_dir == "." {
        project_root.to_owned()
    } else {
        project_root.join(working_dir)
    }
}
