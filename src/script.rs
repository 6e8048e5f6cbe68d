use crate::{failure, failure::Failure, format::CodeStr};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

// The flavor of script file to stage: the extension and whether a shebang line makes sense.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScriptKind {
    pub extension: &'static str,
    pub shebang: bool,
}

// Pick the script flavor for a shell on the current platform. POSIX shells get `.sh` with a
// shebang; on Windows, `cmd` gets `.bat` and PowerShell gets `.ps1`, neither with a shebang.
pub fn script_kind(shell: &str) -> ScriptKind {
    if cfg!(windows) {
        if shell.to_lowercase().contains("powershell") || shell.to_lowercase().contains("pwsh") {
            ScriptKind {
                extension: ".ps1",
                shebang: false,
            }
        } else {
            ScriptKind {
                extension: ".bat",
                shebang: false,
            }
        }
    } else {
        ScriptKind {
            extension: ".sh",
            shebang: true,
        }
    }
}

// A command materialized as a temporary script file: shebang (where applicable), then the
// runner's preamble, then the command. The file is removed when this value is dropped; removal
// failures are logged and never propagate.
pub struct TempScript {
    path: PathBuf,
}

impl TempScript {
    pub fn create(
        cmd: &str,
        preamble: &str,
        shell: &str,
        kind: ScriptKind,
    ) -> Result<Self, Failure> {
        let mut contents = String::new();
        if kind.shebang && !cmd.starts_with("#!") {
            contents.push_str(&format!("#!/usr/bin/env {}\n", shell));
        }
        if !preamble.is_empty() {
            contents.push_str(preamble);
            if !preamble.ends_with('\n') {
                contents.push('\n');
            }
        }
        contents.push_str(cmd);
        if !cmd.ends_with('\n') {
            contents.push('\n');
        }

        let mut file = tempfile::Builder::new()
            .prefix("tt-script-")
            .suffix(kind.extension)
            .tempfile()
            .map_err(failure::system("Unable to create a temporary script."))?;

        file.write_all(contents.as_bytes())
            .map_err(failure::system("Unable to write the temporary script."))?;

        let (_, path) = file
            .keep()
            .map_err(failure::system("Unable to keep the temporary script."))?;

        // The shell program receives the script as an argument, but a shebang-bearing script
        // should also be directly executable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if kind.shebang {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(
                    failure::system("Unable to make the temporary script executable."),
                )?;
            }
        }

        Ok(TempScript { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempScript {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            warn!(
                "Unable to remove the temporary script {}. Reason: {}",
                self.path.to_string_lossy().code_str(),
                error,
            );
        }
    }
}
