//! Child process helpers shared by the pipeline crates.
//!
//! Two concerns live here: spawning external tools without flashing a console
//! window on Windows, and resolving a tool name against `PATH` so callers can
//! fail fast before spawning anything.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(windows)]
const EXECUTABLE_SUFFIXES: &[&str] = &["", ".exe", ".cmd", ".bat"];

#[cfg(not(windows))]
const EXECUTABLE_SUFFIXES: &[&str] = &[""];

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for an external tool.
///
/// The command is console-less on Windows and kills its child when dropped, so
/// an abandoned invocation never outlives the task that spawned it.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Resolve a program to an executable path.
///
/// Names containing a path separator are checked as-is; bare names are
/// searched in every `PATH` entry.
pub fn find_program(program: impl AsRef<OsStr>) -> Option<PathBuf> {
    let program = Path::new(program.as_ref());
    if program.as_os_str().is_empty() {
        return None;
    }

    if program.components().count() > 1 || program.is_absolute() {
        return candidates(program).find(|p| is_executable(p));
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| candidates(&dir.join(program)).collect::<Vec<_>>())
        .find(|p| is_executable(p))
}

/// Check whether a program can be resolved.
pub fn is_program_available(program: impl AsRef<OsStr>) -> bool {
    find_program(program).is_some()
}

fn candidates(base: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    EXECUTABLE_SUFFIXES.iter().map(move |suffix| {
        if suffix.is_empty() {
            base.to_path_buf()
        } else {
            let mut name = base.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        }
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_program_is_not_found() {
        assert!(find_program("").is_none());
    }

    #[test]
    fn missing_program_is_not_available() {
        assert!(!is_program_available("definitely-not-a-real-tool-4f1c2"));
    }

    #[cfg(unix)]
    #[test]
    fn finds_shell_by_absolute_path() {
        assert_eq!(find_program("/bin/sh"), Some(PathBuf::from("/bin/sh")));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("process-utils-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("plain.txt");
        std::fs::write(&file, b"data").unwrap();

        assert!(find_program(&file).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
