use async_trait::async_trait;
use std::{
    ffi::OsStr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};

/// Runs external packet-filter tooling.
#[async_trait]
pub trait Exec: Send + Sync {
    /// Runs `cmd` with `args`, feeding it `stdin` if provided, and returns its standard output.
    async fn exec(&self, cmd: &Path, args: &[&str], stdin: Option<&str>)
        -> Result<String, ExecError>;
}

/// Runs commands as child processes.
#[derive(Copy, Clone, Debug, Default)]
pub struct Process(());

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to run {cmd}: {source}")]
    Io {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} failed ({status}): {stderr}")]
    Failed {
        cmd: String,
        status: String,
        stderr: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0} not found in PATH")]
pub struct MissingTool(pub &'static str);

/// Finds an executable named `tool` in `PATH`.
pub fn lookup(tool: &'static str) -> Result<PathBuf, MissingTool> {
    let path = std::env::var_os("PATH").ok_or(MissingTool(tool))?;
    lookup_in(&path, tool)
}

fn lookup_in(path: &OsStr, tool: &'static str) -> Result<PathBuf, MissingTool> {
    std::env::split_paths(path)
        .map(|dir| dir.join(tool))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
        .ok_or(MissingTool(tool))
}

// === impl Process ===

#[async_trait]
impl Exec for Process {
    async fn exec(
        &self,
        cmd: &Path,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, ExecError> {
        let name = cmd.display().to_string();
        let io = |source| ExecError::Io {
            cmd: name.clone(),
            source,
        };

        let mut child = Command::new(cmd)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(io)?;
            // Closing the pipe lets the child see the end of its input.
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(io)?;
        if !output.status.success() {
            return Err(ExecError::Failed {
                cmd: name,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_tools_on_path() {
        let path = std::ffi::OsString::from("/nonexistent:/bin:/usr/bin");
        assert!(lookup_in(&path, "sh").is_ok());
        assert_eq!(
            lookup_in(&path, "romana-no-such-tool"),
            Err(MissingTool("romana-no-such-tool"))
        );
    }

    #[tokio::test]
    async fn feeds_stdin_and_reads_stdout() {
        let sh = lookup("sh").expect("sh must be installed");
        let out = Process::default()
            .exec(&sh, &["-c", "cat"], Some("*filter\nCOMMIT\n"))
            .await
            .expect("cat must succeed");
        assert_eq!(out, "*filter\nCOMMIT\n");
    }

    #[tokio::test]
    async fn reports_stderr_of_failed_commands() {
        let sh = lookup("sh").expect("sh must be installed");
        let err = Process::default()
            .exec(&sh, &["-c", "echo rejected >&2; exit 2"], None)
            .await
            .unwrap_err();
        match err {
            ExecError::Failed { stderr, .. } => assert_eq!(stderr, "rejected"),
            err => panic!("unexpected error: {err}"),
        }
    }
}
