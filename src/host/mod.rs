// src/host/mod.rs

//! Side effects on the host OS: external tools, ownership, cgroups, quotas
//! and TLS material.
//!
//! Every child process is spawned from an argv array (no shell) and capped by
//! a wall-time deadline.

pub mod cgroup;
pub mod quota;
pub mod tls;
pub mod users;

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{CoreError, Result};

/// Failure to run a child process at all
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {timeout_secs}s")]
    Timeout {
        program: String,
        timeout_secs: u64,
    },
}

/// Captured result of a finished child process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts any exit code outside `ok_codes` (and 0) into `OsExec`
    pub fn check(self, program: &str, ok_codes: &[i32]) -> Result<CommandOutput> {
        match self.code {
            Some(0) => Ok(self),
            Some(code) if ok_codes.contains(&code) => Ok(self),
            code => Err(CoreError::OsExec {
                program: program.to_string(),
                code,
                stderr: self.stderr.trim().to_string(),
            }),
        }
    }
}

/// Operations the core performs against the host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Runs `program` with `args` under the configured deadline
    async fn run(&self, program: &str, args: Vec<String>) -> std::result::Result<CommandOutput, HostError>;

    /// Changes owner and/or group of a single path without following symlinks
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;
}

/// The real host
#[derive(Debug, Clone)]
pub struct LinuxHost {
    /// Deadline for every child process
    exec_timeout: Duration,
}

impl LinuxHost {
    pub fn new(exec_timeout: Duration) -> Self {
        Self { exec_timeout }
    }
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn run(&self, program: &str, args: Vec<String>) -> std::result::Result<CommandOutput, HostError> {
        trace!("Command: {} {:?}", program, args);
        let started = Instant::now();

        let child = tokio::process::Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the future on timeout kills the child
        let output = tokio::time::timeout(self.exec_timeout, child.wait_with_output())
            .await
            .map_err(|_| HostError::Timeout {
                program: program.to_string(),
                timeout_secs: self.exec_timeout.as_secs(),
            })?
            .map_err(|source| HostError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            program,
            code = ?result.code,
            duration_ms = result.duration_ms,
            "Command finished"
        );
        Ok(result)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        fchownat(
            None,
            path,
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
            FchownatFlags::NoFollowSymlink,
        )
        .map_err(io::Error::from)
    }
}

/// Runs a command and maps spawn failures and timeouts into `CoreError`
pub async fn run_checked(
    host: &dyn HostOps,
    program: &str,
    args: &[&str],
    ok_codes: &[i32],
) -> Result<CommandOutput> {
    let args = args.iter().map(|a| a.to_string()).collect();
    host.run(program, args).await?.check(program, ok_codes)
}

/// Chowns `root` and everything below it; symlinks are changed, not followed
pub fn chown_recursive(host: &dyn HostOps, root: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            CoreError::io(&path, e.into())
        })?;
        host.chown(entry.path(), uid, gid)
            .map_err(|e| CoreError::io(entry.path(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mockall::predicate::*;

    #[tokio::test]
    async fn linux_host_captures_output() {
        let host = LinuxHost::new(Duration::from_secs(5));
        let output = host
            .run("sh", vec!["-c".into(), "echo out; echo err >&2; exit 3".into()])
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn linux_host_enforces_deadline() {
        let host = LinuxHost::new(Duration::from_millis(100));
        let err = host.run("sleep", vec!["5".into()]).await.unwrap_err();
        assert!(matches!(err, HostError::Timeout { .. }));
        assert_eq!(CoreError::from(err).kind(), ErrorKind::OsExecTimeout);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let host = LinuxHost::new(Duration::from_secs(1));
        let err = host.run("/nonexistent/owehost-tool", vec![]).await.unwrap_err();
        assert_eq!(CoreError::from(err).kind(), ErrorKind::OsExec);
    }

    #[tokio::test]
    async fn run_checked_honours_ok_codes() {
        let mut host = MockHostOps::new();
        host.expect_run()
            .with(always(), always())
            .returning(|_, _| {
                Ok(CommandOutput {
                    code: Some(9),
                    stderr: "group exists".into(),
                    ..CommandOutput::default()
                })
            });

        assert!(run_checked(&host, "groupadd", &["acme"], &[9]).await.is_ok());
        let err = run_checked(&host, "groupadd", &["acme"], &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OsExec);
    }

    #[test]
    fn chown_recursive_visits_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/file"), b"x").unwrap();

        let mut host = MockHostOps::new();
        host.expect_chown()
            .with(always(), eq(Some(20001)), eq(Some(20001)))
            .times(4)
            .returning(|_, _, _| Ok(()));
        chown_recursive(&host, dir.path(), Some(20001), Some(20001)).unwrap();
    }
}
