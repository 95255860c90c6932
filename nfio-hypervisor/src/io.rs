//! Host-level I/O capability consumed by the drivers.
//!
//! Drivers never spawn processes or touch the filesystem directly; they go
//! through [`HostIo`] so the backend interaction can be scripted in tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code (-1 if terminated by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, or stdout when stderr is empty.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Generic failure of the I/O capability.
#[derive(Error, Debug)]
pub enum HostIoError {
    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stage file {}: {source}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Host-level actions needed to materialize a VNF.
#[async_trait]
pub trait HostIo: Send + Sync {
    /// Run `command` with `args` to completion.
    ///
    /// A non-zero exit code is not an error at this level; only failing to
    /// run the process is.
    async fn execute(&self, command: &str, args: &[String]) -> Result<ExecOutput, HostIoError>;

    /// Write `content` to `path`, creating parent directories.
    async fn stage_file(&self, path: &Path, content: &[u8]) -> Result<(), HostIoError>;

    /// Read the whole file at `path`.
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostIoError>;
}

/// [`HostIo`] backed by real processes and the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct ProcessIo;

impl ProcessIo {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostIo for ProcessIo {
    #[instrument(skip(self, args), fields(argc = args.len()))]
    async fn execute(&self, command: &str, args: &[String]) -> Result<ExecOutput, HostIoError> {
        debug!(args = ?args, "Executing host command");

        // A dropped future (bounded stop) must not leave the child behind.
        let output = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HostIoError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let result = ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(exit_code = result.exit_code, "Host command finished");
        Ok(result)
    }

    #[instrument(skip(self, content), fields(path = %path.display(), bytes = content.len()))]
    async fn stage_file(&self, path: &Path, content: &[u8]) -> Result<(), HostIoError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| HostIoError::Stage {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|source| HostIoError::Stage {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostIoError> {
        tokio::fs::read(path)
            .await
            .map_err(|source| HostIoError::Read {
                path: path.to_path_buf(),
                source,
            })
    }
}
