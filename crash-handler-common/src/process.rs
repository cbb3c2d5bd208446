//! Child process launching for secondary tools.

use std::io;
use std::path::Path;

/// How a child process terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal termination with an exit code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// Stopped by a signal.
    Stopped(i32),
    /// Anything the platform could not classify.
    Unknown,
}

impl ChildExit {
    pub fn exited_normally(&self) -> bool {
        matches!(self, ChildExit::Exited(_))
    }
}

/// Errors encountered while running a child process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to create child process")]
    Spawn(#[source] io::Error),
    #[error("failed to wait for child process")]
    Wait(#[source] io::Error),
}

/// Runs a child process to completion.
pub trait ProcessLauncher: Send + Sync {
    /// Run `program` with `argv` (`argv[0]` included) and block until it terminates.
    fn spawn_and_wait(&self, program: &Path, argv: &[String]) -> Result<ChildExit, LaunchError>;
}
