//! Shared sandboxed execution environment.
//!
//! One long-lived isolated container serves every user; isolation between
//! tenants is by per-user working directory under the persistent workspace
//! volume. The core depends only on the [`SandboxSurface`] trait; the Docker
//! implementation in [`docker`] is the reference semantics, and tests run
//! against an in-process fake.

pub mod docker;
pub mod paths;

use crate::errors::ServerResult;
use crate::utils::turns::CancelToken;
use async_trait::async_trait;

/// Exit code reported when the exec watchdog killed the command.
pub const TIMEOUT_EXIT_CODE: i64 = -124;

/// In-container exit code used by the path guard to signal an escape attempt.
pub(crate) const PATH_ESCAPE_EXIT_CODE: i64 = 40;

/// Result of one sandboxed command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Combined output exceeded the byte cap and was cut.
    pub truncated: bool,
    /// The watchdog killed the command at its timeout.
    pub timed_out: bool,
}

impl ExecOutput {
    /// Combined stdout + stderr the way tools hand output to the model:
    /// stderr separated by a marker, `[Exit Code: N]` suffix when non-zero.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
        }
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("[STDERR]:\n");
            out.push_str(&self.stderr);
        }
        if self.truncated {
            out.push_str("\n[output truncated]");
        }
        if self.timed_out {
            out.push_str("\n[killed: timeout]");
        }
        if self.exit_code != 0 {
            out.push_str(&format!("\n[Exit Code: {}]", self.exit_code));
        }
        if out.is_empty() {
            out.push_str("(no output)");
        }
        out
    }
}

/// One entry of a non-recursive workspace listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// The provisioning surface the agent core depends on. All operations
/// lazily create the per-user workspace and re-check sandbox health.
#[async_trait]
pub trait SandboxSurface: Send + Sync {
    /// Bring the shared environment up (idempotent, serialized internally).
    async fn ensure(&self) -> ServerResult<()>;

    /// Run a shell command in the user's workspace. The watchdog kills the
    /// command at `timeout_secs`; cancellation kills it early.
    async fn exec(
        &self,
        user_id: &str,
        command: &str,
        timeout_secs: u64,
        cancel: &CancelToken,
    ) -> ServerResult<ExecOutput>;

    /// Write bytes to a workspace-relative path, creating parent directories.
    async fn put_file(&self, user_id: &str, relative_path: &str, bytes: &[u8])
    -> ServerResult<()>;

    /// Read bytes from a workspace-relative path.
    async fn get_file(&self, user_id: &str, relative_path: &str) -> ServerResult<Vec<u8>>;

    /// Non-recursive listing of a workspace-relative directory.
    async fn list(&self, user_id: &str, relative_dir: &str) -> ServerResult<Vec<FileEntry>>;

    /// Delete a file or empty subdirectory.
    async fn delete(&self, user_id: &str, relative_path: &str) -> ServerResult<()>;
}

#[cfg(test)]
mod tests;
