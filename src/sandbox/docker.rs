//! Docker-backed shared sandbox.
//!
//! One long-lived container (`tail -f /dev/null` keep-alive) with the
//! workspace volume mounted at `/workspace`, no network by default, memory
//! and CPU caps, an unprivileged user, and every capability dropped. All
//! tenant commands are multiplexed over the container's exec API with the
//! per-user workspace as working directory.

use super::paths::{
    guarded_script, hide_workspace_paths, validate_relative, validate_user_id, workspace_path,
};
use super::{ExecOutput, FileEntry, PATH_ESCAPE_EXIT_CODE, SandboxSurface, TIMEOUT_EXIT_CODE};
use crate::config::SandboxSettings;
use crate::errors::{ServerError, ServerResult};
use crate::utils::turns::CancelToken;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, InspectContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fixed watchdog budget for internal file-transport execs.
const FILE_OP_TIMEOUT_SECS: u64 = 30;

/// Marker line carrying the spawned process-group id for cancellation kills.
const PID_MARKER: &str = "__ANEMONE_PID__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Uninitialized,
    Starting,
    Ready,
    Degraded,
    Stopped,
}

struct RawExec {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i64,
    truncated: bool,
    timed_out: bool,
}

pub struct SharedSandbox {
    docker: Docker,
    settings: SandboxSettings,
    state: Mutex<SandboxState>,
    /// Per-workspace provisioning flag; the lock only guards first-use
    /// provisioning, later callers observe `true` and proceed.
    workspaces: Mutex<HashMap<String, Arc<Mutex<bool>>>>,
}

impl SharedSandbox {
    pub fn connect(settings: SandboxSettings) -> ServerResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ServerError::SandboxUnavailable(format!("docker connect: {}", e)))?;
        Ok(Self {
            docker,
            settings,
            state: Mutex::new(SandboxState::Uninitialized),
            workspaces: Mutex::new(HashMap::new()),
        })
    }

    /// Stop the shared container (graceful). The workspace volume survives.
    pub async fn stop(&self) -> ServerResult<()> {
        let mut state = self.state.lock().await;
        let options = bollard::container::StopContainerOptions { t: 10 };
        match self
            .docker
            .stop_container(&self.settings.container_name, Some(options))
            .await
        {
            Ok(()) => {
                *state = SandboxState::Stopped;
                info!("sandbox container stopped: {}", self.settings.container_name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                *state = SandboxState::Stopped;
                Ok(())
            }
            Err(e) => Err(ServerError::SandboxUnavailable(e.to_string())),
        }
    }

    async fn container_running(&self) -> ServerResult<bool> {
        match self
            .docker
            .inspect_container(
                &self.settings.container_name,
                None::<InspectContainerOptions>,
            )
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ServerError::SandboxUnavailable(e.to_string())),
        }
    }

    async fn start_or_create(&self) -> ServerResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| ServerError::SandboxUnavailable(format!("docker ping: {}", e)))?;

        let name = &self.settings.container_name;
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                if !running {
                    info!("starting existing sandbox container: {}", name);
                    self.docker
                        .start_container(
                            name,
                            None::<bollard::container::StartContainerOptions<String>>,
                        )
                        .await
                        .map_err(|e| ServerError::SandboxUnavailable(e.to_string()))?;
                } else {
                    debug!("found running sandbox container: {}", name);
                }
                Ok(())
            }
            Err(e) if is_not_found(&e) => self.create_container().await,
            Err(e) => Err(ServerError::SandboxUnavailable(e.to_string())),
        }
    }

    async fn create_container(&self) -> ServerResult<()> {
        let s = &self.settings;
        info!("creating sandbox container: {} ({})", s.container_name, s.image);

        // Binding a named volume creates it on first use; the volume (and
        // every user workspace in it) outlives the container.
        let host_config = HostConfig {
            binds: Some(vec![format!("{}:{}", s.volume_name, s.workspace_root)]),
            memory: Some(s.memory_limit_bytes),
            nano_cpus: Some((s.cpu_limit * 1_000_000_000.0) as i64),
            network_mode: Some(s.network_mode.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let config = Config {
            image: Some(s.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            user: Some(s.exec_user.clone()),
            working_dir: Some(s.workspace_root.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: s.container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| ServerError::SandboxUnavailable(format!("create container: {}", e)))?;
        self.docker
            .start_container(
                &s.container_name,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await
            .map_err(|e| ServerError::SandboxUnavailable(format!("start container: {}", e)))?;
        info!("sandbox container ready: {}", s.container_name);
        Ok(())
    }

    /// Lazily create `/workspace/<user>/` and copy the tool asset tree once.
    /// The per-workspace lock guards only first-use provisioning.
    async fn ensure_workspace(&self, user_id: &str) -> ServerResult<()> {
        let flag = {
            let mut workspaces = self.workspaces.lock().await;
            workspaces
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(false)))
                .clone()
        };
        let mut provisioned = flag.lock().await;
        if *provisioned {
            return Ok(());
        }

        let ws = workspace_path(&self.settings.workspace_root, user_id);
        let init = format!(
            "mkdir -p '{ws}' && \
             if [ -d /opt/tools ] && [ ! -d '{ws}/.tools' ]; then cp -r /opt/tools '{ws}/.tools'; fi",
            ws = ws
        );
        let raw = self
            .run_exec_raw(
                vec!["bash".into(), "-c".into(), init],
                Some(self.settings.workspace_root.clone()),
                None,
                FILE_OP_TIMEOUT_SECS,
                &CancelToken::never(),
                false,
            )
            .await?;
        if raw.exit_code != 0 {
            return Err(ServerError::SandboxUnavailable(format!(
                "workspace provisioning failed for {}: {}",
                user_id,
                String::from_utf8_lossy(&raw.stderr)
            )));
        }
        *provisioned = true;
        debug!("workspace provisioned: {}", ws);
        Ok(())
    }

    /// Run a command via the container exec API, collecting demuxed output
    /// up to the byte cap with a client-side watchdog backstop.
    async fn run_exec_raw(
        &self,
        cmd: Vec<String>,
        workdir: Option<String>,
        stdin: Option<Vec<u8>>,
        timeout_secs: u64,
        cancel: &CancelToken,
        pid_marker: bool,
    ) -> ServerResult<RawExec> {
        let exec = self
            .docker
            .create_exec(
                &self.settings.container_name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(stdin.is_some()),
                    working_dir: workdir,
                    user: Some(self.settings.exec_user.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ServerError::SandboxUnavailable(format!("create exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| ServerError::SandboxUnavailable(format!("start exec: {}", e)))?;

        let StartExecResults::Attached {
            mut output,
            mut input,
        } = started
        else {
            return Err(ServerError::SandboxUnavailable(
                "exec started detached".to_string(),
            ));
        };

        if let Some(bytes) = stdin {
            input
                .write_all(&bytes)
                .await
                .map_err(|e| ServerError::SandboxUnavailable(format!("exec stdin: {}", e)))?;
            input
                .shutdown()
                .await
                .map_err(|e| ServerError::SandboxUnavailable(format!("exec stdin close: {}", e)))?;
        }
        drop(input);

        let cap = self.settings.output_cap_bytes;
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut total_seen = 0usize;
        let mut pgid: Option<i64> = None;
        let mut timed_out = false;
        let mut cancelled = false;

        // The in-container `timeout` wrapper is the primary watchdog; this
        // deadline is the backstop for a wedged exec stream.
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(timeout_secs + self.settings.kill_grace_secs + 5);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                item = output.next() => match item {
                    Some(Ok(bollard::container::LogOutput::StdOut { message })) => {
                        let mut chunk: &[u8] = &message;
                        if pid_marker && pgid.is_none()
                            && let Some((found, rest)) = split_pid_marker(chunk)
                        {
                            pgid = Some(found);
                            chunk = rest;
                        }
                        let used = stderr.len();
                        append_capped(&mut stdout, used, cap, &mut total_seen, chunk);
                    }
                    Some(Ok(bollard::container::LogOutput::StdErr { message })) => {
                        let used = stdout.len();
                        append_capped(&mut stderr, used, cap, &mut total_seen, &message);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(ServerError::SandboxUnavailable(format!("exec stream: {}", e)));
                    }
                    None => break,
                },
            }
        }

        if cancelled {
            self.kill_process_group(pgid).await;
            return Err(ServerError::Cancelled);
        }

        let exit_code = if timed_out {
            warn!("exec stream hit the watchdog backstop after {}s", timeout_secs);
            self.kill_process_group(pgid).await;
            TIMEOUT_EXIT_CODE
        } else {
            self.docker
                .inspect_exec(&exec.id)
                .await
                .ok()
                .and_then(|i| i.exit_code)
                .unwrap_or(-1)
        };

        // coreutils `timeout` reports 124 when it fired
        let (exit_code, timed_out) = if exit_code == 124 {
            (TIMEOUT_EXIT_CODE, true)
        } else {
            (exit_code, timed_out)
        };

        Ok(RawExec {
            stdout,
            stderr,
            exit_code,
            truncated: total_seen > cap,
            timed_out,
        })
    }

    /// Best-effort TERM → grace → KILL of the exec'ed process group.
    async fn kill_process_group(&self, pgid: Option<i64>) {
        let Some(pgid) = pgid else { return };
        let grace = self.settings.kill_grace_secs;
        let script = format!(
            "kill -TERM -- -{pgid} 2>/dev/null; sleep {grace}; kill -KILL -- -{pgid} 2>/dev/null; true",
            pgid = pgid,
            grace = grace
        );
        let docker = self.docker.clone();
        let container = self.settings.container_name.clone();
        let user = self.settings.exec_user.clone();
        tokio::spawn(async move {
            let exec = docker
                .create_exec(
                    &container,
                    CreateExecOptions {
                        cmd: Some(vec!["bash".to_string(), "-c".to_string(), script]),
                        attach_stdout: Some(false),
                        attach_stderr: Some(false),
                        user: Some(user),
                        ..Default::default()
                    },
                )
                .await;
            if let Ok(exec) = exec {
                if let Ok(StartExecResults::Attached { mut output, .. }) =
                    docker.start_exec(&exec.id, None::<StartExecOptions>).await
                {
                    while output.next().await.is_some() {}
                }
            }
        });
    }

    /// Run a guarded file-transport script for one relative path, mapping the
    /// guard's exit code to `path-escape`.
    async fn run_file_op(
        &self,
        user_id: &str,
        relative: &str,
        body: &str,
        stdin: Option<Vec<u8>>,
    ) -> ServerResult<RawExec> {
        let user_id = validate_user_id(user_id)?;
        let relative = validate_relative(relative)?;
        self.ensure().await?;
        self.ensure_workspace(user_id).await?;

        let ws = workspace_path(&self.settings.workspace_root, user_id);
        let script = guarded_script(&ws, &relative, body);
        let raw = self
            .run_exec_raw(
                vec!["bash".to_string(), "-c".to_string(), script],
                Some(ws),
                stdin,
                FILE_OP_TIMEOUT_SECS,
                &CancelToken::never(),
                false,
            )
            .await?;
        if raw.exit_code == PATH_ESCAPE_EXIT_CODE {
            return Err(ServerError::PathEscape(relative));
        }
        Ok(raw)
    }
}

/// Append a chunk to an output buffer without letting the combined capture
/// exceed the byte cap. Past the cap the stream keeps draining so the
/// process can finish, but bytes are counted and discarded.
fn append_capped(
    buf: &mut Vec<u8>,
    other_len: usize,
    cap: usize,
    total_seen: &mut usize,
    chunk: &[u8],
) {
    *total_seen += chunk.len();
    let room = cap.saturating_sub(buf.len() + other_len);
    if room > 0 {
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Strip the `__ANEMONE_PID__<n>` line from the head of the stdout stream,
/// returning the parsed process-group id and the remaining bytes.
fn split_pid_marker(chunk: &[u8]) -> Option<(i64, &[u8])> {
    let text = std::str::from_utf8(chunk).ok()?;
    let rest = text.strip_prefix(PID_MARKER)?;
    let line_end = rest.find('\n')?;
    let pid: i64 = rest[..line_end].trim().parse().ok()?;
    Some((pid, &chunk[PID_MARKER.len() + line_end + 1..]))
}

/// Parse one `ls -lA --time-style=long-iso` line into a listing entry.
/// Format: permissions links owner group size date time name. The first
/// seven fields are whitespace-delimited (runs collapse, `ls` pads its
/// columns); the name is everything after them and may contain spaces.
fn parse_listing_line(line: &str) -> Option<FileEntry> {
    if line.is_empty() || line.starts_with("total") {
        return None;
    }
    let mut fields = Vec::with_capacity(7);
    let mut rest = line;
    for _ in 0..7 {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    let name = rest.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(FileEntry {
        name: name.to_string(),
        size: fields[4].parse().unwrap_or(0),
        is_dir: fields[0].starts_with('d'),
    })
}

#[async_trait]
impl SandboxSurface for SharedSandbox {
    async fn ensure(&self) -> ServerResult<()> {
        let mut state = self.state.lock().await;
        if *state == SandboxState::Ready {
            // Health recheck: the runtime may have lost the container.
            match self.container_running().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    warn!("sandbox container disappeared, re-ensuring");
                    *state = SandboxState::Uninitialized;
                }
            }
        }
        *state = SandboxState::Starting;
        match self.start_or_create().await {
            Ok(()) => {
                *state = SandboxState::Ready;
                Ok(())
            }
            Err(e) => {
                *state = SandboxState::Degraded;
                Err(e)
            }
        }
    }

    async fn exec(
        &self,
        user_id: &str,
        command: &str,
        timeout_secs: u64,
        cancel: &CancelToken,
    ) -> ServerResult<ExecOutput> {
        let user_id = validate_user_id(user_id)?;
        self.ensure().await?;
        self.ensure_workspace(user_id).await?;

        let timeout_secs = timeout_secs.clamp(1, self.settings.exec_timeout_max_secs);
        let ws = workspace_path(&self.settings.workspace_root, user_id);

        // setsid gives the command its own process group so cancellation can
        // kill the whole tree; `timeout` is the in-container watchdog.
        let quoted = shlex::try_quote(command)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| format!("'{}'", command.replace('\'', "'\\''")));
        let wrapped = format!(
            "setsid timeout -k {grace} {secs} bash -c {cmd} & p=$!; echo \"{marker}$p\"; wait \"$p\"",
            grace = self.settings.kill_grace_secs,
            secs = timeout_secs,
            cmd = quoted,
            marker = PID_MARKER,
        );

        let raw = self
            .run_exec_raw(
                vec!["bash".to_string(), "-c".to_string(), wrapped],
                Some(ws.clone()),
                None,
                timeout_secs,
                cancel,
                true,
            )
            .await?;

        // Single egress filter: hide the physical workspace path.
        let stdout = hide_workspace_paths(&String::from_utf8_lossy(&raw.stdout), &ws);
        let stderr = hide_workspace_paths(&String::from_utf8_lossy(&raw.stderr), &ws);

        debug!(
            "exec done: user={} exit={} truncated={} timed_out={}",
            user_id, raw.exit_code, raw.truncated, raw.timed_out
        );
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: raw.exit_code,
            truncated: raw.truncated,
            timed_out: raw.timed_out,
        })
    }

    async fn put_file(
        &self,
        user_id: &str,
        relative_path: &str,
        bytes: &[u8],
    ) -> ServerResult<()> {
        let raw = self
            .run_file_op(
                user_id,
                relative_path,
                "mkdir -p -- \"$(dirname -- \"$target\")\" && cat > \"$target\"",
                Some(bytes.to_vec()),
            )
            .await?;
        if raw.exit_code != 0 {
            return Err(ServerError::ToolFailed(format!(
                "write {} failed: {}",
                relative_path,
                String::from_utf8_lossy(&raw.stderr)
            )));
        }
        Ok(())
    }

    async fn get_file(&self, user_id: &str, relative_path: &str) -> ServerResult<Vec<u8>> {
        let raw = self
            .run_file_op(user_id, relative_path, "cat -- \"$target\"", None)
            .await?;
        if raw.exit_code != 0 {
            return Err(ServerError::ToolFailed(format!(
                "read {} failed: {}",
                relative_path,
                String::from_utf8_lossy(&raw.stderr)
            )));
        }
        Ok(raw.stdout)
    }

    async fn list(&self, user_id: &str, relative_dir: &str) -> ServerResult<Vec<FileEntry>> {
        let raw = self
            .run_file_op(
                user_id,
                relative_dir,
                "ls -lA --time-style=long-iso -- \"$target\"",
                None,
            )
            .await?;
        if raw.exit_code != 0 {
            return Err(ServerError::ToolFailed(format!(
                "list {} failed: {}",
                relative_dir,
                String::from_utf8_lossy(&raw.stderr)
            )));
        }
        let text = String::from_utf8_lossy(&raw.stdout);
        Ok(text.lines().filter_map(parse_listing_line).collect())
    }

    async fn delete(&self, user_id: &str, relative_path: &str) -> ServerResult<()> {
        let relative = validate_relative(relative_path)?;
        if relative.is_empty() {
            return Err(ServerError::PathEscape(
                "refusing to delete the workspace root".to_string(),
            ));
        }
        let raw = self
            .run_file_op(
                user_id,
                relative_path,
                "if [ -d \"$target\" ] && [ ! -L \"$target\" ]; then rmdir -- \"$target\"; else rm -f -- \"$target\"; fi",
                None,
            )
            .await?;
        if raw.exit_code != 0 {
            return Err(ServerError::ToolFailed(format!(
                "delete {} failed: {}",
                relative_path,
                String::from_utf8_lossy(&raw.stderr)
            )));
        }
        Ok(())
    }
}
