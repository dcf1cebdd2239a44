use crate::error::{AgentvisorError, Result};
use crate::process::types::ProcessSpec;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Environment variable carrying the supervisor's process id
pub const PROCESS_ID_ENV: &str = "PROCESS_ID";

/// Environment variable carrying the scheduler task id
pub const TASK_ID_ENV: &str = "TASK_ID";

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Spawn a process described by `spec`
///
/// Applies the working directory, environment (plus the injected
/// `PROCESS_ID`/`TASK_ID` variables) and arguments. When the spec names a
/// log directory, stdout and stderr are appended to
/// `<process_id>-out.log` / `<process_id>-err.log`; otherwise they are discarded.
/// The log files are opened before the child starts, so a bad log directory
/// fails the spawn without leaving a running process behind.
pub async fn spawn_process(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    let (program, args) = spec.command.split_first().ok_or_else(|| {
        AgentvisorError::SpawnError(format!("Empty command for process '{}'", spec.process_id))
    })?;

    let mut command = Command::new(program);
    command.args(args);

    if let Some(ref cwd) = spec.working_dir {
        command.current_dir(cwd);
    }

    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.env(PROCESS_ID_ENV, &spec.process_id);
    if let Some(ref task_id) = spec.task_id {
        command.env(TASK_ID_ENV, task_id);
    }

    command.stdin(Stdio::null());
    match spec.log_dir {
        Some(ref log_dir) => {
            let (stdout, stderr) = open_log_files(spec, log_dir).await?;
            command.stdout(stdout);
            command.stderr(stderr);
        }
        None => {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
    }

    let mut child = command.spawn().map_err(|e| {
        AgentvisorError::SpawnError(format!(
            "Failed to spawn process '{}': {}",
            spec.process_id, e
        ))
    })?;

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            if let Err(e) = child.start_kill() {
                warn!(process_id = %spec.process_id, "Failed to kill process without a PID: {}", e);
            }
            return Err(AgentvisorError::SpawnError(format!(
                "Failed to get PID for process '{}'",
                spec.process_id
            )));
        }
    };

    debug!(process_id = %spec.process_id, pid, "Spawned process");

    Ok(SpawnedProcess { child, pid })
}

/// Open (append) the stdout/stderr log files for `spec`, creating `log_dir` first
async fn open_log_files(spec: &ProcessSpec, log_dir: &Path) -> Result<(Stdio, Stdio)> {
    let log_error = |e: std::io::Error| {
        AgentvisorError::SpawnError(format!(
            "Failed to prepare log directory {} for process '{}': {}",
            log_dir.display(),
            spec.process_id,
            e
        ))
    };

    tokio::fs::create_dir_all(log_dir).await.map_err(log_error)?;

    let stdout = open_append(&log_dir.join(format!("{}-out.log", spec.process_id)))
        .await
        .map_err(log_error)?;
    let stderr = open_append(&log_dir.join(format!("{}-err.log", spec.process_id)))
        .await
        .map_err(log_error)?;

    Ok((stdout, stderr))
}

async fn open_append(path: &Path) -> std::io::Result<Stdio> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Stdio::from(file.into_std().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let spec = ProcessSpec::new("echo", ["/bin/echo", "hello"]);

        let mut spawned = spawn_process(&spec).await.unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_empty_command() {
        let spec = ProcessSpec::new("empty", Vec::<String>::new());

        match spawn_process(&spec).await {
            Err(AgentvisorError::SpawnError(msg)) => assert!(msg.contains("Empty command")),
            other => panic!("Expected SpawnError, got {:?}", other.map(|s| s.pid)),
        }
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_program() {
        let spec = ProcessSpec::new("missing", ["/nonexistent/program"]);

        assert!(matches!(
            spawn_process(&spec).await,
            Err(AgentvisorError::SpawnError(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_invalid_working_directory() {
        let spec = ProcessSpec::new("bad-cwd", ["/bin/echo"]).working_dir("/nonexistent/directory");

        assert!(matches!(
            spawn_process(&spec).await,
            Err(AgentvisorError::SpawnError(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_env_is_captured_to_log_dir() {
        let temp_dir = TempDir::new().unwrap();
        let spec = ProcessSpec::shell("env-check", "echo \"$PROCESS_ID:$TASK_ID:$EXTRA\"")
            .task("task-7", "testing")
            .env("EXTRA", "yes")
            .log_dir(temp_dir.path());

        let mut spawned = spawn_process(&spec).await.unwrap();
        spawned.child.wait().await.unwrap();

        let log_path = temp_dir.path().join("env-check-out.log");
        let mut contents = String::new();
        for _ in 0..50 {
            contents = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(contents.trim(), "env-check:task-7:yes");
    }

    #[tokio::test]
    async fn test_unusable_log_dir_fails_before_spawn() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"occupied").unwrap();
        let marker = temp_dir.path().join("started");

        let spec = ProcessSpec::shell("bad-logs", format!("touch {}", marker.display()))
            .log_dir(blocker.join("logs"));

        match spawn_process(&spec).await {
            Err(AgentvisorError::SpawnError(msg)) => assert!(msg.contains("log directory")),
            other => panic!("Expected SpawnError, got {:?}", other.map(|s| s.pid)),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }
}
