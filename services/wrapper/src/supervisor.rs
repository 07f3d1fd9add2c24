//! Supervision of the single game process.
//!
//! ```text
//! NotStarted ──start──▶ Running ──exit after stop──▶ Stopped
//!                          │
//!                          └──────exit otherwise───▶ Crashed
//! ```
//!
//! The process runs in its own process group so that signals reach any
//! children a start script forks. Its stdout and stderr are pumped into a
//! broadcast channel; each subscriber reads at its own pace and a subscriber
//! that falls behind loses the oldest chunks. The pumps never wait on
//! subscribers.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WrapperError;

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// How long output pumps may keep draining after the process exits. A
/// grandchild holding the pipes open must not delay the exit report.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait after SIGKILL before giving up on observing the exit.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped,
    Crashed,
}

impl RunState {
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: RunState,
    /// Exit code once exited; `128 + signal` when killed by a signal.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

impl ProcessStatus {
    fn not_started() -> Self {
        Self {
            state: RunState::NotStarted,
            exit_code: None,
            pid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// The process exited and its output has been drained.
    End,
}

/// A fully rendered launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Files written before spawning. Relative paths resolve against
    /// `working_dir`.
    pub files: Vec<(PathBuf, String)>,
}

struct Control {
    generation: u64,
    stop_requested: bool,
}

pub struct ProcessSupervisor {
    control: Arc<Mutex<Control>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    status: Arc<watch::Sender<ProcessStatus>>,
    output: broadcast::Sender<OutputEvent>,
}

impl ProcessSupervisor {
    /// `output_buffer` is the number of chunks a subscriber may fall behind
    /// before losing the oldest.
    pub fn new(output_buffer: usize) -> Self {
        let (output, _) = broadcast::channel(output_buffer.max(1));
        let (status, _) = watch::channel(ProcessStatus::not_started());
        Self {
            control: Arc::new(Mutex::new(Control {
                generation: 0,
                stop_requested: false,
            })),
            stdin: Arc::new(Mutex::new(None)),
            status: Arc::new(status),
            output,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    /// Subscribes to the output of the current and any later process.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.output.subscribe()
    }

    /// Spawns the process and returns its pid without waiting for the game
    /// to become ready.
    ///
    /// Fails with [`WrapperError::AlreadyRunning`] unless `force` is set, in
    /// which case the running process is killed first.
    pub async fn start(&self, spec: LaunchSpec, force: bool) -> Result<u32, WrapperError> {
        if spec.command.trim().is_empty() {
            return Err(WrapperError::InvalidRequest("command is empty".to_string()));
        }

        if self.status().state == RunState::Running {
            if !force {
                return Err(WrapperError::AlreadyRunning);
            }
            info!("Force start requested, killing running process");
            self.stop(false, KILL_WAIT).await?;
        }

        let mut control = self.control.lock().await;
        if self.status().state == RunState::Running {
            return Err(WrapperError::AlreadyRunning);
        }

        write_files(&spec).await?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(WrapperError::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            WrapperError::Spawn(std::io::Error::other("process exited before its pid was read"))
        })?;

        control.generation += 1;
        control.stop_requested = false;
        let generation = control.generation;

        *self.stdin.lock().await = child.stdin.take();
        self.status.send_replace(ProcessStatus {
            state: RunState::Running,
            exit_code: None,
            pid: Some(pid),
        });

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, false, self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, true, self.output.clone()));
        }

        tokio::spawn(watch_exit(
            child,
            pumps,
            generation,
            self.control.clone(),
            self.stdin.clone(),
            self.status.clone(),
            self.output.clone(),
        ));

        info!(
            pid,
            command = %spec.command,
            args = ?spec.args,
            "Process started"
        );
        Ok(pid)
    }

    /// Stops the process. A graceful stop sends SIGTERM and escalates to
    /// SIGKILL after `timeout`; otherwise SIGKILL is sent at once.
    ///
    /// A no-op returning the current status if nothing is running.
    pub async fn stop(&self, graceful: bool, timeout: Duration) -> Result<ProcessStatus, WrapperError> {
        let pid = {
            let mut control = self.control.lock().await;
            let current = self.status();
            if current.state != RunState::Running {
                return Ok(current);
            }
            control.stop_requested = true;
            current.pid
        };
        let Some(pid) = pid else {
            return Ok(self.status());
        };
        let group = Pid::from_raw(pid as i32);

        if graceful {
            info!(pid, timeout_secs = timeout.as_secs_f64(), "Stopping process");
            signal_group(group, Signal::SIGTERM)?;
            if let Some(status) = self.wait_for_exit(timeout).await {
                return Ok(status);
            }
            warn!(pid, "Process did not exit in time, killing");
        } else {
            info!(pid, "Killing process");
        }

        signal_group(group, Signal::SIGKILL)?;
        Ok(self.wait_for_exit(KILL_WAIT).await.unwrap_or_else(|| self.status()))
    }

    /// Writes `data` to the process's stdin.
    pub async fn send_input(&self, data: &[u8]) -> Result<(), WrapperError> {
        let mut stdin = self.stdin.lock().await;
        if self.status().state != RunState::Running {
            return Err(WrapperError::NotRunning);
        }
        let pipe = stdin.as_mut().ok_or(WrapperError::NotRunning)?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        debug!(bytes = data.len(), "Wrote to stdin");
        Ok(())
    }

    /// Waits until the process is no longer running. Returns `None` on timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessStatus> {
        let mut rx = self.status.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|s| s.state != RunState::Running)).await {
            Ok(Ok(status)) => Some(*status),
            _ => None,
        };
        result
    }
}

fn signal_group(group: Pid, signal: Signal) -> Result<(), WrapperError> {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn write_files(spec: &LaunchSpec) -> Result<(), WrapperError> {
    for (path, content) in &spec.files {
        let path = match &spec.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.clone(),
        };
        let to_error = |source| WrapperError::ConfigFile {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(to_error)?;
        }
        tokio::fs::write(&path, content).await.map_err(to_error)?;
        debug!(path = %path.display(), bytes = content.len(), "Wrote config file");
    }
    Ok(())
}

fn spawn_pump<R>(mut reader: R, is_stderr: bool, output: broadcast::Sender<OutputEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    let event = if is_stderr {
                        OutputEvent::Stderr(data)
                    } else {
                        OutputEvent::Stdout(data)
                    };
                    // No subscribers is fine.
                    let _ = output.send(event);
                }
                Err(e) => {
                    warn!(error = %e, is_stderr, "Output pump failed");
                    break;
                }
            }
        }
    })
}

async fn watch_exit(
    mut child: Child,
    pumps: Vec<JoinHandle<()>>,
    generation: u64,
    control: Arc<Mutex<Control>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    status: Arc<watch::Sender<ProcessStatus>>,
    output: broadcast::Sender<OutputEvent>,
) {
    let exit_code = match child.wait().await {
        Ok(exit) => exit.code().or_else(|| exit.signal().map(|sig| 128 + sig)),
        Err(e) => {
            warn!(error = %e, "Failed to wait for process");
            None
        }
    };

    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
            abort.abort();
        }
    }

    let control = control.lock().await;
    if control.generation != generation {
        return;
    }
    *stdin.lock().await = None;

    let state = if control.stop_requested {
        RunState::Stopped
    } else {
        RunState::Crashed
    };
    status.send_replace(ProcessStatus {
        state,
        exit_code,
        pid: None,
    });
    // Sent under `control` so a forced restart cannot emit output ahead of it.
    let _ = output.send(OutputEvent::End);
    drop(control);

    info!(?state, exit_code, "Process exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    /// Reads until `End`, returning (stdout, stderr).
    async fn collect(rx: &mut broadcast::Receiver<OutputEvent>) -> (String, String) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                OutputEvent::Stdout(data) => stdout.extend_from_slice(&data),
                OutputEvent::Stderr(data) => stderr.extend_from_slice(&data),
                OutputEvent::End => break,
            }
        }
        (
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    async fn wait_for_stdout(rx: &mut broadcast::Receiver<OutputEvent>, needle: &str) {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                OutputEvent::Stdout(data) => seen.push_str(&String::from_utf8_lossy(&data)),
                OutputEvent::Stderr(_) => {}
                OutputEvent::End => panic!("process ended before printing {needle:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unrequested_exit_is_crashed_and_output_is_tagged() {
        let supervisor = ProcessSupervisor::new(64);
        let mut rx = supervisor.subscribe();

        supervisor
            .start(sh("echo hello; echo oops >&2"), false)
            .await
            .unwrap();
        let (stdout, stderr) = collect(&mut rx).await;

        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "oops\n");
        let status = supervisor.status();
        assert_eq!(status.state, RunState::Crashed);
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.pid, None);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_reported() {
        let supervisor = ProcessSupervisor::new(64);
        supervisor.start(sh("exit 3"), false).await.unwrap();
        let status = supervisor.wait_for_exit(WAIT).await.unwrap();
        assert_eq!(status.state, RunState::Crashed);
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_input_reaches_process_and_stop_is_stopped() {
        let supervisor = ProcessSupervisor::new(64);
        let mut rx = supervisor.subscribe();
        supervisor
            .start(
                LaunchSpec {
                    command: "cat".to_string(),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        supervisor.send_input(b"say hi\n").await.unwrap();
        wait_for_stdout(&mut rx, "say hi\n").await;

        let status = supervisor.stop(true, WAIT).await.unwrap();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.exit_code, Some(128 + 15));
        assert!(matches!(
            supervisor.send_input(b"late\n").await,
            Err(WrapperError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_graceful_stop_escalates_to_kill() {
        let supervisor = ProcessSupervisor::new(64);
        let mut rx = supervisor.subscribe();
        supervisor
            .start(
                sh("trap '' TERM; echo ready; while true; do sleep 0.1; done"),
                false,
            )
            .await
            .unwrap();
        wait_for_stdout(&mut rx, "ready").await;

        let status = supervisor
            .stop(true, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.exit_code, Some(128 + 9));
    }

    #[tokio::test]
    async fn test_start_while_running_requires_force() {
        let supervisor = ProcessSupervisor::new(64);
        let first = supervisor.start(sh("sleep 30"), false).await.unwrap();

        assert!(matches!(
            supervisor.start(sh("sleep 30"), false).await,
            Err(WrapperError::AlreadyRunning)
        ));

        let second = supervisor.start(sh("sleep 30"), true).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(supervisor.status().state, RunState::Running);
        assert_eq!(supervisor.status().pid, Some(second));

        supervisor.stop(false, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_restart_ends_old_output_before_new() {
        let supervisor = ProcessSupervisor::new(64);
        let mut rx = supervisor.subscribe();
        supervisor
            .start(sh("echo first; sleep 30"), false)
            .await
            .unwrap();
        wait_for_stdout(&mut rx, "first").await;

        supervisor
            .start(sh("echo second; sleep 30"), true)
            .await
            .unwrap();

        let (before_end, _) = collect(&mut rx).await;
        assert!(!before_end.contains("second"));
        wait_for_stdout(&mut rx, "second").await;

        supervisor.stop(false, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_and_input_when_not_started() {
        let supervisor = ProcessSupervisor::new(64);
        let status = supervisor.stop(true, WAIT).await.unwrap();
        assert_eq!(status.state, RunState::NotStarted);
        assert!(matches!(
            supervisor.send_input(b"x").await,
            Err(WrapperError::NotRunning)
        ));
        assert!(matches!(
            supervisor.start(LaunchSpec::default(), false).await,
            Err(WrapperError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_config_files_are_written_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(64);
        let mut rx = supervisor.subscribe();

        supervisor
            .start(
                LaunchSpec {
                    command: "cat".to_string(),
                    args: vec!["conf/server.properties".to_string()],
                    working_dir: Some(dir.path().to_path_buf()),
                    files: vec![(
                        PathBuf::from("conf/server.properties"),
                        "motd=hello\n".to_string(),
                    )],
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        let (stdout, _) = collect(&mut rx).await;
        assert_eq!(stdout, "motd=hello\n");
        assert!(dir.path().join("conf/server.properties").exists());
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_the_same_output() {
        let supervisor = ProcessSupervisor::new(64);
        let mut a = supervisor.subscribe();
        let mut b = supervisor.subscribe();

        supervisor.start(sh("echo fan-out"), false).await.unwrap();

        assert_eq!(collect(&mut a).await.0, "fan-out\n");
        assert_eq!(collect(&mut b).await.0, "fan-out\n");
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest_chunks() {
        let supervisor = ProcessSupervisor::new(2);
        let mut slow = supervisor.subscribe();

        supervisor
            .start(
                sh("i=0; while [ $i -lt 3000 ]; do echo line-$i; i=$((i+1)); done"),
                false,
            )
            .await
            .unwrap();
        supervisor.wait_for_exit(WAIT).await.unwrap();

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // The newest events, including the end marker, are still there.
        let mut saw_end = false;
        while let Ok(event) = slow.try_recv() {
            saw_end |= event == OutputEvent::End;
        }
        assert!(saw_end);
    }
}
