//! Child process management.
//!
//! Every task runs in its own process group so that shutdown reaches the
//! whole tree a shell script may have spawned. Stopping is cooperative:
//! SIGINT first, a grace period, then SIGKILL. The manager gates spawns:
//! once stopped, nothing new starts.

use std::{
    io::Write,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::join_all;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tracing::debug;
use turbopath::AbsoluteSystemPath;
use turborepo_env::EnvironmentVariableMap;

/// What to launch: a shell invocation of a package script.
#[derive(Debug, Clone)]
pub struct Command {
    pub script: String,
    pub cwd: String,
    pub env: EnvironmentVariableMap,
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// The child went away because we told it to.
    Killed,
    Failed,
}

#[derive(Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerState>>,
}

struct ProcessManagerState {
    is_closing: bool,
    children: Vec<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerState {
                is_closing: false,
                children: Vec::new(),
            })),
        }
    }

    /// Spawns a child unless the manager has been stopped. `None` means
    /// shutting down.
    pub fn spawn(
        &self,
        command: &Command,
        stop_timeout: Duration,
    ) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("process manager mutex poisoned");
        if state.is_closing {
            return None;
        }
        let child = Child::spawn(command, stop_timeout);
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops every running child and refuses new spawns.
    pub async fn stop(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager mutex poisoned");
            state.is_closing = true;
            state.children.clone()
        };
        join_all(children.into_iter().map(|child| async move {
            child.stop().await;
        }))
        .await;
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

enum ChildCommand {
    Stop,
}

/// Handle on one spawned task process. Cheap to clone; all clones observe
/// the same exit.
#[derive(Clone)]
pub struct Child {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ChildExit>>,
    command_tx: mpsc::Sender<ChildCommand>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
}

impl Child {
    fn spawn(command: &Command, stop_timeout: Duration) -> std::io::Result<Child> {
        let mut cmd = shell_command(&command.script);
        cmd.current_dir(&command.cwd)
            .env_clear()
            .envs(command.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            // New process group so signals reach the whole tree.
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.kill_on_drop(true).spawn()?;
        let pid = child.id();
        let stdout = Arc::new(Mutex::new(child.stdout.take()));
        let stderr = Arc::new(Mutex::new(child.stderr.take()));

        let (exit_tx, exit_rx) = watch::channel(None);
        let (command_tx, mut command_rx) = mpsc::channel(2);

        tokio::spawn(async move {
            let exit = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => ChildExit::Finished(status.code()),
                            Err(_) => ChildExit::Failed,
                        };
                    }
                    Some(request) = command_rx.recv() => {
                        match request {
                            ChildCommand::Stop => {
                                send_interrupt(pid);
                                tokio::select! {
                                    status = child.wait() => {
                                        debug!("child exited after interrupt: {status:?}");
                                        break ChildExit::Killed;
                                    }
                                    _ = tokio::time::sleep(stop_timeout) => {
                                        let _ = child.kill().await;
                                        break ChildExit::Killed;
                                    }
                                }
                            }
                        }
                    }
                }
            };
            exit_tx.send(Some(exit)).ok();
        });

        Ok(Child {
            pid,
            exit: exit_rx,
            command_tx,
            stdout,
            stderr,
        })
    }

    /// Waits for the child to exit, however that happens.
    pub async fn wait(&self) -> Option<ChildExit> {
        let mut exit = self.exit.clone();
        loop {
            if let Some(exit) = *exit.borrow() {
                return Some(exit);
            }
            if exit.changed().await.is_err() {
                return *exit.borrow();
            }
        }
    }

    /// Interrupt, grace period, kill. Resolves when the child is gone.
    pub async fn stop(&self) -> Option<ChildExit> {
        // An exited child has no receiver; that's fine.
        let _ = self.command_tx.send(ChildCommand::Stop).await;
        self.wait().await
    }

    /// Copies the child's stdout and stderr, line by line, into `writer`
    /// until both streams close. Lines from the two streams interleave at
    /// line granularity.
    pub async fn wait_with_piped_outputs<W: Write>(
        &self,
        writer: &mut W,
    ) -> std::io::Result<Option<ChildExit>> {
        let stdout = self.stdout.lock().expect("stdout mutex poisoned").take();
        let stderr = self.stderr.lock().expect("stderr mutex poisoned").take();

        let mut stdout_lines = stdout.map(|out| BufReader::new(out).lines());
        let mut stderr_lines = stderr.map(|err| BufReader::new(err).lines());

        loop {
            let next_stdout = async {
                match &mut stdout_lines {
                    Some(lines) => lines.next_line().await,
                    None => std::future::pending().await,
                }
            };
            let next_stderr = async {
                match &mut stderr_lines {
                    Some(lines) => lines.next_line().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                line = next_stdout => match line? {
                    Some(line) => writeln!(writer, "{line}")?,
                    None => stdout_lines = None,
                },
                line = next_stderr => match line? {
                    Some(line) => writeln!(writer, "{line}")?,
                    None => stderr_lines = None,
                },
            }
            if stdout_lines.is_none() && stderr_lines.is_none() {
                break;
            }
        }

        Ok(self.wait().await)
    }
}

fn shell_command(script: &str) -> tokio::process::Command {
    #[cfg(windows)]
    {
        let mut cmd = tokio::process::Command::new("cmd.exe");
        cmd.arg("/C").arg(script);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

#[cfg(unix)]
fn send_interrupt(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            // Negative pid targets the process group.
            libc::kill(-(pid as i32), libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: Option<u32>) {
    // No SIGINT equivalent; the grace period expires and the child is
    // killed.
}

#[cfg(all(test, unix))]
mod test {
    use super::*;

    fn command(script: &str) -> Command {
        Command {
            script: script.to_string(),
            cwd: std::env::temp_dir().to_string_lossy().into_owned(),
            env: EnvironmentVariableMap::infer(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_observed() {
        let manager = ProcessManager::new();
        let child = manager
            .spawn(&command("exit 3"), Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(3))));
    }

    #[tokio::test]
    async fn test_output_captured_in_order() {
        let manager = ProcessManager::new();
        let child = manager
            .spawn(&command("echo one; echo two"), Duration::from_millis(100))
            .unwrap()
            .unwrap();
        let mut out = Vec::new();
        let exit = child.wait_with_piped_outputs(&mut out).await.unwrap();
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
        assert_eq!(String::from_utf8(out).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_running_child() {
        let manager = ProcessManager::new();
        let child = manager
            .spawn(&command("sleep 30"), Duration::from_millis(200))
            .unwrap()
            .unwrap();
        let start = std::time::Instant::now();
        let exit = child.stop().await;
        assert_eq!(exit, Some(ChildExit::Killed));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_manager_refuses_spawns_after_stop() {
        let manager = ProcessManager::new();
        manager.stop().await;
        assert!(manager
            .spawn(&command("echo nope"), Duration::from_millis(100))
            .is_none());
    }
}
