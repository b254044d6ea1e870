/// Run driver: triggers the external computation and exports its result.
///
/// The engine only knows the `RunDriver` trait. `CommandDriver` implements it by
/// running operator-configured commands (e.g. a UI automation script), each in its
/// own process group so a hung command can be killed along with its children.
use crate::config::HooksConfig;
use crate::orchestrator::RunInput;
use crate::signals::ShutdownFlag;
use crate::wait::WaitOutcome;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// How often a running hook is checked for exit, timeout and cancellation.
const HOOK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Collaborator that drives the external application.
pub trait RunDriver {
    /// Kick off the computation for `run`. Called after the detector baseline.
    fn start_computation(&mut self, run: &RunInput) -> Result<(), HookError>;

    /// Save whatever result exists. Called whether or not the wait finished.
    fn export_result(&mut self, run: &RunInput, outcome: &WaitOutcome) -> Result<(), HookError>;
}

/// Errors produced by hook commands.
#[derive(Debug)]
pub enum HookError {
    /// Failed to spawn the hook process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The hook exited unsuccessfully (None if killed by signal).
    Failed { command: String, code: Option<i32> },
    /// The hook ran past its timeout and was killed.
    TimedOut { command: String, timeout: Duration },
    /// Shutdown was requested while the hook ran; it was killed.
    Cancelled { command: String },
    /// Failed to poll the hook process.
    Io {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookError::Spawn { command, source } => {
                write!(f, "failed to spawn hook '{}': {}", command, source)
            }
            HookError::Failed { command, code } => match code {
                Some(c) => write!(f, "hook '{}' exited with status {}", command, c),
                None => write!(f, "hook '{}' was killed by a signal", command),
            },
            HookError::TimedOut { command, timeout } => write!(
                f,
                "hook '{}' timed out after {}s",
                command,
                timeout.as_secs()
            ),
            HookError::Cancelled { command } => {
                write!(f, "hook '{}' cancelled by shutdown", command)
            }
            HookError::Io { command, source } => {
                write!(f, "I/O error while running hook '{}': {}", command, source)
            }
        }
    }
}

impl std::error::Error for HookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HookError::Spawn { source, .. } => Some(source),
            HookError::Io { source, .. } => Some(source),
            HookError::Failed { .. } | HookError::TimedOut { .. } | HookError::Cancelled { .. } => {
                None
            }
        }
    }
}

/// Replace `{name}` placeholders in every argument.
fn build_args(args: &[String], vars: &[(&str, String)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Run `argv` to completion, killing its process group on timeout or shutdown.
pub fn run_hook(
    argv: &[String],
    timeout: Duration,
    shutdown: &ShutdownFlag,
) -> Result<(), HookError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let command = argv.join(" ");

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0); // New process group for clean kill
    }

    tracing::info!(command = %command, "running hook");
    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| HookError::Spawn {
        command: command.clone(),
        source: e,
    })?;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(
                    command = %command,
                    exit_code = ?status.code(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "hook finished"
                );
                return if status.success() {
                    Ok(())
                } else {
                    Err(HookError::Failed {
                        command,
                        code: status.code(),
                    })
                };
            }
            Ok(None) => {}
            Err(e) => {
                kill_group(&mut child);
                return Err(HookError::Io { command, source: e });
            }
        }

        if started.elapsed() >= timeout {
            kill_group(&mut child);
            return Err(HookError::TimedOut { command, timeout });
        }
        if shutdown.is_requested() {
            kill_group(&mut child);
            return Err(HookError::Cancelled { command });
        }
        std::thread::sleep(HOOK_POLL_INTERVAL);
    }
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            tracing::warn!(error = %e, pid = child.id(), "killpg failed, killing child only");
            let _ = child.kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Driver that runs the `[hooks]` commands from the config.
pub struct CommandDriver {
    config: HooksConfig,
    shutdown: ShutdownFlag,
}

impl CommandDriver {
    pub fn new(config: HooksConfig, shutdown: ShutdownFlag) -> Self {
        Self { config, shutdown }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

impl RunDriver for CommandDriver {
    fn start_computation(&mut self, run: &RunInput) -> Result<(), HookError> {
        if self.config.start.is_empty() {
            tracing::debug!("no start hook configured, expecting the run to be started externally");
            return Ok(());
        }
        let argv = build_args(&self.config.start, &run.vars());
        run_hook(&argv, self.timeout(), &self.shutdown)
    }

    fn export_result(&mut self, run: &RunInput, outcome: &WaitOutcome) -> Result<(), HookError> {
        if self.config.export.is_empty() {
            return Ok(());
        }
        let mut vars = run.vars();
        vars.push(("finished", outcome.finished.to_string()));
        vars.push((
            "method",
            outcome
                .method
                .map(|m| m.to_string())
                .unwrap_or_else(|| "none".to_string()),
        ));
        let argv = build_args(&self.config.export, &vars);
        run_hook(&argv, self.timeout(), &self.shutdown)
    }
}
