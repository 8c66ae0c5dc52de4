//! External program execution.
//!
//! PROGRAM tasks run through the [`Commander`] trait so tests can substitute
//! a scripted fake for the real process spawner.

use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of one program invocation.
///
/// `code` is the process exit code; spawn failures and cancellations are
/// reported as −1 with `error` set. A non-zero exit keeps its real code.
#[derive(Debug, Clone)]
pub struct ProgramOutcome {
    pub code: i32,
    /// Combined stdout and stderr
    pub output: String,
    pub error: Option<String>,
}

impl ProgramOutcome {
    fn spawn_failure(message: String) -> Self {
        Self {
            code: -1,
            output: String::new(),
            error: Some(message),
        }
    }
}

/// Capability to run external programs with captured combined output.
pub trait Commander: Send + Sync {
    /// Run a program and capture combined stdout and stderr.
    fn combined_output(
        &self,
        token: &CancellationToken,
        command: &str,
        args: &[String],
    ) -> impl std::future::Future<Output = ProgramOutcome> + Send;

    /// Like [`Self::combined_output`], with `CURRENT_CHAIN_ID` and
    /// `CURRENT_TASK_ID` added to the child environment.
    fn combined_output_with_env(
        &self,
        token: &CancellationToken,
        command: &str,
        args: &[String],
        chain_id: i32,
        task_id: i32,
    ) -> impl std::future::Future<Output = ProgramOutcome> + Send;
}

/// Production [`Commander`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommander;

impl TokioCommander {
    async fn run(
        &self,
        token: &CancellationToken,
        command: &str,
        args: &[String],
        env: &[(&str, String)],
    ) -> ProgramOutcome {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ProgramOutcome::spawn_failure(format!("failed to launch {command}: {err}"))
            }
        };

        // Dropping the wait future kills the child via kill_on_drop.
        let waited = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return ProgramOutcome::spawn_failure(format!("{command} cancelled"));
            }
            res = child.wait_with_output() => res,
        };

        match waited {
            Ok(done) => {
                let mut combined = String::from_utf8_lossy(&done.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&done.stderr));
                let code = done.status.code().unwrap_or(-1);
                debug!(command, retcode = code, "program run");
                ProgramOutcome {
                    code,
                    output: combined,
                    error: (!done.status.success()).then(|| format!("exit status: {code}")),
                }
            }
            Err(err) => {
                ProgramOutcome::spawn_failure(format!("waiting for {command} failed: {err}"))
            }
        }
    }
}

impl Commander for TokioCommander {
    async fn combined_output(
        &self,
        token: &CancellationToken,
        command: &str,
        args: &[String],
    ) -> ProgramOutcome {
        self.run(token, command, args, &[]).await
    }

    async fn combined_output_with_env(
        &self,
        token: &CancellationToken,
        command: &str,
        args: &[String],
        chain_id: i32,
        task_id: i32,
    ) -> ProgramOutcome {
        let env = [
            ("CURRENT_CHAIN_ID", chain_id.to_string()),
            ("CURRENT_TASK_ID", task_id.to_string()),
        ];
        self.run(token, command, args, &env).await
    }
}
