//! Chain and task execution.
//!
//! A chain runs inside one database transaction: its tasks execute strictly
//! in declared order and either all commit or all roll back, subject to the
//! per-task ignore-error flag. Task outcomes are appended to the execution
//! log outside the transaction, so audit rows survive a rollback.
//!
//! Two context species are used throughout. Work (queries, programs,
//! built-ins) runs under the chain token, which the STOP signal, the chain
//! timeout and shutdown can cancel. Finalization (commit, rollback,
//! run-status closing, audit rows, self-destruct) runs without a token.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::command::Commander;
use crate::db::{Chain, ChainTask, ChainTransaction, RunState, TaskKind};
use crate::supervisor::Scheduler;

/// Derive a child token that cancels after `max(default_ms, override_ms)`
/// milliseconds. A non-positive effective timeout arms no deadline.
pub(crate) fn deadline_token(
    parent: &CancellationToken,
    default_ms: i32,
    override_ms: i32,
) -> CancellationToken {
    let timeout_ms = default_ms.max(override_ms);
    let token = parent.child_token();
    if timeout_ms > 0 {
        let armed = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = armed.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms as u64)) => armed.cancel(),
            }
        });
    }
    token
}

/// Run a PROGRAM task: one invocation per parameter entry, an empty
/// parameter list standing for a single argument-less invocation. The first
/// non-zero exit aborts the sequence and is returned; a JSON decode failure
/// aborts with −1.
pub(crate) async fn run_program_task<C>(
    commander: &C,
    token: &CancellationToken,
    chain_id: i32,
    task_id: i32,
    command: &str,
    param_values: &[String],
) -> (i32, String, Option<String>)
where
    C: Commander + ?Sized,
{
    let command = command.trim();
    if command.is_empty() {
        return (
            -1,
            String::new(),
            Some("program command cannot be empty".to_string()),
        );
    }
    let entries: Vec<&str> = if param_values.is_empty() {
        vec![""]
    } else {
        param_values.iter().map(String::as_str).collect()
    };
    let mut output = String::new();
    for entry in entries {
        let args: Vec<String> = if entry.trim().is_empty() {
            Vec::new()
        } else {
            match serde_json::from_str(entry) {
                Ok(args) => args,
                Err(err) => {
                    return (
                        -1,
                        output,
                        Some(format!("invalid argument array {entry:?}: {err}")),
                    )
                }
            }
        };
        let outcome = commander
            .combined_output_with_env(token, command, &args, chain_id, task_id)
            .await;
        output = outcome.output.trim().to_string();
        if outcome.code != 0 {
            let error = outcome
                .error
                .unwrap_or_else(|| format!("exit status: {}", outcome.code));
            return (outcome.code, output, Some(error));
        }
    }
    (0, output, None)
}

impl<C: Commander + 'static> Scheduler<C> {
    /// Execute a chain under one transaction, honoring per-task ignore-error
    /// and closing the run-status record opened at admission.
    ///
    /// A failed transaction start leaves the record open on purpose; the
    /// dangling opener is repaired by the next crash-recovery pass.
    pub async fn execute_chain(&self, token: &CancellationToken, chain: &Chain, run_id: i64) {
        let token = deadline_token(token, self.config.chain_timeout_ms, chain.timeout_ms);

        let (mut tx, txid) = match self.db.start_transaction(&token, chain.chain_id).await {
            Ok(started) => started,
            Err(err) => {
                error!(chain = chain.config_id, error = %err, "cannot start the chain transaction");
                return;
            }
        };

        let mut tasks = match self.db.get_chain_elements(&token, &mut tx, chain.chain_id).await {
            Ok(tasks) => tasks,
            Err(_) => {
                self.db.rollback_transaction(tx).await;
                return;
            }
        };

        for task in &mut tasks {
            task.chain_id = chain.chain_id;
            task.config_id = chain.config_id;
            task.txid = txid;
            info!(chain = chain.config_id, task = task.task_id, txid, "starting task");
            let ret_code = self.execute_task(&token, &mut tx, task).await;
            if ret_code != 0 {
                if !task.ignore_error {
                    error!(
                        chain = chain.config_id,
                        task = task.task_id,
                        retcode = ret_code,
                        "chain failed"
                    );
                    self.db.rollback_transaction(tx).await;
                    self.db
                        .close_chain_run_status(chain, run_id, RunState::ChainFailed)
                        .await;
                    return;
                }
                info!(chain = chain.config_id, task = task.task_id, "ignoring task failure");
            }
        }

        self.db.commit_transaction(tx).await;
        info!(chain = chain.config_id, txid, "chain executed successfully");
        self.db
            .close_chain_run_status(chain, run_id, RunState::ChainDone)
            .await;
        if chain.self_destruct {
            self.db.delete_chain_config(chain.config_id).await;
        }
    }

    /// Execute one chain element and append its outcome to the execution
    /// log. Returns the exit code: 0 success, −1 failure, −2 program tasks
    /// disabled, or the program's own non-zero exit.
    pub(crate) async fn execute_task(
        &self,
        token: &CancellationToken,
        tx: &mut ChainTransaction,
        task: &mut ChainTask,
    ) -> i32 {
        let param_values = match self.db.get_chain_param_values(token, tx, task).await {
            Ok(values) => values,
            Err(_) => return -1,
        };

        let token = deadline_token(token, self.config.task_timeout_ms, task.timeout_ms);
        task.started_at = Some(Utc::now());
        let clock = Instant::now();

        let (mut ret_code, mut output, error) = match task.kind {
            TaskKind::Sql => match self
                .db
                .execute_sql_task(&token, tx, task, &param_values)
                .await
            {
                Ok(out) => (0, out, None),
                Err(err) => (0, String::new(), Some(err.to_string())),
            },
            TaskKind::Program => {
                if self.config.no_program_tasks {
                    info!(task = task.task_id, "program task execution disabled, skipping");
                    (-2, String::new(), None)
                } else {
                    run_program_task(
                        self.commander.as_ref(),
                        &token,
                        task.chain_id,
                        task.task_id,
                        &task.script,
                        &param_values,
                    )
                    .await
                }
            }
            TaskKind::Builtin => match self
                .builtins
                .execute(&token, &task.script, &param_values)
                .await
            {
                Ok(out) => (0, out, None),
                Err(err) => (0, String::new(), Some(err.to_string())),
            },
        };

        task.duration_us = clock.elapsed().as_micros() as i64;

        if let Some(err) = error {
            if ret_code == 0 {
                ret_code = -1;
            }
            output = if output.is_empty() {
                err.clone()
            } else {
                format!("{output}\n{err}")
            };
            error!(task = task.task_id, error = %err, "task execution failed");
        } else {
            info!(
                task = task.task_id,
                duration_us = task.duration_us,
                "task executed successfully"
            );
        }

        self.db.log_chain_element_execution(task, ret_code, &output).await;
        ret_code
    }
}
